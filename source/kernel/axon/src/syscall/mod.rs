// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SysResult, encode_result
//! DEPENDS_ON: env, ipc, mm, syscall::api
//! INVARIANTS: Closed call enumeration; decode/check/execute discipline; one signed result word
//! per call, negative words drawn only from axon_abi::ErrorCode

pub mod api;

use core::fmt;

use axon_abi::{ErrorCode, Syscall};

use crate::env::EnvError;
use crate::ipc::IpcError;
use crate::mm::RegionError;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers 1 through 6.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }

    pub fn raw(&self) -> &[usize; 6] {
        &self.regs
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Argument failed decoding.
    InvalidArgs,
    /// Registry lookup or allocation failed.
    Env(EnvError),
    /// Region engine rejected the request.
    Region(RegionError),
    /// Rendezvous failed.
    Ipc(IpcError),
    /// Caller was destroyed and must not resume; nothing is written back.
    EnvExit,
}

impl From<EnvError> for Error {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<RegionError> for Error {
    fn from(value: RegionError) -> Self {
        Self::Region(value)
    }
}

impl From<IpcError> for Error {
    fn from(value: IpcError) -> Self {
        Self::Ipc(value)
    }
}

impl Error {
    /// Wire code for this error; `None` for outcomes that write no result.
    pub fn code(self) -> Option<ErrorCode> {
        Some(match self {
            Error::InvalidSyscall => ErrorCode::NoSuchSyscall,
            Error::InvalidArgs => ErrorCode::InvalidArgument,
            Error::Env(err) => env_code(err),
            Error::Region(err) => region_code(err),
            Error::Ipc(IpcError::NotReceiving) => ErrorCode::IpcNotReceiving,
            Error::Ipc(IpcError::InvalidArgs) => ErrorCode::InvalidArgument,
            Error::Ipc(IpcError::Env(err)) => env_code(err),
            Error::Ipc(IpcError::Region(err)) => region_code(err),
            Error::EnvExit => return None,
        })
    }
}

fn env_code(err: EnvError) -> ErrorCode {
    match err {
        EnvError::BadEnvironment => ErrorCode::BadEnvironment,
        EnvError::NoFreeEnvironment => ErrorCode::NoFreeEnvironment,
    }
}

fn region_code(err: RegionError) -> ErrorCode {
    match err {
        RegionError::NoMemory | RegionError::NotDevice => ErrorCode::NoMemory,
        RegionError::OutOfRange
        | RegionError::BadPermission
        | RegionError::NotMapped
        | RegionError::PermissionDenied
        | RegionError::Occupied
        | RegionError::Fault => ErrorCode::InvalidArgument,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Maps a handler outcome to the result word, or `None` when nothing is written back.
pub fn encode_result(result: &SysResult<usize>) -> Option<isize> {
    match result {
        Ok(value) => Some(*value as isize),
        Err(err) => err.code().map(ErrorCode::as_word),
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; Syscall::COUNT],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; Syscall::COUNT] }
    }

    /// Registers a handler.
    pub fn register(&mut self, call: Syscall, handler: Handler) {
        self.handlers[call.number()] = Some(handler);
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: usize, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
