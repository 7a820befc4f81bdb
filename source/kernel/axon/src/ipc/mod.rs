// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous one-shot IPC rendezvous
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: Mailbox, RecvState, RecvArgs, SendArgs, receive(), try_send(), IpcError
//! DEPENDS_ON: env::EnvTable, mm::RegionEngine
//! INVARIANTS: State lives in the receiver's mailbox; Idle -> Receiving -> Idle;
//!             the Receiving check and its clear happen in one step, so one send wins per receive;
//!             every error path precedes the state commit
//!
//! A transfer maps exactly one page. The size the receiver observes is the smaller of
//! what both sides asked for.

use core::fmt;

use axon_abi::layout::{is_page_aligned, MAX_USER_ADDRESS};
use axon_abi::{ipc::Delivery, EnvId, EnvStatus, Prot};

use crate::env::{EnvError, EnvIndex, EnvTable};
use crate::hal::PhysMemory;
use crate::mm::{RegionEngine, RegionError, RegionPerm, Spaces};
use crate::types::{PageRange, VirtAddr};

/// IPC failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcError {
    /// Target is not blocked in receive.
    NotReceiving,
    /// Misaligned address or size.
    InvalidArgs,
    Env(EnvError),
    Region(RegionError),
}

impl From<EnvError> for IpcError {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<RegionError> for IpcError {
    fn from(value: RegionError) -> Self {
        Self::Region(value)
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Rendezvous phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvState {
    Idle,
    /// Blocked; `dstva` is `None` when no page is wanted.
    Receiving { dstva: Option<VirtAddr>, maxsz: usize },
}

/// Receiver-side IPC record.
#[derive(Clone, Copy, Debug)]
pub struct Mailbox {
    state: RecvState,
    from: EnvId,
    value: u32,
    perm: Prot,
    size: usize,
}

impl Mailbox {
    pub const fn new() -> Self {
        Self { state: RecvState::Idle, from: EnvId::SELF, value: 0, perm: Prot::empty(), size: 0 }
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.state, RecvState::Receiving { .. })
    }

    /// Drops a pending receive; nothing can be delivered until the next one.
    pub fn cancel(&mut self) {
        self.state = RecvState::Idle;
    }

    /// What the last completed receive delivered.
    pub fn delivery(&self) -> Delivery {
        Delivery { from: self.from, value: self.value, perm: self.perm, size: self.size }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded `ipc_recv` arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvArgs {
    dstva: Option<VirtAddr>,
    maxsz: usize,
}

impl RecvArgs {
    /// A `dstva` below the ceiling must be page aligned with a non-zero, page-aligned size.
    /// Any other `dstva` declines a page and the size is ignored.
    pub fn decode(dstva: usize, maxsize: usize) -> Result<Self, IpcError> {
        if dstva >= MAX_USER_ADDRESS {
            return Ok(Self { dstva: None, maxsz: 0 });
        }
        let va = VirtAddr::page_aligned(dstva).ok_or(IpcError::InvalidArgs)?;
        if maxsize == 0 || !is_page_aligned(maxsize) {
            return Err(IpcError::InvalidArgs);
        }
        Ok(Self { dstva: Some(va), maxsz: maxsize })
    }
}

/// Decoded `ipc_try_send` arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendArgs {
    pub target: EnvId,
    pub value: u32,
    /// Offered page as raw `(srcva, size, perm)`; checked once the target is known to be receiving.
    pub page: Option<(usize, usize, u32)>,
}

impl SendArgs {
    pub fn decode(target: usize, value: usize, srcva: usize, size: usize, perm: usize) -> Self {
        let page = if srcva < MAX_USER_ADDRESS { Some((srcva, size, perm as u32)) } else { None };
        Self { target: EnvId::from_raw(target as u32), value: value as u32, page }
    }
}

/// Commits the receive for `receiver`, which stops being runnable until a send lands.
pub fn receive(envs: &mut EnvTable, receiver: EnvIndex, args: RecvArgs) -> Result<(), IpcError> {
    let env = envs.get_mut(receiver).ok_or(EnvError::BadEnvironment)?;
    env.mailbox_mut().state = RecvState::Receiving { dstva: args.dstva, maxsz: args.maxsz };
    env.set_status(EnvStatus::NotRunnable);
    env.frame_mut().set_result(0);
    log::trace!(target: "ipc", "[{}] recv dstva={:?} maxsz={:#x}", env.id(), args.dstva, args.maxsz);
    Ok(())
}

/// Delivers `args` from `sender` if the target is blocked in receive.
///
/// Returns the receiver's slot. On error the receiver is left exactly as it was.
pub fn try_send(
    envs: &mut EnvTable,
    engine: &mut RegionEngine,
    mem: &mut dyn PhysMemory,
    sender: EnvIndex,
    args: SendArgs,
) -> Result<EnvIndex, IpcError> {
    let to = envs.resolve(args.target, sender, false)?;
    let (dstva, maxsz) = match envs.get(to).map(|env| env.mailbox().state) {
        Some(RecvState::Receiving { dstva, maxsz }) => (dstva, maxsz),
        _ => return Err(IpcError::NotReceiving),
    };

    let offer = match args.page {
        Some((srcva, size, raw)) => {
            Some((VirtAddr::page_aligned(srcva).ok_or(IpcError::InvalidArgs)?, size, raw))
        }
        None => None,
    };

    let (perm, size) = match (offer, dstva) {
        (Some((srcva, size, raw)), Some(dstva)) => {
            let perm = RegionPerm::for_copy(raw)?;
            let src = PageRange::one(srcva);
            let dst = PageRange::one(dstva);
            if to == sender {
                let env = envs.get_mut(to).ok_or(EnvError::BadEnvironment)?;
                engine.copy_region(mem, Spaces::Same(env.space_mut()), &src, &dst, perm)?;
            } else {
                let (from, into) = envs.pair_mut(sender, to).ok_or(EnvError::BadEnvironment)?;
                let spaces = Spaces::Distinct { src: from.space_mut(), dst: into.space_mut() };
                engine.copy_region(mem, spaces, &src, &dst, perm)?;
            }
            (Prot::from_bits_truncate(raw), size.min(maxsz))
        }
        _ => (Prot::empty(), 0),
    };

    let from = envs.get(sender).map(|env| env.id()).ok_or(EnvError::BadEnvironment)?;
    let env = envs.get_mut(to).ok_or(EnvError::BadEnvironment)?;
    let mailbox = env.mailbox_mut();
    mailbox.state = RecvState::Idle;
    mailbox.from = from;
    mailbox.value = args.value;
    mailbox.perm = perm;
    mailbox.size = size;
    env.set_status(EnvStatus::Runnable);
    log::trace!(target: "ipc", "[{}] send {} -> {} perm={:?}", from, args.value, env.id(), perm);
    Ok(to)
}
