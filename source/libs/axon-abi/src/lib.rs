// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions exposed to user protection domains
//! OWNERS: @runtime
//! PUBLIC API: Syscall, ErrorCode, EnvId, EnvStatus, Prot, layout::*, ipc::{Gate, ipc_send, ipc_recv}
//! DEPENDS_ON: no_std, bitflags
//! INVARIANTS: Syscall numbers and error codes are stable; envid 0 always names the caller;
//!             every negative result word is an [`ErrorCode`]

pub mod ipc;

use core::fmt;

/// Address-space layout shared by the kernel and user domains.
pub mod layout {
    /// Size of a page in bytes.
    pub const PAGE_SIZE: usize = 4096;
    /// First address that is never handed to user domains.
    ///
    /// Everything at or above this value is kernel-only and is never accepted as a
    /// user capability; several calls use such addresses to mean "no page".
    pub const MAX_USER_ADDRESS: usize = 0x8000_0000;

    /// Returns the offset of `addr` within its page.
    #[inline]
    pub const fn page_offset(addr: usize) -> usize {
        addr & (PAGE_SIZE - 1)
    }

    /// Returns true if `addr` sits on a page boundary.
    #[inline]
    pub const fn is_page_aligned(addr: usize) -> bool {
        page_offset(addr) == 0
    }

    /// Rounds `addr` down to its page boundary.
    #[inline]
    pub const fn round_down(addr: usize) -> usize {
        addr & !(PAGE_SIZE - 1)
    }

    /// Rounds `addr` up to the next page boundary, `None` on overflow.
    #[inline]
    pub const fn round_up(addr: usize) -> Option<usize> {
        match addr.checked_add(PAGE_SIZE - 1) {
            Some(v) => Some(v & !(PAGE_SIZE - 1)),
            None => None,
        }
    }
}

/// Public syscall numbers.
///
/// The discriminants are the ABI: reordering or renumbering is a breaking change.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Syscall {
    /// Write bytes to the console.
    Cputs = 0,
    /// Non-blocking read of one console character.
    Cgetc = 1,
    /// Returns the caller's envid.
    GetEnvId = 2,
    /// Destroys an environment.
    EnvDestroy = 3,
    /// Allocates zero- or one-filled pages.
    AllocRegion = 4,
    /// Shares pages from one address space into another.
    MapRegion = 5,
    /// Maps a device window into a driver environment.
    MapPhysicalRegion = 6,
    /// Removes mappings.
    UnmapRegion = 7,
    /// Compares how widely two ranges are shared.
    RegionRefs = 8,
    /// Creates a suspended child environment.
    Exofork = 9,
    /// Sets RUNNABLE or NOT_RUNNABLE.
    EnvSetStatus = 10,
    /// Installs the page-fault upcall entry point.
    EnvSetPgfaultUpcall = 11,
    /// Gives up the CPU.
    Yield = 12,
    /// Attempts a non-blocking IPC send.
    IpcTrySend = 13,
    /// Blocks until an IPC send arrives.
    IpcRecv = 14,
}

impl Syscall {
    /// Number of defined syscalls; every number at or above this is unknown.
    pub const COUNT: usize = 15;

    /// Decodes a raw call number.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        Some(match raw {
            0 => Self::Cputs,
            1 => Self::Cgetc,
            2 => Self::GetEnvId,
            3 => Self::EnvDestroy,
            4 => Self::AllocRegion,
            5 => Self::MapRegion,
            6 => Self::MapPhysicalRegion,
            7 => Self::UnmapRegion,
            8 => Self::RegionRefs,
            9 => Self::Exofork,
            10 => Self::EnvSetStatus,
            11 => Self::EnvSetPgfaultUpcall,
            12 => Self::Yield,
            13 => Self::IpcTrySend,
            14 => Self::IpcRecv,
            _ => return None,
        })
    }

    /// Returns the raw call number.
    #[inline]
    pub const fn number(self) -> usize {
        self as usize
    }

    /// Short name used in traces.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cputs => "cputs",
            Self::Cgetc => "cgetc",
            Self::GetEnvId => "getenvid",
            Self::EnvDestroy => "env_destroy",
            Self::AllocRegion => "alloc_region",
            Self::MapRegion => "map_region",
            Self::MapPhysicalRegion => "map_physical_region",
            Self::UnmapRegion => "unmap_region",
            Self::RegionRefs => "region_refs",
            Self::Exofork => "exofork",
            Self::EnvSetStatus => "env_set_status",
            Self::EnvSetPgfaultUpcall => "env_set_pgfault_upcall",
            Self::Yield => "yield",
            Self::IpcTrySend => "ipc_try_send",
            Self::IpcRecv => "ipc_recv",
        }
    }
}

/// Error codes carried as negative result words.
#[repr(isize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Unknown, unauthorised or stale envid.
    BadEnvironment = 2,
    /// Misalignment, out-of-range address or disallowed permission combination.
    InvalidArgument = 3,
    /// Page or page-table exhaustion.
    NoMemory = 4,
    /// The environment registry is full.
    NoFreeEnvironment = 5,
    /// IPC target is not blocked in `ipc_recv`.
    IpcNotReceiving = 6,
    /// Call number outside the syscall table.
    NoSuchSyscall = 7,
}

impl ErrorCode {
    /// Returns the negative result word for this error.
    #[inline]
    pub const fn as_word(self) -> isize {
        -(self as isize)
    }

    /// Decodes a negative result word.
    pub const fn from_word(word: isize) -> Option<Self> {
        Some(match word {
            -2 => Self::BadEnvironment,
            -3 => Self::InvalidArgument,
            -4 => Self::NoMemory,
            -5 => Self::NoFreeEnvironment,
            -6 => Self::IpcNotReceiving,
            -7 => Self::NoSuchSyscall,
            _ => return None,
        })
    }

    /// Splits a result word into its success value or error code.
    ///
    /// Negative words outside the taxonomy are reported as `InvalidArgument`.
    pub const fn decode(word: isize) -> Result<usize, ErrorCode> {
        if word >= 0 {
            return Ok(word as usize);
        }
        match Self::from_word(word) {
            Some(code) => Err(code),
            None => Err(Self::InvalidArgument),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BadEnvironment => "bad environment",
            Self::InvalidArgument => "invalid argument",
            Self::NoMemory => "out of memory",
            Self::NoFreeEnvironment => "out of environments",
            Self::IpcNotReceiving => "env is not recving",
            Self::NoSuchSyscall => "invalid syscall number",
        };
        f.write_str(text)
    }
}

/// Number of low envid bits that select the registry slot.
pub const ENV_INDEX_BITS: u32 = 10;
/// Registry capacity addressable by an envid.
pub const MAX_ENVS: usize = 1 << ENV_INDEX_BITS;
/// Largest generation value; generations stay below the sign bit of an `i32`.
pub const MAX_GENERATION: u32 = (1 << (31 - ENV_INDEX_BITS)) - 1;

/// Environment identifier: a registry slot index tagged with the slot's generation.
///
/// A live envid is always positive. `EnvId::SELF` (zero) names the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EnvId(u32);

impl EnvId {
    /// Sentinel meaning "the calling environment".
    pub const SELF: Self = Self(0);

    /// Composes an envid from a slot index and a non-zero generation.
    #[inline]
    pub const fn new(index: usize, generation: u32) -> Self {
        Self((generation << ENV_INDEX_BITS) | (index as u32 & (MAX_ENVS as u32 - 1)))
    }

    /// Reinterprets a raw syscall argument.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw encoding.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the registry slot index.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 & (MAX_ENVS as u32 - 1)) as usize
    }

    /// Returns the generation tag.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.0 >> ENV_INDEX_BITS
    }

    /// True for the caller sentinel.
    #[inline]
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Environment status as stored by the kernel and accepted by `env_set_status`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvStatus {
    /// Slot is unused.
    Free = 0,
    /// Environment is being torn down.
    Dying = 1,
    /// Environment may be scheduled.
    Runnable = 2,
    /// Environment is suspended (freshly forked or blocked in IPC).
    NotRunnable = 3,
}

impl EnvStatus {
    /// Decodes a raw status value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Free,
            1 => Self::Dying,
            2 => Self::Runnable,
            3 => Self::NotRunnable,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Permission word accepted by the region syscalls.
    ///
    /// Access bits and the region-behaviour bits are independent; the allocation
    /// flavour bits are only meaningful for `alloc_region`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        /// Executable.
        const EXEC = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Readable (implied by any mapping).
        const READ = 1 << 2;
        /// Keep the page shared when the address space is duplicated.
        const SHARE = 1 << 6;
        /// Defer physical allocation until first touch.
        const LAZY = 1 << 7;
        /// Merge access bits with an existing mapping of the same page.
        const COMBINE = 1 << 8;
        /// Fill freshly allocated pages with 0x00.
        const ALLOC_ZERO = 1 << 20;
        /// Fill freshly allocated pages with 0xFF.
        const ALLOC_ONE = 1 << 21;

        /// Read and write.
        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}
