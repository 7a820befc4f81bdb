// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]
#![forbid(unsafe_code)]

//! CONTEXT: AXON exokernel syscall core
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, Machine, KernelConfig, EnvTable, RegionEngine, SyscallTable
//! DEPENDS_ON: axon-abi, hal::{PhysMemory, Console}, sched::Scheduler
//! INVARIANTS: User-reachable addresses stay below MAX_USER_ADDRESS; page reclamation is
//!             decided by reference count only; one delivery per receive

extern crate alloc;

pub mod config;
pub mod diag;
pub mod env;
pub mod hal;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod trap;
pub mod types;

pub use axon_abi as abi;
pub use config::{ConfigError, KernelConfig};
pub use kernel::{FaultOutcome, Kernel, Machine};
