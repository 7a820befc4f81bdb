// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel object tying registry, region engine, dispatcher and machine together
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (new/create_env/run/syscall/trap_syscall/page_fault/schedule), Machine,
//!             FaultOutcome
//! DEPENDS_ON: env, mm, ipc, syscall, sched::Scheduler, hal::{PhysMemory, Console}
//! INVARIANTS: Exactly one syscall body runs at a time (callers hold `&mut Kernel`, shared use
//!             goes through sync::KernelLock); a destroyed caller never gets a result written

extern crate alloc;

use alloc::boxed::Box;

use axon_abi::{EnvId, EnvStatus, Syscall};
use static_assertions::{assert_impl_all, assert_not_impl_any};

use crate::config::{ConfigError, KernelConfig};
use crate::diag;
use crate::env::{self, Env, EnvError, EnvIndex, EnvTable, EnvType};
use crate::hal::{Console, PhysMemory};
use crate::mm::{Pte, RegionEngine};
use crate::sched::{RoundRobin, Scheduler};
use crate::syscall::api::{self, Context};
use crate::syscall::{encode_result, Error, SysResult, SyscallTable};
use crate::types::{PageRange, VirtAddr};

/// Hardware seams the kernel runs on.
pub struct Machine {
    memory: Box<dyn PhysMemory + Send>,
    console: Box<dyn Console + Send>,
    scheduler: Box<dyn Scheduler + Send>,
}

impl Machine {
    /// Machine with round-robin scheduling.
    pub fn new(memory: impl PhysMemory + Send + 'static, console: impl Console + Send + 'static) -> Self {
        Self { memory: Box::new(memory), console: Box::new(console), scheduler: Box::new(RoundRobin) }
    }

    pub fn with_scheduler(mut self, scheduler: impl Scheduler + Send + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }
}

/// Outcome of a user page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A lazy page was materialised; the faulting access can be retried.
    Resolved,
    /// Control was redirected to the environment's fault upcall.
    Upcall(VirtAddr),
    /// No upcall was registered and the environment was destroyed.
    Destroyed,
}

/// The syscall core.
pub struct Kernel {
    config: KernelConfig,
    envs: EnvTable,
    engine: RegionEngine,
    machine: Machine,
    table: SyscallTable,
}

assert_impl_all!(Kernel: Send);
assert_not_impl_any!(Kernel: Sync);

impl Kernel {
    /// Validates `config`, installs the kernel log and the syscall table.
    pub fn new(config: KernelConfig, machine: Machine) -> Result<Self, ConfigError> {
        config.validate()?;
        diag::log::init(config.log_level);
        let mut table = SyscallTable::new();
        api::install_handlers(&mut table);
        log::info!(target: "boot", "axon: {} env slots", config.max_envs);
        Ok(Self { config, envs: EnvTable::new(config.max_envs), engine: RegionEngine::new(), machine, table })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Creates a runnable environment with an empty address space.
    pub fn create_env(&mut self, env_type: EnvType, parent: Option<EnvId>) -> Result<EnvId, EnvError> {
        let index = self.envs.allocate(parent, env_type, EnvStatus::Runnable)?;
        let id = self.envs.get(index).map(Env::id).ok_or(EnvError::BadEnvironment)?;
        if self.config.trace_envs {
            log::info!(target: "env", "[{}] new env {}", parent.unwrap_or(EnvId::SELF), id);
        }
        Ok(id)
    }

    /// Makes `id` the current environment. It must be runnable.
    pub fn run(&mut self, id: EnvId) -> Result<(), EnvError> {
        let index = self.envs.lookup(id).ok_or(EnvError::BadEnvironment)?;
        if !self.envs.get(index).map(Env::is_runnable).unwrap_or(false) {
            return Err(EnvError::BadEnvironment);
        }
        self.envs.set_current(Some(index));
        Ok(())
    }

    pub fn current(&self) -> Option<EnvId> {
        self.envs.current().and_then(|i| self.envs.get(i)).map(Env::id)
    }

    /// The live environment named exactly by `id`.
    pub fn env(&self, id: EnvId) -> Option<&Env> {
        self.envs.lookup(id).and_then(|i| self.envs.get(i))
    }

    pub fn live_envs(&self) -> usize {
        self.envs.live()
    }

    /// Loads a call into the current environment's registers and traps.
    ///
    /// Returns the word written back, or `None` when there is no current environment or the
    /// call destroyed its caller.
    pub fn syscall(&mut self, number: usize, args: [usize; 6]) -> Option<isize> {
        let index = self.envs.current()?;
        self.envs.get_mut(index)?.frame_mut().load_syscall(number, args);
        self.trap_syscall()
    }

    /// Services the call saved in the current environment's trap frame.
    pub fn trap_syscall(&mut self) -> Option<isize> {
        let caller = self.envs.current()?;
        let (id, number, args) = {
            let env = self.envs.get(caller)?;
            (env.id(), env.frame().syscall_number(), env.frame().syscall_args())
        };

        let mut ctx = Context::new(
            &mut self.envs,
            &mut self.engine,
            &mut *self.machine.memory,
            &mut *self.machine.console,
            &self.config,
            caller,
        );
        let result = self.table.dispatch(number, &mut ctx, &args);
        let need_resched = ctx.need_resched;
        let name = Syscall::from_raw(number).map_or("unknown", Syscall::name);
        if self.config.trace_syscalls {
            log::trace!(target: "sys", "[{}] {}({:x?}) -> {:?}", id, name, args.raw(), result);
        }
        if let Err(err) = result {
            if err.code().is_some() {
                log::debug!(target: "sys", "[{}] {} rejected: {}", id, name, err);
            }
        }

        let word = encode_result(&result);
        if let (Some(word), Some(env)) = (word, self.envs.get_mut(caller)) {
            env.frame_mut().set_result(word);
        }

        let dying = self.envs.get(caller).map(|env| env.status() == EnvStatus::Dying).unwrap_or(false);
        if dying {
            env::free_env(
                &mut self.envs,
                &mut self.engine,
                &mut *self.machine.memory,
                caller,
                Some(id),
                self.config.trace_envs,
            );
        }

        let runnable = self.envs.get(caller).map(Env::is_runnable).unwrap_or(false);
        if need_resched || !runnable {
            self.schedule_from(Some(caller));
        }
        word
    }

    /// Picks the next environment after the current one.
    pub fn schedule(&mut self) -> Option<EnvId> {
        self.schedule_from(self.envs.current())
    }

    fn schedule_from(&mut self, origin: Option<EnvIndex>) -> Option<EnvId> {
        let next = self.machine.scheduler.reschedule(&self.envs, origin);
        self.envs.set_current(next);
        self.current()
    }

    /// Handles a user fault at `va` in the current environment.
    pub fn page_fault(&mut self, va: usize, write: bool) -> Option<FaultOutcome> {
        let index = self.envs.current()?;
        let env = self.envs.get_mut(index)?;
        if let Some(at) = VirtAddr::new(va) {
            if self.engine.resolve_fault(&mut *self.machine.memory, env.space_mut(), at, write).is_ok() {
                return Some(FaultOutcome::Resolved);
            }
        }
        if let Some(entry) = env.pgfault_upcall() {
            let frame = env.frame_mut();
            frame.regs[1] = va;
            frame.pc = entry.raw();
            return Some(FaultOutcome::Upcall(entry));
        }

        let id = env.id();
        log::warn!(target: "env", "[{}] user fault va {:#x} write={}", id, va, write);
        env::free_env(&mut self.envs, &mut self.engine, &mut *self.machine.memory, index, Some(id), self.config.trace_envs);
        self.schedule_from(Some(index));
        Some(FaultOutcome::Destroyed)
    }

    /// Reads `buf.len()` bytes of `id`'s memory at `va`.
    pub fn read_user(&mut self, id: EnvId, va: usize, buf: &mut [u8]) -> SysResult<()> {
        let index = self.envs.lookup(id).ok_or(EnvError::BadEnvironment)?;
        let env = self.envs.get_mut(index).ok_or(EnvError::BadEnvironment)?;
        self.engine.copy_from_user(&mut *self.machine.memory, env.space_mut(), va, buf)?;
        Ok(())
    }

    /// Writes `bytes` into `id`'s memory at `va`; the range must be user-writable.
    pub fn write_user(&mut self, id: EnvId, va: usize, bytes: &[u8]) -> SysResult<()> {
        let index = self.envs.lookup(id).ok_or(EnvError::BadEnvironment)?;
        let env = self.envs.get_mut(index).ok_or(EnvError::BadEnvironment)?;
        self.engine.copy_to_user(&mut *self.machine.memory, env.space_mut(), va, bytes).map_err(Error::from)
    }

    /// Page table entry for `va` in `id`'s space.
    pub fn lookup(&self, id: EnvId, va: usize) -> Option<Pte> {
        self.env(id)?.space().lookup(VirtAddr::new(va)?)
    }

    /// Reference count of the page mapped at `va` in `id`'s space; zero for a hole.
    pub fn page_refs(&self, id: EnvId, va: usize) -> Option<u32> {
        let env = self.env(id)?;
        let range = PageRange::one(VirtAddr::new(va)?);
        Some(self.engine.max_reference_count(env.space(), &range))
    }

    /// Frames currently holding user pages.
    pub fn live_frames(&self) -> usize {
        self.engine.live_frames()
    }

    pub fn memory(&self) -> &dyn PhysMemory {
        &*self.machine.memory
    }
}
