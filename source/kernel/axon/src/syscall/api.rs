// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: env::EnvTable, mm::RegionEngine, ipc, hal::{PhysMemory, Console}
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; nothing is mutated before
//!             every check has passed; a caller that hands cputs a foreign buffer is destroyed

use axon_abi::{EnvId, EnvStatus, Syscall};

use super::{Args, Error, SysResult, SyscallTable};
use crate::config::KernelConfig;
use crate::env::{self, Env, EnvError, EnvIndex, EnvTable, EnvType};
use crate::hal::{Console, PhysMemory};
use crate::ipc::{self, RecvArgs, SendArgs};
use crate::mm::{AllocRequest, RegionEngine, RegionPerm, Spaces};
use crate::types::{PageRange, PhysAddr, VirtAddr};

/// Bytes copied per chunk by `cputs`.
const CPUTS_CHUNK: usize = 256;

// Typed decoders for seL4-style Decode→Check→Execute

#[derive(Copy, Clone)]
struct AllocArgsTyped {
    env: EnvId,
    range: PageRange,
    req: AllocRequest,
}

impl AllocArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let env = EnvId::from_raw(args.get(0) as u32);
        let range = PageRange::user(args.get(1), args.get(2)).ok_or(Error::InvalidArgs)?;
        let req = AllocRequest::decode(args.get(3) as u32)?;
        Ok(Self { env, range, req })
    }
}

#[derive(Copy, Clone)]
struct MapArgsTyped {
    src_env: EnvId,
    src: PageRange,
    dst_env: EnvId,
    dst: PageRange,
    perm: RegionPerm,
}

impl MapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let size = args.get(4);
        let src = PageRange::user(args.get(1), size).ok_or(Error::InvalidArgs)?;
        let dst = PageRange::user(args.get(3), size).ok_or(Error::InvalidArgs)?;
        Ok(Self {
            src_env: EnvId::from_raw(args.get(0) as u32),
            src,
            dst_env: EnvId::from_raw(args.get(2) as u32),
            dst,
            perm: RegionPerm::for_copy(args.get(5) as u32)?,
        })
    }
}

#[derive(Copy, Clone)]
struct PhysArgsTyped {
    pa: PhysAddr,
    range: PageRange,
    perm: RegionPerm,
}

impl PhysArgsTyped {
    /// Target environment; resolved and checked before the rest is decoded.
    #[inline]
    fn target(args: &Args) -> EnvId {
        EnvId::from_raw(args.get(1) as u32)
    }

    #[inline]
    fn check(target: &Env) -> Result<(), Error> {
        if target.env_type() != EnvType::Driver {
            return Err(EnvError::BadEnvironment.into());
        }
        Ok(())
    }

    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let pa = PhysAddr::page_aligned(args.get(0)).ok_or(Error::InvalidArgs)?;
        let range = PageRange::user(args.get(2), args.get(3)).ok_or(Error::InvalidArgs)?;
        let perm = RegionPerm::for_physical(args.get(4) as u32)?;
        Ok(Self { pa, range, perm })
    }
}

#[derive(Copy, Clone)]
struct UnmapArgsTyped {
    env: EnvId,
    range: PageRange,
}

impl UnmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let env = EnvId::from_raw(args.get(0) as u32);
        let range = PageRange::user(args.get(1), args.get(2)).ok_or(Error::InvalidArgs)?;
        Ok(Self { env, range })
    }
}

#[derive(Copy, Clone)]
struct RefsArgsTyped {
    first: Option<PageRange>,
    second: Option<PageRange>,
}

impl RefsArgsTyped {
    /// Ranges are rounded outward to page boundaries; one starting at or above the
    /// ceiling is absent.
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            first: PageRange::covering(args.get(0), args.get(1)),
            second: PageRange::covering(args.get(2), args.get(3)),
        }
    }
}

#[derive(Copy, Clone)]
struct StatusArgsTyped {
    env: EnvId,
    status: Option<EnvStatus>,
}

impl StatusArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        let raw = args.get(1);
        let status = u32::try_from(raw).ok().and_then(EnvStatus::from_raw);
        Self { env: EnvId::from_raw(args.get(0) as u32), status }
    }

    #[inline]
    fn check(&self) -> Result<EnvStatus, Error> {
        match self.status {
            Some(status @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => Ok(status),
            _ => Err(Error::InvalidArgs),
        }
    }
}

#[derive(Copy, Clone)]
struct UpcallArgsTyped {
    env: EnvId,
    entry: usize,
}

impl UpcallArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { env: EnvId::from_raw(args.get(0) as u32), entry: args.get(1) }
    }

    /// Zero clears the upcall.
    #[inline]
    fn check(&self) -> Result<Option<VirtAddr>, Error> {
        if self.entry == 0 {
            return Ok(None);
        }
        VirtAddr::new(self.entry).map(Some).ok_or(Error::InvalidArgs)
    }
}

/// Execution context shared across syscalls.
pub struct Context<'a> {
    pub envs: &'a mut EnvTable,
    pub engine: &'a mut RegionEngine,
    pub memory: &'a mut dyn PhysMemory,
    pub console: &'a mut dyn Console,
    pub config: &'a KernelConfig,
    /// Slot of the calling environment.
    pub caller: EnvIndex,
    /// Set by handlers that give up the CPU.
    pub need_resched: bool,
}

impl<'a> Context<'a> {
    /// Creates a new context for `caller`.
    pub fn new(
        envs: &'a mut EnvTable,
        engine: &'a mut RegionEngine,
        memory: &'a mut dyn PhysMemory,
        console: &'a mut dyn Console,
        config: &'a KernelConfig,
        caller: EnvIndex,
    ) -> Self {
        Self { envs, engine, memory, console, config, caller, need_resched: false }
    }

    fn caller_id(&self) -> EnvId {
        self.envs.get(self.caller).map(Env::id).unwrap_or(EnvId::SELF)
    }

    fn env_mut(&mut self, index: EnvIndex) -> Result<&mut Env, Error> {
        self.envs.get_mut(index).ok_or(Error::Env(EnvError::BadEnvironment))
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(Syscall::Cputs, sys_cputs);
    table.register(Syscall::Cgetc, sys_cgetc);
    table.register(Syscall::GetEnvId, sys_getenvid);
    table.register(Syscall::EnvDestroy, sys_env_destroy);
    table.register(Syscall::AllocRegion, sys_alloc_region);
    table.register(Syscall::MapRegion, sys_map_region);
    table.register(Syscall::MapPhysicalRegion, sys_map_physical_region);
    table.register(Syscall::UnmapRegion, sys_unmap_region);
    table.register(Syscall::RegionRefs, sys_region_refs);
    table.register(Syscall::Exofork, sys_exofork);
    table.register(Syscall::EnvSetStatus, sys_env_set_status);
    table.register(Syscall::EnvSetPgfaultUpcall, sys_env_set_pgfault_upcall);
    table.register(Syscall::Yield, sys_yield);
    table.register(Syscall::IpcTrySend, sys_ipc_try_send);
    table.register(Syscall::IpcRecv, sys_ipc_recv);
}

fn sys_cputs(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let (ptr, len) = (args.get(0), args.get(1));
    let caller = ctx.envs.get_mut(ctx.caller).ok_or(EnvError::BadEnvironment)?;
    if !caller.space().check_user_range(ptr, len, false) {
        log::debug!(target: "sys", "[{}] cputs: {:#x}+{:#x} not readable, destroying", caller.id(), ptr, len);
        caller.set_status(EnvStatus::Dying);
        return Err(Error::EnvExit);
    }
    let mut chunk = [0u8; CPUTS_CHUNK];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(CPUTS_CHUNK);
        ctx.engine.copy_from_user(ctx.memory, caller.space_mut(), ptr + done, &mut chunk[..n])?;
        ctx.console.write_bytes(&chunk[..n]);
        done += n;
    }
    Ok(0)
}

fn sys_cgetc(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.console.getc().map_or(0, usize::from))
}

fn sys_getenvid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.caller_id().as_raw() as usize)
}

fn sys_env_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = EnvId::from_raw(args.get(0) as u32);
    let index = ctx.envs.resolve(target, ctx.caller, true)?;
    let me = ctx.caller_id();
    let trace = ctx.config.trace_envs;
    if index == ctx.caller {
        if trace {
            log::info!(target: "env", "[{}] exiting gracefully", me);
        }
        ctx.env_mut(index)?.set_status(EnvStatus::Dying);
        return Err(Error::EnvExit);
    }
    if trace {
        let victim = ctx.envs.get(index).map(Env::id).unwrap_or(target);
        log::info!(target: "env", "[{}] destroying {}", me, victim);
    }
    env::free_env(ctx.envs, ctx.engine, ctx.memory, index, Some(me), trace);
    Ok(0)
}

fn sys_alloc_region(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = AllocArgsTyped::decode(args)?;
    let index = ctx.envs.resolve(typed.env, ctx.caller, true)?;
    let env = ctx.envs.get_mut(index).ok_or(EnvError::BadEnvironment)?;
    ctx.engine.allocate_region(ctx.memory, env.space_mut(), &typed.range, typed.req)?;
    Ok(0)
}

fn sys_map_region(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = MapArgsTyped::decode(args)?;
    let src = ctx.envs.resolve(typed.src_env, ctx.caller, true)?;
    let dst = ctx.envs.resolve(typed.dst_env, ctx.caller, true)?;
    if src == dst {
        let env = ctx.envs.get_mut(src).ok_or(EnvError::BadEnvironment)?;
        ctx.engine.copy_region(ctx.memory, Spaces::Same(env.space_mut()), &typed.src, &typed.dst, typed.perm)?;
    } else {
        let (from, into) = ctx.envs.pair_mut(src, dst).ok_or(EnvError::BadEnvironment)?;
        let spaces = Spaces::Distinct { src: from.space_mut(), dst: into.space_mut() };
        ctx.engine.copy_region(ctx.memory, spaces, &typed.src, &typed.dst, typed.perm)?;
    }
    Ok(0)
}

fn sys_map_physical_region(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let index = ctx.envs.resolve(PhysArgsTyped::target(args), ctx.caller, true)?;
    let env = ctx.envs.get_mut(index).ok_or(EnvError::BadEnvironment)?;
    PhysArgsTyped::check(env)?;
    let typed = PhysArgsTyped::decode(args)?;
    ctx.engine.map_physical_region(ctx.memory, env.space_mut(), &typed.range, typed.pa, typed.perm)?;
    Ok(0)
}

fn sys_unmap_region(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = UnmapArgsTyped::decode(args)?;
    let index = ctx.envs.resolve(typed.env, ctx.caller, true)?;
    let env = ctx.envs.get_mut(index).ok_or(EnvError::BadEnvironment)?;
    ctx.engine.unmap_region(ctx.memory, env.space_mut(), &typed.range);
    Ok(0)
}

fn sys_region_refs(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = RefsArgsTyped::decode(args);
    let env = ctx.envs.get(ctx.caller).ok_or(EnvError::BadEnvironment)?;
    let count = |range: Option<PageRange>| {
        range.map(|r| ctx.engine.max_reference_count(env.space(), &r)).unwrap_or(0)
    };
    let first = count(typed.first);
    match typed.second {
        Some(_) => Ok(first.saturating_sub(count(typed.second)) as usize),
        None => Ok(first as usize),
    }
}

fn sys_exofork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let parent = ctx.caller_id();
    let frame = *ctx.env_mut(ctx.caller)?.frame();
    let child = ctx.envs.allocate(Some(parent), EnvType::User, EnvStatus::NotRunnable)?;
    let env = ctx.env_mut(child)?;
    *env.frame_mut() = frame;
    env.frame_mut().set_result(0);
    let id = env.id();
    if ctx.config.trace_envs {
        log::info!(target: "env", "[{}] new env {}", parent, id);
    }
    Ok(id.as_raw() as usize)
}

fn sys_env_set_status(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = StatusArgsTyped::decode(args);
    let index = ctx.envs.resolve(typed.env, ctx.caller, true)?;
    let status = typed.check()?;
    let env = ctx.env_mut(index)?;
    // A receiver made runnable from outside is no longer waiting.
    if status == EnvStatus::Runnable && env.mailbox().is_receiving() {
        env.mailbox_mut().cancel();
    }
    env.set_status(status);
    if index == ctx.caller && status != EnvStatus::Runnable {
        ctx.need_resched = true;
    }
    Ok(0)
}

fn sys_env_set_pgfault_upcall(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = UpcallArgsTyped::decode(args);
    let index = ctx.envs.resolve(typed.env, ctx.caller, true)?;
    let entry = typed.check()?;
    ctx.env_mut(index)?.set_pgfault_upcall(entry);
    Ok(0)
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.need_resched = true;
    Ok(0)
}

fn sys_ipc_try_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SendArgs::decode(args.get(0), args.get(1), args.get(2), args.get(3), args.get(4));
    ipc::try_send(ctx.envs, ctx.engine, ctx.memory, ctx.caller, typed)?;
    Ok(0)
}

fn sys_ipc_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = RecvArgs::decode(args.get(0), args.get(1))?;
    ipc::receive(ctx.envs, ctx.caller, typed)?;
    ctx.need_resched = true;
    Ok(0)
}
