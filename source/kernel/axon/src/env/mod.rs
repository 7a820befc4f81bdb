// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Environment registry (protection domains and their identities)
//! OWNERS: @kernel-team
//! PUBLIC API: EnvTable (allocate/resolve/lookup/pair_mut/take), Env, EnvType, EnvError, free_env
//! DEPENDS_ON: mm::{AddressSpace, RegionEngine}, ipc::Mailbox, trap::TrapFrame
//! INVARIANTS: An envid resolves only while its generation matches the live slot;
//!             the capability check follows the parent chain, generation-checked at every hop;
//!             an environment owns exactly one address space

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use axon_abi::{EnvId, EnvStatus, ENV_INDEX_BITS, MAX_ENVS, MAX_GENERATION};
use static_assertions::const_assert;

use crate::hal::PhysMemory;
use crate::ipc::Mailbox;
use crate::mm::{AddressSpace, RegionEngine};
use crate::trap::TrapFrame;
use crate::types::VirtAddr;

/// Registry slot index.
pub type EnvIndex = usize;

// Index and generation share the positive half of a 32-bit envid.
const_assert!(MAX_ENVS == 1 << ENV_INDEX_BITS);
const_assert!((MAX_GENERATION as u64) << ENV_INDEX_BITS < 1 << 31);

/// Errors reported by the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvError {
    /// Unknown, stale, dying or unauthorised envid.
    BadEnvironment,
    /// Every slot is in use.
    NoFreeEnvironment,
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Environment class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvType {
    User,
    /// May map device windows.
    Driver,
}

/// One protection domain.
pub struct Env {
    id: EnvId,
    parent: Option<EnvId>,
    status: EnvStatus,
    env_type: EnvType,
    space: AddressSpace,
    frame: TrapFrame,
    mailbox: Mailbox,
    pgfault_upcall: Option<VirtAddr>,
}

impl Env {
    fn new(id: EnvId, parent: Option<EnvId>, env_type: EnvType, status: EnvStatus) -> Self {
        Self {
            id,
            parent,
            status,
            env_type,
            space: AddressSpace::new(),
            frame: TrapFrame::default(),
            mailbox: Mailbox::new(),
            pgfault_upcall: None,
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn parent(&self) -> Option<EnvId> {
        self.parent
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    pub fn set_status(&mut self, status: EnvStatus) {
        self.status = status;
    }

    pub fn env_type(&self) -> EnvType {
        self.env_type
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn mailbox_mut(&mut self) -> &mut Mailbox {
        &mut self.mailbox
    }

    pub fn pgfault_upcall(&self) -> Option<VirtAddr> {
        self.pgfault_upcall
    }

    pub fn set_pgfault_upcall(&mut self, entry: Option<VirtAddr>) {
        self.pgfault_upcall = entry;
    }

    pub fn is_runnable(&self) -> bool {
        self.status == EnvStatus::Runnable
    }
}

struct Slot {
    generation: u32,
    env: Option<Env>,
}

/// Fixed-capacity arena of environments indexed by slot.
pub struct EnvTable {
    slots: Vec<Slot>,
    current: Option<EnvIndex>,
}

impl EnvTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot { generation: 0, env: None }).collect();
        Self { slots, current: None }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.env.is_some()).count()
    }

    /// Takes the lowest free slot and advances its generation.
    pub fn allocate(
        &mut self,
        parent: Option<EnvId>,
        env_type: EnvType,
        status: EnvStatus,
    ) -> Result<EnvIndex, EnvError> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.env.is_none())
            .ok_or(EnvError::NoFreeEnvironment)?;
        slot.generation = next_generation(slot.generation);
        let id = EnvId::new(index, slot.generation);
        slot.env = Some(Env::new(id, parent, env_type, status));
        Ok(index)
    }

    /// Slot of the occupied environment named exactly by `id` (any status).
    pub fn lookup(&self, id: EnvId) -> Option<EnvIndex> {
        let index = id.index();
        let env = self.slots.get(index)?.env.as_ref()?;
        if env.id == id {
            Some(index)
        } else {
            None
        }
    }

    /// Resolves `id` on behalf of `requester`.
    ///
    /// [`EnvId::SELF`] names the requester. With `check`, the target must be the requester
    /// or one of its descendants.
    pub fn resolve(&self, id: EnvId, requester: EnvIndex, check: bool) -> Result<EnvIndex, EnvError> {
        let index = if id.is_self() { requester } else { self.lookup(id).ok_or(EnvError::BadEnvironment)? };
        let target = self.get(index).ok_or(EnvError::BadEnvironment)?;
        if target.status == EnvStatus::Dying {
            return Err(EnvError::BadEnvironment);
        }
        if check && index != requester && !self.is_ancestor(requester, target) {
            return Err(EnvError::BadEnvironment);
        }
        Ok(index)
    }

    fn is_ancestor(&self, requester: EnvIndex, target: &Env) -> bool {
        let me = match self.get(requester) {
            Some(env) => env.id,
            None => return false,
        };
        let mut cursor = target.parent;
        for _ in 0..self.slots.len() {
            match cursor {
                Some(id) if id == me => return true,
                Some(id) => cursor = self.lookup(id).and_then(|i| self.get(i)).and_then(Env::parent),
                None => return false,
            }
        }
        false
    }

    pub fn get(&self, index: EnvIndex) -> Option<&Env> {
        self.slots.get(index)?.env.as_ref()
    }

    pub fn get_mut(&mut self, index: EnvIndex) -> Option<&mut Env> {
        self.slots.get_mut(index)?.env.as_mut()
    }

    /// Mutable access to two distinct environments at once.
    pub fn pair_mut(&mut self, a: EnvIndex, b: EnvIndex) -> Option<(&mut Env, &mut Env)> {
        if a == b || a >= self.slots.len() || b >= self.slots.len() {
            return None;
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (head, tail) = self.slots.split_at_mut(hi);
        let first = head[lo].env.as_mut()?;
        let second = tail[0].env.as_mut()?;
        if a < b {
            Some((first, second))
        } else {
            Some((second, first))
        }
    }

    /// Empties the slot; its generation is kept so the old id stays stale.
    pub fn take(&mut self, index: EnvIndex) -> Option<Env> {
        let env = self.slots.get_mut(index)?.env.take()?;
        if self.current == Some(index) {
            self.current = None;
        }
        Some(env)
    }

    pub fn current(&self) -> Option<EnvIndex> {
        self.current
    }

    pub fn set_current(&mut self, index: Option<EnvIndex>) {
        self.current = index.filter(|&i| self.get(i).is_some());
    }
}

fn next_generation(generation: u32) -> u32 {
    if generation >= MAX_GENERATION {
        1
    } else {
        generation + 1
    }
}

/// Tears down the environment in `index`: unmaps its space, drops pending IPC state and frees the slot.
///
/// `actor` is the environment on whose behalf this runs, for tracing.
pub fn free_env(
    envs: &mut EnvTable,
    engine: &mut RegionEngine,
    mem: &mut dyn PhysMemory,
    index: EnvIndex,
    actor: Option<EnvId>,
    trace: bool,
) -> Option<EnvId> {
    let mut env = envs.take(index)?;
    engine.teardown(mem, &mut env.space);
    if trace {
        log::info!(target: "env", "[{}] free env {}", actor.unwrap_or(EnvId::SELF), env.id);
    }
    Some(env.id)
}
