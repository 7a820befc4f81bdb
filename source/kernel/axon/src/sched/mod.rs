// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scheduler seam used by yield and blocking receive
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (reschedule), RoundRobin
//! DEPENDS_ON: env::EnvTable
//! INVARIANTS: Only RUNNABLE environments are ever chosen; at most one current environment

use crate::env::{EnvIndex, EnvTable};

/// Picks the next environment to run.
pub trait Scheduler {
    /// Returns the next runnable slot after `current`, or `None` when nothing can run.
    fn reschedule(&mut self, envs: &EnvTable, current: Option<EnvIndex>) -> Option<EnvIndex>;
}

/// Cyclic scan starting after the current slot; the current environment
/// is picked again only when nothing else is runnable.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundRobin;

impl Scheduler for RoundRobin {
    fn reschedule(&mut self, envs: &EnvTable, current: Option<EnvIndex>) -> Option<EnvIndex> {
        let slots = envs.capacity();
        if slots == 0 {
            return None;
        }
        let start = current.map(|i| i + 1).unwrap_or(0);
        (0..slots)
            .map(|step| (start + step) % slots)
            .find(|&i| envs.get(i).map(|env| env.is_runnable()).unwrap_or(false))
    }
}
