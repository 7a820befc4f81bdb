// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Saved user register state and the syscall register convention
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, REG_COUNT
//! INVARIANTS: regs[0] carries the call number in and the result word out; regs[1..=6] are arguments

use static_assertions::assert_eq_size;

use crate::syscall::Args;

/// General-purpose registers saved per environment.
pub const REG_COUNT: usize = 8;

/// Register holding the call number on entry and the result word on exit.
const REG_RESULT: usize = 0;

/// User register state saved on kernel entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: [usize; REG_COUNT],
    pub pc: usize,
    pub sp: usize,
}

assert_eq_size!(TrapFrame, [usize; REG_COUNT + 2]);

impl TrapFrame {
    pub fn syscall_number(&self) -> usize {
        self.regs[REG_RESULT]
    }

    pub fn syscall_args(&self) -> Args {
        let r = &self.regs;
        Args::new([r[1], r[2], r[3], r[4], r[5], r[6]])
    }

    /// Loads a call as user code would before trapping.
    pub fn load_syscall(&mut self, number: usize, args: [usize; 6]) {
        self.regs[REG_RESULT] = number;
        self.regs[1..=6].copy_from_slice(&args);
    }

    pub fn set_result(&mut self, word: isize) {
        self.regs[REG_RESULT] = word as usize;
    }

    pub fn result(&self) -> isize {
        self.regs[REG_RESULT] as isize
    }
}
