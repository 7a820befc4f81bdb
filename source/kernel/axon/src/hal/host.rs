// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hosted machine backends (heap-backed RAM, captured console)
//! OWNERS: @kernel-team
//! PUBLIC API: FramePool, BufferConsole, ConsoleTap
//! DEPENDS_ON: hal::{PhysMemory, Console}, spin::Mutex
//! INVARIANTS: RAM frames and device windows never overlap; a frame is free at most once

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use axon_abi::layout::PAGE_SIZE;
use spin::Mutex;

use super::{Console, Frame, PhysMemory};
use crate::types::PhysAddr;

/// Physical address of the first RAM frame.
pub const RAM_BASE: usize = 0x0010_0000;

struct DeviceWindow {
    base: usize,
    pages: Vec<Frame>,
}

impl DeviceWindow {
    fn end(&self) -> usize {
        self.base + self.pages.len() * PAGE_SIZE
    }

    fn contains(&self, pa: usize) -> bool {
        pa >= self.base && pa < self.end()
    }
}

/// Fixed pool of RAM frames with optional device windows.
pub struct FramePool {
    frames: Vec<Frame>,
    in_use: Vec<bool>,
    free: Vec<usize>,
    devices: Vec<DeviceWindow>,
}

impl FramePool {
    /// Creates a pool of `frames` RAM frames starting at [`RAM_BASE`].
    pub fn new(frames: usize) -> Self {
        Self {
            frames: vec![[0u8; PAGE_SIZE]; frames],
            in_use: vec![false; frames],
            // Lowest frame on top of the stack.
            free: (0..frames).rev().collect(),
            devices: Vec::new(),
        }
    }

    /// Adds a device window of `pages` pages at `base`.
    ///
    /// Windows that are unaligned or overlap RAM or another window are ignored.
    pub fn with_device(mut self, base: usize, pages: usize) -> Self {
        let end = match pages.checked_mul(PAGE_SIZE).and_then(|len| base.checked_add(len)) {
            Some(end) => end,
            None => return self,
        };
        let ram_end = RAM_BASE + self.frames.len() * PAGE_SIZE;
        let overlaps_ram = base < ram_end && end > RAM_BASE;
        let overlaps_dev = self.devices.iter().any(|d| base < d.end() && end > d.base);
        if base % PAGE_SIZE == 0 && pages > 0 && !overlaps_ram && !overlaps_dev {
            self.devices.push(DeviceWindow { base, pages: vec![[0u8; PAGE_SIZE]; pages] });
        }
        self
    }

    /// Total RAM frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    fn ram_index(&self, pa: PhysAddr) -> Option<usize> {
        let raw = pa.raw();
        if raw < RAM_BASE || raw % PAGE_SIZE != 0 {
            return None;
        }
        let index = (raw - RAM_BASE) / PAGE_SIZE;
        if index < self.frames.len() {
            Some(index)
        } else {
            None
        }
    }

    fn device_slot(&self, pa: PhysAddr) -> Option<(usize, usize)> {
        let raw = pa.raw();
        self.devices
            .iter()
            .position(|d| d.contains(raw))
            .map(|w| (w, (raw - self.devices[w].base) / PAGE_SIZE))
    }
}

impl PhysMemory for FramePool {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let index = self.free.pop()?;
        self.in_use[index] = true;
        Some(PhysAddr::new(RAM_BASE + index * PAGE_SIZE))
    }

    fn free_frame(&mut self, pa: PhysAddr) {
        match self.ram_index(pa) {
            Some(index) if self.in_use[index] => {
                self.in_use[index] = false;
                self.free.push(index);
            }
            _ => log::warn!(target: "mm", "free of unowned frame {:#x}", pa),
        }
    }

    fn free_frames(&self) -> usize {
        self.free.len()
    }

    fn frame(&self, pa: PhysAddr) -> Option<&Frame> {
        if let Some(index) = self.ram_index(pa) {
            return self.frames.get(index);
        }
        if pa.raw() % PAGE_SIZE != 0 {
            return None;
        }
        let (w, page) = self.device_slot(pa)?;
        self.devices[w].pages.get(page)
    }

    fn frame_mut(&mut self, pa: PhysAddr) -> Option<&mut Frame> {
        if let Some(index) = self.ram_index(pa) {
            return self.frames.get_mut(index);
        }
        if pa.raw() % PAGE_SIZE != 0 {
            return None;
        }
        let (w, page) = self.device_slot(pa)?;
        self.devices[w].pages.get_mut(page)
    }

    fn is_device_range(&self, pa: PhysAddr, len: usize) -> bool {
        let raw = pa.raw();
        let end = match raw.checked_add(len) {
            Some(end) => end,
            None => return false,
        };
        self.devices.iter().any(|d| raw >= d.base && end <= d.end())
    }
}

#[derive(Default)]
struct ConsoleState {
    output: Vec<u8>,
    input: VecDeque<u8>,
}

/// Console that records output and replays scripted input.
pub struct BufferConsole {
    state: Arc<Mutex<ConsoleState>>,
}

/// Test-side handle onto a [`BufferConsole`].
#[derive(Clone)]
pub struct ConsoleTap {
    state: Arc<Mutex<ConsoleState>>,
}

impl BufferConsole {
    pub fn new() -> (Self, ConsoleTap) {
        let state = Arc::new(Mutex::new(ConsoleState::default()));
        (Self { state: state.clone() }, ConsoleTap { state })
    }
}

impl Console for BufferConsole {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.state.lock().output.extend_from_slice(bytes);
    }

    fn getc(&mut self) -> Option<u8> {
        self.state.lock().input.pop_front()
    }
}

impl ConsoleTap {
    /// Everything written so far.
    pub fn output(&self) -> Vec<u8> {
        self.state.lock().output.clone()
    }

    /// Queues bytes for `cgetc`.
    pub fn push_input(&self, bytes: &[u8]) {
        self.state.lock().input.extend(bytes.iter().copied());
    }
}
