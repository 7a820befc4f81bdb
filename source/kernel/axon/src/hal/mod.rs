// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.
//!
//! The kernel core never touches frames or the console directly; it goes through
//! these seams so the same logic runs inside an image and on a host.

pub mod host;

use axon_abi::layout::PAGE_SIZE;

use crate::types::PhysAddr;

/// One page of physical memory.
pub type Frame = [u8; PAGE_SIZE];

/// Physical frame allocator plus access to frame contents.
pub trait PhysMemory {
    /// Takes a free RAM frame. Contents are unspecified.
    fn alloc_frame(&mut self) -> Option<PhysAddr>;
    /// Returns a frame previously handed out by [`PhysMemory::alloc_frame`].
    fn free_frame(&mut self, pa: PhysAddr);
    /// Number of frames [`PhysMemory::alloc_frame`] can still hand out.
    fn free_frames(&self) -> usize;
    /// Borrows a RAM frame or device page.
    fn frame(&self, pa: PhysAddr) -> Option<&Frame>;
    /// Mutably borrows a RAM frame or device page.
    fn frame_mut(&mut self, pa: PhysAddr) -> Option<&mut Frame>;
    /// True if `[pa, pa + len)` lies inside one device window.
    fn is_device_range(&self, pa: PhysAddr, len: usize) -> bool;
}

/// Console used by `cputs`/`cgetc`.
pub trait Console {
    fn write_bytes(&mut self, bytes: &[u8]);
    /// Non-blocking read.
    fn getc(&mut self) -> Option<u8>;
}
