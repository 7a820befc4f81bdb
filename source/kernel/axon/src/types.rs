// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address newtypes used when decoding syscall arguments
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, PhysAddr, PageRange
//! DEPENDS_ON: axon_abi::layout
//! INVARIANTS: A VirtAddr is always below MAX_USER_ADDRESS; a PageRange never crosses it

use core::fmt;

use axon_abi::layout::{is_page_aligned, MAX_USER_ADDRESS, PAGE_SIZE};

/// User virtual address strictly below the user ceiling.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if addr < MAX_USER_ADDRESS {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        Self::new(addr).filter(|va| is_page_aligned(va.0))
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    /// Address of the page containing `self`.
    #[inline]
    pub fn page(self) -> Self {
        Self(axon_abi::layout::round_down(self.0))
    }

    #[inline]
    pub fn offset(self) -> usize {
        axon_abi::layout::page_offset(self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical address as handed out by [`crate::hal::PhysMemory`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        if is_page_aligned(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Page-aligned run of user pages; `[start, start + pages * PAGE_SIZE)` lies below the ceiling.
///
/// An empty range is valid and names no pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageRange {
    start: VirtAddr,
    pages: usize,
}

impl PageRange {
    /// Decodes a `(va, len)` argument pair; both must be page aligned.
    pub fn user(va: usize, len: usize) -> Option<Self> {
        let start = VirtAddr::page_aligned(va)?;
        if !is_page_aligned(len) {
            return None;
        }
        let end = va.checked_add(len)?;
        if end > MAX_USER_ADDRESS {
            return None;
        }
        Some(Self { start, pages: len / PAGE_SIZE })
    }

    /// Smallest page range covering `[va, va + len)`, clipped to the user ceiling.
    ///
    /// Returns `None` when `va` itself is at or above the ceiling.
    pub fn covering(va: usize, len: usize) -> Option<Self> {
        let start = VirtAddr::new(va)?.page();
        if len == 0 {
            return Some(Self { start, pages: 0 });
        }
        let end = va.saturating_add(len).min(MAX_USER_ADDRESS);
        let end = axon_abi::layout::round_up(end).unwrap_or(MAX_USER_ADDRESS);
        Some(Self { start, pages: (end - start.raw()) / PAGE_SIZE })
    }

    /// Single page at `va`.
    pub fn one(va: VirtAddr) -> Self {
        Self { start: va.page(), pages: 1 }
    }

    #[inline]
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    #[inline]
    pub fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    /// Page-aligned addresses in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = VirtAddr> {
        let base = self.start.raw();
        (0..self.pages).map(move |i| VirtAddr(base + i * PAGE_SIZE))
    }
}
