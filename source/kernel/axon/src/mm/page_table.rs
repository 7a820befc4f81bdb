// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level user page table with lazy allocation of leaf tables.
//!
//! Every leaf table occupies one physical frame taken from [`PhysMemory`], so page-table
//! exhaustion surfaces as [`MapError::NoMemory`] exactly like data-page exhaustion.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use axon_abi::layout::PAGE_SIZE;
use bitflags::bitflags;

use super::perm::AllocFlavor;
use crate::hal::PhysMemory;
use crate::types::{PageRange, PhysAddr, VirtAddr};

/// Number of entries per leaf table.
const PT_ENTRIES: usize = 512;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Flags stored in a leaf entry.
    pub struct PageFlags: u16 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        /// Keep shared (rather than copied) when the space is duplicated.
        const SHARED = 1 << 5;
    }
}

/// Access bits a user mapping may carry.
pub const ACCESS_BITS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// What a leaf entry points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    /// Reference-counted RAM frame.
    Frame(PhysAddr),
    /// Device page; never counted, never freed.
    Device(PhysAddr),
    /// Not yet materialised; filled per flavour on first touch.
    Lazy(AllocFlavor),
}

impl Backing {
    pub fn phys(self) -> Option<PhysAddr> {
        match self {
            Backing::Frame(pa) | Backing::Device(pa) => Some(pa),
            Backing::Lazy(_) => None,
        }
    }
}

/// Leaf entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub backing: Backing,
    pub flags: PageFlags,
}

impl Pte {
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PageFlags::WRITE)
    }

    pub fn is_user(&self) -> bool {
        self.flags.contains(PageFlags::VALID | PageFlags::USER)
    }

    /// Set by [`Prot::SHARE`](axon_abi::Prot::SHARE); user-level fork maps these pages instead of copying.
    pub fn is_shared(&self) -> bool {
        self.flags.contains(PageFlags::SHARED)
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// No frame was available for a leaf table.
    NoMemory,
}

struct LeafTable {
    frame: PhysAddr,
    entries: Box<[Option<Pte>; PT_ENTRIES]>,
    live: usize,
}

/// User page table: directory of lazily allocated leaf tables.
pub struct PageTable {
    leaves: BTreeMap<usize, LeafTable>,
}

impl PageTable {
    pub const fn new() -> Self {
        Self { leaves: BTreeMap::new() }
    }

    /// Returns the entry mapped at the page containing `va`.
    pub fn lookup(&self, va: VirtAddr) -> Option<Pte> {
        let (dir, slot) = split(va);
        self.leaves.get(&dir).and_then(|leaf| leaf.entries[slot])
    }

    /// Mutable access to an existing entry.
    pub fn entry_mut(&mut self, va: VirtAddr) -> Option<&mut Pte> {
        let (dir, slot) = split(va);
        self.leaves.get_mut(&dir).and_then(|leaf| leaf.entries[slot].as_mut())
    }

    /// Number of leaf tables that mapping all of `range` would still have to allocate.
    pub fn missing_tables(&self, range: &PageRange) -> usize {
        let mut missing = 0;
        let mut last = None;
        for va in range.iter() {
            let (dir, _) = split(va);
            if last != Some(dir) {
                last = Some(dir);
                if !self.leaves.contains_key(&dir) {
                    missing += 1;
                }
            }
        }
        missing
    }

    /// Installs `pte` at `va`, returning the entry it replaced.
    pub fn insert(
        &mut self,
        mem: &mut dyn PhysMemory,
        va: VirtAddr,
        pte: Pte,
    ) -> Result<Option<Pte>, MapError> {
        let (dir, slot) = split(va);
        if !self.leaves.contains_key(&dir) {
            let frame = mem.alloc_frame().ok_or(MapError::NoMemory)?;
            self.leaves.insert(dir, LeafTable { frame, entries: Box::new([None; PT_ENTRIES]), live: 0 });
        }
        let leaf = self.leaves.get_mut(&dir).ok_or(MapError::NoMemory)?;
        let old = leaf.entries[slot].replace(pte);
        if old.is_none() {
            leaf.live += 1;
        }
        Ok(old)
    }

    /// Removes the entry at `va`; an emptied leaf table gives its frame back.
    pub fn remove(&mut self, mem: &mut dyn PhysMemory, va: VirtAddr) -> Option<Pte> {
        let (dir, slot) = split(va);
        let leaf = self.leaves.get_mut(&dir)?;
        let old = leaf.entries[slot].take()?;
        leaf.live -= 1;
        if leaf.live == 0 {
            if let Some(leaf) = self.leaves.remove(&dir) {
                mem.free_frame(leaf.frame);
            }
        }
        Some(old)
    }

    /// All live entries in ascending address order.
    pub fn entries(&self) -> Vec<(VirtAddr, Pte)> {
        let mut out = Vec::new();
        for (dir, leaf) in &self.leaves {
            for (slot, entry) in leaf.entries.iter().enumerate() {
                if let Some(pte) = entry {
                    let raw = (dir * PT_ENTRIES + slot) * PAGE_SIZE;
                    if let Some(va) = VirtAddr::new(raw) {
                        out.push((va, *pte));
                    }
                }
            }
        }
        out
    }

    /// Leaf tables currently allocated.
    pub fn table_pages(&self) -> usize {
        self.leaves.len()
    }

    /// Number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.leaves.values().map(|leaf| leaf.live).sum()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

fn split(va: VirtAddr) -> (usize, usize) {
    let vpn = va.raw() / PAGE_SIZE;
    (vpn / PT_ENTRIES, vpn % PT_ENTRIES)
}
