// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-environment address space.

use axon_abi::layout::{round_down, MAX_USER_ADDRESS, PAGE_SIZE};

use super::page_table::{PageTable, Pte};
use crate::types::{PageRange, VirtAddr};

/// Page-table root plus bookkeeping for one environment's user mappings.
///
/// Mutation of mappings goes through [`super::RegionEngine`], which owns reference counts.
pub struct AddressSpace {
    table: PageTable,
}

impl AddressSpace {
    pub const fn new() -> Self {
        Self { table: PageTable::new() }
    }

    pub fn lookup(&self, va: VirtAddr) -> Option<Pte> {
        self.table.lookup(va)
    }

    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.table.lookup(va).is_some()
    }

    /// Number of mapped user pages.
    pub fn mapped_pages(&self) -> usize {
        self.table.mapped_pages()
    }

    /// Leaf tables held by this space.
    pub fn table_pages(&self) -> usize {
        self.table.table_pages()
    }

    /// True if every byte of `[va, va + len)` is user-mapped (and writable when `write`).
    ///
    /// Lazy pages count as mapped; they are materialised on access.
    pub fn check_user_range(&self, va: usize, len: usize, write: bool) -> bool {
        let end = match va.checked_add(len) {
            Some(end) if end <= MAX_USER_ADDRESS => end,
            _ => return false,
        };
        let mut page = round_down(va);
        while page < end {
            let ok = VirtAddr::new(page)
                .and_then(|p| self.table.lookup(p))
                .map(|pte| pte.is_user() && (!write || pte.is_writable()))
                .unwrap_or(false);
            if !ok {
                return false;
            }
            page += PAGE_SIZE;
        }
        true
    }

    /// Every page of `range` is unmapped.
    pub fn is_vacant(&self, range: &PageRange) -> bool {
        range.iter().all(|va| !self.is_mapped(va))
    }

    pub(super) fn table(&self) -> &PageTable {
        &self.table
    }

    pub(super) fn table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}
