// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Region mapping engine.
//!
//! Frames are shared between address spaces by reference count only. The count map is
//! private to [`RegionEngine`]; callers observe it through [`RegionEngine::ref_count`] and
//! [`RegionEngine::max_reference_count`].
//!
//! Each operation checks arguments and reserves capacity (frames for data pages plus any
//! leaf tables the range still needs) before it changes a single entry, so failures leave
//! both spaces untouched. When an entry is replaced the new backing is retained before
//! the old one is released, which keeps a frame alive when it is remapped onto itself.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use axon_abi::layout::PAGE_SIZE;

use super::address_space::AddressSpace;
use super::page_table::{Backing, Pte, ACCESS_BITS};
use super::perm::{AllocFlavor, AllocRequest, RegionPerm};
use super::RegionError;
use crate::hal::PhysMemory;
use crate::types::{PageRange, PhysAddr, VirtAddr};

/// Source and destination of a copy, which may be the same space.
pub enum Spaces<'a> {
    Same(&'a mut AddressSpace),
    Distinct { src: &'a mut AddressSpace, dst: &'a mut AddressSpace },
}

impl Spaces<'_> {
    fn src(&mut self) -> &mut AddressSpace {
        match self {
            Spaces::Same(space) => space,
            Spaces::Distinct { src, .. } => src,
        }
    }

    fn dst(&mut self) -> &mut AddressSpace {
        match self {
            Spaces::Same(space) => space,
            Spaces::Distinct { dst, .. } => dst,
        }
    }
}

/// Owner of page reference counts and the only mutator of user mappings.
pub struct RegionEngine {
    refs: BTreeMap<PhysAddr, u32>,
}

impl RegionEngine {
    pub const fn new() -> Self {
        Self { refs: BTreeMap::new() }
    }

    /// Number of mappings that currently reference `pa`.
    pub fn ref_count(&self, pa: PhysAddr) -> u32 {
        self.refs.get(&pa).copied().unwrap_or(0)
    }

    /// Frames currently held by at least one mapping.
    pub fn live_frames(&self) -> usize {
        self.refs.len()
    }

    /// Maps fresh anonymous pages over `range`, replacing whatever was there.
    pub fn allocate_region(
        &mut self,
        mem: &mut dyn PhysMemory,
        space: &mut AddressSpace,
        range: &PageRange,
        req: AllocRequest,
    ) -> Result<(), RegionError> {
        let data = if req.lazy { 0 } else { range.pages() };
        reserve(mem, data + space.table().missing_tables(range))?;

        let flags = req.perm.page_flags();
        for va in range.iter() {
            let backing = if req.lazy {
                Backing::Lazy(req.flavor)
            } else {
                Backing::Frame(self.fresh_frame(mem, req.flavor)?)
            };
            self.install(mem, space, va, Pte { backing, flags })?;
        }
        log::trace!(
            target: "mm",
            "alloc {:#x}+{} pages lazy={} flavor={:?}",
            range.start(),
            range.pages(),
            req.lazy,
            req.flavor
        );
        Ok(())
    }

    /// Maps the frames behind `src` into `dst` with `perm`.
    ///
    /// Lazy source pages are materialised first so both sides share one frame.
    pub fn copy_region(
        &mut self,
        mem: &mut dyn PhysMemory,
        mut spaces: Spaces<'_>,
        src: &PageRange,
        dst: &PageRange,
        perm: RegionPerm,
    ) -> Result<(), RegionError> {
        if src.pages() != dst.pages() {
            return Err(RegionError::OutOfRange);
        }

        let mut lazy = 0;
        for va in src.iter() {
            let pte = spaces.src().lookup(va).ok_or(RegionError::NotMapped)?;
            if !pte.is_user() {
                return Err(RegionError::NotMapped);
            }
            if perm.write && !pte.is_writable() {
                return Err(RegionError::PermissionDenied);
            }
            if matches!(pte.backing, Backing::Lazy(_)) {
                lazy += 1;
            }
        }
        let tables = spaces.dst().table().missing_tables(dst);
        reserve(mem, lazy + tables)?;

        let mut backings = Vec::with_capacity(src.pages());
        for va in src.iter() {
            self.materialize(mem, spaces.src(), va)?;
            let pte = spaces.src().lookup(va).ok_or(RegionError::NotMapped)?;
            backings.push(pte.backing);
        }

        let target = spaces.dst();
        for (va, backing) in dst.iter().zip(backings) {
            let mut flags = perm.page_flags();
            if perm.combine {
                if let Some(old) = target.lookup(va) {
                    if old.backing == backing {
                        flags |= old.flags & ACCESS_BITS;
                    }
                }
            }
            self.retain(backing);
            self.install(mem, target, va, Pte { backing, flags })?;
        }
        log::trace!(
            target: "mm",
            "copy {:#x} -> {:#x} ({} pages)",
            src.start(),
            dst.start(),
            dst.pages()
        );
        Ok(())
    }

    /// Removes every mapping in `range`; holes are skipped.
    pub fn unmap_region(&mut self, mem: &mut dyn PhysMemory, space: &mut AddressSpace, range: &PageRange) {
        for va in range.iter() {
            if let Some(old) = space.table_mut().remove(mem, va) {
                self.release(mem, old.backing);
            }
        }
    }

    /// Maps the device pages `[pa, pa + len)` at `range`, which must be vacant.
    pub fn map_physical_region(
        &mut self,
        mem: &mut dyn PhysMemory,
        space: &mut AddressSpace,
        range: &PageRange,
        pa: PhysAddr,
        perm: RegionPerm,
    ) -> Result<(), RegionError> {
        if range.is_empty() {
            return Ok(());
        }
        if !mem.is_device_range(pa, range.pages() * PAGE_SIZE) {
            return Err(RegionError::NotDevice);
        }
        if !space.is_vacant(range) {
            return Err(RegionError::Occupied);
        }
        reserve(mem, space.table().missing_tables(range))?;

        let flags = perm.page_flags();
        for (i, va) in range.iter().enumerate() {
            let page = pa.checked_add(i * PAGE_SIZE).ok_or(RegionError::NotDevice)?;
            space.table_mut().insert(mem, va, Pte { backing: Backing::Device(page), flags })?;
        }
        Ok(())
    }

    /// Largest reference count among the pages of `range`; holes count as zero.
    ///
    /// Device and not-yet-materialised pages belong to exactly one mapping.
    pub fn max_reference_count(&self, space: &AddressSpace, range: &PageRange) -> u32 {
        range
            .iter()
            .filter_map(|va| space.lookup(va))
            .map(|pte| match pte.backing {
                Backing::Frame(pa) => self.ref_count(pa),
                Backing::Device(_) | Backing::Lazy(_) => 1,
            })
            .max()
            .unwrap_or(0)
    }

    /// Gives the page at `va` a frame if it is still lazy and returns its physical address.
    pub fn materialize(
        &mut self,
        mem: &mut dyn PhysMemory,
        space: &mut AddressSpace,
        va: VirtAddr,
    ) -> Result<PhysAddr, RegionError> {
        let pte = space.lookup(va).ok_or(RegionError::NotMapped)?;
        match pte.backing {
            Backing::Frame(pa) | Backing::Device(pa) => Ok(pa),
            Backing::Lazy(flavor) => {
                let pa = self.fresh_frame(mem, flavor)?;
                match space.table_mut().entry_mut(va) {
                    Some(entry) => entry.backing = Backing::Frame(pa),
                    None => {
                        self.release(mem, Backing::Frame(pa));
                        return Err(RegionError::NotMapped);
                    }
                }
                log::trace!(target: "mm", "materialised {:#x} at {:#x}", va.page(), pa);
                Ok(pa)
            }
        }
    }

    /// Resolves a user fault at `va`; only lazy pages with sufficient rights resolve.
    pub fn resolve_fault(
        &mut self,
        mem: &mut dyn PhysMemory,
        space: &mut AddressSpace,
        va: VirtAddr,
        write: bool,
    ) -> Result<PhysAddr, RegionError> {
        let pte = space.lookup(va).ok_or(RegionError::Fault)?;
        if !pte.is_user() || (write && !pte.is_writable()) {
            return Err(RegionError::Fault);
        }
        self.materialize(mem, space, va)
    }

    /// Reads user memory; the range must be user-readable.
    pub fn copy_from_user(
        &mut self,
        mem: &mut dyn PhysMemory,
        space: &mut AddressSpace,
        va: usize,
        buf: &mut [u8],
    ) -> Result<(), RegionError> {
        if !space.check_user_range(va, buf.len(), false) {
            return Err(RegionError::Fault);
        }
        let mut done = 0;
        while done < buf.len() {
            let at = VirtAddr::new(va + done).ok_or(RegionError::Fault)?;
            let pa = self.materialize(mem, space, at)?;
            let off = at.offset();
            let n = (PAGE_SIZE - off).min(buf.len() - done);
            let frame = mem.frame(pa).ok_or(RegionError::Fault)?;
            buf[done..done + n].copy_from_slice(&frame[off..off + n]);
            done += n;
        }
        Ok(())
    }

    /// Writes user memory; the range must be user-writable.
    pub fn copy_to_user(
        &mut self,
        mem: &mut dyn PhysMemory,
        space: &mut AddressSpace,
        va: usize,
        bytes: &[u8],
    ) -> Result<(), RegionError> {
        if !space.check_user_range(va, bytes.len(), true) {
            return Err(RegionError::Fault);
        }
        let mut done = 0;
        while done < bytes.len() {
            let at = VirtAddr::new(va + done).ok_or(RegionError::Fault)?;
            let pa = self.materialize(mem, space, at)?;
            let off = at.offset();
            let n = (PAGE_SIZE - off).min(bytes.len() - done);
            let frame = mem.frame_mut(pa).ok_or(RegionError::Fault)?;
            frame[off..off + n].copy_from_slice(&bytes[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Unmaps everything in `space` and returns its leaf tables.
    pub fn teardown(&mut self, mem: &mut dyn PhysMemory, space: &mut AddressSpace) {
        for (va, _) in space.table().entries() {
            if let Some(old) = space.table_mut().remove(mem, va) {
                self.release(mem, old.backing);
            }
        }
    }

    fn fresh_frame(&mut self, mem: &mut dyn PhysMemory, flavor: AllocFlavor) -> Result<PhysAddr, RegionError> {
        let pa = mem.alloc_frame().ok_or(RegionError::NoMemory)?;
        match mem.frame_mut(pa) {
            Some(frame) => frame.fill(flavor.fill_byte()),
            None => {
                mem.free_frame(pa);
                return Err(RegionError::NoMemory);
            }
        }
        self.refs.insert(pa, 1);
        Ok(pa)
    }

    /// Installs `pte`, consuming one reference on its backing, and releases the old entry.
    fn install(
        &mut self,
        mem: &mut dyn PhysMemory,
        space: &mut AddressSpace,
        va: VirtAddr,
        pte: Pte,
    ) -> Result<(), RegionError> {
        match space.table_mut().insert(mem, va, pte) {
            Ok(Some(old)) => {
                self.release(mem, old.backing);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                self.release(mem, pte.backing);
                Err(err.into())
            }
        }
    }

    fn retain(&mut self, backing: Backing) {
        if let Backing::Frame(pa) = backing {
            *self.refs.entry(pa).or_insert(0) += 1;
        }
    }

    fn release(&mut self, mem: &mut dyn PhysMemory, backing: Backing) {
        let Backing::Frame(pa) = backing else {
            return;
        };
        match self.refs.get_mut(&pa) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.refs.remove(&pa);
                mem.free_frame(pa);
            }
            None => log::warn!(target: "mm", "release of untracked frame {:#x}", pa),
        }
    }
}

impl Default for RegionEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn reserve(mem: &dyn PhysMemory, frames: usize) -> Result<(), RegionError> {
    if mem.free_frames() < frames {
        return Err(RegionError::NoMemory);
    }
    Ok(())
}
