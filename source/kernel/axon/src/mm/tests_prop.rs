// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for region reference accounting
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Ensures frames are shared and reclaimed by count.
//!
//! TEST_SCOPE:
//!   - Unmap followed by allocate leaves count 1 everywhere (no leaked prior mapping)
//!   - Shared frames are counted once per mapping space and survive partial unmaps
//!   - Rejected write-gaining copies do not touch the destination
//!
//! TEST_SCENARIOS:
//!   - realloc_after_unmap_has_single_reference()
//!   - sharing_counts_spaces_and_reclaims_at_zero()
//!   - write_gaining_copy_is_rejected_without_side_effects()

use axon_abi::layout::PAGE_SIZE;
use axon_abi::Prot;
use proptest::prelude::*;

use super::{AddressSpace, AllocRequest, RegionEngine, RegionError, RegionPerm, Spaces};
use crate::hal::host::FramePool;
use crate::hal::PhysMemory;
use crate::types::PageRange;

const POOL: usize = 64;

fn arb_range(max_pages: usize) -> impl Strategy<Value = PageRange> {
    (0usize..256, 1usize..=max_pages).prop_map(|(page, pages)| {
        PageRange::user(page * PAGE_SIZE, pages * PAGE_SIZE).expect("range below ceiling")
    })
}

fn alloc(raw: u32) -> AllocRequest {
    AllocRequest::decode(raw).expect("valid alloc perm")
}

proptest! {
    #[test]
    fn realloc_after_unmap_has_single_reference(range in arb_range(8), lazy in any::<bool>()) {
        let mut mem = FramePool::new(POOL);
        let mut engine = RegionEngine::new();
        let mut space = AddressSpace::new();
        let first = if lazy { (Prot::RW | Prot::LAZY).bits() } else { Prot::RW.bits() };
        engine.allocate_region(&mut mem, &mut space, &range, alloc(first)).unwrap();
        engine.unmap_region(&mut mem, &mut space, &range);
        prop_assert_eq!(space.mapped_pages(), 0);
        prop_assert_eq!(mem.free_frames(), POOL);

        engine.allocate_region(&mut mem, &mut space, &range, alloc(Prot::RW.bits())).unwrap();
        for va in range.iter() {
            prop_assert_eq!(engine.max_reference_count(&space, &PageRange::one(va)), 1);
        }
    }

    #[test]
    fn sharing_counts_spaces_and_reclaims_at_zero(
        range in arb_range(4),
        dst_page in 512usize..768,
        extra in 0usize..3,
    ) {
        let mut mem = FramePool::new(POOL);
        let mut engine = RegionEngine::new();
        let mut owner = AddressSpace::new();
        engine.allocate_region(&mut mem, &mut owner, &range, alloc(Prot::RW.bits())).unwrap();
        let dst = PageRange::user(dst_page * PAGE_SIZE, range.pages() * PAGE_SIZE).unwrap();
        let perm = RegionPerm::for_copy(Prot::READ.bits()).unwrap();

        let mut others: Vec<AddressSpace> = (0..=extra).map(|_| AddressSpace::new()).collect();
        for other in others.iter_mut() {
            engine
                .copy_region(&mut mem, Spaces::Distinct { src: &mut owner, dst: other }, &range, &dst, perm)
                .unwrap();
        }
        let spaces = others.len() as u32 + 1;
        prop_assert_eq!(engine.max_reference_count(&owner, &range), spaces);

        engine.unmap_region(&mut mem, &mut owner, &range);
        prop_assert_eq!(engine.max_reference_count(&others[0], &dst), spaces - 1);
        for other in others.iter_mut() {
            engine.unmap_region(&mut mem, other, &dst);
        }
        prop_assert_eq!(engine.live_frames(), 0);
        prop_assert_eq!(mem.free_frames(), POOL);
    }

    #[test]
    fn write_gaining_copy_is_rejected_without_side_effects(range in arb_range(4), dst_page in 512usize..768) {
        let mut mem = FramePool::new(POOL);
        let mut engine = RegionEngine::new();
        let mut src = AddressSpace::new();
        let mut dst_space = AddressSpace::new();
        engine.allocate_region(&mut mem, &mut src, &range, alloc(Prot::READ.bits())).unwrap();
        let dst = PageRange::user(dst_page * PAGE_SIZE, range.pages() * PAGE_SIZE).unwrap();
        let before = mem.free_frames();
        let perm = RegionPerm::for_copy(Prot::RW.bits()).unwrap();
        prop_assert_eq!(
            engine.copy_region(&mut mem, Spaces::Distinct { src: &mut src, dst: &mut dst_space }, &range, &dst, perm),
            Err(RegionError::PermissionDenied)
        );
        prop_assert_eq!(dst_space.mapped_pages(), 0);
        prop_assert_eq!(mem.free_frames(), before);
        prop_assert_eq!(engine.max_reference_count(&src, &range), 1);
    }
}
