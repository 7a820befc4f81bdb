// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: End-to-end checks of the syscall surface through the trap frame
//! TEST_SCOPE: console calls, identity, region calls, status, region_refs, device mapping

use axon::abi::layout::{MAX_USER_ADDRESS, PAGE_SIZE};
use axon::abi::{EnvId, EnvStatus, ErrorCode, Prot, Syscall};
use axon::env::EnvType;
use axon::hal::host::{BufferConsole, ConsoleTap, FramePool};
use axon::hal::PhysMemory;
use axon::{Kernel, KernelConfig, Machine};

const DEVICE_BASE: usize = 0x4000_0000;

fn boot_with(pool: FramePool, env_type: EnvType) -> (Kernel, EnvId, ConsoleTap) {
    let (console, tap) = BufferConsole::new();
    let mut kernel = Kernel::new(KernelConfig::new().with_max_envs(16), Machine::new(pool, console)).unwrap();
    let root = kernel.create_env(env_type, None).unwrap();
    kernel.run(root).unwrap();
    (kernel, root, tap)
}

fn boot() -> (Kernel, EnvId, ConsoleTap) {
    boot_with(FramePool::new(64), EnvType::User)
}

fn call(kernel: &mut Kernel, which: Syscall, args: [usize; 6]) -> Option<isize> {
    kernel.syscall(which.number(), args)
}

fn err(code: ErrorCode) -> Option<isize> {
    Some(code.as_word())
}

fn rw() -> usize {
    Prot::RW.bits() as usize
}

#[test]
fn getenvid_reports_slot_and_generation() {
    let (mut kernel, root, _) = boot();
    assert_eq!(call(&mut kernel, Syscall::GetEnvId, [0; 6]), Some(root.as_raw() as isize));
    assert_eq!(root, EnvId::new(0, 1));
}

#[test]
fn cputs_copies_user_bytes_to_console() {
    let (mut kernel, root, tap) = boot();
    assert_eq!(call(&mut kernel, Syscall::AllocRegion, [0, 0x1000, 2 * PAGE_SIZE, rw(), 0, 0]), Some(0));
    // Straddle the page boundary.
    let text = b"hello, exokernel";
    kernel.write_user(root, 0x2000 - 5, text).unwrap();
    assert_eq!(call(&mut kernel, Syscall::Cputs, [0x2000 - 5, text.len(), 0, 0, 0, 0]), Some(0));
    assert_eq!(tap.output(), text.to_vec());
}

#[test]
fn cputs_on_foreign_memory_destroys_the_caller() {
    let (mut kernel, root, tap) = boot();
    assert_eq!(call(&mut kernel, Syscall::Cputs, [0x7000, 4, 0, 0, 0, 0]), None);
    assert!(kernel.env(root).is_none());
    assert!(tap.output().is_empty());
    assert_eq!(kernel.current(), None);
}

#[test]
fn cgetc_is_non_blocking() {
    let (mut kernel, _, tap) = boot();
    assert_eq!(call(&mut kernel, Syscall::Cgetc, [0; 6]), Some(0));
    tap.push_input(b"q");
    assert_eq!(call(&mut kernel, Syscall::Cgetc, [0; 6]), Some(b'q' as isize));
    assert_eq!(call(&mut kernel, Syscall::Cgetc, [0; 6]), Some(0));
}

#[test]
fn alloc_region_validates_before_mapping() {
    let (mut kernel, root, _) = boot();
    assert_eq!(call(&mut kernel, Syscall::AllocRegion, [0, 0x1001, PAGE_SIZE, rw(), 0, 0]), err(ErrorCode::InvalidArgument));
    assert_eq!(call(&mut kernel, Syscall::AllocRegion, [0, 0x1000, 100, rw(), 0, 0]), err(ErrorCode::InvalidArgument));
    let top = MAX_USER_ADDRESS - PAGE_SIZE;
    assert_eq!(call(&mut kernel, Syscall::AllocRegion, [0, top, 2 * PAGE_SIZE, rw(), 0, 0]), err(ErrorCode::InvalidArgument));
    assert_eq!(call(&mut kernel, Syscall::AllocRegion, [0, top, PAGE_SIZE, rw(), 0, 0]), Some(0));
    assert!(kernel.lookup(root, top).is_some());
    assert!(kernel.lookup(root, 0x1000).is_none());
}

#[test]
fn alloc_region_fills_by_flavour() {
    let (mut kernel, root, _) = boot();
    let one = (Prot::RW | Prot::ALLOC_ONE).bits() as usize;
    assert_eq!(call(&mut kernel, Syscall::AllocRegion, [0, 0x1000, PAGE_SIZE, rw(), 0, 0]), Some(0));
    assert_eq!(call(&mut kernel, Syscall::AllocRegion, [0, 0x2000, PAGE_SIZE, one, 0, 0]), Some(0));
    let mut buf = [0x55u8; 16];
    kernel.read_user(root, 0x1000, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 16]);
    kernel.read_user(root, 0x2ff0, &mut buf).unwrap();
    assert_eq!(buf, [0xffu8; 16]);
}

#[test]
fn alloc_region_out_of_frames_reports_no_memory() {
    let (mut kernel, root, _) = boot_with(FramePool::new(4), EnvType::User);
    assert_eq!(call(&mut kernel, Syscall::AllocRegion, [0, 0x1000, 8 * PAGE_SIZE, rw(), 0, 0]), err(ErrorCode::NoMemory));
    assert!(kernel.lookup(root, 0x1000).is_none());
    assert_eq!(kernel.memory().free_frames(), 4);
}

#[test]
fn env_set_status_resolves_before_checking_status() {
    let (mut kernel, _, _) = boot();
    let stale = EnvId::new(5, 3).as_raw() as usize;
    assert_eq!(call(&mut kernel, Syscall::EnvSetStatus, [stale, 99, 0, 0, 0, 0]), err(ErrorCode::BadEnvironment));
    assert_eq!(call(&mut kernel, Syscall::EnvSetStatus, [0, 99, 0, 0, 0, 0]), err(ErrorCode::InvalidArgument));
    let dying = EnvStatus::Dying as usize;
    assert_eq!(call(&mut kernel, Syscall::EnvSetStatus, [0, dying, 0, 0, 0, 0]), err(ErrorCode::InvalidArgument));
}

#[test]
fn exofork_then_release_child() {
    let (mut kernel, root, _) = boot();
    let child = EnvId::from_raw(call(&mut kernel, Syscall::Exofork, [0; 6]).unwrap() as u32);
    assert_eq!(kernel.env(child).unwrap().status(), EnvStatus::NotRunnable);
    let runnable = EnvStatus::Runnable as usize;
    assert_eq!(call(&mut kernel, Syscall::EnvSetStatus, [child.as_raw() as usize, runnable, 0, 0, 0, 0]), Some(0));
    // Yield moves to the child.
    assert_eq!(call(&mut kernel, Syscall::Yield, [0; 6]), Some(0));
    assert_eq!(kernel.current(), Some(child));
    assert_eq!(call(&mut kernel, Syscall::GetEnvId, [0; 6]), Some(child.as_raw() as isize));
    assert_eq!(call(&mut kernel, Syscall::Yield, [0; 6]), Some(0));
    assert_eq!(kernel.current(), Some(root));
}

#[test]
fn region_refs_compares_two_ranges() {
    let (mut kernel, _, _) = boot();
    assert_eq!(call(&mut kernel, Syscall::AllocRegion, [0, 0x1000, PAGE_SIZE, rw(), 0, 0]), Some(0));
    assert_eq!(call(&mut kernel, Syscall::MapRegion, [0, 0x1000, 0, 0x5000, PAGE_SIZE, rw()]), Some(0));

    let refs = |kernel: &mut Kernel, a: usize, al: usize, b: usize, bl: usize| {
        call(kernel, Syscall::RegionRefs, [a, al, b, bl, 0, 0])
    };
    assert_eq!(refs(&mut kernel, 0x1000, PAGE_SIZE, MAX_USER_ADDRESS, 0), Some(2));
    assert_eq!(refs(&mut kernel, 0x1000, PAGE_SIZE, 0x5000, PAGE_SIZE), Some(0));
    assert_eq!(refs(&mut kernel, 0x1000, PAGE_SIZE, 0x9000, PAGE_SIZE), Some(2));
    // Ranges round outward to whole pages.
    assert_eq!(refs(&mut kernel, 0x1800, 16, MAX_USER_ADDRESS, 0), Some(2));
    assert_eq!(refs(&mut kernel, 0x9000, PAGE_SIZE, 0x1000, PAGE_SIZE), Some(0));
    assert_eq!(refs(&mut kernel, MAX_USER_ADDRESS, PAGE_SIZE, 0x1000, PAGE_SIZE), Some(0));
}

#[test]
fn unmap_region_tolerates_holes() {
    let (mut kernel, root, _) = boot();
    assert_eq!(call(&mut kernel, Syscall::AllocRegion, [0, 0x3000, PAGE_SIZE, rw(), 0, 0]), Some(0));
    assert_eq!(call(&mut kernel, Syscall::UnmapRegion, [0, 0x1000, 4 * PAGE_SIZE, 0, 0, 0]), Some(0));
    assert!(kernel.lookup(root, 0x3000).is_none());
    assert_eq!(kernel.live_frames(), 0);
    assert_eq!(kernel.memory().free_frames(), 64);
}

#[test]
fn map_physical_region_is_for_drivers_only() {
    let pool = || FramePool::new(16).with_device(DEVICE_BASE, 2);
    let (mut user, _, _) = boot_with(pool(), EnvType::User);
    let args = [DEVICE_BASE, 0, 0x8000, PAGE_SIZE, rw(), 0];
    assert_eq!(call(&mut user, Syscall::MapPhysicalRegion, args), err(ErrorCode::BadEnvironment));
    // The driver check comes before argument decoding.
    let share = (Prot::RW | Prot::SHARE).bits() as usize;
    assert_eq!(call(&mut user, Syscall::MapPhysicalRegion, [DEVICE_BASE, 0, 0x8000, PAGE_SIZE, share, 0]), err(ErrorCode::BadEnvironment));
    assert_eq!(call(&mut user, Syscall::MapPhysicalRegion, [DEVICE_BASE + 1, 0, 0x8001, PAGE_SIZE, rw(), 0]), err(ErrorCode::BadEnvironment));

    let (mut driver, id, _) = boot_with(pool(), EnvType::Driver);
    assert_eq!(call(&mut driver, Syscall::MapPhysicalRegion, args), Some(0));
    driver.write_user(id, 0x8000, b"mmio").unwrap();
    let pa = axon::types::PhysAddr::new(DEVICE_BASE);
    assert_eq!(&driver.memory().frame(pa).unwrap()[..4], b"mmio");
    assert_eq!(driver.page_refs(id, 0x8000), Some(1));

    // Already mapped, outside the window, and share bits.
    assert_eq!(call(&mut driver, Syscall::MapPhysicalRegion, args), err(ErrorCode::InvalidArgument));
    let outside = [DEVICE_BASE + 2 * PAGE_SIZE, 0, 0x9000, PAGE_SIZE, rw(), 0];
    assert_eq!(call(&mut driver, Syscall::MapPhysicalRegion, outside), err(ErrorCode::NoMemory));
    let shared = [DEVICE_BASE, 0, 0x9000, PAGE_SIZE, (Prot::RW | Prot::SHARE).bits() as usize, 0];
    assert_eq!(call(&mut driver, Syscall::MapPhysicalRegion, shared), err(ErrorCode::InvalidArgument));

    // Unmapping a device page never hands it to the frame allocator.
    assert_eq!(call(&mut driver, Syscall::UnmapRegion, [0, 0x8000, PAGE_SIZE, 0, 0, 0]), Some(0));
    assert_eq!(driver.memory().free_frames(), 16);
}

#[test]
fn pgfault_upcall_must_be_user_address() {
    let (mut kernel, root, _) = boot();
    assert_eq!(call(&mut kernel, Syscall::EnvSetPgfaultUpcall, [0, MAX_USER_ADDRESS, 0, 0, 0, 0]), err(ErrorCode::InvalidArgument));
    assert_eq!(call(&mut kernel, Syscall::EnvSetPgfaultUpcall, [0, 0x40_0000, 0, 0, 0, 0]), Some(0));
    assert!(kernel.env(root).unwrap().pgfault_upcall().is_some());
    assert_eq!(call(&mut kernel, Syscall::EnvSetPgfaultUpcall, [0, 0, 0, 0, 0, 0]), Some(0));
    assert!(kernel.env(root).unwrap().pgfault_upcall().is_none());
}
