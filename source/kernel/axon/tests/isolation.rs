// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Isolation between environments
//! TEST_SCOPE: stale envids, ancestry checks, rights never grow, reclamation by reference count

use axon::abi::layout::PAGE_SIZE;
use axon::abi::{EnvId, EnvStatus, ErrorCode, Prot, Syscall};
use axon::diag;
use axon::env::EnvType;
use axon::hal::host::{BufferConsole, FramePool};
use axon::hal::PhysMemory;
use axon::{Kernel, KernelConfig, Machine};

const FRAMES: usize = 64;

fn boot(config: KernelConfig) -> (Kernel, EnvId) {
    let (console, _tap) = BufferConsole::new();
    let mut kernel = Kernel::new(config, Machine::new(FramePool::new(FRAMES), console)).unwrap();
    let root = kernel.create_env(EnvType::User, None).unwrap();
    kernel.run(root).unwrap();
    (kernel, root)
}

fn call(kernel: &mut Kernel, as_env: EnvId, which: Syscall, args: [usize; 6]) -> Option<isize> {
    kernel.run(as_env).unwrap();
    kernel.syscall(which.number(), args)
}

fn fork(kernel: &mut Kernel, parent: EnvId) -> EnvId {
    let word = call(kernel, parent, Syscall::Exofork, [0; 6]).unwrap();
    let child = EnvId::from_raw(word as u32);
    let runnable = EnvStatus::Runnable as usize;
    assert_eq!(call(kernel, parent, Syscall::EnvSetStatus, [child.as_raw() as usize, runnable, 0, 0, 0, 0]), Some(0));
    child
}

fn raw(id: EnvId) -> usize {
    id.as_raw() as usize
}

const BAD_ENV: Option<isize> = Some(ErrorCode::BadEnvironment.as_word());

#[test]
fn stale_envid_never_reaches_the_new_occupant() {
    let (mut kernel, root) = boot(KernelConfig::new().with_max_envs(4));
    let old = fork(&mut kernel, root);
    assert_eq!(call(&mut kernel, root, Syscall::EnvDestroy, [raw(old), 0, 0, 0, 0, 0]), Some(0));
    let new = fork(&mut kernel, root);
    assert_eq!(new.index(), old.index());
    assert_ne!(new, old);

    let rw = Prot::RW.bits() as usize;
    assert_eq!(call(&mut kernel, root, Syscall::AllocRegion, [raw(old), 0x1000, PAGE_SIZE, rw, 0, 0]), BAD_ENV);
    assert!(kernel.lookup(new, 0x1000).is_none());
    assert_eq!(call(&mut kernel, root, Syscall::EnvDestroy, [raw(old), 0, 0, 0, 0, 0]), BAD_ENV);
    assert!(kernel.env(new).is_some());
}

#[test]
fn slots_run_out() {
    let (mut kernel, root) = boot(KernelConfig::new().with_max_envs(2));
    fork(&mut kernel, root);
    assert_eq!(call(&mut kernel, root, Syscall::Exofork, [0; 6]), Some(ErrorCode::NoFreeEnvironment.as_word()));
}

#[test]
fn only_ancestors_may_act_on_an_environment() {
    let (mut kernel, root) = boot(KernelConfig::new().with_max_envs(8));
    let a = fork(&mut kernel, root);
    let b = fork(&mut kernel, root);
    let grandchild = fork(&mut kernel, a);
    let rw = Prot::RW.bits() as usize;

    // Siblings cannot touch each other, children cannot touch parents.
    assert_eq!(call(&mut kernel, a, Syscall::AllocRegion, [raw(b), 0x1000, PAGE_SIZE, rw, 0, 0]), BAD_ENV);
    assert_eq!(call(&mut kernel, a, Syscall::EnvDestroy, [raw(root), 0, 0, 0, 0, 0]), BAD_ENV);
    assert_eq!(call(&mut kernel, b, Syscall::EnvSetStatus, [raw(grandchild), 3, 0, 0, 0, 0]), BAD_ENV);

    // The root reaches its grandchild through the parent chain.
    assert_eq!(call(&mut kernel, root, Syscall::AllocRegion, [raw(grandchild), 0x1000, PAGE_SIZE, rw, 0, 0]), Some(0));
    assert!(kernel.lookup(grandchild, 0x1000).is_some());

    // IPC needs no relationship.
    assert_eq!(call(&mut kernel, b, Syscall::IpcTrySend, [raw(grandchild), 1, usize::MAX, 0, 0, 0]), Some(ErrorCode::IpcNotReceiving.as_word()));
}

#[test]
fn write_access_is_never_gained() {
    let (mut kernel, root) = boot(KernelConfig::new().with_max_envs(4));
    let child = fork(&mut kernel, root);
    let read = Prot::READ.bits() as usize;
    let rw = Prot::RW.bits() as usize;
    assert_eq!(call(&mut kernel, root, Syscall::AllocRegion, [0, 0x1000, PAGE_SIZE, read, 0, 0]), Some(0));

    let gain = [0, 0x1000, raw(child), 0x4000, PAGE_SIZE, rw];
    assert_eq!(call(&mut kernel, root, Syscall::MapRegion, gain), Some(ErrorCode::InvalidArgument.as_word()));
    assert!(kernel.lookup(child, 0x4000).is_none());
    assert_eq!(kernel.page_refs(root, 0x1000), Some(1));

    let keep = [0, 0x1000, raw(child), 0x4000, PAGE_SIZE, read];
    assert_eq!(call(&mut kernel, root, Syscall::MapRegion, keep), Some(0));
    assert!(kernel.write_user(child, 0x4000, b"x").is_err());
    assert!(!kernel.lookup(child, 0x4000).unwrap().is_shared());

    // Share marks the copy but grants nothing beyond the source's access.
    let shared = [0, 0x1000, raw(child), 0x5000, PAGE_SIZE, (Prot::READ | Prot::SHARE).bits() as usize];
    assert_eq!(call(&mut kernel, root, Syscall::MapRegion, shared), Some(0));
    let pte = kernel.lookup(child, 0x5000).unwrap();
    assert!(pte.is_shared() && !pte.is_writable());
}

#[test]
fn frames_are_reclaimed_when_the_last_mapping_goes() {
    let (mut kernel, root) = boot(KernelConfig::new().with_max_envs(4));
    let child = fork(&mut kernel, root);
    let rw = Prot::RW.bits() as usize;
    assert_eq!(call(&mut kernel, root, Syscall::AllocRegion, [0, 0x1000, 2 * PAGE_SIZE, rw, 0, 0]), Some(0));
    assert_eq!(call(&mut kernel, root, Syscall::MapRegion, [0, 0x1000, raw(child), 0x1000, 2 * PAGE_SIZE, rw]), Some(0));
    assert_eq!(kernel.page_refs(child, 0x2000), Some(2));

    kernel.write_user(child, 0x1000, b"shared").unwrap();
    let mut buf = [0u8; 6];
    kernel.read_user(root, 0x1000, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");

    assert_eq!(call(&mut kernel, root, Syscall::UnmapRegion, [0, 0x1000, 2 * PAGE_SIZE, 0, 0, 0]), Some(0));
    assert_eq!(kernel.env(root).unwrap().space().table_pages(), 0);
    assert_eq!(kernel.env(child).unwrap().space().table_pages(), 1);
    assert_eq!(kernel.page_refs(child, 0x1000), Some(1));
    assert_eq!(kernel.live_frames(), 2);

    assert_eq!(call(&mut kernel, root, Syscall::EnvDestroy, [raw(child), 0, 0, 0, 0, 0]), Some(0));
    assert_eq!(kernel.live_frames(), 0);
    assert_eq!(kernel.memory().free_frames(), FRAMES);
}

#[test]
fn destroying_a_receiver_cancels_its_receive() {
    let (mut kernel, root) = boot(KernelConfig::new().with_max_envs(4));
    let child = fork(&mut kernel, root);
    assert_eq!(call(&mut kernel, child, Syscall::IpcRecv, [usize::MAX, 0, 0, 0, 0, 0]), Some(0));
    assert_eq!(call(&mut kernel, root, Syscall::EnvDestroy, [raw(child), 0, 0, 0, 0, 0]), Some(0));
    assert_eq!(call(&mut kernel, root, Syscall::IpcTrySend, [raw(child), 1, usize::MAX, 0, 0, 0]), BAD_ENV);

    // The slot's next occupant starts with no pending receive.
    let reused = fork(&mut kernel, root);
    assert_eq!(reused.index(), child.index());
    assert_ne!(reused, child);
    assert!(!kernel.env(reused).unwrap().mailbox().is_receiving());
    let not_receiving = Some(ErrorCode::IpcNotReceiving.as_word());
    assert_eq!(call(&mut kernel, root, Syscall::IpcTrySend, [raw(reused), 1, usize::MAX, 0, 0, 0]), not_receiving);
    assert_eq!(kernel.live_envs(), 2);
}

#[test]
fn self_destroy_writes_no_result_and_is_traced() {
    let (mut kernel, root) = boot(KernelConfig::new().with_max_envs(4).with_trace_envs(true));
    let child = fork(&mut kernel, root);
    assert_eq!(call(&mut kernel, child, Syscall::EnvDestroy, [0; 6]), None);
    assert!(kernel.env(child).is_none());
    assert_eq!(kernel.current(), Some(root));

    let lines = diag::log::lines();
    let exit = format!("[{}] exiting gracefully", child);
    let freed = format!("[{}] free env {}", child, child);
    let created = format!("[{}] new env {}", root, child);
    for needle in [exit, freed, created] {
        assert!(lines.iter().any(|line| line.contains(&needle)), "missing {needle:?}");
    }
}
