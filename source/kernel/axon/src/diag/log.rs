// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Structured kernel log sink behind the `log` facade
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: init(level), lines(), drain(), format_line(level,target,args)
//! DEPENDS_ON: log, spin::Mutex
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; bounded ring (oldest dropped)

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{Arguments, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Number of lines retained before the oldest is dropped.
pub const RING_CAPACITY: usize = 512;

/// `log::Log` implementation recording `[LEVEL target] message` lines.
pub struct KernelLog {
    ring: Mutex<VecDeque<String>>,
}

static LOGGER: KernelLog = KernelLog::new();

impl KernelLog {
    const fn new() -> Self {
        Self { ring: Mutex::new(VecDeque::new()) }
    }

    fn push(&self, line: String) {
        let mut ring = self.ring.lock();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line);
    }
}

const fn level_enabled(level: Level) -> bool {
    match level {
        Level::Debug | Level::Trace => cfg!(debug_assertions),
        _ => true,
    }
}

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        level_enabled(metadata.level())
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.push(format_line(record.level(), record.target(), *record.args()));
    }

    fn flush(&self) {}
}

/// Formats a single log line.
pub fn format_line(level: Level, target: &str, args: Arguments<'_>) -> String {
    let mut line = String::new();
    let _ = write!(line, "[{} {}] ", level.as_str(), target);
    let _ = line.write_fmt(args);
    line
}

/// Installs the kernel log as the global logger and sets the level.
///
/// Safe to call repeatedly; only the level changes after the first call.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Snapshot of the retained lines, oldest first.
pub fn lines() -> Vec<String> {
    LOGGER.ring.lock().iter().cloned().collect()
}

/// Removes and returns the retained lines, oldest first.
pub fn drain() -> Vec<String> {
    LOGGER.ring.lock().drain(..).collect()
}
