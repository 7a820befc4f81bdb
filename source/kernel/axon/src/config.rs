// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-time kernel configuration.

use core::fmt;

use axon_abi::MAX_ENVS;
use log::LevelFilter;

/// Tunables fixed when the kernel is constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of environment slots; at most [`MAX_ENVS`].
    pub max_envs: usize,
    /// Log environment creation and destruction at info level.
    pub trace_envs: bool,
    /// Log every dispatched syscall at trace level.
    pub trace_syscalls: bool,
    /// Maximum level recorded by the kernel log.
    pub log_level: LevelFilter,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        max_envs: MAX_ENVS,
        trace_envs: cfg!(feature = "trace_envs"),
        trace_syscalls: cfg!(feature = "trace_syscalls"),
        log_level: LevelFilter::Info,
    };

    pub const fn new() -> Self {
        Self::DEFAULT
    }

    pub const fn with_max_envs(mut self, max_envs: usize) -> Self {
        self.max_envs = max_envs;
        self
    }

    pub const fn with_trace_envs(mut self, on: bool) -> Self {
        self.trace_envs = on;
        self
    }

    pub const fn with_trace_syscalls(mut self, on: bool) -> Self {
        self.trace_syscalls = on;
        self
    }

    pub const fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_envs == 0 {
            return Err(ConfigError::NoEnvironments);
        }
        if self.max_envs > MAX_ENVS {
            return Err(ConfigError::TooManyEnvironments { requested: self.max_envs, limit: MAX_ENVS });
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Rejected configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_envs` was zero.
    NoEnvironments,
    /// `max_envs` exceeds what an envid can address.
    TooManyEnvironments { requested: usize, limit: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEnvironments => f.write_str("registry needs at least one slot"),
            Self::TooManyEnvironments { requested, limit } => {
                write!(f, "registry of {requested} slots exceeds envid limit {limit}")
            }
        }
    }
}
