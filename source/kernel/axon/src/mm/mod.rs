// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Region mapping engine and the user address-space structures it drives
//! OWNERS: @kernel-mm-team
//! PUBLIC API: RegionEngine, Spaces, AddressSpace, PageTable, PageFlags, RegionPerm, AllocRequest
//! DEPENDS_ON: hal::PhysMemory, types::{VirtAddr, PageRange}
//! INVARIANTS: Only RegionEngine changes page reference counts; a frame is freed exactly when
//!             its count reaches zero; every operation validates before it mutates

pub mod address_space;
pub mod page_table;
pub mod perm;
mod region;

#[cfg(test)]
mod tests_prop;

use core::fmt;

pub use address_space::AddressSpace;
pub use page_table::{Backing, MapError, PageFlags, PageTable, Pte};
pub use perm::{AllocFlavor, AllocRequest, RegionPerm};
pub use region::{RegionEngine, Spaces};

/// Errors reported by the region mapping engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionError {
    /// Address or length misaligned, or range reaches the user ceiling.
    OutOfRange,
    /// Permission word carries bits this path does not accept.
    BadPermission,
    /// A source page is not mapped.
    NotMapped,
    /// Write access requested on a page that is read-only at the source.
    PermissionDenied,
    /// Destination already mapped where a fresh mapping is required.
    Occupied,
    /// No frame for a data page or leaf table.
    NoMemory,
    /// Physical range is not inside a device window.
    NotDevice,
    /// User access to memory that is not mapped with the needed rights.
    Fault,
}

impl From<MapError> for RegionError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::NoMemory => Self::NoMemory,
        }
    }
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
