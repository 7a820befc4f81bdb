// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boundary decoding of the user permission word.
//!
//! The raw [`Prot`] word overloads access bits, region behaviour and the allocation
//! flavour. Each syscall path decodes it once into the typed form it accepts and
//! rejects every bit it does not.

use axon_abi::Prot;

use super::page_table::PageFlags;
use super::RegionError;

/// Fill pattern for freshly materialised anonymous pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocFlavor {
    Zero,
    One,
}

impl AllocFlavor {
    pub const fn fill_byte(self) -> u8 {
        match self {
            AllocFlavor::Zero => 0x00,
            AllocFlavor::One => 0xff,
        }
    }
}

/// Access and behaviour bits for an installed mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionPerm {
    pub write: bool,
    pub exec: bool,
    pub share: bool,
    pub combine: bool,
}

impl RegionPerm {
    /// Permissions accepted by `copy_region` and IPC page transfer.
    pub fn for_copy(raw: u32) -> Result<Self, RegionError> {
        let prot = known(raw)?;
        if prot.intersects(Prot::LAZY | Prot::ALLOC_ZERO | Prot::ALLOC_ONE) {
            return Err(RegionError::BadPermission);
        }
        Ok(Self::from_prot(prot))
    }

    /// Permissions accepted by `map_physical_region`.
    pub fn for_physical(raw: u32) -> Result<Self, RegionError> {
        let prot = known(raw)?;
        if prot.intersects(
            Prot::SHARE | Prot::COMBINE | Prot::LAZY | Prot::ALLOC_ZERO | Prot::ALLOC_ONE,
        ) {
            return Err(RegionError::BadPermission);
        }
        Ok(Self::from_prot(prot))
    }

    fn from_prot(prot: Prot) -> Self {
        Self {
            write: prot.contains(Prot::WRITE),
            exec: prot.contains(Prot::EXEC),
            share: prot.contains(Prot::SHARE),
            combine: prot.contains(Prot::COMBINE),
        }
    }

    /// Access bits only.
    pub fn access(self) -> PageFlags {
        let mut flags = PageFlags::READ;
        if self.write {
            flags |= PageFlags::WRITE;
        }
        if self.exec {
            flags |= PageFlags::EXECUTE;
        }
        flags
    }

    /// Complete leaf flags for a user mapping.
    pub fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::VALID | PageFlags::USER | self.access();
        if self.share {
            flags |= PageFlags::SHARED;
        }
        flags
    }
}

/// Decoded `alloc_region` permission word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocRequest {
    pub perm: RegionPerm,
    pub lazy: bool,
    pub flavor: AllocFlavor,
}

impl AllocRequest {
    /// Exactly one flavour results: ALLOC_ONE wins over ALLOC_ZERO, zero-fill otherwise.
    pub fn decode(raw: u32) -> Result<Self, RegionError> {
        let prot = known(raw)?;
        let flavor = if prot.contains(Prot::ALLOC_ONE) { AllocFlavor::One } else { AllocFlavor::Zero };
        Ok(Self {
            perm: RegionPerm::from_prot(prot),
            lazy: prot.contains(Prot::LAZY),
            flavor,
        })
    }
}

fn known(raw: u32) -> Result<Prot, RegionError> {
    Prot::from_bits(raw).ok_or(RegionError::BadPermission)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_flavor_defaults_to_zero_and_one_wins() {
        assert_eq!(AllocRequest::decode(Prot::WRITE.bits()).unwrap().flavor, AllocFlavor::Zero);
        let both = (Prot::ALLOC_ZERO | Prot::ALLOC_ONE).bits();
        assert_eq!(AllocRequest::decode(both).unwrap().flavor, AllocFlavor::One);
        assert!(AllocRequest::decode(Prot::LAZY.bits()).unwrap().lazy);
    }

    #[test]
    fn unknown_bits_are_rejected() {
        assert_eq!(AllocRequest::decode(1 << 30), Err(RegionError::BadPermission));
        assert_eq!(RegionPerm::for_copy(1 << 12), Err(RegionError::BadPermission));
    }

    #[test]
    fn copy_rejects_allocation_bits() {
        assert_eq!(RegionPerm::for_copy(Prot::LAZY.bits()), Err(RegionError::BadPermission));
        assert_eq!(RegionPerm::for_copy(Prot::ALLOC_ONE.bits()), Err(RegionError::BadPermission));
        let perm = RegionPerm::for_copy((Prot::RW | Prot::COMBINE).bits()).unwrap();
        assert!(perm.write && perm.combine && !perm.share);
    }

    #[test]
    fn physical_rejects_anonymous_behaviour_bits() {
        for bad in [Prot::SHARE, Prot::COMBINE, Prot::LAZY] {
            assert_eq!(RegionPerm::for_physical(bad.bits()), Err(RegionError::BadPermission));
        }
        let perm = RegionPerm::for_physical(Prot::RW.bits()).unwrap();
        assert_eq!(perm.page_flags(), PageFlags::VALID | PageFlags::USER | PageFlags::READ | PageFlags::WRITE);
    }
}
