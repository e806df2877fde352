//! Unified address model over the taint-addressable storage spaces.
//!
//! A byte of taint can live in guest RAM, in one of the IR engine's scratch
//! registers, in a guest general-purpose register, in one of the special
//! guest slots (flags, hidden state) or in the helper return-value slot.
//! [`TaintAddr`] names exactly one such byte. [`TaintRegion`] is the tag the
//! shadow side attaches to a change event so that a raw storage offset can
//! be decoded back into a [`TaintAddr`] without comparing storage pointers.

use core::fmt::{self, Display, Formatter};

use crate::{GuestPhysAddr, GuestRegIdx};

/// Width in bytes of one IR scratch register slot.
pub const TEMP_REG_SIZE: u64 = 16;
/// Width in bytes of one guest general-purpose register.
pub const GUEST_REG_SIZE: u64 = 8;

/// The storage region a shadow change event originates from.
///
/// `Io`, `Ports` and `Hd` exist in the shadow engine but are internal to the
/// analysis; events on them have no guest-visible address and are dropped by
/// the notification bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaintRegion {
    Ram,
    TempRegs,
    GuestRegs,
    Special,
    Ret,
    Io,
    Ports,
    Hd,
}

/// One taint-addressable byte, tagged with the space it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaintAddr {
    /// A byte of guest physical RAM.
    Ram(GuestPhysAddr),
    /// A byte of an IR scratch register.
    TempReg { idx: GuestRegIdx, off: u64 },
    /// A byte of a guest general-purpose register.
    GuestReg { num: GuestRegIdx, off: u64 },
    /// A special guest slot (flags and other hidden per-cpu state).
    Special(u64),
    /// A byte of the helper return-value slot.
    Ret(u64),
}

impl TaintAddr {
    /// Address a byte of an IR scratch register.
    ///
    /// # Panics
    ///
    /// Panics if `off` is not within the scratch register width.
    #[must_use]
    pub fn temp_reg(idx: GuestRegIdx, off: u64) -> Self {
        assert!(off < TEMP_REG_SIZE, "offset {off} out of scratch register");
        TaintAddr::TempReg { idx, off }
    }

    /// Address a byte of a guest general-purpose register.
    ///
    /// # Panics
    ///
    /// Panics if `off` is not within the guest register width.
    #[must_use]
    pub fn guest_reg(num: GuestRegIdx, off: u64) -> Self {
        assert!(off < GUEST_REG_SIZE, "offset {off} out of guest register");
        TaintAddr::GuestReg { num, off }
    }

    /// Decode a raw `(region, offset)` pair reported by the shadow side back
    /// into an address. Returns `None` for regions with no guest-visible
    /// address.
    #[must_use]
    pub fn from_region_offset(region: TaintRegion, raw_off: u64) -> Option<Self> {
        match region {
            TaintRegion::Ram => Some(TaintAddr::Ram(raw_off)),
            TaintRegion::TempRegs => Some(TaintAddr::TempReg {
                idx: raw_off / TEMP_REG_SIZE,
                off: raw_off % TEMP_REG_SIZE,
            }),
            TaintRegion::GuestRegs => Some(TaintAddr::GuestReg {
                num: raw_off / GUEST_REG_SIZE,
                off: raw_off % GUEST_REG_SIZE,
            }),
            TaintRegion::Special => Some(TaintAddr::Special(raw_off)),
            TaintRegion::Ret => Some(TaintAddr::Ret(raw_off)),
            TaintRegion::Io | TaintRegion::Ports | TaintRegion::Hd => None,
        }
    }

    /// The region this address belongs to.
    #[must_use]
    pub fn region(&self) -> TaintRegion {
        match self {
            TaintAddr::Ram(_) => TaintRegion::Ram,
            TaintAddr::TempReg { .. } => TaintRegion::TempRegs,
            TaintAddr::GuestReg { .. } => TaintRegion::GuestRegs,
            TaintAddr::Special(_) => TaintRegion::Special,
            TaintAddr::Ret(_) => TaintRegion::Ret,
        }
    }

    /// The raw byte offset of this address within its region.
    #[must_use]
    pub fn raw_offset(&self) -> u64 {
        match *self {
            TaintAddr::Ram(pa) => pa,
            TaintAddr::TempReg { idx, off } => idx * TEMP_REG_SIZE + off,
            TaintAddr::GuestReg { num, off } => num * GUEST_REG_SIZE + off,
            TaintAddr::Special(id) => id,
            TaintAddr::Ret(off) => off,
        }
    }
}

impl Display for TaintAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TaintAddr::Ram(pa) => write!(f, "ram[{pa:#x}]"),
            TaintAddr::TempReg { idx, off } => write!(f, "tmp[{idx}+{off}]"),
            TaintAddr::GuestReg { num, off } => write!(f, "reg[{num}+{off}]"),
            TaintAddr::Special(id) => write!(f, "spec[{id}]"),
            TaintAddr::Ret(off) => write!(f, "ret[{off}]"),
        }
    }
}
