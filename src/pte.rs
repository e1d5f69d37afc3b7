//! Bit-packed hardware-register types: the page table entry format and the
//! `CR0` control register, per spec §6's "Page table entry format" and
//! §3's system register table.

use modular_bitfield::prelude::*;

/// A 32-bit page table entry, little-endian, matching spec §6 exactly:
/// bit 0 `P`, 1 `R`, 2 `W`, 3 `X`, 4 `U`, 5 `A`, 6 `D`, 7 `G`, 8 `DEV`,
/// bits 9-11 reserved (must be zero), bits 12-31 PFN or Device Page ID.
#[bitfield(bits = 32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Pte {
    pub present: bool,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub user: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub global: bool,
    pub dev: bool,
    pub reserved: B3,
    pub pfn: B20,
}

impl Pte {
    /// Reserved bits 9-11, per spec §9's Design Note: a walk over an entry
    /// with any of these set must raise `Reserved`, not silently mask them.
    pub fn has_disallowed_reserved_bits(&self) -> bool {
        self.reserved() != 0
    }

    /// Interprets `pfn()` as a physical frame number, producing the base
    /// physical address of the frame (`pfn << 12`).
    pub fn frame_base(&self) -> u32 {
        self.pfn() << 12
    }

    /// Interprets `pfn()` as a Device Page ID `(class:4, instance:8, page:8)`.
    pub fn device_page_id(&self) -> DevicePageId {
        DevicePageId::from_bits(self.pfn())
    }
}

/// `(class:4, instance:8, page:8)` identifying a device-page handler,
/// per spec §3/§6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePageId {
    pub class: u8,
    pub instance: u8,
    pub page: u8,
}

impl DevicePageId {
    pub const RESERVED_CLASS: u8 = 0;
    pub const APPLE_II_IO_CLASS: u8 = 1;

    pub fn new(class: u8, instance: u8, page: u8) -> Self {
        debug_assert!(class <= 0xF, "class must fit in 4 bits");
        Self {
            class,
            instance,
            page,
        }
    }

    /// Decodes the 20-bit packed form stored in a DEV PTE's `pfn` field.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            class: ((bits >> 16) & 0xF) as u8,
            instance: ((bits >> 8) & 0xFF) as u8,
            page: (bits & 0xFF) as u8,
        }
    }

    /// Encodes back to the 20-bit packed form.
    pub fn to_bits(self) -> u32 {
        ((self.class as u32 & 0xF) << 16) | ((self.instance as u32) << 8) | (self.page as u32)
    }
}

/// `CR0`: the MMU/protection control register named in spec §3.
#[bitfield(bits = 32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cr0 {
    /// Paging enable. When 0, translation is identity and protection is
    /// bypassed entirely.
    pub pg: bool,
    /// User-mode MMU enforcement toggle, reserved for future use; the
    /// substrate always enforces U regardless of this bit's value.
    pub um: bool,
    /// No-execute enable. When 1, instruction fetch requires `PTE.X=1`.
    pub nxe: bool,
    #[skip]
    __: B29,
}
