//! Physical memory store and the page-indexed router that mediates every
//! read and write a CPU core or debug tool issues (spec §4.2).
//!
//! Translation (VA → PA or Device Page ID) lives in [`crate::mmu`]; this
//! module owns the *physical* backing — boot ROM, RAM, and the high-ROM
//! alias — and the bookkeeping a debug observer uses to enumerate it.

use crate::config::{MachineConfig, BOOT_ROM_BASE, BOOT_ROM_SIZE, DEFAULT_RAM_BASE, PAGE_SIZE, HIGH_ROM_ALIAS_BASE};
use crate::errors::{Fault, PermKind};
use tracing::trace;

/// Why an address was accessed, per spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
    /// Instruction fetch. Requires `X`; requires `X=1` when `NXE=1`.
    ExecFetch,
    /// CPU-originated read. Full permission pipeline, live device side effects.
    DataRead,
    /// CPU-originated write. Full permission pipeline, live device side effects.
    DataWrite,
    /// Tooling read. Bypasses permission/privilege checks. Never toggles
    /// device side effects.
    DebugRead,
    /// Tooling write. May bypass `W`, but still faults on an unmapped page.
    DebugWrite,
}

impl AccessIntent {
    pub fn is_write(&self) -> bool {
        matches!(self, AccessIntent::DataWrite | AccessIntent::DebugWrite)
    }

    pub fn is_debug(&self) -> bool {
        matches!(self, AccessIntent::DebugRead | AccessIntent::DebugWrite)
    }
}

/// What kind of physical backing a region provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionTag {
    Ram,
    Rom,
    Io,
    Unmapped,
}

bitflags::bitflags! {
    /// Permission bits a page grants, independent of PTE storage format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u8 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const EXEC = 0b0100;
        const USER = 0b1000;
    }
}

bitflags::bitflags! {
    /// What a target can do beyond the minimum byte-at-a-time contract.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const SUPPORTS_PEEK = 0b001;
        const SUPPORTS_POKE = 0b010;
        const SUPPORTS_WIDE = 0b100;
    }
}

/// A contiguous span of physical memory.
struct PhysRegion {
    tag: RegionTag,
    base: u32,
    data: Vec<u8>,
    writable: bool,
}

impl PhysRegion {
    fn contains(&self, pa: u32) -> bool {
        let len = self.data.len() as u64;
        let pa = pa as u64;
        let base = self.base as u64;
        pa >= base && pa < base + len
    }
}

/// A coalesced `(physical_base, length, tag, permissions)` description used
/// by the debug "enumerate regions" operation (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub physical_base: u32,
    pub length: u32,
    pub tag: RegionTag,
    pub writable: bool,
}

/// Physical memory store plus the fixed physical region map (spec §6's
/// baseline physical memory map).
pub struct Bus {
    regions: Vec<PhysRegion>,
}

impl Bus {
    /// Builds the physical memory map from a [`MachineConfig`]: boot ROM,
    /// main RAM, and the high-ROM alias (spec §6).
    pub fn new(config: &MachineConfig) -> Self {
        let mut boot_rom = vec![0xFFu8; BOOT_ROM_SIZE as usize];
        let copy_len = config.boot_rom.len().min(BOOT_ROM_SIZE as usize);
        boot_rom[..copy_len].copy_from_slice(&config.boot_rom[..copy_len]);

        let ram = vec![0u8; config.ram_size as usize];

        let regions = vec![
            PhysRegion {
                tag: RegionTag::Rom,
                base: BOOT_ROM_BASE,
                data: boot_rom.clone(),
                writable: false,
            },
            PhysRegion {
                tag: RegionTag::Ram,
                base: DEFAULT_RAM_BASE,
                data: ram,
                writable: true,
            },
            PhysRegion {
                tag: RegionTag::Rom,
                base: HIGH_ROM_ALIAS_BASE,
                data: boot_rom,
                writable: false,
            },
        ];

        Self { regions }
    }

    fn find_region(&self, pa: u32) -> Option<&PhysRegion> {
        self.regions.iter().find(|r| r.contains(pa))
    }

    fn find_region_mut(&mut self, pa: u32) -> Option<&mut PhysRegion> {
        self.regions.iter_mut().find(|r| r.contains(pa))
    }

    /// Raw physical byte read, bypassing all permission logic. Used by the
    /// MMU to fetch page table entries (walks are always physical, never
    /// translated — spec §3) and by [`Self::read_phys`] internally.
    pub fn read_phys_byte(&self, pa: u32) -> u8 {
        match self.find_region(pa) {
            Some(region) => region.data[(pa - region.base) as usize],
            None => 0xFF,
        }
    }

    /// Raw physical write. Silently drops writes into read-only or unmapped
    /// regions; callers that need fault signalling use [`Self::access`].
    pub fn write_phys_byte(&mut self, pa: u32, value: u8) {
        if let Some(region) = self.find_region_mut(pa) {
            if region.writable {
                region.data[(pa - region.base) as usize] = value;
            }
        }
    }

    pub fn read_phys_u32(&self, pa: u32) -> u32 {
        u32::from_le_bytes([
            self.read_phys_byte(pa),
            self.read_phys_byte(pa + 1),
            self.read_phys_byte(pa + 2),
            self.read_phys_byte(pa + 3),
        ])
    }

    pub fn write_phys_u32(&mut self, pa: u32, value: u32) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.write_phys_byte(pa + i as u32, *byte);
        }
    }

    /// Accesses a physical address after translation/permission checks have
    /// already happened (the MMU's job). Returns `NotPresent` when the
    /// address falls in no region, unless the access is a [`AccessIntent::
    /// DebugRead`] (which reports `0xFF` instead) — a debug write still
    /// faults on an unmapped page.
    pub fn access_phys(&mut self, pa: u32, intent: AccessIntent, value: Option<u8>) -> Result<u8, Fault> {
        let region = self.find_region(pa);
        let region = match region {
            Some(r) => r,
            None => {
                if matches!(intent, AccessIntent::DebugRead) {
                    return Ok(0xFF);
                }
                return Err(Fault::NotPresent { va: pa });
            }
        };
        if intent.is_write() {
            if !region.writable && !intent.is_debug() {
                return Err(Fault::PermissionDenied {
                    va: pa,
                    kind: PermKind::Write,
                });
            }
            let v = value.expect("write access must carry a value");
            trace!(pa, v, "bus physical write");
            self.write_phys_byte(pa, v);
            Ok(v)
        } else {
            let v = self.read_phys_byte(pa);
            trace!(pa, v, ?intent, "bus physical read");
            Ok(v)
        }
    }

    /// Coalesces the fixed physical regions into descriptors for the debug
    /// "enumerate regions" operation (spec §6).
    pub fn enumerate_regions(&self) -> Vec<RegionDescriptor> {
        self.regions
            .iter()
            .map(|r| RegionDescriptor {
                physical_base: r.base,
                length: r.data.len() as u32,
                tag: r.tag,
                writable: r.writable,
            })
            .collect()
    }
}

pub const fn page_of(addr: u32) -> u32 {
    addr / PAGE_SIZE
}

pub const fn offset_of(addr: u32) -> u32 {
    addr % PAGE_SIZE
}
