//! `Machine`: owns the bus, device registry, CPU, and scheduler, and wires
//! them together into the single entry point a host embeds (spec §2/§6).
//!
//! Also hosts the boot handoff structure (spec §4.6/§6): the header plus
//! optional memory-map, command-line, and ROM-inventory tables that the
//! boot ROM places at `0x00040000` and that a kernel reads via `R0`.

use crate::bus::{AccessIntent, Bus, RegionDescriptor};
use crate::compat::{CompatWindow, CompatWindowManager};
use crate::cpu::{Cpu, StopReason};
use crate::devpage::{DeviceHandler, DeviceRegistry};
use crate::errors::{CoreError, Fault};
use crate::mmu::{self, Translation};
use crate::pte::DevicePageId;
use crate::scheduler::Scheduler;
use crate::MachineConfig;

/// `"658\0"`, little-endian, read back as the first header word.
pub const HANDOFF_MAGIC: u32 = 0x0038_3536;
pub const HANDOFF_VERSION: u32 = 1;
/// Seventeen `u32` words: see [`BootHandoff::HEADER_WORDS`].
pub const HANDOFF_HEADER_SIZE: u32 = 17 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRegionKind {
    Ram = 0,
    Rom = 1,
    Reserved = 2,
}

impl MemRegionKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(MemRegionKind::Ram),
            1 => Some(MemRegionKind::Rom),
            2 => Some(MemRegionKind::Reserved),
            _ => None,
        }
    }
}

/// One entry of the optional memory-map table (spec §3 supplement):
/// `(base, length, kind)`, 12 bytes, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegionEntry {
    pub base: u32,
    pub length: u32,
    pub kind: MemRegionKind,
}

const MEM_REGION_ENTRY_SIZE: u32 = 12;

/// One entry of the optional ROM-inventory table (spec §3 supplement):
/// `(compat_id, rom_name, phys_base, length)`. `rom_name` is a fixed
/// 16-byte NUL-padded ASCII field; two reserved bytes keep the entry
/// 4-byte aligned after the `u16` `compat_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomInventoryEntry {
    pub compat_id: u16,
    pub rom_name: [u8; 16],
    pub phys_base: u32,
    pub length: u32,
}

const ROM_INVENTORY_ENTRY_SIZE: u32 = 2 + 2 + 16 + 4 + 4;

/// The boot handoff structure (spec §4.6/§6). All offsets are relative to
/// the header's own physical start address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootHandoff {
    pub flags: u32,
    pub boot_rom_phys_base: u32,
    pub boot_rom_size: u32,
    pub ram_phys_base: u32,
    pub ram_size: u32,
    pub compat_id_default: u32,
    pub cmdline: Vec<u8>,
    pub mem_map: Vec<MemRegionEntry>,
    pub rom_inventory: Vec<RomInventoryEntry>,
}

impl BootHandoff {
    const HEADER_WORDS: u32 = 17;

    /// Serializes the handoff structure into the bus at `phys_base`,
    /// returning the total size written (the header's `total_size` field).
    pub fn write_to(&self, bus: &mut Bus, phys_base: u32) -> u32 {
        let header_size = Self::HEADER_WORDS * 4;
        let cmdline_offset = header_size;
        let cmdline_len = self.cmdline.len() as u32;
        let mem_map_offset = align4(cmdline_offset + cmdline_len);
        let mem_map_count = self.mem_map.len() as u32;
        let rom_inv_offset = mem_map_offset + mem_map_count * MEM_REGION_ENTRY_SIZE;
        let rom_inv_count = self.rom_inventory.len() as u32;
        let total_size = rom_inv_offset + rom_inv_count * ROM_INVENTORY_ENTRY_SIZE;

        let words: [u32; Self::HEADER_WORDS as usize] = [
            HANDOFF_MAGIC,
            HANDOFF_VERSION,
            total_size,
            self.flags,
            self.boot_rom_phys_base,
            self.boot_rom_size,
            self.ram_phys_base,
            self.ram_size,
            self.compat_id_default,
            cmdline_offset,
            cmdline_len,
            mem_map_offset,
            mem_map_count,
            rom_inv_offset,
            rom_inv_count,
            0,
            0,
        ];
        for (i, word) in words.iter().enumerate() {
            bus.write_phys_u32(phys_base + i as u32 * 4, *word);
        }

        for (i, byte) in self.cmdline.iter().enumerate() {
            bus.write_phys_byte(phys_base + cmdline_offset + i as u32, *byte);
        }

        for (i, entry) in self.mem_map.iter().enumerate() {
            let base = phys_base + mem_map_offset + i as u32 * MEM_REGION_ENTRY_SIZE;
            bus.write_phys_u32(base, entry.base);
            bus.write_phys_u32(base + 4, entry.length);
            bus.write_phys_u32(base + 8, entry.kind as u32);
        }

        for (i, entry) in self.rom_inventory.iter().enumerate() {
            let base = phys_base + rom_inv_offset + i as u32 * ROM_INVENTORY_ENTRY_SIZE;
            bus.write_phys_byte(base, (entry.compat_id & 0xFF) as u8);
            bus.write_phys_byte(base + 1, (entry.compat_id >> 8) as u8);
            for (j, byte) in entry.rom_name.iter().enumerate() {
                bus.write_phys_byte(base + 4 + j as u32, *byte);
            }
            bus.write_phys_u32(base + 20, entry.phys_base);
            bus.write_phys_u32(base + 24, entry.length);
        }

        total_size
    }

    /// Parses a handoff structure back out of the bus. Fails if the magic
    /// or version field does not check out.
    pub fn read_from(bus: &Bus, phys_base: u32) -> Result<Self, CoreError> {
        let magic = bus.read_phys_u32(phys_base);
        if magic != HANDOFF_MAGIC {
            return Err(CoreError::MalformedHandoff("magic mismatch"));
        }
        let version = bus.read_phys_u32(phys_base + 4);
        if version != HANDOFF_VERSION {
            return Err(CoreError::MalformedHandoff("unsupported version"));
        }

        let flags = bus.read_phys_u32(phys_base + 12);
        let boot_rom_phys_base = bus.read_phys_u32(phys_base + 16);
        let boot_rom_size = bus.read_phys_u32(phys_base + 20);
        let ram_phys_base = bus.read_phys_u32(phys_base + 24);
        let ram_size = bus.read_phys_u32(phys_base + 28);
        let compat_id_default = bus.read_phys_u32(phys_base + 32);
        let cmdline_offset = bus.read_phys_u32(phys_base + 36);
        let cmdline_len = bus.read_phys_u32(phys_base + 40);
        let mem_map_offset = bus.read_phys_u32(phys_base + 44);
        let mem_map_count = bus.read_phys_u32(phys_base + 48);
        let rom_inv_offset = bus.read_phys_u32(phys_base + 52);
        let rom_inv_count = bus.read_phys_u32(phys_base + 56);

        let mut cmdline = Vec::with_capacity(cmdline_len as usize);
        for i in 0..cmdline_len {
            cmdline.push(bus.read_phys_byte(phys_base + cmdline_offset + i));
        }

        let mut mem_map = Vec::with_capacity(mem_map_count as usize);
        for i in 0..mem_map_count {
            let base = phys_base + mem_map_offset + i * MEM_REGION_ENTRY_SIZE;
            let region_base = bus.read_phys_u32(base);
            let length = bus.read_phys_u32(base + 4);
            let kind_raw = bus.read_phys_u32(base + 8);
            let kind = MemRegionKind::from_u32(kind_raw)
                .ok_or(CoreError::MalformedHandoff("unrecognized memory region kind"))?;
            mem_map.push(MemRegionEntry {
                base: region_base,
                length,
                kind,
            });
        }

        let mut rom_inventory = Vec::with_capacity(rom_inv_count as usize);
        for i in 0..rom_inv_count {
            let base = phys_base + rom_inv_offset + i * ROM_INVENTORY_ENTRY_SIZE;
            let compat_id = bus.read_phys_byte(base) as u16 | ((bus.read_phys_byte(base + 1) as u16) << 8);
            let mut rom_name = [0u8; 16];
            for (j, slot) in rom_name.iter_mut().enumerate() {
                *slot = bus.read_phys_byte(base + 4 + j as u32);
            }
            let entry_phys_base = bus.read_phys_u32(base + 20);
            let length = bus.read_phys_u32(base + 24);
            rom_inventory.push(RomInventoryEntry {
                compat_id,
                rom_name,
                phys_base: entry_phys_base,
                length,
            });
        }

        Ok(Self {
            flags,
            boot_rom_phys_base,
            boot_rom_size,
            ram_phys_base,
            ram_size,
            compat_id_default,
            cmdline,
            mem_map,
            rom_inventory,
        })
    }
}

fn align4(value: u32) -> u32 {
    (value + 3) & !3
}

/// Orchestrates bus, device registry, CPU, and scheduler as a single unit.
pub struct Machine {
    pub bus: Bus,
    pub devices: DeviceRegistry,
    pub cpu: Cpu,
    pub scheduler: Scheduler,
    compat_windows: Vec<CompatWindow>,
}

impl Machine {
    pub fn new(config: &MachineConfig) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self {
            bus: Bus::new(config),
            devices: DeviceRegistry::new(),
            cpu: Cpu::new(),
            scheduler: Scheduler::new(),
            compat_windows: Vec::new(),
        })
    }

    pub fn hard_reset(&mut self) {
        self.cpu.reset(&self.bus, true);
    }

    pub fn soft_reset(&mut self) {
        self.cpu.reset(&self.bus, false);
    }

    pub fn step(&mut self) -> Result<u32, Fault> {
        self.cpu.step(&mut self.bus, &mut self.devices)
    }

    pub fn run(&mut self, instruction_limit: u64) -> StopReason {
        self.scheduler.run(&mut self.cpu, &mut self.bus, &mut self.devices, instruction_limit)
    }

    pub fn register_device(&mut self, id: DevicePageId, handler: Box<dyn DeviceHandler>) {
        self.devices.register(id, handler);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_compat_window(
        &mut self,
        l1_table_base: u32,
        l2_table_base: u32,
        compat_base: u32,
        compat_id: u16,
        guest_ram_phys_base: u32,
        rom_phys_base: u32,
        rom_len: u32,
        device_id: DevicePageId,
    ) -> Result<CompatWindow, CoreError> {
        let manager = CompatWindowManager::new();
        let window = manager.build_window(
            &mut self.bus,
            l1_table_base,
            l2_table_base,
            compat_base,
            compat_id,
            guest_ram_phys_base,
            rom_phys_base,
            rom_len,
            device_id,
        )?;
        self.compat_windows.push(window);
        Ok(window)
    }

    pub fn teardown_compat_window(&mut self, window: CompatWindow) {
        let manager = CompatWindowManager::new();
        manager.teardown(&mut self.bus, &window);
        self.compat_windows.retain(|w| *w != window);
    }

    /// Side-effect-free observational read (spec §6 debug observer
    /// interface): `(value, ok)`, `ok=false` on any fault.
    pub fn peek(&mut self, va: u32) -> (u8, bool) {
        let translation = mmu::translate(&self.bus, self.cpu.cr0, self.cpu.ptbr, va, self.cpu.privilege, AccessIntent::DebugRead);
        match translation {
            Ok(Translation::Physical(pa)) => match self.bus.access_phys(pa, AccessIntent::DebugRead, None) {
                Ok(v) => (v, true),
                Err(_) => (0xFF, false),
            },
            Ok(Translation::Device { id, offset }) => {
                match self.devices.dispatch(id, va, offset, AccessIntent::DebugRead, None) {
                    Ok(v) => (v, true),
                    Err(_) => (0xFF, false),
                }
            }
            Err(_) => (0xFF, false),
        }
    }

    /// Permission-relaxed observational write (spec §6 debug observer
    /// interface). Still faults when the target page is unmapped.
    pub fn poke(&mut self, va: u32, value: u8) -> Result<(), Fault> {
        let translation = mmu::translate(&self.bus, self.cpu.cr0, self.cpu.ptbr, va, self.cpu.privilege, AccessIntent::DebugWrite)?;
        match translation {
            Translation::Physical(pa) => {
                self.bus.access_phys(pa, AccessIntent::DebugWrite, Some(value))?;
            }
            Translation::Device { id, offset } => {
                self.devices.dispatch(id, va, offset, AccessIntent::DebugWrite, Some(value))?;
            }
        }
        Ok(())
    }

    pub fn enumerate_regions(&self) -> Vec<RegionDescriptor> {
        self.bus.enumerate_regions()
    }

    pub fn enumerate_soft_switches(&self) -> Vec<(&'static str, u32, bool, &'static str)> {
        self.devices.enumerate_soft_switches()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handoff() -> BootHandoff {
        BootHandoff {
            flags: 0,
            boot_rom_phys_base: 0,
            boot_rom_size: 256 * 1024,
            ram_phys_base: 0x0004_0000,
            ram_size: 4096 * 64,
            compat_id_default: 1,
            cmdline: b"boot=default".to_vec(),
            mem_map: vec![
                MemRegionEntry {
                    base: 0,
                    length: 256 * 1024,
                    kind: MemRegionKind::Rom,
                },
                MemRegionEntry {
                    base: 0x0004_0000,
                    length: 4096 * 64,
                    kind: MemRegionKind::Ram,
                },
            ],
            rom_inventory: vec![RomInventoryEntry {
                compat_id: 1,
                rom_name: {
                    let mut name = [0u8; 16];
                    name[..9].copy_from_slice(b"APPLE2E\0\0");
                    name
                },
                phys_base: 0,
                length: 0x4000,
            }],
        }
    }

    #[test]
    fn handoff_round_trips_through_bus() {
        let cfg = MachineConfig {
            ram_size: 4096 * 64,
            ..Default::default()
        };
        let mut bus = Bus::new(&cfg);
        let original = handoff();
        original.write_to(&mut bus, 0x0004_0000);
        let parsed = BootHandoff::read_from(&bus, 0x0004_0000).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let cfg = MachineConfig {
            ram_size: 4096 * 64,
            ..Default::default()
        };
        let mut bus = Bus::new(&cfg);
        bus.write_phys_u32(0x0004_0000, 0xDEAD_BEEF);
        let err = BootHandoff::read_from(&bus, 0x0004_0000).unwrap_err();
        assert_eq!(err, CoreError::MalformedHandoff("magic mismatch"));
    }

    #[test]
    fn peek_unmapped_reports_not_ok() {
        let cfg = MachineConfig::default();
        let mut machine = Machine::new(&cfg).unwrap();
        machine.hard_reset();
        let (value, ok) = machine.peek(0x8000_0000);
        assert_eq!(value, 0xFF);
        assert!(!ok);
    }

    /// A present, well-formed PTE chain whose leaf frame lands outside any
    /// backed physical region must still fault on `poke` (spec §4.2: a
    /// debug write "may bypass W permission... but must still produce a
    /// fault signal when the page is unmapped"), not silently no-op.
    #[test]
    fn poke_into_present_but_unbacked_frame_faults() {
        use crate::pte::Pte;

        let cfg = MachineConfig::default();
        let mut machine = Machine::new(&cfg).unwrap();
        machine.hard_reset();

        let ptbr = crate::config::DEFAULT_RAM_BASE;
        let l2_base = ptbr + 0x1000;

        let mut l1 = Pte::new();
        l1.set_present(true);
        l1.set_pfn(l2_base >> 12);
        machine
            .bus
            .write_phys_u32(ptbr, u32::from_le_bytes(l1.into_bytes()));

        let mut l2 = Pte::new();
        l2.set_present(true);
        l2.set_write(true);
        l2.set_user(true);
        // No region backs this frame: it falls in the gap between RAM and
        // the high ROM alias.
        l2.set_pfn(0x1000_0000 >> 12);
        machine
            .bus
            .write_phys_u32(l2_base, u32::from_le_bytes(l2.into_bytes()));

        machine.cpu.ptbr = ptbr;
        machine.cpu.cr0.set_pg(true);

        let err = machine.poke(0, 0x42).unwrap_err();
        assert_eq!(err, Fault::NotPresent { va: 0x1000_0000 });
    }

    /// Two compat guests backed by identically-numbered Device Page IDs see
    /// disjoint peripheral state, since each `Machine` owns its own
    /// `DeviceRegistry` rather than sharing one through global state.
    #[test]
    fn two_machines_with_same_device_page_id_have_disjoint_speaker_state() {
        use crate::compat::ApplePeripheralPage;

        let cfg = MachineConfig::default();
        let mut guest_a = Machine::new(&cfg).unwrap();
        let mut guest_b = Machine::new(&cfg).unwrap();
        let device_id = DevicePageId::new(DevicePageId::APPLE_II_IO_CLASS, 0, 0);
        guest_a.register_device(device_id, Box::new(ApplePeripheralPage::new()));
        guest_b.register_device(device_id, Box::new(ApplePeripheralPage::new()));

        // Two live toggles on A (ends false/0x00), one live toggle on B
        // (ends true/0xFF). If the two machines shared one global Speaker,
        // the three toggles would land on a single shared state instead.
        guest_a.devices.dispatch(device_id, 0xC030, 0x30, AccessIntent::DataRead, None).unwrap();
        guest_a.devices.dispatch(device_id, 0xC030, 0x30, AccessIntent::DataRead, None).unwrap();
        guest_b.devices.dispatch(device_id, 0xC030, 0x30, AccessIntent::DataRead, None).unwrap();

        let a_state = guest_a.devices.dispatch(device_id, 0xC030, 0x30, AccessIntent::DebugRead, None).unwrap();
        let b_state = guest_b.devices.dispatch(device_id, 0xC030, 0x30, AccessIntent::DebugRead, None).unwrap();
        assert_eq!(a_state, 0x00);
        assert_eq!(b_state, 0xFF);
    }

    #[test]
    fn mode_switch_sequence_accumulates_expected_cycles() {
        let cfg = MachineConfig {
            ram_size: 4096 * 4,
            boot_rom: vec![0xEA, 0x18, 0xFB, 0xEA],
            ..Default::default()
        };
        let mut machine = Machine::new(&cfg).unwrap();
        machine.hard_reset();
        machine.cpu.mode = crate::cpu::Mode::M1;
        machine.cpu.regs.pc = 0;

        machine.step().unwrap(); // NOP: 2
        machine.step().unwrap(); // CLC: 2
        machine.step().unwrap(); // XCE: 2
        machine.step().unwrap(); // NOP: 2

        assert_eq!(machine.cpu.cycles, 8);
        assert_eq!(machine.cpu.mode, crate::cpu::Mode::M0);
    }
}
