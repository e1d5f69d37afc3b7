//! Compatibility window manager and the classic Apple II soft-switch page
//! that backs a compat guest's single DEV I/O page (spec §4.5).
//!
//! Building a window means writing page table entries into the kernel's own
//! page tables; the manager never touches the bus's fixed physical regions
//! directly. Torn down by re-zeroing the same PTE slots.

use crate::bus::AccessIntent;
use crate::bus::Bus;
use crate::devpage::{DeviceHandler, Speaker};
use crate::errors::{CoreError, Fault};
use crate::pte::{DevicePageId, Pte};

/// Window layout, in bytes, measured from `COMPAT_BASE` (spec §4.5 table).
pub const RAM_SPAN: u32 = 0xC000;
pub const DEV_PAGE_OFFSET: u32 = 0xC000;
pub const DEV_PAGE_SPAN: u32 = 0x1000;
pub const ROM_OFFSET: u32 = 0xD000;
pub const ROM_SPAN: u32 = 0x3000;
const PAGE_SIZE: u32 = 4096;
const PTE_SIZE: u32 = 4;

/// A built compatibility window, kept around so it can be torn down later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatWindow {
    pub compat_base: u32,
    pub compat_id: u16,
    pub device_id: DevicePageId,
    l1_table_base: u32,
    l2_table_base: u32,
}

/// Builds and tears down per-guest compat windows against a kernel's own
/// page tables. Stateless: holds no per-window bookkeeping of its own, so
/// a kernel can run as many concurrent windows as it has L1/L2 table space
/// for (spec §9: "two compat tasks... see disjoint backing state").
pub struct CompatWindowManager;

impl CompatWindowManager {
    pub fn new() -> Self {
        Self
    }

    /// Builds the window described in spec §4.5. `l2_table_base` must be a
    /// table exclusively owned by this window (callers building more than
    /// one window must not share an L2 table between them). When
    /// `compat_id == 0`, the ROM pages are left unmapped entirely — the
    /// REDESIGN FLAGS resolution of the COMPATID-0 Open Question: a bare
    /// environment is permitted, and reads of its (absent) ROM simply fault
    /// `NotPresent`, which a peek reports as the usual `0xFF`.
    #[allow(clippy::too_many_arguments)]
    pub fn build_window(
        &self,
        bus: &mut Bus,
        l1_table_base: u32,
        l2_table_base: u32,
        compat_base: u32,
        compat_id: u16,
        guest_ram_phys_base: u32,
        rom_phys_base: u32,
        rom_len: u32,
        device_id: DevicePageId,
    ) -> Result<CompatWindow, CoreError> {
        if compat_base % PAGE_SIZE != 0 {
            return Err(CoreError::Misaligned {
                value: compat_base,
                required: PAGE_SIZE,
            });
        }
        if compat_id != 0 && rom_len > ROM_SPAN {
            return Err(CoreError::InvalidConfig("compat rom image exceeds window rom span"));
        }

        let l1_index = (compat_base >> 22) & 0x3FF;
        let mut l1 = read_pte(bus, l1_table_base, l1_index);
        l1.set_present(true);
        l1.set_pfn(l2_table_base >> 12);
        write_pte(bus, l1_table_base, l1_index, l1);

        let ram_pages = RAM_SPAN / PAGE_SIZE;
        for i in 0..ram_pages {
            let va = compat_base + i * PAGE_SIZE;
            let mut pte = Pte::new();
            pte.set_present(true);
            pte.set_read(true);
            pte.set_write(true);
            pte.set_execute(true);
            pte.set_user(true);
            pte.set_pfn((guest_ram_phys_base + i * PAGE_SIZE) >> 12);
            install(bus, l2_table_base, compat_base, va, pte);
        }

        let dev_va = compat_base + DEV_PAGE_OFFSET;
        let mut dev_pte = Pte::new();
        dev_pte.set_present(true);
        dev_pte.set_read(true);
        dev_pte.set_write(true);
        dev_pte.set_user(true);
        dev_pte.set_dev(true);
        dev_pte.set_pfn(device_id.to_bits());
        install(bus, l2_table_base, compat_base, dev_va, dev_pte);

        if compat_id != 0 {
            let rom_pages = ROM_SPAN / PAGE_SIZE;
            for i in 0..rom_pages {
                let va = compat_base + ROM_OFFSET + i * PAGE_SIZE;
                let mut pte = Pte::new();
                pte.set_present(true);
                pte.set_read(true);
                pte.set_execute(true);
                pte.set_user(true);
                pte.set_pfn((rom_phys_base + i * PAGE_SIZE) >> 12);
                install(bus, l2_table_base, compat_base, va, pte);
            }
        }

        Ok(CompatWindow {
            compat_base,
            compat_id,
            device_id,
            l1_table_base,
            l2_table_base,
        })
    }

    /// Zeroes every PTE this window installed. The L1 entry is left in
    /// place since other windows may share the same 4 MB L1 span; only the
    /// L2 slots this window owns are cleared.
    pub fn teardown(&self, bus: &mut Bus, window: &CompatWindow) {
        let total_span = ROM_OFFSET + ROM_SPAN;
        let pages = total_span / PAGE_SIZE;
        for i in 0..pages {
            let va = window.compat_base + i * PAGE_SIZE;
            install(bus, window.l2_table_base, window.compat_base, va, Pte::new());
        }
    }
}

impl Default for CompatWindowManager {
    fn default() -> Self {
        Self::new()
    }
}

fn l2_index_of(va: u32) -> u32 {
    (va >> 12) & 0x3FF
}

fn install(bus: &mut Bus, l2_table_base: u32, _compat_base: u32, va: u32, pte: Pte) {
    write_pte(bus, l2_table_base, l2_index_of(va), pte);
}

fn read_pte(bus: &Bus, table_base: u32, index: u32) -> Pte {
    Pte::from_bytes(bus.read_phys_u32(table_base + index * PTE_SIZE).to_le_bytes())
}

fn write_pte(bus: &mut Bus, table_base: u32, index: u32, pte: Pte) {
    bus.write_phys_u32(table_base + index * PTE_SIZE, u32::from_le_bytes(pte.into_bytes()));
}

/// The single DEV page backing `+0xC000..+0xCFFF` of a compat window,
/// sub-decoded per the classic Apple II layout (spec §4.5):
/// `$C000-$C0FF` soft switches, `$C100-$C7FF` slot/firmware windows
/// (opaque per the Non-goal on ROM/card contents), `$C800-$CFFF` expansion.
/// Per-guest instancing (one instance per compat window) keeps soft-switch
/// state and slot contents from bleeding between guests (spec §8 scenario 4).
pub struct ApplePeripheralPage {
    speaker: Speaker,
}

impl ApplePeripheralPage {
    pub fn new() -> Self {
        Self { speaker: Speaker::new() }
    }

    pub fn speaker(&self) -> &Speaker {
        &self.speaker
    }

    pub fn speaker_mut(&mut self) -> &mut Speaker {
        &mut self.speaker
    }

    fn known_soft_switches() -> &'static [(u32, &'static str, &'static str)] {
        &[
            (0x00, "KBD", "keyboard data latch"),
            (0x10, "KBDSTRB", "keyboard strobe clear"),
            (0x50, "TXTCLR", "graphics mode"),
            (0x51, "TXTSET", "text mode"),
            (0x52, "MIXCLR", "full-screen mode"),
            (0x53, "MIXSET", "mixed mode"),
            (0x54, "LOWSCR", "page 1 select"),
            (0x55, "HISCR", "page 2 select"),
            (0x56, "LORES", "lo-res graphics"),
            (0x57, "HIRES", "hi-res graphics"),
            (0x80, "LCBANK2", "language card bank 2 read"),
            (0x81, "LCRDRAM", "language card RAM read/write off"),
            (0x88, "LCBANK1", "language card bank 1 read"),
            (0x8F, "LCRDROM", "language card ROM read"),
        ]
    }
}

impl Default for ApplePeripheralPage {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceHandler for ApplePeripheralPage {
    fn access(&mut self, offset: u32, intent: AccessIntent, value: Option<u8>) -> Result<u8, Fault> {
        match offset {
            0x30 => self.speaker.access(0, intent, value),
            // $C100-$C7FF slot/firmware windows and $C800-$CFFF expansion
            // carry opaque payloads (Non-goal); completing the access with
            // a documented default keeps the access pipeline uniform.
            0x00 | 0x10 | 0x50..=0x57 | 0x80..=0x8F => Ok(0x00),
            _ => Ok(0xFF),
        }
    }

    fn soft_switches(&self) -> Vec<(&'static str, u32, bool, &'static str)> {
        let mut switches: Vec<_> = Self::known_soft_switches()
            .iter()
            .map(|(addr, name, desc)| (*name, 0xC000 + addr, false, *desc))
            .collect();
        switches.extend(self.speaker.soft_switches());
        switches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    fn bus() -> Bus {
        Bus::new(&MachineConfig {
            ram_size: 4096 * 64,
            ..Default::default()
        })
    }

    #[test]
    fn window_maps_ram_dev_and_rom_with_expected_permissions() {
        let mut bus = bus();
        let manager = CompatWindowManager::new();
        let l1_base = 0x0004_0000;
        let l2_base = 0x0004_1000;
        let ram_phys = 0x0004_2000;
        let rom_phys = 0x0000_0000;
        let device_id = DevicePageId::new(1, 0, 0);

        let window = manager
            .build_window(&mut bus, l1_base, l2_base, 0x0100_0000, 1, ram_phys, rom_phys, 0x1000, device_id)
            .unwrap();

        let ram_pte = read_pte(&bus, l2_base, l2_index_of(0x0100_0000));
        assert!(ram_pte.present());
        assert!(ram_pte.write());
        assert!(ram_pte.execute());

        let dev_pte = read_pte(&bus, l2_base, l2_index_of(0x0100_0000 + DEV_PAGE_OFFSET));
        assert!(dev_pte.present());
        assert!(dev_pte.dev());
        assert_eq!(dev_pte.device_page_id(), device_id);

        let rom_pte = read_pte(&bus, l2_base, l2_index_of(0x0100_0000 + ROM_OFFSET));
        assert!(rom_pte.present());
        assert!(rom_pte.execute());
        assert!(!rom_pte.write());

        manager.teardown(&mut bus, &window);
        let ram_after = read_pte(&bus, l2_base, l2_index_of(0x0100_0000));
        assert!(!ram_after.present());
    }

    #[test]
    fn compatid_zero_leaves_rom_pages_unmapped() {
        let mut bus = bus();
        let manager = CompatWindowManager::new();
        let device_id = DevicePageId::new(1, 0, 0);
        manager
            .build_window(&mut bus, 0x0004_0000, 0x0004_1000, 0x0100_0000, 0, 0x0004_2000, 0, 0, device_id)
            .unwrap();

        let rom_pte = read_pte(&bus, 0x0004_1000, l2_index_of(0x0100_0000 + ROM_OFFSET));
        assert!(!rom_pte.present());
    }

    #[test]
    fn speaker_toggle_routes_through_offset_thirty() {
        let mut page = ApplePeripheralPage::new();
        page.access(0x30, AccessIntent::DataRead, None).unwrap();
        assert_eq!(page.speaker().toggle_count(), 1);
    }

    #[test]
    fn unrecognized_offset_returns_floating_default() {
        let mut page = ApplePeripheralPage::new();
        let v = page.access(0x42, AccessIntent::DataRead, None).unwrap();
        assert_eq!(v, 0xFF);
    }
}
