//! In-memory machine configuration.
//!
//! The *file format* and path resolution for a machine profile are out of
//! scope (they belong to the external machine-profile loader); this is the
//! shape a loader would deserialize into, or that a test harness builds by
//! hand.

use crate::errors::CoreError;

pub const PAGE_SIZE: u32 = 4096;
pub const BOOT_ROM_BASE: u32 = 0x0000_0000;
pub const BOOT_ROM_SIZE: u32 = 256 * 1024;
pub const DEFAULT_RAM_BASE: u32 = 0x0004_0000;
pub const HIGH_ROM_ALIAS_BASE: u32 = 0xFFFC_0000;

/// Machine-wide construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MachineConfig {
    /// Total RAM size in bytes, starting at [`DEFAULT_RAM_BASE`]. Must be a
    /// multiple of [`PAGE_SIZE`].
    pub ram_size: u32,
    /// Boot ROM image contents, copied into the boot ROM region at
    /// construction. Must be no larger than [`BOOT_ROM_SIZE`]; the
    /// remainder reads as `0xFF`.
    pub boot_rom: Vec<u8>,
    /// Default `step()` count passed to `run()` when the caller does not
    /// specify one of their own.
    pub default_instruction_limit: u64,
    /// Whether the MMU honors ASID tagging. When false (the default, since
    /// no TLB exists yet), context switches behave as if ASID were always
    /// invalidated.
    pub asid_enabled: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: PAGE_SIZE * 64,
            boot_rom: Vec::new(),
            default_instruction_limit: 1_000_000,
            asid_enabled: false,
        }
    }
}

impl MachineConfig {
    /// Validates this configuration, matching the invariants a `Machine`
    /// construction depends on.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.ram_size % PAGE_SIZE != 0 {
            return Err(CoreError::InvalidConfig("ram_size must be page-aligned"));
        }
        if self.ram_size == 0 {
            return Err(CoreError::InvalidConfig("ram_size must be nonzero"));
        }
        if self.boot_rom.len() as u32 > BOOT_ROM_SIZE {
            return Err(CoreError::InvalidConfig(
                "boot_rom image exceeds boot rom region size",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(MachineConfig::default().validate().is_ok());
    }

    #[test]
    fn unaligned_ram_size_rejected() {
        let cfg = MachineConfig {
            ram_size: PAGE_SIZE + 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_boot_rom_rejected() {
        let cfg = MachineConfig {
            boot_rom: vec![0u8; (BOOT_ROM_SIZE + 1) as usize],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
