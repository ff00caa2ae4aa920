use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Sector layout of the controller flash
///
/// All sector numbers are absolute. File slot `n` lives at sector `files_start + n`; slot 0 is
/// reserved for the boot program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashGeometry {
    pub sector_size: u32,
    pub info_sector: u32,
    pub settings_sector: u32,
    pub calibration_sector: u32,
    pub files_start: u32,
    pub files: usize,
    /// File slot used to hand calibration files to the firmware
    pub stdio_slot: usize,
}

impl Default for FlashGeometry {
    fn default() -> Self {
        FlashGeometry {
            sector_size: 0x1_0000,
            info_sector: 0,
            settings_sector: 1,
            calibration_sector: 2,
            files_start: 8,
            files: 56,
            stdio_slot: 55,
        }
    }
}

impl FlashGeometry {
    pub fn sector_address(&self, sector: u32) -> u32 {
        sector * self.sector_size
    }

    /// Absolute address of a file slot
    pub fn slot_address(&self, slot: usize) -> u32 {
        self.sector_address(self.files_start + slot as u32)
    }

    pub fn settings_address(&self) -> u32 {
        self.sector_address(self.settings_sector)
    }

    pub fn calibration_address(&self) -> u32 {
        self.sector_address(self.calibration_sector)
    }

    pub fn info_address(&self) -> u32 {
        self.sector_address(self.info_sector)
    }

    /// Address of the boot script, stored in the second half of the boot sector
    pub fn boot_script_address(&self) -> u32 {
        self.slot_address(0) + self.sector_size / 2
    }

    /// Number of sectors needed to hold `size` bytes
    pub fn sectors_for(&self, size: usize) -> usize {
        let sector = self.sector_size as usize;
        (size + sector - 1) / sector
    }

    fn validate(&self) -> Result<()> {
        if self.sector_size < 1024 || !self.sector_size.is_power_of_two() {
            return Err(Error::data("sector size must be a power of two of at least 1024"));
        }
        if self.files < 2 || self.stdio_slot >= self.files {
            return Err(Error::data("file slot layout out of range"));
        }
        Ok(())
    }
}

/// Host side session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between poller iterations
    pub poll_interval_ms: u64,
    /// Hardware id the settings sector must carry to be trusted
    pub hardware_id: u16,
    pub default_field_size: f64,
    pub default_field_size_z: f64,
    pub default_drag_error: u16,
    pub flash: FlashGeometry,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            poll_interval_ms: 50,
            hardware_id: 10,
            default_field_size: 100.0,
            default_field_size_z: 100.0,
            default_drag_error: 80,
            flash: FlashGeometry::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.flash.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| Error::host_file(path, e))?;
        Self::from_json(&json)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
