//! Flash housekeeping, profiles and calibration tables
//!
//! A profile is a host file holding raw copies of flash areas, each block preceded by a
//! [`ProfileHeader`]. Calibration files are handed to the firmware through the `stdio` file slot.

use crate::encoding::{Instruction, ReadError, Readable, Writable};
use crate::error::{Error, Result};
use crate::flash::{FileEntry, FileKind, FlashStore, STDIO_FILE};
use crate::opcode;
use crate::output_buffer::{OutputBuffer, ProgramBuffer, HEADER_SIZE};
use crate::params::ParamSet;
use crate::session::{ControllerSession, SessionState};
use log::{debug, info};
use std::fs;
use std::ops::BitOr;
use std::path::Path;

/// Bytes of one target's calibration table
pub const CALIBRATION_TABLE_SIZE: usize = (33 * 33 * 8 + 129) * 2;

/// Number of calibration tables, one per target
pub const CALIBRATION_TABLES: usize = 8;

const PROFILE_BLOCK_ID: i16 = 0x3456;

/// Largest boot script accepted, terminator included
const BOOT_SCRIPT_MAX: usize = 0x1_0000;

/// Calibration interrupts answer with this value on success
const CALIBRATION_OK: i32 = -1;

/// Which flash areas a profile transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileInclude(u8);

impl ProfileInclude {
    pub const CONFIG: ProfileInclude = ProfileInclude(0x01);
    pub const TARGET_MAP: ProfileInclude = ProfileInclude(0x02);
    pub const CALIBRATION: ProfileInclude = ProfileInclude(0x04);
    pub const FILES: ProfileInclude = ProfileInclude(0x08);
    pub const ALL: ProfileInclude = ProfileInclude(0x0f);

    pub fn from_bits(bits: u8) -> Self {
        ProfileInclude(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: ProfileInclude) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProfileInclude {
    type Output = ProfileInclude;

    fn bitor(self, rhs: Self) -> Self {
        ProfileInclude(self.0 | rhs.0)
    }
}

/// Header in front of every block of a profile file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileHeader {
    pub id: i16,
    /// Absolute flash sector the block belongs to
    pub sector: i16,
    pub size: i32,
    /// Sum of the block bytes taken as signed
    pub checksum: i32,
}

impl ProfileHeader {
    fn for_block(sector: u32, data: &[u8]) -> Self {
        ProfileHeader {
            id: PROFILE_BLOCK_ID,
            sector: sector as i16,
            size: data.len() as i32,
            checksum: checksum(data),
        }
    }
}

impl Readable for ProfileHeader {
    fn read(data: &mut &[u8]) -> std::result::Result<Self, ReadError> {
        let mut d = *data;
        let header = ProfileHeader {
            id: i16::read(&mut d)?,
            sector: i16::read(&mut d)?,
            size: i32::read(&mut d)?,
            checksum: i32::read(&mut d)?,
        };
        *data = d;
        Ok(header)
    }
}

impl Writable for ProfileHeader {
    fn write(&self, output: &mut impl OutputBuffer) {
        self.id.write(output);
        self.sector.write(output);
        self.size.write(output);
        self.checksum.write(output);
    }
}

fn checksum(data: &[u8]) -> i32 {
    data.iter()
        .fold(0i32, |sum, &b| sum.wrapping_add(b as i8 as i32))
}

fn push_block(out: &mut Vec<u8>, sector: u32, data: &[u8]) {
    ProfileHeader::for_block(sector, data).write(out);
    out.extend_from_slice(data);
}

/// Splits a profile file into verified blocks
fn parse_profile(mut data: &[u8]) -> Result<Vec<(ProfileHeader, &[u8])>> {
    let mut blocks = Vec::new();
    while !data.is_empty() {
        let header = ProfileHeader::read(&mut data)
            .map_err(|_| Error::data("truncated profile block header"))?;
        if header.id != PROFILE_BLOCK_ID || header.size < 0 {
            return Err(Error::data(format!(
                "bad profile block {} for sector {}",
                header.id, header.sector
            )));
        }
        let size = header.size as usize;
        if data.len() < size {
            return Err(Error::data("truncated profile block"));
        }
        let (block, rest) = data.split_at(size);
        if checksum(block) != header.checksum {
            return Err(Error::data(format!(
                "checksum mismatch in profile block for sector {}",
                header.sector
            )));
        }
        blocks.push((header, block));
        data = rest;
    }
    Ok(blocks)
}

fn read_host_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::host_file(path, e))
}

fn write_host_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).map_err(|e| Error::host_file(path, e))
}

fn calibration_reply(reply: &[u8], what: &'static str) -> Result<()> {
    let code = i32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]);
    if code == CALIBRATION_OK {
        Ok(())
    } else {
        Err(Error::Device {
            request: what,
            status: code as i8,
        })
    }
}

impl SessionState {
    /// Stores `bytes` as file `name`, in `slot` or the first free run
    fn upload(&mut self, bytes: &[u8], name: &str, slot: Option<usize>) -> Result<usize> {
        let mut program = ProgramBuffer::new(self.config.flash.sector_size as usize);
        program.push_raw(bytes);
        let (mut flash, directory) = self.flash()?;
        directory.close_file(&mut flash, program, name, slot, FileKind::Raw)
    }

    fn calibration_table(&mut self) -> Result<Vec<i16>> {
        let address = self.config.flash.calibration_address()
            + (self.address.index as usize * CALIBRATION_TABLE_SIZE) as u32;
        let (mut flash, _) = self.flash()?;
        let bytes = flash.read(address, CALIBRATION_TABLE_SIZE)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    fn calibration_request(&mut self, op: u8, what: &'static str) -> Result<()> {
        let index = self.address.index as u16;
        let reply = self.request(&Instruction::new(op, 0, index), 4)?;
        calibration_reply(&reply, what)
    }

    fn upload_stdio(&mut self, path: &Path) -> Result<()> {
        let bytes = read_host_file(path)?;
        self.abort()?;
        let slot = self.config.flash.stdio_slot;
        self.upload(&bytes, STDIO_FILE, Some(slot))?;
        Ok(())
    }
}

impl ControllerSession {
    /// Slot of the stored file `name`
    pub fn file_index(&self, name: &str) -> Result<usize> {
        self.lock()
            .directory
            .search(name)
            .ok_or_else(|| Error::data(format!("file {name:?} not found")))
    }

    /// Stores the contents of host file `src` as `name` and returns its slot
    pub fn file_upload(
        &self,
        src: impl AsRef<Path>,
        name: &str,
        slot: Option<usize>,
    ) -> Result<usize> {
        let bytes = read_host_file(src.as_ref())?;
        let mut state = self.lock();
        state.abort()?;
        let slot = state.upload(&bytes, name, slot)?;
        info!("uploaded {} as {name:?} to slot {slot}", src.as_ref().display());
        Ok(slot)
    }

    /// Copies stored file `name` without its header to host file `dest`
    pub fn file_download(&self, name: &str, dest: impl AsRef<Path>) -> Result<()> {
        let mut state = self.lock();
        state.abort()?;
        let (mut flash, directory) = state.flash()?;
        let image = directory.read(&mut flash, name)?;
        write_host_file(dest.as_ref(), &image[HEADER_SIZE..])
    }

    /// Invalidates every stored file
    pub fn format_flash(&self) -> Result<()> {
        let mut state = self.lock();
        state.abort()?;
        let (mut flash, directory) = state.flash()?;
        directory.format(&mut flash)
    }

    /// Removes `name` from the directory, absent files are ignored
    pub fn erase_file(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.abort()?;
        let (mut flash, directory) = state.flash()?;
        directory.erase(&mut flash, name)
    }

    /// Restarts directory iteration and returns the first stored file
    pub fn first_file(&self) -> Option<FileEntry> {
        self.lock().dir_cursor = 0;
        self.next_file()
    }

    pub fn next_file(&self) -> Option<FileEntry> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let entries = state.directory.entries();
        let found = entries
            .iter()
            .enumerate()
            .skip(state.dir_cursor)
            .find(|(_, e)| e.valid)
            .map(|(slot, e)| (slot, e.clone()));
        state.dir_cursor = found.as_ref().map_or(entries.len(), |(slot, _)| slot + 1);
        found.map(|(_, e)| e)
    }

    /// Total and allocated bytes of the file area
    pub fn memory_sizes(&self) -> (usize, usize) {
        self.lock().directory.memory_sizes()
    }

    /// Stores the boot script, a NUL terminated string in the second half of the boot sector
    pub fn store_boot_script(&self, script: &str) -> Result<()> {
        let mut data = script.as_bytes().to_vec();
        data.push(0);
        let mut state = self.lock();
        let room = (state.config.flash.sector_size as usize / 2).min(BOOT_SCRIPT_MAX);
        if data.len() > room {
            return Err(Error::data(format!("boot script longer than {} bytes", room - 1)));
        }
        let address = state.config.flash.boot_script_address();
        let (mut flash, _) = state.flash()?;
        flash.write(address, &data)
    }

    pub fn read_boot_script(&self) -> Result<String> {
        let mut state = self.lock();
        let room = (state.config.flash.sector_size as usize / 2).min(BOOT_SCRIPT_MAX);
        let address = state.config.flash.boot_script_address();
        let (mut flash, _) = state.flash()?;
        let data = flash.read(address, room)?;
        let end = data
            .iter()
            .position(|&b| b == 0 || b == 0xff)
            .unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[..end]).into_owned())
    }

    /// Writes the selected flash areas to profile file `path`
    pub fn store_profile(&self, path: impl AsRef<Path>, include: ProfileInclude) -> Result<()> {
        let mut state = self.lock();
        let geometry = state.config.flash.clone();
        let mut out = Vec::new();
        if include.contains(ProfileInclude::CONFIG) || include.contains(ProfileInclude::TARGET_MAP)
        {
            let params = state.params.encode();
            push_block(&mut out, geometry.settings_sector, &params);
        }
        if include.contains(ProfileInclude::CALIBRATION) {
            let (mut flash, _) = state.flash()?;
            let tables = flash.read(
                geometry.calibration_address(),
                CALIBRATION_TABLE_SIZE * CALIBRATION_TABLES,
            )?;
            push_block(&mut out, geometry.calibration_sector, &tables);
        }
        if include.contains(ProfileInclude::FILES) {
            let (mut flash, directory) = state.flash()?;
            let mut slot = 0;
            while slot < geometry.files {
                let sector = geometry.files_start + slot as u32;
                let entry = &directory.entries()[slot];
                if entry.valid {
                    let image = flash.read(geometry.slot_address(slot), entry.size)?;
                    push_block(&mut out, sector, &image);
                    slot += geometry.sectors_for(entry.size).max(1);
                } else {
                    push_block(&mut out, sector, &[]);
                    slot += 1;
                }
            }
        }
        write_host_file(path.as_ref(), &out)?;
        debug!("stored profile with {} bytes", out.len());
        Ok(())
    }

    /// Restores the selected areas from profile file `path`
    ///
    /// The whole file is verified before anything is written. Imported settings keep this
    /// board's hardware id and serial number, and keep its target map unless
    /// [`ProfileInclude::TARGET_MAP`] is selected.
    pub fn load_profile(&self, path: impl AsRef<Path>, include: ProfileInclude) -> Result<()> {
        let data = read_host_file(path.as_ref())?;
        let blocks = parse_profile(&data)?;
        let mut state = self.lock();
        let geometry = state.config.flash.clone();
        let config = include.contains(ProfileInclude::CONFIG);
        let target_map = include.contains(ProfileInclude::TARGET_MAP);
        let files = include.contains(ProfileInclude::FILES);

        for (header, block) in blocks {
            let sector = header.sector as u32;
            if sector == geometry.settings_sector && (config || target_map) {
                let loaded = ParamSet::decode(block)
                    .map_err(|_| Error::data("profile settings block too short"))?;
                let mut params = state.params.clone();
                if config {
                    params = ParamSet {
                        hw_id: params.hw_id,
                        serial_nr: params.serial_nr,
                        mac: params.mac,
                        ..loaded.clone()
                    };
                }
                if target_map {
                    params.mac = loaded.mac;
                }
                let encoded = params.encode();
                let address = geometry.settings_address();
                let (mut flash, _) = state.flash()?;
                flash.erase(address)?;
                flash.write(address, &encoded)?;
                state.params = params;
            } else if sector == geometry.calibration_sector
                && include.contains(ProfileInclude::CALIBRATION)
            {
                let (mut flash, _) = state.flash()?;
                flash.write(geometry.calibration_address(), block)?;
            } else if sector >= geometry.files_start && files {
                let slot = (sector - geometry.files_start) as usize;
                if slot >= geometry.files {
                    continue;
                }
                let valid = state.directory.entries()[slot].valid;
                let (mut flash, _) = state.flash()?;
                if !block.is_empty() {
                    flash.write(geometry.slot_address(slot), block)?;
                } else if valid {
                    flash.erase(geometry.slot_address(slot))?;
                }
            }
        }
        if files {
            let (mut flash, directory) = state.flash()?;
            directory.scan(&mut flash)?;
        }
        info!("loaded profile {}", path.as_ref().display());
        Ok(())
    }

    /// Calibration table of the addressed target as stored on the board
    pub fn calibration(&self) -> Result<Vec<i16>> {
        self.lock().calibration_table()
    }

    /// Replaces the addressed target's calibration with host file `path`
    pub fn load_calibration_file(&self, path: impl AsRef<Path>) -> Result<Vec<i16>> {
        let mut state = self.lock();
        state.upload_stdio(path.as_ref())?;
        state.calibration_request(opcode::INT_LOADCALFILE, "load calibration")?;
        state.calibration_table()
    }

    /// Adds correction data from `path` to the addressed target's calibration
    ///
    /// With `reset` the table is cleared first, and a `None` path only clears it.
    pub fn add_calibration_data(&self, path: Option<&Path>, reset: bool) -> Result<Vec<i16>> {
        let mut state = self.lock();
        if reset {
            state.calibration_request(opcode::INT_RESETCAL, "reset calibration")?;
        }
        if let Some(path) = path {
            state.upload_stdio(path)?;
            state.calibration_request(opcode::INT_ADDCALDATA, "add calibration data")?;
        }
        state.calibration_table()
    }

    /// Has the firmware export the addressed target's calibration and saves it to `path`
    pub fn store_calibration_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut state = self.lock();
        let index = state.address.index as u16;
        let reply = state.request(&Instruction::new(opcode::INT_STORECALFILE, 0, index), 4)?;
        let size = i32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]);
        if size < HEADER_SIZE as i32 {
            return Err(Error::Device {
                request: "store calibration",
                status: size as i8,
            });
        }
        let size = size as usize;
        let slot = state.config.flash.stdio_slot;
        let address = state.config.flash.slot_address(slot);
        let (mut flash, directory) = state.flash()?;
        let image = flash.read(address, size)?;
        directory.set_entry(
            slot,
            FileEntry {
                name: STDIO_FILE.to_owned(),
                size,
                valid: true,
            },
        );
        write_host_file(path.as_ref(), &image[HEADER_SIZE..])
    }
}
