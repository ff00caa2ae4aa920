//! Flash file system on the controller board
//!
//! The file area is a fixed table of sector-aligned slots. A file starts with a 256 byte header
//! in the first sector of its slot and may run on into the following sectors. Slot 0 is reserved
//! for the boot program.

use crate::config::FlashGeometry;
use crate::encoding::{read_fixed_str, write_fixed_str, Instruction, Readable, Writable};
use crate::error::{Error, Result};
use crate::link::{HardwareLink, LinkExt};
use crate::opcode;
use crate::output_buffer::{ProgramBuffer, HEADER_SIZE};
use log::debug;
use serde::Serialize;

const FILE_MAGIC: [u32; 2] = [0xffff_ffff, 0x0000_ffff];

/// Longest file name that fits the header
pub const NAME_MAX: usize = HEADER_SIZE - 12 - 1;

/// Name of the program started at power up
pub const BOOT_FILE: &str = "bootstart";

/// Name of the file used to exchange calibration data with the firmware
pub const STDIO_FILE: &str = "stdio";

/// Largest boot program accepted
pub const BOOT_SIZE_MAX: usize = 0x40000;

/// Largest piece moved by one flash request
const FLASH_PIECE: usize = 512;

/// Byte addressed flash-like storage
pub trait FlashStore {
    fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>>;
    fn write(&mut self, address: u32, data: &[u8]) -> Result<()>;
    /// Erases the sector containing `address`
    fn erase(&mut self, address: u32) -> Result<()>;
}

/// Flash access through the board's flash interrupts
pub struct LinkFlash<L> {
    link: L,
    target: u8,
}

impl<L: HardwareLink> LinkFlash<L> {
    pub fn new(link: L) -> Self {
        LinkFlash { link, target: 0 }
    }

    /// Addresses the flash of the boards in `target` instead of the front end
    pub fn with_target(link: L, target: u8) -> Self {
        LinkFlash { link, target }
    }
}

impl<L: HardwareLink> FlashStore for LinkFlash<L> {
    fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let n = (len - out.len()).min(FLASH_PIECE);
            let at = address as usize + out.len();
            let req = Instruction::new(
                opcode::INT_FLASHRD,
                self.target,
                (at as i32, n as u16),
            );
            out.extend(self.link.request(&req, n)?);
        }
        Ok(out)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        for (n, piece) in data.chunks(FLASH_PIECE).enumerate() {
            let at = address as usize + n * FLASH_PIECE;
            let req = Instruction::new(
                opcode::INT_FLASHPP2,
                self.target,
                (at as i32, piece.len() as u16),
            );
            self.link.acknowledged(&req.to_bytes(), 4, "flash write header")?;
            self.link.acknowledged(piece, 4, "flash write")?;
        }
        Ok(())
    }

    fn erase(&mut self, address: u32) -> Result<()> {
        let req = Instruction::new(opcode::INT_FLASHPP2, self.target, (address as i32, 0u16));
        self.link.acknowledged(&req.to_bytes(), 4, "flash erase")
    }
}

/// One slot of the directory table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Stored size including the header
    pub size: usize,
    pub valid: bool,
}

/// Whether a closed file is an instruction program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Gets an end-of-file instruction appended
    Program,
    /// Stored byte for byte
    Raw,
}

fn encode_header(name: &str, size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE);
    FILE_MAGIC[0].write(&mut out);
    FILE_MAGIC[1].write(&mut out);
    (size as i32).write(&mut out);
    write_fixed_str(&mut out, name, HEADER_SIZE - 12);
    out
}

fn decode_header(mut data: &[u8]) -> Option<FileEntry> {
    let data = &mut data;
    if u32::read(data).ok()? != FILE_MAGIC[0] || u32::read(data).ok()? != FILE_MAGIC[1] {
        return None;
    }
    let size = i32::read(data).ok()?;
    let name = read_fixed_str(data, HEADER_SIZE - 12).ok()?;
    if size < HEADER_SIZE as i32 {
        return None;
    }
    Some(FileEntry {
        name,
        size: size as usize,
        valid: true,
    })
}

/// In-memory mirror of the file headers on the board
#[derive(Debug, Clone)]
pub struct FlashDirectory {
    geometry: FlashGeometry,
    entries: Vec<FileEntry>,
}

impl FlashDirectory {
    pub fn new(geometry: FlashGeometry) -> Self {
        let entries = vec![FileEntry::default(); geometry.files];
        FlashDirectory { geometry, entries }
    }

    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Valid files with their slot numbers
    pub fn files(&self) -> impl Iterator<Item = (usize, &FileEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| e.valid)
    }

    /// Rebuilds the table from the headers stored on the board
    ///
    /// A slot whose header is unreadable or corrupt is reported as invalid.
    pub fn scan<F: FlashStore + ?Sized>(&mut self, flash: &mut F) -> Result<()> {
        for slot in 0..self.entries.len() {
            let header = flash.read(self.geometry.slot_address(slot), HEADER_SIZE)?;
            self.entries[slot] = decode_header(&header).unwrap_or_default();
        }
        debug!("directory scanned, {} files", self.files().count());
        Ok(())
    }

    pub fn search(&self, name: &str) -> Option<usize> {
        self.files().find(|(_, e)| e.name == name).map(|(slot, _)| slot)
    }

    /// Number of slots covered by the file in `slot`, at least one
    fn span(&self, slot: usize) -> usize {
        self.geometry.sectors_for(self.entries[slot].size).max(1)
    }

    /// Finds the first run of free slots that can hold `size` bytes
    ///
    /// The walk starts at slot 1, or after the boot program when that spans more than one
    /// sector, and skips over every stored file as a whole.
    pub fn find_free_run(&self, size: usize) -> Result<usize> {
        let sector = self.geometry.sector_size as usize;
        let files = self.entries.len();
        let mut slot = if self.entries.first().map_or(false, |e| e.valid) {
            self.span(0).max(1)
        } else {
            1
        };
        while slot < files {
            let mut end = slot;
            let mut free = 0;
            while end < files && free < size && !self.entries[end].valid {
                end += 1;
                free += sector;
            }
            if free >= size && end > slot {
                return Ok(slot);
            }
            if end >= files {
                break;
            }
            slot = end + self.span(end);
        }
        Err(Error::Flash("no free run large enough"))
    }

    /// Erases the header sector of `name`, leaving the payload sectors behind
    ///
    /// Erasing an absent file is not an error.
    pub fn erase<F: FlashStore + ?Sized>(&mut self, flash: &mut F, name: &str) -> Result<()> {
        if let Some(slot) = self.search(name) {
            flash.erase(self.geometry.slot_address(slot))?;
            self.entries[slot].valid = false;
            debug!("erased {name:?} from slot {slot}");
        }
        Ok(())
    }

    /// Stores `program` as `name` and returns the slot it went to
    ///
    /// An existing file of the same name is erased first so its slot can be reused.
    pub fn close_file<F: FlashStore + ?Sized>(
        &mut self,
        flash: &mut F,
        mut program: ProgramBuffer,
        name: &str,
        slot: Option<usize>,
        kind: FileKind,
    ) -> Result<usize> {
        if name.len() > NAME_MAX {
            return Err(Error::data(format!("file name longer than {NAME_MAX} bytes")));
        }
        if let Some(s) = slot {
            if s >= self.entries.len() {
                return Err(Error::data(format!("file slot {s} out of range")));
            }
        }
        if kind == FileKind::Program {
            program.push(&Instruction::bare(opcode::EOF, 0));
        }
        let size = program.len();
        if name == BOOT_FILE && size >= BOOT_SIZE_MAX {
            return Err(Error::Flash("boot program too large"));
        }

        self.erase(flash, name)?;
        let slot = match slot {
            Some(s) => s,
            None if name == BOOT_FILE => 0,
            None => self.find_free_run(size)?,
        };
        self.invalidate_covered(slot, size);

        program
            .header_mut()
            .copy_from_slice(&encode_header(name, size));
        flash.write(self.geometry.slot_address(slot), program.as_bytes())?;
        self.entries[slot] = FileEntry {
            name: name.to_owned(),
            size,
            valid: true,
        };
        debug!("stored {name:?} ({size} bytes) in slot {slot}");
        Ok(slot)
    }

    /// Drops the entries whose headers lie inside an image of `size` bytes written at `slot`
    ///
    /// Writing the image erases the sectors it covers, so those files are gone on the board too.
    fn invalidate_covered(&mut self, slot: usize, size: usize) {
        let end = (slot + self.geometry.sectors_for(size)).min(self.entries.len());
        for covered in slot + 1..end {
            let entry = &mut self.entries[covered];
            if entry.valid {
                entry.valid = false;
                debug!("{:?} in slot {covered} overwritten by slot {slot}", entry.name);
            }
        }
    }

    /// Reads the complete stored image of `name`, header included
    pub fn read<F: FlashStore + ?Sized>(&self, flash: &mut F, name: &str) -> Result<Vec<u8>> {
        let slot = self
            .search(name)
            .ok_or_else(|| Error::data(format!("file {name:?} not found")))?;
        flash.read(self.geometry.slot_address(slot), self.entries[slot].size)
    }

    /// Invalidates every stored file
    pub fn format<F: FlashStore + ?Sized>(&mut self, flash: &mut F) -> Result<()> {
        for slot in 0..self.entries.len() {
            if self.entries[slot].valid {
                flash.erase(self.geometry.slot_address(slot))?;
                self.entries[slot].valid = false;
            }
        }
        debug!("flash file area formatted");
        Ok(())
    }

    /// Total and allocated bytes of the file area
    pub fn memory_sizes(&self) -> (usize, usize) {
        let sector = self.geometry.sector_size as usize;
        let mut total = 0;
        let mut allocated = 0;
        let mut slot = 0;
        while slot < self.entries.len() {
            if self.entries[slot].valid {
                let span = self.span(slot);
                total += span;
                allocated += span;
                slot += span;
            } else {
                total += 1;
                slot += 1;
            }
        }
        (total * sector, allocated * sector)
    }

    /// Marks a slot as holding `size` bytes, used when a file is written outside the table
    pub(crate) fn set_entry(&mut self, slot: usize, entry: FileEntry) {
        if let Some(e) = self.entries.get_mut(slot) {
            *e = entry;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sim::MemoryFlash;

    fn geometry(files: usize) -> FlashGeometry {
        FlashGeometry {
            sector_size: 1024,
            info_sector: 0,
            settings_sector: 1,
            calibration_sector: 2,
            files_start: 4,
            files,
            stdio_slot: files - 1,
        }
    }

    fn program(instructions: usize) -> ProgramBuffer {
        let mut p = ProgramBuffer::new(1024);
        for n in 0..instructions {
            p.push(&Instruction::new(opcode::SLEEP, 0, n as i32));
        }
        p
    }

    #[test]
    fn first_large_enough_run_wins() {
        let mut dir = FlashDirectory::new(geometry(7));
        // slot 1 holds two sectors, slot 5 one sector
        dir.set_entry(1, FileEntry { name: "a".into(), size: 2048, valid: true });
        dir.set_entry(5, FileEntry { name: "b".into(), size: 1000, valid: true });
        assert_eq!(dir.find_free_run(2048).unwrap(), 3);
        assert_eq!(dir.find_free_run(100).unwrap(), 3);
        assert!(dir.find_free_run(3 * 1024).is_err());
    }

    #[test]
    fn run_may_end_at_table_end() {
        let mut dir = FlashDirectory::new(geometry(4));
        dir.set_entry(1, FileEntry { name: "a".into(), size: 10, valid: true });
        assert_eq!(dir.find_free_run(2048).unwrap(), 2);
        let e = dir.find_free_run(4096).unwrap_err();
        assert_eq!(e.code(), ErrorCode::Flash);
    }

    #[test]
    fn walk_skips_long_boot_program() {
        let mut dir = FlashDirectory::new(geometry(6));
        dir.set_entry(0, FileEntry { name: BOOT_FILE.into(), size: 3000, valid: true });
        assert_eq!(dir.find_free_run(10).unwrap(), 3);
    }

    #[test]
    fn stored_files_survive_rescan() {
        let mut flash = MemoryFlash::new(1024);
        let mut dir = FlashDirectory::new(geometry(8));
        let a = dir
            .close_file(&mut flash, program(200), "first", None, FileKind::Program)
            .unwrap();
        let b = dir
            .close_file(&mut flash, program(3), "second", None, FileKind::Program)
            .unwrap();
        assert_eq!(a, 1);
        // 256 + 201 * 8 bytes span two sectors
        assert_eq!(b, 3);

        let mut again = FlashDirectory::new(geometry(8));
        again.scan(&mut flash).unwrap();
        assert_eq!(again.entries(), dir.entries());
        assert_eq!(again.search("second"), Some(3));

        let image = again.read(&mut flash, "first").unwrap();
        assert_eq!(image.len(), 256 + 201 * 8);
        assert_eq!(&image[12..18], b"first\0");
        let last = Instruction::from_bytes(image[image.len() - 8..].try_into().unwrap());
        assert_eq!(last.opcode, opcode::EOF);
    }

    #[test]
    fn replacing_a_file_reuses_its_slot() {
        let mut flash = MemoryFlash::new(1024);
        let mut dir = FlashDirectory::new(geometry(8));
        dir.close_file(&mut flash, program(1), "job", None, FileKind::Program)
            .unwrap();
        dir.close_file(&mut flash, program(1), "other", None, FileKind::Program)
            .unwrap();
        let slot = dir
            .close_file(&mut flash, program(2), "job", None, FileKind::Program)
            .unwrap();
        assert_eq!(slot, 1);
        assert_eq!(dir.files().count(), 2);
    }

    #[test]
    fn erase_invalidates_header_only() {
        let mut flash = MemoryFlash::new(1024);
        let mut dir = FlashDirectory::new(geometry(8));
        dir.close_file(&mut flash, program(200), "big", None, FileKind::Program)
            .unwrap();
        dir.erase(&mut flash, "big").unwrap();
        dir.erase(&mut flash, "absent").unwrap();
        assert_eq!(dir.search("big"), None);
        // payload sector still holds data
        assert_ne!(flash.read(geometry(8).slot_address(2), 8).unwrap(), vec![0xff; 8]);
        dir.scan(&mut flash).unwrap();
        assert_eq!(dir.files().count(), 0);
        assert!(dir.read(&mut flash, "big").is_err());
    }

    #[test]
    fn boot_program_goes_to_slot_zero_and_is_capped() {
        let mut flash = MemoryFlash::new(1024);
        let mut dir = FlashDirectory::new(geometry(8));
        let slot = dir
            .close_file(&mut flash, program(4), BOOT_FILE, None, FileKind::Program)
            .unwrap();
        assert_eq!(slot, 0);

        let mut huge = ProgramBuffer::new(1024);
        huge.push_raw(&vec![0u8; BOOT_SIZE_MAX]);
        let e = dir
            .close_file(&mut flash, huge, BOOT_FILE, None, FileKind::Raw)
            .unwrap_err();
        assert_eq!(e.code(), ErrorCode::Flash);
    }

    #[test]
    fn boot_program_overwrites_files_in_its_span() {
        let mut flash = MemoryFlash::new(1024);
        let mut dir = FlashDirectory::new(geometry(8));
        dir.close_file(&mut flash, program(1), "user", None, FileKind::Program)
            .unwrap();
        dir.close_file(&mut flash, program(1), "far", Some(4), FileKind::Program)
            .unwrap();
        assert_eq!(dir.search("user"), Some(1));

        // 256 + 301 * 8 bytes need three sectors
        let slot = dir
            .close_file(&mut flash, program(300), BOOT_FILE, None, FileKind::Program)
            .unwrap();
        assert_eq!(slot, 0);
        assert_eq!(dir.search("user"), None);
        assert!(dir.read(&mut flash, "user").is_err());
        assert_eq!(dir.search("far"), Some(4));

        let mut again = FlashDirectory::new(geometry(8));
        again.scan(&mut flash).unwrap();
        let stored: Vec<_> = dir.files().map(|(slot, e)| (slot, e.name.clone())).collect();
        let scanned: Vec<_> = again.files().map(|(slot, e)| (slot, e.name.clone())).collect();
        assert_eq!(stored, scanned);
        assert_eq!(again.search(BOOT_FILE), Some(0));
    }

    #[test]
    fn raw_files_get_no_end_marker() {
        let mut flash = MemoryFlash::new(1024);
        let mut dir = FlashDirectory::new(geometry(8));
        let mut raw = ProgramBuffer::new(1024);
        raw.push_raw(b"hello");
        dir.close_file(&mut flash, raw, "blob", Some(4), FileKind::Raw)
            .unwrap();
        let image = dir.read(&mut flash, "blob").unwrap();
        assert_eq!(&image[256..], b"hello");
        assert!(dir
            .close_file(&mut flash, ProgramBuffer::new(1024), "x", Some(8), FileKind::Raw)
            .is_err());
    }

    #[test]
    fn memory_sizes_count_spans() {
        let mut dir = FlashDirectory::new(geometry(8));
        dir.set_entry(1, FileEntry { name: "a".into(), size: 2048, valid: true });
        assert_eq!(dir.memory_sizes(), (8 * 1024, 2 * 1024));

        let mut flash = MemoryFlash::new(1024);
        dir.format(&mut flash).unwrap();
        assert_eq!(dir.memory_sizes(), (8 * 1024, 0));
    }

    #[test]
    fn corrupt_header_degrades_to_invalid() {
        let mut flash = MemoryFlash::new(1024);
        let mut header = encode_header("x", 100);
        header[8..12].copy_from_slice(&5i32.to_le_bytes());
        flash.write(geometry(4).slot_address(1), &header).unwrap();
        let mut dir = FlashDirectory::new(geometry(4));
        dir.scan(&mut flash).unwrap();
        assert!(!dir.entries()[1].valid);
    }
}
