use crate::encoding::{Instruction, Readable, Writable, INSTRUCTION_SIZE};
use crate::error::{Error, Result};

/// Space reserved at the start of every program image for the file header
pub const HEADER_SIZE: usize = 256;

/// Trait for output buffers that can accept encoded data.
///
/// The buffer must support seeking back to a previously retrieved position. This is used when
/// resolving forward branches once their destination is known.
pub trait OutputBuffer {
    /// The cursor type
    type Cursor: Copy;
    /// Append bytes to the buffer
    fn output(&mut self, buf: &[u8]);
    /// Retrieve the cursor at which the next appended byte will land
    fn cur_position(&self) -> Self::Cursor;
    /// Overwrite bytes starting at the cursor position
    fn update(&mut self, cursor: Self::Cursor, value: &[u8]);
    /// Retrieve a reference to all data pushed after the cursor
    fn data_since(&self, cursor: Self::Cursor) -> &[u8];
}

impl OutputBuffer for Vec<u8> {
    type Cursor = usize;

    fn output(&mut self, buf: &[u8]) {
        self.extend(buf)
    }

    fn cur_position(&self) -> Self::Cursor {
        self.len()
    }

    fn update(&mut self, cursor: Self::Cursor, value: &[u8]) {
        self[cursor..cursor + value.len()].copy_from_slice(value);
    }

    fn data_since(&self, cursor: Self::Cursor) -> &[u8] {
        &self[cursor..]
    }
}

/// An in-memory program image under construction
///
/// The first [`HEADER_SIZE`] bytes are reserved for the flash file header, so every offset handed
/// out by [`ProgramBuffer::offset`] is the byte position the instruction will have inside the
/// stored file. Storage grows in `grow_step` increments, normally one flash sector.
#[derive(Debug, Clone)]
pub struct ProgramBuffer {
    data: Vec<u8>,
    grow_step: usize,
}

impl ProgramBuffer {
    pub fn new(grow_step: usize) -> Self {
        let grow_step = grow_step.max(HEADER_SIZE);
        let mut data = Vec::with_capacity(grow_step);
        data.resize(HEADER_SIZE, 0);
        ProgramBuffer { data, grow_step }
    }

    /// Byte offset of the next appended instruction
    pub fn offset(&self) -> usize {
        self.data.len()
    }

    /// Total image size, header included
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when nothing was appended after the header
    pub fn is_empty(&self) -> bool {
        self.data.len() == HEADER_SIZE
    }

    pub fn push(&mut self, instruction: &Instruction) {
        instruction.write(self);
    }

    /// Appends raw bytes, used for files that are not instruction programs
    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.output(bytes);
    }

    /// Rewrites the 32-bit operand of the instruction at `at`
    pub fn patch_address(&mut self, at: usize, address: i32) -> Result<()> {
        if at < HEADER_SIZE || at + INSTRUCTION_SIZE > self.data.len() {
            return Err(Error::data(format!("no instruction at offset {at}")));
        }
        self.update(at, &address.to_le_bytes());
        Ok(())
    }

    /// Overwrites the instruction at `at`
    pub fn patch_instruction(&mut self, at: usize, instruction: &Instruction) -> Result<()> {
        if at < HEADER_SIZE || at + INSTRUCTION_SIZE > self.data.len() {
            return Err(Error::data(format!("no instruction at offset {at}")));
        }
        self.update(at, &instruction.to_bytes());
        Ok(())
    }

    pub fn instruction_at(&self, at: usize) -> Option<Instruction> {
        if at < HEADER_SIZE {
            return None;
        }
        let mut data = self.data.get(at..)?;
        Instruction::read(&mut data).ok()
    }

    /// Iterates the instructions after the header
    pub fn instructions(&self) -> impl Iterator<Item = Instruction> + '_ {
        self.body()
            .chunks_exact(INSTRUCTION_SIZE)
            .filter_map(|mut chunk| Instruction::read(&mut chunk).ok())
    }

    /// Everything after the header
    pub fn body(&self) -> &[u8] {
        &self.data[HEADER_SIZE..]
    }

    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.data[..HEADER_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// One line per instruction, prefixed with its file offset
    pub fn disassemble(&self) -> String {
        self.instructions()
            .enumerate()
            .map(|(n, i)| format!("{:06x}: {}\n", HEADER_SIZE + n * INSTRUCTION_SIZE, i))
            .collect()
    }
}

impl OutputBuffer for ProgramBuffer {
    type Cursor = usize;

    fn output(&mut self, buf: &[u8]) {
        let needed = self.data.len() + buf.len();
        if needed > self.data.capacity() {
            let steps = (needed - self.data.capacity() + self.grow_step - 1) / self.grow_step;
            self.data.reserve_exact(steps * self.grow_step);
        }
        self.data.extend_from_slice(buf);
    }

    fn cur_position(&self) -> Self::Cursor {
        self.data.len()
    }

    fn update(&mut self, cursor: Self::Cursor, value: &[u8]) {
        if let Some(area) = self.data.get_mut(cursor..cursor + value.len()) {
            area.copy_from_slice(value);
        }
    }

    fn data_since(&self, cursor: Self::Cursor) -> &[u8] {
        self.data.get(cursor..).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode;

    #[test]
    fn offsets_include_header() {
        let mut p = ProgramBuffer::new(4096);
        assert!(p.is_empty());
        assert_eq!(p.offset(), 256);
        p.push(&Instruction::bare(opcode::NOP, 0));
        assert_eq!(p.offset(), 264);
        assert_eq!(p.body().len(), 8);
    }

    #[test]
    fn patch_rewrites_word_operand_only() {
        let mut p = ProgramBuffer::new(4096);
        p.push(&Instruction::new(opcode::BRANCH, 0x03, 0i32));
        p.patch_address(256, 0x1234_5678).unwrap();
        let i = p.instruction_at(256).unwrap();
        assert_eq!(i.operands::<i32>(), 0x1234_5678);
        assert_eq!(i.opcode, opcode::BRANCH);
        assert_eq!(i.target, 0x03);
        assert!(p.patch_address(264, 0).is_err());
        assert!(p.patch_address(0, 0).is_err());
    }

    #[test]
    fn grows_in_whole_steps() {
        let mut p = ProgramBuffer::new(512);
        for _ in 0..40 {
            p.push(&Instruction::bare(opcode::NOP, 0));
        }
        assert_eq!(p.len(), 256 + 40 * 8);
        assert_eq!(p.instructions().count(), 40);
        assert!(p.disassemble().starts_with("000100: NOP"));
    }

    #[test]
    fn vec_cursor_points_past_end() {
        let mut v = vec![1u8, 2, 3];
        let c = v.cur_position();
        v.output(&[4, 5]);
        assert_eq!(v.data_since(c), &[4, 5]);
        v.update(c, &[9]);
        assert_eq!(v, vec![1, 2, 3, 9, 5]);
    }
}
