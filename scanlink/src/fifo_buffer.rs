use crate::encoding::{Instruction, INSTRUCTION_SIZE};
use std::collections::VecDeque;

/// Instructions per streamed chunk
pub const CHUNK_INSTRUCTIONS: usize = 128;

/// Bytes per streamed chunk
pub const CHUNK_SIZE: usize = CHUNK_INSTRUCTIONS * INSTRUCTION_SIZE;

/// Fixed capacity block of streamed instructions
///
/// The board's receive buffer takes exactly one chunk per credit, so chunks are only ever
/// transmitted full.
#[derive(Debug, Clone)]
pub struct CommandChunk<const BUF_SIZE: usize = CHUNK_SIZE> {
    buffer: [u8; BUF_SIZE],
    used: usize,
}

impl<const BUF_SIZE: usize> CommandChunk<BUF_SIZE> {
    pub const fn new() -> Self {
        CommandChunk {
            buffer: [0u8; BUF_SIZE],
            used: 0,
        }
    }

    /// Checks for buffer emptiness
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used + INSTRUCTION_SIZE > BUF_SIZE
    }

    /// Number of instructions stored
    pub fn len(&self) -> usize {
        self.used / INSTRUCTION_SIZE
    }

    /// Appends one instruction, returning false if the chunk is already full
    pub fn push(&mut self, instruction: &Instruction) -> bool {
        if self.is_full() {
            return false;
        }
        self.buffer[self.used..self.used + INSTRUCTION_SIZE]
            .copy_from_slice(&instruction.to_bytes());
        self.used += INSTRUCTION_SIZE;
        true
    }

    /// Returns the filled part of the buffer
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.used]
    }
}

impl<const BUF_SIZE: usize> Default for CommandChunk<BUF_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

/// Streamed instructions awaiting transmission
///
/// Only the tail chunk may be partially filled. It moves to the FIFO as soon as it is full.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    tail: Option<Box<CommandChunk>>,
    queued: VecDeque<Box<CommandChunk>>,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instruction: &Instruction) {
        let tail = self.tail.get_or_insert_with(Default::default);
        tail.push(instruction);
        if tail.is_full() {
            if let Some(full) = self.tail.take() {
                self.queued.push_back(full);
            }
        }
    }

    /// Fills the partial tail chunk with `pad` so that it gets queued
    pub fn flush_tail(&mut self, pad: &Instruction) {
        while self.tail.is_some() {
            self.push(pad);
        }
    }

    /// Removes the oldest full chunk
    pub fn pop_front(&mut self) -> Option<Box<CommandChunk>> {
        self.queued.pop_front()
    }

    /// Number of full chunks ready for transmission
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    pub fn has_tail(&self) -> bool {
        self.tail.is_some()
    }

    /// Instructions buffered in the partial tail
    pub fn tail_len(&self) -> usize {
        self.tail.as_ref().map_or(0, |t| t.len())
    }

    /// Discards everything not yet transmitted
    pub fn clear(&mut self) {
        self.tail = None;
        self.queued.clear();
    }
}
