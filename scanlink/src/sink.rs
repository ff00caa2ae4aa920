//! Routing of encoded instructions
//!
//! Depending on the session mode an instruction is either streamed to the board through the
//! chunk queue or appended to a program image that gets committed when the build closes.

use crate::assembler::Assembler;
use crate::encoding::Instruction;
use crate::error::{Error, Result};
use crate::fifo_buffer::ChunkQueue;
use crate::flash::{FileKind, FlashDirectory, FlashStore, BOOT_FILE, NAME_MAX};
use crate::opcode;
use crate::output_buffer::{ProgramBuffer, HEADER_SIZE};
use log::debug;
use std::path::Path;

/// Largest program that can be streamed as one code block
pub const CODE_BLOCK_MAX: usize = 0x20000;

/// What happens with a compiled program when its build closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildVariant {
    /// Streamed as a code block to the default target
    List,
    /// Stored as the power up program
    Boot,
    /// Streamed as a code block, like `List`
    Load,
    /// Streamed as a code block addressed at the current target mask
    Broadcast,
    /// Stored as a named file
    File,
}

impl BuildVariant {
    /// Vendor list mode number
    pub fn list_mode(self) -> u8 {
        match self {
            BuildVariant::List => 1,
            BuildVariant::File => 2,
            BuildVariant::Boot => 3,
            BuildVariant::Load => 4,
            BuildVariant::Broadcast => 5,
        }
    }

    fn streams(self) -> bool {
        matches!(
            self,
            BuildVariant::List | BuildVariant::Load | BuildVariant::Broadcast
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Idle,
    Streaming,
    Building(BuildVariant),
    /// Bytes are collected verbatim for a file upload
    RawFile,
}

impl SessionMode {
    pub fn name(self) -> &'static str {
        match self {
            SessionMode::Idle => "idle",
            SessionMode::Streaming => "streaming",
            SessionMode::Building(_) => "building",
            SessionMode::RawFile => "writing a raw file",
        }
    }
}

#[derive(Debug)]
struct Build {
    program: ProgramBuffer,
    assembler: Assembler,
    name: String,
    slot: Option<usize>,
}

#[derive(Debug)]
pub struct CommandSink {
    mode: SessionMode,
    queue: ChunkQueue,
    build: Option<Build>,
    grow_step: usize,
}

fn nop() -> Instruction {
    Instruction::bare(opcode::NOP, 0)
}

impl CommandSink {
    /// `grow_step` is the allocation increment of program images, normally one sector
    pub fn new(grow_step: usize) -> Self {
        CommandSink {
            mode: SessionMode::Idle,
            queue: ChunkQueue::new(),
            build: None,
            grow_step,
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn queue(&self) -> &ChunkQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut ChunkQueue {
        &mut self.queue
    }

    pub fn append(&mut self, instruction: &Instruction) {
        match (self.mode, self.build.as_mut()) {
            (SessionMode::Building(_) | SessionMode::RawFile, Some(build)) => {
                build.program.push(instruction)
            }
            _ => self.queue.push(instruction),
        }
    }

    /// Appends raw file content, only valid while a raw file is open
    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<()> {
        match (self.mode, self.build.as_mut()) {
            (SessionMode::RawFile, Some(build)) => {
                build.program.push_raw(bytes);
                Ok(())
            }
            (mode, _) => Err(Error::Job(mode.name())),
        }
    }

    fn ensure_no_build(&self) -> Result<()> {
        match self.mode {
            SessionMode::Building(_) | SessionMode::RawFile => {
                Err(Error::data("a program build is already open"))
            }
            _ => Ok(()),
        }
    }

    pub fn open_stream(&mut self) -> Result<()> {
        self.ensure_no_build()?;
        self.mode = SessionMode::Streaming;
        Ok(())
    }

    /// Starts compiling a program
    ///
    /// `name` is only used by the `File` variant, the boot program always gets its fixed name.
    pub fn open_build(&mut self, variant: BuildVariant, name: &str) -> Result<()> {
        self.ensure_no_build()?;
        let name = match variant {
            BuildVariant::Boot => BOOT_FILE,
            BuildVariant::File if name.is_empty() => {
                return Err(Error::data("a file build needs a name"))
            }
            _ => name,
        };
        if name.len() > NAME_MAX {
            return Err(Error::data(format!("file name longer than {NAME_MAX} bytes")));
        }
        self.build = Some(Build {
            program: ProgramBuffer::new(self.grow_step),
            assembler: Assembler::new(),
            name: name.to_owned(),
            slot: None,
        });
        self.mode = SessionMode::Building(variant);
        debug!("build opened: {variant:?} {name:?}");
        Ok(())
    }

    /// Starts collecting bytes for a file stored verbatim
    pub fn open_raw_file(&mut self, name: &str, slot: Option<usize>) -> Result<()> {
        self.ensure_no_build()?;
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(Error::data(format!("file name must be 1 to {NAME_MAX} bytes")));
        }
        self.build = Some(Build {
            program: ProgramBuffer::new(self.grow_step),
            assembler: Assembler::new(),
            name: name.to_owned(),
            slot,
        });
        self.mode = SessionMode::RawFile;
        Ok(())
    }

    /// The open program and its control flow stack
    pub fn control(&mut self) -> Result<(&mut ProgramBuffer, &mut Assembler)> {
        match (self.mode, self.build.as_mut()) {
            (SessionMode::Building(_), Some(build)) => {
                Ok((&mut build.program, &mut build.assembler))
            }
            (mode, _) => Err(Error::Job(mode.name())),
        }
    }

    /// The open program image
    pub fn program(&self) -> Option<&ProgramBuffer> {
        self.build.as_ref().map(|b| &b.program)
    }

    /// Checks that the open build can be committed without losing it
    fn check_commit(&self) -> Result<()> {
        let Some(build) = self.build.as_ref() else {
            return Ok(());
        };
        match self.mode {
            SessionMode::Building(variant) => {
                build.assembler.ensure_closed()?;
                if variant.streams() && build.program.len() >= CODE_BLOCK_MAX {
                    return Err(Error::data("program too large for a code block"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn stream_block(&mut self, program: &ProgramBuffer, target: u8) {
        let size = (program.len() - HEADER_SIZE) as i32;
        self.queue
            .push(&Instruction::new(opcode::CCODE_BEGIN, target, size));
        for i in program.instructions() {
            self.queue.push(&i);
        }
        self.queue.push(&Instruction::bare(opcode::CCODE_END, target));
    }

    /// Finishes the current mode and returns to idle
    ///
    /// A build with open control structures is rejected and stays open. Otherwise the program is
    /// committed (stored in flash, or streamed as a code block) and the partially filled stream
    /// chunk is padded so it gets transmitted. `mask` is the target mask of the session.
    pub fn close_build<F: FlashStore + ?Sized>(
        &mut self,
        flash: &mut F,
        directory: &mut FlashDirectory,
        mask: u8,
    ) -> Result<Option<usize>> {
        self.check_commit()?;
        let mode = self.mode;
        let build = self.build.take();
        let result = match (mode, build) {
            (SessionMode::Building(variant), Some(build)) if variant.streams() => {
                let target = if variant == BuildVariant::Broadcast {
                    mask
                } else {
                    0
                };
                self.stream_block(&build.program, target);
                Ok(None)
            }
            (SessionMode::Building(_), Some(build)) => directory
                .close_file(flash, build.program, &build.name, None, FileKind::Program)
                .map(Some),
            (SessionMode::RawFile, Some(build)) => directory
                .close_file(flash, build.program, &build.name, build.slot, FileKind::Raw)
                .map(Some),
            _ => Ok(None),
        };
        self.queue.flush_tail(&nop());
        self.mode = SessionMode::Idle;
        result
    }

    /// Writes the open program to a host file instead of flash
    pub fn close_to_host_file(&mut self, path: &Path) -> Result<()> {
        let mode = self.mode;
        match mode {
            SessionMode::Building(_) | SessionMode::RawFile => {}
            _ => return Err(Error::Job(mode.name())),
        }
        self.check_commit()?;
        let Some(mut build) = self.build.take() else {
            return Err(Error::Job(mode.name()));
        };
        self.mode = SessionMode::Idle;
        self.queue.flush_tail(&nop());
        if mode != SessionMode::RawFile {
            build.program.push(&Instruction::bare(opcode::EOF, 0));
        }
        let image = build.program.into_bytes();
        std::fs::write(path, &image[HEADER_SIZE..]).map_err(|e| Error::host_file(path, e))?;
        debug!("wrote {} program bytes to {}", image.len(), path.display());
        Ok(())
    }

    /// Drops everything not yet transmitted along with any open build
    pub fn discard(&mut self) {
        self.queue.clear();
        self.build = None;
        self.mode = SessionMode::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{FlowTargets, IoCondition};
    use crate::config::FlashGeometry;
    use crate::error::ErrorCode;
    use crate::fifo_buffer::CHUNK_INSTRUCTIONS;
    use crate::sim::MemoryFlash;

    const TARGETS: FlowTargets = FlowTargets { flow: 0, test: 1 };

    fn setup() -> (CommandSink, MemoryFlash, FlashDirectory) {
        let geometry = FlashGeometry {
            sector_size: 1024,
            files_start: 4,
            files: 8,
            stdio_slot: 7,
            ..Default::default()
        };
        (
            CommandSink::new(1024),
            MemoryFlash::new(1024),
            FlashDirectory::new(geometry),
        )
    }

    fn moveto(x: i32) -> Instruction {
        Instruction::new(opcode::MOVETO, 1, (x, 0))
    }

    #[test]
    fn streaming_fills_chunks() {
        let (mut sink, mut flash, mut dir) = setup();
        sink.open_stream().unwrap();
        for n in 0..CHUNK_INSTRUCTIONS + 3 {
            sink.append(&moveto(n as i32));
        }
        assert_eq!(sink.queue().queued(), 1);
        assert_eq!(sink.queue().tail_len(), 3);
        assert_eq!(sink.close_build(&mut flash, &mut dir, 1).unwrap(), None);
        assert_eq!(sink.queue().queued(), 2);
        assert!(!sink.queue().has_tail());
        assert_eq!(sink.mode(), SessionMode::Idle);
    }

    #[test]
    fn second_build_is_rejected() {
        let (mut sink, _, _) = setup();
        sink.open_build(BuildVariant::File, "a").unwrap();
        let e = sink.open_build(BuildVariant::List, "").unwrap_err();
        assert_eq!(e.code(), ErrorCode::Data);
        assert_eq!(sink.mode(), SessionMode::Building(BuildVariant::File));
        assert!(sink.open_stream().is_err());
    }

    #[test]
    fn file_build_needs_a_name() {
        let (mut sink, _, _) = setup();
        assert!(sink.open_build(BuildVariant::File, "").is_err());
        assert!(sink
            .open_build(BuildVariant::File, &"n".repeat(NAME_MAX + 1))
            .is_err());
        assert_eq!(sink.mode(), SessionMode::Idle);
        sink.open_build(BuildVariant::Boot, "").unwrap();
    }

    #[test]
    fn file_build_is_stored() {
        let (mut sink, mut flash, mut dir) = setup();
        sink.open_build(BuildVariant::File, "demo").unwrap();
        {
            let (prog, asm) = sink.control().unwrap();
            asm.if_begin(prog, IoCondition::equal(1, 1), TARGETS);
        }
        sink.append(&moveto(10_000));
        {
            let (prog, asm) = sink.control().unwrap();
            asm.if_end(prog).unwrap();
        }
        assert_eq!(sink.close_build(&mut flash, &mut dir, 1).unwrap(), Some(1));
        assert_eq!(dir.search("demo"), Some(1));
        assert_eq!(dir.entries()[1].size, 256 + 4 * 8);
        assert_eq!(sink.queue().queued(), 0);
    }

    #[test]
    fn open_structure_keeps_build_open() {
        let (mut sink, mut flash, mut dir) = setup();
        sink.open_build(BuildVariant::File, "demo").unwrap();
        {
            let (prog, asm) = sink.control().unwrap();
            asm.loop_begin(prog, 3, TARGETS);
        }
        let e = sink.close_build(&mut flash, &mut dir, 1).unwrap_err();
        assert_eq!(e.code(), ErrorCode::Data);
        assert_eq!(sink.mode(), SessionMode::Building(BuildVariant::File));
        {
            let (prog, asm) = sink.control().unwrap();
            asm.loop_end(prog, TARGETS).unwrap();
        }
        assert!(sink.close_build(&mut flash, &mut dir, 1).is_ok());
        assert_eq!(dir.search("demo"), Some(1));
    }

    #[test]
    fn list_build_streams_code_block() {
        let (mut sink, mut flash, mut dir) = setup();
        sink.open_build(BuildVariant::Broadcast, "").unwrap();
        sink.append(&moveto(5));
        sink.append(&moveto(6));
        sink.close_build(&mut flash, &mut dir, 0x06).unwrap();
        let chunk = sink.queue_mut().pop_front().unwrap();
        let mut data = chunk.data();
        let mut next = || {
            let i = <Instruction as crate::encoding::Readable>::read(&mut data).unwrap();
            (i.opcode, i.target)
        };
        assert_eq!(next(), (opcode::CCODE_BEGIN, 0x06));
        assert_eq!(next(), (opcode::MOVETO, 1));
        assert_eq!(next(), (opcode::MOVETO, 1));
        assert_eq!(next(), (opcode::CCODE_END, 0x06));
        assert_eq!(next(), (opcode::NOP, 0));
        assert!(dir.files().next().is_none());
    }

    #[test]
    fn control_flow_needs_a_build() {
        let (mut sink, _, _) = setup();
        assert_eq!(sink.control().unwrap_err().code(), ErrorCode::Job);
        sink.open_raw_file("blob", None).unwrap();
        assert_eq!(sink.control().unwrap_err().code(), ErrorCode::Job);
        sink.append_raw(b"abc").unwrap();
        assert_eq!(sink.program().unwrap().body(), b"abc");
    }

    #[test]
    fn program_written_to_host_file() {
        let (mut sink, _, _) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.bin");
        sink.open_build(BuildVariant::File, "x").unwrap();
        sink.append(&moveto(1));
        sink.close_to_host_file(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[14], opcode::EOF);
        assert_eq!(sink.mode(), SessionMode::Idle);
    }

    #[test]
    fn discard_drops_everything() {
        let (mut sink, _, _) = setup();
        sink.open_stream().unwrap();
        sink.append(&moveto(1));
        sink.discard();
        assert!(!sink.queue().has_tail());
        assert_eq!(sink.mode(), SessionMode::Idle);
    }

    #[test]
    fn streaming_sink_formats_for_logging() {
        let (mut sink, _, _) = setup();
        sink.open_stream().unwrap();
        for n in 0..CHUNK_INSTRUCTIONS + 1 {
            sink.append(&moveto(n as i32));
        }
        let text = format!("{sink:?}");
        assert!(text.contains("Streaming"));
        assert!(text.contains("queued"));
        assert!(text.contains("tail"));
    }
}
