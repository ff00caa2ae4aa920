//! The controller session
//!
//! [`ControllerSession`] owns the link to one controller front end together with everything the
//! driver keeps about it: target addressing, the current build or stream, the flash directory,
//! the device settings and the last telemetry block. All of it sits behind one lock that the
//! background poller shares.

use crate::assembler::{FlowTargets, IoCondition};
use crate::config::SessionConfig;
use crate::encoding::{Instruction, Operands};
use crate::error::{Error, ErrorCode, Result};
use crate::fifo_buffer::CHUNK_SIZE;
use crate::flash::{FileEntry, FlashDirectory, FlashStore, LinkFlash};
use crate::link::{HardwareLink, LinkExt};
use crate::opcode;
use crate::params::{ParamSet, PARAMSET_SIZE};
use crate::sink::{BuildVariant, CommandSink, SessionMode};
use crate::status::{ListStatus, TargetStatus, CREDIT_MASK, IO_ABORT, SYS_STALL};
use crate::system::{BIOS_FRONT_END, BIOS_MASK};
use crate::transport::{refresh_target_status, Poller, Shared};
use log::{info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

pub(crate) type DynLink = dyn HardwareLink + Send;

/// Which targets list instructions and queries are addressed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TargetAddress {
    /// Targets receiving list instructions
    pub mask: u8,
    /// Lowest target in `mask`
    pub index: u8,
    /// Zero based target answering status queries
    pub query: u8,
}

impl Default for TargetAddress {
    fn default() -> Self {
        TargetAddress {
            mask: opcode::TARGET_ALL,
            index: 0,
            query: 0,
        }
    }
}

impl TargetAddress {
    fn select(&mut self, mask: u8) {
        self.mask = mask;
        self.index = (mask.trailing_zeros() & 7) as u8;
    }

    pub fn index_bit(&self) -> u8 {
        1 << self.index
    }

    pub fn query_bit(&self) -> u8 {
        1 << self.query
    }
}

/// Everything guarded by the session lock
pub(crate) struct SessionState {
    pub config: SessionConfig,
    pub link: Option<Box<DynLink>>,
    pub sink: CommandSink,
    pub directory: FlashDirectory,
    pub params: ParamSet,
    pub address: TargetAddress,
    /// Last status byte, with the stall bit cleared once chunks were sent
    pub status_byte: u8,
    pub target_status: TargetStatus,
    pub identity: String,
    /// Offset of the first character entry of the font being defined
    pub font_base: Option<usize>,
    /// Servo channel addressed by the channel commands
    pub channel: i8,
    /// Next slot returned by [`ControllerSession::next_file`]
    pub dir_cursor: usize,
}

impl SessionState {
    pub fn new(config: SessionConfig) -> Self {
        SessionState {
            sink: CommandSink::new(config.flash.sector_size as usize),
            directory: FlashDirectory::new(config.flash.clone()),
            params: ParamSet::defaults(&config),
            config,
            link: None,
            address: TargetAddress::default(),
            status_byte: 0,
            target_status: TargetStatus::default(),
            identity: String::new(),
            font_base: None,
            channel: 0,
            dir_cursor: 0,
        }
    }

    pub fn link(&mut self) -> Result<&mut Box<DynLink>> {
        self.link.as_mut().ok_or(Error::NotConnected)
    }

    /// Flash of the front end together with the directory describing it
    pub fn flash(&mut self) -> Result<(LinkFlash<&mut Box<DynLink>>, &mut FlashDirectory)> {
        let link = self.link.as_mut().ok_or(Error::NotConnected)?;
        Ok((LinkFlash::new(link), &mut self.directory))
    }

    pub fn send(&mut self, instruction: &Instruction) -> Result<()> {
        self.link()?.send(instruction)
    }

    pub fn request(&mut self, instruction: &Instruction, read_len: usize) -> Result<Vec<u8>> {
        self.link()?.request(instruction, read_len)
    }

    /// Checks that list instructions can be accepted right now
    pub fn ensure_list(&self) -> Result<()> {
        if self.link.is_none() {
            return Err(Error::NotConnected);
        }
        match self.sink.mode() {
            SessionMode::Streaming | SessionMode::Building(_) => Ok(()),
            mode => Err(Error::Job(mode.name())),
        }
    }

    pub fn push(&mut self, instruction: Instruction) -> Result<()> {
        self.ensure_list()?;
        self.sink.append(&instruction);
        Ok(())
    }

    /// Appends a list instruction addressed at the current target mask
    pub fn emit(&mut self, op: u8, operands: impl Operands) -> Result<()> {
        let target = self.address.mask;
        self.push(Instruction::new(op, target, operands))
    }

    pub fn is_broadcast(&self) -> bool {
        self.sink.mode() == SessionMode::Building(BuildVariant::Broadcast)
    }

    pub fn flow_targets(&self) -> FlowTargets {
        if self.is_broadcast() {
            FlowTargets {
                flow: self.address.mask,
                test: self.address.mask,
            }
        } else {
            FlowTargets {
                flow: 0,
                test: self.address.index_bit(),
            }
        }
    }

    /// Offset of the next instruction in the program being built
    pub fn build_offset(&self) -> Result<usize> {
        match (self.sink.mode(), self.sink.program()) {
            (SessionMode::Building(_), Some(p)) => Ok(p.offset()),
            (mode, _) => Err(Error::Job(mode.name())),
        }
    }

    /// Drops queued work and stops whatever the targets are running
    pub fn abort(&mut self) -> Result<()> {
        self.sink.discard();
        self.send(&Instruction::new(opcode::INT_SELFILE, 0, opcode::NO_FILE))?;
        self.send(&Instruction::bare(opcode::INT_ABORT, opcode::TARGET_ALL))
    }

    fn handshake(&mut self) -> Result<()> {
        let id = self.request(&Instruction::bare(opcode::INT_GTID, 0), 64)?;
        let end = id.iter().position(|&b| b == 0).unwrap_or(id.len());
        self.identity = String::from_utf8_lossy(&id[..end]).into_owned();

        self.abort()?;
        self.address = TargetAddress::default();
        self.status_byte = 0;
        self.font_base = None;
        self.channel = 0;
        self.dir_cursor = 0;

        let info = self.config.flash.info_address();
        let settings = self.config.flash.settings_address();
        let (mut flash, _) = self.flash()?;
        let word = flash.read(info, 4)?;
        let sector = flash.read(settings, PARAMSET_SIZE)?;
        let bios = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        if bios & BIOS_MASK != BIOS_FRONT_END {
            warn!("unexpected front end firmware {bios:#010x}");
        }

        self.params = match ParamSet::from_sector(&sector, &self.config) {
            Some(p) => p,
            None => {
                warn!("settings sector invalid, using defaults");
                ParamSet::defaults(&self.config)
            }
        };

        let (mut flash, directory) = self.flash()?;
        directory.scan(&mut flash)
    }
}

/// Session with one controller front end and the targets behind it
pub struct ControllerSession {
    shared: Arc<Shared>,
    _poller: Poller,
}

impl ControllerSession {
    /// Creates a disconnected session and starts its poller
    pub fn new(config: SessionConfig) -> Result<Self> {
        let interval = config.poll_interval();
        let shared = Arc::new(Shared::new(SessionState::new(config)));
        let poller = Poller::spawn(shared.clone(), interval)?;
        Ok(ControllerSession {
            shared,
            _poller: poller,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.shared.lock()
    }

    pub(crate) fn suspend_polling(&self) {
        self.shared.suspend();
    }

    pub(crate) fn resume_polling(&self) {
        self.shared.resume();
    }

    /// Opens `link` to the board at `address` and loads its state
    pub fn connect(&self, address: &str, link: impl HardwareLink + Send + 'static) -> Result<()> {
        self.shared.suspend();
        let mut state = self.lock();
        if let Some(mut old) = state.link.take() {
            old.close();
        }
        let mut link: Box<DynLink> = Box::new(link);
        link.open(address)?;
        state.link = Some(link);
        if let Err(e) = state.handshake() {
            if let Some(mut link) = state.link.take() {
                link.close();
            }
            return Err(e);
        }
        info!(
            "connected to {address} ({}), {} files",
            state.identity,
            state.directory.files().count()
        );
        drop(state);
        self.shared.resume();
        Ok(())
    }

    /// Aborts whatever runs on the board and releases the link
    pub fn disconnect(&self) -> Result<()> {
        let mut state = self.lock();
        let result = if state.link.is_some() && state.sink.mode() != SessionMode::Idle {
            state.abort()
        } else {
            Ok(())
        };
        self.shared.suspend();
        state.sink.discard();
        if let Some(mut link) = state.link.take() {
            link.close();
            info!("disconnected from {}", state.identity);
        }
        result
    }

    pub fn is_connected(&self) -> bool {
        self.lock().link.is_some()
    }

    /// Identity string reported by the board at connect time
    pub fn identity(&self) -> String {
        self.lock().identity.clone()
    }

    pub fn config(&self) -> SessionConfig {
        self.lock().config.clone()
    }

    /// Stops all targets and drops everything not yet transmitted
    pub fn abort(&self) -> Result<()> {
        self.lock().abort()
    }

    /// Execution state derived from the host queue and the last status byte
    pub fn status(&self) -> Result<ListStatus> {
        let state = self.lock();
        if state.link.is_none() {
            return Err(Error::NotConnected);
        }
        let queue = state.sink.queue();
        let code = if state.status_byte & IO_ABORT != 0 {
            ErrorCode::Interlock
        } else if queue.queued() == 0 && !queue.has_tail() && state.status_byte & SYS_STALL != 0 {
            ErrorCode::Ok
        } else {
            ErrorCode::Busy
        };
        let mut counter = queue.queued() * CHUNK_SIZE;
        if code != ErrorCode::Ok {
            counter += CREDIT_MASK as usize * CHUNK_SIZE;
        }
        Ok(ListStatus { code, counter })
    }

    /// Blocks until the board reports idle
    ///
    /// Fails with `Interlock` when the IO interlock trips and with `Busy` once `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let interval = self.lock().config.poll_interval();
        loop {
            match self.status()?.code {
                ErrorCode::Ok => return Ok(()),
                ErrorCode::Interlock => return Err(Error::Interlock),
                _ if start.elapsed() >= timeout => return Err(Error::Busy),
                _ => std::thread::sleep(interval),
            }
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.lock().sink.mode()
    }

    /// Streams subsequent list instructions straight to the targets
    pub fn open_stream(&self) -> Result<()> {
        let mut state = self.lock();
        state.link()?;
        state.sink.open_stream()
    }

    /// Compiles subsequent list instructions into a program
    pub fn open_build(&self, variant: BuildVariant, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.link()?;
        state.sink.open_build(variant, name)?;
        state.font_base = None;
        Ok(())
    }

    /// Collects bytes written with [`ControllerSession::write_raw`] into a file
    pub fn open_raw_file(&self, name: &str, slot: Option<usize>) -> Result<()> {
        let mut state = self.lock();
        state.link()?;
        if let Some(s) = slot {
            if s >= state.config.flash.files {
                return Err(Error::data(format!("file slot {s} out of range")));
            }
        }
        state.sink.open_raw_file(name, slot)
    }

    pub fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        self.lock().sink.append_raw(bytes)
    }

    /// Commits the open build or flushes the stream, then returns to idle
    ///
    /// Returns the file slot when the program was stored in flash.
    pub fn close_build(&self) -> Result<Option<usize>> {
        let mut state = self.lock();
        let mask = state.address.mask;
        let SessionState {
            link,
            sink,
            directory,
            ..
        } = &mut *state;
        let link = link.as_mut().ok_or(Error::NotConnected)?;
        sink.close_build(&mut LinkFlash::new(link), directory, mask)
    }

    /// Writes the open program to a host file instead of flash
    pub fn close_to_host_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.lock().sink.close_to_host_file(path.as_ref())
    }

    fn with_control(
        &self,
        f: impl FnOnce(
            &mut crate::output_buffer::ProgramBuffer,
            &mut crate::assembler::Assembler,
            FlowTargets,
        ) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.lock();
        let targets = state.flow_targets();
        let (program, assembler) = state.sink.control()?;
        f(program, assembler, targets)
    }

    pub fn if_begin(&self, cond: IoCondition) -> Result<()> {
        self.with_control(|p, a, t| {
            a.if_begin(p, cond, t);
            Ok(())
        })
    }

    pub fn if_else(&self) -> Result<()> {
        self.with_control(|p, a, t| a.if_else(p, t))
    }

    pub fn if_else_if(&self, cond: IoCondition) -> Result<()> {
        self.with_control(|p, a, t| a.if_else_if(p, cond, t))
    }

    pub fn if_end(&self) -> Result<()> {
        self.with_control(|p, a, _| a.if_end(p))
    }

    pub fn while_begin(&self, cond: IoCondition) -> Result<()> {
        self.with_control(|p, a, t| {
            a.while_begin(p, cond, t);
            Ok(())
        })
    }

    pub fn while_end(&self) -> Result<()> {
        self.with_control(|p, a, t| a.while_end(p, t))
    }

    /// Repeats the following block `count` times
    pub fn loop_begin(&self, count: u16) -> Result<()> {
        self.with_control(|p, a, t| {
            a.loop_begin(p, count, t);
            Ok(())
        })
    }

    pub fn loop_end(&self) -> Result<()> {
        self.with_control(|p, a, t| a.loop_end(p, t))
    }

    /// Addresses list instructions at the targets in `mask`
    ///
    /// Ignored while a broadcast program is being built, its mask is fixed at open.
    pub fn set_target(&self, mask: u8) -> Result<()> {
        if mask == 0 {
            return Err(Error::data("target mask selects no target"));
        }
        let mut state = self.lock();
        if !state.is_broadcast() {
            state.address.select(mask);
        }
        Ok(())
    }

    pub fn target(&self) -> TargetAddress {
        self.lock().address
    }

    /// Selects the target (1 to 8) answering status queries and refreshes its telemetry
    pub fn set_query_target(&self, target: u8) -> Result<()> {
        if !(1..=8).contains(&target) {
            return Err(Error::data(format!("query target {target} out of range")));
        }
        let mut state = self.lock();
        state.address.query = target - 1;
        if state.link.is_some() {
            refresh_target_status(&mut state)?;
        }
        Ok(())
    }

    /// One based query target
    pub fn query_target(&self) -> u8 {
        self.lock().address.query + 1
    }

    pub fn settings(&self) -> ParamSet {
        self.lock().params.clone()
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut ParamSet)) {
        f(&mut self.lock().params)
    }

    /// Writes the cached settings back to the settings sector
    pub fn store_settings(&self) -> Result<()> {
        let mut state = self.lock();
        let data = state.params.encode();
        let address = state.config.flash.settings_address();
        let (mut flash, _) = state.flash()?;
        flash.erase(address)?;
        flash.write(address, &data)
    }

    /// Valid directory entries with their slots
    pub fn files(&self) -> Vec<(usize, FileEntry)> {
        self.lock()
            .directory
            .files()
            .map(|(slot, e)| (slot, e.clone()))
            .collect()
    }

    /// Last telemetry block of the query target
    pub fn target_status(&self) -> TargetStatus {
        self.lock().target_status
    }

    pub fn io_status(&self) -> u32 {
        self.lock().target_status.io_word()
    }

    pub fn counter(&self) -> i16 {
        self.lock().target_status.counter
    }

    /// Analog input 5 to 8 of the query target
    pub fn analog(&self, nr: usize) -> Result<u8> {
        self.lock()
            .target_status
            .analog(nr)
            .ok_or_else(|| Error::data(format!("no analog input {nr}")))
    }

    pub fn resolvers(&self) -> (f64, f64) {
        self.lock().target_status.resolvers_mm()
    }

    pub fn table_positions(&self) -> (f64, f64, f64) {
        self.lock().target_status.tables_mm()
    }

    pub fn deflection_replies(&self) -> (i32, i32, i32) {
        self.lock().target_status.deflection_replies()
    }

    pub fn return_value(&self) -> u8 {
        self.lock().target_status.return_value
    }

    pub fn field_size(&self) -> f64 {
        let state = self.lock();
        state.params.field_size[state.address.query as usize]
    }

    pub fn field_size_z(&self) -> f64 {
        let state = self.lock();
        state.params.field_size_z[state.address.query as usize]
    }

    /// Highest marking or jump speed accepted for the query target
    pub fn max_speed(&self) -> f64 {
        self.field_size() * 100.0
    }

    pub fn scanner_delay(&self) -> i32 {
        let state = self.lock();
        state.params.drag_error[state.address.query as usize] as i32
    }

    pub fn setpoint_filter(&self) -> i32 {
        let state = self.lock();
        let q = state.address.query as usize;
        state.params.setpoint_fir[q] as i32 * state.params.drag_error[q] as i32 / 2
    }

    /// IO function `nr` (1 to 17) configured on the query target
    pub fn cfg_io(&self, nr: usize) -> Result<u16> {
        let state = self.lock();
        state
            .params
            .cfg_io(nr, state.address.query as usize)
            .ok_or_else(|| Error::data(format!("no IO function {nr}")))
    }

    pub fn serial(&self) -> u32 {
        self.lock().params.serial_nr
    }

    pub fn id(&self) -> String {
        self.lock().params.id.clone()
    }

    #[cfg(test)]
    pub(crate) fn program_instructions(&self) -> Vec<Instruction> {
        self.lock()
            .sink
            .program()
            .map(|p| p.instructions().collect())
            .unwrap_or_default()
    }
}

impl Drop for ControllerSession {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::FlashGeometry;
    use crate::sim::SimulatedBoard;

    pub fn config() -> SessionConfig {
        SessionConfig {
            poll_interval_ms: 2,
            flash: FlashGeometry {
                sector_size: 4096,
                info_sector: 0,
                settings_sector: 1,
                calibration_sector: 2,
                files_start: 40,
                files: 16,
                stdio_slot: 15,
            },
            ..Default::default()
        }
    }

    /// A session connected to a fresh simulated board
    pub fn session() -> (ControllerSession, SimulatedBoard) {
        let config = config();
        let board = SimulatedBoard::new(&config.flash);
        let session = ControllerSession::new(config).unwrap();
        session.connect("sim", board.clone()).unwrap();
        (session, board)
    }

    /// Stops the poller so that request logs only hold what a test sent
    pub fn quiet(session: &ControllerSession, board: &SimulatedBoard) {
        session.suspend_polling();
        let _guard = session.lock();
        board.clear_log();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::output_buffer::HEADER_SIZE;
    use crate::sim::SimulatedBoard;

    #[test]
    fn connect_resets_the_board() {
        let (session, board) = session();
        assert_eq!(session.identity(), "SIMULATED BOARD");
        assert_eq!(board.opened_address().as_deref(), Some("sim"));
        let req = board.requests();
        assert_eq!(req[0].opcode, opcode::INT_GTID);
        assert_eq!(req[1].opcode, opcode::INT_SELFILE);
        assert_eq!(req[1].operands::<u16>(), opcode::NO_FILE);
        assert_eq!(req[2].opcode, opcode::INT_ABORT);
        assert_eq!(req[2].target, opcode::TARGET_ALL);
        assert_eq!(session.target().mask, 0xff);
        assert_eq!(session.settings(), ParamSet::defaults(&config()));
    }

    #[test]
    fn reconnect_forgets_per_board_state() {
        let (session, board) = session();
        session.ch_select(2).unwrap();
        {
            let mut state = session.lock();
            state.font_base = Some(3);
            state.dir_cursor = 5;
            state.address.query = 4;
        }
        session.connect("sim", board).unwrap();

        let state = session.lock();
        assert_eq!(state.font_base, None);
        assert_eq!(state.channel, 0);
        assert_eq!(state.dir_cursor, 0);
        assert_eq!(state.address, TargetAddress::default());
    }

    #[test]
    fn connect_failure_leaves_session_disconnected() {
        let config = config();
        let board = SimulatedBoard::new(&config.flash);
        board.set_offline(true);
        let session = ControllerSession::new(config).unwrap();
        let e = session.connect("sim", board).unwrap_err();
        assert_eq!(e.code(), ErrorCode::Hardware);
        assert!(!session.is_connected());
        assert!(matches!(session.status(), Err(Error::NotConnected)));
    }

    #[test]
    fn stored_settings_are_loaded_on_connect() {
        let (session, board) = session();
        session.update_settings(|p| {
            p.serial_nr = 1234;
            p.field_size[2] = 50.0;
        });
        session.store_settings().unwrap();
        session.disconnect().unwrap();
        session.connect("sim", board).unwrap();
        assert_eq!(session.serial(), 1234);
        session.set_query_target(3).unwrap();
        assert_eq!(session.field_size(), 50.0);
        assert_eq!(session.max_speed(), 5000.0);
    }

    #[test]
    fn compiled_if_block_is_stored() {
        let (session, board) = session();
        session.open_build(BuildVariant::File, "demo").unwrap();
        session.if_begin(IoCondition::equal(1, 1)).unwrap();
        session.move_xy(10.0, 20.0).unwrap();
        session.if_end().unwrap();
        assert_eq!(session.close_build().unwrap(), Some(1));

        let config = config();
        let image = board.flash_bytes(config.flash.slot_address(1), HEADER_SIZE + 32);
        let ops: Vec<Instruction> = image[HEADER_SIZE..]
            .chunks_exact(8)
            .map(|c| Instruction::from_bytes(c.try_into().unwrap()))
            .collect();
        let codes: Vec<u8> = ops.iter().map(|i| i.opcode).collect();
        assert_eq!(
            codes,
            [opcode::TESTIO, opcode::BRANCH, opcode::MOVETO, opcode::EOF]
        );
        assert_eq!(ops[1].operands::<i32>(), (HEADER_SIZE + 24) as i32);
        assert_eq!(ops[2].operands::<(i32, i32)>(), (10_000, 20_000));
        assert_eq!(board.file_name(1).as_deref(), Some("demo"));
        assert_eq!(session.files()[0].1.name, "demo");
    }

    #[test]
    fn streamed_instructions_reach_the_board() {
        let (session, board) = session();
        session.open_stream().unwrap();
        session.move_xy(1.0, 2.0).unwrap();
        session.move_xy(3.0, 4.0).unwrap();
        assert_eq!(session.status().unwrap().code, ErrorCode::Busy);
        session.close_build().unwrap();
        session.wait_idle(Duration::from_secs(5)).unwrap();
        let moves: Vec<(i32, i32)> = board
            .streamed()
            .iter()
            .filter(|i| i.opcode == opcode::MOVETO)
            .map(|i| i.operands())
            .collect();
        assert_eq!(moves, [(1000, 2000), (3000, 4000)]);
    }

    #[test]
    fn list_instructions_need_an_open_mode() {
        let (session, _board) = session();
        let e = session.move_xy(1.0, 1.0).unwrap_err();
        assert_eq!(e.code(), ErrorCode::Job);
        assert_eq!(session.if_end().unwrap_err().code(), ErrorCode::Job);
    }

    #[test]
    fn interlock_is_reported() {
        let (session, board) = session();
        board.set_status(15, true, true);
        let e = session.wait_idle(Duration::from_secs(5)).unwrap_err();
        assert_eq!(e.code(), ErrorCode::Interlock);
    }

    #[test]
    fn broadcast_build_keeps_its_mask() {
        let (session, _board) = session();
        session.set_target(0x06).unwrap();
        assert_eq!(session.target().index, 1);
        session.open_build(BuildVariant::Broadcast, "").unwrap();
        session.set_target(0x01).unwrap();
        assert_eq!(session.target().mask, 0x06);
        session.while_begin(IoCondition::not_equal(0, 4)).unwrap();
        session.while_end().unwrap();
        let program = session.program_instructions();
        assert_eq!(program[0].opcode, opcode::TESTIO);
        assert_eq!(program[0].target, 0x06);
        assert_eq!(program[1].target, 0x06);
        assert_eq!(program[2].operands::<i32>(), HEADER_SIZE as i32);
    }

    #[test]
    fn query_target_is_range_checked() {
        let (session, board) = session();
        board.set_target_status(
            7,
            TargetStatus {
                counter: 12,
                analog: [9, 8, 7, 6],
                ..Default::default()
            },
        );
        assert!(session.set_query_target(0).is_err());
        assert!(session.set_query_target(9).is_err());
        session.suspend_polling();
        session.set_query_target(8).unwrap();
        assert_eq!(session.query_target(), 8);
        assert_eq!(session.counter(), 12);
        assert_eq!(session.analog(8).unwrap(), 6);
        assert!(session.analog(1).is_err());
    }

    #[test]
    fn abort_discards_open_build() {
        let (session, board) = session();
        session.open_build(BuildVariant::File, "x").unwrap();
        quiet(&session, &board);
        session.abort().unwrap();
        assert_eq!(session.mode(), SessionMode::Idle);
        assert_eq!(board.requests_with(opcode::INT_ABORT).len(), 1);
    }

    #[test]
    fn disconnect_releases_the_link() {
        let (session, board) = session();
        session.disconnect().unwrap();
        assert!(board.opened_address().is_none());
        assert!(!session.is_connected());
        assert!(matches!(session.open_stream(), Err(Error::NotConnected)));
    }
}
