//! List instructions
//!
//! Every operation here encodes one or a few instructions and hands them to the session's
//! command sink, so they work the same whether the session streams or builds a program. Lengths
//! are in millimetres and become micrometre integers on the wire.

use crate::encoding::{Instruction, Operands, Payload, PAYLOAD_SIZE};
use crate::error::{Error, Result};
use crate::opcode;
use crate::session::{ControllerSession, SessionState};
use std::net::Ipv4Addr;

/// Longest text accepted by [`ControllerSession::print`]
pub const PRINT_MAX: usize = 254;

/// Characters in a font table
const FONT_CHARS: usize = 256;

fn um(v: f64) -> i32 {
    (v * 1000.0) as i32
}

fn check_nr(nr: u8, max: u8, what: &str) -> Result<i8> {
    if (1..=max).contains(&nr) {
        Ok(nr as i8)
    } else {
        Err(Error::data(format!("{what} {nr} out of range 1..={max}")))
    }
}

fn flat_bulge(bf: f64) -> bool {
    bf.abs() < 1e-6
}

/// Parses a hex string into a length prefixed byte string
pub(crate) fn hex_bstring(hex: &str) -> Result<Vec<u8>> {
    let n = hex.len() / 2;
    if n > 255 {
        return Err(Error::data("hex string longer than 255 bytes"));
    }
    let mut out = Vec::with_capacity(n + 1);
    out.push(n as u8);
    for i in 0..n {
        let pair = hex
            .get(i * 2..i * 2 + 2)
            .ok_or_else(|| Error::data("hex string is not ASCII"))?;
        let b = u8::from_str_radix(pair, 16)
            .map_err(|_| Error::data(format!("bad hex digits {pair:?}")))?;
        out.push(b);
    }
    Ok(out)
}

pub(crate) fn parse_ip(ip: &str) -> Result<[u8; 4]> {
    ip.parse::<Ipv4Addr>()
        .map(|a| a.octets())
        .map_err(|_| Error::data(format!("bad IP address {ip:?}")))
}

/// IP address and port packed the way the UDP instructions expect them
pub(crate) fn udp_operands(ip: [u8; 4], port: u16) -> (i16, i16, i8, i8) {
    (
        u16::from_le_bytes([ip[0], ip[1]]) as i16,
        u16::from_le_bytes([ip[2], ip[3]]) as i16,
        port as u8 as i8,
        (port >> 8) as u8 as i8,
    )
}

impl SessionState {
    /// Appends a byte string as a run of 6 byte string instructions
    fn push_bstring(&mut self, data: &[u8], target: u8) -> Result<()> {
        for (n, piece) in data.chunks(PAYLOAD_SIZE).enumerate() {
            let mut payload: Payload = [0; PAYLOAD_SIZE];
            payload[..piece.len()].copy_from_slice(piece);
            let op = if n == 0 {
                opcode::BSTR0
            } else {
                opcode::BSTRN
            };
            self.push(Instruction::new(op, target, payload))?;
        }
        Ok(())
    }

    /// Offset an instruction appended now would have, zero while streaming
    fn list_offset(&self) -> usize {
        self.build_offset().unwrap_or(0)
    }

    fn wait_target_idle(&mut self, target: u8) -> Result<()> {
        self.push(Instruction::bare(opcode::INT_WAITIDLE, 1 << (target & 7)))
    }
}

impl ControllerSession {
    fn list(&self, f: impl FnOnce(&mut SessionState) -> Result<()>) -> Result<()> {
        let mut state = self.lock();
        state.ensure_list()?;
        f(&mut state)
    }

    fn list_op(&self, op: u8, operands: impl Operands) -> Result<()> {
        self.lock().emit(op, operands)
    }

    // Motion

    pub fn jump_xy(&self, x: f64, y: f64) -> Result<()> {
        self.list_op(opcode::JUMPTO, (um(x), um(y)))
    }

    pub fn move_xy(&self, x: f64, y: f64) -> Result<()> {
        self.list_op(opcode::MOVETO, (um(x), um(y)))
    }

    pub fn line_xy(&self, x: f64, y: f64) -> Result<()> {
        self.list_op(opcode::LINETO, (um(x), um(y)))
    }

    pub fn pulse_xy(&self, x: f64, y: f64) -> Result<()> {
        self.list_op(opcode::PULSTO, (um(x), um(y)))
    }

    fn op_3d(&self, op: u8, x: f64, y: f64, z: f64) -> Result<()> {
        self.list(|s| {
            s.emit(op, (um(x), um(y)))?;
            s.emit(opcode::PARAMS, (um(z), 0i32))
        })
    }

    pub fn jump_xyz(&self, x: f64, y: f64, z: f64) -> Result<()> {
        self.op_3d(opcode::JUMPTO3D, x, y, z)
    }

    pub fn move_xyz(&self, x: f64, y: f64, z: f64) -> Result<()> {
        self.op_3d(opcode::MOVETO3D, x, y, z)
    }

    pub fn line_xyz(&self, x: f64, y: f64, z: f64) -> Result<()> {
        self.op_3d(opcode::LINETO3D, x, y, z)
    }

    /// Pulsed move, the targets have no pulsed 3D move so `z` is ignored
    pub fn pulse_xyz(&self, x: f64, y: f64, _z: f64) -> Result<()> {
        self.pulse_xy(x, y)
    }

    fn arc(&self, op: u8, x: f64, y: f64, bf: f64) -> Result<()> {
        self.list(|s| {
            s.emit(op, (um(x), um(y)))?;
            s.emit(opcode::PARAMS, bf as f32)
        })
    }

    /// Marks an arc to `(x, y)` with bulge factor `bf`, a straight line when `bf` is zero
    pub fn arc_xy(&self, x: f64, y: f64, bf: f64) -> Result<()> {
        if flat_bulge(bf) {
            return self.line_xy(x, y);
        }
        self.arc(opcode::ARCLINE, x, y, bf)
    }

    pub fn arc_move_xy(&self, x: f64, y: f64, bf: f64) -> Result<()> {
        if flat_bulge(bf) {
            return self.move_xy(x, y);
        }
        self.arc(opcode::ARCMOVE, x, y, bf)
    }

    /// Circle around `(x, y)` through the current position, over `angle` degrees
    pub fn circle(&self, x: f64, y: f64, angle: f64, laser: bool) -> Result<()> {
        self.list(|s| {
            s.emit(opcode::CIRCLE, (um(x), um(y)))?;
            s.emit(opcode::PARAMS, (angle as f32, laser as i16))
        })
    }

    // Laser

    pub fn set_laser(&self, on: bool) -> Result<()> {
        self.list_op(opcode::SETLIDLE, on as u16)
    }

    pub fn set_laser_mode(&self, mode: u16) -> Result<()> {
        self.list_op(opcode::SM_LASER, mode)
    }

    pub fn set_laser_times(&self, gate_on_delay: u16, gate_off_delay: u16) -> Result<()> {
        self.list_op(opcode::SETDELAYS, (gate_on_delay, gate_off_delay))
    }

    /// First pulse duration in microseconds
    pub fn set_laser_first_pulse(&self, time: f64) -> Result<()> {
        self.list_op(opcode::SETLASERDELAY, (time * 80.0) as i32)
    }

    pub fn set_min_gate_period(&self, period: u16) -> Result<()> {
        self.list_op(opcode::SETMINGATE, period)
    }

    pub fn set_bulge(&self, factor: f64) -> Result<()> {
        self.list_op(opcode::SETBULGE, factor as f32)
    }

    pub fn burst(&self, time: i32) -> Result<()> {
        self.list_op(opcode::BURST, time)
    }

    /// Burst of `time` followed by `time2` at duty cycle `pwm2`
    pub fn burst_ex(&self, time: i32, time2: i32, pwm2: f64) -> Result<()> {
        if pwm2 == 0.0 {
            return self.burst(time);
        }
        self.list_op(
            opcode::BURST,
            (
                time as u16 as i16,
                time2 as u16 as i16,
                (pwm2 * 80.0) as u16 as i16,
            ),
        )
    }

    /// Oscillator `nr` with period and pulse in microseconds
    ///
    /// Periods above 500 us are halved together with the pulse until they fit, up to six times;
    /// the number of halvings goes out as the pre-scaler.
    pub fn set_pwm(&self, nr: u8, period: f64, pulse: f64) -> Result<()> {
        let (mut period, mut pulse, mut mult) = (period, pulse, 0i8);
        while period > 500.0 && mult < 6 {
            period /= 2.0;
            pulse /= 2.0;
            mult += 1;
        }
        self.list_op(
            opcode::SETOSC,
            (
                (period * 80.0) as u16 as i16,
                (pulse * 80.0) as u16 as i16,
                nr as i8,
                mult,
            ),
        )
    }

    pub fn laser_link(&self, command: u16, value: u16) -> Result<()> {
        self.list_op(opcode::EXCHLLINK, (value, command))
    }

    // Parameters

    fn check_speed(&self, speed: f64) -> Result<()> {
        let max = self.max_speed();
        if speed > max {
            return Err(Error::data(format!("speed {speed} above maximum {max}")));
        }
        Ok(())
    }

    pub fn set_speed(&self, speed: f64) -> Result<()> {
        self.check_speed(speed)?;
        self.list_op(opcode::SPEED, speed as f32)
    }

    pub fn set_jump_speed(&self, speed: f64) -> Result<()> {
        self.check_speed(speed)?;
        self.list_op(opcode::JUMPSPEED, speed as f32)
    }

    /// Field size of the addressed targets, sent with their channel functions
    pub fn set_field_size(&self, size: f64) -> Result<()> {
        self.list(|s| {
            let idx = s.address.index as usize;
            let (ch1, ch2) = (s.params.fct_ch1[idx], s.params.fct_ch2[idx]);
            s.emit(opcode::SETFS, (um(size), ch1, ch2))
        })
    }

    pub fn set_rotation(&self, angle: f64) -> Result<()> {
        self.list_op(opcode::SETROT, angle as f32)
    }

    fn matrix(&self, op: u8, a: [f64; 4]) -> Result<()> {
        self.list(|s| {
            for (n, v) in a.iter().enumerate() {
                let (row, col) = (n as i8 / 2 + 1, n as i8 % 2 + 1);
                s.emit(op, (*v as f32, row, col))?;
            }
            Ok(())
        })
    }

    pub fn set_aij(&self, a11: f64, a12: f64, a21: f64, a22: f64) -> Result<()> {
        self.matrix(opcode::SETAIJ, [a11, a12, a21, a22])
    }

    /// Image transformation matrix, the translation row is set with the image offsets
    pub fn set_image_aij(&self, a11: f64, a12: f64, a21: f64, a22: f64) -> Result<()> {
        self.matrix(opcode::SETIMGAIJ, [a11, a12, a21, a22])
    }

    pub fn set_offs_xy(&self, x: f64, y: f64) -> Result<()> {
        self.list_op(opcode::SETOFFS, (um(x), um(y)))
    }

    pub fn set_offs_z(&self, z: f64) -> Result<()> {
        self.list_op(opcode::SETOFFSZ, um(z))
    }

    pub fn set_image_rotation(&self, angle: f64) -> Result<()> {
        self.list_op(opcode::SETIMGROT, angle as f32)
    }

    pub fn set_image_offs_xy(&self, x: f64, y: f64) -> Result<()> {
        self.list_op(opcode::SETIMGOFFS, (um(x), um(y)))
    }

    pub fn set_image_offs_rel_xy(&self, x: f64, y: f64) -> Result<()> {
        self.list_op(opcode::SETIMGOFFSR, (um(x), um(y)))
    }

    pub fn set_image_offs_z(&self, z: f64) -> Result<()> {
        self.list_op(opcode::SETIMGOFFSZ, um(z))
    }

    /// Circular wobble of diameter `diam` at `freq` Hz
    pub fn set_wobble(&self, diam: f64, freq: i16) -> Result<()> {
        self.set_wobble_ex(1, diam / 2.0, freq, 1, diam / 2.0, 0, 90)
    }

    /// Wobble with separate normal and tangential components
    #[allow(clippy::too_many_arguments)]
    pub fn set_wobble_ex(
        &self,
        n_type: i8,
        n_ampl: f64,
        n_freq: i16,
        t_type: i8,
        t_ampl: f64,
        t_harm: i32,
        t_phase: i16,
    ) -> Result<()> {
        self.list(|s| {
            s.emit(opcode::SETWOBBLE, ((n_ampl * 1000.0) as f32, n_freq))?;
            s.emit(opcode::PARAMS, ((t_ampl * 1000.0) as f32, t_phase))?;
            s.emit(opcode::PARAMS, (t_harm, n_type, t_type))
        })
    }

    // IO

    pub fn set_io(&self, value: u16, mask: u16) -> Result<()> {
        self.list_op(opcode::SETIO, (value, mask))
    }

    pub fn set_analog(&self, value: u16, mask: u16) -> Result<()> {
        self.list_op(opcode::SETANA, (value, mask))
    }

    fn io_wait(&self, list_op: u8, int_op: u8, value: u16, mask: u16, equal: bool) -> Result<()> {
        let operands = (value as i16, mask as i16, equal as i8, 0i8);
        self.list(|s| {
            if s.is_broadcast() {
                return s.emit(list_op, operands);
            }
            let index = s.address.index;
            s.wait_target_idle(index)?;
            s.push(Instruction::new(int_op, 1 << index, operands))
        })
    }

    /// Holds execution until `(inputs & mask) == value`, or `!=` when `equal` is false
    pub fn wait_io(&self, value: u16, mask: u16, equal: bool) -> Result<()> {
        self.io_wait(opcode::WAITIO, opcode::INT_WAITIO, value, mask, equal)
    }

    /// Sets the condition flag tested by the next conditional instruction
    pub fn test_io(&self, value: u16, mask: u16, equal: bool) -> Result<()> {
        self.io_wait(opcode::TESTIO, opcode::INT_TESTIO, value, mask, equal)
    }

    /// Configures IO function `nr` (1 to 17) of the addressed target
    pub fn set_cfg_io(&self, nr: u8, value: i32) -> Result<()> {
        check_nr(nr, crate::params::CFG_IO_COUNT as u8, "IO function")?;
        self.list(|s| {
            let idx = s.address.index as usize;
            s.params.set_cfg_io(nr as usize, idx, value as u16);
            s.emit(
                opcode::CFG_IO,
                (value as u16 as i16, nr as i16, (value >> 16) as i8, 0i8),
            )
        })
    }

    pub fn set_counter(&self, value: u16) -> Result<()> {
        self.list_op(opcode::SETCNTR, (0u16, value))
    }

    pub fn reset_counter(&self) -> Result<()> {
        self.list_op(opcode::SETCNTR, ())
    }

    pub fn increment_counter(&self) -> Result<()> {
        self.list_op(opcode::SETCNTR, (0xffffu16, 1u16))
    }

    /// Gates the following marking on an IO condition
    pub fn set_while_io(&self, value: u16, mask: u16) -> Result<()> {
        self.list_op(opcode::WHILEIO, (value, mask))
    }

    pub fn set_table_while_io(&self, value: u16, mask: u16) -> Result<()> {
        self.list_op(opcode::TABLEWHILEIO, (value, mask))
    }

    // Tables

    fn table_op(&self, op: u8, nr: u8, operand: impl FnOnce(i8) -> (i32, i8, i8)) -> Result<()> {
        let nr = check_nr(nr, 3, "table")?;
        self.list_op(op, operand(nr))
    }

    pub fn set_table(&self, nr: u8, position: f64) -> Result<()> {
        self.table_op(opcode::TABLESET, nr, |nr| (um(position), nr, 0))
    }

    pub fn set_table_delay(&self, nr: u8, delay: i32) -> Result<()> {
        self.table_op(opcode::TABLEDELAY, nr, |nr| (delay, nr, 0))
    }

    pub fn set_table_snap_size(&self, nr: u8, snap: f64) -> Result<()> {
        self.table_op(opcode::TABLESNAP, nr, |nr| (um(snap), nr, 0))
    }

    pub fn set_table_step_size(&self, nr: u8, step: f64) -> Result<()> {
        let nr = check_nr(nr, 3, "table")?;
        self.list_op(opcode::TABLESSIZE, ((step * 1000.0) as f32, nr, 0i8))
    }

    pub fn table_move(&self, nr: u8, target: f64) -> Result<()> {
        self.table_op(opcode::TABLE1D, nr, |nr| (um(target), nr, 0))
    }

    pub fn table_move_xy(&self, x: f64, y: f64) -> Result<()> {
        self.list_op(opcode::TABLEMOVETO, (um(x), um(y)))
    }

    pub fn table_line_xy(&self, x: f64, y: f64) -> Result<()> {
        self.list_op(opcode::TABLELINETO, (um(x), um(y)))
    }

    pub fn table_jump_xy(&self, x: f64, y: f64) -> Result<()> {
        self.list_op(opcode::TABLEJUMPTO, (um(x), um(y)))
    }

    pub fn table_arc_xy(&self, x: f64, y: f64, bf: f64) -> Result<()> {
        if flat_bulge(bf) {
            return self.table_line_xy(x, y);
        }
        self.arc(opcode::TABLEARCLINE, x, y, bf)
    }

    /// Moves table `nr` at `speed` for as long as IO condition `while_io` holds
    pub fn table_jog(&self, nr: u8, speed: f64, while_io: i8) -> Result<()> {
        self.list_op(opcode::TABLEJOG, (speed as f32, nr as i8, while_io))
    }

    /// Jumps all three tables, each at its own speed
    pub fn table_jump_3d(&self, pos: [f64; 3], speed: [f64; 3]) -> Result<()> {
        self.list(|s| {
            s.emit(opcode::TABLEJUMP3D, (um(pos[0]), um(speed[0])))?;
            s.emit(opcode::PARAMS, (um(pos[1]), um(speed[1])))?;
            s.emit(opcode::PARAMS, (um(pos[2]), um(speed[2])))
        })
    }

    // Resolvers

    /// Sets up resolver `nr` (1 or 2) and enables it at position one
    pub fn set_resolver(&self, nr: u8, step_size: f64, range: f64) -> Result<()> {
        let nr = check_nr(nr, 2, "resolver")?;
        self.list(|s| {
            s.emit(opcode::OTFSTEP, ((step_size * 1000.0) as f32, nr, 0i8))?;
            s.emit(opcode::OTFRANGE, (um(range), nr, 0i8))?;
            s.emit(opcode::OTFSET, (1i16, 0i16, nr, 0i8))?;
            s.emit(opcode::OTFENABLE, (1i16, 0i16, nr, 0i8))
        })
    }

    pub fn set_resolver_position(&self, nr: u8, position: f64) -> Result<()> {
        let nr = check_nr(nr, 2, "resolver")?;
        self.list_op(opcode::OTFSET, (um(position), nr, 0i8))
    }

    pub fn set_resolver_range(&self, nr: u8, range: f64) -> Result<()> {
        let nr = check_nr(nr, 2, "resolver")?;
        self.list_op(opcode::OTFRANGE, (um(range), nr, 0i8))
    }

    pub fn reset_resolver(&self, nr: u8) -> Result<()> {
        let nr = check_nr(nr, 2, "resolver")?;
        self.list_op(opcode::OTFSET, (0i16, 0i16, nr, 0i8))
    }

    /// Enables or disables on-the-fly correction from resolver `nr`
    pub fn set_otf(&self, nr: u8, on: bool) -> Result<()> {
        let nr = check_nr(nr, 2, "resolver")?;
        self.list_op(opcode::OTFENABLE, (on as i16, 0i16, nr, 0i8))
    }

    pub fn wait_resolver(&self, nr: u8, trigger_pos: f64, trigger_mode: i8) -> Result<()> {
        let nr = check_nr(nr, 2, "resolver")?;
        self.list_op(opcode::OTFWAIT, (um(trigger_pos), nr, trigger_mode))
    }

    // Program flow

    /// Pauses the targets for `time` microseconds
    pub fn sleep(&self, time: i32) -> Result<()> {
        self.list_op(opcode::SLEEP, time)
    }

    pub fn suspend(&self) -> Result<()> {
        self.list_op(opcode::SUSPEND, ())
    }

    /// Unconditional jump to byte offset `address` of the program
    pub fn branch(&self, address: i32) -> Result<()> {
        self.list(|s| {
            let flow = s.flow_targets().flow;
            s.push(Instruction::new(opcode::BRANCH, flow, address))
        })
    }

    /// Runs the program stored in file slot `slot`, then continues after this instruction
    pub fn sector_fetch(&self, slot: usize) -> Result<()> {
        self.list(|s| {
            if slot >= s.config.flash.files {
                return Err(Error::data(format!("file slot {slot} out of range")));
            }
            let ret = s.list_offset() + 8;
            let sector = s.config.flash.files_start as usize + slot;
            s.push(Instruction::new(
                opcode::IDXFETCH,
                0,
                (ret as i32, sector as u16),
            ))
        })
    }

    pub fn file_fetch(&self, name: &str) -> Result<()> {
        let slot = self.file_index(name)?;
        self.sector_fetch(slot)
    }

    /// Holds the list until target `target` (0 to 7) is idle
    pub fn wait_target_idle(&self, target: u8) -> Result<()> {
        self.list(|s| s.wait_target_idle(target))
    }

    pub fn wait_target_stall(&self, target: u8) -> Result<()> {
        self.list(|s| s.push(Instruction::bare(opcode::INT_WAITSTALL, 1 << (target & 7))))
    }

    /// Waits for every addressed target to become idle
    pub fn synchronise(&self) -> Result<()> {
        self.list(|s| {
            let mask = s.address.mask;
            for t in (0..8).filter(|t| mask & (1 << t) != 0) {
                s.wait_target_idle(t)?;
            }
            Ok(())
        })
    }

    // Strings

    /// Prints `text` with the current font, truncated to [`PRINT_MAX`] bytes
    pub fn print(&self, text: &str) -> Result<()> {
        let bytes = text.as_bytes();
        let bytes = &bytes[..bytes.len().min(PRINT_MAX)];
        self.list(|s| {
            let mask = s.address.mask;
            let mut data = Vec::with_capacity(bytes.len() + 1);
            data.push(bytes.len() as u8);
            data.extend_from_slice(bytes);
            s.push_bstring(&data, mask)?;
            let at = s.list_offset() as i32;
            s.emit(opcode::PRINT, at)
        })
    }

    /// Sends hex encoded `data` as a UDP datagram when execution reaches this point
    pub fn udp_send(&self, ip: &str, port: u16, data: &str) -> Result<()> {
        let ip = parse_ip(ip)?;
        let data = hex_bstring(data)?;
        self.list(|s| {
            s.push_bstring(&data, 0)?;
            s.push(Instruction::new(opcode::UDPSEND, 0, udp_operands(ip, port)))
        })
    }

    /// Initialises the CAN bus and starts the attached nodes
    pub fn open_can_link(&self, baud_rate: i32) -> Result<()> {
        let start = hex_bstring("8200")?;
        let operational = hex_bstring("0100")?;
        self.list(|s| {
            s.push(Instruction::new(opcode::CAN_INIT, 0, baud_rate))?;
            s.push_bstring(&start, 0)?;
            s.push(Instruction::new(opcode::CAN_SEND, 0, (0i16, 0i16, 0i16)))?;
            s.push(Instruction::new(opcode::SLEEP, 0, 1_000_000i32))?;
            s.push_bstring(&operational, 0)?;
            s.push(Instruction::new(opcode::CAN_SEND, 0, (0i16, 0i16, 0i16)))
        })
    }

    /// Writes hex encoded `data` to an object of a CAN node
    pub fn set_can_link(&self, node: u16, index: u16, sub_index: i8, data: &str) -> Result<()> {
        let data = hex_bstring(data)?;
        self.list(|s| {
            s.push_bstring(&data, 0)?;
            s.push(Instruction::new(
                opcode::CAN_SEND,
                0,
                (node as i16, index as i16, sub_index, 0i8),
            ))
        })
    }

    /// Polls an object of a CAN node into reply slot `address`
    pub fn scan_can_link(&self, address: i8, node: u16, index: u16, sub_index: i8) -> Result<()> {
        self.list(|s| {
            s.push(Instruction::new(
                opcode::CAN_SCAN,
                0,
                (node as i16, index as i16, sub_index, address),
            ))
        })
    }

    pub fn wait_can_link(&self, address: i8, value: u16, mask: u16) -> Result<()> {
        self.list(|s| {
            let index = s.address.index;
            s.wait_target_idle(index)?;
            s.push(Instruction::new(
                opcode::CAN_WAIT,
                0,
                (value as i16, mask as i16, 0i8, address),
            ))
        })
    }

    /// Calls `size` variable blocks starting at `start`
    pub fn var_block_fetch(&self, start: u16, size: u16) -> Result<()> {
        self.list(|s| {
            for i in 0..size {
                s.push(Instruction::new(opcode::VAR_CALL, 0, start.wrapping_add(i)))?;
            }
            Ok(())
        })
    }

    pub fn set_var_block(&self, index: u16, data: u8) -> Result<()> {
        self.list(|s| s.push(Instruction::new(opcode::VAR_SET, 0, (index, data as u16))))
    }

    // Fonts

    /// Starts a font table in the program being built
    ///
    /// Only one font per program is supported. Every character starts out empty and gets its
    /// entry patched by [`ControllerSession::char_def`].
    pub fn font_def(&self) -> Result<()> {
        self.list(|s| {
            let base = s.build_offset()? + 8;
            s.font_base = Some(base);
            s.push(Instruction::new(opcode::FONTHDR, 0, base as i32))?;
            for _ in 0..FONT_CHARS {
                s.push(Instruction::bare(opcode::CHAR_END, 0))?;
            }
            Ok(())
        })
    }

    /// Starts the instructions drawing character `ascii`
    pub fn char_def(&self, ascii: u8) -> Result<()> {
        self.list(|s| {
            let base = s.font_base.ok_or_else(|| Error::data("no font definition open"))?;
            s.push(Instruction::bare(opcode::CHAR_END, 0))?;
            let start = s.build_offset()?;
            let (program, _) = s.sink.control()?;
            program.patch_instruction(
                base + ascii as usize * 8,
                &Instruction::new(opcode::BRANCH, 0, start as i32),
            )
        })
    }

    /// Closes the font table, later code is no longer part of it
    pub fn font_def_end(&self) -> Result<()> {
        self.list(|s| {
            let base = s.font_base.ok_or_else(|| Error::data("no font definition open"))?;
            s.push(Instruction::bare(opcode::CHAR_END, 0))?;
            let end = s.build_offset()?;
            let (program, _) = s.sink.control()?;
            program.patch_address(base - 8, end as i32)
        })
    }

    /// Loads the font stored in file `name`
    pub fn set_font(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::data("font name is empty"));
        }
        let slot = self.file_index(name)?;
        self.list(|s| {
            let ret = s.list_offset() + 8;
            let sector = s.config.flash.files_start as usize + slot;
            s.push(Instruction::new(
                opcode::IDXUPLOAD,
                0,
                (ret as i32, sector as u16),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::output_buffer::HEADER_SIZE;
    use crate::session::testing::session;
    use crate::sink::BuildVariant;

    fn build() -> (ControllerSession, crate::sim::SimulatedBoard) {
        let (session, board) = session();
        session.open_build(BuildVariant::File, "t").unwrap();
        (session, board)
    }

    fn opcodes(session: &ControllerSession) -> Vec<u8> {
        session
            .program_instructions()
            .iter()
            .map(|i| i.opcode)
            .collect()
    }

    #[test]
    fn coordinates_become_micrometres() {
        let (session, _board) = build();
        session.set_target(0x02).unwrap();
        session.jump_xy(-1.5, 2.25).unwrap();
        session.line_xyz(1.0, 2.0, 3.0).unwrap();
        let p = session.program_instructions();
        assert_eq!(p[0].operands::<(i32, i32)>(), (-1500, 2250));
        assert_eq!(p[0].target, 0x02);
        assert_eq!(p[1].opcode, opcode::LINETO3D);
        assert_eq!(p[2].opcode, opcode::PARAMS);
        assert_eq!(p[2].operands::<(i32, i32)>(), (3000, 0));
    }

    #[test]
    fn flat_arcs_fall_back_to_lines() {
        let (session, _board) = build();
        session.arc_xy(1.0, 1.0, 0.0).unwrap();
        session.arc_move_xy(1.0, 1.0, 1e-9).unwrap();
        session.arc_xy(1.0, 1.0, 0.5).unwrap();
        assert_eq!(
            opcodes(&session),
            [opcode::LINETO, opcode::MOVETO, opcode::ARCLINE, opcode::PARAMS]
        );
        assert_eq!(session.program_instructions()[3].operands::<f32>(), 0.5);
    }

    #[test]
    fn pwm_period_is_prescaled() {
        let (session, _board) = build();
        session.set_pwm(1, 2000.0, 1000.0).unwrap();
        let i = session.program_instructions()[0];
        assert_eq!(i.operands::<(i16, i16, i8, i8)>(), (40000u16 as i16, 20000, 1, 2));
    }

    #[test]
    fn wobble_expands_to_three_instructions() {
        let (session, _board) = build();
        session.set_wobble(0.2, 100).unwrap();
        let p = session.program_instructions();
        assert_eq!(p[0].operands::<(f32, i16)>(), (100.0, 100));
        assert_eq!(p[1].operands::<(f32, i16)>(), (100.0, 90));
        assert_eq!(p[2].operands::<(i32, i8, i8)>(), (0, 1, 1));
    }

    #[test]
    fn out_of_range_numbers_are_rejected() {
        let (session, _board) = build();
        assert_eq!(session.set_table(4, 1.0).unwrap_err().code(), ErrorCode::Data);
        assert_eq!(session.reset_resolver(0).unwrap_err().code(), ErrorCode::Data);
        assert_eq!(session.set_cfg_io(18, 1).unwrap_err().code(), ErrorCode::Data);
        assert!(session.set_speed(1e9).is_err());
        assert!(session.program_instructions().is_empty());
    }

    #[test]
    fn resolver_setup_sequence() {
        let (session, _board) = build();
        session.set_resolver(2, 0.001, 100.0).unwrap();
        assert_eq!(
            opcodes(&session),
            [
                opcode::OTFSTEP,
                opcode::OTFRANGE,
                opcode::OTFSET,
                opcode::OTFENABLE
            ]
        );
        let p = session.program_instructions();
        assert_eq!(p[1].operands::<(i32, i8, i8)>(), (100_000, 2, 0));
        assert_eq!(p[2].operands::<(i32, i8, i8)>(), (1, 2, 0));
    }

    #[test]
    fn cfg_io_updates_settings() {
        let (session, _board) = build();
        session.set_target(0x04).unwrap();
        session.set_cfg_io(3, 0x1_0005).unwrap();
        session.set_query_target(3).unwrap();
        assert_eq!(session.cfg_io(3).unwrap(), 5);
        let i = session.program_instructions()[0];
        assert_eq!(i.operands::<(i16, i16, i8, i8)>(), (5, 3, 1, 0));
    }

    #[test]
    fn wait_io_outside_broadcast_waits_for_idle() {
        let (session, _board) = build();
        session.set_target(0x0c).unwrap();
        session.wait_io(1, 3, true).unwrap();
        let p = session.program_instructions();
        assert_eq!(p[0].opcode, opcode::INT_WAITIDLE);
        assert_eq!(p[0].target, 0x04);
        assert_eq!(p[1].opcode, opcode::INT_WAITIO);
        assert_eq!(p[1].operands::<(i16, i16, i8, i8)>(), (1, 3, 1, 0));
    }

    #[test]
    fn synchronise_waits_for_each_target() {
        let (session, _board) = build();
        session.set_target(0x05).unwrap();
        session.synchronise().unwrap();
        let targets: Vec<u8> = session
            .program_instructions()
            .iter()
            .map(|i| i.target)
            .collect();
        assert_eq!(targets, [0x01, 0x04]);
    }

    #[test]
    fn print_encodes_length_prefixed_string() {
        let (session, _board) = build();
        session.print("Hello, world").unwrap();
        let p = session.program_instructions();
        assert_eq!(
            opcodes(&session),
            [opcode::BSTR0, opcode::BSTRN, opcode::BSTRN, opcode::PRINT]
        );
        assert_eq!(p[0].payload(), [12, b'H', b'e', b'l', b'l', b'o']);
        assert_eq!(p[2].payload(), [b'd', 0, 0, 0, 0, 0]);
        assert_eq!(p[3].operands::<i32>(), (HEADER_SIZE + 24) as i32);
    }

    #[test]
    fn udp_send_packs_address() {
        let (session, _board) = build();
        session.udp_send("10.0.1.2", 0x1234, "cafe").unwrap();
        let p = session.program_instructions();
        assert_eq!(p[0].payload(), [2, 0xca, 0xfe, 0, 0, 0]);
        assert_eq!(p[1].payload(), [10, 0, 1, 2, 0x34, 0x12]);
        assert!(session.udp_send("10.0.1", 1, "").is_err());
        assert!(session.udp_send("10.0.1.2", 1, "zz").is_err());
    }

    #[test]
    fn font_table_is_backpatched() {
        let (session, _board) = build();
        session.font_def().unwrap();
        session.char_def(b'A').unwrap();
        session.line_xy(1.0, 0.0).unwrap();
        session.font_def_end().unwrap();
        let p = session.program_instructions();
        let base = HEADER_SIZE + 8;
        // header, 256 table entries, then CHAR_END, LINETO, CHAR_END
        assert_eq!(p.len(), 1 + 256 + 3);
        assert_eq!(p[0].opcode, opcode::FONTHDR);
        let end = (HEADER_SIZE + p.len() * 8) as i32;
        assert_eq!(p[0].operands::<i32>(), end);
        let entry = p[1 + b'A' as usize];
        assert_eq!(entry.opcode, opcode::BRANCH);
        assert_eq!(entry.operands::<i32>(), (base + 257 * 8) as i32);
        assert_eq!(p[2].opcode, opcode::CHAR_END);
    }

    #[test]
    fn char_without_font_is_rejected() {
        let (session, _board) = build();
        assert_eq!(session.char_def(b'A').unwrap_err().code(), ErrorCode::Data);
    }

    #[test]
    fn fetch_needs_a_stored_file() {
        let (session, _board) = session();
        session.open_build(BuildVariant::File, "sub").unwrap();
        session.sleep(10).unwrap();
        session.close_build().unwrap();
        session.open_build(BuildVariant::File, "main").unwrap();
        session.file_fetch("sub").unwrap();
        assert!(session.file_fetch("missing").is_err());
        let i = session.program_instructions()[0];
        assert_eq!(i.opcode, opcode::IDXFETCH);
        assert_eq!(i.operands::<(i32, u16)>(), (HEADER_SIZE as i32 + 8, 41));
    }

    #[test]
    fn can_link_open_sequence() {
        let (session, _board) = build();
        session.open_can_link(250_000).unwrap();
        assert_eq!(
            opcodes(&session),
            [
                opcode::CAN_INIT,
                opcode::BSTR0,
                opcode::CAN_SEND,
                opcode::SLEEP,
                opcode::BSTR0,
                opcode::CAN_SEND
            ]
        );
        assert_eq!(session.program_instructions()[1].payload(), [2, 0x82, 0, 0, 0, 0]);
    }

    #[test]
    fn hex_strings_are_length_prefixed() {
        assert_eq!(hex_bstring("0aff").unwrap(), vec![2, 0x0a, 0xff]);
        assert_eq!(hex_bstring("").unwrap(), vec![0]);
        assert!(hex_bstring(&"00".repeat(256)).is_err());
    }
}
