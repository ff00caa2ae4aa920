//! Direct operations
//!
//! These bypass the list sink entirely: each one is an interrupt instruction written straight to
//! the link while holding the session lock, so they take effect immediately whatever the targets
//! are executing.

use crate::encoding::{Instruction, Payload, PAYLOAD_SIZE};
use crate::error::{Error, Result};
use crate::link::LinkExt;
use crate::opcode;
use crate::ops::{hex_bstring, parse_ip, udp_operands};
use crate::session::{ControllerSession, SessionState};
use crate::status::TARGET_STATUS_SIZE;
use log::{info, warn};
use serde::Serialize;
use std::io;
use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

/// Firmware word expected from the front end, compared under [`BIOS_MASK`]
pub const BIOS_FRONT_END: u32 = 0x0b02_0500;
/// Firmware word expected from each target
pub const BIOS_TARGET: u32 = 0x0b02_0800;
/// The low byte of a firmware word is a build number and may differ
pub const BIOS_MASK: u32 = 0xffff_ff00;

pub const MODE_STOP: u16 = 0x00;
pub const MODE_LIST: u16 = 0x01;
pub const MODE_CH: u16 = 0x02;
pub const MODE_CHTEST: u16 = 0x03;

/// Largest transfer the board's UART FIFO takes at once
pub const UART_FIFO_SIZE: usize = 0x200;

/// Time the targets need to answer a bus scan
const SCAN_SETTLE: Duration = Duration::from_millis(1000);

/// Replies of the CAN and target scan interrupts
const SCAN_REPLY_SIZE: usize = 16;

/// Result of [`ControllerSession::system_check`], one bit per target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SystemReport {
    /// Front end firmware matches [`BIOS_FRONT_END`]
    pub front_end_ok: bool,
    /// Targets with a MAC in the settings
    pub mapped: u8,
    /// Mapped targets that answered with a firmware word
    pub powered: u8,
    /// Mapped targets whose firmware matches [`BIOS_TARGET`]
    pub bios_ok: u8,
}

impl SystemReport {
    /// Fails on the first problem: front end firmware, an unpowered target, target firmware
    pub fn verify(&self) -> Result<()> {
        if !self.front_end_ok {
            return Err(Error::Bios(0));
        }
        let unpowered = self.mapped & !self.powered;
        if unpowered != 0 {
            return Err(Error::Link(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("targets {unpowered:#04x} not powered"),
            )));
        }
        let mismatched = self.powered & !self.bios_ok;
        if mismatched != 0 {
            return Err(Error::Bios(mismatched));
        }
        Ok(())
    }
}

fn bios_matches(word: u32, expected: u32) -> bool {
    (word ^ expected) & BIOS_MASK == 0
}

fn parse_mac(mac: &str) -> Result<Payload> {
    let mut out: Payload = [0; PAYLOAD_SIZE];
    let mut parts = mac.split([':', '-']);
    for b in out.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| Error::data(format!("bad MAC address {mac:?}")))?;
        *b = u8::from_str_radix(part, 16)
            .map_err(|_| Error::data(format!("bad MAC address {mac:?}")))?;
    }
    if parts.next().is_some() {
        return Err(Error::data(format!("bad MAC address {mac:?}")));
    }
    Ok(out)
}

impl SessionState {
    fn run_mode(&mut self, mode: u16, arg: i8, target: u8) -> Result<()> {
        let cmd = Instruction::new(
            opcode::INT_RUNMODE,
            target,
            (mode as i16, opcode::SCODE as i16, arg, 0i8),
        );
        self.request(&cmd, 1)?;
        Ok(())
    }

    fn read_bios(&mut self, target: u8) -> Result<u32> {
        let info = self.config.flash.info_address();
        let word = self.request(
            &Instruction::new(opcode::INT_FLASHRD, target, (info as i32, 4u16)),
            4,
        )?;
        Ok(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
    }

    fn map_target(&mut self, id: u16, target: u8) -> Result<()> {
        self.send(&Instruction::new(
            opcode::INT_MAPTGT,
            opcode::TARGET_ALL,
            (id as i16, opcode::SCODE as i16, (1u8 << (target & 7)) as i8, 0i8),
        ))
    }
}

impl ControllerSession {
    /// Sets outputs of the query target right away
    pub fn system_set_io(&self, value: u16, mask: u16) -> Result<()> {
        let mut state = self.lock();
        let target = state.address.query_bit();
        state.send(&Instruction::new(opcode::INT_SETIO, target, (value, mask)))
    }

    /// Speed of resolver `nr` (1 or 2) on the query target, used when no encoder is fitted
    pub fn system_set_resolver_speed(&self, nr: u8, speed: f64) -> Result<()> {
        if !(1..=2).contains(&nr) {
            return Err(Error::data(format!("resolver {nr} out of range 1..=2")));
        }
        let mut state = self.lock();
        let target = state.address.query_bit();
        state.send(&Instruction::new(
            opcode::INT_OTFSPEED,
            target,
            (speed as f32, nr as i8, 0i8),
        ))
    }

    pub fn system_suspend(&self) -> Result<()> {
        self.lock()
            .send(&Instruction::bare(opcode::INT_SUSPEND, opcode::TARGET_ALL))
    }

    pub fn system_resume(&self) -> Result<()> {
        self.lock()
            .send(&Instruction::bare(opcode::INT_RESUME, opcode::TARGET_ALL))
    }

    /// Starts the program in file slot `index` on the front end
    pub fn select_file(&self, index: u16) -> Result<()> {
        self.lock()
            .send(&Instruction::new(opcode::INT_SELFILE, 0, index))
    }

    /// Aborts and puts every target back into list mode
    pub fn system_reset(&self) -> Result<()> {
        let mut state = self.lock();
        state.abort()?;
        state.run_mode(MODE_LIST, 0, opcode::TARGET_ALL)?;
        drop(state);
        self.resume_polling();
        Ok(())
    }

    /// Aborts and takes every target out of list mode, status polling stops until reset
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock();
        state.abort()?;
        // leaving list mode needs the command twice
        state.run_mode(MODE_STOP, 0, opcode::TARGET_ALL)?;
        state.run_mode(MODE_STOP, 0, opcode::TARGET_ALL)?;
        self.suspend_polling();
        info!("targets stopped");
        Ok(())
    }

    pub fn uart_open(&self, baud_rate: i32, parity: u8, stop_bits: u8) -> Result<()> {
        self.lock().send(&Instruction::new(
            opcode::INT_UARTOPEN,
            0,
            (baud_rate, parity as i8, stop_bits as i8),
        ))
    }

    pub fn uart_write(&self, data: &[u8]) -> Result<()> {
        if data.len() > UART_FIFO_SIZE {
            return Err(Error::data(format!(
                "UART write of {} bytes exceeds {UART_FIFO_SIZE}",
                data.len()
            )));
        }
        let mut state = self.lock();
        let link = state.link()?;
        link.send(&Instruction::new(opcode::INT_UARTWRITE, 0, data.len() as u16))?;
        link.exchange(data, 0)?;
        Ok(())
    }

    /// Reads up to `max` bytes received by the board's UART
    pub fn uart_read(&self, max: usize) -> Result<Vec<u8>> {
        let max = max.min(UART_FIFO_SIZE);
        let reply = self
            .lock()
            .request(&Instruction::new(opcode::INT_UARTREAD, 0, max as u16), max + 2)?;
        let n = (u16::from_le_bytes([reply[0], reply[1]]) as usize).min(max);
        Ok(reply[2..2 + n].to_vec())
    }

    /// Sends hex encoded `data` as a UDP datagram right away
    pub fn system_udp_send(&self, ip: &str, port: u16, data: &str) -> Result<()> {
        let ip = parse_ip(ip)?;
        let data = hex_bstring(data)?;
        let mut state = self.lock();
        let link = state.link()?;
        link.send(&Instruction::new(opcode::INT_UDPSEND, 0, udp_operands(ip, port)))?;
        link.exchange(&data, 0)?;
        Ok(())
    }

    /// Reads register `address` of the laser attached to the query target
    pub fn get_laser_link(&self, address: u8) -> Result<u8> {
        let mut state = self.lock();
        let target = state.address.query_bit();
        state.send(&Instruction::new(
            opcode::INT_EXCHLLINK,
            target,
            (0u16, 0x80 | address as u16),
        ))?;
        let query = Instruction::new(
            opcode::INT_TGTSTATUS,
            target,
            (0u16, TARGET_STATUS_SIZE as u16),
        );
        // the first status still holds the previous reply
        state.request(&query, TARGET_STATUS_SIZE)?;
        crate::transport::refresh_target_status(&mut state)?;
        Ok(state.target_status.return_value)
    }

    /// Last value polled into CAN reply slot `address`
    pub fn get_can_link(&self, address: u8) -> Result<u8> {
        let reply = self.lock().request(
            &Instruction::new(opcode::INT_CANREAD, 0, (0u16, SCAN_REPLY_SIZE as u16)),
            SCAN_REPLY_SIZE,
        )?;
        Ok(reply[address as usize & 0x0f])
    }

    /// Scans the target bus and returns the ids found
    pub fn scan_targets(&self) -> Result<Vec<u8>> {
        let mut state = self.lock();
        state.send(&Instruction::new(
            opcode::INT_SCANTGT,
            opcode::TARGET_ALL,
            (0u16, opcode::SCODE),
        ))?;
        thread::sleep(SCAN_SETTLE);
        state.request(
            &Instruction::new(opcode::INT_SCANREAD, 0, (0u16, SCAN_REPLY_SIZE as u16)),
            SCAN_REPLY_SIZE,
        )
    }

    /// Assigns the target with bus id `id` to target number `target` (0 to 7)
    pub fn map_target(&self, id: u16, target: u8) -> Result<()> {
        if target > 7 {
            return Err(Error::data(format!("target {target} out of range 0..=7")));
        }
        self.lock().map_target(id, target)
    }

    /// Asks the front end for the IP address of the device with MAC `mac`
    pub fn get_ip(&self, mac: &str) -> Result<Ipv4Addr> {
        let mac = parse_mac(mac)?;
        let reply = self
            .lock()
            .request(&Instruction::new(opcode::INT_GETIP, 0, mac), 4)?;
        Ok(Ipv4Addr::new(reply[0], reply[1], reply[2], reply[3]))
    }

    /// Maps every target with a MAC in the settings and checks its firmware
    ///
    /// The report is returned even when something is wrong, [`SystemReport::verify`] turns it
    /// into an error.
    pub fn system_check(&self) -> Result<SystemReport> {
        let mut state = self.lock();
        let mut report = SystemReport::default();
        let bios = state.read_bios(0)?;
        report.front_end_ok = bios_matches(bios, BIOS_FRONT_END);
        if !report.front_end_ok {
            warn!("front end firmware {bios:#010x} does not match {BIOS_FRONT_END:#010x}");
        }
        let macs = state.params.mac;
        for (i, &mac) in macs.iter().enumerate() {
            if mac == 0 {
                continue;
            }
            let bit = 1u8 << i;
            state.map_target(mac, i as u8)?;
            let bios = state.read_bios(bit)?;
            report.mapped |= bit;
            if bios != 0 {
                report.powered |= bit;
            }
            if bios_matches(bios, BIOS_TARGET) {
                report.bios_ok |= bit;
            } else {
                warn!("target {i} firmware {bios:#010x} does not match {BIOS_TARGET:#010x}");
            }
        }
        Ok(report)
    }
}
