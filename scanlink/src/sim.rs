//! In-process stand-ins for controller hardware
//!
//! [`SimulatedBoard`] consumes the same byte stream a real board receives and produces the reply
//! bytes each request asks for, so it can sit behind a [`HardwareLink`] directly or at the far
//! end of a serial line.

use crate::config::FlashGeometry;
use crate::encoding::{read_fixed_str, Instruction, Readable, INSTRUCTION_SIZE};
use crate::error::Result;
use crate::flash::FlashStore;
use crate::link::HardwareLink;
use crate::opcode;
use crate::output_buffer::HEADER_SIZE;
use crate::profile::CALIBRATION_TABLE_SIZE;
use crate::status::TargetStatus;
use crate::system::{BIOS_FRONT_END, BIOS_TARGET};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Flash image held in memory
///
/// Unwritten bytes read as `0xff`. Programming data that covers the start of a sector erases
/// that sector first, like the board's page programming does.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    sector_size: usize,
    data: Vec<u8>,
}

impl MemoryFlash {
    pub fn new(sector_size: u32) -> Self {
        MemoryFlash {
            sector_size: sector_size as usize,
            data: Vec::new(),
        }
    }

    fn ensure(&mut self, end: usize) {
        if self.data.len() < end {
            self.data.resize(end, 0xff);
        }
    }

    pub fn bytes(&self, address: u32, len: usize) -> Vec<u8> {
        let start = address as usize;
        (start..start + len)
            .map(|i| self.data.get(i).copied().unwrap_or(0xff))
            .collect()
    }

    pub fn erase_sector(&mut self, address: u32) {
        let start = address as usize / self.sector_size * self.sector_size;
        if start < self.data.len() {
            let end = (start + self.sector_size).min(self.data.len());
            self.data[start..end].fill(0xff);
        }
    }

    pub fn program(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        let end = start + data.len();
        let mut sector = (start + self.sector_size - 1) / self.sector_size * self.sector_size;
        while sector < end {
            self.erase_sector(sector as u32);
            sector += self.sector_size;
        }
        self.ensure(end);
        self.data[start..end].copy_from_slice(data);
    }
}

impl FlashStore for MemoryFlash {
    fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        Ok(self.bytes(address, len))
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.program(address, data);
        Ok(())
    }

    fn erase(&mut self, address: u32) -> Result<()> {
        self.erase_sector(address);
        Ok(())
    }
}

/// Payload the board is waiting for after a request header
#[derive(Debug, Clone, Copy)]
enum Pending {
    Flash { address: u32, len: usize },
    Uart(usize),
    UdpLength,
    Udp(usize),
    Setpoints(usize),
    ChannelFlash(usize),
}

struct Board {
    geometry: FlashGeometry,
    flash: MemoryFlash,
    rx: Vec<u8>,
    tx: Vec<u8>,
    pending: Option<Pending>,
    status: u8,
    identity: String,
    targets: [TargetStatus; 8],
    target_bios: u32,
    streamed: Vec<Instruction>,
    requests: Vec<Instruction>,
    uart_out: Vec<u8>,
    uart_in: Vec<u8>,
    udp: Vec<Vec<u8>>,
    setpoints: Vec<u8>,
    channel_flash: Vec<u8>,
    offline: bool,
    opened: Option<String>,
}

impl Board {
    /// Removes `count` received bytes, once that many have arrived
    fn take(&mut self, count: usize) -> Option<Vec<u8>> {
        if self.rx.len() < count {
            return None;
        }
        Some(self.rx.drain(..count).collect())
    }

    fn reply_i32(&mut self, v: i32) {
        self.tx.extend(v.to_le_bytes());
    }

    fn reply_zeros(&mut self, n: usize) {
        self.tx.extend(std::iter::repeat(0).take(n));
    }

    fn process(&mut self) {
        loop {
            if let Some(pending) = self.pending {
                if !self.payload(pending) {
                    return;
                }
            } else {
                let Some(record) = self.take(INSTRUCTION_SIZE) else {
                    return;
                };
                let mut data = &record[..];
                if let Ok(i) = Instruction::read(&mut data) {
                    self.instruction(i);
                }
            }
        }
    }

    fn payload(&mut self, pending: Pending) -> bool {
        let need = match pending {
            Pending::Flash { len, .. } => len,
            Pending::Uart(n) | Pending::Udp(n) | Pending::ChannelFlash(n) => n,
            Pending::UdpLength => 1,
            Pending::Setpoints(n) => n.min(self.rx.len().max(1)),
        };
        let Some(data) = self.take(need) else {
            return false;
        };
        self.pending = None;
        match pending {
            Pending::Flash { address, .. } => {
                self.flash.program(address, &data);
                self.reply_i32(0);
            }
            Pending::Uart(_) => self.uart_out.extend(data),
            Pending::UdpLength => {
                let n = data[0] as usize;
                self.udp.push(data);
                if n > 0 {
                    self.pending = Some(Pending::Udp(n));
                }
            }
            Pending::Udp(_) => {
                if let Some(last) = self.udp.last_mut() {
                    last.extend(data);
                }
            }
            Pending::Setpoints(n) => {
                self.setpoints.extend(&data);
                if n > data.len() {
                    self.pending = Some(Pending::Setpoints(n - data.len()));
                }
            }
            Pending::ChannelFlash(_) => {
                self.channel_flash = data;
                self.tx.push(0);
            }
        }
        true
    }

    fn target_index(target: u8) -> usize {
        (target.trailing_zeros() & 7) as usize
    }

    fn calibration_slot(&self, idx: usize) -> u32 {
        self.geometry.calibration_address() + (idx * CALIBRATION_TABLE_SIZE) as u32
    }

    fn instruction(&mut self, i: Instruction) {
        if !i.is_interrupt() {
            self.streamed.push(i);
            return;
        }
        self.requests.push(i);
        match i.opcode {
            opcode::INT_STATUS => {
                self.tx.push(self.status);
                self.reply_zeros((i.prm_y as usize).saturating_sub(1));
            }
            opcode::INT_TGTSTATUS => {
                let idx = Self::target_index(i.target);
                let mut status = self.targets[idx];
                status.me = idx as u8;
                let mut reply = status.encode();
                reply.resize(i.prm_y as usize, 0);
                self.tx.extend(reply);
            }
            opcode::INT_GTID => {
                let mut id = self.identity.clone().into_bytes();
                id.resize(64, 0);
                self.tx.extend(id);
            }
            opcode::INT_FLASHRD => {
                let (address, len) = i.operands::<(i32, u16)>();
                if i.target != 0 && address as u32 == self.geometry.info_address() {
                    let mut word = self.target_bios.to_le_bytes().to_vec();
                    word.resize(len as usize, 0xff);
                    self.tx.extend(word);
                } else {
                    let bytes = self.flash.bytes(address as u32, len as usize);
                    self.tx.extend(bytes);
                }
            }
            opcode::INT_FLASHPP2 => {
                let (address, len) = i.operands::<(i32, u16)>();
                self.reply_i32(0);
                if len == 0 {
                    self.flash.erase_sector(address as u32);
                } else {
                    self.pending = Some(Pending::Flash {
                        address: address as u32,
                        len: len as usize,
                    });
                }
            }
            opcode::INT_RUNMODE => self.tx.push(0),
            opcode::INT_UARTWRITE => self.pending = Some(Pending::Uart(i.prm_x as usize)),
            opcode::INT_UARTREAD => {
                let want = i.prm_x as usize;
                let n = want.min(self.uart_in.len());
                let data: Vec<u8> = self.uart_in.drain(..n).collect();
                self.tx.extend((n as u16).to_le_bytes());
                self.tx.extend(data);
                self.reply_zeros(want - n);
            }
            opcode::INT_UDPSEND => self.pending = Some(Pending::UdpLength),
            opcode::INT_SCANREAD | opcode::INT_CANREAD => {
                let mut reply: Vec<u8> = (1..=16).collect();
                reply.resize(i.prm_y as usize, 0);
                self.tx.extend(reply);
            }
            opcode::INT_GETIP => self.tx.extend([192, 168, 0, 10]),
            opcode::INT_RESETCAL => {
                let idx = i.prm_x as usize & 7;
                self.flash
                    .program(self.calibration_slot(idx), &[0u8; CALIBRATION_TABLE_SIZE]);
                self.reply_i32(-1);
            }
            opcode::INT_LOADCALFILE | opcode::INT_ADDCALDATA => {
                let idx = i.prm_x as usize & 7;
                let stdio = self.geometry.slot_address(self.geometry.stdio_slot);
                let header = self.flash.bytes(stdio + 8, 4);
                let size = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
                let payload = (size as usize)
                    .saturating_sub(HEADER_SIZE)
                    .min(CALIBRATION_TABLE_SIZE);
                let table = self.flash.bytes(stdio + HEADER_SIZE as u32, payload);
                self.flash.program(self.calibration_slot(idx), &table);
                self.reply_i32(-1);
            }
            opcode::INT_STORECALFILE => {
                let idx = i.prm_x as usize & 7;
                let stdio = self.geometry.slot_address(self.geometry.stdio_slot);
                let table = self
                    .flash
                    .bytes(self.calibration_slot(idx), CALIBRATION_TABLE_SIZE);
                let size = HEADER_SIZE + table.len();
                let mut file = Vec::with_capacity(size);
                file.extend(0xffff_ffffu32.to_le_bytes());
                file.extend(0x0000_ffffu32.to_le_bytes());
                file.extend((size as i32).to_le_bytes());
                file.extend(b"stdio");
                file.resize(HEADER_SIZE, 0);
                file.extend(table);
                self.flash.program(stdio, &file);
                self.reply_i32(size as i32);
            }
            opcode::INT_CHSETPOINTS => {
                let size = i.prm_y as usize;
                if size > 0 {
                    self.pending = Some(Pending::Setpoints(size));
                }
            }
            opcode::INT_CHFLASHPP => {
                self.tx.push(0);
                self.pending = Some(Pending::ChannelFlash(i.prm_y as usize));
            }
            opcode::INT_CHFLASHRD => {
                let mut data = self.channel_flash.clone();
                data.resize(i.prm_y as usize, 0xff);
                self.tx.extend(data);
            }
            opcode::INT_CHACTUALS => {
                let (offset, len) = (i.prm_x as usize, i.prm_y as usize);
                self.tx.extend((offset..offset + len).map(|n| n as u8));
            }
            opcode::INT_DEFLEXCH => {
                self.tx.push(i.prm_x as u8);
                self.reply_zeros((i.prm_y as usize).saturating_sub(1));
            }
            _ => {}
        }
    }
}

/// A controller board emulated in memory
///
/// Clones share the same board, so a test can keep a handle while the session owns the link.
#[derive(Clone)]
pub struct SimulatedBoard {
    inner: Arc<Mutex<Board>>,
}

impl SimulatedBoard {
    /// A board with erased flash except for the firmware word in the info sector
    pub fn new(geometry: &FlashGeometry) -> Self {
        let mut flash = MemoryFlash::new(geometry.sector_size);
        flash.program(geometry.info_address(), &BIOS_FRONT_END.to_le_bytes());
        let board = Board {
            geometry: geometry.clone(),
            flash,
            rx: Vec::new(),
            tx: Vec::new(),
            pending: None,
            status: status_byte(15, true, false),
            identity: "SIMULATED BOARD".into(),
            targets: [TargetStatus::default(); 8],
            target_bios: BIOS_TARGET,
            streamed: Vec::new(),
            requests: Vec::new(),
            uart_out: Vec::new(),
            uart_in: Vec::new(),
            udp: Vec::new(),
            setpoints: Vec::new(),
            channel_flash: Vec::new(),
            offline: false,
            opened: None,
        };
        SimulatedBoard {
            inner: Arc::new(Mutex::new(board)),
        }
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds received bytes to the board and returns every reply byte produced
    pub fn receive(&self, bytes: &[u8]) -> Vec<u8> {
        let mut board = self.board();
        board.rx.extend_from_slice(bytes);
        board.process();
        std::mem::take(&mut board.tx)
    }

    /// Sets the free chunk credit and flags reported in the status byte
    pub fn set_status(&self, credit: u8, stalled: bool, io_abort: bool) {
        self.board().status = status_byte(credit, stalled, io_abort);
    }

    pub fn set_identity(&self, id: &str) {
        self.board().identity = id.to_owned();
    }

    pub fn set_target_status(&self, idx: usize, status: TargetStatus) {
        self.board().targets[idx & 7] = status;
    }

    pub fn set_target_bios(&self, word: u32) {
        self.board().target_bios = word;
    }

    /// Makes every exchange fail as if the cable was pulled
    pub fn set_offline(&self, offline: bool) {
        self.board().offline = offline;
    }

    pub fn push_uart_input(&self, data: &[u8]) {
        self.board().uart_in.extend_from_slice(data);
    }

    /// List instructions received so far
    pub fn streamed(&self) -> Vec<Instruction> {
        self.board().streamed.clone()
    }

    /// Interrupt requests received so far
    pub fn requests(&self) -> Vec<Instruction> {
        self.board().requests.clone()
    }

    pub fn requests_with(&self, op: u8) -> Vec<Instruction> {
        self.requests().into_iter().filter(|i| i.opcode == op).collect()
    }

    pub fn clear_log(&self) {
        let mut board = self.board();
        board.streamed.clear();
        board.requests.clear();
    }

    pub fn uart_output(&self) -> Vec<u8> {
        self.board().uart_out.clone()
    }

    pub fn udp_datagrams(&self) -> Vec<Vec<u8>> {
        self.board().udp.clone()
    }

    pub fn setpoints(&self) -> Vec<u8> {
        self.board().setpoints.clone()
    }

    pub fn flash_bytes(&self, address: u32, len: usize) -> Vec<u8> {
        self.board().flash.bytes(address, len)
    }

    pub fn flash_program(&self, address: u32, data: &[u8]) {
        self.board().flash.program(address, data)
    }

    /// Name of a file stored in `slot`, read straight from its header
    pub fn file_name(&self, slot: usize) -> Option<String> {
        let board = self.board();
        let at = board.geometry.slot_address(slot);
        let header = board.flash.bytes(at, HEADER_SIZE);
        if header[..8] != [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 0] {
            return None;
        }
        let mut data = &header[12..];
        read_fixed_str(&mut data, HEADER_SIZE - 12).ok()
    }

    pub fn opened_address(&self) -> Option<String> {
        self.board().opened.clone()
    }
}

fn status_byte(credit: u8, stalled: bool, io_abort: bool) -> u8 {
    let mut s = credit & crate::status::CREDIT_MASK;
    if stalled {
        s |= crate::status::SYS_STALL;
    }
    if io_abort {
        s |= crate::status::IO_ABORT;
    }
    s
}

impl HardwareLink for SimulatedBoard {
    fn open(&mut self, address: &str) -> io::Result<()> {
        let mut board = self.board();
        if board.offline {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "board offline"));
        }
        board.opened = Some(address.to_owned());
        Ok(())
    }

    fn exchange(&mut self, write: &[u8], read_len: usize) -> io::Result<Vec<u8>> {
        if self.board().offline {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "board offline"));
        }
        let mut reply = self.receive(write);
        reply.resize(read_len, 0);
        Ok(reply)
    }

    fn close(&mut self) {
        self.board().opened = None;
    }
}
