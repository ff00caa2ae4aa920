use crate::encoding::{ReadError, Readable};
use crate::error::ErrorCode;
use serde::Serialize;

/// Low nibble of the status byte: free receive chunks on the board
pub const CREDIT_MASK: u8 = 0x0f;
/// Execution halted by the IO interlock
pub const IO_ABORT: u8 = 0x20;
/// Command processor stalled waiting for input
pub const SYS_STALL: u8 = 0x40;

/// Encoded size of a [`TargetStatus`] reply
pub const TARGET_STATUS_SIZE: usize = 44;

/// Telemetry block reported by one target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TargetStatus {
    pub inputs: u16,
    pub outputs: u16,
    /// Index of the target this block belongs to
    pub me: u8,
    pub return_value: u8,
    pub counter: i16,
    pub analog: [u8; 4],
    pub otf_x: i32,
    pub otf_y: i32,
    pub table_x: i32,
    pub table_y: i32,
    pub table_z: i32,
    pub defl_x: i32,
    pub defl_y: i32,
    pub defl_z: i32,
}

impl Readable for TargetStatus {
    fn read(data: &mut &[u8]) -> Result<Self, ReadError> {
        if data.len() < TARGET_STATUS_SIZE {
            return Err(ReadError);
        }
        Ok(TargetStatus {
            inputs: u16::read(data)?,
            outputs: u16::read(data)?,
            me: u8::read(data)?,
            return_value: u8::read(data)?,
            counter: i16::read(data)?,
            analog: <[u8; 4]>::read(data)?,
            otf_x: i32::read(data)?,
            otf_y: i32::read(data)?,
            table_x: i32::read(data)?,
            table_y: i32::read(data)?,
            table_z: i32::read(data)?,
            defl_x: i32::read(data)?,
            defl_y: i32::read(data)?,
            defl_z: i32::read(data)?,
        })
    }
}

impl TargetStatus {
    pub fn encode(&self) -> Vec<u8> {
        use crate::encoding::Writable;
        let mut out = Vec::with_capacity(TARGET_STATUS_SIZE);
        self.inputs.write(&mut out);
        self.outputs.write(&mut out);
        self.me.write(&mut out);
        self.return_value.write(&mut out);
        self.counter.write(&mut out);
        (&self.analog[..]).write(&mut out);
        for v in [
            self.otf_x,
            self.otf_y,
            self.table_x,
            self.table_y,
            self.table_z,
            self.defl_x,
            self.defl_y,
            self.defl_z,
        ] {
            v.write(&mut out);
        }
        out
    }

    /// Inputs in the low half, outputs in the high half
    pub fn io_word(&self) -> u32 {
        self.inputs as u32 | (self.outputs as u32) << 16
    }

    /// Analog input `nr`, valid for channels 5 to 8
    pub fn analog(&self, nr: usize) -> Option<u8> {
        match nr {
            5..=8 => Some(self.analog[nr - 5]),
            _ => None,
        }
    }

    pub fn resolvers_mm(&self) -> (f64, f64) {
        (self.otf_x as f64 / 1000.0, self.otf_y as f64 / 1000.0)
    }

    pub fn tables_mm(&self) -> (f64, f64, f64) {
        (
            self.table_x as f64 / 1000.0,
            self.table_y as f64 / 1000.0,
            self.table_z as f64 / 1000.0,
        )
    }

    pub fn deflection_replies(&self) -> (i32, i32, i32) {
        (self.defl_x, self.defl_y, self.defl_z)
    }
}

/// Summary of the host queue and device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListStatus {
    pub code: ErrorCode,
    /// Bytes not yet consumed by the device, as an estimate
    pub counter: usize,
}

impl ListStatus {
    pub fn is_idle(&self) -> bool {
        self.code == ErrorCode::Ok
    }
}
