//! Servo channel commands
//!
//! Thin framing for tuning the deflection channels of the query target. Selecting a channel
//! takes the target out of list mode, so none of this mixes with streaming or building.

use crate::encoding::Instruction;
use crate::error::{Error, Result};
use crate::link::LinkExt;
use crate::opcode;
use crate::session::{ControllerSession, SessionState};
use crate::system::{MODE_CH, MODE_CHTEST};

/// Transfer size of setpoint and actual value blocks
const BLOCK_SIZE: usize = 512;

/// Address argument of the channel flash write
const CHANNEL_FLASH_ADDRESS: u16 = 0x1800;

impl SessionState {
    fn channel_run_mode(&mut self, mode: u16) -> Result<()> {
        let target = self.address.query_bit();
        let channel = self.channel;
        self.request(
            &Instruction::new(
                opcode::INT_RUNMODE,
                target,
                (mode as i16, opcode::SCODE as i16, channel, 0i8),
            ),
            1,
        )?;
        Ok(())
    }
}

impl ControllerSession {
    /// Puts the query target into channel mode on `channel` (0 to 2)
    ///
    /// `-1` re-enters channel mode on the channel selected before. Status polling stops until
    /// [`ControllerSession::system_reset`].
    pub fn ch_select(&self, channel: i8) -> Result<()> {
        let mut state = self.lock();
        state.abort()?;
        if !(-1..=2).contains(&channel) {
            return Err(Error::data(format!("channel {channel} out of range -1..=2")));
        }
        if channel >= 0 {
            state.channel = channel;
        }
        state.channel_run_mode(MODE_CH)?;
        state.channel_run_mode(MODE_CH)?;
        self.suspend_polling();
        Ok(())
    }

    /// Starts the test signal on the selected channel
    pub fn ch_test(&self) -> Result<()> {
        self.lock().channel_run_mode(MODE_CHTEST)
    }

    pub fn ch_param(&self, index: u16, value: u16) -> Result<()> {
        let mut state = self.lock();
        let target = state.address.query_bit();
        state.send(&Instruction::new(
            opcode::INT_CHTESTPARAMS,
            target,
            (index, value),
        ))
    }

    /// Sends servo command `command` and returns its one byte answer
    pub fn ch_read(&self, command: u8) -> Result<u8> {
        let mut state = self.lock();
        let target = state.address.query_bit();
        let reply = state.request(
            &Instruction::new(opcode::INT_DEFLEXCH, target, (command as u16, 1u16)),
            1,
        )?;
        Ok(reply[0])
    }

    pub fn ch_write(&self, command: u8) -> Result<()> {
        let mut state = self.lock();
        let target = state.address.query_bit();
        state.send(&Instruction::new(
            opcode::INT_DEFLWR,
            target,
            (command as u16, 0u16),
        ))
    }

    /// Reads `size` bytes of the servo parameter flash
    pub fn ch_read_flash(&self, size: u16) -> Result<Vec<u8>> {
        let mut state = self.lock();
        let target = state.address.query_bit();
        state.request(
            &Instruction::new(opcode::INT_CHFLASHRD, target, (0u16, size)),
            size as usize,
        )
    }

    pub fn ch_store_flash(&self, data: &[u8]) -> Result<()> {
        let size = u16::try_from(data.len())
            .map_err(|_| Error::data("servo parameter block too large"))?;
        let mut state = self.lock();
        let target = state.address.query_bit();
        let link = state.link()?;
        let header = Instruction::new(
            opcode::INT_CHFLASHPP,
            target,
            (CHANNEL_FLASH_ADDRESS, size),
        );
        link.acknowledged(&header.to_bytes(), 1, "servo flash header")?;
        link.acknowledged(data, 1, "servo flash data")
    }

    /// Loads a setpoint table, sent in blocks of 512 bytes after one header
    pub fn ch_setpoints(&self, data: &[u8]) -> Result<()> {
        let size =
            u16::try_from(data.len()).map_err(|_| Error::data("setpoint table too large"))?;
        let mut state = self.lock();
        let target = state.address.query_bit();
        let link = state.link()?;
        link.send(&Instruction::new(
            opcode::INT_CHSETPOINTS,
            target,
            (0u16, size),
        ))?;
        for block in data.chunks(BLOCK_SIZE) {
            link.exchange(block, 0)?;
        }
        Ok(())
    }

    /// Reads `size` bytes of recorded actual values
    pub fn ch_actuals(&self, size: usize) -> Result<Vec<u8>> {
        if size > u16::MAX as usize {
            return Err(Error::data("actual value block too large"));
        }
        let mut state = self.lock();
        let target = state.address.query_bit();
        let link = state.link()?;
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let n = (size - out.len()).min(BLOCK_SIZE);
            let cmd = Instruction::new(
                opcode::INT_CHACTUALS,
                target,
                (out.len() as u16, n as u16),
            );
            out.extend(link.request(&cmd, n)?);
        }
        Ok(out)
    }
}
