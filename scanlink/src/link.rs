use crate::encoding::Instruction;
use crate::error::{Error, Result};
use std::io;

/// Trait representing the physical connection to a controller board
///
/// Every call writes a request and then reads back exactly `read_len` reply bytes. There are no
/// retries or timeouts at this layer, the implementation blocks until the exchange completes or
/// fails.
pub trait HardwareLink {
    /// Prepares the link for talking to the board at `address`
    fn open(&mut self, address: &str) -> io::Result<()> {
        let _ = address;
        Ok(())
    }

    /// Writes `write` and reads back `read_len` bytes
    fn exchange(&mut self, write: &[u8], read_len: usize) -> io::Result<Vec<u8>>;

    /// Releases the link
    fn close(&mut self) {}
}

impl<T> HardwareLink for &mut T
where
    T: HardwareLink + ?Sized,
{
    fn open(&mut self, address: &str) -> io::Result<()> {
        (**self).open(address)
    }

    fn exchange(&mut self, write: &[u8], read_len: usize) -> io::Result<Vec<u8>> {
        (**self).exchange(write, read_len)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<T> HardwareLink for Box<T>
where
    T: HardwareLink + ?Sized,
{
    fn open(&mut self, address: &str) -> io::Result<()> {
        (**self).open(address)
    }

    fn exchange(&mut self, write: &[u8], read_len: usize) -> io::Result<Vec<u8>> {
        (**self).exchange(write, read_len)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Request helpers available on every link
pub trait LinkExt: HardwareLink {
    /// Sends an instruction that produces no reply
    fn send(&mut self, instruction: &Instruction) -> Result<()> {
        self.exchange(&instruction.to_bytes(), 0)?;
        Ok(())
    }

    /// Sends an instruction and returns its `read_len` byte reply
    fn request(&mut self, instruction: &Instruction, read_len: usize) -> Result<Vec<u8>> {
        let reply = self.exchange(&instruction.to_bytes(), read_len)?;
        if reply.len() != read_len {
            return Err(Error::Link(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {read_len} reply bytes, got {}", reply.len()),
            )));
        }
        Ok(reply)
    }

    /// Writes `data` and checks the leading status byte of the `ack_len` byte acknowledgement
    fn acknowledged(&mut self, data: &[u8], ack_len: usize, what: &'static str) -> Result<()> {
        let reply = self.exchange(data, ack_len)?;
        match reply.first() {
            Some(&b) if (b as i8) < 0 => Err(Error::Device {
                request: what,
                status: b as i8,
            }),
            _ => Ok(()),
        }
    }
}

impl<T: HardwareLink + ?Sized> LinkExt for T {}
