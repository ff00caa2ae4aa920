//! Serial port link
//!
//! Talks to a board attached through a tty, such as a USB serial adapter. The port is switched
//! to raw mode on open.

use crate::link::HardwareLink;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg};
use nix::unistd;
use std::io;
use std::os::unix::io::RawFd;

/// [`HardwareLink`] over a serial tty
#[derive(Debug)]
pub struct SerialLink {
    baud_rate: BaudRate,
    fd: Option<RawFd>,
}

impl Default for SerialLink {
    fn default() -> Self {
        SerialLink::new(BaudRate::B115200)
    }
}

impl SerialLink {
    pub fn new(baud_rate: BaudRate) -> Self {
        SerialLink {
            baud_rate,
            fd: None,
        }
    }

    fn fd(&self) -> io::Result<RawFd> {
        self.fd
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port not open"))
    }

    fn configure(&self, fd: RawFd) -> nix::Result<()> {
        let mut tio = termios::tcgetattr(fd)?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetspeed(&mut tio, self.baud_rate)?;
        termios::tcsetattr(fd, SetArg::TCSANOW, &tio)
    }
}

impl HardwareLink for SerialLink {
    fn open(&mut self, address: &str) -> io::Result<()> {
        self.close();
        let fd = fcntl::open(address, OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty())?;
        if let Err(e) = self.configure(fd) {
            let _ = unistd::close(fd);
            return Err(e.into());
        }
        self.fd = Some(fd);
        Ok(())
    }

    fn exchange(&mut self, write: &[u8], read_len: usize) -> io::Result<Vec<u8>> {
        let fd = self.fd()?;
        let mut sent = 0;
        while sent < write.len() {
            sent += unistd::write(fd, &write[sent..])?;
        }
        let mut reply = vec![0u8; read_len];
        let mut got = 0;
        while got < read_len {
            match unistd::read(fd, &mut reply[got..])? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed",
                    ))
                }
                n => got += n,
            }
        }
        Ok(reply)
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = unistd::close(fd);
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty;
    use std::thread;

    #[test]
    fn exchange_over_pty() {
        let ptys =
            pty::openpty(None::<&pty::Winsize>, None::<&termios::Termios>).unwrap();
        let name = unistd::ttyname(ptys.slave).unwrap();
        let master = ptys.master;
        let echo = thread::spawn(move || {
            let mut buf = [0u8; 8];
            let mut got = 0;
            while got < buf.len() {
                got += unistd::read(master, &mut buf[got..]).unwrap();
            }
            buf.reverse();
            unistd::write(master, &buf[..3]).unwrap();
        });

        let mut link = SerialLink::default();
        link.open(name.to_str().unwrap()).unwrap();
        let reply = link.exchange(&[1, 2, 3, 4, 5, 6, 7, 8], 3).unwrap();
        assert_eq!(reply, [8, 7, 6]);
        echo.join().unwrap();
        link.close();
        assert!(link.exchange(&[0], 0).is_err());
        let _ = unistd::close(ptys.master);
        let _ = unistd::close(ptys.slave);
    }
}
