//! Scanlink is a host side driver for networked galvo scanner controllers
//!
//! A controller consists of a front end board, reached over a byte stream link, and up to eight
//! scan head targets behind it. The host talks to the front end with fixed size 8 byte
//! instructions. Most instructions are list instructions: they are either streamed to the board,
//! where the targets execute them in order, or compiled into a program image that is stored in
//! the board's flash or sent over as a single code block. The remaining instructions are
//! interrupts, executed directly by the front end and usually answered with a short reply.
//!
//! Everything starts with a [`ControllerSession`]. A session is created from a
//! [`SessionConfig`] and connected to a [`HardwareLink`] implementation. The crate ships two:
//! [`SimulatedBoard`], an in-memory controller, and [`SerialLink`] (feature `serial`), which talks
//! to a board attached through a tty.
//!
//! ```no_run
//! use scanlink::{ControllerSession, SessionConfig, SimulatedBoard};
//! use std::time::Duration;
//!
//! # fn main() -> scanlink::Result<()> {
//! let config = SessionConfig::default();
//! let board = SimulatedBoard::new(&config.flash);
//! let session = ControllerSession::new(config)?;
//! session.connect("sim", board)?;
//!
//! session.open_stream()?;
//! session.set_speed(500.0)?;
//! session.jump_xy(-10.0, -10.0)?;
//! session.set_laser(true)?;
//! session.line_xy(10.0, 10.0)?;
//! session.set_laser(false)?;
//! session.wait_idle(Duration::from_secs(5))?;
//! # Ok(())
//! # }
//! ```
//!
//! Once connected, a background poller keeps the session's copy of the board status fresh and
//! drains the stream queue whenever the board reports free credit. List instructions issued in
//! streaming mode are therefore only queued; [`ControllerSession::status`] reports whether the
//! board is still busy with them.
//!
//! A program is compiled by opening a build instead of a stream. Control flow (`if`, `while`,
//! `loop`) is only available while building, as the branch addresses are backpatched into the
//! image:
//!
//! ```no_run
//! # use scanlink::{BuildVariant, ControllerSession, IoCondition};
//! # fn build(session: &ControllerSession) -> scanlink::Result<()> {
//! session.open_build(BuildVariant::File, "marker")?;
//! session.loop_begin(3)?;
//! session.if_begin(IoCondition::equal(0x01, 0x01))?;
//! session.line_xy(5.0, 0.0)?;
//! session.if_end()?;
//! session.loop_end()?;
//! session.close_build()?;
//! # Ok(())
//! # }
//! ```
//!
//! All operations return a [`Result`]. Every [`Error`] maps to one of the numeric
//! [`ErrorCode`]s used by the vendor driver, see [`Error::code`] and [`result_code`].
//!
//! The library logs through the [`log`] facade. Installing a logger is up to the application.

pub mod assembler;
pub mod channel;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flash;
pub mod link;
pub mod opcode;
pub mod ops;
pub mod output_buffer;
pub mod params;
pub mod profile;
#[cfg(feature = "serial")]
pub mod serial;
pub mod session;
pub mod sim;
pub mod sink;
pub mod status;
pub mod system;

mod fifo_buffer;
mod transport;

pub use assembler::IoCondition;
pub use config::{FlashGeometry, SessionConfig};
pub use encoding::{Instruction, Operands};
pub use error::{result_code, Error, ErrorCode, Result};
pub use flash::FileEntry;
pub use link::HardwareLink;
pub use params::ParamSet;
pub use profile::ProfileInclude;
#[cfg(feature = "serial")]
pub use serial::SerialLink;
pub use session::{ControllerSession, TargetAddress};
pub use sim::SimulatedBoard;
pub use sink::{BuildVariant, SessionMode};
pub use status::{ListStatus, TargetStatus};
pub use system::SystemReport;
