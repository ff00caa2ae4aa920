use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Numeric result codes as reported to controller tooling
///
/// These match the codes returned by the vendor driver API, so values can be passed through to
/// existing front ends unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = -1,
    Busy = 2,
    Job = 3,
    Hardware = 5,
    Data = 13,
    Flash = 45,
    Interlock = 48,
    WarningBios = 49,
}

impl ErrorCode {
    pub fn value(self) -> i32 {
        self as i32
    }
}

/// Errors surfaced by every session operation
#[derive(Debug, Error)]
pub enum Error {
    /// Bad argument or API misuse, detected before touching hardware
    #[error("invalid data: {0}")]
    Data(String),

    /// Operation not permitted in the current session mode
    #[error("operation not valid while session is {0}")]
    Job(&'static str),

    /// The hardware link failed or is not open
    #[error("hardware link: {0}")]
    Link(#[from] io::Error),

    /// The device answered with a failure acknowledgement
    #[error("device rejected {request} (status {status})")]
    Device { request: &'static str, status: i8 },

    #[error("not connected")]
    NotConnected,

    /// No flash space left, or a size limit was exceeded
    #[error("flash: {0}")]
    Flash(&'static str),

    #[error("controller busy")]
    Busy,

    /// IO status aborted execution on the device
    #[error("interlock active")]
    Interlock,

    /// Firmware on the device does not match the expected version
    #[error("incompatible firmware on target mask {0:#04x}")]
    Bios(u8),

    /// Host-side file access failed
    #[error("{}: {source}", path.display())]
    HostFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn data(msg: impl Into<String>) -> Self {
        Error::Data(msg.into())
    }

    pub(crate) fn host_file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::HostFile {
            path: path.into(),
            source,
        }
    }

    /// Maps the error onto the vendor numeric code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Data(_) | Error::HostFile { .. } | Error::Config(_) => ErrorCode::Data,
            Error::Job(_) => ErrorCode::Job,
            Error::Link(_) | Error::Device { .. } | Error::NotConnected => ErrorCode::Hardware,
            Error::Flash(_) => ErrorCode::Flash,
            Error::Busy => ErrorCode::Busy,
            Error::Interlock => ErrorCode::Interlock,
            Error::Bios(_) => ErrorCode::WarningBios,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Collapses a result into the vendor numeric code
pub fn result_code<T>(result: &Result<T>) -> ErrorCode {
    match result {
        Ok(_) => ErrorCode::Ok,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_vendor_values() {
        assert_eq!(ErrorCode::Ok.value(), -1);
        assert_eq!(Error::data("x").code().value(), 13);
        assert_eq!(Error::Flash("full").code().value(), 45);
        assert_eq!(Error::NotConnected.code(), ErrorCode::Hardware);
        assert_eq!(Error::Interlock.code().value(), 48);
        assert_eq!(result_code(&Ok::<_, Error>(())), ErrorCode::Ok);
        assert_eq!(result_code::<()>(&Err(Error::Busy)), ErrorCode::Busy);
    }
}
