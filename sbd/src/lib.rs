//! Session driver for Iridium short burst data (SBD) satellite modems, such as
//! the RockBLOCK.
//!
//! The modem is driven over a serial link with the Iridium AT command dialect.
//! Everything hardware-facing is injected: the serial byte streams to the modem
//! and to an operator console ([`Transport`]), the power and sleep lines
//! ([`OutputLine`]) and the monotonic clock ([`Clock`]). Start with
//! [`Session::builder()`].

#![allow(clippy::missing_errors_doc)]

mod at;
mod console;
mod framer;
mod mailbox;
mod power;
mod retrieve;
mod session;

pub mod config;
pub mod io;
pub mod status;
pub mod test_utils;

pub use crate::config::Config;
pub use crate::framer::{checksum, truncate_text};
pub use crate::io::{Clock, OutputLine, SystemClock, Transport};
pub use crate::session::{ModemInfo, Session, State};
pub use crate::status::{MailboxState, MoBuffer, MtBuffer};

/// Maximum size of an outbound text message, in bytes.
pub const MAX_TX_TEXT_LEN: usize = 120;
/// Maximum size of an inbound message delivered as text, in bytes.
pub const MAX_RX_TEXT_LEN: usize = 135;
/// Maximum size of an outbound binary message, in bytes.
pub const MAX_TX_BINARY_LEN: usize = 340;
/// Maximum size of an inbound binary message, in bytes.
pub const MAX_RX_BINARY_LEN: usize = 270;

/// Console byte that cancels a pending power-up retry or mailbox check.
pub const CANCEL_BYTE: u8 = b'c';

/// Error definition for the session driver.
///
/// A session that returned an error from a send or receive operation may be
/// used again. Only a cancel powers the modem down on the way out.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("serial transport failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("no modem detected, power-up was never acknowledged")]
    NoModemDetected,
    #[error("message is empty")]
    MessageSize,
    #[error("mailbox check timed out after {elapsed_ms}ms")]
    SendReceiveTimeout { elapsed_ms: u64 },
    #[error("failed to upload message to the modem")]
    UploadToModem,
    #[error(
        "inbound message checksum mismatch, computed: 0x{computed:04X}, modem: 0x{received:04X}"
    )]
    ChecksumMismatch { computed: u16, received: u16 },
    #[error("inbound message download stalled after {received} of {expected} bytes")]
    Download { expected: usize, received: usize },
    #[error("buffer status query was not acknowledged")]
    GetStatus,
    #[error("failed to clear the {0} buffer")]
    ClearModemBuffer(Buffer),
    #[error("cancelled from console")]
    Cancelled,
    #[error("no response to {command}")]
    NoResponse { command: &'static str },
}

impl Error {
    /// Stable numeric result code, `0` being reserved for success.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Error::NoResponse { .. } => 1,
            Error::Io(_) => 2,
            Error::NoModemDetected => 3,
            Error::MessageSize => 4,
            Error::SendReceiveTimeout { .. } => 5,
            Error::UploadToModem => 6,
            Error::ChecksumMismatch { .. } | Error::Download { .. } => 7,
            Error::GetStatus => 8,
            Error::ClearModemBuffer(_) => 9,
            Error::Cancelled => 10,
        }
    }
}

/// The two modem side message buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffer {
    /// Mobile originated, staging the outbound message.
    MobileOriginated,
    /// Mobile terminated, holding the last delivered inbound message.
    MobileTerminated,
}

impl std::fmt::Display for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Buffer::MobileOriginated => write!(f, "MO"),
            Buffer::MobileTerminated => write!(f, "MT"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
