//! Error types for bkflash.

use std::io;
use thiserror::Error;

/// Result type for bkflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bkflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Invalid firmware image or address range.
    #[error("Invalid image: {0}")]
    Image(String),

    /// Connection handshake exhausted its retry budget.
    #[error("No response from boot ROM after {attempts} link-check attempts")]
    Handshake {
        /// Probes sent before giving up.
        attempts: u32,
    },

    /// A sector erase failed or went unanswered.
    #[error("Sector erase failed at {addr:#010x} (status {status:?})")]
    SectorErase {
        /// Address of the failing sector.
        addr: u32,
        /// Status byte reported by the device, if any response arrived.
        status: Option<u8>,
    },

    /// A sector write failed or went unanswered.
    #[error("Sector write failed at {addr:#010x} (status {status:?})")]
    SectorWrite {
        /// Address of the failing sector.
        addr: u32,
        /// Status byte reported by the device, if any response arrived.
        status: Option<u8>,
    },

    /// The run was cancelled between sectors.
    #[error("Interrupted")]
    Interrupted,
}
