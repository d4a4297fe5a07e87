//! # bkflash
//!
//! A library for flashing the Beken BK7258 over its UART boot ROM.
//!
//! This crate implements the BK HCI protocol the BK7258 boot ROM speaks
//! over a byte-oriented serial transport:
//!
//! - Framing and reassembly of the two response shapes the ROM emits
//! - A command layer with per-command timeouts and typed results
//! - A connection handshake tolerant of the ROM's power-on announcement
//!   racing the first probes
//! - A sector-oriented flash programmer with blank-sector skipping and
//!   CRC-32 verification against a locally computed reference
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for result types
//!
//! ## Example
//!
//! ```rust,no_run
//! use bkflash::{Bk7258Flasher, FlashImage, NativePort, Verification};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FlashImage::from_file("all-app.bin", 0)?;
//!
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115_200)?;
//!     let mut flasher = Bk7258Flasher::new(port).with_fast_baud(Some(921_600));
//!
//!     let result = flasher.flash(&image, |p| {
//!         println!("sector {:#010x} ({}/{})", p.addr, p.sectors_done, p.sectors_total);
//!     })?;
//!
//!     assert_eq!(result.verification, Verification::Verified);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod image;
pub mod monitor;
pub mod port;
pub mod protocol;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). The flasher
/// polls it between sectors only; a single sector's erase/write is never
/// abandoned mid-operation.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_CHECKER.get().is_some_and(|checker| checker())
}

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use monitor::MonitorSession;
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    error::{Error, Result},
    image::{ERASED_BYTE, FlashImage, SECTOR_SIZE, Sector},
    monitor::MonitorDecoder,
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::crc::{CRC_SEED, fold_crc32, image_crc32},
    protocol::hci::{Command, CommandFrame, FlashCommand, FrameDecoder, ProbeReply, Response},
    target::bk7258::{
        Bk7258Flasher, CommandTimeouts, FlashProgress, ProgrammingResult, RomClient, Verification,
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_unset_defaults_false() {
        // No checker registered in the library's own tests
        assert!(!is_interrupt_requested());
    }
}
