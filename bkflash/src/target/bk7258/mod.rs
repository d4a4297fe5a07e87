//! BK7258 boot-ROM support.

pub mod commands;
pub mod flasher;

pub use commands::{CommandTimeouts, RomClient};
pub use flasher::{Bk7258Flasher, FlashProgress, ProgrammingResult, Verification};
