//! BK HCI boot protocol framing.
//!
//! The BK7258 boot ROM speaks a framed command/response protocol over UART.
//! Commands come in two shapes, selected by a length-escape byte:
//!
//! ```text
//! Common command:
//! +----------------+-------+--------+------------+
//! |    Preamble    |  Len  | CmdId  |   Params   |
//! +----------------+-------+--------+------------+
//! |   01 E0 FC     | 1     | 1      |  variable  |
//! +----------------+-------+--------+------------+
//! Len = 1 + len(params)
//!
//! Flash subcommand (nested inside outer command 0xF4):
//! +----------------+------+------+---------+--------+------------+
//! |    Preamble    | Esc  | 0xF4 | InnerLen| SubCmd |   Params   |
//! +----------------+------+------+---------+--------+------------+
//! |   01 E0 FC     | FF   | 1    | 2 (LE)  | 1      |  variable  |
//! +----------------+------+------+---------+--------+------------+
//! InnerLen = 1 + len(params)
//! ```
//!
//! Responses open with the `04 0E` marker and use the same length escape:
//! a third byte of `0xFF` selects the flash shape, anything else is the
//! common shape:
//!
//! ```text
//! Common:  04 0E <len> 01 E0 FC <cmd> [payload...]        total = 3 + len
//! Flash:   04 0E FF 01 E0 FC F4 <len LE16> <cmd> <status> [payload...]
//!                                                total = 10 + len - 2
//! ```
//!
//! [`FrameDecoder`] reassembles responses incrementally from an arbitrary
//! byte stream, tolerating boot-log chatter before and between frames.

use crate::image::SECTOR_SIZE;
use byteorder::{LittleEndian, WriteBytesExt};

/// Preamble of every host-to-device command frame.
pub const COMMAND_PREAMBLE: [u8; 3] = [0x01, 0xE0, 0xFC];

/// Marker opening every device-to-host response frame.
pub const RESPONSE_MARKER: [u8; 2] = [0x04, 0x0E];

/// Length-field value that escapes into the flash frame shape.
pub const FLASH_LEN_ESCAPE: u8 = 0xFF;

/// Outer command id carrying all flash subcommands.
pub const FLASH_OUTER_CMD: u8 = 0xF4;

/// Command id of the link-check acknowledgment.
pub const RSP_LINK_CHECK: u8 = 0x01;

/// Fixed byte count of a flash-shaped response before its subcommand id.
const FLASH_RSP_FIXED: usize = 10;

/// Pending bytes kept while scanning for a response marker. Anything past
/// this without a marker is boot-log chatter and gets dropped.
const MAX_MARKER_SCAN: usize = 256;

/// Common (session-level) command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Probe whether the boot ROM is listening.
    LinkCheck = 0x00,
    /// Write a peripheral register.
    RegWrite = 0x01,
    /// Read a peripheral register.
    RegRead = 0x03,
    /// Reboot the device (param 0xA5). No response is sent.
    Reboot = 0x0E,
    /// Change the UART baud rate (params: u32 rate LE + u8 delay-ms).
    SetBaudRate = 0x0F,
    /// CRC-32 over a flash address range (params: u32 start + u32 end, LE).
    CheckCrc32 = 0x10,
    /// Keep the boot ROM active instead of jumping to the application.
    StayRom = 0xAA,
    /// Unsolicited power-on announcement from the ROM.
    Startup = 0xFE,
}

/// Flash subsystem subcommand ids (carried via [`FLASH_OUTER_CMD`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlashCommand {
    /// Arbitrary-length write.
    Write = 0x06,
    /// Write one 4 KiB sector (params: u32 address LE + sector bytes).
    SectorWrite = 0x07,
    /// Arbitrary-length read.
    Read = 0x08,
    /// Read one 4 KiB sector.
    SectorRead = 0x09,
    /// Erase the entire flash.
    ChipErase = 0x0A,
    /// Erase one 4 KiB sector (param: u32 address LE).
    SectorErase = 0x0B,
    /// Read a flash controller register.
    RegRead = 0x0C,
    /// Write a flash controller register.
    RegWrite = 0x0D,
    /// Raw SPI passthrough to the flash die.
    SpiOperate = 0x0E,
    /// Erase an arbitrary-sized region.
    SizeErase = 0x0F,
}

/// One outgoing request frame.
///
/// Length fields are computed at [`build`](CommandFrame::build) time from
/// the parameter bytes and are never hand-specified.
#[derive(Debug, Clone)]
pub enum CommandFrame {
    /// Session-level command.
    Common {
        /// Command id.
        cmd: Command,
        /// Parameter bytes following the id.
        params: Vec<u8>,
    },
    /// Flash-subsystem command, nested inside outer id 0xF4.
    Flash {
        /// Subcommand id.
        cmd: FlashCommand,
        /// Parameter bytes following the id.
        params: Vec<u8>,
    },
}

impl CommandFrame {
    /// Create a common command frame.
    pub fn common(cmd: Command, params: Vec<u8>) -> Self {
        Self::Common { cmd, params }
    }

    /// Create a flash subcommand frame.
    pub fn flash(cmd: FlashCommand, params: Vec<u8>) -> Self {
        Self::Flash { cmd, params }
    }

    /// Build a link-check probe.
    pub fn link_check() -> Self {
        Self::common(Command::LinkCheck, Vec::new())
    }

    /// Build a stay-in-ROM request.
    pub fn stay_rom() -> Self {
        Self::common(Command::StayRom, vec![0x55])
    }

    /// Build a baud rate change request. The ROM applies the new rate
    /// `delay_ms` milliseconds after acknowledging.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn set_baud_rate(baud: u32, delay_ms: u8) -> Self {
        let mut params = Vec::with_capacity(5);
        params.write_u32::<LittleEndian>(baud).unwrap();
        params.push(delay_ms);
        Self::common(Command::SetBaudRate, params)
    }

    /// Build a reboot request. The ROM does not respond to this.
    pub fn reboot() -> Self {
        Self::common(Command::Reboot, vec![0xA5])
    }

    /// Build a CRC-32 request over the inclusive range `[start, end]`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn check_crc32(start: u32, end: u32) -> Self {
        let mut params = Vec::with_capacity(8);
        params.write_u32::<LittleEndian>(start).unwrap();
        params.write_u32::<LittleEndian>(end).unwrap();
        Self::common(Command::CheckCrc32, params)
    }

    /// Build a JEDEC-ID read: SPI passthrough of the standard 0x9F opcode
    /// plus three clock bytes.
    pub fn read_flash_id() -> Self {
        Self::flash(FlashCommand::SpiOperate, vec![0x9F, 0x00, 0x00, 0x00])
    }

    /// Build a sector erase at `addr`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn sector_erase(addr: u32) -> Self {
        let mut params = Vec::with_capacity(4);
        params.write_u32::<LittleEndian>(addr).unwrap();
        Self::flash(FlashCommand::SectorErase, params)
    }

    /// Build a sector write of exactly one sector at `addr`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn sector_write(addr: u32, data: &[u8; SECTOR_SIZE]) -> Self {
        let mut params = Vec::with_capacity(4 + SECTOR_SIZE);
        params.write_u32::<LittleEndian>(addr).unwrap();
        params.extend_from_slice(data);
        Self::flash(FlashCommand::SectorWrite, params)
    }

    /// Build the complete frame bytes.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        match self {
            Self::Common { cmd, params } => {
                let mut buf = Vec::with_capacity(5 + params.len());
                buf.extend_from_slice(&COMMAND_PREAMBLE);
                // Safe cast, common params never approach 255 bytes
                buf.push((1 + params.len()) as u8);
                buf.push(*cmd as u8);
                buf.extend_from_slice(params);
                buf
            },
            Self::Flash { cmd, params } => {
                let mut buf = Vec::with_capacity(8 + params.len());
                buf.extend_from_slice(&COMMAND_PREAMBLE);
                buf.push(FLASH_LEN_ESCAPE);
                buf.push(FLASH_OUTER_CMD);
                // Safe cast, one sector plus an address fits in u16
                buf.write_u16::<LittleEndian>((1 + params.len()) as u16)
                    .unwrap();
                buf.push(*cmd as u8);
                buf.extend_from_slice(params);
                buf
            },
        }
    }

    /// Command id byte expected back in the response to this frame.
    ///
    /// Link-check is the one command answered under a different id; every
    /// other command (and every flash subcommand) is echoed back.
    pub fn expected_reply(&self) -> u8 {
        match self {
            Self::Common {
                cmd: Command::LinkCheck,
                ..
            } => RSP_LINK_CHECK,
            Self::Common { cmd, .. } => *cmd as u8,
            Self::Flash { cmd, .. } => *cmd as u8,
        }
    }
}

/// Classification of the first response seen while probing the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReply {
    /// Link-check acknowledgment.
    Ack,
    /// Unsolicited startup notification racing the probe.
    Startup,
    /// Anything else (stale echo of an earlier exchange).
    Other(u8),
}

/// One reassembled response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Common-shaped response.
    Common {
        /// Command id at the fixed header offset.
        cmd: u8,
        /// Bytes following the command id.
        payload: Vec<u8>,
    },
    /// Flash-shaped response (length escape 0xFF).
    Flash {
        /// Flash subcommand id.
        cmd: u8,
        /// Operation status byte; zero means success.
        status: u8,
        /// Bytes following the status.
        payload: Vec<u8>,
    },
}

impl Response {
    /// Command (or subcommand) id of this response.
    pub fn cmd(&self) -> u8 {
        match self {
            Self::Common { cmd, .. } | Self::Flash { cmd, .. } => *cmd,
        }
    }

    /// Payload bytes after the fixed header fields.
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Common { payload, .. } | Self::Flash { payload, .. } => payload,
        }
    }

    /// Status byte of a flash-shaped response, `None` for common ones.
    pub fn status(&self) -> Option<u8> {
        match self {
            Self::Common { .. } => None,
            Self::Flash { status, .. } => Some(*status),
        }
    }

    /// Classify this response as seen from a link probe.
    pub fn classify(&self) -> ProbeReply {
        match self {
            Self::Common {
                cmd: RSP_LINK_CHECK,
                ..
            } => ProbeReply::Ack,
            Self::Common { cmd, .. } if *cmd == Command::Startup as u8 => ProbeReply::Startup,
            other => ProbeReply::Other(other.cmd()),
        }
    }
}

/// Encode a common-shaped response frame.
///
/// The host never sends these; they exist for device simulators and tests.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_common_response(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7 + payload.len());
    buf.extend_from_slice(&RESPONSE_MARKER);
    buf.push((4 + payload.len()) as u8);
    buf.extend_from_slice(&COMMAND_PREAMBLE);
    buf.push(cmd);
    buf.extend_from_slice(payload);
    buf
}

/// Encode a flash-shaped response frame. See [`encode_common_response`].
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn encode_flash_response(cmd: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11 + payload.len());
    buf.extend_from_slice(&RESPONSE_MARKER);
    buf.push(FLASH_LEN_ESCAPE);
    buf.extend_from_slice(&COMMAND_PREAMBLE);
    buf.push(FLASH_OUTER_CMD);
    // Inner length counts subcommand, status and payload, plus the one
    // byte the fixed-offset total formula gives back.
    buf.write_u16::<LittleEndian>((3 + payload.len()) as u16)
        .unwrap();
    buf.push(cmd);
    buf.push(status);
    buf.extend_from_slice(payload);
    buf
}

/// Incremental response reassembler.
///
/// Feed raw bytes in with [`extend`](FrameDecoder::extend) and poll
/// [`try_frame`](FrameDecoder::try_frame); it scans for the response
/// marker, discriminates the two frame shapes off the length escape and
/// holds partial frames until their declared length is fully buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes currently pending.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Try to extract the next complete response frame.
    ///
    /// Returns `None` while no complete frame is buffered. Bytes preceding
    /// a marker are discarded; if no marker shows up within a bounded
    /// window, all but the final byte are dropped (it may be the first
    /// marker byte of a frame still in flight).
    pub fn try_frame(&mut self) -> Option<Response> {
        loop {
            let start = self
                .buf
                .windows(RESPONSE_MARKER.len())
                .position(|w| w == RESPONSE_MARKER);

            let Some(start) = start else {
                if self.buf.len() > MAX_MARKER_SCAN {
                    let tail = *self.buf.last()?;
                    self.buf.clear();
                    self.buf.push(tail);
                }
                return None;
            };

            if start > 0 {
                self.buf.drain(..start);
            }

            if self.buf.len() < 3 {
                return None;
            }

            let len_byte = self.buf[2];
            let total = if len_byte == FLASH_LEN_ESCAPE {
                if self.buf.len() < FLASH_RSP_FIXED {
                    return None;
                }
                let inner = u16::from_le_bytes([self.buf[7], self.buf[8]]) as usize;
                // The inner length double-counts two header bytes
                let Some(total) = (FLASH_RSP_FIXED + inner).checked_sub(2) else {
                    self.resync();
                    continue;
                };
                // Must at least reach the status byte
                if total <= FLASH_RSP_FIXED {
                    self.resync();
                    continue;
                }
                total
            } else {
                let total = 3 + len_byte as usize;
                // Must at least reach the command id
                if total < 7 {
                    self.resync();
                    continue;
                }
                total
            };

            if self.buf.len() < total {
                return None;
            }

            let frame: Vec<u8> = self.buf.drain(..total).collect();
            let response = if len_byte == FLASH_LEN_ESCAPE {
                Response::Flash {
                    cmd: frame[9],
                    status: frame[10],
                    payload: frame[11..].to_vec(),
                }
            } else {
                Response::Common {
                    cmd: frame[6],
                    payload: frame[7..].to_vec(),
                }
            };
            return Some(response);
        }
    }

    /// Skip a marker whose declared length is nonsense and rescan.
    fn resync(&mut self) {
        self.buf.drain(..RESPONSE_MARKER.len());
    }
}
