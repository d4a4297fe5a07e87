//! Native serial monitor primitives.
//!
//! The monitor is a raw pass-through: it never interprets BK HCI frames,
//! it just relays whatever the running application prints. Output is
//! decoded text-first, with a per-byte hex fallback for data that is not
//! valid UTF-8.

use std::fmt::Write as _;
#[cfg(feature = "native")]
use std::io::Read as _;

/// A native monitor session wrapping a serial port connection.
#[cfg(feature = "native")]
pub struct MonitorSession {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "native")]
impl MonitorSession {
    /// Open a monitor session on the specified port and baud rate.
    pub fn open(port_name: &str, baud_rate: u32) -> crate::Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(std::time::Duration::from_millis(100))
            .open()?;
        Ok(Self { port })
    }

    /// Read whatever the device has sent since the last call.
    ///
    /// Returns `Ok(0)` on a quiet line; the read timeout never surfaces
    /// as an error.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(crate::Error::Io(e)),
        }
    }
}

/// Streaming text decoder with hex fallback.
///
/// Valid UTF-8 passes through unchanged; bytes that can never form a
/// valid sequence are rendered as `<XX>` hex escapes. A trailing
/// incomplete multi-byte sequence is held back until the next chunk so
/// characters split across reads are not mangled.
#[derive(Debug, Default)]
pub struct MonitorDecoder {
    pending: Vec<u8>,
}

impl MonitorDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk of raw serial data into displayable text.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                },
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if valid_up_to > 0 {
                        if let Ok(text) = std::str::from_utf8(&self.pending[..valid_up_to]) {
                            out.push_str(text);
                        }
                    }

                    match err.error_len() {
                        Some(invalid_len) => {
                            for b in &self.pending[valid_up_to..valid_up_to + invalid_len] {
                                let _ = write!(out, "<{b:02X}>");
                            }
                            self.pending.drain(..valid_up_to + invalid_len);
                        },
                        None => {
                            // Incomplete suffix, wait for the next chunk
                            self.pending.drain(..valid_up_to);
                            break;
                        },
                    }
                },
            }
        }

        out
    }

    /// Flush any held-back incomplete suffix as hex (end of session).
    pub fn finish(&mut self) -> String {
        let mut out = String::new();
        for b in self.pending.drain(..) {
            let _ = write!(out, "<{b:02X}>");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ascii_passes_through() {
        let mut dec = MonitorDecoder::new();
        assert_eq!(dec.push(b"bootrom v1.2\r\n"), "bootrom v1.2\r\n");
        assert_eq!(dec.finish(), "");
    }

    #[test]
    fn test_invalid_bytes_become_hex() {
        let mut dec = MonitorDecoder::new();
        assert_eq!(dec.push(b"ok\xFE\xFFend"), "ok<FE><FF>end");
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        // '€' = E2 82 AC
        let mut dec = MonitorDecoder::new();
        assert_eq!(dec.push(&[0xE2, 0x82]), "");
        assert_eq!(dec.push(&[0xAC, b'!']), "€!");
    }

    #[test]
    fn test_incomplete_suffix_flushes_as_hex() {
        let mut dec = MonitorDecoder::new();
        assert_eq!(dec.push(&[b'a', 0xE2]), "a");
        assert_eq!(dec.finish(), "<E2>");
    }

    #[test]
    fn test_mixed_text_and_binary_chunks() {
        let mut dec = MonitorDecoder::new();
        let mut out = String::new();
        out.push_str(&dec.push(b"log: "));
        out.push_str(&dec.push(&[0x04, 0x0E, 0x80]));
        out.push_str(&dec.push(b"done"));
        assert_eq!(out, "log: \u{4}\u{e}<80>done");
    }
}
