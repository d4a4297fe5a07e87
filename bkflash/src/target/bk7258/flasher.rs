//! BK7258 flash programmer.
//!
//! [`Bk7258Flasher`] drives the end-to-end flashing procedure on top of
//! the command layer: establish the link, keep the ROM resident, optionally
//! raise the line rate, then erase and write sector by sector and verify
//! the result against a locally computed CRC-32.
//!
//! The engine is strictly sequential: one command in flight, each step
//! gating the next. A failed sector operation aborts the run with the
//! failing address; a checksum mismatch does not, because the flash
//! content is already committed by then and the caller may still want the
//! reboot for diagnosis.

use crate::error::{Error, Result};
use crate::image::{FlashImage, SECTOR_SIZE};
use crate::port::Port;
use crate::protocol::crc::image_crc32;
use crate::protocol::hci::ProbeReply;
use crate::target::bk7258::commands::{CommandTimeouts, RomClient};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Default number of link-check probes before giving up.
pub const DEFAULT_RETRY_BUDGET: u32 = 20;

/// Response window for an ordinary link probe.
const PROBE_WINDOW: Duration = Duration::from_millis(300);

/// Longer window for the probe answering a startup notification: the ROM
/// listens for commands right after announcing itself.
const STARTUP_FOLLOWUP_WINDOW: Duration = Duration::from_secs(1);

/// Delay parameter passed to the ROM's set-baud command, in milliseconds.
const BAUD_SWITCH_DELAY_MS: u8 = 5;

/// Connection handshake states.
///
/// `StartupSeen` exists because the ROM's power-on announcement can race a
/// probe; answering it with a fresh probe inside its listening window beats
/// blindly retrying on the normal cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Probing,
    StartupSeen,
    Connected,
    Failed,
}

/// Post-write verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Verification {
    /// Device and host CRC-32 agree.
    Verified,
    /// Device and host CRC-32 disagree.
    Mismatch,
    /// The device produced no usable CRC; nothing is known either way.
    Inconclusive,
}

/// Outcome of one programming run.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProgrammingResult {
    /// Bytes actually written (blank sectors excluded).
    pub bytes_written: usize,
    /// Sectors erased and written.
    pub sectors_written: usize,
    /// Blank sectors skipped.
    pub sectors_skipped: usize,
    /// Wall-clock duration of the whole run.
    pub elapsed: Duration,
    /// CRC-32 computed locally over the image bytes.
    pub local_crc: u32,
    /// CRC-32 reported by the device, if any.
    pub device_crc: Option<u32>,
    /// Comparison of the two.
    pub verification: Verification,
}

impl ProgrammingResult {
    /// Average write throughput in KiB/s.
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput_kib_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_written as f64 / 1024.0 / secs
        } else {
            0.0
        }
    }
}

/// Per-sector progress report handed to the flash callback.
#[derive(Debug, Clone, Copy)]
pub struct FlashProgress {
    /// Address of the sector just processed.
    pub addr: u32,
    /// Sectors processed so far (written or skipped).
    pub sectors_done: usize,
    /// Total sectors in the image.
    pub sectors_total: usize,
    /// Padded bytes covered so far.
    pub bytes_done: usize,
    /// Padded bytes in the image.
    pub bytes_total: usize,
    /// Whether this sector was blank and skipped.
    pub skipped: bool,
}

/// BK7258 flasher.
///
/// Generic over the port type `P`, which must implement the `Port` trait;
/// tests drive it against an in-memory device.
pub struct Bk7258Flasher<P: Port> {
    rom: RomClient<P>,
    fast_baud: Option<u32>,
    retry_budget: u32,
}

impl<P: Port> Bk7258Flasher<P> {
    /// Create a flasher over an open port.
    pub fn new(port: P) -> Self {
        Self {
            rom: RomClient::new(port),
            fast_baud: None,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }

    /// Request a faster line rate for the transfer phase. `None` keeps
    /// the handshake rate throughout.
    #[must_use]
    pub fn with_fast_baud(mut self, baud: Option<u32>) -> Self {
        self.fast_baud = baud;
        self
    }

    /// Set the handshake retry budget.
    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Replace the command layer's response windows.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: CommandTimeouts) -> Self {
        self.rom = self.rom.with_timeouts(timeouts);
        self
    }

    /// Access the underlying command client.
    pub fn rom(&mut self) -> &mut RomClient<P> {
        &mut self.rom
    }

    /// Consume the flasher and return the underlying port.
    pub fn into_port(self) -> P {
        self.rom.into_port()
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        self.rom.port_mut().close()
    }

    /// Establish the boot-ROM link.
    ///
    /// The ROM only listens for a short window after power-on or after the
    /// previous exchange, so the handshake keeps re-sending link-check
    /// until something answers or the retry budget runs out.
    pub fn connect(&mut self) -> Result<()> {
        info!(
            "Probing boot ROM on {} (power-cycle or reset the board now)",
            self.rom.port().name()
        );

        let mut state = LinkState::Idle;
        let mut attempts = 0u32;

        loop {
            state = match state {
                LinkState::Idle => LinkState::Probing,

                LinkState::Probing => {
                    if attempts >= self.retry_budget {
                        LinkState::Failed
                    } else if crate::is_interrupt_requested() {
                        return Err(Error::Interrupted);
                    } else {
                        attempts += 1;
                        debug!("Link probe {attempts}/{}", self.retry_budget);
                        self.rom.flush_input()?;
                        match self.rom.probe(PROBE_WINDOW)? {
                            Some(rsp) => match rsp.classify() {
                                ProbeReply::Ack => LinkState::Connected,
                                ProbeReply::Startup => LinkState::StartupSeen,
                                ProbeReply::Other(cmd) => {
                                    warn!("Unexpected response {cmd:#04x} while probing");
                                    LinkState::Probing
                                },
                            },
                            None => LinkState::Probing,
                        }
                    }
                },

                LinkState::StartupSeen => {
                    debug!("Startup notification seen, answering with a fresh probe");
                    match self.rom.probe(STARTUP_FOLLOWUP_WINDOW)? {
                        Some(rsp) if rsp.classify() == ProbeReply::Ack => LinkState::Connected,
                        _ => LinkState::Probing,
                    }
                },

                LinkState::Connected => {
                    info!("Boot ROM link established after {attempts} probe(s)");
                    return Ok(());
                },

                LinkState::Failed => return Err(Error::Handshake { attempts }),
            };
        }
    }

    /// Flash `image` and verify it, reporting per-sector progress.
    ///
    /// Aborts on handshake failure and on any failed sector operation; a
    /// CRC mismatch or an inconclusive verification is carried in the
    /// returned [`ProgrammingResult`] instead.
    pub fn flash<F>(&mut self, image: &FlashImage, mut progress: F) -> Result<ProgrammingResult>
    where
        F: FnMut(FlashProgress),
    {
        let started = Instant::now();

        // Step 1: link
        self.connect()?;

        // Step 2: keep the ROM resident; some revisions never ack this
        if !self.rom.stay_rom()? {
            warn!("No response to stay-ROM request, continuing");
        }

        // Step 3: optional line-rate upgrade
        if let Some(baud) = self.fast_baud {
            if baud != self.rom.port().baud_rate() {
                info!("Switching to {baud} baud");
                if !self.rom.set_baud_rate(baud, BAUD_SWITCH_DELAY_MS)? {
                    warn!(
                        "Baud change not acknowledged, staying at {}",
                        self.rom.port().baud_rate()
                    );
                }
            }
        }

        // Step 4: flash identification
        match self.rom.read_flash_id()? {
            Some(id) => info!("Flash ID: {id:#010x}"),
            None => warn!("Could not read flash ID"),
        }

        // Step 5: erase and write, skipping blank sectors
        let sectors_total = image.sector_count();
        let bytes_total = sectors_total * SECTOR_SIZE;
        info!(
            "Writing {} bytes ({sectors_total} sectors) at {:#010x}",
            image.len(),
            image.start_addr()
        );

        let mut sectors_written = 0usize;
        let mut sectors_skipped = 0usize;
        let mut bytes_done = 0usize;

        for (index, sector) in image.sectors().enumerate() {
            if crate::is_interrupt_requested() {
                return Err(Error::Interrupted);
            }

            let skipped = sector.is_blank();
            if skipped {
                debug!("Skipping blank sector at {:#010x}", sector.addr);
                sectors_skipped += 1;
            } else {
                self.rom.sector_erase(sector.addr)?;
                self.rom.sector_write(sector.addr, &sector.data)?;
                sectors_written += 1;
            }

            bytes_done += SECTOR_SIZE;
            progress(FlashProgress {
                addr: sector.addr,
                sectors_done: index + 1,
                sectors_total,
                bytes_done,
                bytes_total,
                skipped,
            });
        }

        // Steps 6-7: checksum both sides and compare
        let local_crc = image_crc32(image.data());
        let device_crc = self.rom.check_crc32(image.start_addr(), image.end_addr())?;
        let verification = match device_crc {
            Some(crc) if crc == local_crc => {
                info!("CRC-32 verified: {local_crc:#010x}");
                Verification::Verified
            },
            Some(crc) => {
                warn!("CRC-32 mismatch: local {local_crc:#010x}, device {crc:#010x}");
                Verification::Mismatch
            },
            None => {
                warn!("Device produced no CRC-32, verification inconclusive");
                Verification::Inconclusive
            },
        };

        // Step 8: leave the ROM
        self.rom.reboot()?;

        Ok(ProgrammingResult {
            bytes_written: sectors_written * SECTOR_SIZE,
            sectors_written,
            sectors_skipped,
            elapsed: started.elapsed(),
            local_crc,
            device_crc,
            verification,
        })
    }
}
