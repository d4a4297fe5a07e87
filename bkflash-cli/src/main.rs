//! bkflash CLI - Command-line tool for flashing the Beken BK7258.
//!
//! ## Features
//!
//! - Flash raw firmware binaries over the BK7258 UART boot ROM
//! - Link probing and flash identification
//! - Raw serial monitor with hex fallback for binary output
//! - Shell completion generation
//! - Environment variable support

use anyhow::{Context, Result, bail};
use bkflash::{
    Bk7258Flasher, FlashImage, MonitorDecoder, MonitorSession, NativePort, NativePortEnumerator,
    PortEnumerator, Verification,
};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set by the Ctrl-C handler; polled by the library between sectors and
/// by the monitor loop.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    console::Term::stderr().is_term() && console::colors_enabled_stderr()
}

/// bkflash - A tool for flashing the Beken BK7258 over its UART boot ROM.
///
/// Environment variables:
///   BKFLASH_PORT   - Default serial port
///   BKFLASH_BAUD   - Default handshake baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "bkflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (see `bkflash list-ports`).
    #[arg(short, long, global = true, env = "BKFLASH_PORT")]
    port: Option<String>,

    /// Baud rate for the boot ROM handshake.
    #[arg(
        short,
        long,
        global = true,
        default_value = "115200",
        env = "BKFLASH_BAUD"
    )]
    baud: u32,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a raw firmware binary.
    Flash {
        /// Path to the firmware binary (e.g., all-app.bin).
        firmware: PathBuf,

        /// Flash start address (e.g., 0x0 or 0x132000).
        #[arg(long, default_value = "0", value_parser = parse_u32_auto)]
        addr: u32,

        /// Faster baud rate for the transfer phase (0 to disable).
        #[arg(long, default_value = "921600")]
        fast_baud: u32,

        /// Link-check probes before giving up.
        #[arg(long, default_value = "20")]
        retries: u32,
    },

    /// Probe the boot ROM link and identify the flash.
    LinkCheck {
        /// Link-check probes before giving up.
        #[arg(long, default_value = "30")]
        retries: u32,
    },

    /// Open a raw serial monitor.
    Monitor {
        /// Baud rate for monitoring (default: 115200).
        #[arg(long, default_value = "115200")]
        monitor_baud: u32,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a u32 that may be decimal or 0x-prefixed hex, with optional
/// underscore separators.
fn parse_u32_auto(s: &str) -> Result<u32, String> {
    let s: String = s.trim().chars().filter(|c| *c != '_').collect();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("Invalid address '{s}': {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection (clig.dev best practice) ---
    if std::env::var("NO_COLOR").is_ok() || !console::Term::stderr().is_term() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "bkflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    match &cli.command {
        Commands::Flash {
            firmware,
            addr,
            fast_baud,
            retries,
        } => cmd_flash(&cli, firmware, *addr, *fast_baud, *retries),
        Commands::LinkCheck { retries } => cmd_link_check(&cli, *retries),
        Commands::Monitor { monitor_baud } => cmd_monitor(&cli, *monitor_baud),
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Wire Ctrl-C to the library's cooperative interrupt checker.
fn install_interrupt_handler() {
    bkflash::set_interrupt_checker(|| INTERRUPTED.load(Ordering::Relaxed));
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
}

/// Serial port from CLI args, with a pointer to list-ports otherwise.
fn require_port(cli: &Cli) -> Result<String> {
    cli.port.clone().context(
        "No serial port specified. Pass --port (or set BKFLASH_PORT); \
         see `bkflash list-ports` for candidates",
    )
}

/// Flash command implementation.
fn cmd_flash(cli: &Cli, firmware: &PathBuf, addr: u32, fast_baud: u32, retries: u32) -> Result<()> {
    let image = FlashImage::from_file(firmware, addr)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Flashing {} ({} bytes, {} sectors) at {}",
            style("📦").cyan(),
            firmware.display(),
            image.len(),
            image.sector_count(),
            style(format!("{:#010x}", image.start_addr())).yellow()
        );
    }

    let port_name = require_port(cli)?;
    let port = NativePort::open_simple(&port_name, cli.baud)
        .with_context(|| format!("Failed to open {port_name}"))?;
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            port_name,
            cli.baud
        );
        eprintln!(
            "{} Waiting for boot ROM (power-cycle or reset the board now)...",
            style("⏳").yellow()
        );
    }

    let mut flasher = Bk7258Flasher::new(port)
        .with_retry_budget(retries)
        .with_fast_baud((fast_baud != 0).then_some(fast_baud));

    // Create progress bar
    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new((image.sector_count() * bkflash::SECTOR_SIZE) as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
                     {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let flash_result = flasher.flash(&image, |p| {
        pb.set_position(p.bytes_done as u64);
        pb.set_message(format!("{:#010x}", p.addr));
    });

    let result = match flash_result {
        Ok(result) => result,
        Err(err) => {
            pb.abandon();
            let _ = flasher.close();
            return Err(err).context("Flashing failed");
        },
    };

    pb.finish_with_message("done");
    let _ = flasher.close();

    if !cli.quiet {
        eprintln!(
            "{} Wrote {} bytes in {:.1}s ({:.1} KiB/s), {} blank sector(s) skipped",
            style("✓").green(),
            result.bytes_written,
            result.elapsed.as_secs_f64(),
            result.throughput_kib_s(),
            result.sectors_skipped
        );
    }

    match result.verification {
        Verification::Verified => {
            if !cli.quiet {
                eprintln!(
                    "{} CRC32 OK: {:#010x}",
                    style("✓").green().bold(),
                    result.local_crc
                );
                eprintln!("{} Device rebooted", style("🔄").cyan());
            }
            Ok(())
        },
        Verification::Mismatch => {
            eprintln!(
                "{} CRC32 MISMATCH: local {:#010x}, device {:#010x}",
                style("✗").red().bold(),
                result.local_crc,
                result.device_crc.unwrap_or_default()
            );
            bail!("CRC-32 verification failed (flash content is committed; reboot was sent)")
        },
        Verification::Inconclusive => {
            eprintln!(
                "{} Device returned no CRC32; verification inconclusive (local {:#010x})",
                style("⚠").yellow().bold(),
                result.local_crc
            );
            Ok(())
        },
    }
}

/// Link-check command implementation.
fn cmd_link_check(cli: &Cli, retries: u32) -> Result<()> {
    let port_name = require_port(cli)?;
    let port = NativePort::open_simple(&port_name, cli.baud)
        .with_context(|| format!("Failed to open {port_name}"))?;

    if !cli.quiet {
        eprintln!(
            "{} Probing {} at {} baud (power-cycle or reset the board now)...",
            style("⏳").yellow(),
            port_name,
            cli.baud
        );
    }

    let mut flasher = Bk7258Flasher::new(port).with_retry_budget(retries);
    if let Err(err) = flasher.connect() {
        let _ = flasher.close();
        return Err(err).context("Link check failed");
    }
    eprintln!("{} Boot ROM link established", style("✓").green().bold());

    if flasher.rom().stay_rom()? {
        eprintln!("{} Boot ROM staying resident", style("✓").green());
    } else {
        eprintln!("{} No response to stay-ROM request", style("⚠").yellow());
    }

    match flasher.rom().read_flash_id()? {
        Some(id) => eprintln!(
            "{} Flash ID: {}",
            style("ℹ").blue(),
            style(format!("{id:#010x}")).cyan()
        ),
        None => eprintln!("{} Could not read flash ID", style("⚠").yellow()),
    }

    let _ = flasher.close();
    Ok(())
}

/// Monitor command implementation.
fn cmd_monitor(cli: &Cli, monitor_baud: u32) -> Result<()> {
    let port_name = require_port(cli)?;

    eprintln!(
        "{} Monitoring {} at {} baud",
        style("📡").cyan(),
        style(&port_name).green(),
        monitor_baud
    );
    eprintln!("{}", style("Press Ctrl+C to exit.").dim());

    let mut session = MonitorSession::open(&port_name, monitor_baud)
        .with_context(|| format!("Failed to open {port_name}"))?;
    let mut decoder = MonitorDecoder::new();
    let mut buf = [0u8; 1024];

    while !INTERRUPTED.load(Ordering::Relaxed) {
        let n = session.read_chunk(&mut buf).context("Serial read failed")?;
        if n > 0 {
            print!("{}", decoder.push(&buf[..n]));
            io::stdout().flush().ok();
        }
    }

    print!("{}", decoder.finish());
    eprintln!("\n{}", style("Monitor stopped.").dim());
    Ok(())
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports().context("Failed to enumerate serial ports")?;

    if json {
        let entries: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("(none found)").dim());
        return Ok(());
    }

    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            vid_pid,
            product
        );
    }

    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        // Verifies that all derive macros produce a valid clap Command
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "bkflash",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "460800",
            "flash",
            "all-app.bin",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, 460800);
        assert!(matches!(cli.command, Commands::Flash { .. }));
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "bkflash",
            "flash",
            "fw.bin",
            "--addr",
            "0x132000",
            "--fast-baud",
            "0",
            "--retries",
            "5",
        ])
        .unwrap();
        if let Commands::Flash {
            firmware,
            addr,
            fast_baud,
            retries,
        } = cli.command
        {
            assert_eq!(firmware.to_str().unwrap(), "fw.bin");
            assert_eq!(addr, 0x132000);
            assert_eq!(fast_baud, 0);
            assert_eq!(retries, 5);
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_parse_flash_defaults() {
        let cli = Cli::try_parse_from(["bkflash", "flash", "fw.bin"]).unwrap();
        assert_eq!(cli.baud, 115200);
        if let Commands::Flash {
            addr,
            fast_baud,
            retries,
            ..
        } = cli.command
        {
            assert_eq!(addr, 0);
            assert_eq!(fast_baud, 921600);
            assert_eq!(retries, 20);
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_parse_link_check() {
        let cli = Cli::try_parse_from(["bkflash", "link-check", "--retries", "10"]).unwrap();
        if let Commands::LinkCheck { retries } = cli.command {
            assert_eq!(retries, 10);
        } else {
            panic!("Expected LinkCheck command");
        }
    }

    #[test]
    fn test_cli_parse_monitor_default_baud() {
        let cli = Cli::try_parse_from(["bkflash", "monitor"]).unwrap();
        if let Commands::Monitor { monitor_baud } = cli.command {
            assert_eq!(monitor_baud, 115200);
        } else {
            panic!("Expected Monitor command");
        }
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["bkflash", "list-ports", "--json"]).unwrap();
        if let Commands::ListPorts { json } = cli.command {
            assert!(json);
        } else {
            panic!("Expected ListPorts command");
        }
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["bkflash", "completions", "bash"]).unwrap();
        assert!(matches!(cli.command, Commands::Completions { .. }));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["bkflash"]).is_err());
    }

    // ---- parse_u32_auto ----

    #[test]
    fn test_parse_u32_auto_hex() {
        assert_eq!(parse_u32_auto("0x132000").unwrap(), 0x132000);
        assert_eq!(parse_u32_auto("0X00FF").unwrap(), 0xFF);
    }

    #[test]
    fn test_parse_u32_auto_decimal() {
        assert_eq!(parse_u32_auto("0").unwrap(), 0);
        assert_eq!(parse_u32_auto("4096").unwrap(), 4096);
    }

    #[test]
    fn test_parse_u32_auto_underscores_and_whitespace() {
        assert_eq!(parse_u32_auto("0x00_13_20_00").unwrap(), 0x132000);
        assert_eq!(parse_u32_auto("  0x10  ").unwrap(), 0x10);
    }

    #[test]
    fn test_parse_u32_auto_invalid() {
        assert!(parse_u32_auto("flash").is_err());
        assert!(parse_u32_auto("0xZZ").is_err());
        assert!(parse_u32_auto("0x1FFFFFFFF").is_err());
    }
}
