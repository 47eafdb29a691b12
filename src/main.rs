use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use rxprog::{
    DeviceDB, Flashing, Protocol,
    device::parse_id,
    format::{read_firmware_from_file, write_srec_file},
    transport::SerialTransport,
};

#[derive(clap::Parser)]
#[command(
    name = "rxprog",
    about = "Flash programmer for Renesas RX microcontrollers over the serial boot mode"
)]
struct Cli {
    /// Device name, e.g. RX63T, RX72T
    #[arg(short, long)]
    device: Option<String>,

    /// Serial port, overrides the device database
    #[arg(short = 'P', long)]
    port: Option<String>,

    /// Bit rate after negotiation, overrides the device database
    #[arg(short, long)]
    speed: Option<u32>,

    /// Erase the flash units covered by the image
    #[arg(short, long)]
    erase: bool,

    /// Write the image
    #[arg(short, long)]
    write: bool,

    /// Verify the flash against the image
    #[arg(short = 'V', long)]
    verify: bool,

    /// Read START,END into FILE as S-records
    #[arg(
        short,
        long,
        value_name = "START,END",
        value_parser = parse_range,
        conflicts_with_all = ["erase", "write", "verify"]
    )]
    read: Option<(u32, u32)>,

    /// ID code, 32 hex digits
    #[arg(long)]
    id: Option<String>,

    /// Show progress bars
    #[arg(long)]
    progress: bool,

    /// Debug logging and per-byte verify report
    #[arg(short, long)]
    verbose: bool,

    /// Device database (YAML) replacing the built-in one
    #[arg(long, value_name = "PATH")]
    conf: Option<PathBuf>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Pulse DTR/RTS to put the target into boot mode before connecting
    #[arg(long)]
    reset: bool,

    /// Load address of raw binary images
    #[arg(long, default_value = "0", value_parser = parse_number)]
    base: u32,

    /// Firmware image (.mot, .hex, .elf, .bin), or the output of --read
    file: Option<PathBuf>,
}

fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", s, e))
}

fn parse_range(s: &str) -> Result<(u32, u32), String> {
    let (start, end) = s
        .split_once(',')
        .ok_or_else(|| format!("expected START,END, got {:?}", s))?;
    Ok((parse_number(start)?, parse_number(end)?))
}

/// Whether the failure was a plain timeout rather than a desync.
fn retryable(e: &anyhow::Error) -> bool {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<rxprog::Error>())
        .is_some_and(rxprog::Error::is_retryable)
}

fn run(cli: Cli) -> Result<()> {
    if cli.list_ports {
        for port in SerialTransport::scan_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }

    let name = cli
        .device
        .as_deref()
        .ok_or_else(|| anyhow::format_err!("no device given, use --device"))?;
    let db = match &cli.conf {
        Some(path) => DeviceDB::load_from_file(path)?,
        None => DeviceDB::load()?,
    };
    let mut device = db.find(name)?;
    if let Some(port) = &cli.port {
        device.port = port.clone();
    }
    if let Some(speed) = cli.speed {
        device.speed = speed;
    }
    if let Some(id) = &cli.id {
        device.id = Some(parse_id(id)?);
    }

    let (mut erase, mut write, mut verify) = (cli.erase, cli.write, cli.verify);
    if !erase && !write && !verify && cli.read.is_none() {
        (erase, write, verify) = (true, true, true);
    }
    let image = if erase || write || verify {
        let path = cli
            .file
            .as_ref()
            .ok_or_else(|| anyhow::format_err!("no firmware file given"))?;
        let image = read_firmware_from_file(path, cli.base)?;
        for area in image.areas() {
            log::info!("Image: {} ({} bytes)", area, area.size());
        }
        Some(image)
    } else {
        None
    };
    let output = match cli.read {
        Some(_) => Some(
            cli.file
                .clone()
                .ok_or_else(|| anyhow::format_err!("no output file given for --read"))?,
        ),
        None => None,
    };

    let mut flashing = Flashing::open(&device, &device.port, cli.reset)?
        .with_progress(cli.progress)
        .with_verbose(cli.verbose);

    let result = (|| -> Result<()> {
        flashing.start(&device.to_bind_options())?;
        if let Some(image) = &image {
            if erase {
                flashing.erase(image)?;
            }
            if write {
                flashing.write(image)?;
            }
            if verify {
                let mismatches = flashing.verify(image)?;
                anyhow::ensure!(mismatches == 0, "verify failed: {} bytes differ", mismatches);
            }
        }
        if let (Some((start, end)), Some(path)) = (cli.read, &output) {
            let memory = flashing.read(start, end)?;
            write_srec_file(path, &memory)?;
        }
        Ok(())
    })();

    flashing.end();
    log::debug!("Session {:?}", flashing.protocol().state().phase());
    result
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if let Err(e) = run(cli) {
        log::error!("{:#}", e);
        if retryable(&e) {
            log::error!("The boot program did not answer in time, check the wiring and retry");
        }
        std::process::exit(-1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_and_ranges() {
        assert_eq!(parse_number("0xFFF8_0000").unwrap(), 0xfff8_0000);
        assert_eq!(parse_number("4096").unwrap(), 4096);
        assert!(parse_number("0xZZ").is_err());
        assert_eq!(
            parse_range("0xffff0000,0xffffffff").unwrap(),
            (0xffff_0000, 0xffff_ffff)
        );
        assert!(parse_range("0x1000").is_err());
    }

    #[test]
    fn cli_flags_parse() {
        let cli = Cli::try_parse_from([
            "rxprog", "-d", "RX63T", "-P", "/dev/ttyS0", "-e", "-w", "-V", "--progress", "fw.mot",
        ])
        .unwrap();
        assert_eq!(cli.device.as_deref(), Some("RX63T"));
        assert!(cli.erase && cli.write && cli.verify && cli.progress);
        assert_eq!(cli.file, Some(PathBuf::from("fw.mot")));

        let cli =
            Cli::try_parse_from(["rxprog", "-d", "RX72T", "--read", "0xfff00000,0xfff000ff", "out.mot"])
                .unwrap();
        assert_eq!(cli.read, Some((0xfff0_0000, 0xfff0_00ff)));
        assert_eq!(cli.base, 0);
    }

    #[test]
    fn read_excludes_image_actions() {
        for action in ["-e", "-w", "-V"] {
            assert!(
                Cli::try_parse_from([
                    "rxprog", "-d", "RX72T", action, "--read", "0x0,0xff", "fw.mot"
                ])
                .is_err(),
                "{} accepted with --read",
                action
            );
        }
    }

    #[test]
    fn only_timeouts_are_reported_retryable() {
        let timeout = anyhow::Error::from(rxprog::Error::Timeout).context("erase failed at 0x00100000");
        assert!(retryable(&timeout));
        let frame = anyhow::Error::from(rxprog::Error::Frame("short".into())).context("bind failed");
        assert!(!retryable(&frame));
        assert!(!retryable(&anyhow::format_err!("verify failed")));
    }
}
