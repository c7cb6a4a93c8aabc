//! polykb keyboard driver CLI
//!
//! Command-line access to the device protocol: struct reads and writes,
//! memory/eeprom access, payload upload, RGB streaming, and live console
//! and key-event monitoring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use polykb::registry;
use polykb::{Device, DeviceConfig, Endianness};
use polykb_device::Value;
use polykb_transport::{
    FrameCodec, LegacyCodec, RawCodec, RawHidTransport, SerialTransport, SharedTransport,
};

#[derive(Parser)]
#[command(name = "polykb")]
#[command(author, version, about = "polykb programmable keyboard driver")]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyACM0)
    #[arg(long, global = true, value_name = "PATH")]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = 115_200)]
    baud: u32,

    /// Raw HID device as vid:pid (hex, e.g. 1209:6101)
    #[arg(long, global = true, value_name = "VID:PID")]
    hid: Option<String>,

    /// Raw HID endpoint size in bytes
    #[arg(long, global = true, default_value_t = 64)]
    epsize: usize,

    /// Use the legacy 7-bit-pair frame encoding
    #[arg(long, global = true)]
    legacy: bool,

    /// Device is big-endian
    #[arg(long, global = true)]
    big_endian: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported keyboard models
    Models,

    /// Follow console output from the device firmware
    Console,

    /// Watch key press/release events
    Watch,

    /// Get or set the device mode
    Mode {
        /// New mode character; omit to query
        value: Option<char>,
    },

    /// Read a structure's current values
    #[command(visible_alias = "rs")]
    ReadStruct {
        /// Structure id (hex ok)
        #[arg(value_parser = parse_u8)]
        id: u8,
    },

    /// Show a structure's layout as announced by the device
    Layout {
        #[arg(value_parser = parse_u8)]
        id: u8,
    },

    /// Read device RAM
    MemRead {
        #[arg(value_parser = parse_u32)]
        addr: u32,
        #[arg(default_value_t = 4)]
        size: u8,
    },

    /// Write device RAM
    MemWrite {
        #[arg(value_parser = parse_u32)]
        addr: u32,
        #[arg(value_parser = parse_u32)]
        value: u32,
        #[arg(default_value_t = 4)]
        size: u8,
    },

    /// Read device EEPROM
    EepromRead {
        #[arg(value_parser = parse_u32)]
        addr: u32,
        #[arg(default_value_t = 4)]
        size: u8,
    },

    /// Write device EEPROM
    EepromWrite {
        #[arg(value_parser = parse_u32)]
        addr: u32,
        #[arg(value_parser = parse_u32)]
        value: u32,
        #[arg(default_value_t = 4)]
        size: u8,
    },

    /// Query the EEPROM layout (start address and size)
    EepromLayout,

    /// Call a function at a device address
    Call {
        #[arg(value_parser = parse_u32)]
        addr: u32,
    },

    /// Upload a payload file to a destination id and commit it
    Upload {
        #[arg(value_parser = parse_u16)]
        dest: u16,
        file: PathBuf,
    },

    /// Execute a previously uploaded dynamic function
    Exec {
        #[arg(value_parser = parse_u16)]
        dest: u16,
    },

    /// Fill the RGB buffer of a known model with one color
    RgbFill {
        #[arg(value_parser = parse_u16)]
        dest: u16,
        r: u8,
        g: u8,
        b: u8,
    },
}

fn parse_u8(s: &str) -> Result<u8, String> {
    parse_int(s).map(|v| v as u8)
}

fn parse_u16(s: &str) -> Result<u16, String> {
    parse_int(s).map(|v| v as u16)
}

fn parse_u32(s: &str) -> Result<u32, String> {
    parse_int(s)
}

fn parse_int(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s}: {e}"))
}

fn parse_hid_ids(s: &str) -> Result<(u16, u16)> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("expected vid:pid, got {s}"))?;
    Ok((
        u16::from_str_radix(vid, 16).context("bad vendor id")?,
        u16::from_str_radix(pid, 16).context("bad product id")?,
    ))
}

fn connect(cli: &Cli) -> Result<(Device, Option<&'static registry::DeviceModel>)> {
    let mut model = None;
    let transport: SharedTransport = if let Some(ref path) = cli.serial {
        Arc::new(SerialTransport::open(path, cli.baud)?)
    } else if let Some(ref ids) = cli.hid {
        let (vid, pid) = parse_hid_ids(ids)?;
        model = registry::find(vid, pid);
        Arc::new(RawHidTransport::open(vid, pid, cli.epsize)?)
    } else {
        bail!("no transport selected; pass --serial or --hid");
    };
    let codec: Arc<dyn FrameCodec> = if cli.legacy {
        Arc::new(LegacyCodec)
    } else {
        Arc::new(RawCodec)
    };
    let config = DeviceConfig {
        endianness: if cli.big_endian {
            Endianness::Big
        } else {
            Endianness::Little
        },
        ..DeviceConfig::default()
    };
    info!("connected via {}", transport.info().path);
    Ok((Device::new(transport, codec, config), model))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    if let Commands::Models = cli.command {
        for model in registry::MODELS {
            println!(
                "{:10} {:04x}:{:04x}  {}x{} matrix, {} layers, {} pixels",
                model.name,
                model.vid,
                model.pid,
                model.rows,
                model.cols,
                model.default_layers,
                model.pixel_count(),
            );
        }
        return Ok(());
    }

    let (device, model) = connect(&cli)?;

    match cli.command {
        Commands::Models => unreachable!("handled before connect"),

        Commands::Console => {
            let mut console = device.subscribe_console();
            loop {
                tokio::select! {
                    line = console.recv() => match line {
                        Ok(text) => print!("{text}"),
                        Err(_) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        Commands::Watch => {
            let layout = model.map(registry::DeviceModel::layout);
            let mut events = device.subscribe_key_events();
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(e) => {
                            let name = layout
                                .as_ref()
                                .and_then(|l| l.name(e.row, e.col))
                                .unwrap_or("?");
                            println!(
                                "{:>8}  ({}, {})  {}  {}",
                                e.time,
                                e.row,
                                e.col,
                                if e.pressed { "down" } else { "up  " },
                                name,
                            );
                        }
                        Err(_) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        Commands::Mode { value: Some(mode) } => {
            device.set_mode(mode as u8).await?;
            println!("mode set to {mode}");
        }
        Commands::Mode { value: None } => {
            println!("{}", device.get_mode().await? as char);
        }

        Commands::ReadStruct { id } => {
            let values = device.read_struct(id).await?;
            for (field, value) in &values {
                match value {
                    Value::Uint(v) => println!("  field 0x{field:02X} = {v} (0x{v:X})"),
                    Value::Float(v) => println!("  field 0x{field:02X} = {v}"),
                    Value::Bytes(b) => println!("  field 0x{field:02X} = {b:02X?}"),
                }
            }
        }

        Commands::Layout { id } => {
            let layout = device.ensure_layout(id).await?;
            println!(
                "structure 0x{:02X}: {} bytes, flags 0x{:02X}",
                layout.struct_id, layout.struct_size, layout.flags
            );
            for field in &layout.fields {
                println!(
                    "  field 0x{:02X}: {:?} at bit {} (size {})",
                    field.id, field.ty, field.bit_offset, field.size
                );
            }
        }

        Commands::MemRead { addr, size } => {
            let value = device.mem_read(addr, size).await?;
            println!("0x{addr:08X} = 0x{value:0width$X}", width = size as usize * 2);
        }
        Commands::MemWrite { addr, value, size } => {
            device.mem_write(addr, size, value).await?;
            println!("wrote 0x{value:X} to 0x{addr:08X}");
        }
        Commands::EepromRead { addr, size } => {
            let value = device.eeprom_read(addr, size).await?;
            println!("0x{addr:08X} = 0x{value:0width$X}", width = size as usize * 2);
        }
        Commands::EepromWrite { addr, value, size } => {
            device.eeprom_write(addr, size, value).await?;
            println!("wrote 0x{value:X} to 0x{addr:08X}");
        }
        Commands::EepromLayout => {
            let (start, size) = device.eeprom_layout().await?;
            println!("eeprom at 0x{start:08X}, {size} bytes");
        }

        Commands::Call { addr } => {
            let result = device.call(addr).await?;
            println!("returned {result:02X?}");
        }

        Commands::Upload { dest, file } => {
            let payload = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            device.upload_payload(dest, &payload).await?;
            println!("uploaded {} bytes to destination {dest}", payload.len());
        }

        Commands::Exec { dest } => {
            let result = device.exec_function(dest).await?;
            println!("executed, result {result:02X?}");
        }

        Commands::RgbFill { dest, r, g, b } => {
            let model =
                model.ok_or_else(|| anyhow!("rgb-fill needs a known model; pass --hid"))?;
            let pixels: Vec<u8> = std::iter::repeat([r, g, b])
                .take(model.pixel_count())
                .flatten()
                .collect();
            device.stream_rgb(dest, &pixels).await?;
            println!("streamed {} pixels", model.pixel_count());
        }
    }

    // Give fire-and-forget frames a moment to drain before teardown
    tokio::time::sleep(Duration::from_millis(20)).await;
    device.close();
    Ok(())
}
