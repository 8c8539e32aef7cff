use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use nrf_dfu_core::digest::image_digest;
use nrf_dfu_core::packet::{InitPacketParams, encode_init_packet, encode_reset_packet};
use nrf_dfu_core::transport::usb::list_bootloaders;
use nrf_dfu_core::{DeviceRegistry, FirmwareImage, FwType, HashType, SessionConfig, SignatureType};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Nordic secure DFU tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Session configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List Nordic devices in bootloader mode
    Devices,
    /// Encode an Init packet
    InitPacket(InitArgs),
    /// Encode a Reset packet
    ResetPacket {
        /// Reset timeout; defaults to the configured value
        #[arg(long, value_parser = parse_u32)]
        timeout: Option<u32>,
        #[command(flatten)]
        signature: SignatureArgs,
        /// Write the packet here instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Look up a device definition by hardware id
    Lookup { hardware_id: String },
    /// Write the default configuration to a file
    Config { path: PathBuf },
}

#[derive(ClapArgs, Debug)]
struct InitArgs {
    /// Firmware image; sizes and digest are derived from it
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "application")]
    fw_type: FwTypeArg,
    #[arg(long, value_parser = parse_u32)]
    fw_version: Option<u32>,
    #[arg(long, value_parser = parse_u32)]
    hw_version: Option<u32>,
    /// Accepted SoftDevice id; repeat for several
    #[arg(long, value_parser = parse_u32)]
    sd_req: Vec<u32>,
    #[arg(long, value_parser = parse_u32)]
    sd_size: Option<u32>,
    #[arg(long, value_parser = parse_u32)]
    bl_size: Option<u32>,
    #[arg(long, value_parser = parse_u32)]
    app_size: Option<u32>,
    #[arg(long, value_enum)]
    hash_type: Option<HashTypeArg>,
    /// Mark the image as a debug build
    #[arg(long)]
    debug: bool,
    #[command(flatten)]
    signature: SignatureArgs,
    /// Write the packet here instead of printing it
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct SignatureArgs {
    #[arg(long, value_enum)]
    signature_type: Option<SignatureTypeArg>,
    /// Signature bytes as hex
    #[arg(long)]
    signature: Option<String>,
}

impl SignatureArgs {
    fn resolve(&self) -> Result<(Option<SignatureType>, Option<Vec<u8>>)> {
        let signature = self
            .signature
            .as_deref()
            .map(hex::decode)
            .transpose()
            .context("signature is not valid hex")?;
        Ok((self.signature_type.map(Into::into), signature))
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FwTypeArg {
    Application,
    Softdevice,
    Bootloader,
    SoftdeviceBootloader,
}

impl From<FwTypeArg> for FwType {
    fn from(arg: FwTypeArg) -> Self {
        match arg {
            FwTypeArg::Application => FwType::Application,
            FwTypeArg::Softdevice => FwType::Softdevice,
            FwTypeArg::Bootloader => FwType::Bootloader,
            FwTypeArg::SoftdeviceBootloader => FwType::SoftdeviceBootloader,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum HashTypeArg {
    NoHash,
    Crc,
    Sha256,
    Sha512,
}

impl From<HashTypeArg> for HashType {
    fn from(arg: HashTypeArg) -> Self {
        match arg {
            HashTypeArg::NoHash => HashType::NoHash,
            HashTypeArg::Crc => HashType::Crc,
            HashTypeArg::Sha256 => HashType::Sha256,
            HashTypeArg::Sha512 => HashType::Sha512,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SignatureTypeArg {
    EcdsaP256Sha256,
    Ed25519,
}

impl From<SignatureTypeArg> for SignatureType {
    fn from(arg: SignatureTypeArg) -> Self {
        match arg {
            SignatureTypeArg::EcdsaP256Sha256 => SignatureType::EcdsaP256Sha256,
            SignatureTypeArg::Ed25519 => SignatureType::Ed25519,
        }
    }
}

/// Decimal or `0x`-prefixed hex.
fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn emit_packet(bytes: &[u8], output: Option<&PathBuf>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), bytes = bytes.len(), "Packet written");
        }
        None => println!("{}", hex::encode(bytes)),
    }
    Ok(())
}

fn init_packet(args: &InitArgs, config: &SessionConfig) -> Result<Vec<u8>> {
    let fw_type = FwType::from(args.fw_type);
    let hash_type = args.hash_type.map_or(config.hash_type, Into::into);
    let (signature_type, signature) = args.signature.resolve()?;

    let mut params = InitPacketParams {
        fw_version: args.fw_version.or(config.fw_version),
        hw_version: args.hw_version.or(config.hw_version),
        sd_req: Some(if args.sd_req.is_empty() {
            config.sd_req.clone()
        } else {
            args.sd_req.clone()
        }),
        fw_type: Some(fw_type),
        sd_size: args.sd_size,
        bl_size: args.bl_size,
        app_size: args.app_size,
        hash_type: Some(hash_type),
        hash: None,
        is_debug: Some(args.debug || config.debug),
        signature_type,
        signature,
    };

    if let Some(path) = &args.image {
        let image = FirmwareImage::load(path, fw_type)?;
        let payload = image.payload();
        let len = payload.len() as u32;
        match fw_type {
            FwType::Application => params.app_size = params.app_size.or(Some(len)),
            FwType::Softdevice => params.sd_size = params.sd_size.or(Some(len)),
            FwType::Bootloader => params.bl_size = params.bl_size.or(Some(len)),
            FwType::SoftdeviceBootloader => {
                if params.sd_size.is_none() || params.bl_size.is_none() {
                    bail!("--sd-size and --bl-size are required for combined images");
                }
            }
        }
        // Sizes not covered by the image are zero.
        params.sd_size = params.sd_size.or(Some(0));
        params.bl_size = params.bl_size.or(Some(0));
        params.app_size = params.app_size.or(Some(0));
        params.hash = Some(image_digest(hash_type, &payload)?);
    }

    Ok(encode_init_packet(params)?)
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SessionConfig::default(),
    };

    match args.command {
        Command::Devices => {
            let devices = list_bootloaders()?;
            if devices.is_empty() {
                info!("No bootloader devices found");
            }
            for device in devices {
                println!(
                    "{:04x}:{:04x}  {}  {}",
                    device.vendor_id, device.product_id, device.serial_number, device.product
                );
            }
        }
        Command::InitPacket(init) => {
            let bytes = init_packet(&init, &config)?;
            emit_packet(&bytes, init.output.as_ref())?;
        }
        Command::ResetPacket {
            timeout,
            signature,
            output,
        } => {
            let (signature_type, signature) = signature.resolve()?;
            let bytes = encode_reset_packet(
                Some(timeout.unwrap_or(config.reset_timeout)),
                signature_type,
                signature,
            )?;
            emit_packet(&bytes, output.as_ref())?;
        }
        Command::Lookup { hardware_id } => {
            let registry = DeviceRegistry::builtin();
            match registry.lookup(&hardware_id) {
                Some(def) => {
                    println!("{} ({}, {})", def.device_type, def.family, def.name);
                    println!("  ROM:  {:#X} bytes at {:#X}", def.rom_size, def.rom_base_addr);
                    println!("  RAM:  {:#X} bytes", def.ram_size);
                    println!("  Page: {:#X} bytes", def.page_size);
                }
                None => bail!("no device definition matches '{hardware_id}'"),
            }
        }
        Command::Config { path } => {
            SessionConfig::default().save_to_file(&path)?;
            info!(path = %path.display(), "Default configuration written");
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
