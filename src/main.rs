//! `envelope-crypto` command line
//!
//! KEKs come from the environment (optionally via a `.env` file):
//!   ENVELOPE_KEKS=kek-v1:<base64>,kek-v2:<base64>
//!   ENVELOPE_ACTIVE_KEK=kek-v2
//!
//! Usage:
//!   envelope-crypto generate-key                 - print a fresh base64 256-bit key
//!   envelope-crypto encode [-i FILE] [-o FILE]   - seal a stream into a container
//!   envelope-crypto decode [-i FILE] [-o FILE]   - open a container

use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use envelope_crypto::{KeyRegistry, KeyRegistryConfig, SecureKey, StreamingCodec};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "envelope-crypto", version, about = "Envelope encryption for streams")]
struct Cli {
    /// Log to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a random base64 key suitable for ENVELOPE_KEKS
    GenerateKey,
    /// Encrypt into a streaming container
    Encode(IoArgs),
    /// Decrypt a streaming container
    Decode(IoArgs),
}

#[derive(clap::Args)]
struct IoArgs {
    /// Input file (stdin if omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output file (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    if cli.verbose {
        init_logging();
    }

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "envelope_crypto=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::GenerateKey => {
            println!("{}", STANDARD.encode(SecureKey::generate().as_bytes()));
            Ok(())
        }
        Command::Encode(args) => {
            let codec = codec()?;
            let input = reader(&args)?;
            let result = match &args.output {
                Some(dst) => codec.encode_to_path(input, dst),
                None => codec.encode(input, stdout()),
            };
            result.map(drop).context("encode failed")
        }
        Command::Decode(args) => {
            let codec = codec()?;
            let input = reader(&args)?;
            // Output files are removed by the codec when the tag does not verify
            let result = match &args.output {
                Some(dst) => codec.decode_to_path(input, dst),
                None => codec.decode(input, stdout()),
            };
            result
                .map(drop)
                .map_err(|e| anyhow::anyhow!(e.public_message()))
                .context("decode failed")
        }
    }
}

fn codec() -> anyhow::Result<StreamingCodec> {
    let config = KeyRegistryConfig::from_env()?;
    let registry = KeyRegistry::load(&config).context("cannot start without a usable key registry")?;
    Ok(StreamingCodec::new(Arc::new(registry)))
}

fn reader(args: &IoArgs) -> anyhow::Result<Box<dyn io::Read>> {
    Ok(match &args.input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    })
}

fn stdout() -> BufWriter<io::StdoutLock<'static>> {
    BufWriter::new(io::stdout().lock())
}
