//! licensegate: offline inspection of license-server responses
//!
//! Usage:
//!   licensegate verify --public-key server.pem response.json
//!   licensegate canonicalize response.json
//!   licensegate hash <hardware-id-or-domain>
//!
//! Nothing here talks to the network.

use anyhow::Result;
use clap::{Parser, Subcommand};
use licensegate_cli::{binding_hash, canonicalize, load_verifier, read_json, verify_response, KindArg};
use licensegate_license::SystemClock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "licensegate")]
#[command(about = "Inspect and verify licensegate server responses")]
struct Args {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a signed response and print the resolved state
    Verify {
        /// PEM public key of the license server
        #[arg(long)]
        public_key: PathBuf,

        /// Endpoint the response came from
        #[arg(long, value_enum, default_value_t = KindArg::Validation)]
        kind: KindArg,

        /// Response JSON file
        response: PathBuf,
    },
    /// Print the canonical form of a JSON file
    Canonicalize {
        file: PathBuf,
    },
    /// Print the context-binding hash of a hardware id or domain
    Hash {
        identity: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Verify {
            public_key,
            kind,
            response,
        } => {
            let verifier = load_verifier(&public_key)?;
            let body = read_json(&response)?;
            let state = verify_response(verifier, kind.into(), &body, Arc::new(SystemClock))?;
            info!(state = %state.state(), "signature verified");
            println!("{}", serde_json::to_string_pretty(&state.to_record())?);
        }
        Command::Canonicalize { file } => {
            println!("{}", canonicalize(&read_json(&file)?));
        }
        Command::Hash { identity } => {
            println!("{}", binding_hash(&identity)?);
        }
    }
    Ok(())
}
