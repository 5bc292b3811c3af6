//! personactl - manage a persona identity and sign requests from the shell.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use persona::prelude::*;
use persona_cli::commands;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Manage a persona identity and sign requests
#[derive(Parser, Debug)]
#[command(name = "personactl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to ~/.persona/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for identity state, overriding the configuration
    #[arg(long, env = "PERSONA_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or load the identity and report what startup did
    Init,
    /// Show the master fingerprint and personas
    Show,
    /// Replace the seed phrase and re-derive every persona
    Reseed {
        /// New seed phrase
        #[arg(required_unless_present = "generate")]
        phrase: Option<String>,
        /// Generate a fresh 24-word phrase instead
        #[arg(long, conflicts_with = "phrase")]
        generate: bool,
    },
    /// Sign a payload as the active persona and print the headers
    Sign {
        /// Payload text
        #[arg(required_unless_present = "file")]
        payload: Option<String>,
        /// Read the payload from a file
        #[arg(long, conflicts_with = "payload")]
        file: Option<PathBuf>,
    },
    /// Verify a signed envelope against a body
    Verify {
        /// persona-pkh header
        #[arg(long)]
        pkh: String,
        /// x-sent-at header
        #[arg(long)]
        sent_at: String,
        /// x-nonce header
        #[arg(long)]
        nonce: String,
        /// x-pubkey header
        #[arg(long)]
        pubkey: String,
        /// x-sig header
        #[arg(long)]
        sig: String,
        /// Request body
        #[arg(default_value = "")]
        body: String,
    },
    /// Send a signed GraphQL request to the backend
    Request {
        /// GraphQL query
        #[arg(short, long)]
        query: String,
        /// Variables as a JSON object
        #[arg(long, default_value = "{}")]
        variables: String,
        /// Backend endpoint, overriding the configuration
        #[arg(long)]
        endpoint: Option<String>,
    },
}

fn init_tracing(verbose: u8) {
    // RUST_LOG wins over -v.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("persona=warn,personactl=info"),
        1 => EnvFilter::new("persona=info,personactl=info"),
        _ => EnvFilter::new("persona=debug,personactl=debug"),
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();
}

fn print(value: &Value) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}

async fn open_session(config: IdentityConfig) -> anyhow::Result<IdentitySession> {
    let dir = config.storage_dir();
    debug!(dir = %dir.display(), "opening identity state");
    let storage = Arc::new(FileStore::new(dir));
    IdentitySession::start(storage, config)
        .await
        .context("failed to start identity session")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = load_config(args.config.as_deref()).await?;
    if let Some(dir) = args.data_dir {
        config.storage_dir = Some(dir);
    }

    match args.command {
        Command::Verify {
            pkh,
            sent_at,
            nonce,
            pubkey,
            sig,
            body,
        } => {
            let headers = AuthHeaders {
                pkh,
                sent_at,
                nonce,
                pubkey,
                sig,
            };
            let mode = config.verifier.payload_mode;
            print(&commands::verify(&headers, body.as_bytes(), mode)?)?;
        }
        Command::Init => {
            let session = open_session(config).await?;
            print(&commands::describe_report(session.startup_report()))?;
        }
        Command::Show => {
            let session = open_session(config).await?;
            print(&commands::show(&session).await)?;
        }
        Command::Reseed { phrase, generate } => {
            let session = open_session(config).await?;
            let phrase = if generate { None } else { phrase.as_deref() };
            print(&commands::reseed(&session, phrase).await?)?;
        }
        Command::Sign { payload, file } => {
            let payload = match (payload, file) {
                (_, Some(path)) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (Some(text), None) => text.into_bytes(),
                (None, None) => anyhow::bail!("no payload given"),
            };
            let session = open_session(config).await?;
            print(&commands::sign(&session, &payload).await?)?;
        }
        Command::Request {
            query,
            variables,
            endpoint,
        } => {
            let variables: Value =
                serde_json::from_str(&variables).context("--variables is not valid JSON")?;
            if let Some(endpoint) = endpoint {
                config.client.endpoint = endpoint;
            }
            let session = open_session(config).await?;
            let client = session.client().await?;
            print(&commands::request(&client, &query, variables).await?)?;
        }
    }

    Ok(())
}
