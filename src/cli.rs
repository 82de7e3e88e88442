//! Operator command line.
//!
//! Clap types and their dispatch. Commands read the data directory through
//! the same config layer as the library, so `MODREG_*` overrides apply.

use crate::core::audit::{AuditEvent, AuditResult, AuditTrail};
use crate::core::canonical::{self, Operation};
use crate::core::config::RegistryConfig;
use crate::core::counters::CounterName;
use crate::core::error::RegistryError;
use crate::core::gateway;
use crate::core::persist::Persistence;
use crate::core::signing;
use crate::core::time;
use crate::store;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "modreg",
    version = env!("CARGO_PKG_VERSION"),
    about = "Signed model artifact registry: key tooling, request signing and state inspection."
)]
pub(crate) struct Cli {
    /// Data directory (overridden by MODREG_DATA_DIR).
    #[clap(long, global = true, default_value = "data")]
    pub data_dir: PathBuf,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Generate an ed25519 key pair
    Keygen,
    /// Print the canonical payload and signature for a request body
    SignPayload(SignPayloadCli),
    /// Print the sha256 hex digest of a file
    Digest {
        file: PathBuf,
    },
    /// Inspect the audit trail
    Audit(AuditCli),
    /// Show operational counters for the last 24h
    Counters,
    /// Show the anti-rollback state of a `tenant:model` scope
    State {
        #[clap(long)]
        scope: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum OpArg {
    ArtifactRegister,
    DeliveryApply,
    DeliveryRollback,
}

impl From<OpArg> for Operation {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::ArtifactRegister => Operation::ArtifactRegister,
            OpArg::DeliveryApply => Operation::DeliveryApply,
            OpArg::DeliveryRollback => Operation::DeliveryRollback,
        }
    }
}

#[derive(clap::Args, Debug)]
pub(crate) struct SignPayloadCli {
    #[clap(long, value_enum)]
    pub op: OpArg,
    #[clap(long)]
    pub tenant: String,
    #[clap(long)]
    pub key_id: String,
    /// Base64 private key seed.
    #[clap(long)]
    pub private_key: String,
    /// Request body as JSON, or `@path` to read it from a file.
    #[clap(long)]
    pub body: String,
    /// Signing timestamp; defaults to now.
    #[clap(long)]
    pub ts_ms: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct AuditCli {
    #[clap(subcommand)]
    pub command: AuditCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum AuditCommand {
    /// Show one day's audit records
    Show {
        /// UTC day, `YYYY-MM-DD`; defaults to today.
        #[clap(long)]
        day: Option<String>,
        /// Read the rotated generation instead of the active file.
        #[clap(long)]
        rotated: bool,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
}

pub fn run() -> Result<(), RegistryError> {
    let cli = Cli::parse();
    let config = RegistryConfig::load(&cli.data_dir)?;

    match cli.command {
        Command::Keygen => {
            let kp = signing::generate_keypair();
            print_json(&json!({
                "key_id": time::new_id("key"),
                "sig_alg": signing::SIG_ALG_ED25519,
                "public_key": kp.public_key,
                "private_key": kp.private_key,
            }))
        }
        Command::SignPayload(args) => sign_payload(args),
        Command::Digest { file } => {
            let bytes = fs::read(&file)?;
            println!("{}", sha256_hex(&bytes));
            Ok(())
        }
        Command::Audit(audit) => match audit.command {
            AuditCommand::Show {
                day,
                rotated,
                format,
            } => {
                let trail = AuditTrail::from_config(Persistence::from_config(&config)?, &config);
                let day = day.unwrap_or_else(|| time::day_key(time::now_ms()));
                let events = if rotated {
                    trail.read_rotated(&day)?
                } else {
                    trail.read_day(&day)?
                };
                if format == "json" {
                    print_json(&events)
                } else {
                    for e in &events {
                        println!("{}", format_event(e));
                    }
                    Ok(())
                }
            }
        },
        Command::Counters => {
            let persist = Persistence::from_config(&config)?;
            let counts = persist.counters().counts_24h(time::now_ms());
            let doc: serde_json::Map<String, Value> = CounterName::ALL
                .iter()
                .map(|name| {
                    let key = serde_json::to_value(name)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_else(|| format!("{:?}", name));
                    (key, json!(counts.get(name).copied().unwrap_or(0)))
                })
                .collect();
            print_json(&doc)
        }
        Command::State { scope } => {
            let store = store::open_store(&config)?;
            match store.get_update_state(&scope)? {
                Some(state) => print_json(&state),
                None => print_json(&json!({ "scope_key": scope, "max_seen_version": 0 })),
            }
        }
    }
}

fn sign_payload(args: SignPayloadCli) -> Result<(), RegistryError> {
    let raw = match args.body.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)?,
        None => args.body,
    };
    let body: Value = serde_json::from_str(&raw)?;
    let op = Operation::from(args.op);
    let ts_ms = args.ts_ms.unwrap_or_else(time::now_ms);
    let sig = gateway::sign_request(op, &args.tenant, ts_ms, &body, &args.key_id, &args.private_key)?;
    let canonical = canonical::canonical_string(op, &args.tenant, ts_ms, &body)?;
    print_json(&json!({
        "canonical": canonical,
        "signature": sig.signature,
        "sig_alg": sig.sig_alg,
        "key_id": sig.key_id,
        "ts_ms": sig.ts_ms,
    }))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn format_event(e: &AuditEvent) -> String {
    let result = match e.result {
        AuditResult::Allow => "ALLOW".green().bold(),
        AuditResult::Deny => "DENY".red().bold(),
    };
    let action = serde_json::to_value(e.action)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    format!(
        "{} {:<8} {:<5} {} key={} sha256={}",
        e.ts_ms,
        action,
        result,
        e.reason_code.map(|r| r.as_str()).unwrap_or("-"),
        e.key_id.as_deref().unwrap_or("-"),
        e.sha256.as_deref().unwrap_or("-"),
    )
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), RegistryError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
