#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Control surface for the mail relay
//!
//! Every subcommand is a thin mapping onto the shared store (or the
//! maintenance client): the relay process itself only ever reads the
//! store, so flags flipped here take effect on live sessions without
//! any signalling.

use clap::{Parser, Subcommand, ValueEnum};
use mail_relay::{RelayConfig, Store, keys};
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay-cli")]
#[command(about = "Bandwidth-optimizing IMAP/SMTP relay for metered links")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start both protocol listeners and relay until stopped
    Run,

    /// Print the status report
    Stats {
        /// Include the remote quota snapshot
        #[arg(long)]
        remote: bool,
    },

    /// Switch optimize mode
    Mode {
        #[arg(value_enum)]
        state: ModeArg,
    },

    /// Toggle inclusion of raw traffic in the logs
    Savelog {
        #[arg(value_enum)]
        state: SwitchArg,
    },

    /// Zero the traffic and message counters
    Reset,

    /// Ask a running relay to stop accepting connections
    Stop,

    /// Inspect or extend the ignored-header list
    Headers {
        #[command(subcommand)]
        command: HeadersCommand,
    },

    /// Delete every message in the remote INBOX
    EmptyInbox,

    /// Refresh the remote quota snapshot
    Quota,
}

#[derive(Subcommand)]
enum HeadersCommand {
    /// Print the ignored-header list
    Get,
    /// Append a header name to the ignored list
    Add { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    On,
    Off,
    Toggle,
}

#[derive(Clone, Copy, ValueEnum)]
enum SwitchArg {
    On,
    Off,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let json = args.json;
    let config = RelayConfig::from_env()?;
    let store = Store::open(config.store_path.clone())?;

    match args.command {
        Command::Run => {
            store.set_stop(false);
            mail_relay::start(&config, Arc::new(store)).await?;
        }
        Command::Stats { remote } => {
            cmd_stats(&store, json, remote)?;
        }
        Command::Mode { state } => {
            let on = match state {
                ModeArg::On => true,
                ModeArg::Off => false,
                ModeArg::Toggle => !store.optimize(),
            };
            store.set_optimize(on);
            println!("Mode: {}", mode_name(on));
        }
        Command::Savelog { state } => {
            store.set_savelog(matches!(state, SwitchArg::On));
        }
        Command::Reset => {
            store.reset();
        }
        Command::Stop => {
            store.set_stop(true);
            mail_relay::nudge(config.imap_port).await;
            mail_relay::nudge(config.smtp_port).await;
            println!("Stop requested");
        }
        Command::Headers { command } => match command {
            HeadersCommand::Get => println!("{}", store.ignored_headers()),
            HeadersCommand::Add { name } => {
                let name = name.to_uppercase();
                let list = store.ignored_headers();
                if list.split_whitespace().any(|h| h == name) {
                    println!("{list}");
                } else {
                    let list = format!("{list} {name}");
                    store.set_ignored_headers(&list);
                    println!("{list}");
                    println!("(takes effect on relay restart)");
                }
            }
        },
        Command::EmptyInbox => {
            let removed = mail_relay::empty_inbox(&config, &store).await?;
            println!("Removed {removed} message(s)");
        }
        Command::Quota => {
            let (msgs, bytes) = mail_relay::refresh_quota(&config, &store).await?;
            println!("Server: {} msgs, {} Bytes used", group(msgs), group(bytes));
        }
    }

    Ok(())
}

/// Status report snapshot for the `stats` subcommand.
#[derive(Serialize)]
struct StatusReport {
    mode: &'static str,
    stopped: bool,
    savelog: bool,
    imap_bytes: u64,
    smtp_bytes: u64,
    received_msgs: u64,
    sent_msgs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_msgs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_bytes_used: Option<u64>,
}

fn cmd_stats(store: &Store, json: bool, remote: bool) -> anyhow::Result<()> {
    let (server_msgs, server_bytes_used) = if remote {
        let (msgs, bytes) = store.serverstats();
        (Some(msgs), Some(bytes))
    } else {
        (None, None)
    };
    let report = StatusReport {
        mode: mode_name(store.optimize()),
        stopped: store.stop(),
        savelog: store.savelog(),
        imap_bytes: store.counter(keys::IMAP_BYTES),
        smtp_bytes: store.counter(keys::SMTP_BYTES),
        received_msgs: store.counter(keys::IMAP_MSGS),
        sent_msgs: store.counter(keys::SMTP_MSGS),
        server_msgs,
        server_bytes_used,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("State: {}", if report.stopped { "stopped" } else { "running" });
    println!("Mode: {}", report.mode);
    println!("IMAP: {} Bytes", group(report.imap_bytes));
    println!("SMTP: {} Bytes", group(report.smtp_bytes));
    println!("Received: {} msgs", group(report.received_msgs));
    println!("Sent: {} msgs", group(report.sent_msgs));
    if let (Some(msgs), Some(bytes)) = (report.server_msgs, report.server_bytes_used) {
        println!("Server: {} msgs, {} Bytes used", group(msgs), group(bytes));
    }
    Ok(())
}

const fn mode_name(optimize: bool) -> &'static str {
    if optimize { "Lite" } else { "Normal" }
}

/// Group digits in threes: 1234567 -> "1,234,567".
fn group(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
