// ABOUTME: Entry point for the logspool binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and runs one queue command against a store on disk.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use logspool_core::{AppProperty, CommonSchemaEnvelope, JsonLogSerializer, LogRecord, PlainLogFactory};
use logspool_store::{Persistence, StoreConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "logspool", about = "Inspect and exercise a durable telemetry log queue")]
struct Cli {
    /// Data directory (overrides LOGSPOOL_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue one log in a group
    Append {
        group: String,
        /// Log type tag
        log_type: String,
        /// Property as key=value; may be repeated
        #[arg(long = "prop", value_parser = parse_property)]
        props: Vec<(String, String)>,
        /// Target token; makes the log a common schema log
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        app_name: Option<String>,
        #[arg(long)]
        app_version: Option<String>,
        #[arg(long)]
        app_locale: Option<String>,
    },
    /// Print the oldest logs of a group as JSON lines
    Drain {
        group: String,
        #[arg(long, default_value_t = 50)]
        max: usize,
        /// Delete the drained logs afterwards
        #[arg(long)]
        ack: bool,
    },
    /// Print the number of logs stored for a group
    Count { group: String },
    /// List every group with its log count
    Status,
    /// Delete every log of a group
    Purge { group: String },
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty property key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn build_record(
    log_type: String,
    props: Vec<(String, String)>,
    token: Option<String>,
    app: [(AppProperty, Option<String>); 3],
) -> LogRecord {
    let mut record = match token {
        Some(token) => {
            let mut envelope = CommonSchemaEnvelope::new(log_type);
            for (property, value) in app {
                envelope.set(property, value);
            }
            LogRecord::common_schema(envelope, token)
        }
        None => LogRecord::new(log_type),
    };
    for (key, value) in props {
        record = record.with_property(key, value);
    }
    record
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("logspool=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = StoreConfig::from_env().context("invalid LOGSPOOL_* configuration")?;
    if let Some(home) = cli.home {
        config.home = home;
    }

    let serializer = JsonLogSerializer::with_common_schema().with_fallback(PlainLogFactory);
    let persistence = Persistence::open(config, Arc::new(serializer))
        .context("failed to open log store")?;

    match cli.command {
        Command::Append {
            group,
            log_type,
            props,
            token,
            app_name,
            app_version,
            app_locale,
        } => {
            let record = build_record(
                log_type,
                props,
                token,
                [
                    (AppProperty::Name, app_name),
                    (AppProperty::Version, app_version),
                    (AppProperty::Locale, app_locale),
                ],
            );
            let id = persistence.append(&group, &record)?;
            println!("{id}");
        }
        Command::Drain { group, max, ack } => {
            if let Some(batch) = persistence.drain(&group, max)? {
                for log in &batch.logs {
                    println!("{}", serde_json::to_string(log)?);
                }
                if ack {
                    persistence.acknowledge(&group, &batch.id)?;
                }
                tracing::info!(group = %group, batch = %batch.id, count = batch.logs.len(), ack, "drained");
            }
        }
        Command::Count { group } => {
            println!("{}", persistence.count(&group)?);
        }
        Command::Status => {
            for group in persistence.groups()? {
                println!("{}\t{}", group, persistence.count(&group)?);
            }
        }
        Command::Purge { group } => {
            persistence.delete_group(&group)?;
        }
    }

    persistence.close()?;
    Ok(())
}
