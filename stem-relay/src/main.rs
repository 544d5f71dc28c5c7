use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stem_relay::config::AppConfig;
use stem_relay::logging::init_logging;
use stem_relay::pipeline::{Pipeline, Stage, Topic};
use stem_relay::status::FileStatus;

#[derive(Parser, Debug)]
#[command(author, version, about = "Operator tools for the stem-relay pipeline", long_about = None)]
struct Args {
    /// Redis URL; overrides REDIS_URL/REDIS_HOST/REDIS_PORT
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the status record of a file
    Status { filename: String },

    /// List files in a status
    List {
        #[arg(value_parser = parse_status)]
        status: FileStatus,
    },

    /// List files stuck in a status for longer than a threshold
    Stale {
        #[arg(value_parser = parse_status)]
        status: FileStatus,
        /// Minimum age in minutes
        #[arg(long, default_value_t = 60)]
        minutes: u64,
    },

    /// Put a failed file back to queued and reset its retry counters
    Clear { filename: String },

    /// Publish a file to the first stage
    Enqueue { filename: String },

    /// Show unacknowledged messages of a stage's consumer group
    Pending {
        stage: Stage,
        /// Consumer group; defaults to the stage name
        #[arg(long)]
        group: Option<String>,
        #[arg(long, default_value_t = 20)]
        count: usize,
    },

    /// Send a test notification on every configured channel
    NotifyTest {
        #[arg(long, default_value = "stem-relay test notification")]
        subject: String,
        #[arg(long, default_value = "Notification channels are working.")]
        body: String,
    },
}

fn parse_status(raw: &str) -> Result<FileStatus, String> {
    match raw.parse::<FileStatus>() {
        Ok(FileStatus::Unknown) | Err(_) => {
            Err("expected one of: queued, processing, done, error".to_string())
        }
        Ok(status) => Ok(status),
    }
}

fn stale_threshold(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_env().context("Failed to load configuration")?;
    if let Some(url) = args.redis_url {
        config.redis.url = url;
    }
    init_logging(&config.log)?;

    let pipeline = Pipeline::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.redis.url))?;

    match args.command {
        Command::Status { filename } => {
            let report = pipeline.status().get_status(&filename).await;
            if args.json {
                match pipeline.status().get_record(&filename).await {
                    Some(record) => print_json(&record)?,
                    None => print_json(&report)?,
                }
            } else {
                println!("{}: {}", report.filename, report.status);
                if !report.last_error.is_empty() {
                    println!("\n{}", report.last_error);
                }
            }
        }
        Command::List { status } => {
            let files = pipeline.status().list_by_status(status).await;
            if args.json {
                print_json(&files)?;
            } else {
                for file in &files {
                    println!("{file}");
                }
                eprintln!("{} file(s) {}", files.len(), status);
            }
        }
        Command::Stale { status, minutes } => {
            let records = pipeline
                .status()
                .stale(status, stale_threshold(minutes))
                .await;
            if args.json {
                print_json(&records)?;
            } else {
                for record in &records {
                    let since = record
                        .updated_at
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_default();
                    println!("{}\t{}", record.filename, since);
                }
            }
        }
        Command::Clear { filename } => {
            pipeline.status().clear_error(&filename).await;
            println!("{filename}: cleared");
        }
        Command::Enqueue { filename } => {
            if !pipeline.ensure_groups().await {
                anyhow::bail!("Failed to create consumer groups");
            }
            let id = pipeline
                .enqueue(&filename)
                .await
                .with_context(|| format!("Failed to enqueue {filename}"))?;
            println!("{filename}: queued as {id}");
        }
        Command::Pending {
            stage,
            group,
            count,
        } => {
            let topic: Topic = stage.input_topic();
            let group = group.unwrap_or_else(|| stage.to_string());
            let pending = pipeline.bus().pending(topic, &group, count).await;
            if args.json {
                print_json(&pending)?;
            } else {
                for entry in &pending {
                    println!(
                        "{}\t{}\tidle {:?}\tdeliveries {}",
                        entry.id, entry.consumer, entry.idle, entry.deliveries
                    );
                }
                eprintln!("{} pending on {} ({})", pending.len(), topic, group);
            }
        }
        Command::NotifyTest { subject, body } => {
            let report = pipeline.notifier().notify_all(&subject, &body).await;
            if args.json {
                print_json(&report)?;
            } else {
                println!("delivered: {:?}", report.delivered);
                println!("skipped:   {:?}", report.skipped);
                println!("failed:    {:?}", report.failed);
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} channel(s) failed", report.failed.len());
            }
        }
    }

    Ok(())
}
