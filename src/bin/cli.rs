//! CLI client for a relaykv node

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use relaykv::common::encode_key;
use relaykv::replication::{NodeStatus, OffsetInfo};
use relaykv::server::WriteAck;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "relaykv")]
#[command(about = "relaykv key-value store CLI")]
#[command(version)]
struct Cli {
    /// Node URL (writes must target the master)
    #[arg(long, default_value = "http://127.0.0.1:6380")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a key
    Get { key: String },

    /// Write a key
    Set {
        key: String,
        value: String,

        /// Expire after this many milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,

        /// Only write if the key does not exist
        #[arg(long)]
        nx: bool,

        /// Keep the key's current expiry
        #[arg(long)]
        keep_ttl: bool,
    },

    /// Delete a key
    Del { key: String },

    /// Add a number to a key
    Incr {
        key: String,

        #[arg(long, default_value = "1")]
        by: String,
    },

    /// List keys under a prefix
    Keys {
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Node status
    Status,

    /// Applied replication offset
    Offset,
}

async fn check(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    bail!("{}: {}", status, body)
}

fn print_ack(ack: &WriteAck) {
    match (&ack.value, ack.applied) {
        (Some(value), _) => println!("{}", value),
        (None, true) => println!("OK ({})", ack.offset),
        (None, false) => println!("QUEUED ({})", ack.offset),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let base = cli.node.trim_end_matches('/').to_string();
    let http = reqwest::Client::new();

    match cli.command {
        Commands::Get { key } => {
            let resp = http
                .get(format!("{}/kv/{}", base, encode_key(&key)))
                .send()
                .await
                .context("request failed")?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                println!("(nil)");
                return Ok(());
            }
            let body = check(resp).await?.bytes().await?;
            println!("{}", String::from_utf8_lossy(&body));
        }

        Commands::Set {
            key,
            value,
            ttl_ms,
            nx,
            keep_ttl,
        } => {
            let mut query = vec![
                ("nx", nx.to_string()),
                ("keepttl", keep_ttl.to_string()),
            ];
            if let Some(ms) = ttl_ms {
                query.push(("ttl_ms", ms.to_string()));
            }
            let resp = http
                .put(format!("{}/kv/{}", base, encode_key(&key)))
                .query(&query)
                .body(value)
                .send()
                .await
                .context("request failed")?;
            print_ack(&check(resp).await?.json().await?);
        }

        Commands::Del { key } => {
            let resp = http
                .delete(format!("{}/kv/{}", base, encode_key(&key)))
                .send()
                .await
                .context("request failed")?;
            print_ack(&check(resp).await?.json().await?);
        }

        Commands::Incr { key, by } => {
            let resp = http
                .post(format!("{}/incr/{}", base, encode_key(&key)))
                .query(&[("by", by)])
                .send()
                .await
                .context("request failed")?;
            print_ack(&check(resp).await?.json().await?);
        }

        Commands::Keys { prefix } => {
            let resp = http
                .get(format!("{}/keys", base))
                .query(&[("prefix", prefix)])
                .send()
                .await
                .context("request failed")?;
            let body: Value = check(resp).await?.json().await?;
            if let Some(keys) = body["keys"].as_array() {
                for key in keys {
                    println!("{}", key.as_str().unwrap_or_default());
                }
            }
        }

        Commands::Status => {
            let resp = http
                .get(format!("{}/status", base))
                .send()
                .await
                .context("request failed")?;
            let status: NodeStatus = check(resp).await?.json().await?;
            println!("Node: {} ({})", status.node_id, status.role);
            println!("  Engine: {}", status.engine);
            println!("  Offset: {}", status.offset);
            println!("  Bootstrapped: {}", status.bootstrapped);
            if let Some(wal) = &status.wal {
                println!(
                    "  WAL: {} .. {} ({})",
                    wal.first_offset.map(|o| o.to_string()).unwrap_or_default(),
                    wal.last_offset.map(|o| o.to_string()).unwrap_or_default(),
                    relaykv::common::format_bytes(wal.size_bytes)
                );
            }
            for replica in &status.replicas {
                println!(
                    "  Replica {}: offset={} last_seen={}ms live={}",
                    replica.replica_id, replica.offset, replica.last_seen_ms, replica.live
                );
            }
        }

        Commands::Offset => {
            let resp = http
                .get(format!("{}/replication/offset", base))
                .send()
                .await
                .context("request failed")?;
            let info: OffsetInfo = check(resp).await?.json().await?;
            println!("{}", info.offset);
        }
    }

    Ok(())
}
