//! `quorumctl`: a thin CLI for talking to a running quorumdb node's HTTP
//! surface. Not part of the core protocol — test/ops tooling only.
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value as JsonValue;

#[derive(Parser)]
#[command(name = "quorumctl", about = "Talk to a running quorumdb node")]
struct Cli {
    /// Base URL of the node's HTTP API, e.g. http://127.0.0.1:8080
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch the values currently stored at bucket/key.
    Get { bucket: String, key: String },
    /// Store a JSON value at bucket/key.
    Put { bucket: String, key: String, value: String },
    /// Delete the value at bucket/key.
    Delete { bucket: String, key: String },
}

#[tokio::main]
async fn main() {
    quorumdb::init_logging();
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let result = match cli.command {
        Command::Get { bucket, key } => run_get(&client, &cli.endpoint, &bucket, &key).await,
        Command::Put { bucket, key, value } => run_put(&client, &cli.endpoint, &bucket, &key, &value).await,
        Command::Delete { bucket, key } => run_delete(&client, &cli.endpoint, &bucket, &key).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run_get(client: &reqwest::Client, endpoint: &str, bucket: &str, key: &str) -> Result<(), String> {
    let url = format!("{endpoint}/db/{bucket}/{key}");
    let resp = client.get(&url).send().await.map_err(|e| e.to_string())?;
    let body: JsonValue = resp.json().await.map_err(|e| e.to_string())?;
    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    Ok(())
}

async fn run_put(
    client: &reqwest::Client,
    endpoint: &str,
    bucket: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    let parsed: JsonValue = serde_json::from_str(value).map_err(|e| format!("invalid JSON value: {e}"))?;
    let url = format!("{endpoint}/db/{bucket}/{key}");
    let body = serde_json::json!({ "value": parsed, "context": {} });
    let resp = client.put(&url).json(&body).send().await.map_err(|e| e.to_string())?;
    if resp.status().is_success() {
        println!("{}", "ok".green());
        Ok(())
    } else {
        Err(resp.text().await.unwrap_or_default())
    }
}

async fn run_delete(client: &reqwest::Client, endpoint: &str, bucket: &str, key: &str) -> Result<(), String> {
    let url = format!("{endpoint}/db/{bucket}/{key}");
    let resp = client.delete(&url).send().await.map_err(|e| e.to_string())?;
    if resp.status().is_success() {
        println!("{}", "ok".green());
        Ok(())
    } else {
        Err(resp.text().await.unwrap_or_default())
    }
}
