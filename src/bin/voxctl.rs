//! voxctl - command-line client for the voxd daemon.

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;
use voxd::defaults;
use voxd::ipc::client::DaemonClient;
use voxd::ipc::protocol::MessageType;

/// Control and observe a running voxd daemon
#[derive(Parser, Debug)]
#[command(name = "voxctl", version, about = "Client for the voxd daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Unix socket path
    #[arg(short, long, value_name = "PATH", default_value = defaults::SOCKET_PATH)]
    socket: PathBuf,

    /// Output raw JSON instead of formatted text
    #[arg(short, long)]
    json: bool,

    /// Prefix streamed events with a timestamp
    #[arg(short, long)]
    timestamp: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream transcriptions as they happen (default)
    Stream,
    /// Show daemon status
    Status,
    /// Pause listening
    Pause,
    /// Resume listening
    Resume,
    /// Set the recognition language
    SetLanguage {
        /// Language code, e.g. en, de, auto
        language: String,
    },
    /// Print the daemon's configuration
    GetConfig,
    /// Print performance metrics
    GetMetrics,
}

fn main() {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("voxctl: {}", e);
            std::process::exit(1);
        }
    };
    std::process::exit(match runtime.block_on(run(cli)) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("voxctl: {}", e);
            1
        }
    });
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut client = DaemonClient::connect(&cli.socket).await?;

    match cli.command.unwrap_or(Commands::Stream) {
        Commands::Stream => stream(&mut client, cli.json, cli.timestamp).await,
        Commands::Status => {
            let status = client.command("get_status", json!({})).await?;
            if cli.json {
                println!("{}", status);
            } else {
                print_status(&status);
            }
            Ok(())
        }
        Commands::Pause => {
            client.command("pause", json!({})).await?;
            println!("Paused.");
            Ok(())
        }
        Commands::Resume => {
            client.command("resume", json!({})).await?;
            println!("Listening.");
            Ok(())
        }
        Commands::SetLanguage { language } => {
            let reply = client
                .command("set_language", json!({ "language": language }))
                .await?;
            println!(
                "Language set to {}",
                reply["language"].as_str().unwrap_or(&language)
            );
            Ok(())
        }
        Commands::GetConfig => {
            let config = client.command("get_config", json!({})).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::GetMetrics => {
            let metrics = client.command("get_metrics", json!({})).await?;
            if cli.json {
                println!("{}", metrics);
            } else {
                print_metrics(&metrics);
            }
            Ok(())
        }
    }
}

/// Subscribe and print events until the connection drops or Ctrl+C.
async fn stream(client: &mut DaemonClient, as_json: bool, with_timestamp: bool) -> anyhow::Result<()> {
    client.subscribe().await?;
    eprintln!("voxctl: streaming transcriptions (Ctrl+C to stop)");

    loop {
        let event = tokio::select! {
            event = client.next_event() => event?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };

        let prefix = if with_timestamp {
            format!("[{}] ", humantime::format_rfc3339_seconds(std::time::SystemTime::now()))
        } else {
            String::new()
        };

        match event.message_type() {
            Ok(MessageType::Transcription) => {
                if as_json {
                    println!("{}{}", prefix, event.data);
                } else if let Some(text) = event.data["text"].as_str() {
                    println!("{}{}", prefix, text);
                }
            }
            Ok(MessageType::Status) => {
                if as_json {
                    println!("{}{}", prefix, event.data);
                }
                // Formatted mode keeps the stream clean of status noise.
            }
            Ok(MessageType::Error) => {
                eprintln!(
                    "voxctl: daemon error: {}",
                    event.data["message"].as_str().unwrap_or("unknown")
                );
            }
            _ => {}
        }
    }
}

fn print_status(status: &Value) {
    let listening = status["listening"].as_bool().unwrap_or(false);
    println!(
        "State:    {}",
        if listening { "listening" } else { "paused" }
    );
    println!("Model:    {}", status["model"].as_str().unwrap_or("?"));
    println!("Language: {}", status["language"].as_str().unwrap_or("?"));
    println!("Clients:  {}", status["clients"].as_u64().unwrap_or(0));
}

fn print_metrics(metrics: &Value) {
    println!(
        "Avg latency:    {:.1} ms",
        metrics["avg_latency_ms"].as_f64().unwrap_or(0.0)
    );
    println!(
        "Avg RTF:        {:.3}",
        metrics["avg_rtf"].as_f64().unwrap_or(0.0)
    );
    println!(
        "CPU usage:      {:.1}%",
        metrics["cpu_usage"].as_f64().unwrap_or(0.0)
    );
    println!(
        "Memory:         {} MB",
        metrics["memory_usage_mb"].as_u64().unwrap_or(0)
    );
    println!(
        "Transcriptions: {}",
        metrics["transcriptions_count"].as_u64().unwrap_or(0)
    );
}
