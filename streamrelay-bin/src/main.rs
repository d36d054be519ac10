use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use streamrelay_core::{
    Relay, StreamSession, UpstreamRequest,
    config::RelayConfig,
    sse_response_headers,
    telemetry::{SessionLog, TelemetrySink},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "stream relay CLI smoke tool", long_about = None)]
struct Cli {
    /// Relay config file (JSON or TOML); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay one streaming request and print the SSE frames as they arrive
    Relay {
        #[arg(long)]
        url: String,
        #[arg(short, long, help = "JSON request body", default_value = "{}")]
        body: String,
        #[arg(short = 'H', long = "header", help = "Extra header as `Name: value`")]
        headers: Vec<String>,
        #[arg(long)]
        session_id: Option<String>,
        /// Print the downstream response headers before the frames
        #[arg(long)]
        show_headers: bool,
    },
    /// Print the effective configuration
    Config,
}

/// Logs each finished session as one structured line.
struct LogSink;

impl TelemetrySink for LogSink {
    fn record_session(&self, log: SessionLog) {
        tracing::info!(
            session.id = %log.session_id,
            outcome = log.outcome.as_str(),
            attempts = log.attempts,
            retries = log.retry_count,
            chunks = log.chunk_count,
            events = log.events_emitted,
            latency_ms = log.latency_ms,
            error = log.error_message.as_deref(),
            "session summary"
        );
    }
}

fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("header {raw:?} is not `Name: value`");
    };
    Ok((name.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => RelayConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RelayConfig::default(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        Commands::Relay {
            url,
            body,
            headers,
            session_id,
            show_headers,
        } => {
            let body: serde_json::Value =
                serde_json::from_str(&body).context("request body is not valid JSON")?;
            let mut request = UpstreamRequest::new(url, body);
            for raw in &headers {
                let (name, value) = parse_header(raw)?;
                request = request.header(name, value);
            }

            let relay = Relay::from_config(cfg)?.with_telemetry(Arc::new(LogSink));
            let session = StreamSession::new(session_id, request);
            let cancel = session.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let mut stdout = io::stdout();
            if show_headers {
                for (name, value) in sse_response_headers().iter() {
                    writeln!(stdout, "{}: {}", name, value.to_str().unwrap_or_default())?;
                }
                writeln!(stdout)?;
            }

            let mut events = relay.stream(session);
            while let Some(ev) = events.next().await {
                write!(stdout, "{}", ev.to_sse())?;
                stdout.flush()?;
            }
        }
    }

    Ok(())
}
