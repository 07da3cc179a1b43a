use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use tether_engine::{EngineConfig, Orchestrator, ProcessAgentBackend, ShellLauncher};
use tether_server::ServerConfig;
use tether_store::{SessionStore, StoreConfig};
use tether_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Json,
    Pretty,
}

/// Relay between a mobile client and a local coding agent.
#[derive(Debug, Parser)]
#[command(name = "tether", version)]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 9091)]
    port: u16,

    /// Session state file. Defaults to ~/.tether/sessions.json.
    #[arg(long)]
    state_file: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: Level,

    #[arg(long, value_enum, default_value = "json")]
    log_format: FormatArg,

    /// Program speaking the stream-JSON agent protocol, with arguments.
    #[arg(long, default_value = "claude-agent")]
    agent_command: String,

    #[arg(long, default_value = tether_engine::orchestrator::DEFAULT_MODEL)]
    default_model: String,

    #[arg(long, default_value_t = 7 * 24 * 3600)]
    session_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        format: match cli.log_format {
            FormatArg::Json => LogFormat::Json,
            FormatArg::Pretty => LogFormat::Pretty,
        },
        ..Default::default()
    });

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting tether");

    let state_file = cli
        .state_file
        .unwrap_or_else(|| home_dir().join(".tether").join("sessions.json"));
    let store_config = StoreConfig {
        ttl: Duration::from_secs(cli.session_ttl_secs),
        ..StoreConfig::new(&state_file)
    };
    let store = Arc::new(SessionStore::open(store_config).context("opening session store")?);
    let _background = store.spawn_background();
    tracing::info!(path = %state_file.display(), sessions = store.len(), "session store ready");

    let backend = ProcessAgentBackend::from_command_line(&cli.agent_command)
        .context("parsing --agent-command")?;
    let engine = EngineConfig {
        default_model: cli.default_model,
        ..Default::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        engine,
        Arc::clone(&store),
        Arc::new(backend),
        Arc::new(ShellLauncher),
    ));

    let reaper_shutdown = CancellationToken::new();
    let reaper = orchestrator.start_reaper(reaper_shutdown.clone());

    let server_config = ServerConfig {
        host: cli.host,
        port: cli.port,
        ..Default::default()
    };
    let server = tether_server::start(server_config, Arc::clone(&orchestrator))
        .await
        .context("starting server")?;
    tracing::info!(port = server.port, "tether ready");

    wait_for_signal().await?;
    tracing::info!("shutting down");

    let aborted = orchestrator.abort_all();
    if aborted > 0 {
        tracing::info!(aborted, "aborted running operations");
    }
    server.shutdown().await;
    reaper_shutdown.cancel();
    let _ = reaper.await;

    match store.shutdown() {
        Ok(true) => tracing::info!("session state flushed"),
        Ok(false) => {}
        Err(e) => tracing::error!(error = %e, "final session flush failed"),
    }
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("listening for ctrl+c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["tether"]);
        assert_eq!(cli.port, 9091);
        assert_eq!(cli.log_level, Level::INFO);
        assert_eq!(cli.session_ttl_secs, 604_800);
        assert!(cli.state_file.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "tether",
            "--port",
            "8080",
            "--log-format",
            "pretty",
            "--log-level",
            "debug",
            "--agent-command",
            "agent --stream-json",
            "--state-file",
            "/var/lib/tether/state.json",
        ]);
        assert_eq!(cli.port, 8080);
        assert!(matches!(cli.log_format, FormatArg::Pretty));
        assert_eq!(cli.log_level, Level::DEBUG);
        assert_eq!(cli.agent_command, "agent --stream-json");
        assert_eq!(cli.state_file, Some(PathBuf::from("/var/lib/tether/state.json")));
    }
}
