use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use bridge_backends::{LaunchEngine, RegistryClient};
use bridge_core::{BridgeConfig, BridgeContext, DispatchLoop, PipelineManager, ShutdownToken};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod signals;

const CONFIG_DIR: &str = "btaudio-bridge";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Routes Bluetooth audio PCMs into the desktop audio server"
)]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Unix socket of the PCM registry service.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Program used to run pipeline descriptions.
    #[arg(long)]
    launch_program: Option<String>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("btaudio-bridge: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let fallback = if cli.verbose {
        "debug"
    } else {
        config.log_filter.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .try_init()
        .ok();

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &BridgeConfig) -> Result<()> {
    let shutdown = ShutdownToken::with_wake_pipe().context("failed to create the wake pipe")?;
    signals::install(&shutdown).context("failed to install signal handlers")?;

    let registry = RegistryClient::connect(&config.socket_path)
        .with_context(|| format!("failed to connect to {}", config.socket_path.display()))?;
    registry
        .subscribe()
        .context("failed to subscribe to PCM notifications")?;
    let notifications = registry.notifications();

    let engine = LaunchEngine::new(config.launch_program.clone());
    let mut ctx = BridgeContext::new(
        PipelineManager::new(registry, engine, config.topology()),
        shutdown,
    );
    let seeded = ctx.seed();
    info!(
        socket = %config.socket_path.display(),
        program = %config.launch_program,
        seeded,
        "bridge running"
    );

    DispatchLoop::new(notifications, config.max_poll_descriptors)
        .run(&mut ctx)
        .context("notification loop failed")?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match config_path(cli.config.as_deref(), dirs::config_dir()) {
        Some(path) => BridgeConfig::load(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(socket) = &cli.socket {
        config = config.with_socket_path(socket);
    }
    if let Some(program) = &cli.launch_program {
        config = config.with_launch_program(program);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// An explicit path wins; otherwise the per-user file is used if it exists.
fn config_path(explicit: Option<&Path>, config_dir: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    config_dir
        .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
        .filter(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("btaudio-bridge").chain(args.iter().copied()))
    }

    #[test]
    fn user_config_is_used_only_when_present() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(config_path(None, Some(dir.path().to_path_buf())), None);

        let file = dir.path().join(CONFIG_DIR).join(CONFIG_FILE);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "{}").unwrap();
        assert_eq!(
            config_path(None, Some(dir.path().to_path_buf())),
            Some(file.clone())
        );

        let explicit = dir.path().join("other.json");
        assert_eq!(
            config_path(Some(&explicit), Some(dir.path().to_path_buf())),
            Some(explicit)
        );
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bridge.json");
        fs::write(&file, r#"{ "socket_path": "/tmp/file.sock", "output_rate": 44100 }"#).unwrap();
        let file_arg = file.to_string_lossy().into_owned();

        let config = load_config(&cli(&[
            "--config",
            &file_arg,
            "--socket",
            "/tmp/flag.sock",
            "--launch-program",
            "/opt/gst/bin/gst-launch-1.0",
        ]))
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/flag.sock"));
        assert_eq!(config.launch_program, "/opt/gst/bin/gst-launch-1.0");
        assert_eq!(config.output_rate, 44_100);
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let missing_arg = missing.to_string_lossy().into_owned();
        assert!(load_config(&cli(&["--config", &missing_arg])).is_err());
    }

    #[test]
    fn empty_program_flag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bridge.json");
        fs::write(&file, "{}").unwrap();
        let file_arg = file.to_string_lossy().into_owned();
        assert!(load_config(&cli(&["--config", &file_arg, "--launch-program", " "])).is_err());
    }
}
