use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use uebot_bridge::device::{DeviceLink, DeviceRunner, SampleSource, WavSource};
use uebot_bridge::gateway::GatewayClient;
use uebot_bridge::health::HealthMonitor;
use uebot_bridge::relay::{DeviceRouter, GatewayPipeline, Relay};
use uebot_bridge::server::Server;
use uebot_bridge::transport::WsConnector;
use uebot_bridge::vad::VoiceActivityController;
use uebot_bridge::Config;

/// UE-Bot bridge - voice module relay for an AI gateway
#[derive(Parser)]
#[command(name = "uebot-bridge", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "UEBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Upstream gateway WebSocket URL
        #[arg(long)]
        gateway_url: Option<String>,
    },
    /// Act as a voice module against a running relay
    Device {
        /// Relay WebSocket URL
        #[arg(long)]
        url: Option<String>,
        /// Device id to register as
        #[arg(long)]
        device_id: Option<String>,
        /// Stream audio from a 16-bit PCM WAV file
        #[arg(long, conflicts_with = "mic")]
        wav: Option<PathBuf>,
        /// Stream audio from the default input device
        #[arg(long)]
        mic: bool,
        /// Start capture on loud audio instead of waiting for a trigger
        #[arg(long)]
        energy_trigger: bool,
        /// Press Enter on stdin to trigger capture
        #[arg(long)]
        stdin_button: bool,
        /// Directory to write received playback into
        #[arg(long)]
        save_playback: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,uebot_bridge=info",
        1 => "info,uebot_bridge=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            host,
            port,
            gateway_url,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(url) = gateway_url {
                config.gateway.url = url;
            }
            serve(config).await
        }
        Command::Device {
            url,
            device_id,
            wav,
            mic,
            energy_trigger,
            stdin_button,
            save_playback,
        } => {
            if let Some(url) = url {
                config.device.relay_url = url;
            }
            if let Some(id) = device_id {
                config.device.link.device_id = id;
            }
            if energy_trigger {
                config.device.vad.energy_trigger = true;
            }
            let options = DeviceOptions {
                stdin_button,
                save_playback,
            };
            match (wav, mic) {
                (Some(path), _) => {
                    let source = WavSource::open(&path, config.device.frame_samples)?.realtime();
                    run_device(config, source, options).await
                }
                (None, true) => run_mic(config, options).await,
                (None, false) => anyhow::bail!("device mode needs --wav <file> or --mic"),
            }
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        listen = %config.listen_addr(),
        gateway = %config.gateway.url,
        "starting uebot bridge"
    );
    tracing::debug!(?config, "loaded configuration");

    let gateway = GatewayClient::new(
        config.gateway.clone(),
        Arc::new(WsConnector::new(config.gateway.url.clone())),
    );
    if let Err(e) = gateway.connect().await {
        tracing::warn!(error = %e, "gateway not reachable yet, retrying in background");
    }

    let router = DeviceRouter::new();
    let pipeline = GatewayPipeline::new(
        gateway.clone(),
        router.clone(),
        config.gateway.request_timeout,
        config.relay.max_utterance_bytes,
    );
    let relay = Relay::new(config.relay.clone(), router.clone(), Arc::new(pipeline));

    let monitor = HealthMonitor::new(
        config.health.clone(),
        Arc::new(gateway.clone()),
        Arc::new(router),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health_task = tokio::spawn(
        monitor
            .clone()
            .run(Some(gateway.subscribe()), shutdown_rx.clone()),
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c");
        }
        shutdown_tx.send_replace(true);
    });

    let result = Server::new(config.server.clone(), relay, monitor)
        .run(shutdown_rx)
        .await;

    gateway.close();
    let _ = health_task.await;
    result?;
    Ok(())
}

struct DeviceOptions {
    stdin_button: bool,
    save_playback: Option<PathBuf>,
}

#[cfg(feature = "mic")]
async fn run_mic(config: Config, options: DeviceOptions) -> anyhow::Result<()> {
    let source = uebot_bridge::device::MicSource::open(
        config.device.format.sample_rate,
        config.device.frame_samples,
    )?;
    run_device(config, source, options).await
}

#[cfg(not(feature = "mic"))]
async fn run_mic(_config: Config, _options: DeviceOptions) -> anyhow::Result<()> {
    anyhow::bail!("built without microphone support; rebuild with --features mic")
}

async fn run_device<S: SampleSource>(
    config: Config,
    source: S,
    options: DeviceOptions,
) -> anyhow::Result<()> {
    tracing::info!(
        relay = %config.device.relay_url,
        device_id = %config.device.link.device_id,
        "starting voice module"
    );

    let connector = Arc::new(WsConnector::new(config.device.relay_url.clone()));
    let (link, events) = DeviceLink::new(config.device.link.clone(), connector);
    if let Err(e) = link.connect().await {
        tracing::warn!(error = %e, "relay not reachable yet, retrying in background");
    }

    let vad = VoiceActivityController::new(config.device.vad.clone());
    let mut runner =
        DeviceRunner::new(link, events, vad, source).status_interval(config.device.status_interval);

    if let Some(dir) = options.save_playback {
        std::fs::create_dir_all(&dir)?;
        runner = runner.save_playback(dir);
    }
    if options.stdin_button {
        runner = runner.buttons(stdin_buttons());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c");
        }
        shutdown_tx.send_replace(true);
    });

    let summary = runner.run(shutdown_rx).await?;
    tracing::info!(
        utterances = summary.utterances,
        dropped = summary.dropped,
        playbacks = summary.playbacks,
        commands = summary.commands.len(),
        "voice module stopped"
    );
    Ok(())
}

/// One press per line on stdin
fn stdin_buttons() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}
