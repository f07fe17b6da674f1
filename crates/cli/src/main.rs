use anyhow::Context;
use clap::{Parser, Subcommand};
use hublink::config::{self, ConnectionSetting};
use hublink::{Connector, DispatchQueue, RpcTarget};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Foreground loop period, one drain per frame at 60 Hz.
const FRAME: Duration = Duration::from_micros(16_667);

#[derive(Parser)]
#[command(name = "hublink")]
#[command(about = "Hublink CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Connect, ping the server and print each round-trip time.
    Ping {
        /// Config file path (default: HUBLINK_CONFIG_PATH or ~/.hublink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Server url (default: HUBLINK_URL or connection.url from config)
        #[arg(long, short)]
        url: Option<String>,

        /// Stop after this many samples (default: run until Ctrl+C).
        #[arg(long, short = 'n')]
        count: Option<usize>,
    },

    /// Send one SERVICE call, or an RPC when --target is given, then disconnect.
    Send {
        /// Config file path (default: HUBLINK_CONFIG_PATH or ~/.hublink/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Server url (default: HUBLINK_URL or connection.url from config)
        #[arg(long, short)]
        url: Option<String>,

        /// Hub id.
        #[arg(long)]
        hub: u8,

        /// Terminal id (only on the wire with multiTerminal).
        #[arg(long, default_value_t = 0)]
        terminal: u8,

        /// Method id.
        #[arg(long)]
        method: i16,

        /// Relay target: all, others or caller.
        #[arg(long)]
        target: Option<RpcTarget>,

        /// Payload as JSON; sent as MessagePack. Omit for a nil payload.
        #[arg(long, value_name = "PAYLOAD")]
        json: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("hublink {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Ping { config, url, count }) => {
            if let Err(e) = run_ping(config, url, count).await {
                log::error!("ping failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Send {
            config,
            url,
            hub,
            terminal,
            method,
            target,
            json,
        }) => {
            let call = Call {
                hub,
                terminal,
                method,
                target,
                json,
            };
            if let Err(e) = run_send(config, url, call).await {
                log::error!("send failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn load_setting(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<ConnectionSetting> {
    let (config, path) = config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    let mut setting = config.connection;
    if let Some(url) = url {
        setting.url = url;
    }
    if config::resolve_url(&setting).is_none() {
        anyhow::bail!("no server url; pass --url, set HUBLINK_URL or connection.url in {}", path.display());
    }
    Ok(setting)
}

async fn run_ping(
    config_path: Option<PathBuf>,
    url: Option<String>,
    count: Option<usize>,
) -> anyhow::Result<()> {
    let mut setting = load_setting(config_path, url)?;
    setting.allow_ping_server = true;

    let queue = Arc::new(DispatchQueue::new());
    let connector = Arc::new(Connector::new(queue.clone()));
    connector
        .connect(&setting)
        .await
        .context("connecting to the hub server")?;
    println!("connected, pinging every {:?}", setting.ping_interval());

    let mut rtt = connector.rtt_watch();
    let mut frames = tokio::time::interval(FRAME);
    let mut samples = 0usize;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = frames.tick() => {
                if queue.has_pending_work() {
                    queue.drain_and_run();
                }
                if !connector.is_connected() {
                    anyhow::bail!("connection lost");
                }
                if rtt.has_changed().unwrap_or(false) {
                    if let Some(sample) = *rtt.borrow_and_update() {
                        samples += 1;
                        println!("rtt {:.1} ms", sample.as_secs_f64() * 1000.0);
                    }
                }
                if count.is_some_and(|n| samples >= n) {
                    break;
                }
            }
        }
    }

    connector.disconnect().await;
    Ok(())
}

struct Call {
    hub: u8,
    terminal: u8,
    method: i16,
    target: Option<RpcTarget>,
    json: Option<String>,
}

async fn run_send(config_path: Option<PathBuf>, url: Option<String>, call: Call) -> anyhow::Result<()> {
    let mut setting = load_setting(config_path, url)?;
    setting.allow_ping_server = false;

    let payload = match &call.json {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).context("parsing --json payload")?;
            Some(hublink::transport::payload::encode(&value)?)
        }
        None => None,
    };

    let connector = Arc::new(Connector::new(Arc::new(DispatchQueue::new())));
    connector
        .connect(&setting)
        .await
        .context("connecting to the hub server")?;

    let sent = match call.target {
        Some(target) => {
            connector
                .send_rpc(call.hub, call.terminal, call.method, target, payload)
                .await
        }
        None => {
            connector
                .send_service(call.hub, call.terminal, call.method, payload)
                .await
        }
    };
    connector.disconnect().await;

    if !sent {
        anyhow::bail!("server connection dropped the call");
    }
    println!("sent method {} to hub {}/{}", call.method, call.hub, call.terminal);
    Ok(())
}
