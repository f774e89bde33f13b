//! NanoClaw process entry point: load configuration, wire every configured
//! channel/backend into an [`Orchestrator`], and run until shutdown.
//!
//! Grounded on `main.rs`'s top-level wiring and on `daemon.rs`'s
//! foreground-tracing setup (`init_foreground_tracing`, minus the OTLP
//! exporter this crate's ambient stack doesn't carry). There is no
//! daemonize/stop/status subcommand surface — a user-facing product CLI is
//! explicitly out of scope (see `SPEC_FULL.md` §1); `--debug` is the one
//! flag this binary exposes.

use clap::Parser;
use nanoclaw::backend::registry::BackendRegistry;
use nanoclaw::backend::hetzner::{HetznerProvisioner, RailwayProvisioner};
use nanoclaw::backend::local::LocalContainerBackend;
use nanoclaw::backend::sandbox::SandboxBackend;
use nanoclaw::backend::vm::EphemeralVmBackend;
use nanoclaw::channel::discord::DiscordChannel;
use nanoclaw::channel::signal::SignalChannel;
use nanoclaw::channel::slack::SlackChannel;
use nanoclaw::channel::telegram::TelegramChannel;
use nanoclaw::channel::whatsapp::WhatsAppChannel;
use nanoclaw::channel::{Channel, ChannelOpts, OnChatMetadata, OnMessage, OnRecovery};
use nanoclaw::config::Config;
use nanoclaw::orchestrator::Orchestrator;
use nanoclaw::store::sqlite::SqliteStore;
use nanoclaw::store::{GroupStore, MessageStore, ScheduledTaskStore};

use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nanoclaw", version)]
#[command(about = "Message-driven agent orchestrator")]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let field_formatter = format::debug_fn(|writer, field, value| {
        if field.name() == "message" {
            write!(writer, "message={value:?}")
        } else {
            write!(writer, "{}={value:?}", field.name())
        }
    });
    let filter = EnvFilter::new(if debug { "debug" } else { "info" });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .fmt_fields(field_formatter)
        .compact()
        .init();
}

/// A [`ChannelOpts`] whose callbacks forward to an [`Orchestrator`] that
/// doesn't exist yet: channel adapters must be constructed (and their
/// `connect()` fired) before `Orchestrator::new` can take ownership of
/// them, so callbacks are built against a cell the orchestrator fills in
/// once it's ready. Any message/metadata/recovery signal that arrives in
/// that narrow startup window is dropped — acceptable since nothing is
/// registered to receive it yet anyway.
fn deferred_opts(cell: Arc<OnceCell<Arc<Orchestrator>>>) -> ChannelOpts {
    let on_message: OnMessage = {
        let cell = cell.clone();
        Arc::new(move |inbound| {
            let cell = cell.clone();
            Box::pin(async move {
                if let Some(orchestrator) = cell.get() {
                    (orchestrator.on_message())(inbound).await;
                }
            })
        })
    };
    let on_chat_metadata: OnChatMetadata = {
        let cell = cell.clone();
        Arc::new(move |jid, seen_at, name, scheme, is_group| {
            if let Some(orchestrator) = cell.get() {
                (orchestrator.on_chat_metadata())(jid, seen_at, name, scheme, is_group);
            }
        })
    };
    let on_recovery: OnRecovery = {
        let cell = cell.clone();
        Arc::new(move |channel_name| {
            let cell = cell.clone();
            Box::pin(async move {
                if let Some(orchestrator) = cell.get() {
                    (orchestrator.on_recovery())(channel_name).await;
                }
            })
        })
    };
    ChannelOpts {
        on_message,
        on_chat_metadata,
        on_recovery,
    }
}

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    init_tracing(cli.debug);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;
    std::fs::create_dir_all(config.groups_root())?;
    std::fs::create_dir_all(config.ipc_root())?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("sqlite://{}?mode=rwc", config.sqlite_path().display()))
        .await?;
    let sqlite_store = SqliteStore::new(pool);
    sqlite_store.initialize().await?;
    let group_store: Arc<dyn GroupStore> = Arc::new(sqlite_store.clone());
    let message_store: Arc<dyn MessageStore> = Arc::new(sqlite_store.clone());
    let scheduled_store: Arc<dyn ScheduledTaskStore> = Arc::new(sqlite_store);

    let runtime_config = nanoclaw::config::shared(config.runtime);

    let mut backends = BackendRegistry::new();
    let local_image = std::env::var("NANOCLAW_BACKEND_IMAGE").unwrap_or_else(|_| "nanoclaw-agent:latest".to_string());
    match LocalContainerBackend::new(
        "local",
        local_image,
        config.groups_root(),
        config.ipc_root(),
        runtime_config.clone(),
    ) {
        Ok(backend) => backends.register(Arc::new(backend)),
        Err(error) => warn!(%error, "local container backend unavailable, continuing without it"),
    }
    if let (Ok(base_url), Ok(api_key)) = (std::env::var("SANDBOX_BASE_URL"), std::env::var("SANDBOX_API_KEY")) {
        backends.register(Arc::new(SandboxBackend::new(
            "sandbox",
            base_url,
            api_key,
            config.groups_root(),
            runtime_config.clone(),
        )));
    }
    // B2_* credentials map onto the AWS SDK's own env-var convention so
    // `EphemeralVmBackend::new`'s `aws_config::load_defaults` picks them up
    // without this crate hand-rolling an S3 client config.
    if let Ok(key_id) = std::env::var("B2_KEY_ID") {
        // SAFETY: single-threaded at this point in startup, before any
        // channel/backend task has been spawned.
        unsafe { std::env::set_var("AWS_ACCESS_KEY_ID", key_id) };
    }
    if let Ok(app_key) = std::env::var("B2_APPLICATION_KEY") {
        unsafe { std::env::set_var("AWS_SECRET_ACCESS_KEY", app_key) };
    }
    if let Ok(endpoint) = std::env::var("B2_ENDPOINT") {
        unsafe { std::env::set_var("AWS_ENDPOINT_URL", endpoint) };
    }
    if let Ok(bucket) = std::env::var("B2_BUCKET") {
        let provisioner: Option<Arc<dyn nanoclaw::backend::vm::VmProvisioner>> =
            if let Ok(token) = std::env::var("HETZNER_API_TOKEN") {
                let server_type = std::env::var("HETZNER_SERVER_TYPE").unwrap_or_else(|_| "cx22".to_string());
                let image = std::env::var("HETZNER_IMAGE").unwrap_or_else(|_| "docker-ce".to_string());
                let location = std::env::var("HETZNER_LOCATION").ok();
                let ssh_keys = std::env::var("HETZNER_SSH_KEYS")
                    .map(|raw| raw.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
                let user_data = std::env::var("HETZNER_USER_DATA").ok();
                Some(Arc::new(HetznerProvisioner::new(token, server_type, image, location, ssh_keys, user_data)))
            } else if let (Ok(token), Ok(project_id), Ok(environment_id)) = (
                std::env::var("RAILWAY_API_TOKEN"),
                std::env::var("RAILWAY_PROJECT_ID"),
                std::env::var("RAILWAY_ENVIRONMENT_ID"),
            ) {
                let image = std::env::var("RAILWAY_IMAGE").unwrap_or_else(|_| "nanoclaw-agent:latest".to_string());
                Some(Arc::new(RailwayProvisioner::new(token, project_id, environment_id, image)))
            } else {
                None
            };
        match provisioner {
            Some(provisioner) => {
                let vm_backend = EphemeralVmBackend::new("vm", bucket, provisioner, runtime_config.clone()).await;
                backends.register(Arc::new(vm_backend));
            }
            None => warn!("B2_BUCKET set but no HETZNER_API_TOKEN/RAILWAY_API_TOKEN configured, skipping vm backend"),
        }
    }

    let backends = Arc::new(backends);

    let (shutdown_tx, shutdown_rx_main) = watch::channel(false);
    SHUTDOWN_RX
        .set(shutdown_rx_main.clone())
        .expect("shutdown receiver set exactly once before any channel spawn");

    let orchestrator_cell: Arc<OnceCell<Arc<Orchestrator>>> = Arc::new(OnceCell::new());
    let opts = deferred_opts(orchestrator_cell.clone());

    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
    if let Ok(token) = std::env::var("DISCORD_BOT_TOKEN") {
        let discord = Arc::new(DiscordChannel::new(token, opts.clone()));
        discord.spawn_watchdog(shutdown_rx());
        channels.push(discord);
    }
    if let (Ok(bot_token), Ok(app_token)) = (std::env::var("SLACK_BOT_TOKEN"), std::env::var("SLACK_APP_TOKEN")) {
        match SlackChannel::new(bot_token, app_token, opts.clone()) {
            Ok(slack) => {
                let slack = Arc::new(slack);
                slack.spawn_watchdog(shutdown_rx());
                channels.push(slack);
            }
            Err(error) => error!(%error, "failed to construct slack channel"),
        }
    }
    if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
        let telegram = Arc::new(TelegramChannel::new(token, opts.clone()));
        telegram.spawn_watchdog(shutdown_rx());
        channels.push(telegram);
    }
    if let Ok(bridge_url) = std::env::var("WHATSAPP_BRIDGE_URL") {
        let whatsapp = Arc::new(WhatsAppChannel::new(bridge_url, opts.clone()));
        whatsapp.spawn_poll_loop(shutdown_rx());
        channels.push(whatsapp);
    }
    if let (Ok(daemon_url), Ok(account)) = (std::env::var("SIGNAL_DAEMON_URL"), std::env::var("SIGNAL_ACCOUNT")) {
        let signal = Arc::new(SignalChannel::new(daemon_url, account, opts));
        signal.spawn_receive_loop(shutdown_rx());
        channels.push(signal);
    }

    if channels.is_empty() {
        warn!("no channel adapters configured; set e.g. DISCORD_BOT_TOKEN to enable one");
    }

    let orchestrator = Orchestrator::new(
        channels,
        backends,
        group_store,
        message_store,
        scheduled_store,
        runtime_config,
        config.ipc_root(),
    );
    orchestrator_cell
        .set(orchestrator.clone())
        .map_err(|_| anyhow::anyhow!("orchestrator cell already set"))?;

    let api_state = Arc::new(nanoclaw::api::ApiState {
        orchestrator: orchestrator.clone(),
        started_at: std::time::Instant::now(),
    });
    let api_bind: std::net::SocketAddr = std::env::var("NANOCLAW_API_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse()?;
    let api_handle = nanoclaw::api::start(api_bind, api_state, shutdown_rx_main.clone()).await?;

    #[cfg(feature = "metrics")]
    let metrics_handle = {
        let bind: std::net::SocketAddr = std::env::var("NANOCLAW_METRICS_BIND")
            .unwrap_or_else(|_| "127.0.0.1:9090".to_string())
            .parse()?;
        nanoclaw::telemetry::start_metrics_server(bind, shutdown_rx_main.clone()).await?
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    orchestrator.run(shutdown_rx_main).await?;
    let _ = api_handle.await;
    #[cfg(feature = "metrics")]
    let _ = metrics_handle.await;

    Ok(())
}

/// The shutdown channel is created before any channel adapter is
/// constructed, so every watchdog/poll loop picks up the real receiver
/// here rather than a second constructor parameter threaded through every
/// adapter. The `unwrap_or_else` fallback only matters if this function is
/// ever called before the cell is set, which `main` no longer does.
static SHUTDOWN_RX: OnceCell<watch::Receiver<bool>> = OnceCell::const_new();

fn shutdown_rx() -> watch::Receiver<bool> {
    SHUTDOWN_RX
        .get()
        .cloned()
        .unwrap_or_else(|| watch::channel(false).1)
}
