use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use codepush_client::{
    CodeDispatcher, ConnectionConfig, ConnectionManager, DeliveryPresenter, FileStateStore,
    IdentityStore, KeepAliveScheduler, PageAgent, StateStore, SystemClipboard,
    agent::DEFAULT_OVERLAY_TIMEOUT,
    connection::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_RETRY_DELAY},
    desktop::{DesktopHost, HeadlessPage},
    heartbeat::DEFAULT_HEARTBEAT_INTERVAL,
    keepalive::DEFAULT_KEEPALIVE_PERIOD,
    logging::init_logging,
    store::default_state_dir,
};
use codepush_core::{Document, ResolverConfig, TargetResolver};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "codepush-client", version)]
struct ClientArgs {
    /// Directory holding `state.json`.
    #[arg(long, global = true, env = "CODEPUSH_STATE_DIR")]
    state_dir: Option<PathBuf>,
    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the push channel alive and deliver incoming codes.
    Run(RunArgs),
    /// Store server address and token; clears a manual disconnect.
    Configure {
        #[arg(long)]
        server: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        username: Option<String>,
    },
    /// Allow the channel to connect again.
    ///
    /// Only the stored intent is written. A running `run` process picks it up
    /// on its next keep-alive tick (`--keepalive-secs`, 10 s by default).
    Connect,
    /// Close the channel and keep it closed until `connect`.
    ///
    /// Only the stored intent is written. A running `run` process closes its
    /// channel on its next keep-alive tick (`--keepalive-secs`, 10 s by default).
    Disconnect,
    /// Show identity, intent and addresses.
    Status,
    /// Report which element of a DOM snapshot a code would be filled into.
    Resolve {
        #[arg(long)]
        snapshot: PathBuf,
        /// Extra placeholder hint; may be repeated.
        #[arg(long = "hint")]
        hints: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY.as_secs())]
    retry_secs: u64,
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_secs())]
    heartbeat_secs: u64,
    /// Keep-alive period; also bounds how long `connect`/`disconnect` from
    /// another process take to apply.
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_PERIOD.as_secs())]
    keepalive_secs: u64,
    /// DOM snapshot standing in for the active page.
    #[arg(long)]
    page_snapshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_deref());

    let state_dir = args.state_dir.unwrap_or_else(default_state_dir);
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::in_dir(&state_dir));

    let result = match args.command {
        Command::Run(run_args) => run(store, run_args).await,
        Command::Configure {
            server,
            token,
            username,
        } => configure(store.as_ref(), &server, &token, username.as_deref()),
        Command::Connect => set_manual_off(store.as_ref(), false),
        Command::Disconnect => set_manual_off(store.as_ref(), true),
        Command::Status => status(store),
        Command::Resolve { snapshot, hints } => resolve(&snapshot, hints),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Upper bound on waiting for the manager to close its channel at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

async fn run(store: Arc<dyn StateStore>, args: RunArgs) -> Result<(), String> {
    let identities = IdentityStore::new(Arc::clone(&store));
    let identity = tokio::task::spawn_blocking(move || identities.load_or_create())
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())?;
    info!(client_id = %identity.id, "client starting");

    let config = ConnectionConfig {
        retry_delay: Duration::from_secs(args.retry_secs),
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
        connect_timeout: DEFAULT_CONNECT_TIMEOUT,
    };

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (manager, manager_task) =
        ConnectionManager::spawn(store, identity.id.clone(), config, inbound_tx);

    let (page_tx, page_rx) = mpsc::unbounded_channel();
    let agent = PageAgent::new(
        HeadlessPage::new(args.page_snapshot),
        TargetResolver::default(),
        DeliveryPresenter::new(SystemClipboard, DEFAULT_OVERLAY_TIMEOUT),
    );
    tokio::spawn(agent.run(page_rx));
    tokio::spawn(CodeDispatcher::new(DesktopHost::new(page_tx)).run(inbound_rx));

    let mut status = manager.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(status = %current, "push channel status");
        }
    });

    let keepalive = KeepAliveScheduler::start(
        manager.clone(),
        Duration::from_secs(args.keepalive_secs.max(1)),
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", err);
    }
    info!("client shutting down");

    // The manager closes its channel once the last handle is gone.
    drop(keepalive);
    drop(manager);
    if tokio::time::timeout(SHUTDOWN_GRACE, manager_task)
        .await
        .is_err()
    {
        warn!("connection manager did not stop within {:?}", SHUTDOWN_GRACE);
    }
    Ok(())
}

fn configure(
    store: &dyn StateStore,
    server: &str,
    token: &str,
    username: Option<&str>,
) -> Result<(), String> {
    let mut outcome = Ok(());
    let state = store
        .update(&mut |state| {
            outcome = state.configure(server, token, username);
        })
        .map_err(|err| err.to_string())?;
    outcome.map_err(|err| err.to_string())?;

    println!(
        "Saved. Channel base: {}",
        state.server_url.as_deref().unwrap_or_default()
    );
    if let Some(endpoint) = state.push_endpoint() {
        println!("Push endpoint: {endpoint}");
    }
    Ok(())
}

fn set_manual_off(store: &dyn StateStore, manual_off: bool) -> Result<(), String> {
    store
        .update(&mut |state| state.manual_off = manual_off)
        .map_err(|err| err.to_string())?;
    let period = DEFAULT_KEEPALIVE_PERIOD.as_secs();
    if manual_off {
        println!(
            "Disconnected; a running client closes its channel on its next keep-alive tick (default {period} s)."
        );
    } else {
        println!(
            "Connect requested; a running client reconnects on its next keep-alive tick (default {period} s)."
        );
    }
    Ok(())
}

fn status(store: Arc<dyn StateStore>) -> Result<(), String> {
    let identity = IdentityStore::new(Arc::clone(&store))
        .load_or_create()
        .map_err(|err| err.to_string())?;
    let state = store.load().map_err(|err| err.to_string())?;

    println!("client id:      {}", identity.id);
    println!("manual off:     {}", state.manual_off);
    println!(
        "http server:    {}",
        state.http_server_url.as_deref().unwrap_or("-")
    );
    println!("channel base:   {}", state.server_url.as_deref().unwrap_or("-"));
    println!("username:       {}", state.username.as_deref().unwrap_or("-"));
    println!(
        "token:          {}",
        if state.auth_token.is_some() {
            "<set>"
        } else {
            "-"
        }
    );
    if let Some(endpoint) = state.push_endpoint() {
        println!("push endpoint:  {endpoint}");
    }
    Ok(())
}

fn resolve(snapshot: &Path, hints: Vec<String>) -> Result<(), String> {
    let raw = std::fs::read_to_string(snapshot)
        .map_err(|err| format!("cannot read {}: {err}", snapshot.display()))?;
    let document = Document::from_json(&raw).map_err(|err| err.to_string())?;

    let mut config = ResolverConfig::default();
    config.placeholder_hints.extend(hints);
    match TargetResolver::new(&config).resolve(&document) {
        Some(target) => println!("element #{} via {}", target.element.0, target.rule),
        None => println!("no unambiguous target; code would go to the clipboard only"),
    }
    Ok(())
}
