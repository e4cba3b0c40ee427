mod cli;

use std::io::Read;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use x11bridge_engine::{DisplayAdapter, Forwarder, HookTracker, InputInjector, Session};
use x11bridge_proto::{BridgeConfig, DamageTrust, RemoteBridge, ScanConfig, SpiceConfig, SslConfig};

use cli::{Cli, ListenSpec};

/// Holds the coordinator alive for the process lifetime and runs its exact
/// shutdown sequence (`session.c`'s `session_destroy`) whenever it goes out
/// of scope, including on an early `?` return from a later startup stage —
/// this is the RAII half of `main.c`'s "goto exit" unwind order.
struct SessionGuard(Arc<Session>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.stop();
        self.0.destroy();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli).context("loading configuration")?;

    let issues = config.validate();
    let mut fatal = false;
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            fatal = true;
            error!("{issue}");
        } else {
            warn!("{issue}");
        }
    }
    if fatal {
        bail!("refusing to start the protocol server with an invalid configuration");
    }

    let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    runtime.block_on(run(cli, config))
}

/// Resolve the config file path: `--config` wins outright; otherwise the
/// user config dir, then `/etc/x11bridge/config.toml`, then compiled-in
/// defaults, matching `options.c`'s `string_option` search order.
fn config_search_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    if let Some(user) = dirs::config_dir() {
        let candidate = user.join("x11bridge").join("config.toml");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    let system = PathBuf::from("/etc/x11bridge/config.toml");
    system.exists().then_some(system)
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match config_search_path(cli) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => BridgeConfig {
            bridge: SpiceConfig::default(),
            ssl: SslConfig::default(),
            scan: ScanConfig::default(),
        },
    };
    cli.merge_into(&mut config);
    Ok(config)
}

fn damage_trust_from_str(value: &str) -> DamageTrust {
    match value {
        "always" => DamageTrust::AlwaysTrust,
        "never" => DamageTrust::NeverTrust,
        _ => DamageTrust::Auto,
    }
}

/// Try each port in the listen spec's range in order, returning the first
/// that binds. The probe socket is dropped immediately afterward — the
/// external remote protocol library owns the real listening socket once it
/// takes over — matching `options_handle_ssl`'s first-successful-bind
/// behavior without keeping the bind beyond the search.
fn resolve_listen_port(spec: &ListenSpec) -> Result<u16> {
    for port in spec.ports() {
        let addr = if spec.host.is_empty() {
            format!("0.0.0.0:{port}")
        } else {
            format!("{}:{port}", spec.host)
        };
        match TcpListener::bind(&addr) {
            Ok(listener) => {
                drop(listener);
                return Ok(port);
            }
            Err(e) => {
                warn!(%addr, "listen probe failed: {e}");
            }
        }
    }
    bail!(
        "no free port in range {}-{} ({})",
        spec.start_port,
        spec.end_port,
        "AutoListenFailed"
    );
}

/// Generate a random alphanumeric password of the requested length, reading
/// entropy straight from `/dev/urandom` — no crate in the retrieved corpus
/// pulls in a CSPRNG dependency for this, and the device file is the
/// standard Unix primitive `options.c`'s own generator reads from.
fn generate_password(len: u32) -> Result<String> {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut raw = vec![0u8; len as usize];
    std::fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut raw))
        .context("reading /dev/urandom for password generation")?;
    Ok(raw.iter().map(|b| CHARSET[*b as usize % CHARSET.len()] as char).collect())
}

/// A driver loop standing in for the external remote protocol server's
/// worker thread (spec.md §1's "external library invoked through a small
/// interface"): polls the forwarder the way that worker would, logging and
/// releasing each command instead of encoding/sending it. Exists so the
/// binary is runnable and observable end to end without that library.
async fn run_forwarder_demo(mut forwarder: Forwarder) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(16));
    loop {
        ticker.tick().await;
        while let Some(cmd) = forwarder.get_command() {
            info!(rect = ?cmd.rect, "draw command ready");
            forwarder.release_resource(cmd.token);
        }
        while let Some(cmd) = forwarder.get_cursor_command() {
            info!(x = cmd.x, y = cmd.y, "cursor command ready");
            forwarder.release_resource(cmd.token);
        }
    }
}

async fn run(cli: Cli, config: BridgeConfig) -> Result<()> {
    let listen_spec = ListenSpec::parse(&config.bridge.listen)
        .map_err(|e| anyhow::anyhow!("invalid listen spec: {e}"))?;
    let port = resolve_listen_port(&listen_spec)?;
    info!(host = %listen_spec.host, port, "resolved listen address");

    if config.bridge.generate_password {
        let password = generate_password(cli.generate_password_length())?;
        info!("generated session password: {password}");
    }

    let display_name = (!config.bridge.display.is_empty()).then(|| config.bridge.display.as_str());
    let trust = damage_trust_from_str(&config.bridge.always_trust_damage);

    let display = DisplayAdapter::open(
        display_name,
        config.scan.tile_count,
        trust,
        config.scan.scanline_coalescing,
    )
    .context("opening X11 display")?;

    let session = Arc::new(Session::new(display.pool()));
    let session_guard = SessionGuard(Arc::clone(&session));

    let (width, height, _depth) = display.geometry();
    session
        .recreate_primary(width, height)
        .context("allocating primary surface")?;
    session.start();

    let mut forwarder = Forwarder::new(Arc::clone(&session));
    forwarder
        .attach_worker()
        .map_err(|e| anyhow::anyhow!("attaching remote protocol worker: {e}"))?;
    // Same connection the capture thread reads events from, shared via
    // `Arc`; XTest injection from here never blocks on `wait_for_event`.
    forwarder.set_input_injector(InputInjector::new(display.connection()));

    let hooks = Arc::new(HookTracker::new());
    if !config.bridge.on_connect.is_empty() {
        if let Some(hook) = x11bridge_engine::hooks::spawn_hook(&config.bridge.on_connect, &listen_spec.host) {
            hooks.track(hook);
        }
    }

    let reaper_hooks = Arc::clone(&hooks);
    let reaper_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            ticker.tick().await;
            reaper_hooks.reap_all();
        }
    });

    let mut display = display;
    let capture_session = Arc::clone(&session);
    let capture_handle = std::thread::Builder::new()
        .name("x11bridge-display".into())
        .spawn(move || display.run(&capture_session))
        .context("spawning capture thread")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    tokio::select! {
        _ = run_forwarder_demo(forwarder) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    // `display.run`'s poll loop notices this within one idle-poll interval.
    session.stop();
    if capture_handle.join().is_err() {
        warn!("capture thread panicked");
    }

    reaper_handle.abort();

    if !config.bridge.on_disconnect.is_empty() {
        if let Some(hook) = x11bridge_engine::hooks::spawn_hook(&config.bridge.on_disconnect, &listen_spec.host) {
            hooks.track(hook);
        }
    }
    hooks.kill_remaining();

    drop(session_guard);
    Ok(())
}
