// Pump link daemon: connect to the configured pump, poll readings and history, print JSON lines.

use std::time::Duration;

use anyhow::Context;
use pump_core::{ConnectionState, HistoryEvent};
use pump_linux::ble::BleTransport;
use pump_linux::config;
use pump_linux::cursor::CursorStore;
use pump_linux::{ConnectionManager, LinkError, PumpDriver};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long a poll waits for a reconnecting link before skipping the cycle.
const CONNECT_GRACE: Duration = Duration::from_secs(60);

fn main() -> anyhow::Result<()> {
    let mut once = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("pump-linux {}", VERSION);
                return Ok(());
            }
            "--once" => once = true,
            other => anyhow::bail!("unknown argument {other:?} (expected --once or --version)"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let address = cfg
        .address
        .clone()
        .context("no pump address configured (set `address` or PUMPLINK_ADDRESS)")?;
    let link_config = cfg.link_config().context("invalid pairing code")?;
    let poll_interval = cfg.poll_interval();
    let cursor_store = cfg.state_path.clone().map(CursorStore::new);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let transport = BleTransport::new().await.context("bluetooth unavailable")?;
        let driver = PumpDriver::new(ConnectionManager::new(transport, link_config, cursor_store));

        let mut states = driver.observe_connection_state();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                emit("connection_state", &state.to_string());
            }
        });

        // Event sequence of the newest history record printed; the driver cache is per process.
        let mut last_sequence = None;
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            if ensure_connected(&driver, &address).await? {
                poll_once(&driver, &mut last_sequence).await;
            } else {
                tracing::warn!("pump not connected; skipping this poll");
            }
            if once {
                break;
            }
            tokio::select! {
                r = &mut shutdown => {
                    r?;
                    tracing::info!("shutting down");
                    break;
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        driver.disconnect().await;
        Ok::<(), anyhow::Error>(())
    })
}

/// Connected, or retrying in the background and back within the grace period. A pump that
/// refused us ends the daemon: nothing recovers without re-pairing.
async fn ensure_connected(driver: &PumpDriver<BleTransport>, address: &str) -> anyhow::Result<bool> {
    match driver.link().state() {
        ConnectionState::Connected => return Ok(true),
        ConnectionState::AuthFailed => anyhow::bail!("pump refused the pairing; re-pair and restart"),
        ConnectionState::Disconnected => {
            tracing::info!(%address, "connecting");
            return match driver.connect(address).await {
                Ok(()) => Ok(true),
                Err(e @ (LinkError::Auth(_) | LinkError::BondLost)) => {
                    Err(anyhow::Error::new(e).context("cannot connect to the pump"))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connection failed");
                    Ok(false)
                }
            };
        }
        _ => {}
    }
    let mut states = driver.observe_connection_state();
    let settled = states.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::AuthFailed));
    let reached = match tokio::time::timeout(CONNECT_GRACE, settled).await {
        Ok(Ok(state)) => Some(*state),
        _ => None,
    };
    match reached {
        Some(ConnectionState::Connected) => Ok(true),
        Some(_) => anyhow::bail!("bond lost; re-pair and restart"),
        None => Ok(false),
    }
}

async fn poll_once(driver: &PumpDriver<BleTransport>, last_sequence: &mut Option<u32>) {
    report("iob", driver.get_iob().await);
    report("basal_rate", driver.get_basal_rate().await);
    report("battery", driver.get_battery_status().await);
    report("reservoir", driver.get_reservoir_level().await);
    report("cgm", driver.get_cgm_status().await);
    report("last_bolus", driver.get_last_bolus().await);

    let since = last_sequence.map_or(0, |s| s.saturating_add(1));
    match driver.get_history_logs(since).await {
        Ok(records) => {
            for record in &records {
                if let Some(event) = HistoryEvent::from_record(record) {
                    emit("history", &event);
                }
                *last_sequence = Some(last_sequence.map_or(record.sequence, |s| s.max(record.sequence)));
            }
        }
        Err(e) => tracing::warn!(error = %e, "history fetch failed"),
    }
}

fn report<R: Serialize>(kind: &str, reading: Result<R, LinkError>) {
    match reading {
        Ok(r) => emit(kind, &r),
        Err(e) => tracing::warn!(kind, error = %e, "reading failed"),
    }
}

fn emit<R: Serialize + ?Sized>(kind: &str, reading: &R) {
    println!("{}", serde_json::json!({ "kind": kind, "reading": reading }));
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
