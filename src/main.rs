use pulsebridge::{BridgeConfig, BridgeUpdate, spawn_bridge};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => match BridgeConfig::load(&path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config");
                config
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load config");
                std::process::exit(1);
            }
        },
        None => BridgeConfig::default(),
    };

    let bridge = match spawn_bridge(config) {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::error!(error = %e, "failed to start bridge");
            std::process::exit(1);
        }
    };

    let updates = bridge.update_rx.clone();
    std::thread::spawn(move || {
        for update in updates {
            match update {
                BridgeUpdate::Clock(clock) => {
                    tracing::debug!(
                        bpm = clock.bpm,
                        locked = clock.locked,
                        jitter_ms = clock.jitter_ms,
                        "clock"
                    )
                }
                BridgeUpdate::BreakerTripped => {
                    tracing::warn!("feedback loop detected, traffic halted")
                }
                BridgeUpdate::Visual(event) => tracing::trace!(?event, "event"),
                BridgeUpdate::Log(line) => tracing::info!("{line}"),
                BridgeUpdate::Stopped => break,
            }
        }
    });

    println!("pulsebridge running, press Enter to quit");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    bridge.shutdown();
}
