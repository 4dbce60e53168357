//! linputd - Main Entry Point
//!
//! Opens the consumer's shared channel, enumerates input devices and forwards
//! their key events until the consumer goes away or a signal arrives.

use linput_common::tracing;
use linputd::channel::{self, ChannelPublisher};
use linputd::config::{self, BridgeConfig};
use linputd::device::{DeviceRegistry, EvdevBackend};
use linputd::event_loop::EventLoop;
use linputd::lifecycle::{self, ShutdownFlag};
use std::env;
use std::process::ExitCode;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let config_path = config::config_path_from_args(env::args().skip(1));
    // Read before logging exists so the configured level applies from the start
    let loaded = BridgeConfig::read(&config_path);

    let level = match &loaded {
        Ok(Some(config)) => config.log_level(),
        _ => tracing::Level::INFO,
    };
    linputd::init_logging(level);

    let config = match loaded {
        Ok(Some(config)) => {
            info!("Loaded configuration from {}", config_path.display());
            config
        }
        Ok(None) => BridgeConfig::missing(&config_path),
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if config.daemon.log_level.parse::<tracing::Level>().is_err() {
        warn!("Unknown log level {:?}, using info", config.daemon.log_level);
    }

    info!("Linux input program started");
    let result = run(&config);
    info!("Linux input program exiting");

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let publisher: ChannelPublisher = channel::open_channel(&config.channel)?;

    let shutdown = ShutdownFlag::new();
    let registry = DeviceRegistry::new(EvdevBackend, &config.input.device_dir, &config.input.node_prefix);
    let mut event_loop = EventLoop::new(
        registry,
        publisher,
        shutdown.clone(),
        config.poll_timeout(),
        config.input.watch_hotplug,
    )?;

    // Exits with a failure when nothing is found; the consumer has been told
    let count = event_loop.start()?;
    info!("Found {} input devices", count);

    lifecycle::install_signal_handlers(&shutdown)?;
    lifecycle::spawn_liveness_watcher(&config.channel.liveness_name, shutdown.clone())?;

    event_loop.run()?;
    Ok(())
}
