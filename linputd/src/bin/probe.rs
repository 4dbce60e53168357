//! Diagnostic tool: lists the devices linputd would track and prints the
//! records it would publish, without touching the shared channel.
//! Usage: linput-probe [--config <path>]

use linput_common::{keys, normalize::MOUSE_CODE_OFFSET, tracing, WireEvent};
use linputd::channel::EventSink;
use linputd::config::{self, BridgeConfig};
use linputd::device::{DeviceRegistry, EvdevBackend};
use linputd::event_loop::EventLoop;
use linputd::lifecycle::{self, ShutdownFlag};
use std::process::ExitCode;
use tracing::{error, info, warn};

/// Prints every record instead of publishing it
#[derive(Default)]
struct PrintSink {
    printed: usize,
}

impl EventSink for PrintSink {
    fn publish(&mut self, record: WireEvent) {
        self.printed += 1;
        let action = if record.value == 0 { "RELEASED" } else { "PRESSED" };
        info!("[{}] code {:#06X} ({}) {}", self.printed, record.code, raw_name(record.code), action);
    }

    fn announce_no_devices(&mut self) {
        warn!("Would report 'no input devices' to the consumer");
    }
}

/// Best-effort name for a translated code
fn raw_name(code: u16) -> &'static str {
    if code >= MOUSE_CODE_OFFSET {
        keys::key_name(code - MOUSE_CODE_OFFSET)
    } else if code & 0xFF00 == 0xE000 {
        "EXTENDED"
    } else {
        keys::key_name(code)
    }
}

fn main() -> ExitCode {
    let config_path = config::config_path_from_args(std::env::args().skip(1));
    linputd::init_logging(tracing::Level::INFO);

    let config = match BridgeConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if !nix::unistd::getuid().is_root() {
        warn!("Not running as root, some devices may not be readable");
    }

    let shutdown = ShutdownFlag::new();
    let registry = DeviceRegistry::new(EvdevBackend, &config.input.device_dir, &config.input.node_prefix);
    let mut event_loop = match EventLoop::new(
        registry,
        PrintSink::default(),
        shutdown.clone(),
        config.poll_timeout(),
        config.input.watch_hotplug,
    ) {
        Ok(event_loop) => event_loop,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = event_loop.start() {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    for tracked in event_loop.registry().devices() {
        info!("  - {} (bus {:#06x}, {})", tracked.path.display(), tracked.bus,
              if tracked.pointer { "pointer" } else { "keyboard" });
    }

    if let Err(e) = lifecycle::install_signal_handlers(&shutdown) {
        error!("{}", e);
        return ExitCode::FAILURE;
    }
    info!("Press keys on any listed device; Ctrl+C to exit");

    match event_loop.run() {
        Ok(()) => {
            info!("Printed {} records", event_loop.sink().printed);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
