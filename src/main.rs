use std::sync::Arc;

use log::info;

use wsjson::logging;
use wsjson::net::server::Server;
use wsjson::observe::LogObserver;
use wsjson::{Config, ServerError};

fn run() -> Result<(), ServerError> {
    let config = Arc::new(Config::from_env()?);

    // Event loop on the first core, log drain on the second when there is one.
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    let hot_core = core_ids.first().copied();
    let cold_core = core_ids.get(1).or(core_ids.first()).copied();

    let _log_drain = logging::init(config.log_level, cold_core)?;
    info!("Detected {} cores.", core_ids.len());

    if let Some(core) = hot_core {
        if core_affinity::set_for_current(core) {
            info!("Event loop pinned to core {}", core.id);
        }
    }

    let mut server = Server::bind(Arc::clone(&config), LogObserver)?;
    info!(
        "Server listening on {} (static root {}, subprotocols {:?})",
        server.local_addr()?,
        config.static_root.display(),
        config.subprotocols
    );
    server.run()
}

fn main() {
    if let Err(e) = run() {
        // Let the drain thread write out what is still queued.
        log::logger().flush();
        eprintln!("wsjson: {e}");
        std::process::exit(1);
    }
}
