//! Signal handling for graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Install signal handlers and return a shutdown flag.
///
/// The first interrupt requests a drain; a second one stops waiting and
/// exits the process.
pub fn install_signal_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            warn!("second interrupt, exiting immediately");
            std::process::exit(1);
        }
        info!("interrupt received, draining");
    })
    .expect("failed to set signal handler");

    shutdown
}
