//! Logger setup. Everything goes to stderr with a `[heapster LEVEL]` prefix
//! so agent output is easy to tell apart from the application's.

use log::LevelFilter;
use std::io::Write;

/// Installs the stderr logger at `level`. A logger installed earlier (by
/// the host process or a second agent instance) is left in place.
pub fn init(level: LevelFilter) {
    let installed = env_logger::Builder::new()
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .format(|buf, record| writeln!(buf, "[heapster {}] {}", record.level(), record.args()))
        .try_init();
    if installed.is_err() {
        log::debug!("logger already installed, keeping it");
    }
}
