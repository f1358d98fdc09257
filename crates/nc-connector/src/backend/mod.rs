//! Backend implementations
//!
//! Each backend family implements `nc_core::Backend`. The connector only
//! ever sees an `Arc<dyn Backend>`, built from configuration here.

#[cfg(test)]
pub(crate) mod mock;
mod shell;
mod simulated;

pub use shell::ShellBackend;
pub use simulated::SimulatedBackend;

use std::sync::Arc;

use nc_core::config::BackendConfig;
use nc_core::Backend;

/// Build the backend selected by configuration
pub fn from_config(config: &BackendConfig) -> Arc<dyn Backend> {
    match config {
        BackendConfig::Simulated(sim) => Arc::new(SimulatedBackend::new(sim.clone())),
        BackendConfig::Shell(shell) => Arc::new(ShellBackend::new(shell.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_core::config::ShellBackendConfig;

    #[test]
    fn test_from_config_selects_family() {
        assert_eq!(from_config(&BackendConfig::default()).name(), "simulated");
        assert_eq!(
            from_config(&BackendConfig::Shell(ShellBackendConfig::default())).name(),
            "shell"
        );
    }
}
