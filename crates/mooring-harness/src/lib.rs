//! Deterministic simulation harness for channel reconnection and punishment.
//!
//! Turmoil-based [`mooring_core::Transport`] and a scripted counterparty for
//! deterministic, reproducible session tests under simulated network
//! conditions. The in-process collaborators (scripted state machine, stub
//! sweep builder and signer, fixed fee sources) come from
//! [`mooring_core::testing`] and are re-exported here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod counterparty;
pub mod sim_transport;

pub use counterparty::{Counterparty, CounterpartyError, PeerReport, Step};
pub use mooring_core::testing;
pub use sim_transport::SimTransport;

/// Port every simulated peer listens on.
pub const PEER_PORT: u16 = 9735;

/// Install a test-friendly subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
