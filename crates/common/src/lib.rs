//! Shared building blocks for the Beacon control plane.

pub mod ids;
pub mod logging;
pub mod version;

pub use ids::{mint_nonce, ConnectionId, NodeId};
pub use logging::{init_tracing, LogFormat};
pub use version::{Version, VersionClock};
