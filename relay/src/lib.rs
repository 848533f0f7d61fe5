//! Relay: a multi-tenant reverse proxy and control plane for LLM traffic.
//!
//! The orchestrator ties the engines together: the [`router`] picks an
//! upstream provider by priority/weight/group policy, the [`dispatch`]
//! pipeline forwards traffic (streaming or buffered) with per-endpoint
//! timeouts, meters cost into the ledger and counter cache, and the
//! [`server`] module exposes the `/v1/messages` ingress plus the admin API.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod probe;
pub mod router;
pub mod server;
pub mod snapshot;
pub mod sse;
pub mod state;
pub mod warmup;

pub use config::AppConfig;
pub use snapshot::{ProviderSnapshot, SnapshotRegistry};
pub use state::{AppState, PrincipalSource};
