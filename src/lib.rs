//! waygate: multi-tenant messaging-session gateway.
//!
//! One messaging client per registered user, paired once via a scannable
//! code, supervised while it runs, and resumed from stored credentials
//! across restarts. The HTTP gateway is the only surface; everything
//! session-shaped sits behind [`session::SessionManager`].
//!
//! Module map:
//! - [`auth`] — accounts, bearer tokens, and the durable user status row
//! - [`config`] — TOML configuration with per-section defaults
//! - [`engine`] — the messaging engine seam, its simulator, and the adapter
//!   that turns engine events into session phases
//! - [`gateway`] — axum HTTP surface (auth, pairing, status, send)
//! - [`session`] — generation-guarded registry and the lifecycle manager
//! - [`store`] — SQLite-backed credential persistence

pub mod auth;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod session;
pub mod store;
