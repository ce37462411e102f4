//! # offsync-relay
//!
//! Remote store server for offsync.
//!
//! The relay is the authority clients sync against:
//! - Applies mutations idempotently, keyed by mutation id, with optimistic
//!   version checks
//! - Assigns a per-tenant sequence to every applied change and serves the
//!   change log for catch-up
//! - Grants exclusive, expiring record leases
//! - Advertises the schema version clients migrate to
//!
//! ## Architecture
//!
//! ```text
//! Device A ──┐                    ┌── Device B
//!            │     HTTP + JSON    │
//!            ├───────────────────►│
//!            │                    │
//!        ┌───┴────────────────────┴───┐
//!        │       offsync-relay        │
//!        │  ┌─────────────────────┐   │
//!        │  │ SQLite (records,    │   │
//!        │  │ changes, leases)    │   │
//!        │  └─────────────────────┘   │
//!        └────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod server;
pub mod storage;
