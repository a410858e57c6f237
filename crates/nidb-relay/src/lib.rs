//! Embeddable publish/subscribe engine for nidb.
//!
//! A [`Relay`] ties the other crates together: published events go into a
//! [`WriteQueue`](nidb_queue::WriteQueue) and the
//! [`IndexCache`](nidb_index::IndexCache), reads merge pending writes with
//! [`QueryEngine`](nidb_query::QueryEngine) results, and live
//! subscriptions are notified as events arrive.
//!
//! # Key Types
//!
//! - [`Relay`] - Cloneable engine handle (publish, query, subscribe, delete)
//! - [`EngineConfig`] - Flush cadence, batch size, cache size, prune target, EOSE timeout
//! - [`Subscription`] / [`SubscriptionHandlers`] - Live query handle and its callbacks
//! - [`Feature`] - Capabilities reported by [`Relay::supports`]
//!
//! # Lifecycle
//!
//! ```text
//! add(event) ──► WriteQueue ──(flush timer)──► EventStore ◄──(prune timer)
//!     │                                            │
//!     └──► live subscriptions        filters/subscribe/count
//! ```

pub mod config;
pub mod error;
pub mod relay;
pub mod subscription;

pub use config::EngineConfig;
pub use error::{RelayError, RelayResult};
pub use relay::{Relay, RelayBuilder};
pub use subscription::{Feature, Subscription, SubscriptionHandlers};
