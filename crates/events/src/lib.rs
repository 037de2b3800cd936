//! Extraction event infrastructure.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`, with per-topic subscriptions.
//! - [`EventPublisher`]: transport seam with an in-process backend and a
//!   PostgreSQL `pg_notify` backend.
//! - [`PgEventRelay`]: republishes `pg_notify` events onto a local bus.

pub mod bus;
pub mod publisher;
pub mod relay;

pub use bus::{Delivery, EventBus, TopicSubscription};
pub use publisher::{publish_or_log, BusPublisher, EventPublisher, PgNotifyPublisher, PublishError};
pub use relay::PgEventRelay;
