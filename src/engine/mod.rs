//! The watcher orchestration engine: per-watcher change-feed subscriptions,
//! pooled source connections, webhook delivery, and recovery.
//!
//! Control flow: [`registry::WatcherRegistry::start`] acquires a shared
//! connection from [`pool::ConnectionPool`], opens a
//! [`subscription::ChangeFeedSubscription`] bound to it, and wires its event
//! stream into [`dispatch::DeliveryDispatcher`]. Failures flow upward
//! (subscription fault deactivates the watcher, or
//! [`supervisor::ReconnectSupervisor`] rebuilds in standalone mode);
//! dispatcher failures are terminal per attempt and never propagate to the
//! feed.

pub mod dispatch;
pub mod pool;
pub mod registry;
pub mod source;
pub mod subscription;
pub mod supervisor;

pub use dispatch::{DeliveryDispatcher, WebhookPayload};
pub use pool::ConnectionPool;
pub use registry::{ActiveWatcher, WatcherRegistry};
pub use source::{
    ChangeEvent, ChangeFeed, EngineConnector, FeedNamespace, SourceConnection, SourceConnector,
};
pub use subscription::{
    ChangeFeedSubscription, EndReason, SubscriptionEnd, SubscriptionHandle, SubscriptionState,
};
pub use supervisor::ReconnectSupervisor;
