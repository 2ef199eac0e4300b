//! Push-notification channel: connection lifecycle and subscription registry.

pub mod lifecycle;
pub mod pending;
pub mod registry;

pub use lifecycle::{ConnectionLifecycle, ConnectionStatus, LifecycleEvent};
pub use pending::PendingRequests;
pub use registry::{SubscriptionRegistry, SubscriptionSnapshot};
