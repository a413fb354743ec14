//! Client side of the tether assistant protocol.
//!
//! A [`Session`] owns one connection. Outbound requests are correlated with
//! their replies by [`CorrelationRegistry`], every inbound frame is routed by
//! [`DispatchRouter`], and [`TaskTracker`] follows the lifecycle of the
//! long-running tasks the backend reports on.

pub mod config;
pub mod error;
pub mod host;
pub mod registry;
pub mod router;
pub mod session;
pub mod task;
pub mod transport;

pub use config::{ClientConfig, ConfigError, ENDPOINT_ENV, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use host::{HostBridge, HostContext, HostEvent, KeyValueStore, MemoryHost, MessageEmitter, SecretStore};
pub use registry::{CorrelationRegistry, Offer, PendingReply};
pub use router::{DispatchRouter, Routed, Subscription};
pub use session::{ADOPTED, Attachments, Reply, Session};
pub use task::{CONNECTION_LOST, Task, TaskAnomaly, TaskStatus, TaskTracker, Transition};
pub use transport::{Endpoint, InvalidEndpoint};

pub use tether_protocol as protocol;
