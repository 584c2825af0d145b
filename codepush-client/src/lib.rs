//! Client side of codepush: keeps one authenticated push channel alive and
//! turns pushed verification codes into clipboard writes, page fills and
//! notifications.

pub mod agent;
pub mod connection;
pub mod desktop;
pub mod dispatcher;
pub mod heartbeat;
pub mod identity;
pub mod keepalive;
pub mod logging;
pub mod store;

pub use agent::{
    ClipboardError, ClipboardWriter, DeliveryPresenter, DeliveryReport, PageAgent, PageEvent,
    PageSurface, SystemClipboard,
};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState, EnsureOutcome,
};
pub use dispatcher::{CodeDispatcher, Dispatch, HostError, Notification, RelayHost};
pub use heartbeat::HeartbeatMonitor;
pub use identity::{ClientIdentity, IdentityStore};
pub use keepalive::KeepAliveScheduler;
pub use store::{FileStateStore, MemoryStateStore, PersistedState, StateStore, StoreError};
