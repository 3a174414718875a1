//! Convenience re-exports for hosts embedding the engine.

pub use crate::analytics::{AnalyticsSnapshot, EventKind};
pub use crate::config::{PoolConfig, SessionConfig, SourceSelection};
pub use crate::error::{PoolError, Result};
pub use crate::executor::CancelToken;
pub use crate::manager::{ProxyPoolManager, SelectionOptions};
pub use crate::proxy::{AnonymityLevel, Proxy, ProxyProtocol};
pub use crate::rotation::RotationStrategyKind;
pub use crate::session::Session;
pub use crate::sources::FetchOptions;
pub use crate::store::{KeyValueStore, MemoryStore};
pub use crate::validator::ValidationOutcome;
