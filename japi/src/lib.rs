//! japi — a plugin-composable JSON:API 1.0 request engine over pluggable
//! storage, with realtime subscriptions.
//!
//! This facade crate re-exports the japi sub-crates through a single
//! dependency. Import everything you need with:
//!
//! ```ignore
//! use japi::prelude::*;
//! ```
//!
//! | Crate | Concern |
//! |-------|---------|
//! | `japi-core` | The request execution engine |
//! | `japi-data` | Storage abstractions (`StorageAdapter`, queries, transactions) |
//! | `japi-auth` | Token verification and auth-context building |
//! | `japi-realtime` | Subscriptions and post-commit broadcasting |
//!
//! A minimal wiring:
//!
//! ```ignore
//! let storage = Arc::new(my_backend);
//! let subscriptions = Arc::new(SubscriptionRegistry::new(registry.clone()));
//! let broadcaster = Arc::new(ChangeBroadcaster::new(subscriptions.clone(), registry));
//! let engine = Engine::builder(storage)
//!     .with(BlogPlugin)
//!     .auth_provider(Arc::new(auth_builder))
//!     .change_sink(broadcaster)
//!     .build()?;
//! ```

pub use japi_auth;
pub use japi_core;
pub use japi_data;
pub use japi_realtime;

// Re-export the engine surface at the top level for convenience.
pub use japi_core::*;

/// Re-exports of the most commonly used types across all sub-crates.
pub mod prelude {
    pub use japi_auth::prelude::*;
    pub use japi_core::prelude::*;
    pub use japi_data::prelude::*;
    pub use japi_realtime::prelude::*;
}
