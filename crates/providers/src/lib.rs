//! `providers` crate: the contracts the engine consumes from the outside world.
//!
//! Every capability backend (search, file system, database, ...) is reached
//! through a [`CapabilityExecutor`], and node results may be memoised through a
//! [`CacheStore`].  The engine crate only ever talks to these trait objects.

pub mod error;
pub mod traits;
pub mod memory;
pub mod echo;
pub mod mock;

pub use error::{CacheError, ProviderError};
pub use traits::{BackendDescriptor, CacheStore, CapabilityExecutor};
pub use memory::MemoryCache;
pub use echo::EchoExecutor;
