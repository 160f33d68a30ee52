//! Lazily built, auto-refreshing in-process values backed by a watch-capable
//! key/subtree store.
//!
//! ```text
//!   NodeResource / TreeResource ──get()──► Arc<E>
//!            ▲                                 │
//!   WatchEvent (notification thread)      superseded value
//!            │                                 ▼
//!   NodeWatchSource / TreeWatchSource     DeferredCleanup (TaskPool)
//! ```
//!
//! [`source::memory::MemoryStore`] provides an in-process store, and
//! [`registry`] shares one store client per connect string and namespace.

mod config;
pub mod errors;
pub mod registry;
pub mod resource;
pub mod source;
pub mod utils;

pub use config::*;
pub use errors::*;
pub use resource::*;
pub use utils::*;


//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
