//! # Cache
//!
//! Size-bounded, process-local storage for loaded resources. Each
//! [`Loader`](crate::loader::Loader) owns one instance.

mod memory;
mod types;

pub use memory::{DEFAULT_MAX_CACHE_SIZE, MemoryCache};
pub use types::{Payload, RawBody, Resource};
