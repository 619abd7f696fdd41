//! Embedded storage for `mcpproxy`: server configs, OAuth tokens, per-upstream
//! tool hashes, and the activity log. See `store::Storage` for the public API.

pub mod error;
pub mod model;
pub mod server_key;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use store::Storage;
