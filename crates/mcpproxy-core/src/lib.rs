//! Core orchestration: the Upstream Manager, Tool Router, Management
//! Service, tool Indexer, application config, and the Runtime that wires
//! them together into one running proxy.
//!
//! [`runtime::Runtime`] is the entry point a binary builds and drives; the
//! other modules are its building blocks and can be exercised standalone in
//! tests without a full runtime.

pub mod config;
pub mod error;
pub mod indexer;
pub mod management;
pub mod router;
pub mod runtime;
pub mod upstream;

pub use config::{AppConfig, SeedServerConfig};
pub use error::{McpProxyError, McpProxyResult};
pub use indexer::Indexer;
pub use management::{BulkResult, ConfigDiff, IsolationPatch, ManagementService, OAuthPatch, ServerPatch};
pub use router::{ToolRouter, TOOL_RESPONSE_LIMIT_BYTES};
pub use runtime::Runtime;
pub use upstream::{UpstreamManager, UpstreamSnapshot};
