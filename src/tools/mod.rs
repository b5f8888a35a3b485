pub mod executor;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod schema;

pub use executor::{RetryPolicy, ToolExecutor};
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use registry::{Tool, ToolError, ToolRegistry};
pub use router::{InvocationContext, ToolRouter};
pub use schema::{tool_call_schema_json, FieldKind, FieldSpec, ToolSchema};
