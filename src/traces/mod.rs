pub mod tracer;

// Re-export commonly used functions and constants
pub use tracer::{
    disable_tracing, enable_tracing, extract, is_active_tracing, ATTR_HTTP_RESPONSE_SIZE_KEY,
    ATTR_HTTP_STATUS_CODE_KEY, ATTR_ROUTE_BACKEND, ATTR_ROUTE_HOST, ATTR_ROUTE_IS_ERR,
};

use crate::config::Traces;
use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Applies tracing configuration and returns a shutdown function.
pub fn apply(
    shutdown_token: CancellationToken,
    cfg: Option<Traces>,
) -> Box<dyn Fn(CancellationToken) -> Result<()> + Send + Sync> {
    tracer::apply(shutdown_token, cfg)
}
