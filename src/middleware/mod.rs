pub mod middleware;
pub mod recover_middleware;

pub use middleware::Middleware;
pub use recover_middleware::PanicRecoverMiddleware;
