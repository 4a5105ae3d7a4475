pub mod logging;
pub mod rate_limit;

pub use logging::RequestLogging;
pub use rate_limit::{FixedWindowLimiter, RateLimit};
