// Jobwright - reliable background jobs for Rust
//
// Durable queues, scheduled retries, batches with callbacks, named rate
// limiters and a worker pool, assembled by one `Engine`.

// Re-export the queue engine
pub use jobwright_queue::*;

// Re-export the limiter crate under its own path; its types collide by name
// with the queue's stores
pub use jobwright_ratelimit as ratelimit;
pub use jobwright_ratelimit::{LimitError, Limiter, LimiterDef, LimiterKind, LimiterRegistry};

pub mod logging;

// Prelude for common imports
pub mod prelude {
    pub use crate::logging::{LogConfig, LogFormat};
    pub use jobwright_queue::prelude::*;
    pub use jobwright_ratelimit::{LimitError, Limiter, LimiterRegistry};
}
