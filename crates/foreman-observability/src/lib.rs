pub mod logging;
pub mod metrics;
pub mod tracer;

pub use logging::*;
pub use metrics::*;
pub use tracer::*;
