//! common imports used across the crate, mostly tracing macros.

pub use tracing::{debug, debug_span, error, info, info_span, instrument, trace, warn};
