/// Console + file logging through `fern`, with rotation of previous run logs.
pub mod setup;

pub use setup::{parse_level, setup_logging};
