pub mod cmd;
pub mod error;
pub mod relay;
pub mod tracer;

pub use error::{Error, Result};
