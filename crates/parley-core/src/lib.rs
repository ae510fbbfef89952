pub mod config;
pub mod error;
pub mod lifecycle;
pub mod types;

pub use error::{ParleyError, Result};
pub use lifecycle::TaskLifecycle;
