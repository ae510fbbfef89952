pub mod app;

pub use app::{build_registry, Bridge, ShutdownReport};
