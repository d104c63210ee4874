//! Per-session components and the pipeline that wires them together.

pub mod checkpoint;
pub mod config_store;
pub mod pipeline;
pub mod switch;

pub use checkpoint::Checkpointer;
pub use config_store::SessionConfigStore;
pub use pipeline::{Pipeline, SessionParams};
pub use switch::SwitchController;
