pub mod config;
pub mod decode;
pub mod events;
pub mod output;
pub mod prompt;
pub mod template;
pub mod types;
pub mod workflow;

pub use config::Config;
pub use decode::Context;
pub use types::*;
pub use workflow::WorkflowSpec;
