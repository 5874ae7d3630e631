pub mod config;
pub mod error;
pub mod types;

pub use config::{load_dotenv, DispatchConfig, ResumePolicy};
pub use error::SchedError;
pub use types::*;
