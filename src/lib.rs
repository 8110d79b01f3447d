pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod types;

pub use config::Config;
pub use error::{LabError, Result};
pub use pipeline::runner::{BatchOutcome, BatchRunner, RunOptions};
pub use pipeline::{DocumentPipeline, TableAlignment, Tables};
