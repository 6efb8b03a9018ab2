// Library interface for hrrs
// The binary and the integration tests both go through these modules

pub mod batch;
pub mod config;
pub mod decay;
pub mod detector;
pub mod error;
pub mod export;
pub mod import;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod overrides;
pub mod pipeline;
pub mod quality;
pub mod reanchor;
pub mod signal;

// Re-export commonly used types for convenience
pub use batch::{BatchProcessor, BatchReport, BatchSummary, SessionFailure};
pub use config::HrrConfig;
pub use error::{HrrError, Result};
pub use export::{digest, ExportFormat};
pub use import::{CsvImporter, SessionFilter, SessionSamples};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use models::*;
pub use overrides::{OverrideWarning, Overrides, PeakAdjustment, QualityOverride, SessionOverrides};
pub use pipeline::SessionPipeline;
