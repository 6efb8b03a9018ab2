//! Parallel multi-session processing using rayon
//!
//! Sessions are independent: each worker owns one session's stream and
//! candidates, the pipeline and overrides are shared read-only. A session
//! with unreadable rows or an invalid stream is recorded as a failure and
//! never stops the others.

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::BatchConfig;
use crate::error::{HrrError, Result};
use crate::import::SessionSamples;
use crate::models::{QualityStatus, SessionFeatures};
use crate::overrides::{OverrideWarning, Overrides, SessionOverrides};
use crate::pipeline::SessionPipeline;

/// A session that could not be processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub session_id: String,
    pub error: String,
}

/// Summary of a batch run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub total_sessions: usize,
    pub successful_sessions: usize,
    pub failed_sessions: usize,
    pub total_intervals: usize,
    pub passed: usize,
    pub flagged: usize,
    pub rejected: usize,
    /// Override warnings across all sessions, including unknown sessions
    pub warnings: usize,
    pub total_duration_ms: u128,
}

impl BatchSummary {
    /// Get throughput (sessions per second)
    pub fn throughput_sessions_per_sec(&self) -> f64 {
        if self.total_duration_ms == 0 {
            return 0.0;
        }
        (self.successful_sessions as f64 / self.total_duration_ms as f64) * 1000.0
    }

    pub fn avg_time_per_session_ms(&self) -> f64 {
        if self.successful_sessions == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.successful_sessions as f64
    }

    pub fn is_fully_successful(&self) -> bool {
        self.failed_sessions == 0
    }

    /// Get human-readable summary
    pub fn to_string_pretty(&self) -> String {
        format!(
            "Batch Summary\n  \
             Sessions: {} ({} ok, {} failed)\n  \
             Intervals: {} ({} pass, {} flagged, {} rejected)\n  \
             Override Warnings: {}\n  \
             Total Time: {:.2}s\n  \
             Throughput: {:.2} sessions/sec\n  \
             Avg Time/Session: {:.2}ms",
            self.total_sessions,
            self.successful_sessions,
            self.failed_sessions,
            self.total_intervals,
            self.passed,
            self.flagged,
            self.rejected,
            self.warnings,
            self.total_duration_ms as f64 / 1000.0,
            self.throughput_sessions_per_sec(),
            self.avg_time_per_session_ms()
        )
    }
}

type SessionOutcome = std::result::Result<SessionFeatures, SessionFailure>;

/// Everything a batch run produced
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Feature sets of successful sessions, in input order
    pub sessions: Vec<SessionFeatures>,
    /// Failed sessions, in input order
    pub failures: Vec<SessionFailure>,
    /// Warnings not tied to a processed session: malformed override rows
    /// and records for unknown sessions
    pub warnings: Vec<OverrideWarning>,
    pub summary: BatchSummary,
}

/// Runs the session pipeline over many sessions at once
pub struct BatchProcessor {
    pipeline: SessionPipeline,
    config: BatchConfig,
}

impl BatchProcessor {
    /// Processor using the pipeline's own batch settings
    pub fn new(pipeline: SessionPipeline) -> Self {
        let config = pipeline.config().batch.clone();
        Self { pipeline, config }
    }

    pub fn with_config(pipeline: SessionPipeline, config: BatchConfig) -> Self {
        Self { pipeline, config }
    }

    pub fn pipeline(&self) -> &SessionPipeline {
        &self.pipeline
    }

    /// Process all sessions.
    ///
    /// Session-local errors become [`SessionFailure`]s; any other error, or a
    /// thread-pool setup failure, aborts the run.
    pub fn process(&self, sessions: Vec<SessionSamples>, overrides: &Overrides) -> Result<BatchReport> {
        let start_time = Instant::now();
        info!("Starting batch of {} sessions", sessions.len());

        let unknown = overrides.unknown_sessions(sessions.iter().map(|s| s.session_id.as_str()));
        for warning in &unknown {
            warn!("{}", warning);
        }
        let mut warnings = overrides.load_warnings().to_vec();
        warnings.extend(unknown);

        let progress = if self.config.show_progress {
            let pb = ProgressBar::new(sessions.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({msg})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            Some(pb)
        } else {
            None
        };

        let outcomes = match self.config.num_threads {
            Some(num_threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .build()
                    .map_err(|e| HrrError::Internal(format!("Failed to create thread pool: {}", e)))?;
                pool.install(|| self.process_parallel(sessions, overrides, &progress))?
            }
            None => self.process_parallel(sessions, overrides, &progress)?,
        };

        if let Some(pb) = progress {
            pb.finish_with_message("Complete");
        }

        let total_sessions = outcomes.len();
        let mut features = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(session) => features.push(session),
                Err(failure) => failures.push(failure),
            }
        }

        let count = |status: QualityStatus| -> usize {
            features.iter().map(|s| s.count_status(status)).sum()
        };
        let summary = BatchSummary {
            total_sessions,
            successful_sessions: features.len(),
            failed_sessions: failures.len(),
            total_intervals: features.iter().map(|s| s.intervals.len()).sum(),
            passed: count(QualityStatus::Pass),
            flagged: count(QualityStatus::Flagged),
            rejected: count(QualityStatus::Rejected),
            warnings: warnings.len() + features.iter().map(|s| s.warnings.len()).sum::<usize>(),
            total_duration_ms: start_time.elapsed().as_millis(),
        };

        info!("{}", summary.to_string_pretty());

        Ok(BatchReport {
            sessions: features,
            failures,
            warnings,
            summary,
        })
    }

    fn process_parallel(
        &self,
        sessions: Vec<SessionSamples>,
        overrides: &Overrides,
        progress: &Option<ProgressBar>,
    ) -> Result<Vec<SessionOutcome>> {
        let no_overrides = SessionOverrides::default();

        sessions
            .into_par_iter()
            .map(|session| {
                let session_start = Instant::now();
                let session_overrides = overrides.session(&session.session_id).unwrap_or(&no_overrides);
                let checked = session.check_rows();
                let SessionSamples {
                    session_id, samples, ..
                } = session;

                let result = checked
                    .map_err(HrrError::from)
                    .and_then(|()| self.pipeline.process_samples(&session_id, samples, session_overrides));

                let outcome = match result {
                    Ok(features) => {
                        debug!(
                            "Processed session {} ({} intervals, {}ms)",
                            session_id,
                            features.intervals.len(),
                            session_start.elapsed().as_millis()
                        );
                        Ok(Ok(features))
                    }
                    Err(e) if e.is_session_local() => {
                        warn!("Skipping session {}: {}", session_id, e.user_message());
                        Ok(Err(SessionFailure {
                            session_id,
                            error: e.to_string(),
                        }))
                    }
                    Err(e) => {
                        error!("Aborting batch at session {}: {}", session_id, e);
                        Err(e)
                    }
                };

                if let Some(pb) = progress {
                    pb.inc(1);
                }
                outcome
            })
            .collect()
    }
}
