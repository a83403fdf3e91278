//! Drift detection.
//!
//! Drift is any difference between a module's declared state and what the
//! providers currently report. Detection re-plans the module and classifies
//! every diff; it never applies anything.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DriftSettings;
use crate::error::{ConfigError, DriftError, KeelError, Result};
use crate::events::{emit_best_effort, noop, Event, SharedEmitter};
use crate::model::{Module, ResourceId};
use crate::planner::{Action, Planner, PropertyChange};

/// Checks modules for drift, once or periodically.
#[derive(Clone)]
pub struct DriftDetector {
    /// Planner used to read current state.
    planner: Planner,
    /// Event sink.
    emitter: SharedEmitter,
    /// Time between periodic checks.
    interval: Duration,
}

/// Drift status of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftResult {
    /// Resource id.
    pub id: ResourceId,
    /// Whether the resource drifted.
    pub has_drift: bool,
    /// Action that would restore the declared state.
    pub action: Action,
    /// Property deltas.
    pub changes: Vec<PropertyChange>,
    /// Why the resource could not be checked.
    pub error: Option<String>,
}

/// Outcome of one drift check.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Module name.
    pub module: String,
    /// Fingerprint of the checked module.
    pub module_hash: String,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
    /// Resources checked.
    pub total_checked: usize,
    /// Resources that drifted.
    pub drift_detected: usize,
    /// Resources that could not be checked.
    pub errors: usize,
    /// One result per resource, in declaration order.
    pub results: Vec<DriftResult>,
}

impl DriftDetector {
    /// Default time between periodic checks.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

    /// Creates a detector around a planner.
    #[must_use]
    pub fn new(planner: Planner) -> Self {
        Self {
            planner,
            emitter: noop(),
            interval: Self::DEFAULT_INTERVAL,
        }
    }

    /// Creates a detector whose watch interval comes from settings.
    #[must_use]
    pub fn from_settings(planner: Planner, settings: &DriftSettings) -> Self {
        Self::new(planner).with_interval(settings.interval())
    }

    /// Sets the event emitter.
    #[must_use]
    pub fn with_emitter(mut self, emitter: SharedEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Sets the interval used by [`Self::watch`].
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Checks a module for drift.
    ///
    /// # Errors
    ///
    /// Returns an error if the module could not be planned at all. Failures
    /// to read single resources are reported in the result instead.
    pub async fn check_drift(&self, ctx: &CancellationToken, module: &Module) -> Result<DriftReport> {
        info!("Checking drift for module {}", module.name);

        let plan = self.planner.create_plan(ctx, module).await.map_err(|e| {
            KeelError::Drift(DriftError::CheckFailed {
                module: module.name.clone(),
                reason: e.to_string(),
            })
        })?;

        let results: Vec<DriftResult> = plan
            .entries
            .iter()
            .map(|diff| DriftResult {
                id: diff.id.clone(),
                has_drift: diff.is_actionable(),
                action: diff.action,
                changes: if diff.is_error() { Vec::new() } else { diff.changes.clone() },
                error: diff.error.as_ref().map(|e| e.message.clone()),
            })
            .collect();

        for drifted in results.iter().filter(|r| r.has_drift) {
            debug!("{} drifted: {} needed", drifted.id, drifted.action);
            emit_best_effort(
                self.emitter.as_ref(),
                &Event::DriftDetected {
                    id: drifted.id.clone(),
                    action: drifted.action,
                    changes: drifted.changes.clone(),
                },
            );
        }

        let report = DriftReport {
            module: plan.module,
            module_hash: plan.module_hash,
            checked_at: Utc::now(),
            total_checked: results.len(),
            drift_detected: results.iter().filter(|r| r.has_drift).count(),
            errors: results.iter().filter(|r| r.error.is_some()).count(),
            results,
        };

        if report.has_drift() {
            warn!(
                "Module {}: {} of {} resources drifted",
                report.module, report.drift_detected, report.total_checked
            );
        } else {
            info!("Module {} has no drift", report.module);
        }

        Ok(report)
    }

    /// Checks a module on a fixed interval, sending each report to `sink`.
    ///
    /// The first check runs immediately. A failed check is logged and the
    /// next one runs on schedule. Returns when `ctx` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`DriftError::SinkClosed`] if the receiver is dropped, or a
    /// configuration error if the interval is zero.
    pub async fn watch(
        &self,
        ctx: &CancellationToken,
        module: &Module,
        sink: mpsc::Sender<DriftReport>,
    ) -> Result<()> {
        if self.interval.is_zero() {
            return Err(ConfigError::validation(
                "Drift interval must be greater than zero",
                "drift.interval_secs",
            )
            .into());
        }
        info!(
            "Watching module {} for drift every {:?}",
            module.name, self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = match self.check_drift(ctx, module).await {
                Ok(report) => report,
                Err(e) => {
                    if ctx.is_cancelled() {
                        break;
                    }
                    warn!("Drift check failed: {e}");
                    continue;
                }
            };

            tokio::select! {
                biased;
                () = ctx.cancelled() => break,
                sent = sink.send(report) => {
                    if sent.is_err() {
                        warn!("Drift report receiver closed, stopping watch");
                        return Err(DriftError::SinkClosed.into());
                    }
                }
            }
        }

        debug!("Drift watch for {} stopped", module.name);
        Ok(())
    }
}

impl std::fmt::Debug for DriftDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftDetector")
            .field("planner", &self.planner)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl DriftReport {
    /// Returns true if any resource drifted.
    #[must_use]
    pub const fn has_drift(&self) -> bool {
        self.drift_detected > 0
    }

    /// Resources that drifted.
    pub fn drifted(&self) -> impl Iterator<Item = &DriftResult> {
        self.results.iter().filter(|r| r.has_drift)
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_drift() {
            writeln!(
                f,
                "Drift detected in {} ({} of {} resources):",
                self.module, self.drift_detected, self.total_checked
            )?;
            for result in self.drifted() {
                writeln!(f, "  - {} ({})", result.id, result.action)?;
            }
        } else {
            writeln!(f, "No drift detected in {}", self.module)?;
        }

        if self.errors > 0 {
            writeln!(f, "  {} resources could not be checked", self.errors)?;
        }
        Ok(())
    }
}
