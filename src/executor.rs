//! Crash-recoverable step executor.
//!
//! A step is one cloud mutation identified by a stable key. Its progress lives in
//! the persisted step handle table, never only in memory:
//!
//! - no handle: record an `Issuing` intent, persist it, then send the mutation
//! - `Issuing`: a previous attempt may or may not have reached AWS; look for it in
//!   the update history before sending anything
//! - `InProgress`: poll once
//! - `Succeeded` / `Failed`: nothing to do
//!
//! The mutation is never sent for a key whose handle is `InProgress` or
//! `Succeeded`.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

use crate::crd::{StepHandle, StepState};
use crate::error;

/// Allowance for clock skew between the operator and AWS when matching
/// an `Issuing` intent against update creation times.
pub const CLOCK_SKEW: TimeDelta = TimeDelta::seconds(60);

/// How long an `Issuing` intent with no matching update is kept before it is
/// discarded and the mutation is sent again.
pub const ISSUE_GRACE: TimeDelta = TimeDelta::minutes(2);

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Running,
    Succeeded,
    Failed(String),
}

/// A cloud mutation with its status query.
#[async_trait]
pub trait StepOperation: Send + Sync {
    /// Start the mutation and return the provider's operation ID.
    async fn issue(&self) -> Result<String>;

    async fn poll(&self, operation_id: &str) -> Result<Progress>;

    /// Find an operation for this step started at or after `since`.
    async fn recover(&self, since: DateTime<Utc>) -> Result<Option<String>>;
}

/// Durable storage for the step handle table.
#[async_trait]
pub trait StepJournal: Send {
    async fn checkpoint(&mut self, handles: &BTreeMap<String, StepHandle>) -> Result<()>;
}

/// Advance one step by at most one cloud call (plus history lookup on recovery).
pub async fn advance(
    handles: &mut BTreeMap<String, StepHandle>,
    key: &str,
    timeout: TimeDelta,
    op: &dyn StepOperation,
    journal: &mut dyn StepJournal,
) -> Result<StepState> {
    let now = Utc::now();

    let Some(handle) = handles.get(key).cloned() else {
        handles.insert(key.to_string(), StepHandle::issuing(now, timeout));
        journal.checkpoint(handles).await?;
        return issue(handles, key, op, journal).await;
    };

    match handle.state {
        StepState::Succeeded | StepState::Failed => Ok(handle.state),
        StepState::Issuing => {
            let since = handle.started_at - CLOCK_SKEW;
            if let Some(operation_id) = op.recover(since).await? {
                info!("Step {} adopted existing operation {}", key, operation_id);
                return Ok(set(handles, key, |h| {
                    h.operation_id = Some(operation_id);
                    h.state = StepState::InProgress;
                }));
            }
            if now - handle.started_at < ISSUE_GRACE {
                // AWS may not list the update yet.
                return Ok(StepState::Issuing);
            }
            warn!(
                "Step {} intent from {} has no matching operation, issuing again",
                key,
                handle.started_at.to_rfc3339()
            );
            handles.insert(key.to_string(), StepHandle::issuing(now, timeout));
            journal.checkpoint(handles).await?;
            issue(handles, key, op, journal).await
        }
        StepState::InProgress => {
            let Some(operation_id) = handle.operation_id.as_deref() else {
                // Not produced by this executor; resolve through recovery.
                return Ok(set(handles, key, |h| h.state = StepState::Issuing));
            };
            let progress = match op.poll(operation_id).await {
                Ok(progress) => progress,
                Err(e) if now >= handle.deadline => {
                    warn!("Step {} past its deadline and poll failed: {:#}", key, e);
                    let elapsed = (now - handle.started_at).num_minutes();
                    return Ok(set(handles, key, |h| {
                        h.fail(
                            now,
                            format!(
                                "timed out after {elapsed} minutes (operation {operation_id}, last poll error: {e:#})"
                            ),
                        );
                    }));
                }
                Err(e) => return Err(e),
            };
            let state = match progress {
                Progress::Succeeded => set(handles, key, |h| h.succeed(now)),
                Progress::Failed(reason) => set(handles, key, |h| h.fail(now, reason)),
                Progress::Running if now >= handle.deadline => {
                    let elapsed = (now - handle.started_at).num_minutes();
                    set(handles, key, |h| {
                        h.fail(
                            now,
                            format!("timed out after {elapsed} minutes (operation {operation_id})"),
                        );
                    })
                }
                Progress::Running => StepState::InProgress,
            };
            Ok(state)
        }
    }
}

async fn issue(
    handles: &mut BTreeMap<String, StepHandle>,
    key: &str,
    op: &dyn StepOperation,
    journal: &mut dyn StepJournal,
) -> Result<StepState> {
    match op.issue().await {
        Ok(operation_id) => {
            info!("Step {} issued as operation {}", key, operation_id);
            Ok(set(handles, key, |h| {
                h.operation_id = Some(operation_id);
                h.state = StepState::InProgress;
            }))
        }
        Err(e) if error::find(&e).is_some_and(error::KuoError::is_rejection) => {
            // AWS refused the call, nothing was started.
            handles.remove(key);
            journal.checkpoint(handles).await?;
            Err(e)
        }
        // Outcome unknown: keep the intent for recovery.
        Err(e) => Err(e),
    }
}

fn set(
    handles: &mut BTreeMap<String, StepHandle>,
    key: &str,
    update: impl FnOnce(&mut StepHandle),
) -> StepState {
    handles.get_mut(key).map_or(StepState::Issuing, |h| {
        update(h);
        h.state
    })
}
