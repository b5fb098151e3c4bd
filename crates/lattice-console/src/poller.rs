use crate::api::FleetApi;
use crate::error::ApiError;
use crate::scrollback::RenderSink;
use lattice_core::{Operation, ResourceSnapshot, SubjectRef};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifies one poller incarnation. Events carrying a retired scope are stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PollScope(pub u64);

#[derive(Clone, Debug, PartialEq)]
pub enum PollResult {
    Snapshot(ResourceSnapshot),
    Operations(Vec<Operation>),
    NotFound,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollEvent {
    pub scope: PollScope,
    pub subject: SubjectRef,
    pub result: PollResult,
}

#[derive(Clone, Debug)]
pub struct PollerOptions {
    pub interval: Duration,
    /// Also fetch the operation history, newest first, up to this many records.
    pub history_limit: Option<u32>,
}

/// Polls `subject` until `cancel` fires. The first tick runs immediately.
/// Nothing is sent once cancellation has been observed.
pub fn spawn_poller(
    api: Arc<dyn FleetApi>,
    subject: SubjectRef,
    scope: PollScope,
    options: PollerOptions,
    events: mpsc::Sender<PollEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                results = poll_once(api.as_ref(), &subject, options.history_limit) => results,
            };

            for result in results {
                if cancel.is_cancelled() {
                    break;
                }
                let event = PollEvent {
                    scope,
                    subject: subject.clone(),
                    result,
                };
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = events.send(event) => sent,
                };
                if sent.is_err() {
                    debug!(event = "poller_receiver_closed", subject = %subject);
                    return;
                }
            }
        }
        debug!(event = "poller_stopped", subject = %subject, scope = scope.0);
    })
}

async fn poll_once(
    api: &dyn FleetApi,
    subject: &SubjectRef,
    history_limit: Option<u32>,
) -> Vec<PollResult> {
    let mut results = Vec::with_capacity(2);
    match api.get_resource(subject).await {
        Ok(snapshot) => results.push(PollResult::Snapshot(snapshot)),
        Err(ApiError::NotFound(_)) => {
            results.push(PollResult::NotFound);
            return results;
        }
        Err(err) => {
            results.push(PollResult::Failed(err.to_string()));
            return results;
        }
    }
    if let Some(limit) = history_limit {
        match api.list_operations(subject, limit).await {
            Ok(operations) => results.push(PollResult::Operations(operations)),
            Err(ApiError::NotFound(_)) => results.push(PollResult::NotFound),
            Err(err) => results.push(PollResult::Failed(err.to_string())),
        }
    }
    results
}

/// Polling fallback for node logs when the push stream is refused. Resumes after
/// `since_id` and returns the final cursor once cancelled.
pub fn spawn_log_tail<R>(
    api: Arc<dyn FleetApi>,
    node_id: String,
    since_id: Option<i64>,
    interval: Duration,
    limit: u32,
    mut sink: R,
    cancel: CancellationToken,
) -> JoinHandle<Option<i64>>
where
    R: RenderSink + 'static,
{
    tokio::spawn(async move {
        let mut cursor = since_id;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                page = api.node_logs(&node_id, cursor, limit) => page,
            };
            match page {
                Ok(page) => {
                    for entry in page.items {
                        if cursor.is_some_and(|last| entry.id <= last) {
                            continue;
                        }
                        cursor = Some(entry.id);
                        sink.write(&format!("{}\n", entry.render_line()));
                    }
                    if let Some(next) = page.next_since_id {
                        if cursor.map_or(true, |last| next > last) {
                            cursor = Some(next);
                        }
                    }
                }
                Err(err) => {
                    warn!(event = "log_tail_poll_failed", node_id = %node_id, error = %err);
                }
            }
        }
        sink.release();
        cursor
    })
}
