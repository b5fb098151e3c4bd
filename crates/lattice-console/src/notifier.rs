use lattice_core::{Operation, OperationKind, OperationStatus, ResourceSnapshot, SubjectRef};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const RESOLVED_MEMORY: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Pending,
    Info,
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
    pub persistent: bool,
}

impl Notice {
    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Pending,
            message: message.into(),
            persistent: true,
        }
    }

    pub fn info(message: impl Into<String>, persistent: bool) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
            persistent,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Success,
            message: message.into(),
            persistent: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            persistent: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NoticeHandle(pub u64);

/// Presentation primitive for operator-visible notices.
pub trait NotificationSink {
    fn open(&mut self, notice: Notice) -> NoticeHandle;
    /// Replaces the notice behind `handle`. Applying the same update twice is harmless.
    fn update(&mut self, handle: NoticeHandle, notice: Notice);
}

pub trait Navigator {
    /// Move the operator away from a subject that no longer exists.
    fn leave_subject(&mut self, subject: &SubjectRef);
}

#[derive(Clone, Debug)]
pub struct NotifierConfig {
    pub watchdog: Duration,
    /// Consecutive not-found polls required before a delete counts as done.
    pub delete_confirmations: u32,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(300),
            delete_confirmations: 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackedEntry {
    pub operation_id: String,
    pub subject: SubjectRef,
    pub kind: OperationKind,
    pub handle: NoticeHandle,
    pub created_at: Instant,
    pub watch_deadline: Instant,
    pub status: OperationStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Registration {
    /// No operation to watch; an acknowledgement was shown.
    Accepted,
    Tracking(NoticeHandle),
    AlreadyTracked,
    Succeeded,
    Failed,
    /// The operation id was already resolved earlier.
    Stale,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed(Option<String>),
    SubjectGone,
    TimedOut,
}

pub struct OperationNotifier<S, N> {
    sink: S,
    navigator: N,
    config: NotifierConfig,
    entries: HashMap<String, TrackedEntry>,
    missing_streaks: HashMap<SubjectRef, u32>,
    resolved_order: VecDeque<String>,
    resolved: HashSet<String>,
    navigated_order: VecDeque<SubjectRef>,
    navigated: HashSet<SubjectRef>,
}

impl<S: NotificationSink, N: Navigator> OperationNotifier<S, N> {
    pub fn new(sink: S, navigator: N, config: NotifierConfig) -> Self {
        Self {
            sink,
            navigator,
            config,
            entries: HashMap::new(),
            missing_streaks: HashMap::new(),
            resolved_order: VecDeque::with_capacity(RESOLVED_MEMORY),
            resolved: HashSet::new(),
            navigated_order: VecDeque::new(),
            navigated: HashSet::new(),
        }
    }

    pub fn register(
        &mut self,
        subject: &SubjectRef,
        fallback_kind: OperationKind,
        operation: Option<&Operation>,
        now: Instant,
    ) -> Registration {
        let Some(operation) = operation else {
            self.sink.open(Notice::info(
                format!("{} requested for {subject}", capitalize(fallback_kind.as_str())),
                false,
            ));
            info!(event = "action_accepted", subject = %subject, kind = %fallback_kind);
            return Registration::Accepted;
        };

        if self.resolved.contains(&operation.id) {
            debug!(event = "stale_registration", operation_id = %operation.id);
            return Registration::Stale;
        }
        let kind = effective_kind(operation.kind, fallback_kind);
        if kind == OperationKind::Delete && !self.entries.contains_key(&operation.id) {
            // A fresh delete of a re-created subject may navigate again.
            self.forget_navigation(subject);
        }

        if operation.status.is_in_flight() {
            if self.entries.contains_key(&operation.id) {
                return Registration::AlreadyTracked;
            }
            let handle = self
                .sink
                .open(Notice::pending(pending_message(kind, subject, operation.status)));
            self.entries.insert(
                operation.id.clone(),
                TrackedEntry {
                    operation_id: operation.id.clone(),
                    subject: subject.clone(),
                    kind,
                    handle,
                    created_at: now,
                    watch_deadline: now + self.config.watchdog,
                    status: operation.status,
                },
            );
            info!(
                event = "operation_tracked",
                operation_id = %operation.id,
                subject = %subject,
                kind = %kind,
                status = %operation.status
            );
            return Registration::Tracking(handle);
        }

        let outcome = terminal_outcome(operation);
        let registration = match outcome {
            Outcome::Succeeded => Registration::Succeeded,
            _ => Registration::Failed,
        };
        if self.entries.contains_key(&operation.id) {
            self.resolve(&operation.id, outcome);
        } else {
            let notice = outcome_notice(kind, subject, &outcome);
            self.sink.open(notice);
            self.remember_resolved(&operation.id);
            if kind == OperationKind::Delete && outcome == Outcome::Succeeded {
                self.navigate_once(subject);
            }
        }
        registration
    }

    /// Applies the latest observed operations for `subject`. Returns how many entries resolved.
    pub fn reconcile(&mut self, subject: &SubjectRef, observed: &[Operation], now: Instant) -> usize {
        let mut resolved = 0;
        for operation in observed {
            if self.resolved.contains(&operation.id) {
                continue;
            }
            let Some(entry) = self.entries.get_mut(&operation.id) else {
                continue;
            };
            if operation.status.is_terminal() {
                self.resolve(&operation.id, terminal_outcome(operation));
                resolved += 1;
            } else if entry.status.can_advance_to(operation.status) {
                entry.status = operation.status;
                let notice = Notice::pending(pending_message(entry.kind, &entry.subject, entry.status));
                self.sink.update(entry.handle, notice);
                debug!(
                    event = "operation_progress",
                    operation_id = %operation.id,
                    status = %operation.status
                );
            }
        }
        if resolved > 0 {
            debug!(event = "reconciled", subject = %subject, resolved, at = ?now);
        }
        resolved
    }

    pub fn observe_snapshot(
        &mut self,
        subject: &SubjectRef,
        snapshot: &ResourceSnapshot,
        now: Instant,
    ) -> usize {
        self.subject_present(subject);
        match snapshot.last_operation.as_ref() {
            Some(operation) => self.reconcile(subject, std::slice::from_ref(operation), now),
            None => 0,
        }
    }

    pub fn subject_present(&mut self, subject: &SubjectRef) {
        self.missing_streaks.remove(subject);
    }

    /// A not-found poll result. Only resolves tracked deletes, and only after the
    /// configured number of consecutive confirmations.
    pub fn subject_missing(&mut self, subject: &SubjectRef) -> usize {
        let streak = self.missing_streaks.entry(subject.clone()).or_insert(0);
        *streak += 1;
        let streak = *streak;
        if streak < self.config.delete_confirmations {
            debug!(event = "subject_missing", subject = %subject, streak);
            return 0;
        }

        let deletes: Vec<String> = self
            .entries
            .values()
            .filter(|entry| &entry.subject == subject && entry.kind == OperationKind::Delete)
            .map(|entry| entry.operation_id.clone())
            .collect();
        for operation_id in &deletes {
            self.resolve(operation_id, Outcome::SubjectGone);
        }
        deletes.len()
    }

    /// Network failures never resolve or drop entries.
    pub fn poll_failed(&mut self, subject: &SubjectRef, error: &str) {
        warn!(event = "poll_failed", subject = %subject, error = %error);
    }

    /// Fires the watchdog for every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.watch_deadline <= now)
            .map(|entry| entry.operation_id.clone())
            .collect();
        for operation_id in &expired {
            self.resolve(operation_id, Outcome::TimedOut);
        }
        expired.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.watch_deadline).min()
    }

    pub fn report_incident(&mut self, message: impl Into<String>) -> NoticeHandle {
        self.sink.open(Notice::error(message))
    }

    pub fn tracked_subjects(&self) -> BTreeSet<SubjectRef> {
        self.entries
            .values()
            .map(|entry| entry.subject.clone())
            .collect()
    }

    pub fn is_tracking(&self, operation_id: &str) -> bool {
        self.entries.contains_key(operation_id)
    }

    pub fn tracked_len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, operation_id: &str) -> Option<&TrackedEntry> {
        self.entries.get(operation_id)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn navigator(&self) -> &N {
        &self.navigator
    }

    fn resolve(&mut self, operation_id: &str, outcome: Outcome) {
        let Some(entry) = self.entries.remove(operation_id) else {
            return;
        };
        self.remember_resolved(operation_id);
        let notice = outcome_notice(entry.kind, &entry.subject, &outcome);
        self.sink.update(entry.handle, notice);
        info!(
            event = "operation_resolved",
            operation_id = %operation_id,
            subject = %entry.subject,
            kind = %entry.kind,
            outcome = ?outcome,
            tracked_for = ?entry.created_at.elapsed()
        );

        let deleted = entry.kind == OperationKind::Delete
            && matches!(outcome, Outcome::Succeeded | Outcome::SubjectGone);
        if deleted {
            self.navigate_once(&entry.subject);
        }
        if !self.entries.values().any(|other| other.subject == entry.subject) {
            self.missing_streaks.remove(&entry.subject);
        }
    }

    fn navigate_once(&mut self, subject: &SubjectRef) {
        if !self.navigated.insert(subject.clone()) {
            return;
        }
        self.navigated_order.push_back(subject.clone());
        while self.navigated_order.len() > RESOLVED_MEMORY {
            if let Some(oldest) = self.navigated_order.pop_front() {
                self.navigated.remove(&oldest);
            }
        }
        self.navigator.leave_subject(subject);
    }

    fn forget_navigation(&mut self, subject: &SubjectRef) {
        if self.navigated.remove(subject) {
            self.navigated_order.retain(|other| other != subject);
        }
    }

    fn remember_resolved(&mut self, operation_id: &str) {
        if !self.resolved.insert(operation_id.to_string()) {
            return;
        }
        self.resolved_order.push_back(operation_id.to_string());
        while self.resolved_order.len() > RESOLVED_MEMORY {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }
}

fn effective_kind(reported: OperationKind, fallback: OperationKind) -> OperationKind {
    if reported == OperationKind::Other {
        fallback
    } else {
        reported
    }
}

fn terminal_outcome(operation: &Operation) -> Outcome {
    match operation.status {
        OperationStatus::Failed => Outcome::Failed(operation.failure_detail().map(str::to_string)),
        _ => Outcome::Succeeded,
    }
}

fn pending_message(kind: OperationKind, subject: &SubjectRef, status: OperationStatus) -> String {
    format!("{} {subject} ({status})", kind.progress_label())
}

fn outcome_notice(kind: OperationKind, subject: &SubjectRef, outcome: &Outcome) -> Notice {
    match outcome {
        Outcome::Succeeded => Notice::success(format!("{subject} {}", kind.done_label())),
        Outcome::SubjectGone => Notice::success(format!("{subject} deleted")),
        Outcome::Failed(Some(detail)) => {
            Notice::error(format!("Failed to {} {subject}: {detail}", kind.as_str()))
        }
        Outcome::Failed(None) => Notice::error(format!("Failed to {} {subject}", kind.as_str())),
        Outcome::TimedOut => Notice::info(
            format!(
                "{} {subject} is still in progress; check the operation history",
                kind.progress_label()
            ),
            true,
        ),
    }
}

fn capitalize(input: &str) -> String {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    Opened(NoticeHandle, Notice),
    Updated(NoticeHandle, Notice),
}

/// In-memory sink that records every call, in order.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    next_handle: u64,
    pub events: Vec<SinkEvent>,
}

impl RecordingSink {
    pub fn notices(&self) -> impl Iterator<Item = &Notice> {
        self.events.iter().map(|event| match event {
            SinkEvent::Opened(_, notice) | SinkEvent::Updated(_, notice) => notice,
        })
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.notices()
            .filter(|notice| notice.severity == severity)
            .count()
    }

    /// Notices that report a final result: success, failure, or timeout.
    pub fn outcomes(&self) -> usize {
        self.notices()
            .filter(|notice| notice.severity != Severity::Pending)
            .count()
    }

    pub fn last(&self) -> Option<&Notice> {
        self.notices().last()
    }
}

impl NotificationSink for RecordingSink {
    fn open(&mut self, notice: Notice) -> NoticeHandle {
        self.next_handle += 1;
        let handle = NoticeHandle(self.next_handle);
        self.events.push(SinkEvent::Opened(handle, notice));
        handle
    }

    fn update(&mut self, handle: NoticeHandle, notice: Notice) {
        self.events.push(SinkEvent::Updated(handle, notice));
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecordingNavigator {
    pub left: Vec<SubjectRef>,
}

impl Navigator for RecordingNavigator {
    fn leave_subject(&mut self, subject: &SubjectRef) {
        self.left.push(subject.clone());
    }
}
