use crate::api::FleetApi;
use crate::config::ConsoleConfig;
use crate::driver::{spawn_session, SessionConfig, SessionHandle, SessionId, SessionReport};
use crate::error::ApiError;
use crate::notifier::{Navigator, NotificationSink, OperationNotifier, Registration};
use crate::poller::{spawn_log_tail, spawn_poller, PollEvent, PollResult, PollScope, PollerOptions};
use crate::scrollback::RenderSink;
use crate::session::{SessionNotice, SessionTarget};
use crate::transport::Connector;
use lattice_core::stream_protocol::Viewport;
use lattice_core::{
    CreateVmRequest, Operation, OperationKind, ResourceSnapshot, SubjectKind, SubjectRef,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

const EVENT_QUEUE_CAPACITY: usize = 128;

#[derive(Clone, Debug)]
pub struct ConsoleOptions {
    pub master: Url,
    pub poll_interval: Duration,
    pub history_limit: u32,
    pub session: SessionConfig,
}

impl From<&ConsoleConfig> for ConsoleOptions {
    fn from(config: &ConsoleConfig) -> Self {
        Self {
            master: config.master_url.clone(),
            poll_interval: config.poll_interval,
            history_limit: config.history_limit,
            session: config.session(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConsoleEvent {
    /// A poll result was applied for this subject.
    Polled(SubjectRef),
    /// A poll result arrived from a retired poller and was dropped.
    Discarded(SubjectRef),
    Session(SessionReport),
    /// The watchdog resolved this many entries.
    Expired(usize),
}

struct ActivePoller {
    scope: PollScope,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Ties the notifier, the pollers that feed it and the streaming sessions together.
/// All state is mutated from the task that owns the console.
pub struct Console<S, N> {
    api: Arc<dyn FleetApi>,
    connector: Arc<dyn Connector>,
    notifier: OperationNotifier<S, N>,
    options: ConsoleOptions,
    poll_tx: mpsc::Sender<PollEvent>,
    poll_rx: mpsc::Receiver<PollEvent>,
    report_tx: mpsc::Sender<SessionReport>,
    report_rx: mpsc::Receiver<SessionReport>,
    pollers: HashMap<SubjectRef, ActivePoller>,
    mounted: BTreeSet<SubjectRef>,
    next_scope: u64,
    snapshots: HashMap<SubjectRef, ResourceSnapshot>,
    histories: HashMap<SubjectRef, Vec<Operation>>,
    incidents: HashSet<SessionId>,
}

impl<S: NotificationSink, N: Navigator> Console<S, N> {
    pub fn new(
        api: Arc<dyn FleetApi>,
        connector: Arc<dyn Connector>,
        notifier: OperationNotifier<S, N>,
        options: ConsoleOptions,
    ) -> Self {
        let (poll_tx, poll_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (report_tx, report_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            api,
            connector,
            notifier,
            options,
            poll_tx,
            poll_rx,
            report_tx,
            report_rx,
            pollers: HashMap::new(),
            mounted: BTreeSet::new(),
            next_scope: 0,
            snapshots: HashMap::new(),
            histories: HashMap::new(),
            incidents: HashSet::new(),
        }
    }

    pub fn notifier(&self) -> &OperationNotifier<S, N> {
        &self.notifier
    }

    pub fn api(&self) -> Arc<dyn FleetApi> {
        Arc::clone(&self.api)
    }

    pub fn snapshot(&self, subject: &SubjectRef) -> Option<&ResourceSnapshot> {
        self.snapshots.get(subject)
    }

    pub fn history(&self, subject: &SubjectRef) -> Option<&[Operation]> {
        self.histories.get(subject).map(Vec::as_slice)
    }

    /// Subjects with a live poller, mounted or tracked.
    pub fn polled_subjects(&self) -> BTreeSet<SubjectRef> {
        self.pollers.keys().cloned().collect()
    }

    /// Invokes an action and hands the response to the notifier. Failures are
    /// surfaced once through the sink and returned.
    pub async fn invoke(
        &mut self,
        subject: &SubjectRef,
        kind: OperationKind,
    ) -> Result<Registration, ApiError> {
        info!(event = "action_invoke", subject = %subject, kind = %kind);
        match self.api.invoke_action(subject, kind).await {
            Ok(response) => {
                let registration =
                    self.notifier
                        .register(subject, kind, response.operation.as_ref(), Instant::now());
                if let Some(snapshot) = response.resource {
                    self.snapshots.insert(subject.clone(), snapshot);
                }
                self.sync_pollers();
                Ok(registration)
            }
            Err(err) => {
                self.notifier.report_incident(err.operator_message());
                Err(err)
            }
        }
    }

    pub async fn create_vm(
        &mut self,
        node_id: &str,
        request: &CreateVmRequest,
    ) -> Result<(SubjectRef, Registration), ApiError> {
        info!(event = "vm_create", node_id, name = %request.name);
        let response = match self.api.create_vm(node_id, request).await {
            Ok(response) => response,
            Err(err) => {
                self.notifier.report_incident(err.operator_message());
                return Err(err);
            }
        };
        let vm_id = response
            .resource
            .as_ref()
            .map(|vm| vm.id.clone())
            .or_else(|| response.operation.as_ref().and_then(|op| op.subject_id.clone()));
        let Some(vm_id) = vm_id else {
            let err = ApiError::Decode("create response did not name the new vm".to_string());
            self.notifier.report_incident(err.operator_message());
            return Err(err);
        };
        let subject = SubjectRef::vm(node_id, vm_id);
        let registration = self.notifier.register(
            &subject,
            OperationKind::Create,
            response.operation.as_ref(),
            Instant::now(),
        );
        if let Some(snapshot) = response.resource {
            self.snapshots.insert(subject.clone(), snapshot);
        }
        self.sync_pollers();
        Ok((subject, registration))
    }

    /// Keeps a subject polled for as long as a view of it is shown.
    pub fn mount_view(&mut self, subject: SubjectRef) {
        self.mounted.insert(subject);
        self.sync_pollers();
    }

    pub fn unmount_view(&mut self, subject: &SubjectRef) {
        self.mounted.remove(subject);
        self.sync_pollers();
    }

    /// One poller per mounted or tracked subject; retired pollers are cancelled.
    pub fn sync_pollers(&mut self) {
        let mut wanted = self.notifier.tracked_subjects();
        wanted.extend(self.mounted.iter().cloned());

        let retired: Vec<SubjectRef> = self
            .pollers
            .keys()
            .filter(|subject| !wanted.contains(*subject))
            .cloned()
            .collect();
        for subject in retired {
            if let Some(poller) = self.pollers.remove(&subject) {
                poller.cancel.cancel();
                debug!(event = "poller_retired", subject = %subject, scope = poller.scope.0);
            }
            self.snapshots.remove(&subject);
            self.histories.remove(&subject);
        }

        for subject in wanted {
            if self.pollers.contains_key(&subject) {
                continue;
            }
            self.next_scope += 1;
            let scope = PollScope(self.next_scope);
            let cancel = CancellationToken::new();
            let task = spawn_poller(
                Arc::clone(&self.api),
                subject.clone(),
                scope,
                PollerOptions {
                    interval: self.options.poll_interval,
                    // Nodes have no operation history endpoint.
                    history_limit: (subject.kind != SubjectKind::Node)
                        .then_some(self.options.history_limit),
                },
                self.poll_tx.clone(),
                cancel.clone(),
            );
            debug!(event = "poller_started", subject = %subject, scope = scope.0);
            self.pollers.insert(subject, ActivePoller { scope, cancel, task });
        }
    }

    /// Applies a poll result. Returns false when it came from a retired poller.
    pub fn handle_poll(&mut self, event: PollEvent) -> bool {
        let live = self
            .pollers
            .get(&event.subject)
            .is_some_and(|poller| poller.scope == event.scope);
        if !live {
            debug!(event = "poll_event_discarded", subject = %event.subject, scope = event.scope.0);
            return false;
        }

        let now = Instant::now();
        let subject = event.subject;
        match event.result {
            PollResult::Snapshot(snapshot) => {
                self.notifier.observe_snapshot(&subject, &snapshot, now);
                self.snapshots.insert(subject.clone(), snapshot);
            }
            PollResult::Operations(operations) => {
                self.notifier.reconcile(&subject, &operations, now);
                self.histories.insert(subject.clone(), operations);
            }
            PollResult::NotFound => {
                self.notifier.subject_missing(&subject);
                self.snapshots.remove(&subject);
            }
            PollResult::Failed(error) => self.notifier.poll_failed(&subject, &error),
        }
        self.sync_pollers();
        true
    }

    /// Only a fatal notice reaches the sink, once per session until it recovers.
    pub fn handle_session_report(&mut self, report: &SessionReport) {
        match &report.notice {
            SessionNotice::Fatal { message, .. } => {
                if self.incidents.insert(report.session) {
                    self.notifier
                        .report_incident(format!("{}: {message}", report.target.subject));
                }
            }
            SessionNotice::Restored => {
                self.incidents.remove(&report.session);
            }
            other => {
                debug!(event = "session_report", target = %report.target, notice = ?other);
            }
        }
    }

    pub fn open_session<R>(
        &self,
        target: SessionTarget,
        viewport: Viewport,
        startup_input: Option<String>,
        log_cursor: Option<i64>,
        sink: R,
    ) -> SessionHandle
    where
        R: RenderSink + 'static,
    {
        let mut session = self
            .options
            .session
            .session_for(target, viewport)
            .with_log_cursor(log_cursor);
        if let Some(input) = startup_input {
            session = session.with_startup_input(input);
        }
        spawn_session(
            session,
            self.options.master.clone(),
            Arc::clone(&self.connector),
            sink,
            self.report_tx.clone(),
            &self.options.session,
        )
    }

    /// Polling fallback for a node log stream that the master refused.
    pub fn start_log_tail<R>(
        &self,
        node_id: &str,
        since_id: Option<i64>,
        sink: R,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<i64>>
    where
        R: RenderSink + 'static,
    {
        info!(event = "log_tail_fallback", node_id, since_id = ?since_id);
        spawn_log_tail(
            Arc::clone(&self.api),
            node_id.to_string(),
            since_id,
            self.options.poll_interval,
            self.options.history_limit,
            sink,
            cancel,
        )
    }

    /// Waits for the next poll result, session report, or watchdog deadline and
    /// applies it.
    pub async fn pump(&mut self) -> ConsoleEvent {
        let deadline = self.notifier.next_deadline();
        tokio::select! {
            biased;
            _ = sleep_until_opt(deadline) => {
                let expired = self.notifier.expire(Instant::now());
                self.sync_pollers();
                ConsoleEvent::Expired(expired)
            }
            Some(report) = self.report_rx.recv() => {
                self.handle_session_report(&report);
                ConsoleEvent::Session(report)
            }
            Some(event) = self.poll_rx.recv() => {
                let subject = event.subject.clone();
                if self.handle_poll(event) {
                    ConsoleEvent::Polled(subject)
                } else {
                    ConsoleEvent::Discarded(subject)
                }
            }
        }
    }

    /// Pumps until nothing is tracked any more.
    pub async fn run_until_settled(&mut self) {
        while self.notifier.tracked_len() > 0 {
            self.pump().await;
        }
    }

    pub async fn shutdown(&mut self) {
        self.mounted.clear();
        for (_, poller) in self.pollers.drain() {
            poller.cancel.cancel();
            let _ = poller.task.await;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{NotifierConfig, RecordingNavigator, RecordingSink, Severity};
    use crate::scrollback::Scrollback;
    use crate::transport::{Transport, TransportClose};
    use async_trait::async_trait;
    use lattice_core::{ActionResponse, LogPage};

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _url: &Url) -> Result<Box<dyn Transport>, TransportClose> {
            Err(TransportClose::Rejected { status: 404 })
        }
    }

    struct ConflictApi;

    #[async_trait]
    impl FleetApi for ConflictApi {
        async fn get_resource(&self, _subject: &SubjectRef) -> Result<ResourceSnapshot, ApiError> {
            Err(ApiError::Transport("offline".to_string()))
        }

        async fn list_operations(
            &self,
            _subject: &SubjectRef,
            _limit: u32,
        ) -> Result<Vec<Operation>, ApiError> {
            Ok(Vec::new())
        }

        async fn invoke_action(
            &self,
            _subject: &SubjectRef,
            _kind: OperationKind,
        ) -> Result<ActionResponse, ApiError> {
            Err(ApiError::Rejected {
                status: 409,
                message: "vm is already running".to_string(),
            })
        }

        async fn create_vm(
            &self,
            _node_id: &str,
            _request: &CreateVmRequest,
        ) -> Result<ActionResponse, ApiError> {
            Ok(ActionResponse::default())
        }

        async fn node_logs(
            &self,
            _node_id: &str,
            _since_id: Option<i64>,
            _limit: u32,
        ) -> Result<LogPage, ApiError> {
            Ok(LogPage::default())
        }
    }

    fn console() -> Console<RecordingSink, RecordingNavigator> {
        Console::new(
            Arc::new(ConflictApi),
            Arc::new(RefusingConnector),
            OperationNotifier::new(
                RecordingSink::default(),
                RecordingNavigator::default(),
                NotifierConfig::default(),
            ),
            ConsoleOptions {
                master: Url::parse("http://master.test").expect("url"),
                poll_interval: Duration::from_secs(1),
                history_limit: 20,
                session: SessionConfig::default(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_action_surfaces_server_text_once() {
        let mut console = console();
        let subject = SubjectRef::vm("node-a", "vm-1");
        let err = console
            .invoke(&subject, OperationKind::Start)
            .await
            .expect_err("conflict");
        assert!(matches!(err, ApiError::Rejected { status: 409, .. }));
        let sink = console.notifier().sink();
        assert_eq!(sink.count(Severity::Error), 1);
        assert_eq!(
            sink.last().map(|notice| notice.message.as_str()),
            Some("vm is already running")
        );
        assert!(console.polled_subjects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_retired_pollers_are_discarded() {
        let mut console = console();
        let subject = SubjectRef::vm("node-a", "vm-1");
        console.mount_view(subject.clone());
        let stale = PollEvent {
            scope: PollScope(99),
            subject: subject.clone(),
            result: PollResult::NotFound,
        };
        assert!(!console.handle_poll(stale));

        console.unmount_view(&subject);
        assert!(console.polled_subjects().is_empty());
        let late = PollEvent {
            scope: PollScope(1),
            subject,
            result: PollResult::NotFound,
        };
        assert!(!console.handle_poll(late));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failures_leave_state_untouched() {
        let mut console = console();
        let subject = SubjectRef::vm("node-a", "vm-1");
        console.mount_view(subject.clone());
        let event = console.pump().await;
        assert_eq!(event, ConsoleEvent::Polled(subject.clone()));
        assert!(console.snapshot(&subject).is_none());
        assert_eq!(console.notifier().sink().events.len(), 0);
        console.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_session_report_becomes_one_incident() {
        let mut console = console();
        let target = SessionTarget::terminal(SubjectRef::vm("node-a", "vm-1"));
        let handle = console.open_session(
            target.clone(),
            Viewport::default(),
            None,
            None,
            Scrollback::new(10),
        );

        let event = console.pump().await;
        let ConsoleEvent::Session(report) = event else {
            panic!("expected a session report, got {event:?}");
        };
        assert_eq!(report.target, target);
        assert!(matches!(report.notice, SessionNotice::Fatal { ref code, .. } if code == "http_404"));
        console.handle_session_report(&report);
        assert_eq!(console.notifier().sink().count(Severity::Error), 1);

        handle.dispose();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn each_session_to_a_target_reports_its_own_fatal() {
        let mut console = console();
        let target = SessionTarget::terminal(SubjectRef::vm("node-a", "vm-1"));
        let mut sessions = Vec::new();
        for _ in 0..2 {
            let handle = console.open_session(
                target.clone(),
                Viewport::default(),
                None,
                None,
                Scrollback::new(10),
            );
            let event = console.pump().await;
            let ConsoleEvent::Session(report) = event else {
                panic!("expected a session report, got {event:?}");
            };
            assert_eq!(report.session, handle.id());
            // A repeated report for the same session stays silent.
            console.handle_session_report(&report);
            handle.dispose();
            handle.join().await;
            sessions.push(report.session);
        }

        assert_ne!(sessions[0], sessions[1]);
        assert_eq!(console.notifier().sink().count(Severity::Error), 2);
    }
}
