use crate::backoff::ReconnectBackoff;
use crate::scrollback::RenderSink;
use crate::session::{
    AttemptId, SessionAction, SessionNotice, SessionState, SessionTarget, StreamSession,
};
use crate::transport::{stream_url, Connector, Transport, TransportClose, TransportEvent};
use futures_util::future::BoxFuture;
use lattice_core::stream_protocol::Viewport;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const COMMAND_QUEUE_CAPACITY: usize = 256;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one spawned session. Two sessions to the same target differ.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub backoff: ReconnectBackoff,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: ReconnectBackoff::default(),
            ping_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn session_for(&self, target: SessionTarget, viewport: Viewport) -> StreamSession {
        StreamSession::new(target, self.backoff.clone(), viewport)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionCommand {
    Input(String),
    Resize { cols: u16, rows: u16 },
    Reconnect,
}

/// Snapshot of a running session, published after every transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub reconnect_attempt: u32,
    pub fatal: bool,
    pub disposed: bool,
    pub session_token: Option<String>,
    pub last_log_id: Option<i64>,
}

impl SessionStatus {
    fn of(session: &StreamSession) -> Self {
        Self {
            state: session.state(),
            reconnect_attempt: session.reconnect_attempt(),
            fatal: session.is_fatal(),
            disposed: session.is_disposed(),
            session_token: session.session_token().map(str::to_string),
            last_log_id: session.last_log_id(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub session: SessionId,
    pub target: SessionTarget,
    pub notice: SessionNotice,
}

/// Owner side of a spawned session. Dropping the handle disposes the session.
pub struct SessionHandle {
    id: SessionId,
    target: SessionTarget,
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    status: watch::Receiver<SessionStatus>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn send_input(&self, data: impl Into<String>) -> bool {
        self.enqueue(SessionCommand::Input(data.into()))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        self.enqueue(SessionCommand::Resize { cols, rows })
    }

    pub fn reconnect(&self) -> bool {
        self.enqueue(SessionCommand::Reconnect)
    }

    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Waits for the session task to finish. Only returns after `dispose`.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(event = "session_task_failed", target = %self.target, error = %err);
            }
        }
    }

    fn enqueue(&self, command: SessionCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    event = "session_command_queue_drop",
                    reason = "queue_full",
                    target = %self.target,
                    capacity = COMMAND_QUEUE_CAPACITY
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event = "session_command_queue_drop", reason = "closed", target = %self.target);
                false
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs `session` on its own task. Output goes to `sink`; notices go to `reports`.
pub fn spawn_session<R>(
    session: StreamSession,
    master: Url,
    connector: Arc<dyn Connector>,
    sink: R,
    reports: mpsc::Sender<SessionReport>,
    config: &SessionConfig,
) -> SessionHandle
where
    R: RenderSink + 'static,
{
    let id = SessionId::next();
    let target = session.target().clone();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (status_tx, status_rx) = watch::channel(SessionStatus::of(&session));
    let cancel = CancellationToken::new();
    let driver = Driver {
        id,
        session,
        master,
        connector,
        sink,
        sink_released: false,
        reports,
        status: status_tx,
        connect_timeout: config.connect_timeout,
        pending: None,
        transport: None,
        reconnect_at: None,
    };
    let task = tokio::spawn(driver.run(command_rx, cancel.clone(), config.ping_interval));
    SessionHandle {
        id,
        target,
        commands: command_tx,
        cancel,
        status: status_rx,
        task: Some(task),
    }
}

type PendingConnect = (AttemptId, BoxFuture<'static, Result<Box<dyn Transport>, TransportClose>>);

struct Driver<R> {
    id: SessionId,
    session: StreamSession,
    master: Url,
    connector: Arc<dyn Connector>,
    sink: R,
    sink_released: bool,
    reports: mpsc::Sender<SessionReport>,
    status: watch::Sender<SessionStatus>,
    connect_timeout: Duration,
    pending: Option<PendingConnect>,
    transport: Option<(AttemptId, Box<dyn Transport>)>,
    reconnect_at: Option<Instant>,
}

impl<R: RenderSink> Driver<R> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        cancel: CancellationToken,
        ping_interval: Duration,
    ) {
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        let actions = self.session.start();
        self.apply(actions).await;

        while !self.session.is_disposed() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let actions = self.session.dispose();
                    self.apply(actions).await;
                }
                maybe_command = commands.recv(), if commands_open => {
                    let actions = match maybe_command {
                        Some(SessionCommand::Input(data)) => self.session.send_input(data),
                        Some(SessionCommand::Resize { cols, rows }) => self.session.resize(cols, rows),
                        Some(SessionCommand::Reconnect) => self.session.request_reconnect(),
                        None => {
                            commands_open = false;
                            Vec::new()
                        }
                    };
                    self.apply(actions).await;
                }
                (attempt, result) = await_connect(&mut self.pending) => {
                    self.pending = None;
                    self.on_connected(attempt, result).await;
                }
                (attempt, event) = next_transport_event(&mut self.transport) => {
                    let actions = match event {
                        TransportEvent::Frame(frame) => self.session.on_frame(attempt, frame),
                        TransportEvent::Closed(close) => {
                            self.transport = None;
                            self.session.on_transport_closed(attempt, close)
                        }
                    };
                    self.apply(actions).await;
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    let actions = self.session.on_reconnect_timer();
                    self.apply(actions).await;
                }
                _ = ping.tick() => {
                    let actions = self.session.keepalive();
                    self.apply(actions).await;
                }
            }
        }

        if !self.sink_released {
            self.sink.release();
            self.sink_released = true;
        }
        debug!(event = "session_task_exit", target = %self.session.target());
    }

    async fn on_connected(
        &mut self,
        attempt: AttemptId,
        result: Result<Box<dyn Transport>, TransportClose>,
    ) {
        match result {
            Ok(mut transport) => {
                if self.session.current_attempt() != Some(attempt) {
                    transport.close().await;
                    return;
                }
                self.transport = Some((attempt, transport));
                let actions = self.session.on_transport_open(attempt);
                self.apply(actions).await;
            }
            Err(close) => {
                let actions = self.session.on_transport_closed(attempt, close);
                self.apply(actions).await;
            }
        }
    }

    async fn apply(&mut self, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::Connect { attempt } => {
                    let url = match stream_url(&self.master, self.session.target(), self.session.viewport()) {
                        Ok(url) => url,
                        Err(err) => {
                            queue.extend(
                                self.session
                                    .on_transport_closed(attempt, TransportClose::Failed(err.to_string())),
                            );
                            continue;
                        }
                    };
                    debug!(event = "session_connect", url = %url, attempt = attempt.0);
                    let connector = Arc::clone(&self.connector);
                    let timeout = self.connect_timeout;
                    self.pending = Some((
                        attempt,
                        Box::pin(async move {
                            match tokio::time::timeout(timeout, connector.connect(&url)).await {
                                Ok(result) => result,
                                Err(_) => Err(TransportClose::TimedOut),
                            }
                        }),
                    ));
                }
                SessionAction::Send(frame) => {
                    let Some((attempt, transport)) = self.transport.as_mut() else {
                        debug!(event = "session_send_dropped", frame = ?frame);
                        continue;
                    };
                    let attempt = *attempt;
                    if let Err(close) = transport.send(&frame).await {
                        self.transport = None;
                        queue.extend(self.session.on_transport_closed(attempt, close));
                    }
                }
                SessionAction::CloseTransport => {
                    self.pending = None;
                    if let Some((_, mut transport)) = self.transport.take() {
                        transport.close().await;
                    }
                }
                SessionAction::ScheduleReconnect { delay } => {
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                SessionAction::CancelReconnect => {
                    self.reconnect_at = None;
                }
                SessionAction::Render(chunk) => {
                    if !self.sink_released {
                        self.sink.write(&chunk);
                    }
                }
                SessionAction::Notify(notice) => self.report(notice),
                SessionAction::ReleaseSink => {
                    if !self.sink_released {
                        self.sink.release();
                        self.sink_released = true;
                    }
                }
            }
        }
        self.status.send_replace(SessionStatus::of(&self.session));
    }

    fn report(&self, notice: SessionNotice) {
        info!(
            event = "session_notice",
            session = %self.id,
            target = %self.session.target(),
            notice = ?notice
        );
        let report = SessionReport {
            session: self.id,
            target: self.session.target().clone(),
            notice,
        };
        if let Err(mpsc::error::TrySendError::Full(report)) = self.reports.try_send(report) {
            warn!(
                event = "session_report_drop",
                reason = "queue_full",
                notice = ?report.notice
            );
        }
    }
}

async fn await_connect(
    pending: &mut Option<PendingConnect>,
) -> (AttemptId, Result<Box<dyn Transport>, TransportClose>) {
    match pending {
        Some((attempt, connect)) => {
            let result = connect.await;
            (*attempt, result)
        }
        None => std::future::pending().await,
    }
}

async fn next_transport_event(
    transport: &mut Option<(AttemptId, Box<dyn Transport>)>,
) -> (AttemptId, TransportEvent) {
    match transport {
        Some((attempt, transport)) => {
            let event = transport.next_event().await;
            (*attempt, event)
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
