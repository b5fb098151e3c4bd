use crate::backoff::ReconnectBackoff;
use crate::transport::TransportClose;
use lattice_core::stream_protocol::{classify_error_code, ClientFrame, ErrorClass, ServerFrame, Viewport};
use lattice_core::{LogEntry, SubjectRef};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

const FATAL_REJECTION_STATUSES: &[u16] = &[401, 403, 404, 410];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamPurpose {
    Terminal,
    Logs,
}

impl StreamPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamPurpose::Terminal => "terminal",
            StreamPurpose::Logs => "logs",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionTarget {
    pub subject: SubjectRef,
    pub purpose: StreamPurpose,
}

impl SessionTarget {
    pub fn terminal(subject: SubjectRef) -> Self {
        Self {
            subject,
            purpose: StreamPurpose::Terminal,
        }
    }

    pub fn logs(subject: SubjectRef) -> Self {
        Self {
            subject,
            purpose: StreamPurpose::Logs,
        }
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.purpose.as_str(), self.subject)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    ClosedRetryable,
    ClosedTerminal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
}

/// Identifies one transport instance; events from older attempts are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttemptId(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionNotice {
    Reconnecting { attempt: u32, delay: Duration },
    Restored,
    /// Sent once per outage when the backoff ceiling is reached.
    StillReconnecting,
    Exited { code: Option<i32> },
    Ended,
    /// The push stream was refused; logs fall back to polling from `since_id`.
    Unavailable { status: u16, since_id: Option<i64> },
    Fatal { code: String, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionAction {
    Connect { attempt: AttemptId },
    Send(ClientFrame),
    CloseTransport,
    ScheduleReconnect { delay: Duration },
    CancelReconnect,
    Render(String),
    Notify(SessionNotice),
    ReleaseSink,
}

/// Transition function for one logical stream. Every input returns the side
/// effects the caller must perform, in order.
#[derive(Debug)]
pub struct StreamSession {
    target: SessionTarget,
    state: SessionState,
    backoff: ReconnectBackoff,
    viewport: Viewport,
    startup_input: Option<String>,
    session_token: Option<String>,
    transport: Option<AttemptId>,
    transport_open: bool,
    next_attempt: u64,
    reconnect_pending: bool,
    accepting_input: bool,
    fatal: bool,
    exited: bool,
    disposed: bool,
    disconnected: bool,
    ceiling_notified: bool,
    last_log_id: Option<i64>,
}

impl StreamSession {
    pub fn new(target: SessionTarget, backoff: ReconnectBackoff, viewport: Viewport) -> Self {
        Self {
            target,
            state: SessionState::Idle,
            backoff,
            viewport,
            startup_input: None,
            session_token: None,
            transport: None,
            transport_open: false,
            next_attempt: 0,
            reconnect_pending: false,
            accepting_input: true,
            fatal: false,
            exited: false,
            disposed: false,
            disconnected: false,
            ceiling_notified: false,
            last_log_id: None,
        }
    }

    /// Input sent right after every successful handshake, e.g. a carriage
    /// return that wakes a line-buffered serial console.
    pub fn with_startup_input(mut self, input: impl Into<String>) -> Self {
        self.startup_input = Some(input.into());
        self
    }

    /// Resume a log stream after the given id.
    pub fn with_log_cursor(mut self, since_id: Option<i64>) -> Self {
        self.last_log_id = since_id;
        self
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport_state(&self) -> TransportState {
        match (self.transport, self.state) {
            (Some(_), SessionState::Open) => TransportState::Open,
            (Some(_), _) => TransportState::Connecting,
            (None, _) => TransportState::Closed,
        }
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn current_attempt(&self) -> Option<AttemptId> {
        self.transport
    }

    pub fn last_log_id(&self) -> Option<i64> {
        self.last_log_id
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn start(&mut self) -> Vec<SessionAction> {
        if self.disposed || self.state != SessionState::Idle {
            return Vec::new();
        }
        self.begin_connect()
    }

    /// Manual escape hatch: reconnects from any state except disposed, fatal included.
    pub fn request_reconnect(&mut self) -> Vec<SessionAction> {
        if self.disposed {
            return Vec::new();
        }
        info!(event = "session_manual_reconnect", target = %self.target);
        self.fatal = false;
        self.exited = false;
        self.accepting_input = true;
        self.ceiling_notified = false;
        self.begin_connect()
    }

    pub fn on_transport_open(&mut self, attempt: AttemptId) -> Vec<SessionAction> {
        if !self.is_current(attempt) {
            return Vec::new();
        }
        self.transport_open = true;
        debug!(event = "session_transport_open", target = %self.target, attempt = attempt.0);
        Vec::new()
    }

    pub fn on_frame(&mut self, attempt: AttemptId, frame: ServerFrame) -> Vec<SessionAction> {
        if !self.is_current(attempt) {
            return Vec::new();
        }
        match frame {
            ServerFrame::Ready { session_id } => {
                if self.state != SessionState::Connecting {
                    return Vec::new();
                }
                self.complete_handshake(session_id)
            }
            ServerFrame::Data { data } => {
                if self.exited || data.is_empty() {
                    return Vec::new();
                }
                vec![SessionAction::Render(data)]
            }
            ServerFrame::Exit { exit_code } => {
                if self.exited {
                    return Vec::new();
                }
                self.exited = true;
                self.accepting_input = false;
                info!(event = "session_exit", target = %self.target, exit_code = ?exit_code);
                vec![SessionAction::Notify(SessionNotice::Exited { code: exit_code })]
            }
            ServerFrame::Error { error, message } => self.on_error_frame(error, message),
            ServerFrame::Snapshot {
                items,
                next_since_id,
            } => {
                let mut actions = Vec::new();
                if self.state == SessionState::Connecting {
                    actions.extend(self.complete_handshake(None));
                }
                actions.extend(self.render_log_items(items, next_since_id));
                actions
            }
            ServerFrame::Append {
                items,
                next_since_id,
            } => self.render_log_items(items, next_since_id),
            ServerFrame::Pong => Vec::new(),
        }
    }

    pub fn on_transport_closed(
        &mut self,
        attempt: AttemptId,
        close: TransportClose,
    ) -> Vec<SessionAction> {
        if !self.is_current(attempt) {
            return Vec::new();
        }
        self.transport = None;
        self.transport_open = false;
        if self.disposed || self.state == SessionState::ClosedTerminal {
            return Vec::new();
        }
        if self.exited {
            self.state = SessionState::ClosedTerminal;
            return vec![SessionAction::Notify(SessionNotice::Ended)];
        }

        match close {
            TransportClose::Clean => {
                info!(event = "session_closed_clean", target = %self.target);
                self.state = SessionState::ClosedTerminal;
                self.accepting_input = false;
                vec![SessionAction::Notify(SessionNotice::Ended)]
            }
            TransportClose::Rejected { status }
                if self.target.purpose == StreamPurpose::Logs
                    && FATAL_REJECTION_STATUSES.contains(&status) =>
            {
                warn!(event = "session_rejected", target = %self.target, status);
                self.state = SessionState::ClosedTerminal;
                vec![SessionAction::Notify(SessionNotice::Unavailable {
                    status,
                    since_id: self.last_log_id,
                })]
            }
            TransportClose::Rejected { status } if FATAL_REJECTION_STATUSES.contains(&status) => {
                self.enter_fatal(
                    format!("http_{status}"),
                    format!("Master refused the {} stream (HTTP {status})", self.target.purpose.as_str()),
                )
            }
            other => self.schedule_reconnect(other),
        }
    }

    pub fn on_reconnect_timer(&mut self) -> Vec<SessionAction> {
        if !self.reconnect_pending || self.disposed || self.state != SessionState::ClosedRetryable {
            return Vec::new();
        }
        self.reconnect_pending = false;
        self.begin_connect()
    }

    /// Input is only forwarded while open; anything else is dropped.
    pub fn send_input(&mut self, data: impl Into<String>) -> Vec<SessionAction> {
        if !self.accepting_input || self.state != SessionState::Open || !self.transport_open {
            return Vec::new();
        }
        let data = data.into();
        if data.is_empty() {
            return Vec::new();
        }
        vec![SessionAction::Send(ClientFrame::Input { data })]
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Vec<SessionAction> {
        let viewport = Viewport::new(cols, rows);
        if viewport == self.viewport {
            return Vec::new();
        }
        self.viewport = viewport;
        if self.target.purpose != StreamPurpose::Terminal
            || self.state != SessionState::Open
            || !self.accepting_input
        {
            return Vec::new();
        }
        vec![SessionAction::Send(viewport.resize_frame())]
    }

    pub fn keepalive(&mut self) -> Vec<SessionAction> {
        if self.disposed || !self.transport_open {
            return Vec::new();
        }
        vec![SessionAction::Send(ClientFrame::Ping)]
    }

    /// Idempotent teardown. Order: stop input, cancel the reconnect timer,
    /// say goodbye if open, close the transport, release the sink.
    pub fn dispose(&mut self) -> Vec<SessionAction> {
        if self.disposed {
            return Vec::new();
        }
        self.disposed = true;
        self.accepting_input = false;
        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(SessionAction::CancelReconnect);
        }
        if self.transport.take().is_some() {
            if self.transport_open {
                actions.push(SessionAction::Send(ClientFrame::Close));
            }
            actions.push(SessionAction::CloseTransport);
        }
        self.transport_open = false;
        self.state = SessionState::ClosedTerminal;
        actions.push(SessionAction::ReleaseSink);
        info!(event = "session_disposed", target = %self.target);
        actions
    }

    fn is_current(&self, attempt: AttemptId) -> bool {
        !self.disposed && self.transport == Some(attempt)
    }

    fn begin_connect(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(SessionAction::CancelReconnect);
        }
        if self.transport.take().is_some() {
            actions.push(SessionAction::CloseTransport);
        }
        self.transport_open = false;
        self.session_token = None;
        self.next_attempt += 1;
        let attempt = AttemptId(self.next_attempt);
        self.transport = Some(attempt);
        self.state = SessionState::Connecting;
        debug!(
            event = "session_connecting",
            target = %self.target,
            attempt = attempt.0,
            reconnect_attempt = self.backoff.attempt()
        );
        actions.push(SessionAction::Connect { attempt });
        actions
    }

    fn complete_handshake(&mut self, session_token: Option<String>) -> Vec<SessionAction> {
        self.state = SessionState::Open;
        self.session_token = session_token;
        self.backoff.reset();
        self.ceiling_notified = false;
        info!(
            event = "session_open",
            target = %self.target,
            session_token = ?self.session_token
        );

        let mut actions = Vec::new();
        if std::mem::take(&mut self.disconnected) {
            actions.push(SessionAction::Notify(SessionNotice::Restored));
        }
        if self.target.purpose == StreamPurpose::Terminal && self.accepting_input {
            actions.push(SessionAction::Send(self.viewport.resize_frame()));
            if let Some(input) = self.startup_input.clone() {
                actions.push(SessionAction::Send(ClientFrame::Input { data: input }));
            }
        }
        actions
    }

    fn on_error_frame(&mut self, code: String, message: Option<String>) -> Vec<SessionAction> {
        match classify_error_code(&code) {
            ErrorClass::Fatal => {
                let message = message.unwrap_or_else(|| describe_error_code(&code));
                self.enter_fatal(code, message)
            }
            ErrorClass::Message => {
                warn!(event = "session_message_rejected", target = %self.target, code = %code);
                Vec::new()
            }
            ErrorClass::Transient => {
                warn!(event = "session_transient_error", target = %self.target, code = %code);
                if self.exited || self.transport.take().is_none() {
                    return Vec::new();
                }
                self.transport_open = false;
                let mut actions = vec![SessionAction::CloseTransport];
                actions.extend(self.schedule_reconnect(TransportClose::Abnormal {
                    code: None,
                    reason: code,
                }));
                actions
            }
        }
    }

    fn enter_fatal(&mut self, code: String, message: String) -> Vec<SessionAction> {
        warn!(event = "session_fatal", target = %self.target, code = %code);
        self.fatal = true;
        self.accepting_input = false;
        self.state = SessionState::ClosedTerminal;
        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(SessionAction::CancelReconnect);
        }
        if self.transport.take().is_some() {
            actions.push(SessionAction::CloseTransport);
        }
        self.transport_open = false;
        actions.push(SessionAction::Notify(SessionNotice::Fatal { code, message }));
        actions
    }

    fn schedule_reconnect(&mut self, close: TransportClose) -> Vec<SessionAction> {
        self.state = SessionState::ClosedRetryable;
        self.disconnected = true;
        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempt();
        self.reconnect_pending = true;
        info!(
            event = "session_reconnect_scheduled",
            target = %self.target,
            close = ?close,
            attempt,
            delay_ms = delay.as_millis() as u64
        );
        let mut actions = vec![
            SessionAction::Notify(SessionNotice::Reconnecting { attempt, delay }),
            SessionAction::ScheduleReconnect { delay },
        ];
        if self.backoff.at_ceiling() && !self.ceiling_notified {
            self.ceiling_notified = true;
            actions.push(SessionAction::Notify(SessionNotice::StillReconnecting));
        }
        actions
    }

    fn render_log_items(
        &mut self,
        items: Vec<LogEntry>,
        next_since_id: Option<i64>,
    ) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        for entry in items {
            if self.last_log_id.is_some_and(|last| entry.id <= last) {
                continue;
            }
            self.last_log_id = Some(entry.id);
            actions.push(SessionAction::Render(format!("{}\n", entry.render_line())));
        }
        if let Some(cursor) = next_since_id {
            if self.last_log_id.map_or(true, |last| cursor > last) {
                self.last_log_id = Some(cursor);
            }
        }
        actions
    }
}

pub fn describe_error_code(code: &str) -> String {
    match code {
        "node_not_found" => "Node no longer exists".to_string(),
        "node_not_paired" => "Node is not paired with the master".to_string(),
        "vm_not_found" => "VM no longer exists".to_string(),
        "vm_domain_missing" => "VM has no hypervisor domain".to_string(),
        "container_not_found" => "Container no longer exists".to_string(),
        "capability_missing" => "Node does not support this stream".to_string(),
        "capability_not_ready" => "Node capability is not ready yet".to_string(),
        "session_closed" => "Session was closed by the node".to_string(),
        "unauthorized" => "Not authorized for this stream".to_string(),
        other => format!("Stream error: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ReconnectBackoff {
        ReconnectBackoff::new(Duration::from_millis(500), Duration::from_secs(8), 4)
    }

    fn terminal() -> StreamSession {
        StreamSession::new(
            SessionTarget::terminal(SubjectRef::vm("node-a", "vm-1")),
            backoff(),
            Viewport::new(100, 30),
        )
    }

    fn connect_attempt(actions: &[SessionAction]) -> AttemptId {
        actions
            .iter()
            .find_map(|action| match action {
                SessionAction::Connect { attempt } => Some(*attempt),
                _ => None,
            })
            .expect("connect action")
    }

    fn open(session: &mut StreamSession) -> AttemptId {
        let attempt = session
            .current_attempt()
            .expect("attempt in flight");
        session.on_transport_open(attempt);
        session.on_frame(
            attempt,
            ServerFrame::Ready {
                session_id: Some("tok".to_string()),
            },
        );
        attempt
    }

    fn abnormal() -> TransportClose {
        TransportClose::Abnormal {
            code: Some(1006),
            reason: String::new(),
        }
    }

    #[test]
    fn ready_opens_and_announces_viewport_and_startup_input() {
        let mut session = terminal().with_startup_input("\r");
        let attempt = connect_attempt(&session.start());
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.on_transport_open(attempt).is_empty());
        assert!(session.send_input("ls\n").is_empty());

        let actions = session.on_frame(
            attempt,
            ServerFrame::Ready {
                session_id: Some("abc".to_string()),
            },
        );
        assert_eq!(
            actions,
            vec![
                SessionAction::Send(ClientFrame::Resize { cols: 100, rows: 30 }),
                SessionAction::Send(ClientFrame::Input {
                    data: "\r".to_string()
                }),
            ]
        );
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.transport_state(), TransportState::Open);
        assert_eq!(session.session_token(), Some("abc"));
        assert_eq!(
            session.send_input("ls\n"),
            vec![SessionAction::Send(ClientFrame::Input {
                data: "ls\n".to_string()
            })]
        );
    }

    #[test]
    fn data_then_transient_close_schedules_base_delay_and_resets_on_reopen() {
        let mut session = terminal();
        session.start();
        let attempt = open(&mut session);
        for chunk in ["a", "b", "c"] {
            assert_eq!(
                session.on_frame(attempt, ServerFrame::Data { data: chunk.to_string() }),
                vec![SessionAction::Render(chunk.to_string())]
            );
        }

        let actions = session.on_transport_closed(attempt, abnormal());
        assert_eq!(
            actions,
            vec![
                SessionAction::Notify(SessionNotice::Reconnecting {
                    attempt: 1,
                    delay: Duration::from_millis(500)
                }),
                SessionAction::ScheduleReconnect {
                    delay: Duration::from_millis(500)
                },
            ]
        );
        assert_eq!(session.state(), SessionState::ClosedRetryable);
        assert_eq!(session.reconnect_attempt(), 1);
        assert!(session.send_input("x").is_empty());

        let reconnect = session.on_reconnect_timer();
        let next = connect_attempt(&reconnect);
        assert_ne!(next, attempt);
        session.on_transport_open(next);
        let actions = session.on_frame(next, ServerFrame::Ready { session_id: None });
        assert_eq!(actions[0], SessionAction::Notify(SessionNotice::Restored));
        assert_eq!(session.reconnect_attempt(), 0);
    }

    #[test]
    fn consecutive_failures_back_off_to_cap_and_notify_ceiling_once() {
        let mut session = terminal();
        session.start();
        let mut delays = Vec::new();
        let mut still = 0;
        for _ in 0..7 {
            let attempt = session.current_attempt().expect("attempt");
            let actions =
                session.on_transport_closed(attempt, TransportClose::Failed("refused".to_string()));
            for action in &actions {
                match action {
                    SessionAction::ScheduleReconnect { delay } => delays.push(delay.as_millis()),
                    SessionAction::Notify(SessionNotice::StillReconnecting) => still += 1,
                    _ => {}
                }
            }
            assert!(session.reconnect_attempt() <= 4);
            session.on_reconnect_timer();
        }
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
        assert_eq!(still, 1);
    }

    #[test]
    fn fatal_error_stops_reconnects_for_good() {
        let mut session = terminal();
        session.start();
        let attempt = open(&mut session);
        let actions = session.on_frame(
            attempt,
            ServerFrame::Error {
                error: "vm_not_found".to_string(),
                message: None,
            },
        );
        assert_eq!(
            actions,
            vec![
                SessionAction::CloseTransport,
                SessionAction::Notify(SessionNotice::Fatal {
                    code: "vm_not_found".to_string(),
                    message: "VM no longer exists".to_string(),
                }),
            ]
        );
        assert!(session.is_fatal());
        assert!(session.on_transport_closed(attempt, abnormal()).is_empty());
        assert!(session.on_reconnect_timer().is_empty());
        assert!(!session.reconnect_pending());
    }

    #[test]
    fn transient_error_frame_drops_transport_and_retries() {
        let mut session = terminal();
        session.start();
        let attempt = open(&mut session);
        let actions = session.on_frame(
            attempt,
            ServerFrame::Error {
                error: "Agent websocket disconnected".to_string(),
                message: None,
            },
        );
        assert_eq!(
            actions,
            vec![
                SessionAction::CloseTransport,
                SessionAction::Notify(SessionNotice::Reconnecting {
                    attempt: 1,
                    delay: Duration::from_millis(500)
                }),
                SessionAction::ScheduleReconnect {
                    delay: Duration::from_millis(500)
                },
            ]
        );
        assert_eq!(session.state(), SessionState::ClosedRetryable);
        assert!(session.reconnect_pending());
        assert!(!session.is_fatal());
        // The close that follows belongs to the dropped transport.
        assert!(session.on_transport_closed(attempt, abnormal()).is_empty());
        assert!(matches!(
            session.on_reconnect_timer().as_slice(),
            [SessionAction::Connect { .. }]
        ));
    }

    #[test]
    fn message_error_frame_keeps_session_open() {
        let mut session = terminal();
        session.start();
        let attempt = open(&mut session);
        let actions = session.on_frame(
            attempt,
            ServerFrame::Error {
                error: "invalid_payload".to_string(),
                message: None,
            },
        );
        assert!(actions.is_empty());
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.current_attempt(), Some(attempt));
    }

    #[test]
    fn clean_close_is_terminal() {
        let mut session = terminal();
        session.start();
        let attempt = open(&mut session);
        let actions = session.on_transport_closed(attempt, TransportClose::Clean);
        assert_eq!(actions, vec![SessionAction::Notify(SessionNotice::Ended)]);
        assert_eq!(session.state(), SessionState::ClosedTerminal);
        assert!(session.on_reconnect_timer().is_empty());
    }

    #[test]
    fn rejected_upgrade_is_fatal_for_terminal() {
        let mut session = terminal();
        let attempt = connect_attempt(&session.start());
        let actions = session.on_transport_closed(attempt, TransportClose::Rejected { status: 404 });
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::Notify(SessionNotice::Fatal { code, .. })] if code == "http_404"
        ));

        let mut session = terminal();
        let attempt = connect_attempt(&session.start());
        let actions = session.on_transport_closed(attempt, TransportClose::Rejected { status: 502 });
        assert!(matches!(
            actions.last(),
            Some(SessionAction::ScheduleReconnect { .. })
        ));
    }

    #[test]
    fn exit_ends_data_plane_without_closing() {
        let mut session = terminal();
        session.start();
        let attempt = open(&mut session);
        let actions = session.on_frame(attempt, ServerFrame::Exit { exit_code: Some(0) });
        assert_eq!(
            actions,
            vec![SessionAction::Notify(SessionNotice::Exited { code: Some(0) })]
        );
        assert_eq!(session.transport_state(), TransportState::Open);
        assert!(session
            .on_frame(attempt, ServerFrame::Data { data: "late".to_string() })
            .is_empty());
        assert!(session.send_input("x").is_empty());
        assert_eq!(
            session.on_transport_closed(attempt, abnormal()),
            vec![SessionAction::Notify(SessionNotice::Ended)]
        );
    }

    #[test]
    fn stale_attempt_events_are_ignored() {
        let mut session = terminal();
        session.start();
        let first = open(&mut session);
        session.on_transport_closed(first, abnormal());
        let second = connect_attempt(&session.on_reconnect_timer());
        assert!(session
            .on_frame(first, ServerFrame::Data { data: "old".to_string() })
            .is_empty());
        assert!(session.on_transport_closed(first, abnormal()).is_empty());
        assert_eq!(session.current_attempt(), Some(second));
    }

    #[test]
    fn manual_reconnect_closes_prior_transport_first() {
        let mut session = terminal();
        session.start();
        open(&mut session);
        let actions = session.request_reconnect();
        assert_eq!(actions[0], SessionAction::CloseTransport);
        assert!(matches!(actions[1], SessionAction::Connect { .. }));

        session.dispose();
        assert!(session.request_reconnect().is_empty());
    }

    #[test]
    fn manual_reconnect_keeps_attempt_until_a_real_open() {
        let mut session = terminal();
        session.start();
        for _ in 0..3 {
            let attempt = session.current_attempt().expect("attempt");
            session.on_transport_closed(attempt, TransportClose::Failed("refused".to_string()));
            session.on_reconnect_timer();
        }
        assert_eq!(session.reconnect_attempt(), 3);

        let actions = session.request_reconnect();
        assert!(matches!(actions.last(), Some(SessionAction::Connect { .. })));
        assert_eq!(session.reconnect_attempt(), 3);

        let attempt = session.current_attempt().expect("attempt");
        let actions = session.on_transport_closed(attempt, TransportClose::Failed("refused".to_string()));
        assert!(actions.contains(&SessionAction::ScheduleReconnect {
            delay: Duration::from_secs(4)
        }));

        session.on_reconnect_timer();
        open(&mut session);
        assert_eq!(session.reconnect_attempt(), 0);
    }

    #[test]
    fn dispose_runs_in_order_and_only_once() {
        let mut session = terminal();
        session.start();
        open(&mut session);
        assert_eq!(
            session.dispose(),
            vec![
                SessionAction::Send(ClientFrame::Close),
                SessionAction::CloseTransport,
                SessionAction::ReleaseSink,
            ]
        );
        assert!(session.dispose().is_empty());
        assert!(session.send_input("x").is_empty());
        assert!(session.keepalive().is_empty());
    }

    #[test]
    fn dispose_mid_handshake_and_while_waiting_to_reconnect() {
        let mut session = terminal();
        session.start();
        assert_eq!(
            session.dispose(),
            vec![SessionAction::CloseTransport, SessionAction::ReleaseSink]
        );

        let mut session = terminal();
        session.start();
        let attempt = open(&mut session);
        session.on_transport_closed(attempt, abnormal());
        assert_eq!(
            session.dispose(),
            vec![SessionAction::CancelReconnect, SessionAction::ReleaseSink]
        );
        assert!(session.on_reconnect_timer().is_empty());
    }

    #[test]
    fn resize_is_clamped_and_sent_only_when_open() {
        let mut session = terminal();
        session.start();
        assert!(session.resize(10, 2).is_empty());
        assert_eq!(session.viewport(), Viewport { cols: 20, rows: 5 });
        open(&mut session);
        assert_eq!(
            session.resize(140, 50),
            vec![SessionAction::Send(ClientFrame::Resize { cols: 140, rows: 50 })]
        );
        assert!(session.resize(140, 50).is_empty());
    }

    fn log_entry(id: i64, message: &str) -> LogEntry {
        LogEntry {
            id,
            node_id: Some("node-a".to_string()),
            created_at: String::new(),
            level: "info".to_string(),
            message: message.to_string(),
            meta: None,
        }
    }

    #[test]
    fn log_snapshot_opens_and_resumes_after_reconnect() {
        let mut session = StreamSession::new(
            SessionTarget::logs(SubjectRef::node("node-a")),
            backoff(),
            Viewport::default(),
        );
        let attempt = connect_attempt(&session.start());
        session.on_transport_open(attempt);
        let actions = session.on_frame(
            attempt,
            ServerFrame::Snapshot {
                items: vec![log_entry(1, "one"), log_entry(2, "two")],
                next_since_id: Some(2),
            },
        );
        assert_eq!(
            actions,
            vec![
                SessionAction::Render("info  one\n".to_string()),
                SessionAction::Render("info  two\n".to_string()),
            ]
        );
        assert_eq!(session.state(), SessionState::Open);

        session.on_transport_closed(attempt, abnormal());
        let next = connect_attempt(&session.on_reconnect_timer());
        session.on_transport_open(next);
        let actions = session.on_frame(
            next,
            ServerFrame::Snapshot {
                items: vec![log_entry(1, "one"), log_entry(2, "two"), log_entry(3, "three")],
                next_since_id: Some(3),
            },
        );
        assert_eq!(
            actions,
            vec![
                SessionAction::Notify(SessionNotice::Restored),
                SessionAction::Render("info  three\n".to_string()),
            ]
        );
        assert_eq!(session.last_log_id(), Some(3));
    }

    #[test]
    fn rejected_log_stream_reports_unavailable_with_cursor() {
        let mut session = StreamSession::new(
            SessionTarget::logs(SubjectRef::node("node-a")),
            backoff(),
            Viewport::default(),
        )
        .with_log_cursor(Some(41));
        let attempt = connect_attempt(&session.start());
        let actions = session.on_transport_closed(attempt, TransportClose::Rejected { status: 404 });
        assert_eq!(
            actions,
            vec![SessionAction::Notify(SessionNotice::Unavailable {
                status: 404,
                since_id: Some(41)
            })]
        );
        assert!(!session.is_fatal());
    }

    #[test]
    fn log_stream_gateway_errors_retry_instead_of_falling_back() {
        let mut session = StreamSession::new(
            SessionTarget::logs(SubjectRef::container("node-a", "c-1")),
            backoff(),
            Viewport::default(),
        );
        let attempt = connect_attempt(&session.start());
        let actions = session.on_transport_closed(attempt, TransportClose::Rejected { status: 503 });
        assert!(matches!(
            actions.last(),
            Some(SessionAction::ScheduleReconnect { .. })
        ));
        assert_eq!(session.state(), SessionState::ClosedRetryable);
    }
}
