use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossterm::event::{Event, EventStream};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use futures_util::StreamExt;
use lattice_console::config::{ConfigOverrides, ConsoleConfig};
use lattice_console::console::{Console, ConsoleEvent, ConsoleOptions};
use lattice_console::keys::{translate_key, KeyAction};
use lattice_console::logging::init_logging;
use lattice_console::notifier::{
    Navigator, Notice, NoticeHandle, NotificationSink, OperationNotifier, Severity,
};
use lattice_console::scrollback::RenderSink;
use lattice_console::session::{SessionNotice, SessionTarget};
use lattice_console::transport::WsConnector;
use lattice_console::{FleetApi, HttpFleetApi};
use lattice_core::stream_protocol::Viewport;
use lattice_core::{CreateVmRequest, GuestCredentials, OperationKind, SubjectKind, SubjectRef};
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lattice-console")]
#[command(about = "Operator console for a lattice fleet master", long_about = None)]
struct Cli {
    /// Master base URL (falls back to LATTICE_MASTER_URL).
    #[arg(long, visible_alias = "master", global = true)]
    master_url: Option<String>,
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,
    #[arg(long, global = true)]
    watchdog_secs: Option<u64>,
    #[arg(long, global = true)]
    delete_confirmations: Option<u32>,
    /// First reconnect delay; doubles per consecutive failure.
    #[arg(long, global = true)]
    reconnect_base_ms: Option<u64>,
    #[arg(long, global = true)]
    reconnect_max_ms: Option<u64>,
    /// Attempts before the operator is told the stream is still reconnecting.
    #[arg(long, global = true)]
    reconnect_ceiling: Option<u32>,
    #[arg(long, global = true)]
    ping_interval_secs: Option<u64>,
    #[arg(long, global = true)]
    log_dir: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            master_url: self.master_url.clone(),
            poll_interval_ms: self.poll_interval_ms,
            watchdog_secs: self.watchdog_secs,
            delete_confirmations: self.delete_confirmations,
            reconnect_base_ms: self.reconnect_base_ms,
            reconnect_max_ms: self.reconnect_max_ms,
            reconnect_ceiling: self.reconnect_ceiling,
            ping_interval_secs: self.ping_interval_secs,
            log_dir: self.log_dir.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct SubjectArgs {
    node: String,
    #[arg(long, conflicts_with = "container")]
    vm: Option<String>,
    #[arg(long)]
    container: Option<String>,
}

impl SubjectArgs {
    fn subject(&self) -> SubjectRef {
        match (&self.vm, &self.container) {
            (Some(vm), _) => SubjectRef::vm(&self.node, vm),
            (None, Some(container)) => SubjectRef::container(&self.node, container),
            (None, None) => SubjectRef::node(&self.node),
        }
    }

    fn workload(&self) -> Result<SubjectRef> {
        let subject = self.subject();
        if subject.kind == SubjectKind::Node {
            bail!("pass --vm or --container");
        }
        Ok(subject)
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run an action and wait for its outcome
    Action {
        #[command(flatten)]
        subject: SubjectArgs,
        action: String,
        #[arg(long)]
        no_wait: bool,
    },
    /// Create a VM on a node
    CreateVm {
        node: String,
        #[arg(long)]
        name: String,
        #[arg(long = "image")]
        image_id: String,
        #[arg(long, default_value = "br0")]
        bridge: String,
        #[arg(long, default_value_t = 2)]
        vcpu: u32,
        #[arg(long, default_value_t = 2048)]
        memory_mb: u32,
        #[arg(long, default_value_t = 20)]
        disk_gb: u32,
        #[arg(long, default_value = "lattice")]
        guest_user: String,
        #[arg(long, env = "LATTICE_GUEST_PASSWORD")]
        guest_password: String,
        #[arg(long)]
        no_wait: bool,
    },
    /// Show recent operations
    Operations {
        #[command(flatten)]
        subject: SubjectArgs,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Follow a subject's state until interrupted
    Watch {
        #[command(flatten)]
        subject: SubjectArgs,
    },
    /// Attach to a node, VM or container terminal
    Terminal {
        #[command(flatten)]
        subject: SubjectArgs,
        /// Send a carriage return after every handshake
        #[arg(long)]
        wake: bool,
    },
    /// Stream logs
    Logs {
        node: String,
        #[arg(long)]
        container: Option<String>,
        /// Skip the push stream and poll the log endpoint
        #[arg(long)]
        poll: bool,
        #[arg(long)]
        since_id: Option<i64>,
    },
}

/// Prints notices to stderr, one line per change.
#[derive(Default)]
struct StderrSink {
    next_handle: u64,
    failures: usize,
}

impl NotificationSink for StderrSink {
    fn open(&mut self, notice: Notice) -> NoticeHandle {
        self.next_handle += 1;
        self.print(&notice);
        NoticeHandle(self.next_handle)
    }

    fn update(&mut self, _handle: NoticeHandle, notice: Notice) {
        self.print(&notice);
    }
}

impl StderrSink {
    fn print(&mut self, notice: &Notice) {
        let tag = match notice.severity {
            Severity::Pending => "..",
            Severity::Info => "--",
            Severity::Success => "ok",
            Severity::Error => {
                self.failures += 1;
                "!!"
            }
        };
        eprint!("[{tag}] {}\r\n", notice.message);
    }
}

#[derive(Default)]
struct LeaveTracker {
    left: Vec<SubjectRef>,
}

impl Navigator for LeaveTracker {
    fn leave_subject(&mut self, subject: &SubjectRef) {
        eprint!("{subject} no longer exists\r\n");
        self.left.push(subject.clone());
    }
}

struct StdoutSink {
    out: io::Stdout,
}

impl StdoutSink {
    fn new() -> Self {
        Self { out: io::stdout() }
    }
}

impl RenderSink for StdoutSink {
    fn write(&mut self, chunk: &str) {
        let _ = self.out.write_all(chunk.as_bytes());
        let _ = self.out.flush();
    }

    fn release(&mut self) {
        let _ = self.out.flush();
    }
}

type CliConsole = Console<StderrSink, LeaveTracker>;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let overrides = cli.overrides();
    let config = ConsoleConfig::resolve(&overrides).context("invalid configuration")?;
    let _log_guard = init_logging(&config.log_dir);
    info!(event = "console_start", master = %config.master_url);

    let api: Arc<dyn FleetApi> = Arc::new(
        HttpFleetApi::new(config.master_url.clone(), config.request_timeout)
            .map_err(|err| anyhow!(err.operator_message()))?,
    );
    let notifier = OperationNotifier::new(
        StderrSink::default(),
        LeaveTracker::default(),
        config.notifier(),
    );
    let mut console = Console::new(
        api,
        Arc::new(WsConnector),
        notifier,
        ConsoleOptions::from(&config),
    );

    let code = match cli.command {
        Commands::Action {
            subject,
            action,
            no_wait,
        } => {
            let subject = subject.workload()?;
            let kind: OperationKind = action.parse().map_err(anyhow::Error::msg)?;
            if !kind.is_action() {
                bail!("{kind} is not an action");
            }
            let registration = console.invoke(&subject, kind).await;
            settle(&mut console, registration.is_ok(), no_wait).await
        }
        Commands::CreateVm {
            node,
            name,
            image_id,
            bridge,
            vcpu,
            memory_mb,
            disk_gb,
            guest_user,
            guest_password,
            no_wait,
        } => {
            let request = CreateVmRequest {
                name,
                image_id,
                bridge,
                vcpu,
                memory_mb,
                disk_gb,
                guest: GuestCredentials {
                    username: guest_user,
                    password: guest_password,
                },
            };
            let created = console.create_vm(&node, &request).await;
            if let Ok((subject, _)) = &created {
                println!("{}", subject.id);
            }
            settle(&mut console, created.is_ok(), no_wait).await
        }
        Commands::Operations { subject, limit } => {
            let subject = subject.workload()?;
            print_operations(&console, &subject, limit).await?
        }
        Commands::Watch { subject } => watch(&mut console, subject.subject()).await,
        Commands::Terminal { subject, wake } => {
            run_terminal(&mut console, subject.subject(), wake).await?
        }
        Commands::Logs {
            node,
            container,
            poll,
            since_id,
        } => {
            let subject = match container {
                Some(container) => SubjectRef::container(&node, container),
                None => SubjectRef::node(&node),
            };
            follow_logs(&mut console, subject, poll, since_id).await
        }
    };

    console.shutdown().await;
    Ok(code)
}

async fn settle(console: &mut CliConsole, accepted: bool, no_wait: bool) -> ExitCode {
    if accepted && !no_wait {
        tokio::select! {
            _ = console.run_until_settled() => {}
            _ = tokio::signal::ctrl_c() => {
                eprint!("stopped waiting; the operation keeps running on the node\r\n");
            }
        }
    }
    if console.notifier().sink().failures > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn print_operations(
    console: &CliConsole,
    subject: &SubjectRef,
    limit: u32,
) -> Result<ExitCode> {
    let operations = console
        .api()
        .list_operations(subject, limit)
        .await
        .map_err(|err| anyhow!(err.operator_message()))?;
    if operations.is_empty() {
        println!("no operations recorded for {subject}");
        return Ok(ExitCode::SUCCESS);
    }
    for operation in operations {
        let created = operation
            .created_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let detail = operation.failure_detail().unwrap_or("");
        println!(
            "{:<38} {:<8} {:<10} {:<26} {}",
            operation.id,
            operation.kind.as_str(),
            operation.status.as_str(),
            created,
            detail
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn watch(console: &mut CliConsole, subject: SubjectRef) -> ExitCode {
    console.mount_view(subject.clone());
    let mut last_state: Option<String> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = console.pump() => {
                if let ConsoleEvent::Polled(polled) = event {
                    if polled != subject {
                        continue;
                    }
                    let state = match console.snapshot(&subject) {
                        Some(snapshot) => snapshot.state.clone().unwrap_or_else(|| "unknown".to_string()),
                        None => "not found".to_string(),
                    };
                    if last_state.as_deref() != Some(state.as_str()) {
                        println!("{subject}: {state}");
                        last_state = Some(state);
                    }
                }
                if console.notifier().navigator().left.contains(&subject) {
                    break;
                }
            }
        }
    }
    console.unmount_view(&subject);
    ExitCode::SUCCESS
}

async fn run_terminal(
    console: &mut CliConsole,
    subject: SubjectRef,
    wake: bool,
) -> Result<ExitCode> {
    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let handle = console.open_session(
        SessionTarget::terminal(subject),
        Viewport::new(cols, rows),
        wake.then(|| "\r".to_string()),
        None,
        StdoutSink::new(),
    );

    enable_raw_mode()?;
    let mut events = EventStream::new();
    let mut code = ExitCode::SUCCESS;
    loop {
        tokio::select! {
            maybe_event = events.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) => match translate_key(key) {
                        KeyAction::Input(data) => {
                            handle.send_input(data);
                        }
                        KeyAction::Detach => break,
                        KeyAction::Ignore => {}
                    },
                    Some(Ok(Event::Paste(text))) => {
                        handle.send_input(text);
                    }
                    Some(Ok(Event::Resize(cols, rows))) => {
                        handle.resize(cols, rows);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "terminal_input_error", error = %err);
                        break;
                    }
                    None => break,
                }
            }
            event = console.pump() => {
                let ConsoleEvent::Session(report) = event else {
                    continue;
                };
                match report.notice {
                    SessionNotice::Reconnecting { attempt, delay } => {
                        eprint!(
                            "\r\n[reconnecting in {}ms, attempt {attempt}]\r\n",
                            delay.as_millis()
                        );
                    }
                    SessionNotice::StillReconnecting => {
                        eprint!("\r\n[still reconnecting; press Ctrl-] to leave]\r\n");
                    }
                    SessionNotice::Restored => eprint!("\r\n[reconnected]\r\n"),
                    SessionNotice::Exited { code: exit } => {
                        let exit = exit.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                        eprint!("\r\n[process exited: {exit}]\r\n");
                    }
                    SessionNotice::Ended => break,
                    SessionNotice::Fatal { .. } => {
                        code = ExitCode::FAILURE;
                        break;
                    }
                    SessionNotice::Unavailable { status, .. } => {
                        eprint!("\r\n[terminal unavailable: HTTP {status}]\r\n");
                        code = ExitCode::FAILURE;
                        break;
                    }
                }
            }
        }
    }
    disable_raw_mode()?;
    handle.dispose();
    handle.join().await;
    Ok(code)
}

async fn follow_logs(
    console: &mut CliConsole,
    subject: SubjectRef,
    poll: bool,
    since_id: Option<i64>,
) -> ExitCode {
    let tail_cancel = CancellationToken::new();
    let mut tail = None;
    if poll {
        if subject.kind != SubjectKind::Node {
            eprintln!("polling is only available for node logs");
            return ExitCode::FAILURE;
        }
        tail = Some(console.start_log_tail(
            &subject.node_id,
            since_id,
            StdoutSink::new(),
            tail_cancel.clone(),
        ));
    }
    let session = (!poll).then(|| {
        console.open_session(
            SessionTarget::logs(subject.clone()),
            Viewport::default(),
            None,
            since_id,
            StdoutSink::new(),
        )
    });

    let mut code = ExitCode::SUCCESS;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = console.pump() => {
                let ConsoleEvent::Session(report) = event else {
                    continue;
                };
                match report.notice {
                    SessionNotice::Unavailable { status, since_id } => {
                        if subject.kind != SubjectKind::Node {
                            eprintln!("log stream unavailable (HTTP {status})");
                            code = ExitCode::FAILURE;
                            break;
                        }
                        eprintln!("log stream unavailable (HTTP {status}); polling instead");
                        tail = Some(console.start_log_tail(
                            &subject.node_id,
                            since_id,
                            StdoutSink::new(),
                            tail_cancel.clone(),
                        ));
                    }
                    SessionNotice::Reconnecting { attempt, delay } => {
                        eprintln!(
                            "log stream lost; reconnecting in {}ms (attempt {attempt})",
                            delay.as_millis()
                        );
                    }
                    SessionNotice::Restored => eprintln!("log stream restored"),
                    SessionNotice::StillReconnecting => eprintln!("log stream still reconnecting"),
                    SessionNotice::Ended => break,
                    SessionNotice::Fatal { .. } => {
                        code = ExitCode::FAILURE;
                        break;
                    }
                    SessionNotice::Exited { .. } => {}
                }
            }
        }
    }

    if let Some(session) = session {
        session.dispose();
        session.join().await;
    }
    tail_cancel.cancel();
    if let Some(tail) = tail {
        if let Err(err) = tail.await {
            warn!(event = "log_tail_join_failed", error = %err);
        }
    }
    code
}
