pub mod api;
pub mod backoff;
pub mod config;
pub mod console;
pub mod driver;
pub mod error;
pub mod keys;
pub mod logging;
pub mod notifier;
pub mod poller;
pub mod scrollback;
pub mod session;
pub mod transport;

pub use api::{FleetApi, HttpFleetApi};
pub use console::{Console, ConsoleEvent, ConsoleOptions};
pub use driver::{spawn_session, SessionConfig, SessionHandle, SessionId, SessionReport};
pub use notifier::{Navigator, Notice, NotificationSink, OperationNotifier, Severity};
pub use session::{SessionNotice, SessionTarget, StreamSession};
