pub mod stream_protocol;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Node,
    Vm,
    Container,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Node => "node",
            SubjectKind::Vm => "vm",
            SubjectKind::Container => "container",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a resource an operation acts on or a stream is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectRef {
    pub node_id: String,
    pub kind: SubjectKind,
    pub id: String,
}

impl SubjectRef {
    pub fn node(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            id: node_id.clone(),
            node_id,
            kind: SubjectKind::Node,
        }
    }

    pub fn vm(node_id: impl Into<String>, vm_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind: SubjectKind::Vm,
            id: vm_id.into(),
        }
    }

    pub fn container(node_id: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind: SubjectKind::Container,
            id: container_id.into(),
        }
    }

    /// Path segments below `/api` (or `/ws`) addressing this subject.
    pub fn path_segments(&self) -> Vec<&str> {
        match self.kind {
            SubjectKind::Node => vec!["nodes", self.node_id.as_str()],
            SubjectKind::Vm => vec!["nodes", self.node_id.as_str(), "vms", self.id.as_str()],
            SubjectKind::Container => vec![
                "nodes",
                self.node_id.as_str(),
                "containers",
                self.id.as_str(),
            ],
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SubjectKind::Node => write!(f, "node {}", self.node_id),
            kind => write!(f, "{kind} {} on node {}", self.id, self.node_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Start,
    Stop,
    Restart,
    Reboot,
    Delete,
    Sync,
    Other,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Restart => "restart",
            OperationKind::Reboot => "reboot",
            OperationKind::Delete => "delete",
            OperationKind::Sync => "sync",
            OperationKind::Other => "other",
        }
    }

    pub fn progress_label(&self) -> &'static str {
        match self {
            OperationKind::Create => "Creating",
            OperationKind::Start => "Starting",
            OperationKind::Stop => "Stopping",
            OperationKind::Restart => "Restarting",
            OperationKind::Reboot => "Rebooting",
            OperationKind::Delete => "Deleting",
            OperationKind::Sync => "Syncing",
            OperationKind::Other => "Running operation on",
        }
    }

    pub fn done_label(&self) -> &'static str {
        match self {
            OperationKind::Create => "created",
            OperationKind::Start => "started",
            OperationKind::Stop => "stopped",
            OperationKind::Restart => "restarted",
            OperationKind::Reboot => "rebooted",
            OperationKind::Delete => "deleted",
            OperationKind::Sync => "synced",
            OperationKind::Other => "updated",
        }
    }

    /// Kinds that can be requested through `.../actions/{kind}`.
    pub fn is_action(&self) -> bool {
        !matches!(self, OperationKind::Create | OperationKind::Other)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "create" => Ok(OperationKind::Create),
            "start" => Ok(OperationKind::Start),
            "stop" => Ok(OperationKind::Stop),
            "restart" => Ok(OperationKind::Restart),
            "reboot" => Ok(OperationKind::Reboot),
            "delete" | "remove" => Ok(OperationKind::Delete),
            "sync" => Ok(OperationKind::Sync),
            other => Err(format!("Unknown operation kind: {other}")),
        }
    }
}

impl Serialize for OperationKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OperationKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or(OperationKind::Other))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[serde(alias = "pending")]
    Queued,
    Running,
    #[serde(alias = "success", alias = "completed")]
    Succeeded,
    #[serde(alias = "error")]
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Queued => "queued",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    fn rank(&self) -> u8 {
        match self {
            OperationStatus::Queued => 0,
            OperationStatus::Running => 1,
            OperationStatus::Succeeded | OperationStatus::Failed => 2,
        }
    }

    /// Status only moves forward; a terminal status never changes again.
    pub fn can_advance_to(&self, next: OperationStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One asynchronous server-side action, as reported by the master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, alias = "vm_id", alias = "container_id")]
    pub subject_id: Option<String>,
    #[serde(alias = "operation_type")]
    pub kind: OperationKind,
    pub status: OperationStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Error text, only meaningful for failed operations.
    pub fn failure_detail(&self) -> Option<&str> {
        if self.status != OperationStatus::Failed {
            return None;
        }
        self.error
            .as_deref()
            .map(str::trim)
            .filter(|detail| !detail.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSnapshot {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub last_operation: Option<Operation>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ResourceSnapshot {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(self.id.as_str())
    }
}

/// Body returned by every state-changing request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub agent_connected: bool,
    #[serde(default, alias = "vm", alias = "container")]
    pub resource: Option<ResourceSnapshot>,
    #[serde(default)]
    pub operation: Option<Operation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateVmRequest {
    pub name: String,
    pub image_id: String,
    pub bridge: String,
    pub vcpu: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub guest: GuestCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: i64,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub meta: Option<Value>,
}

impl LogEntry {
    pub fn render_line(&self) -> String {
        let level = if self.level.trim().is_empty() {
            "info"
        } else {
            self.level.trim()
        };
        if self.created_at.is_empty() {
            format!("{level:<5} {}", self.message)
        } else {
            format!("{} {level:<5} {}", self.created_at, self.message)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogPage {
    #[serde(default)]
    pub items: Vec<LogEntry>,
    #[serde(default)]
    pub next_since_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiErrorBody {
    pub error: String,
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_accepts_master_field_names() {
        let op: Operation = serde_json::from_str(
            r#"{
                "id": "op-1",
                "node_id": "node-a",
                "vm_id": "vm-7",
                "operation_type": "reboot",
                "status": "running",
                "created_at": "2026-02-07T21:00:00.123456+00:00",
                "started_at": "2026-02-07T21:00:01+00:00",
                "ended_at": null,
                "error": null,
                "request": {"action": "reboot"}
            }"#,
        )
        .expect("parse operation");
        assert_eq!(op.id, "op-1");
        assert_eq!(op.subject_id.as_deref(), Some("vm-7"));
        assert_eq!(op.kind, OperationKind::Reboot);
        assert_eq!(op.status, OperationStatus::Running);
        assert!(op.started_at.is_some());
        assert!(op.ended_at.is_none());
    }

    #[test]
    fn unknown_operation_kind_maps_to_other() {
        let op: Operation = serde_json::from_str(
            r#"{"id": 42, "kind": "terminal_exec", "status": "queued"}"#,
        )
        .expect("parse operation");
        assert_eq!(op.id, "42");
        assert_eq!(op.kind, OperationKind::Other);
    }

    #[test]
    fn failure_detail_only_for_failed_operations() {
        let mut op = Operation {
            id: "op-2".to_string(),
            subject_id: None,
            kind: OperationKind::Start,
            status: OperationStatus::Running,
            error: Some("libvirt: domain not found".to_string()),
            created_at: None,
            started_at: None,
            ended_at: None,
        };
        assert_eq!(op.failure_detail(), None);
        op.status = OperationStatus::Failed;
        assert_eq!(op.failure_detail(), Some("libvirt: domain not found"));
        op.error = Some("   ".to_string());
        assert_eq!(op.failure_detail(), None);
    }

    #[test]
    fn status_never_moves_backwards() {
        use OperationStatus::*;
        assert!(Queued.can_advance_to(Running));
        assert!(Queued.can_advance_to(Succeeded));
        assert!(Running.can_advance_to(Failed));
        assert!(!Running.can_advance_to(Queued));
        assert!(!Succeeded.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Running));
    }

    #[test]
    fn action_response_reads_vm_or_container_snapshot() {
        let vm: ActionResponse = serde_json::from_str(
            r#"{
                "ok": true,
                "queued": true,
                "agent_connected": false,
                "vm": {"id": "vm-1", "name": "web-1", "state": "stopped", "last_operation": null},
                "operation": {"id": "op-9", "vm_id": "vm-1", "operation_type": "start", "status": "queued"}
            }"#,
        )
        .expect("parse vm response");
        let resource = vm.resource.expect("vm snapshot");
        assert_eq!(resource.display_name(), "web-1");
        assert_eq!(vm.operation.expect("operation").kind, OperationKind::Start);

        let container: ActionResponse = serde_json::from_str(
            r#"{"ok": true, "container": {"id": "c-1", "image": "nginx"}}"#,
        )
        .expect("parse container response");
        let resource = container.resource.expect("container snapshot");
        assert_eq!(resource.display_name(), "c-1");
        assert_eq!(resource.extra.get("image"), Some(&serde_json::json!("nginx")));
        assert!(container.operation.is_none());
    }

    #[test]
    fn subject_paths_and_display() {
        let vm = SubjectRef::vm("node-a", "vm-1");
        assert_eq!(vm.path_segments(), vec!["nodes", "node-a", "vms", "vm-1"]);
        assert_eq!(vm.to_string(), "vm vm-1 on node node-a");
        let node = SubjectRef::node("node-a");
        assert_eq!(node.path_segments(), vec!["nodes", "node-a"]);
        assert_eq!(node.to_string(), "node node-a");
    }

    #[test]
    fn log_entry_renders_single_line() {
        let entry = LogEntry {
            id: 3,
            node_id: Some("node-a".to_string()),
            created_at: "2026-02-07T21:00:00+00:00".to_string(),
            level: "warn".to_string(),
            message: "heartbeat late".to_string(),
            meta: None,
        };
        assert_eq!(
            entry.render_line(),
            "2026-02-07T21:00:00+00:00 warn  heartbeat late"
        );
    }
}
