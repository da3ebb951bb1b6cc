//! Shared data types for sessions, executors and the reachability monitor.
//!
//! Every type that crosses the event channel derives `Serialize` and
//! `Deserialize`; field names are the wire names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::EngineError;

/// Opaque identifier of a managed session. Generated at creation, never reused.
pub type SessionId = String;

/// Identifier of a connected client on the event channel.
pub type ClientId = String;

/// Identifier of an inventoried device.
pub type DeviceId = String;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Dimensions {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Which transport backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Local,
    Remote,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Local => write!(f, "local"),
            SessionKind::Remote => write!(f, "remote"),
        }
    }
}

fn default_port() -> u16 {
    22
}

/// Login material for a remote device.
///
/// With neither `password` nor `key_path` set, the SSH agent is used.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// Where and how to reach a remote shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(flatten)]
    pub credentials: Credentials,
}

impl RemoteConfig {
    /// `host:port` as understood by the connector.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A device addressed by an executor call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub device: DeviceId,
    /// `host` or `host:port`
    pub address: String,
    pub credentials: Credentials,
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub percent: f64,
}

/// Memory figures in MiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

/// Disk figures as reported by `df -h` (human-readable strings).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStats {
    pub total: String,
    pub used: String,
    pub available: String,
    pub percent: String,
}

impl Default for DiskStats {
    fn default() -> Self {
        Self {
            total: "0".to_string(),
            used: "0".to_string(),
            available: "0".to_string(),
            percent: "0%".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub disk: DiskStats,
}

// ============================================================================
// Services and processes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub load: String,
    pub active: String,
    pub sub: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Status,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Status => "status",
        }
    }
}

impl FromStr for ServiceAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(ServiceAction::Start),
            "stop" => Ok(ServiceAction::Stop),
            "restart" => Ok(ServiceAction::Restart),
            "status" => Ok(ServiceAction::Status),
            other => Err(EngineError::Validation(format!(
                "unsupported service action '{}'",
                other
            ))),
        }
    }
}

/// Output of a service control call plus a short status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceControlResult {
    pub service: String,
    pub action: ServiceAction,
    pub success: bool,
    pub output: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub user: String,
    pub cpu: f64,
    pub mem: f64,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessAction {
    Kill,
    Stop,
}

impl ProcessAction {
    /// Signal argument passed to `kill`.
    pub fn signal(&self) -> &'static str {
        match self {
            ProcessAction::Kill => "-9",
            ProcessAction::Stop => "-SIGTERM",
        }
    }
}

impl FromStr for ProcessAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kill" => Ok(ProcessAction::Kill),
            "stop" => Ok(ProcessAction::Stop),
            other => Err(EngineError::Validation(format!(
                "unsupported process action '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessControlResult {
    pub pid: u32,
    pub action: ProcessAction,
    pub success: bool,
    pub output: String,
}

// ============================================================================
// Files
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub is_symlink: bool,
    /// Zero for directories.
    pub size: u64,
    /// Unix seconds.
    pub modified: u64,
    /// Three octal digits, e.g. `"755"`.
    pub permissions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    /// Absent when the file is binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub binary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub name: String,
    pub path: String,
}

// ============================================================================
// Monitoring
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Unknown => write!(f, "unknown"),
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Error => write!(f, "error"),
        }
    }
}

/// Emitted by the monitor when a device's status changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusUpdate {
    pub device: DeviceId,
    pub group: String,
    pub status: DeviceStatus,
    /// RFC 3339 timestamp of the check.
    pub timestamp: String,
}
