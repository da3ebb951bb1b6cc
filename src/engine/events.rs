//! Event-channel vocabulary.
//!
//! Every frame is `{"event": <name>, "data": <payload>}`. [`ClientEvent`] is
//! what a client may send, [`ServerEvent`] is what the engine pushes back.
//! Requests that address a device carry the device id, its address and the
//! credentials inline, flattened next to the operation's own fields.

use serde::{Deserialize, Deserializer, Serialize};

use super::error::EngineError;
use super::types::{
    DeviceId, DeviceStatus, DeviceStatusUpdate, DeviceTarget, Dimensions, DirEntry, ProcessInfo,
    ProcessControlResult, RemoteConfig, SearchResult, ServiceControlResult, ServiceInfo,
    SessionId, SessionKind, SystemStats,
};

fn default_cols() -> u16 {
    Dimensions::default().cols
}

fn default_rows() -> u16 {
    Dimensions::default().rows
}

fn default_root() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub kind: SessionKind,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(
        default,
        rename = "remoteConfig",
        skip_serializing_if = "Option::is_none"
    )]
    pub remote_config: Option<RemoteConfig>,
}

impl OpenSessionRequest {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.cols, self.rows)
    }
}

/// `list_dir` and `read_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRequest {
    #[serde(flatten)]
    pub target: DeviceTarget,
    #[serde(default = "default_root")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileRequest {
    #[serde(flatten)]
    pub target: DeviceTarget,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(flatten)]
    pub target: DeviceTarget,
    #[serde(default = "default_root")]
    pub path: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    #[serde(flatten)]
    pub target: DeviceTarget,
    pub service: String,
    /// Validated by the executor, not here, so a bad action is reported
    /// as a device error instead of a malformed frame.
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    #[serde(flatten)]
    pub target: DeviceTarget,
    /// Accepted as a JSON number or string.
    #[serde(deserialize_with = "pid_text")]
    pub pid: String,
    pub action: String,
}

fn pid_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Pid {
        Number(u64),
        Text(String),
    }

    Ok(match Pid::deserialize(deserializer)? {
        Pid::Number(n) => n.to_string(),
        Pid::Text(s) => s,
    })
}

/// Client to engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    OpenSession(OpenSessionRequest),
    SessionInput { id: SessionId, data: String },
    SessionResize { id: SessionId, cols: u16, rows: u16 },
    CloseSession { id: SessionId },
    StartStatsStream(DeviceTarget),
    StopStatsStream { device: DeviceId },
    ListDir(PathRequest),
    ReadFile(PathRequest),
    WriteFile(WriteFileRequest),
    SearchFiles(SearchRequest),
    ListServices(DeviceTarget),
    ManageService(ServiceRequest),
    ListProcesses(DeviceTarget),
    ManageProcess(ProcessRequest),
    GetDeviceStatus { device: DeviceId },
}

/// Engine to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionOpened {
        id: SessionId,
        kind: SessionKind,
        host: String,
    },
    SessionOutput {
        id: SessionId,
        data: String,
    },
    SessionClosed {
        id: SessionId,
    },
    SessionError {
        message: String,
    },
    StatsUpdate {
        device: DeviceId,
        stats: SystemStats,
    },
    StatsStreamError {
        device: DeviceId,
        error: String,
    },
    DirectoryListed {
        device: DeviceId,
        path: String,
        entries: Vec<DirEntry>,
    },
    FileRead {
        device: DeviceId,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        binary: bool,
    },
    FileWritten {
        device: DeviceId,
        path: String,
    },
    FilesSearched {
        device: DeviceId,
        query: String,
        results: Vec<SearchResult>,
    },
    FileError {
        device: DeviceId,
        error: String,
    },
    DeviceStatusUpdate(DeviceStatusUpdate),
    DeviceStatus {
        device: DeviceId,
        status: DeviceStatus,
    },
    ServicesListed {
        device: DeviceId,
        services: Vec<ServiceInfo>,
    },
    ServiceManaged {
        device: DeviceId,
        result: ServiceControlResult,
    },
    ProcessesListed {
        device: DeviceId,
        processes: Vec<ProcessInfo>,
    },
    ProcessManaged {
        device: DeviceId,
        result: ProcessControlResult,
    },
    DeviceError {
        device: DeviceId,
        error: String,
    },
}

impl ClientEvent {
    pub fn from_frame(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::Validation(format!("malformed frame: {}", e)))
    }
}

impl ServerEvent {
    pub fn to_frame(&self) -> Result<String, EngineError> {
        serde_json::to_string(self)
            .map_err(|e| EngineError::Parse(format!("cannot encode event: {}", e)))
    }
}
