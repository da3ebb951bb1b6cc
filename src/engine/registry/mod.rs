//! Managed session registry.
//!
//! Local and remote interactive sessions share one lifecycle: `open`, `read`,
//! `write`, `resize`, `close`. Only [`Transport`] knows which backend it is
//! talking to; everything above it is transport-agnostic.
//!
//! # Lifecycle rules
//!
//! - `read` returns [`ReadOutcome::Eof`] for unknown or closed sessions, and
//!   closes the session when the transport reports end of stream.
//! - A failed `write` closes the session instead of surfacing the error.
//! - `resize` is best-effort.
//! - `close` is idempotent: the first call removes the session and tears down
//!   the transport, later calls are no-ops.

#[cfg(feature = "local_terminal")]
mod local;
mod remote;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{ConnectSettings, EngineSettings};
use super::error::EngineError;
use super::types::{Dimensions, RemoteConfig, SessionId, SessionKind};

#[cfg(feature = "local_terminal")]
use local::LocalPty;
use remote::RemoteShell;

/// Program spawned for local sessions when `SHELL` is unset.
pub(crate) const DEFAULT_SHELL: &str = "/bin/sh";

/// Result of polling a session for output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing arrived within the poll timeout.
    Empty,
    Data(Vec<u8>),
    /// The transport closed or failed; the session is gone.
    Eof,
}

pub(crate) enum Transport {
    #[cfg(feature = "local_terminal")]
    Local(LocalPty),
    Remote(RemoteShell),
    /// Stays silent and rejects every write.
    #[cfg(test)]
    Broken,
}

impl Transport {
    async fn read(&self, poll: Duration) -> ReadOutcome {
        match self {
            #[cfg(feature = "local_terminal")]
            Transport::Local(pty) => pty.read(poll).await,
            Transport::Remote(shell) => shell.read(poll).await,
            #[cfg(test)]
            Transport::Broken => {
                tokio::time::sleep(poll).await;
                ReadOutcome::Empty
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), EngineError> {
        match self {
            #[cfg(feature = "local_terminal")]
            Transport::Local(pty) => pty.write(data.to_vec()).await,
            Transport::Remote(shell) => shell.write(data).await,
            #[cfg(test)]
            Transport::Broken => Err(EngineError::Transport("broken pipe".to_string())),
        }
    }

    async fn resize(&self, dimensions: Dimensions) -> Result<(), EngineError> {
        match self {
            #[cfg(feature = "local_terminal")]
            Transport::Local(pty) => pty.resize(dimensions),
            Transport::Remote(shell) => shell.resize(dimensions).await,
            #[cfg(test)]
            Transport::Broken => Ok(()),
        }
    }

    async fn close(&self) {
        match self {
            #[cfg(feature = "local_terminal")]
            Transport::Local(pty) => pty.close().await,
            Transport::Remote(shell) => shell.close().await,
            #[cfg(test)]
            Transport::Broken => {}
        }
    }
}

/// One interactive session.
pub struct ManagedSession {
    pub id: SessionId,
    pub kind: SessionKind,
    pub host: String,
    transport: Transport,
    dimensions: StdMutex<Dimensions>,
    closed: AtomicBool,
}

impl ManagedSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
            .lock()
            .map(|d| *d)
            .unwrap_or_default()
    }
}

/// Summary returned to the opener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedSession {
    pub id: SessionId,
    pub kind: SessionKind,
    pub host: String,
}

/// Owner of every live interactive session.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<ManagedSession>>,
    connect: ConnectSettings,
    read_poll: Duration,
    shell: String,
}

impl SessionRegistry {
    pub fn new(settings: &EngineSettings) -> Self {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        Self::with_shell(settings, shell)
    }

    pub fn with_shell(settings: &EngineSettings, shell: impl Into<String>) -> Self {
        Self {
            sessions: DashMap::new(),
            connect: settings.connect,
            read_poll: settings.read_poll,
            shell: shell.into(),
        }
    }

    /// Open a session: remote when `remote` is given, local otherwise.
    ///
    /// Nothing is registered when spawning or connecting fails.
    pub async fn open(
        &self,
        dimensions: Dimensions,
        remote: Option<&RemoteConfig>,
    ) -> Result<OpenedSession, EngineError> {
        let (kind, host, transport) = match remote {
            Some(config) => {
                let shell = RemoteShell::open(config, dimensions, &self.connect).await?;
                (SessionKind::Remote, config.host.clone(), Transport::Remote(shell))
            }
            None => (
                SessionKind::Local,
                "localhost".to_string(),
                self.open_local(dimensions).await?,
            ),
        };
        Ok(self.register(kind, host, transport, dimensions))
    }

    fn register(
        &self,
        kind: SessionKind,
        host: String,
        transport: Transport,
        dimensions: Dimensions,
    ) -> OpenedSession {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(ManagedSession {
            id: id.clone(),
            kind,
            host: host.clone(),
            transport,
            dimensions: StdMutex::new(dimensions),
            closed: AtomicBool::new(false),
        });
        self.sessions.insert(id.clone(), session);

        info!(
            "Opened {} session {} on {} ({}x{})",
            kind, id, host, dimensions.cols, dimensions.rows
        );
        OpenedSession { id, kind, host }
    }

    /// Register a session whose transport rejects every write.
    #[cfg(test)]
    pub(crate) fn open_broken(&self) -> OpenedSession {
        self.register(
            SessionKind::Remote,
            "broken.test".to_string(),
            Transport::Broken,
            Dimensions::default(),
        )
    }

    #[cfg(feature = "local_terminal")]
    async fn open_local(&self, dimensions: Dimensions) -> Result<Transport, EngineError> {
        Ok(Transport::Local(
            LocalPty::spawn(self.shell.clone(), dimensions).await?,
        ))
    }

    #[cfg(not(feature = "local_terminal"))]
    async fn open_local(&self, _dimensions: Dimensions) -> Result<Transport, EngineError> {
        Err(EngineError::Connect(format!(
            "local terminals are not available in this build (shell {})",
            self.shell
        )))
    }

    fn live(&self, id: &str) -> Option<Arc<ManagedSession>> {
        self.sessions
            .get(id)
            .map(|s| s.value().clone())
            .filter(|s| !s.is_closed())
    }

    /// Poll for output.
    pub async fn read(&self, id: &str) -> ReadOutcome {
        let Some(session) = self.live(id) else {
            return ReadOutcome::Eof;
        };

        let outcome = session.transport.read(self.read_poll).await;
        if session.is_closed() {
            // Closed while we were waiting; drop whatever arrived.
            return ReadOutcome::Eof;
        }
        if outcome == ReadOutcome::Eof {
            debug!("Session {} reached end of stream", id);
            self.close(id).await;
        }
        outcome
    }

    /// Forward input. Unknown or closed sessions ignore it.
    pub async fn write(&self, id: &str, data: &[u8]) {
        let Some(session) = self.live(id) else {
            return;
        };
        if let Err(e) = session.transport.write(data).await {
            warn!("Write to session {} failed, closing: {}", id, e);
            self.close(id).await;
        }
    }

    /// Record new dimensions and resize the transport, ignoring failures.
    pub async fn resize(&self, id: &str, dimensions: Dimensions) {
        let Some(session) = self.live(id) else {
            return;
        };
        if let Ok(mut current) = session.dimensions.lock() {
            *current = dimensions;
        }
        if let Err(e) = session.transport.resize(dimensions).await {
            debug!("Resize of session {} failed: {}", id, e);
        }
    }

    /// Tear down a session. Safe to call any number of times.
    pub async fn close(&self, id: &str) {
        let Some((_, session)) = self.sessions.remove(id) else {
            return;
        };
        if session.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        session.transport.close().await;
        info!("Closed {} session {}", session.kind, id);
    }

    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ManagedSession>> {
        self.live(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.live(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
