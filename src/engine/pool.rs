//! Keyed cache of reusable remote command connections.
//!
//! # Keys
//!
//! Entries are keyed by [`PoolKey`]: the owning client, the device, and the
//! kind of work ([`PoolScope`]). A file browser and a stats stream on the same
//! device therefore hold independent connections and never tear each other
//! down.
//!
//! # Concurrency
//!
//! Each key owns a slot guarded by a `tokio::sync::Mutex`. `acquire` holds the
//! slot lock across the liveness check, the eviction of a dead connection and
//! the creation of its replacement, so concurrent callers for one key queue
//! behind the first and reuse its result. Different keys never contend.
//!
//! # Liveness
//!
//! The liveness check is a transport-level flag ([`RemoteConnection::is_alive`]),
//! never a round-trip command, and is skipped entirely for a connection that
//! was verified within [`LIVENESS_GRACE`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use russh::client;
use russh_sftp::client::SftpSession;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use super::client::{self as remote, CommandOutput};
use super::config::ConnectSettings;
use super::error::EngineError;
use super::executor::sftp;
use super::handler::DeviceHandler;
use super::types::{ClientId, Credentials, DeviceId, DirEntry};

/// Window during which a recently verified connection is reused unchecked.
pub(crate) const LIVENESS_GRACE: Duration = Duration::from_millis(500);

/// Kind of work a pooled connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolScope {
    /// Continuous stats streaming.
    Stats,
    /// Service and process listing/control.
    Control,
    /// Directory listing, file read/write, search.
    Files,
}

/// Logical identity of a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub client: ClientId,
    pub device: DeviceId,
    pub scope: PoolScope,
}

impl PoolKey {
    pub fn new(client: impl Into<ClientId>, device: impl Into<DeviceId>, scope: PoolScope) -> Self {
        Self {
            client: client.into(),
            device: device.into(),
            scope,
        }
    }
}

/// A live remote connection able to run commands and touch files.
#[async_trait]
pub trait RemoteConnection: Send + Sync + 'static {
    /// Cheap local check; must not touch the network.
    fn is_alive(&self) -> bool;

    async fn exec(&self, command: &str) -> Result<CommandOutput, EngineError>;

    /// Unsorted entries of `path`, without `.` and `..`.
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, EngineError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, EngineError>;

    /// Create or truncate `path` and write `content`.
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), EngineError>;

    async fn close(&self);
}

/// Creates connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: RemoteConnection;

    async fn connect(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Self::Conn, EngineError>;
}

/// SSH connection with a lazily opened SFTP session.
pub struct SshConnection {
    handle: client::Handle<DeviceHandler>,
    sftp: OnceCell<SftpSession>,
    command_timeout: Duration,
}

impl SshConnection {
    /// The SFTP session for this connection, opened on first use.
    async fn sftp(&self) -> Result<&SftpSession, EngineError> {
        self.sftp
            .get_or_try_init(|| remote::open_sftp(&self.handle))
            .await
    }
}

#[async_trait]
impl RemoteConnection for SshConnection {
    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, EngineError> {
        remote::execute_command(&self.handle, command, self.command_timeout).await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, EngineError> {
        sftp::list_dir(self.sftp().await?, path, self.command_timeout).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, EngineError> {
        sftp::read_file(self.sftp().await?, path, self.command_timeout).await
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), EngineError> {
        sftp::write_file(self.sftp().await?, path, content, self.command_timeout).await
    }

    async fn close(&self) {
        if let Some(sftp) = self.sftp.get() {
            let _ = sftp.close().await;
        }
        remote::disconnect(&self.handle).await;
    }
}

/// Connector producing authenticated SSH connections.
pub struct SshConnector {
    settings: ConnectSettings,
}

impl SshConnector {
    pub fn new(settings: ConnectSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Conn = SshConnection;

    async fn connect(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> Result<SshConnection, EngineError> {
        let handle = remote::connect_with_retry(address, credentials, &self.settings, true).await?;
        Ok(SshConnection {
            handle,
            sftp: OnceCell::new(),
            command_timeout: self.settings.command_timeout,
        })
    }
}

struct Slot<T> {
    conn: Option<Arc<T>>,
    verified_at: Option<Instant>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            conn: None,
            verified_at: None,
        }
    }
}

type SlotRef<T> = Arc<Mutex<Slot<T>>>;

/// Pool of remote connections keyed by [`PoolKey`].
pub struct ConnectionPool<C: Connector = SshConnector> {
    connector: C,
    entries: DashMap<PoolKey, SlotRef<C::Conn>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            entries: DashMap::new(),
        }
    }

    /// Return the live connection for `key`, creating it if needed.
    ///
    /// A stale connection is closed and dropped before its replacement is
    /// opened. Connect failures leave no entry behind.
    pub async fn acquire(
        &self,
        key: &PoolKey,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Arc<C::Conn>, EngineError> {
        let slot = self.entries.entry(key.clone()).or_default().clone();
        let mut guard = slot.lock().await;

        if let Some(conn) = guard.conn.clone() {
            let recently_verified = guard
                .verified_at
                .is_some_and(|at| at.elapsed() < LIVENESS_GRACE);
            if recently_verified {
                return Ok(conn);
            }
            if conn.is_alive() {
                guard.verified_at = Some(Instant::now());
                return Ok(conn);
            }
            debug!("Evicting dead connection for {:?}", key);
            guard.conn = None;
            guard.verified_at = None;
            conn.close().await;
        }

        let conn = match self.connector.connect(address, credentials).await {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                drop(guard);
                // Only drop the slot if nobody else is queued on it.
                self.entries.remove_if(key, |_, current| {
                    Arc::ptr_eq(current, &slot) && Arc::strong_count(current) <= 2
                });
                return Err(e);
            }
        };

        if self.is_current(key, &slot) {
            guard.conn = Some(conn.clone());
            guard.verified_at = Some(Instant::now());
            info!(
                "Pooled connection to {} for {:?}/{}",
                address, key.scope, key.device
            );
        } else {
            debug!("{:?} released while connecting, not caching", key);
        }

        Ok(conn)
    }

    fn is_current(&self, key: &PoolKey, slot: &SlotRef<C::Conn>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    /// Remove and close the entry for `key`. Unknown keys are a no-op.
    pub async fn release(&self, key: &PoolKey) {
        let Some((_, slot)) = self.entries.remove(key) else {
            return;
        };
        let conn = slot.lock().await.conn.take();
        if let Some(conn) = conn {
            debug!("Releasing pooled connection {:?}", key);
            conn.close().await;
        }
    }

    /// Release every entry owned by `client`.
    pub async fn release_client(&self, client: &str) {
        let keys: Vec<PoolKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().client == client)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.release(&key).await;
        }
    }

    /// Drain every entry. Used at shutdown.
    pub async fn close_all(&self) {
        let keys: Vec<PoolKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let count = keys.len();
        for key in keys {
            self.release(&key).await;
        }
        if count > 0 {
            info!("Closed {} pooled connection(s)", count);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &PoolKey) -> bool {
        self.entries.contains_key(key)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::fakes::{FakeConnection, FakeConnector};
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            username: "ops".into(),
            password: Some("pw".into()),
            key_path: None,
        }
    }

    mod acquire {
        use super::*;

        #[tokio::test]
        async fn test_concurrent_acquire_creates_one_connection() {
            let pool = Arc::new(ConnectionPool::new(FakeConnector {
                delay: Duration::from_millis(50),
                ..Default::default()
            }));
            let key = PoolKey::new("c1", "dev-1", PoolScope::Stats);

            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let pool = pool.clone();
                    let key = key.clone();
                    tokio::spawn(async move { pool.acquire(&key, "10.0.0.1", &creds()).await })
                })
                .collect();

            let conns: Vec<Arc<FakeConnection>> = futures::future::join_all(tasks)
                .await
                .into_iter()
                .map(|r| r.unwrap().unwrap())
                .collect();

            assert_eq!(pool.connector.connect_count(), 1);
            assert!(conns.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
            assert_eq!(pool.len(), 1);
        }

        #[tokio::test]
        async fn test_dead_entry_is_closed_and_replaced() {
            let pool = ConnectionPool::new(FakeConnector::default());
            let key = PoolKey::new("c1", "dev-1", PoolScope::Files);

            let first = pool.acquire(&key, "10.0.0.1", &creds()).await.unwrap();
            first.kill();
            tokio::time::sleep(LIVENESS_GRACE + Duration::from_millis(50)).await;

            let second = pool.acquire(&key, "10.0.0.1", &creds()).await.unwrap();

            assert!(!Arc::ptr_eq(&first, &second));
            assert!(first.closed.load(Ordering::SeqCst));
            assert!(second.is_alive());
            assert_eq!(pool.connector.connect_count(), 2);
            assert_eq!(pool.len(), 1);
        }

        #[tokio::test]
        async fn test_scopes_get_independent_entries() {
            let pool = ConnectionPool::new(FakeConnector::default());
            let stats = PoolKey::new("c1", "dev-1", PoolScope::Stats);
            let files = PoolKey::new("c1", "dev-1", PoolScope::Files);

            let a = pool.acquire(&stats, "10.0.0.1", &creds()).await.unwrap();
            let b = pool.acquire(&files, "10.0.0.1", &creds()).await.unwrap();

            assert!(!Arc::ptr_eq(&a, &b));
            pool.release(&files).await;
            assert!(a.is_alive());
            assert!(b.closed.load(Ordering::SeqCst));
        }

        #[tokio::test]
        async fn test_connect_failure_leaves_no_entry() {
            let pool = ConnectionPool::new(FakeConnector::failing(EngineError::Connect(
                "Connection refused".into(),
            )));
            let key = PoolKey::new("c1", "dev-9", PoolScope::Stats);

            let err = pool.acquire(&key, "10.0.0.9", &creds()).await.unwrap_err();

            assert!(matches!(err, EngineError::Connect(_)));
            assert!(!pool.contains(&key));
        }
    }

    mod release {
        use super::*;

        #[tokio::test]
        async fn test_release_is_idempotent() {
            let pool = ConnectionPool::new(FakeConnector::default());
            let key = PoolKey::new("c1", "dev-1", PoolScope::Control);
            let conn = pool.acquire(&key, "10.0.0.1", &creds()).await.unwrap();

            pool.release(&key).await;
            pool.release(&key).await;

            assert!(conn.closed.load(Ordering::SeqCst));
            assert!(pool.is_empty());
        }

        #[tokio::test]
        async fn test_release_client_only_touches_that_client() {
            let pool = ConnectionPool::new(FakeConnector::default());
            let mine = PoolKey::new("c1", "dev-1", PoolScope::Stats);
            let theirs = PoolKey::new("c2", "dev-1", PoolScope::Stats);
            pool.acquire(&mine, "10.0.0.1", &creds()).await.unwrap();
            let other = pool.acquire(&theirs, "10.0.0.1", &creds()).await.unwrap();

            pool.release_client("c1").await;

            assert!(!pool.contains(&mine));
            assert!(pool.contains(&theirs));
            assert!(other.is_alive());
        }

        #[tokio::test]
        async fn test_close_all_drains() {
            let pool = ConnectionPool::new(FakeConnector::default());
            for device in ["a", "b", "c"] {
                let key = PoolKey::new("c1", device, PoolScope::Stats);
                pool.acquire(&key, "10.0.0.1", &creds()).await.unwrap();
            }
            pool.close_all().await;
            assert!(pool.is_empty());
        }
    }
}
