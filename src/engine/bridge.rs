//! Event bridge and engine facade.
//!
//! [`Engine`] owns the session registry, the connection pool, the executors
//! and the reachability monitor, and routes events between them and the
//! connected clients.
//!
//! # Clients
//!
//! Each connected client gets a [`ClientSubscription`]: its outgoing event
//! channel, the sessions it opened and its active stats streams. Session
//! output goes only to the owning client; fleet status transitions go to
//! every client.
//!
//! # Teardown
//!
//! `disconnect` cascades: the client's cancellation token stops its output
//! pumps, stats streams and in-flight requests, every owned session is
//! closed, and every pooled connection keyed to the client is released.
//! `shutdown` does the same for every client, then stops the monitor and
//! drains whatever is left.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::EngineSettings;
use super::error::EngineError;
use super::events::{ClientEvent, OpenSessionRequest, ServerEvent};
use super::executor::{FileExecutor, StatsExecutor};
use super::monitor::{Inventory, PingProber, Prober, ReachabilityMonitor};
use super::pool::{ConnectionPool, Connector, PoolKey, PoolScope, SshConnector};
use super::registry::{OpenedSession, ReadOutcome, SessionRegistry};
use super::types::{
    ClientId, DeviceId, DeviceStatusUpdate, DeviceTarget, Dimensions, SessionId, SessionKind,
};

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

/// Everything one connected client owns.
pub struct ClientSubscription {
    sender: EventSender,
    sessions: HashSet<SessionId>,
    monitor_tasks: HashMap<DeviceId, CancellationToken>,
    /// Parent of every task spawned on the client's behalf.
    cancel: CancellationToken,
}

pub struct Engine<C: Connector = SshConnector, P: Prober = PingProber> {
    settings: EngineSettings,
    registry: SessionRegistry,
    pool: Arc<ConnectionPool<C>>,
    stats: StatsExecutor<C>,
    files: FileExecutor<C>,
    monitor: Arc<ReachabilityMonitor<P>>,
    clients: DashMap<ClientId, ClientSubscription>,
    shutdown: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Engine over SSH connections and `ping` probes.
    pub fn new(settings: EngineSettings, inventory: Arc<dyn Inventory>) -> Arc<Self> {
        Self::with_parts(
            settings,
            SshConnector::new(settings.connect),
            PingProber,
            inventory,
            SessionRegistry::new(&settings),
        )
    }
}

impl<C: Connector, P: Prober> Engine<C, P> {
    pub fn with_parts(
        settings: EngineSettings,
        connector: C,
        prober: P,
        inventory: Arc<dyn Inventory>,
        registry: SessionRegistry,
    ) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::new(connector));
        Arc::new(Self {
            settings,
            registry,
            stats: StatsExecutor::new(pool.clone()),
            files: FileExecutor::new(pool.clone()),
            pool,
            monitor: Arc::new(ReachabilityMonitor::new(inventory, prober, settings.monitor)),
            clients: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<ReachabilityMonitor<P>> {
        &self.monitor
    }

    /// Start the reachability sweep and fan its transitions out to clients.
    pub fn start(self: &Arc<Self>) {
        let events = self.monitor.subscribe();
        let monitor = self.monitor.start(self.shutdown.child_token());
        let forwarder = tokio::spawn(self.clone().forward_fleet_events(events));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(monitor);
            tasks.push(forwarder);
        }
    }

    async fn forward_fleet_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<DeviceStatusUpdate>,
    ) {
        loop {
            let update = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                update = events.recv() => update,
            };
            match update {
                Ok(update) => self.broadcast(ServerEvent::DeviceStatusUpdate(update)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Fleet event forwarder lagged, {} update(s) dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Fleet event forwarder stopped");
    }

    /// Register a new client and return its id and event stream.
    pub fn connect(&self) -> (ClientId, EventReceiver) {
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.clients.insert(
            id.clone(),
            ClientSubscription {
                sender,
                sessions: HashSet::new(),
                monitor_tasks: HashMap::new(),
                cancel: self.shutdown.child_token(),
            },
        );
        info!("Client {} connected", id);
        (id, receiver)
    }

    /// Drop a client and everything it owns. Unknown clients are a no-op.
    pub async fn disconnect(&self, client: &str) {
        let Some((_, subscription)) = self.clients.remove(client) else {
            return;
        };
        subscription.cancel.cancel();
        for token in subscription.monitor_tasks.values() {
            token.cancel();
        }
        for id in &subscription.sessions {
            self.registry.close(id).await;
        }
        self.pool.release_client(client).await;
        info!(
            "Client {} disconnected ({} session(s), {} stats stream(s) torn down)",
            client,
            subscription.sessions.len(),
            subscription.monitor_tasks.len()
        );
    }

    pub fn is_connected(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Dispatch one client event.
    ///
    /// Session input, resize and close are applied before this returns so
    /// they keep their order. Anything that may touch the network runs on its
    /// own task and answers through the client's event stream.
    pub async fn handle(self: &Arc<Self>, client: &str, event: ClientEvent) {
        let Some(cancel) = self.client_token(client) else {
            debug!("Ignoring event from unknown client {}", client);
            return;
        };

        match event {
            ClientEvent::OpenSession(request) => {
                // Not cancellable: a session that finishes opening after its
                // client left is closed by open_session itself.
                let engine = self.clone();
                let client = client.to_string();
                tokio::spawn(async move { engine.open_session(&client, request).await });
            }
            ClientEvent::SessionInput { id, data } => {
                if self.owns(client, &id) {
                    self.registry.write(&id, data.as_bytes()).await;
                }
            }
            ClientEvent::SessionResize { id, cols, rows } => {
                if self.owns(client, &id) {
                    self.registry.resize(&id, Dimensions::new(cols, rows)).await;
                }
            }
            ClientEvent::CloseSession { id } => {
                // The output pump sees the close and reports session_closed.
                if self.owns(client, &id) {
                    self.registry.close(&id).await;
                }
            }
            ClientEvent::StartStatsStream(target) => self.start_stats_stream(client, target),
            ClientEvent::StopStatsStream { device } => self.stop_stats_stream(client, &device).await,
            ClientEvent::GetDeviceStatus { device } => {
                let status = self.monitor.status_of(&device);
                self.send(client, ServerEvent::DeviceStatus { device, status });
            }
            request => {
                let engine = self.clone();
                let client = client.to_string();
                tokio::spawn(async move {
                    let reply = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        reply = engine.execute(&client, request) => reply,
                    };
                    if let Some(reply) = reply {
                        engine.send(&client, reply);
                    }
                });
            }
        }
    }

    async fn open_session(self: &Arc<Self>, client: &str, request: OpenSessionRequest) {
        let remote = match (request.kind, request.remote_config.as_ref()) {
            (SessionKind::Local, _) => None,
            (SessionKind::Remote, Some(config)) => Some(config),
            (SessionKind::Remote, None) => {
                self.send(
                    client,
                    session_error(EngineError::Validation(
                        "remote session requires remoteConfig".to_string(),
                    )),
                );
                return;
            }
        };

        let opened = match self.registry.open(request.dimensions(), remote).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Client {} could not open {} session: {}", client, request.kind, e);
                self.send(client, session_error(e));
                return;
            }
        };
        self.attach_session(client, opened).await;
    }

    /// Hand an opened session to its client and start forwarding output.
    async fn attach_session(self: &Arc<Self>, client: &str, opened: OpenedSession) {
        let cancel = match self.clients.get_mut(client) {
            Some(mut subscription) => {
                subscription.sessions.insert(opened.id.clone());
                Some(subscription.cancel.child_token())
            }
            None => None,
        };
        let Some(cancel) = cancel else {
            debug!("Client {} left while session {} opened", client, opened.id);
            self.registry.close(&opened.id).await;
            return;
        };

        self.send(
            client,
            ServerEvent::SessionOpened {
                id: opened.id.clone(),
                kind: opened.kind,
                host: opened.host,
            },
        );
        tokio::spawn(
            self.clone()
                .pump_session(client.to_string(), opened.id, cancel),
        );
    }

    /// Forward a session's output to its owner until the session ends.
    async fn pump_session(self: Arc<Self>, client: ClientId, id: SessionId, cancel: CancellationToken) {
        let mut carry = Utf8Carry::default();
        loop {
            let outcome = tokio::select! {
                biased;
                // Disconnect closes the session itself; nobody to notify.
                _ = cancel.cancelled() => return,
                outcome = self.registry.read(&id) => outcome,
            };
            match outcome {
                ReadOutcome::Empty => {}
                ReadOutcome::Data(bytes) => {
                    let data = carry.push(&bytes);
                    if !data.is_empty() {
                        self.send(&client, ServerEvent::SessionOutput { id: id.clone(), data });
                    }
                }
                ReadOutcome::Eof => break,
            }
        }

        let rest = carry.finish();
        if !rest.is_empty() {
            self.send(&client, ServerEvent::SessionOutput { id: id.clone(), data: rest });
        }
        if let Some(mut subscription) = self.clients.get_mut(&client) {
            subscription.sessions.remove(&id);
        }
        self.send(&client, ServerEvent::SessionClosed { id });
    }

    fn start_stats_stream(self: &Arc<Self>, client: &str, target: DeviceTarget) {
        let token = {
            let Some(mut subscription) = self.clients.get_mut(client) else {
                return;
            };
            let token = subscription.cancel.child_token();
            if let Some(prior) = subscription
                .monitor_tasks
                .insert(target.device.clone(), token.clone())
            {
                debug!("Replacing stats stream for {} on {}", client, target.device);
                prior.cancel();
            }
            token
        };

        info!("Client {} streaming stats from {}", client, target.device);
        tokio::spawn(
            self.clone()
                .stream_stats(client.to_string(), target, token),
        );
    }

    async fn stream_stats(self: Arc<Self>, client: ClientId, target: DeviceTarget, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.stats.system_stats(&client, &target) => result,
            };
            let event = match result {
                Ok(stats) => ServerEvent::StatsUpdate {
                    device: target.device.clone(),
                    stats,
                },
                Err(e) => {
                    warn!("Stats for {} failed: {}", target.device, e);
                    ServerEvent::StatsStreamError {
                        device: target.device.clone(),
                        error: e.to_string(),
                    }
                }
            };
            self.send(&client, event);
        }
        debug!("Stats stream for {} on {} stopped", client, target.device);
    }

    async fn stop_stats_stream(&self, client: &str, device: &str) {
        let token = self
            .clients
            .get_mut(client)
            .and_then(|mut subscription| subscription.monitor_tasks.remove(device));
        let Some(token) = token else {
            return;
        };
        token.cancel();
        self.pool
            .release(&PoolKey::new(client, device, PoolScope::Stats))
            .await;
        info!("Client {} stopped stats stream from {}", client, device);
    }

    async fn execute(&self, client: &str, request: ClientEvent) -> Option<ServerEvent> {
        let reply = match request {
            ClientEvent::ListDir(req) => {
                match self.files.list_dir(client, &req.target, &req.path).await {
                    Ok(entries) => ServerEvent::DirectoryListed {
                        device: req.target.device,
                        path: req.path,
                        entries,
                    },
                    Err(e) => file_error(req.target.device, e),
                }
            }
            ClientEvent::ReadFile(req) => {
                match self.files.read_file(client, &req.target, &req.path).await {
                    Ok(file) => ServerEvent::FileRead {
                        device: req.target.device,
                        path: file.path,
                        content: file.content,
                        binary: file.binary,
                    },
                    Err(e) => file_error(req.target.device, e),
                }
            }
            ClientEvent::WriteFile(req) => {
                match self
                    .files
                    .write_file(client, &req.target, &req.path, &req.content)
                    .await
                {
                    Ok(()) => ServerEvent::FileWritten {
                        device: req.target.device,
                        path: req.path,
                    },
                    Err(e) => file_error(req.target.device, e),
                }
            }
            ClientEvent::SearchFiles(req) => {
                match self
                    .files
                    .search(client, &req.target, &req.path, &req.query)
                    .await
                {
                    Ok(results) => ServerEvent::FilesSearched {
                        device: req.target.device,
                        query: req.query,
                        results,
                    },
                    Err(e) => file_error(req.target.device, e),
                }
            }
            ClientEvent::ListServices(target) => {
                match self.stats.list_services(client, &target).await {
                    Ok(services) => ServerEvent::ServicesListed {
                        device: target.device,
                        services,
                    },
                    Err(e) => device_error(target.device, e),
                }
            }
            ClientEvent::ManageService(req) => {
                match self
                    .stats
                    .manage_service(client, &req.target, &req.service, &req.action)
                    .await
                {
                    Ok(result) => ServerEvent::ServiceManaged {
                        device: req.target.device,
                        result,
                    },
                    Err(e) => device_error(req.target.device, e),
                }
            }
            ClientEvent::ListProcesses(target) => {
                match self.stats.list_processes(client, &target).await {
                    Ok(processes) => ServerEvent::ProcessesListed {
                        device: target.device,
                        processes,
                    },
                    Err(e) => device_error(target.device, e),
                }
            }
            ClientEvent::ManageProcess(req) => {
                match self
                    .stats
                    .manage_process(client, &req.target, &req.pid, &req.action)
                    .await
                {
                    Ok(result) => ServerEvent::ProcessManaged {
                        device: req.target.device,
                        result,
                    },
                    Err(e) => device_error(req.target.device, e),
                }
            }
            _ => return None,
        };
        Some(reply)
    }

    fn client_token(&self, client: &str) -> Option<CancellationToken> {
        self.clients.get(client).map(|s| s.cancel.clone())
    }

    fn owns(&self, client: &str, session: &str) -> bool {
        let owned = self
            .clients
            .get(client)
            .is_some_and(|s| s.sessions.contains(session));
        if !owned {
            debug!("Client {} does not own session {}", client, session);
        }
        owned
    }

    /// Push an event to one client. Unknown or departed clients are skipped.
    pub fn send(&self, client: &str, event: ServerEvent) {
        let Some(subscription) = self.clients.get(client) else {
            return;
        };
        if subscription.sender.send(event).is_err() {
            debug!("Client {} stopped listening", client);
        }
    }

    fn broadcast(&self, event: ServerEvent) {
        for subscription in self.clients.iter() {
            let _ = subscription.sender.send(event.clone());
        }
    }

    /// Stop the monitor, disconnect every client and drain the pool.
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.shutdown.cancel();

        let clients: Vec<ClientId> = self.clients.iter().map(|c| c.key().clone()).collect();
        for client in clients {
            self.disconnect(&client).await;
        }
        self.registry.close_all().await;
        self.pool.close_all().await;

        let tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        join_all(tasks).await;
        info!("Engine stopped");
    }
}

fn session_error(error: EngineError) -> ServerEvent {
    ServerEvent::SessionError {
        message: error.to_string(),
    }
}

fn file_error(device: DeviceId, error: EngineError) -> ServerEvent {
    warn!("File operation on {} failed: {}", device, error);
    ServerEvent::FileError {
        device,
        error: error.to_string(),
    }
}

fn device_error(device: DeviceId, error: EngineError) -> ServerEvent {
    warn!("Operation on {} failed: {}", device, error);
    ServerEvent::DeviceError {
        device,
        error: error.to_string(),
    }
}

/// Holds back a UTF-8 sequence split across two reads.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let boundary = utf8_boundary(&self.pending);
        let tail = self.pending.split_off(boundary);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of the longest prefix of `buf` that does not end inside an
/// incomplete multi-byte sequence.
fn utf8_boundary(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(4) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = if byte & 0x80 == 0 {
            1
        } else if byte & 0xE0 == 0xC0 {
            2
        } else if byte & 0xF0 == 0xE0 {
            3
        } else if byte & 0xF8 == 0xF0 {
            4
        } else {
            return len;
        };
        return if back < width { len - back } else { len };
    }
    len
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::events::ServiceRequest;
    use crate::engine::monitor::{DeviceRecord, StaticInventory};
    use crate::engine::pool::fakes::FakeConnector;
    use crate::engine::types::{Credentials, DeviceStatus};

    const WAIT: Duration = Duration::from_secs(5);

    struct FixedProber {
        reachable: AtomicBool,
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, _address: &str, _timeout: Duration) -> Result<bool, EngineError> {
            Ok(self.reachable.load(Ordering::SeqCst))
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            stats_interval: Duration::from_millis(50),
            read_poll: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn engine_with(connector: FakeConnector) -> Arc<Engine<FakeConnector, FixedProber>> {
        let inventory = StaticInventory::new(vec![DeviceRecord {
            id: "dev-1".into(),
            group: "dc-east".into(),
            address: Some("10.0.0.1".into()),
        }]);
        Engine::with_parts(
            settings(),
            connector,
            FixedProber {
                reachable: AtomicBool::new(false),
            },
            Arc::new(inventory),
            SessionRegistry::with_shell(&settings(), "/bin/sh"),
        )
    }

    fn target() -> DeviceTarget {
        DeviceTarget {
            device: "dev-1".into(),
            address: "10.0.0.1".into(),
            credentials: Credentials {
                username: "ops".into(),
                password: Some("pw".into()),
                key_path: None,
            },
        }
    }

    async fn next_event(rx: &mut EventReceiver) -> ServerEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    mod utf8 {
        use super::*;

        #[test]
        fn test_split_sequence_is_carried() {
            let bytes = "héllo".as_bytes();
            let mut carry = Utf8Carry::default();
            assert_eq!(carry.push(&bytes[..2]), "h");
            assert_eq!(carry.push(&bytes[2..]), "éllo");
            assert_eq!(carry.finish(), "");
        }

        #[test]
        fn test_four_byte_sequence_split_three_ways() {
            let bytes = "a🦀b".as_bytes();
            let mut carry = Utf8Carry::default();
            assert_eq!(carry.push(&bytes[..2]), "a");
            assert_eq!(carry.push(&bytes[2..4]), "");
            assert_eq!(carry.push(&bytes[4..]), "🦀b");
        }

        #[test]
        fn test_dangling_bytes_flushed_lossy_at_end() {
            let mut carry = Utf8Carry::default();
            assert_eq!(carry.push(&[b'x', 0xE2, 0x82]), "x");
            assert_eq!(carry.finish(), "\u{FFFD}");
        }

        #[test]
        fn test_boundary() {
            assert_eq!(utf8_boundary(b""), 0);
            assert_eq!(utf8_boundary(b"abc"), 3);
            assert_eq!(utf8_boundary(&[b'a', 0xC3]), 1);
            assert_eq!(utf8_boundary(&[b'a', 0xC3, 0xA9]), 3);
        }
    }

    mod clients {
        use super::*;

        #[tokio::test]
        async fn test_unknown_client_events_are_ignored() {
            let engine = engine_with(FakeConnector::default());
            engine
                .handle("ghost", ClientEvent::StartStatsStream(target()))
                .await;
            engine.disconnect("ghost").await;
            assert_eq!(engine.client_count(), 0);
            assert!(engine.pool().is_empty());
        }

        #[tokio::test]
        async fn test_device_status_is_unknown_before_sweep() {
            let engine = engine_with(FakeConnector::default());
            let (client, mut rx) = engine.connect();

            engine
                .handle(&client, ClientEvent::GetDeviceStatus { device: "dev-1".into() })
                .await;

            assert_eq!(
                next_event(&mut rx).await,
                ServerEvent::DeviceStatus {
                    device: "dev-1".into(),
                    status: DeviceStatus::Unknown,
                }
            );
        }

        #[tokio::test]
        async fn test_fleet_transitions_reach_every_client() {
            let engine = engine_with(FakeConnector::default());
            let (_a, mut rx_a) = engine.connect();
            let (_b, mut rx_b) = engine.connect();

            engine.start();

            for rx in [&mut rx_a, &mut rx_b] {
                let ServerEvent::DeviceStatusUpdate(update) = next_event(rx).await else {
                    panic!("expected device_status_update");
                };
                assert_eq!(update.device, "dev-1");
                assert_eq!(update.group, "dc-east");
                assert_eq!(update.status, DeviceStatus::Offline);
            }
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_remote_session_without_config_is_session_error() {
            let engine = engine_with(FakeConnector::default());
            let (client, mut rx) = engine.connect();

            engine
                .handle(
                    &client,
                    ClientEvent::OpenSession(OpenSessionRequest {
                        kind: SessionKind::Remote,
                        cols: 80,
                        rows: 24,
                        remote_config: None,
                    }),
                )
                .await;

            assert!(matches!(next_event(&mut rx).await, ServerEvent::SessionError { .. }));
            assert!(engine.registry().is_empty());
        }
    }

    mod stats_streams {
        use super::*;

        #[tokio::test]
        async fn test_unreachable_device_reports_stream_error() {
            let engine = engine_with(FakeConnector::failing(EngineError::Connect(
                "No route to host".into(),
            )));
            let (client, mut rx) = engine.connect();

            engine
                .handle(&client, ClientEvent::StartStatsStream(target()))
                .await;

            match next_event(&mut rx).await {
                ServerEvent::StatsStreamError { device, error } => {
                    assert_eq!(device, "dev-1");
                    assert!(error.contains("No route to host"));
                }
                other => panic!("expected stats_stream_error, got {:?}", other),
            }
            // The stream keeps going after a failure.
            assert!(matches!(
                next_event(&mut rx).await,
                ServerEvent::StatsStreamError { .. }
            ));
            engine.disconnect(&client).await;
        }

        #[tokio::test]
        async fn test_second_stream_replaces_first() {
            let engine = engine_with(FakeConnector::default());
            let (client, _rx) = engine.connect();

            engine
                .handle(&client, ClientEvent::StartStatsStream(target()))
                .await;
            let first = engine
                .clients
                .get(&client)
                .and_then(|s| s.monitor_tasks.get("dev-1").cloned())
                .unwrap();

            engine
                .handle(&client, ClientEvent::StartStatsStream(target()))
                .await;

            assert!(first.is_cancelled());
            let subscription = engine.clients.get(&client).unwrap();
            assert_eq!(subscription.monitor_tasks.len(), 1);
            assert!(!subscription.monitor_tasks["dev-1"].is_cancelled());
        }

        #[tokio::test]
        async fn test_stop_releases_stats_connection() {
            let engine = engine_with(FakeConnector::default());
            let (client, mut rx) = engine.connect();

            engine
                .handle(&client, ClientEvent::StartStatsStream(target()))
                .await;
            assert!(matches!(next_event(&mut rx).await, ServerEvent::StatsUpdate { .. }));
            let key = PoolKey::new(client.as_str(), "dev-1", PoolScope::Stats);
            assert!(engine.pool().contains(&key));

            engine
                .handle(&client, ClientEvent::StopStatsStream { device: "dev-1".into() })
                .await;

            assert!(!engine.pool().contains(&key));
            assert!(engine.clients.get(&client).unwrap().monitor_tasks.is_empty());
        }

        #[tokio::test]
        async fn test_disconnect_cascades() {
            let engine = engine_with(FakeConnector::default());
            let (client, mut rx) = engine.connect();

            engine
                .handle(&client, ClientEvent::StartStatsStream(target()))
                .await;
            assert!(matches!(next_event(&mut rx).await, ServerEvent::StatsUpdate { .. }));
            let token = engine
                .clients
                .get(&client)
                .and_then(|s| s.monitor_tasks.get("dev-1").cloned())
                .unwrap();

            engine.disconnect(&client).await;

            assert!(token.is_cancelled());
            assert!(!engine.is_connected(&client));
            assert!(engine.pool().is_empty());
        }
    }

    mod requests {
        use super::*;

        #[tokio::test]
        async fn test_reboot_is_device_error_without_remote_command() {
            let connector = FakeConnector::default();
            let log = connector.log.clone();
            let engine = engine_with(connector);
            let (client, mut rx) = engine.connect();

            engine
                .handle(
                    &client,
                    ClientEvent::ManageService(ServiceRequest {
                        target: target(),
                        service: "nginx".into(),
                        action: "reboot".into(),
                    }),
                )
                .await;

            match next_event(&mut rx).await {
                ServerEvent::DeviceError { device, error } => {
                    assert_eq!(device, "dev-1");
                    assert!(error.contains("reboot"));
                }
                other => panic!("expected device_error, got {:?}", other),
            }
            assert!(log.lock().unwrap().is_empty());
            assert!(engine.pool().is_empty());
        }

        #[tokio::test]
        async fn test_file_read_failure_is_file_error() {
            let engine = engine_with(FakeConnector::default());
            let (client, mut rx) = engine.connect();

            engine
                .handle(
                    &client,
                    ClientEvent::ReadFile(crate::engine::events::PathRequest {
                        target: target(),
                        path: "/missing".into(),
                    }),
                )
                .await;

            assert!(matches!(next_event(&mut rx).await, ServerEvent::FileError { .. }));
        }

        #[tokio::test]
        async fn test_list_services_reply() {
            let connector = FakeConnector::default().respond(
                "systemctl list-units",
                "nginx.service loaded active running A high performance web server\n",
            );
            let engine = engine_with(connector);
            let (client, mut rx) = engine.connect();

            engine
                .handle(&client, ClientEvent::ListServices(target()))
                .await;

            let ServerEvent::ServicesListed { device, services } = next_event(&mut rx).await else {
                panic!("expected services_listed");
            };
            assert_eq!(device, "dev-1");
            assert_eq!(services[0].name, "nginx");
            assert_eq!(services[0].active, "active");
        }
    }

    mod failed_writes {
        use super::*;

        #[tokio::test]
        async fn test_write_failure_reports_close_once() {
            let engine = engine_with(FakeConnector::default());
            let (client, mut rx) = engine.connect();
            let opened = engine.registry().open_broken();
            let id = opened.id.clone();
            engine.attach_session(&client, opened).await;
            assert!(matches!(
                next_event(&mut rx).await,
                ServerEvent::SessionOpened { id: ref from, .. } if *from == id
            ));

            for _ in 0..2 {
                engine
                    .handle(
                        &client,
                        ClientEvent::SessionInput {
                            id: id.clone(),
                            data: "uptime\n".into(),
                        },
                    )
                    .await;
            }

            let mut closed = 0;
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
            {
                match event {
                    ServerEvent::SessionClosed { id: from } => {
                        assert_eq!(from, id);
                        closed += 1;
                    }
                    other => panic!("unexpected event {:?}", other),
                }
            }
            assert_eq!(closed, 1);
            assert!(!engine.registry().contains(&id));
        }
    }

    #[cfg(all(unix, feature = "local_terminal"))]
    mod local_sessions {
        use super::*;

        async fn open_local(
            engine: &Arc<Engine<FakeConnector, FixedProber>>,
            client: &str,
            rx: &mut EventReceiver,
        ) -> SessionId {
            engine
                .handle(
                    client,
                    ClientEvent::OpenSession(OpenSessionRequest {
                        kind: SessionKind::Local,
                        cols: 80,
                        rows: 24,
                        remote_config: None,
                    }),
                )
                .await;
            match next_event(rx).await {
                ServerEvent::SessionOpened { id, kind, host } => {
                    assert_eq!(kind, SessionKind::Local);
                    assert_eq!(host, "localhost");
                    assert!(!id.is_empty());
                    id
                }
                other => panic!("expected session_opened, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_echo_reaches_owner_and_close_reports_once() {
            let engine = engine_with(FakeConnector::default());
            let (client, mut rx) = engine.connect();
            let id = open_local(&engine, &client, &mut rx).await;

            engine
                .handle(
                    &client,
                    ClientEvent::SessionInput {
                        id: id.clone(),
                        data: "echo hi\n".into(),
                    },
                )
                .await;

            let mut output = String::new();
            while !output.lines().any(|line| line.trim_end_matches('\r') == "hi") {
                match next_event(&mut rx).await {
                    ServerEvent::SessionOutput { id: from, data } => {
                        assert_eq!(from, id);
                        output.push_str(&data);
                    }
                    other => panic!("unexpected event {:?}", other),
                }
            }

            engine
                .handle(&client, ClientEvent::CloseSession { id: id.clone() })
                .await;
            engine
                .handle(&client, ClientEvent::CloseSession { id: id.clone() })
                .await;

            let mut closed = 0;
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
            {
                if event == (ServerEvent::SessionClosed { id: id.clone() }) {
                    closed += 1;
                }
            }
            assert_eq!(closed, 1);
            assert!(engine.registry().is_empty());
        }

        #[tokio::test]
        async fn test_other_client_cannot_drive_session() {
            let engine = engine_with(FakeConnector::default());
            let (owner, mut rx) = engine.connect();
            let (intruder, _intruder_rx) = engine.connect();
            let id = open_local(&engine, &owner, &mut rx).await;

            engine
                .handle(&intruder, ClientEvent::CloseSession { id: id.clone() })
                .await;

            assert!(engine.registry().contains(&id));
            engine.disconnect(&owner).await;
            assert!(!engine.registry().contains(&id));
        }
    }
}
