//! Local pseudo-terminal backend.
//!
//! The shell is spawned on the slave side of a `portable-pty` pair. A blocking
//! read pump runs on tokio's blocking pool and forwards chunks over a bounded
//! channel, so polling the session never blocks the scheduler.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use super::ReadOutcome;
use crate::engine::error::EngineError;
use crate::engine::types::Dimensions;

const READ_CHUNK: usize = 4096;
const PUMP_DEPTH: usize = 256;
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_millis(50);

type ShellChild = Arc<StdMutex<Box<dyn Child + Send + Sync>>>;

pub(crate) struct LocalPty {
    master: StdMutex<Box<dyn MasterPty + Send>>,
    child: ShellChild,
    writer: Arc<StdMutex<Box<dyn Write + Send>>>,
    output: Mutex<mpsc::Receiver<Vec<u8>>>,
}

fn pty_size(dimensions: Dimensions) -> PtySize {
    PtySize {
        rows: dimensions.rows,
        cols: dimensions.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl LocalPty {
    /// Spawn `shell` attached to a new pseudo-terminal.
    pub(crate) async fn spawn(shell: String, dimensions: Dimensions) -> Result<Self, EngineError> {
        tokio::task::spawn_blocking(move || Self::spawn_blocking(&shell, dimensions))
            .await
            .map_err(|e| EngineError::Connect(format!("spawn task failed: {}", e)))?
    }

    fn spawn_blocking(shell: &str, dimensions: Dimensions) -> Result<Self, EngineError> {
        let pair = native_pty_system()
            .openpty(pty_size(dimensions))
            .map_err(|e| EngineError::Connect(format!("cannot open pty: {}", e)))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        if let Ok(home) = std::env::var("HOME") {
            cmd.cwd(home);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| EngineError::Connect(format!("cannot spawn {}: {}", shell, e)))?;
        // The master only sees EOF once every slave handle is gone.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| EngineError::Connect(format!("pty reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| EngineError::Connect(format!("pty writer: {}", e)))?;

        let (tx, rx) = mpsc::channel(PUMP_DEPTH);
        tokio::task::spawn_blocking(move || read_pump(reader, tx));

        debug!("Spawned local shell {} (pid {:?})", shell, child.process_id());

        Ok(Self {
            master: StdMutex::new(pair.master),
            child: Arc::new(StdMutex::new(child)),
            writer: Arc::new(StdMutex::new(writer)),
            output: Mutex::new(rx),
        })
    }

    pub(crate) async fn read(&self, poll: Duration) -> ReadOutcome {
        let mut rx = self.output.lock().await;
        match tokio::time::timeout(poll, rx.recv()).await {
            Ok(Some(chunk)) => ReadOutcome::Data(chunk),
            Ok(None) => ReadOutcome::Eof,
            Err(_) => ReadOutcome::Empty,
        }
    }

    pub(crate) async fn write(&self, data: Vec<u8>) -> Result<(), EngineError> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| EngineError::Transport("pty writer poisoned".to_string()))?;
            writer
                .write_all(&data)
                .and_then(|_| writer.flush())
                .map_err(|e| EngineError::Transport(format!("pty write: {}", e)))
        })
        .await
        .map_err(|e| EngineError::Transport(format!("pty write task: {}", e)))?
    }

    pub(crate) fn resize(&self, dimensions: Dimensions) -> Result<(), EngineError> {
        let master = self
            .master
            .lock()
            .map_err(|_| EngineError::Transport("pty master poisoned".to_string()))?;
        master
            .resize(pty_size(dimensions))
            .map_err(|e| EngineError::Transport(format!("pty resize: {}", e)))
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.lock().ok().and_then(|child| child.process_id())
    }

    /// Terminate the shell and its process group, then reap it.
    ///
    /// Signalling and waiting block, so both run on the blocking pool.
    pub(crate) async fn close(&self) {
        debug!("Closing local shell (pid {:?})", self.pid());
        let child = self.child.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || terminate(&child)).await {
            warn!("Local shell teardown task failed: {}", e);
        }
    }
}

fn terminate(child: &StdMutex<Box<dyn Child + Send + Sync>>) {
    let mut child = match child.lock() {
        Ok(child) => child,
        Err(_) => {
            warn!("Local shell handle poisoned, process not killed");
            return;
        }
    };

    if let Ok(Some(status)) = child.try_wait() {
        debug!("Local shell already exited: {:?}", status);
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.process_id() {
        kill_process_group(pid);
    }

    if let Err(e) = child.kill() {
        debug!("Kill of local shell failed: {}", e);
    }
    match child.wait() {
        Ok(status) => debug!("Local shell exited: {:?}", status),
        Err(e) => warn!("Cannot reap local shell: {}", e),
    }
}

/// The shell leads its own session, so its pid is also the group id.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let pgid = Pid::from_raw(raw);
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        debug!("SIGTERM to process group {} failed: {}", pid, e);
    }
    std::thread::sleep(TERM_GRACE);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("SIGKILL to process group {} failed: {}", pid, e);
    }
}

fn read_pump(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports a hung-up pty.
                debug!("pty read ended: {}", e);
                break;
            }
        }
    }
    debug!("pty read pump exited");
}
