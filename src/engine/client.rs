//! Remote connection establishment and channel primitives.
//!
//! ## Connection Lifecycle
//!
//! 1. **Address Parsing**: `host:port` or bare `host` (port 22).
//! 2. **Client Configuration**: keepalive every 30s, inactivity timeout
//!    disabled for long-lived (pooled or interactive) connections.
//! 3. **Connection Establishment**: TCP + handshake bounded by the connect
//!    timeout.
//! 4. **Authentication**: [`AuthChain`] built from the device credentials.
//!
//! ## Retry Strategy
//!
//! Connect attempts use exponential backoff with jitter via `backon`. Only
//! errors that [`EngineError::is_retryable`] accepts are repeated, so a wrong
//! password fails fast.
//!
//! ## Channels
//!
//! - [`execute_command`]: one exec channel per command, output collected under
//!   a timeout. On timeout the partial output is returned with `timed_out`.
//! - [`open_shell`]: PTY + shell channel, split into read and write halves.
//! - [`open_sftp`]: SFTP subsystem channel.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect, client};
use russh_sftp::client::SftpSession;
use tracing::{debug, error, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::config::{ConnectSettings, MAX_RETRY_DELAY};
use super::error::EngineError;
use super::handler::DeviceHandler;
use super::types::{Credentials, Dimensions};

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// -1 when the server sent no exit status or the command timed out.
    pub exit_code: i32,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Build the russh client configuration.
///
/// `persistent` disables the inactivity timeout; pooled and interactive
/// connections rely on keepalives instead.
pub(crate) fn build_client_config(timeout: Duration, persistent: bool) -> Arc<client::Config> {
    let inactivity_timeout = if persistent { None } else { Some(timeout) };

    Arc::new(client::Config {
        inactivity_timeout,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Split `host:port` into its parts, defaulting the port to 22.
///
/// A bare IPv6 literal is host-only; IPv6 with a port is written `[host]:port`.
pub(crate) fn parse_address(address: &str) -> Result<(String, u16), EngineError> {
    if address.parse::<IpAddr>().is_ok() {
        return Ok((address.to_string(), 22));
    }

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            EngineError::Validation(format!("unclosed bracket in '{}'", address))
        })?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), parse_port(address, port)?)),
            None if tail.is_empty() => Ok((host.to_string(), 22)),
            None => Err(EngineError::Validation(format!(
                "unexpected text after ']' in '{}'",
                address
            ))),
        };
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Ok((host.to_string(), parse_port(address, port)?))
        }
        _ => Ok((address.to_string(), 22)),
    }
}

fn parse_port(address: &str, port: &str) -> Result<u16, EngineError> {
    port.parse::<u16>()
        .map_err(|e| EngineError::Validation(format!("invalid port in '{}': {}", address, e)))
}

/// Connect and authenticate, retrying transient failures.
pub(crate) async fn connect_with_retry(
    address: &str,
    credentials: &Credentials,
    settings: &ConnectSettings,
    persistent: bool,
) -> Result<client::Handle<DeviceHandler>, EngineError> {
    let attempts = AtomicU32::new(0);
    let counter = &attempts;

    let backoff = ExponentialBuilder::default()
        .with_min_delay(settings.retry_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(settings.max_retries as usize)
        .with_jitter();

    let result = (|| async move {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            warn!(
                "Connect retry {} to {}@{}",
                attempt, credentials.username, address
            );
        }
        connect(address, credentials, settings.connect_timeout, persistent).await
    })
    .retry(backoff)
    .when(|e: &EngineError| {
        let retryable = e.is_retryable();
        if !retryable {
            warn!(
                "Connect to {}@{} failed permanently: {}",
                credentials.username, address, e
            );
        }
        retryable
    })
    .notify(|err: &EngineError, dur: Duration| {
        warn!("Connect failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total = attempts.load(Ordering::SeqCst);
    match result {
        Ok(handle) => {
            if total > 1 {
                info!(
                    "Connected to {}@{} after {} attempt(s)",
                    credentials.username, address, total
                );
            }
            Ok(handle)
        }
        Err(e) => {
            error!(
                "Connect to {}@{} failed after {} attempt(s): {}",
                credentials.username, address, total, e
            );
            Err(e)
        }
    }
}

async fn connect(
    address: &str,
    credentials: &Credentials,
    timeout: Duration,
    persistent: bool,
) -> Result<client::Handle<DeviceHandler>, EngineError> {
    let (host, port) = parse_address(address)?;
    let config = build_client_config(timeout, persistent);

    let mut handle = tokio::time::timeout(
        timeout,
        client::connect(config, (host.as_str(), port), DeviceHandler),
    )
    .await
    .map_err(|_| EngineError::Connect(format!("connection timed out after {:?}", timeout)))?
    .map_err(|e| EngineError::Connect(format!("failed to connect: {}", e)))?;

    let chain = AuthChain::from_credentials(credentials);
    if !chain.authenticate(&mut handle, &credentials.username).await? {
        return Err(EngineError::Connect(
            "all authentication methods failed".to_string(),
        ));
    }

    debug!("Authenticated {}@{}", credentials.username, address);
    Ok(handle)
}

/// Best-effort polite disconnect.
pub(crate) async fn disconnect(handle: &client::Handle<DeviceHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "closed", "en")
        .await
    {
        debug!("Disconnect failed (connection likely gone): {}", e);
    }
}

/// Run one command and collect its output.
pub(crate) async fn execute_command(
    handle: &client::Handle<DeviceHandler>,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, EngineError> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut stdout = Vec::with_capacity(4096);
    let mut stderr = Vec::new();
    let mut exit_code: Option<u32> = None;

    let collected = tokio::time::timeout(timeout, async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    stderr.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Eof) if exit_code.is_some() => break,
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    })
    .await;

    let timed_out = collected.is_err();
    if timed_out {
        warn!(
            "Command timed out after {:?} ({} bytes collected)",
            timeout,
            stdout.len()
        );
    }

    let _ = channel.close().await;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: exit_code.map(|c| c as i32).unwrap_or(-1),
        timed_out,
    })
}

/// Open an interactive shell channel sized to `dimensions`.
pub(crate) async fn open_shell(
    handle: &client::Handle<DeviceHandler>,
    dimensions: Dimensions,
) -> Result<(ChannelReadHalf, ChannelWriteHalf<client::Msg>), EngineError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| EngineError::Connect(format!("cannot open channel: {}", e)))?;

    channel
        .request_pty(
            false,
            "xterm-256color",
            dimensions.cols as u32,
            dimensions.rows as u32,
            0,
            0,
            &[],
        )
        .await
        .map_err(|e| EngineError::Connect(format!("PTY request failed: {}", e)))?;

    channel
        .request_shell(false)
        .await
        .map_err(|e| EngineError::Connect(format!("shell request failed: {}", e)))?;

    Ok(channel.split())
}

/// Open the SFTP subsystem on a new channel.
pub(crate) async fn open_sftp(
    handle: &client::Handle<DeviceHandler>,
) -> Result<SftpSession, EngineError> {
    let channel = handle.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    let sftp = SftpSession::new(channel.into_stream()).await?;
    debug!("SFTP subsystem opened");
    Ok(sftp)
}
