//! Remote interactive shell backend over a dedicated SSH connection.

use std::time::Duration;

use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, client};
use tokio::sync::Mutex;
use tracing::debug;

use super::ReadOutcome;
use crate::engine::client as remote;
use crate::engine::config::ConnectSettings;
use crate::engine::error::EngineError;
use crate::engine::handler::DeviceHandler;
use crate::engine::types::{Dimensions, RemoteConfig};

pub(crate) struct RemoteShell {
    handle: client::Handle<DeviceHandler>,
    reader: Mutex<ChannelReadHalf>,
    writer: ChannelWriteHalf<client::Msg>,
}

impl RemoteShell {
    /// Connect, authenticate and start a PTY shell sized to `dimensions`.
    pub(crate) async fn open(
        config: &RemoteConfig,
        dimensions: Dimensions,
        settings: &ConnectSettings,
    ) -> Result<Self, EngineError> {
        let handle =
            remote::connect_with_retry(&config.address(), &config.credentials, settings, true)
                .await?;

        let (reader, writer) = match remote::open_shell(&handle, dimensions).await {
            Ok(halves) => halves,
            Err(e) => {
                remote::disconnect(&handle).await;
                return Err(e);
            }
        };

        Ok(Self {
            handle,
            reader: Mutex::new(reader),
            writer,
        })
    }

    pub(crate) async fn read(&self, poll: Duration) -> ReadOutcome {
        let mut reader = self.reader.lock().await;
        match tokio::time::timeout(poll, reader.wait()).await {
            Err(_) => ReadOutcome::Empty,
            Ok(Some(ChannelMsg::Data { data })) => ReadOutcome::Data(data.to_vec()),
            Ok(Some(ChannelMsg::ExtendedData { data, .. })) => ReadOutcome::Data(data.to_vec()),
            Ok(Some(ChannelMsg::Eof | ChannelMsg::Close)) | Ok(None) => ReadOutcome::Eof,
            Ok(Some(ChannelMsg::ExitStatus { exit_status })) => {
                debug!("Remote shell exited with {}", exit_status);
                ReadOutcome::Empty
            }
            Ok(Some(_)) => ReadOutcome::Empty,
        }
    }

    pub(crate) async fn write(&self, data: &[u8]) -> Result<(), EngineError> {
        self.writer
            .data(data)
            .await
            .map_err(|e| EngineError::Transport(format!("channel write: {}", e)))
    }

    pub(crate) async fn resize(&self, dimensions: Dimensions) -> Result<(), EngineError> {
        self.writer
            .window_change(dimensions.cols as u32, dimensions.rows as u32, 0, 0)
            .await?;
        Ok(())
    }

    pub(crate) async fn close(&self) {
        let _ = self.writer.eof().await;
        let _ = self.writer.close().await;
        remote::disconnect(&self.handle).await;
    }
}
