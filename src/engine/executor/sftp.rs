//! SFTP primitives behind [`SshConnection`](crate::engine::pool::SshConnection).
//!
//! Every call is bounded by the command timeout so a stalled transfer
//! surfaces as a transport error instead of hanging the caller.

use std::future::Future;
use std::time::Duration;

use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::AsyncWriteExt;

use crate::engine::error::EngineError;
use crate::engine::types::DirEntry;

pub(crate) async fn list_dir(
    sftp: &SftpSession,
    path: &str,
    timeout: Duration,
) -> Result<Vec<DirEntry>, EngineError> {
    let listing = bounded(timeout, sftp.read_dir(path)).await??;

    Ok(listing
        .filter_map(|entry| {
            let name = entry.file_name();
            if name == "." || name == ".." {
                return None;
            }
            let meta = entry.metadata();
            let is_directory = meta.is_dir();
            Some(DirEntry {
                path: join_path(path, &name),
                name,
                is_directory,
                is_symlink: meta.is_symlink(),
                size: if is_directory { 0 } else { meta.size.unwrap_or(0) },
                modified: meta.mtime.map(u64::from).unwrap_or(0),
                permissions: format_permissions(meta.permissions),
            })
        })
        .collect())
}

pub(crate) async fn read_file(
    sftp: &SftpSession,
    path: &str,
    timeout: Duration,
) -> Result<Vec<u8>, EngineError> {
    Ok(bounded(timeout, sftp.read(path)).await??)
}

/// One open/write/close cycle with create and truncate.
pub(crate) async fn write_file(
    sftp: &SftpSession,
    path: &str,
    content: &[u8],
    timeout: Duration,
) -> Result<(), EngineError> {
    bounded(timeout, async {
        let mut file = sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await?;
        file.write_all(content)
            .await
            .map_err(|e| EngineError::Transport(format!("write {}: {}", path, e)))?;
        file.flush()
            .await
            .map_err(|e| EngineError::Transport(format!("flush {}: {}", path, e)))?;
        file.shutdown()
            .await
            .map_err(|e| EngineError::Transport(format!("close {}: {}", path, e)))?;
        Ok::<(), EngineError>(())
    })
    .await?
}

async fn bounded<T>(timeout: Duration, op: impl Future<Output = T>) -> Result<T, EngineError> {
    tokio::time::timeout(timeout, op).await.map_err(|_| {
        EngineError::Transport(format!("file operation timed out after {:?}", timeout))
    })
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Low nine mode bits as three octal digits.
fn format_permissions(mode: Option<u32>) -> String {
    format!("{:03o}", mode.unwrap_or(0) & 0o777)
}
