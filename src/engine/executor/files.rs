//! Remote file browser: listing, read, write, search.

use std::sync::Arc;

use tracing::{debug, info};

use super::shell_quote;
use crate::engine::error::EngineError;
use crate::engine::pool::{
    ConnectionPool, Connector, PoolKey, PoolScope, RemoteConnection, SshConnector,
};
use crate::engine::types::{DeviceTarget, DirEntry, FileContent, SearchResult};

const SEARCH_DEPTH: u32 = 5;
const SEARCH_SCAN_LIMIT: usize = 100;
pub(crate) const MAX_SEARCH_RESULTS: usize = 50;

pub struct FileExecutor<C: Connector = SshConnector> {
    pool: Arc<ConnectionPool<C>>,
}

impl<C: Connector> FileExecutor<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>) -> Self {
        Self { pool }
    }

    async fn connection(
        &self,
        client: &str,
        target: &DeviceTarget,
    ) -> Result<Arc<C::Conn>, EngineError> {
        let key = PoolKey::new(client, target.device.as_str(), PoolScope::Files);
        self.pool
            .acquire(&key, &target.address, &target.credentials)
            .await
    }

    /// Directory entries, directories first then by name, case-insensitive.
    pub async fn list_dir(
        &self,
        client: &str,
        target: &DeviceTarget,
        path: &str,
    ) -> Result<Vec<DirEntry>, EngineError> {
        let conn = self.connection(client, target).await?;
        let mut entries = conn.list_dir(path).await?;
        sort_entries(&mut entries);
        debug!("Listed {} entries in {} on {}", entries.len(), path, target.device);
        Ok(entries)
    }

    /// File content as text; binary files are reported without content.
    pub async fn read_file(
        &self,
        client: &str,
        target: &DeviceTarget,
        path: &str,
    ) -> Result<FileContent, EngineError> {
        let conn = self.connection(client, target).await?;
        let bytes = conn.read_file(path).await?;
        Ok(decode_content(path, bytes))
    }

    pub async fn write_file(
        &self,
        client: &str,
        target: &DeviceTarget,
        path: &str,
        content: &str,
    ) -> Result<(), EngineError> {
        let conn = self.connection(client, target).await?;
        conn.write_file(path, content.as_bytes()).await?;
        info!("Wrote {} bytes to {} on {}", content.len(), path, target.device);
        Ok(())
    }

    /// Case-insensitive filename search under `root`.
    pub async fn search(
        &self,
        client: &str,
        target: &DeviceTarget,
        root: &str,
        query: &str,
    ) -> Result<Vec<SearchResult>, EngineError> {
        let command = build_search_command(root, query)?;
        let conn = self.connection(client, target).await?;
        let output = conn.exec(&command).await?;
        Ok(parse_search_results(&output.stdout))
    }
}

pub(crate) fn sort_entries(entries: &mut [DirEntry]) {
    entries.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

pub(crate) fn decode_content(path: &str, bytes: Vec<u8>) -> FileContent {
    match String::from_utf8(bytes) {
        Ok(text) => FileContent {
            path: path.to_string(),
            content: Some(text),
            binary: false,
        },
        Err(_) => FileContent {
            path: path.to_string(),
            content: None,
            binary: true,
        },
    }
}

pub(crate) fn build_search_command(root: &str, query: &str) -> Result<String, EngineError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(EngineError::Validation("search query is empty".to_string()));
    }
    let root = if root.trim().is_empty() { "/" } else { root };
    Ok(format!(
        "find {} -maxdepth {} -iname {} -type f 2>/dev/null | head -{}",
        shell_quote(root),
        SEARCH_DEPTH,
        shell_quote(&format!("*{}*", query)),
        SEARCH_SCAN_LIMIT
    ))
}

pub(crate) fn parse_search_results(output: &str) -> Vec<SearchResult> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|path| SearchResult {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
        })
        .take(MAX_SEARCH_RESULTS)
        .collect()
}
