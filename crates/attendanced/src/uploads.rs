//! Snapshot files on disk.

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const MAX_SUFFIX_LEN: usize = 64;
const FALLBACK_SUFFIX: &str = "image";

/// Directory that uploaded snapshots are written to and served from.
#[derive(Debug, Clone)]
pub struct UploadDir {
    root: PathBuf,
}

impl UploadDir {
    /// Use `root`, creating it if missing.
    pub async fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` under a fresh name derived from `original` and return
    /// that name. Never overwrites an existing file.
    pub async fn save(&self, original: Option<&str>, bytes: &[u8]) -> io::Result<String> {
        let name = unique_name(original);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.root.join(&name))
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(name)
    }

    /// Delete a file by the exact name [`UploadDir::save`] returned. Names
    /// that could leave the upload directory are refused.
    pub async fn remove(&self, name: &str) -> io::Result<()> {
        if matches!(name, "" | "." | "..") || name.contains(['/', '\\']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a stored upload name: {name:?}"),
            ));
        }
        tokio::fs::remove_file(self.root.join(name)).await
    }
}

/// `<unix millis>-<8 hex chars>-<sanitized original name>`.
pub fn unique_name(original: Option<&str>) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let tag = uuid::Uuid::new_v4().simple().to_string();
    let suffix = original.map(sanitize).unwrap_or_default();
    let suffix = if suffix.is_empty() {
        FALLBACK_SUFFIX.to_string()
    } else {
        suffix
    };
    format!("{millis}-{}-{suffix}", &tag[..8])
}

/// Keep ASCII alphanumerics, `.`, `-` and `_` from the final path
/// component; everything else becomes `_`.
fn sanitize(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let start = cleaned.len().saturating_sub(MAX_SUFFIX_LEN);
    cleaned[start..].to_string()
}
