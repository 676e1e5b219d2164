//! File operations over a remote session's SFTP sub-channel.
//!
//! Listing and uploading are independent one-shot operations: each opens
//! its own sub-channel on the session's connection, performs the work, and
//! closes the sub-channel again. Holding no channel between requests costs
//! a round-trip per operation and buys freedom from leak accumulation and
//! stale-channel bookkeeping.

use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use termhub_protocol::{FileAttrs, FileEntry};

use crate::session::remote::SshHandle;

/// Chunk size for streaming uploads (64KB).
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Errors that can occur during file sub-channel operations.
///
/// These never cross the orchestrator boundary as errors; they become
/// `list-error` / `upload-done` event payloads for the owning session.
#[derive(Debug, Error)]
pub enum FileOpError {
    /// No established connection for the session.
    #[error("connection not found")]
    ConnectionNotFound,

    /// The SFTP sub-channel could not be opened.
    #[error("failed to open file sub-channel: {0}")]
    SubChannel(String),

    /// The directory could not be read.
    #[error("failed to list directory: {0}")]
    List(String),

    /// The local file could not be read.
    #[error("failed to read local file: {0}")]
    LocalRead(String),

    /// The upload exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// The remote write failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// The operation exceeded its time limit.
    #[error("file operation timed out after {0}s")]
    Timeout(u64),
}

/// Lists a remote directory.
///
/// An empty path means the remote user's current directory.
pub(crate) async fn list_directory(
    handle: &SshHandle,
    path: &str,
) -> Result<Vec<FileEntry>, FileOpError> {
    let path = if path.is_empty() { "." } else { path };

    let sftp = open_sub_channel(handle).await?;
    let result = read_entries(&sftp, path).await;
    let _ = sftp.close().await;

    result
}

async fn read_entries(sftp: &SftpSession, path: &str) -> Result<Vec<FileEntry>, FileOpError> {
    let dir = sftp
        .read_dir(path)
        .await
        .map_err(|e| FileOpError::List(e.to_string()))?;

    Ok(dir
        .map(|entry| {
            let name = entry.file_name();
            let metadata = entry.metadata();
            FileEntry {
                longname: format_longname(&name, &metadata),
                attrs: convert_attrs(&metadata),
                name,
            }
        })
        .collect())
}

/// Uploads a local file into `remote_dir` on the session's host.
///
/// The destination name is the local base name; `remote_dir` of `"."`
/// means the remote current directory.
pub(crate) async fn upload_file(
    handle: &SshHandle,
    local_path: &str,
    remote_dir: &str,
    max_size: u64,
) -> Result<(), FileOpError> {
    let metadata = tokio::fs::metadata(local_path)
        .await
        .map_err(|e| FileOpError::LocalRead(format!("{local_path}: {e}")))?;
    if !metadata.is_file() {
        return Err(FileOpError::LocalRead(format!("{local_path}: not a file")));
    }
    if metadata.len() > max_size {
        return Err(FileOpError::TooLarge {
            size: metadata.len(),
            limit: max_size,
        });
    }

    let target = remote_target_path(local_path, remote_dir)?;
    let mut source = tokio::fs::File::open(local_path)
        .await
        .map_err(|e| FileOpError::LocalRead(format!("{local_path}: {e}")))?;

    tracing::info!(local_path, target = %target, size = metadata.len(), "Uploading file");

    let sftp = open_sub_channel(handle).await?;
    let result = stream_to_remote(&sftp, &mut source, &target).await;
    let _ = sftp.close().await;

    result
}

async fn stream_to_remote(
    sftp: &SftpSession,
    source: &mut tokio::fs::File,
    target: &str,
) -> Result<(), FileOpError> {
    let mut dest = sftp
        .create(target)
        .await
        .map_err(|e| FileOpError::Upload(e.to_string()))?;

    let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
    loop {
        let n = source
            .read(&mut buffer)
            .await
            .map_err(|e| FileOpError::LocalRead(e.to_string()))?;
        if n == 0 {
            break;
        }
        dest.write_all(&buffer[..n])
            .await
            .map_err(|e| FileOpError::Upload(e.to_string()))?;
    }

    dest.shutdown()
        .await
        .map_err(|e| FileOpError::Upload(e.to_string()))?;
    Ok(())
}

/// Opens one SFTP sub-channel on the connection.
async fn open_sub_channel(handle: &SshHandle) -> Result<SftpSession, FileOpError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| FileOpError::SubChannel(e.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| FileOpError::SubChannel(e.to_string()))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| FileOpError::SubChannel(e.to_string()))
}

/// Computes the upload destination path.
///
/// `"."` denotes the remote current directory, in which case the bare
/// base name is used; anything else is joined with `/` as-is.
pub fn remote_target_path(local_path: &str, remote_dir: &str) -> Result<String, FileOpError> {
    let file_name = std::path::Path::new(local_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| FileOpError::LocalRead(format!("{local_path}: no file name")))?;

    if remote_dir == "." {
        Ok(file_name)
    } else {
        Ok(format!("{remote_dir}/{file_name}"))
    }
}

fn convert_attrs(attrs: &FileAttributes) -> FileAttrs {
    let permissions = attrs.permissions.unwrap_or(0);
    FileAttrs {
        size: attrs.size,
        uid: attrs.uid,
        gid: attrs.gid,
        permissions: attrs.permissions,
        atime: attrs.atime,
        mtime: attrs.mtime,
        is_dir: permissions & 0o170000 == 0o040000,
    }
}

/// Synthesizes an `ls -l`-style line from an entry's attributes.
fn format_longname(name: &str, attrs: &FileAttributes) -> String {
    let mode = format_mode(attrs.permissions.unwrap_or(0));
    let uid = attrs
        .uid
        .map(|u| u.to_string())
        .unwrap_or_else(|| "?".to_string());
    let gid = attrs
        .gid
        .map(|g| g.to_string())
        .unwrap_or_else(|| "?".to_string());
    let size = attrs.size.unwrap_or(0);
    let mtime = attrs.mtime.unwrap_or(0);
    format!("{mode} {uid} {gid} {size} {mtime} {name}")
}

/// Renders permission bits as the familiar ten-character mode string.
fn format_mode(permissions: u32) -> String {
    let kind = match permissions & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        _ => '-',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (permissions >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_path_in_current_directory_is_bare_name() {
        let target = remote_target_path("/local/report.txt", ".").unwrap();
        assert_eq!(target, "report.txt");
    }

    #[test]
    fn target_path_joins_directory_and_base_name() {
        let target = remote_target_path("/local/report.txt", "/var/log").unwrap();
        assert_eq!(target, "/var/log/report.txt");
    }

    #[test]
    fn target_path_ignores_local_directories() {
        let target = remote_target_path("deep/nested/data.bin", "/tmp").unwrap();
        assert_eq!(target, "/tmp/data.bin");
    }

    #[test]
    fn target_path_rejects_pathless_input() {
        assert!(remote_target_path("..", "/tmp").is_err());
    }

    #[test]
    fn mode_string_for_regular_file() {
        assert_eq!(format_mode(0o100644), "-rw-r--r--");
    }

    #[test]
    fn mode_string_for_directory() {
        assert_eq!(format_mode(0o040755), "drwxr-xr-x");
    }

    #[test]
    fn mode_string_for_symlink() {
        assert_eq!(format_mode(0o120777), "lrwxrwxrwx");
    }

    #[test]
    fn longname_includes_name_and_size() {
        let attrs = FileAttributes {
            size: Some(1234),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(0o100644),
            mtime: Some(1722470400),
            ..Default::default()
        };
        let line = format_longname("report.txt", &attrs);
        assert_eq!(line, "-rw-r--r-- 1000 1000 1234 1722470400 report.txt");
    }

    #[test]
    fn attrs_conversion_detects_directories() {
        let attrs = FileAttributes {
            permissions: Some(0o040755),
            ..Default::default()
        };
        assert!(convert_attrs(&attrs).is_dir);

        let attrs = FileAttributes {
            permissions: Some(0o100644),
            ..Default::default()
        };
        assert!(!convert_attrs(&attrs).is_dir);
    }
}
