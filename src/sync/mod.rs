/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The sync service: file stat, transfer, and directory listing.
//!
//! A client enters sync mode by issuing `sync:` on the control channel; on
//! OKAY the socket switches to 8-byte-header framing until it is closed.
//! Exactly one sync operation runs per socket.

pub mod pull;
pub mod push;

pub use pull::PullRequest;
pub use push::PushRequest;

use tokio::io::{AsyncRead, AsyncWrite};
use unix_path::Path as UnixPath;

use crate::adb::SyncCommand;
use crate::request::{HostRequest, Target, ValidationResponse};
use crate::transport::Connection;
use crate::wire::{self, encode_message, MAX_FILE_PACKET_LENGTH, MAX_REMOTE_PATH_LENGTH};
use crate::{DeviceError, Result};

/// Control payload that switches the socket into sync framing.
pub(crate) const ENTER_SYNC: &[u8] = b"sync:";

/// File metadata as reported by a sync LSTAT.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FileEntry {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct RemoteDirEntry {
    pub depth: usize,
    pub metadata: RemoteMetadata,
    pub name: String,
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum RemoteMetadata {
    RemoteFile(RemoteFileMetadata),
    RemoteDir,
    RemoteSymlink,
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct RemoteFileMetadata {
    pub mode: usize,
    pub size: usize,
}

pub(crate) fn validate_remote_path(path: &UnixPath) -> ValidationResponse {
    let bytes = format!("{}", path.display()).into_bytes();
    if bytes.is_empty() {
        ValidationResponse::failure("remote path is empty")
    } else if bytes.len() > MAX_REMOTE_PATH_LENGTH {
        ValidationResponse::failure(format!(
            "remote path exceeds {} bytes: {}",
            MAX_REMOTE_PATH_LENGTH,
            path.display()
        ))
    } else {
        ValidationResponse::success()
    }
}

/// Writes a sync request frame, header and argument in a single write.
pub(crate) async fn write_sync_request<S>(
    conn: &mut Connection<S>,
    command: SyncCommand,
    arg: &[u8],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut frame = Vec::with_capacity(wire::SYNC_HEADER_LENGTH + arg.len());
    frame.extend_from_slice(&wire::sync_header(command, arg.len() as u32));
    frame.extend_from_slice(arg);
    conn.write_all(&frame).await
}

pub(crate) async fn read_sync_header<S>(conn: &mut Connection<S>) -> Result<(SyncCommand, u32)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut header = [0; wire::SYNC_HEADER_LENGTH];
    conn.read_exact(&mut header).await?;
    wire::parse_sync_header(&header)
}

/// Reads the UTF-8 message that follows a sync FAIL header.
pub(crate) async fn read_sync_error<S>(conn: &mut Connection<S>, len: u32) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let len = (len as usize).min(MAX_FILE_PACKET_LENGTH);
    let mut message = vec![0; len];
    conn.read_exact(&mut message).await?;

    Ok(String::from_utf8_lossy(&message).into_owned())
}

/// Reads the 16-byte LSTAT reply.
pub(crate) async fn read_stat_reply<S>(conn: &mut Connection<S>) -> Result<FileEntry>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (command, mode) = read_sync_header(conn).await?;
    if command != SyncCommand::Lstat {
        return Err(DeviceError::UnsupportedSyncProtocol(format!(
            "expected LSTA reply, got {}",
            command
        )));
    }

    let mut rest = [0; 8];
    conn.read_exact(&mut rest).await?;
    let size = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
    let mtime = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);

    Ok(FileEntry { mode, size, mtime })
}

/// Sync LSTAT: file metadata without transferring content.
pub struct StatFile {
    pub target: Target,
    pub path: unix_path::PathBuf,
}

impl HostRequest for StatFile {
    type Output = FileEntry;

    fn validate(&self) -> ValidationResponse {
        validate_remote_path(&self.path)
    }

    fn target(&self) -> Target {
        self.target.clone()
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(ENTER_SYNC)
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<FileEntry>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let path = format!("{}", self.path.display());
        write_sync_request(conn, SyncCommand::Lstat, path.as_bytes()).await?;
        read_stat_reply(conn).await
    }
}

/// Sync LIST: one directory level of DENT records.
pub struct ListDir {
    pub target: Target,
    pub path: unix_path::PathBuf,
    pub(crate) depth: usize,
    pub(crate) prefix: String,
}

impl ListDir {
    pub fn new(target: Target, path: unix_path::PathBuf) -> ListDir {
        ListDir {
            target,
            path,
            depth: 0,
            prefix: String::new(),
        }
    }

    pub(crate) fn descend(
        target: Target,
        path: unix_path::PathBuf,
        depth: usize,
        prefix: String,
    ) -> ListDir {
        ListDir {
            target,
            path,
            depth,
            prefix,
        }
    }
}

impl HostRequest for ListDir {
    type Output = Vec<RemoteDirEntry>;

    fn validate(&self) -> ValidationResponse {
        validate_remote_path(&self.path)
    }

    fn target(&self) -> Target {
        self.target.clone()
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(ENTER_SYNC)
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<Vec<RemoteDirEntry>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let path = format!("{}", self.path.display());
        write_sync_request(conn, SyncCommand::List, path.as_bytes()).await?;

        let mut listings = Vec::new();

        // One DENT per directory entry until DONE.
        loop {
            let (command, value) = read_sync_header(conn).await?;
            match command {
                SyncCommand::Dent => {
                    // The header int is the file mode; three more LE ints
                    // follow: size, mtime, and name length, then the name.
                    let mode = value as usize;

                    let mut rest = [0; 12];
                    conn.read_exact(&mut rest).await?;
                    let size = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                    let _mtime = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
                    let name_length =
                        u32::from_le_bytes([rest[8], rest[9], rest[10], rest[11]]) as usize;

                    if name_length > MAX_REMOTE_PATH_LENGTH {
                        return Err(DeviceError::UnsupportedSyncProtocol(format!(
                            "DENT name length {} exceeds the path limit",
                            name_length
                        )));
                    }

                    let mut name = vec![0; name_length];
                    conn.read_exact(&mut name).await?;
                    let mut name = std::str::from_utf8(&name)?.to_owned();

                    if name == "." || name == ".." {
                        continue;
                    }

                    if !self.prefix.is_empty() {
                        name = format!("{}/{}", self.prefix, name);
                    }

                    // Bits 14..16 of the mode carry the file type: 0b100
                    // file, 0b010 directory, 0b101 symlink.
                    let file_type = (mode >> 13) & 0b111;
                    let metadata = match file_type {
                        0b010 => RemoteMetadata::RemoteDir,
                        0b100 => RemoteMetadata::RemoteFile(RemoteFileMetadata {
                            mode: mode & 0b111111111,
                            size,
                        }),
                        0b101 => RemoteMetadata::RemoteSymlink,
                        _ => {
                            return Err(DeviceError::UnsupportedSyncProtocol(format!(
                                "invalid file mode {}",
                                file_type
                            )))
                        }
                    };

                    listings.push(RemoteDirEntry {
                        name,
                        depth: self.depth,
                        metadata,
                    });
                }
                SyncCommand::Done => break,
                SyncCommand::Fail => {
                    let message = read_sync_error(conn, value).await?;
                    return Err(DeviceError::Adb(format!("adb error: {}", message)));
                }
                other => {
                    return Err(DeviceError::UnsupportedSyncProtocol(format!(
                        "unexpected {} during LIST",
                        other
                    )))
                }
            }
        }

        Ok(listings)
    }
}
