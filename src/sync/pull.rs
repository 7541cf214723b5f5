/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Device-to-local file transfer.

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use unix_path::{Path as UnixPath, PathBuf as UnixPathBuf};

use crate::adb::SyncCommand;
use crate::request::{StreamRequest, Target, TransferEvent, ValidationResponse};
use crate::sync::{
    read_stat_reply, read_sync_error, read_sync_header, validate_remote_path, write_sync_request,
    ENTER_SYNC,
};
use crate::transport::Connection;
use crate::wire::{encode_message, MAX_FILE_PACKET_LENGTH};
use crate::{DeviceError, Result};

enum PullState {
    Init,
    Streaming,
    Terminal,
    Finished,
}

/// Streams a remote file into a local sink, yielding completion ratios as
/// DATA chunks arrive.
///
/// The sink should be opened before the request runs so permission problems
/// surface early. On failure or cancellation any partially written local
/// data is left in place; cleanup is the caller's policy.
pub struct PullRequest<'a, W> {
    target: Target,
    src: UnixPathBuf,
    sink: &'a mut W,
    state: PullState,
    total: u64,
    received: u64,
    buf: Vec<u8>,
}

impl<'a, W> PullRequest<'a, W> {
    pub fn new(target: Target, src: &UnixPath, sink: &'a mut W) -> PullRequest<'a, W> {
        PullRequest {
            target,
            src: src.to_path_buf(),
            sink,
            state: PullState::Init,
            total: 0,
            received: 0,
            // One buffer per sync session, reused for every chunk.
            buf: vec![0; MAX_FILE_PACKET_LENGTH],
        }
    }

    fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.received as f64 / self.total as f64).min(1.0)
        }
    }
}

impl<'a, W> StreamRequest for PullRequest<'a, W>
where
    W: AsyncWrite + Unpin + Send,
{
    type Progress = f64;
    type Output = ();

    fn validate(&self) -> ValidationResponse {
        validate_remote_path(&self.src)
    }

    fn target(&self) -> Target {
        self.target.clone()
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(ENTER_SYNC)
    }

    async fn advance<S>(
        &mut self,
        conn: &mut Connection<S>,
    ) -> Result<TransferEvent<f64, ()>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self.state {
            PullState::Init => {
                let path = format!("{}", self.src.display());
                debug!("Pulling {}", path);

                write_sync_request(conn, SyncCommand::Lstat, path.as_bytes()).await?;
                let entry = read_stat_reply(conn).await?;
                self.total = u64::from(entry.size);

                write_sync_request(conn, SyncCommand::Recv, path.as_bytes()).await?;
                self.state = PullState::Streaming;

                Ok(TransferEvent::Progress(if self.total == 0 {
                    1.0
                } else {
                    0.0
                }))
            }
            PullState::Streaming => {
                let (command, value) = read_sync_header(conn).await?;
                match command {
                    SyncCommand::Data => {
                        let len = value as usize;
                        if len > MAX_FILE_PACKET_LENGTH {
                            return Err(DeviceError::UnsupportedSyncProtocol(format!(
                                "DATA chunk of {} bytes exceeds the 64 KiB limit",
                                len
                            )));
                        }

                        conn.read_exact(&mut self.buf[..len]).await?;
                        self.sink.write_all(&self.buf[..len]).await?;
                        self.received += len as u64;

                        Ok(TransferEvent::Progress(self.ratio()))
                    }
                    SyncCommand::Done => {
                        self.sink.flush().await?;
                        self.state = PullState::Terminal;
                        Ok(TransferEvent::Progress(1.0))
                    }
                    SyncCommand::Fail => {
                        let message = read_sync_error(conn, value).await?;
                        Err(DeviceError::PullFailed {
                            path: format!("{}", self.src.display()),
                            message,
                        })
                    }
                    other => Err(DeviceError::UnsupportedSyncProtocol(format!(
                        "unexpected {} during RECV",
                        other
                    ))),
                }
            }
            PullState::Terminal | PullState::Finished => {
                self.state = PullState::Finished;
                Ok(TransferEvent::Done(()))
            }
        }
    }
}
