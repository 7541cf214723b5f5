/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Local-to-device file transfer.

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use unix_path::{Path as UnixPath, PathBuf as UnixPathBuf};

use crate::adb::SyncCommand;
use crate::request::{StreamRequest, Target, TransferEvent, ValidationResponse};
use crate::sync::{read_sync_error, read_sync_header, validate_remote_path, ENTER_SYNC};
use crate::transport::Connection;
use crate::wire::{self, encode_message, MAX_FILE_PACKET_LENGTH, SYNC_HEADER_LENGTH};
use crate::{DeviceError, Result};

enum PushState {
    Init,
    Streaming,
    Terminal,
    Finished,
}

/// Streams a local source to a remote path, yielding completion ratios per
/// chunk written. `size` is the total source length used for the ratio;
/// `mtime` is the file's modification time in whole seconds, stamped on the
/// remote file by the closing DONE frame.
pub struct PushRequest<'a, R> {
    target: Target,
    dest: UnixPathBuf,
    mode: u32,
    source: &'a mut R,
    size: u64,
    mtime: u32,
    state: PushState,
    sent: u64,
    buf: Vec<u8>,
}

impl<'a, R> PushRequest<'a, R> {
    pub fn new(
        target: Target,
        source: &'a mut R,
        size: u64,
        mtime: u32,
        dest: &UnixPath,
        mode: u32,
    ) -> PushRequest<'a, R> {
        PushRequest {
            target,
            dest: dest.to_path_buf(),
            mode,
            source,
            size,
            mtime,
            state: PushState::Init,
            sent: 0,
            // Header prefix and payload share one buffer so each chunk goes
            // out in a single write.
            buf: vec![0; SYNC_HEADER_LENGTH + MAX_FILE_PACKET_LENGTH],
        }
    }

    fn ratio(&self) -> f64 {
        if self.size == 0 {
            1.0
        } else {
            (self.sent as f64 / self.size as f64).min(1.0)
        }
    }
}

impl<'a, R> StreamRequest for PushRequest<'a, R>
where
    R: AsyncRead + Unpin + Send,
{
    type Progress = f64;
    type Output = ();

    fn validate(&self) -> ValidationResponse {
        validate_remote_path(&self.dest)
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
            PushState::Init => {
                // Path and permission bits travel as one argument, the mode
                // masked to its permission bits and rendered in decimal.
                let arg = format!("{},{}", self.dest.display(), self.mode & 0o777);
                debug!("Pushing to {}", self.dest.display());

                crate::sync::write_sync_request(conn, SyncCommand::Send, arg.as_bytes()).await?;
                self.state = PushState::Streaming;

                Ok(TransferEvent::Progress(if self.size == 0 {
                    1.0
                } else {
                    0.0
                }))
            }
            PushState::Streaming => {
                let n = self
                    .source
                    .read(&mut self.buf[SYNC_HEADER_LENGTH..])
                    .await?;

                if n > 0 {
                    let header = wire::sync_header(SyncCommand::Data, n as u32);
                    self.buf[..SYNC_HEADER_LENGTH].copy_from_slice(&header);
                    conn.write_all(&self.buf[..SYNC_HEADER_LENGTH + n]).await?;
                    self.sent += n as u64;

                    return Ok(TransferEvent::Progress(self.ratio()));
                }

                // Source exhausted: DONE carries the mtime, and the device
                // acknowledges the whole transfer with one sync status.
                conn.write_all(&wire::sync_header(SyncCommand::Done, self.mtime))
                    .await?;

                let (command, value) = read_sync_header(conn).await?;
                match command {
                    SyncCommand::Okay => {
                        self.state = PushState::Terminal;
                        Ok(TransferEvent::Progress(1.0))
                    }
                    SyncCommand::Fail => {
                        let message = read_sync_error(conn, value).await?;
                        Err(DeviceError::PushFailed(message))
                    }
                    other => Err(DeviceError::UnsupportedSyncProtocol(format!(
                        "unexpected {} in SEND acknowledgement",
                        other
                    ))),
                }
            }
            PushState::Terminal | PushState::Finished => {
                self.state = PushState::Finished;
                Ok(TransferEvent::Done(()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::start;
    use crate::test;

    async fn accept_push(
        server: &mut tokio::io::DuplexStream,
        expected_arg: &[u8],
    ) {
        test::accept_sync_session(server, "emulator-5554").await;

        let (command, arg) = test::expect_sync_request(server).await;
        assert_eq!(command, SyncCommand::Send);
        assert_eq!(arg, expected_arg);
    }

    /// Reads DATA frames until DONE, returning the payload and the mtime.
    async fn collect_chunks(server: &mut tokio::io::DuplexStream) -> (Vec<u8>, u32) {
        let mut payload = Vec::new();
        loop {
            let (command, value) = test::read_sync_frame_header(server).await;
            match command {
                SyncCommand::Data => {
                    payload.extend_from_slice(&test::read_exactly(server, value as usize).await);
                }
                SyncCommand::Done => return (payload, value),
                other => panic!("unexpected sync command {}", other),
            }
        }
    }

    #[tokio::test]
    async fn push_chunks_source_and_waits_for_acknowledgement() {
        let (conn, mut server) = test::connection_pair();

        let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let expected = payload.clone();
        let mut source = payload.as_slice();

        let server_task = tokio::spawn(async move {
            accept_push(&mut server, b"/data/local/tmp/blob,420").await;
            let (received, mtime) = collect_chunks(&mut server).await;
            test::send_sync_frame(&mut server, SyncCommand::Okay, 0, &[]).await;
            (received, mtime, server)
        });

        let request = PushRequest::new(
            Target::Serial("emulator-5554".to_owned()),
            &mut source,
            100_000,
            1700000000,
            UnixPath::new("/data/local/tmp/blob"),
            0o100644,
        );
        let mut session = start(request, conn).await.unwrap();

        let mut progress = Vec::new();
        loop {
            match session.next_event().await.unwrap() {
                Some(TransferEvent::Progress(p)) => progress.push(p),
                Some(TransferEvent::Done(())) => break,
                None => panic!("stream ended before its terminal event"),
            }
        }

        let (received, mtime, _server) = server_task.await.unwrap();
        assert_eq!(received, expected);
        assert_eq!(mtime, 1700000000);

        assert_eq!(progress.first(), Some(&0.0));
        assert_eq!(progress.last(), Some(&1.0));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn empty_source_goes_straight_to_done() {
        let (conn, mut server) = test::connection_pair();
        let mut source: &[u8] = &[];

        let server_task = tokio::spawn(async move {
            accept_push(&mut server, b"/data/local/tmp/empty,384").await;
            let (received, _mtime) = collect_chunks(&mut server).await;
            assert!(received.is_empty());
            test::send_sync_frame(&mut server, SyncCommand::Okay, 0, &[]).await;
            server
        });

        let request = PushRequest::new(
            Target::Serial("emulator-5554".to_owned()),
            &mut source,
            0,
            1700000000,
            UnixPath::new("/data/local/tmp/empty"),
            0o600,
        );
        let mut session = start(request, conn).await.unwrap();

        assert_eq!(
            session.next_event().await.unwrap(),
            Some(TransferEvent::Progress(1.0))
        );
        session.complete().await.unwrap();

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_push_surfaces_device_message() {
        let (conn, mut server) = test::connection_pair();
        let mut source: &[u8] = b"denied";

        let server_task = tokio::spawn(async move {
            accept_push(&mut server, b"/system/app/blob,420").await;
            let (_received, _mtime) = collect_chunks(&mut server).await;
            let message = b"permission denied";
            test::send_sync_frame(&mut server, SyncCommand::Fail, message.len() as u32, message)
                .await;
            server
        });

        let request = PushRequest::new(
            Target::Serial("emulator-5554".to_owned()),
            &mut source,
            6,
            1700000000,
            UnixPath::new("/system/app/blob"),
            0o644,
        );
        let mut session = start(request, conn).await.unwrap();

        let err = loop {
            match session.next_event().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected a push failure"),
                Err(e) => break e,
            }
        };

        match err {
            DeviceError::PushFailed(message) => assert_eq!(message, "permission denied"),
            other => panic!("expected PushFailed, got {:?}", other),
        }

        server_task.await.unwrap();
    }
}
