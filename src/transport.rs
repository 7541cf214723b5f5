/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Duplex byte-stream wrapper used for every adb server conversation.
//!
//! A [`Connection`] owns the socket for the lifetime of exactly one request;
//! sync sessions monopolize it until DONE or FAIL. Every read and write races
//! the connection's cancellation token, and cancellation poisons the
//! connection since the peer's protocol state is then indeterminate.

use std::io;

use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::adb::SyncCommand;
use crate::wire;
use crate::{DeviceError, Result};

pub struct Connection<S> {
    stream: S,
    token: CancellationToken,
    poisoned: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Connection<S> {
        Connection::with_token(stream, CancellationToken::new())
    }

    pub fn with_token(stream: S, token: CancellationToken) -> Connection<S> {
        Connection {
            stream,
            token,
            poisoned: false,
        }
    }

    /// Token that unblocks any in-flight operation on this connection.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.poisoned {
            return Err(DeviceError::Adb("connection is closed".to_owned()));
        }
        if self.token.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        Ok(())
    }

    /// Marks the connection unusable when an operation was cancelled; the
    /// peer's protocol state is indeterminate from then on.
    fn poison_on_cancel<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(DeviceError::Cancelled)) {
            self.poisoned = true;
        }
        result
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        let token = self.token.clone();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            res = self.stream.write_all(buf) => res.map_err(DeviceError::from),
        };
        self.poison_on_cancel(result)
    }

    /// Fills `buf` completely or fails with `ShortRead` if the peer closes
    /// mid-frame.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_open()?;
        let token = self.token.clone();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            res = self.stream.read_exact(buf) => match res {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DeviceError::ShortRead),
                Err(e) => Err(e.into()),
            },
        };
        self.poison_on_cancel(result)
    }

    /// Reads whatever is available, up to `buf.len()` bytes. Returns 0 once
    /// the peer has closed its write side.
    pub async fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let token = self.token.clone();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            res = self.stream.read(buf) => res.map_err(DeviceError::from),
        };
        self.poison_on_cancel(result)
    }

    /// Drains the stream until end of stream, appending to `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = [0; 4096];
        let mut total = 0;

        loop {
            let n = self.read_available(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    /// Half-closes the write side, signalling end of payload to the peer
    /// while the read side stays open.
    pub async fn shutdown_write(&mut self) -> Result<()> {
        self.check_open()?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Idempotent half-close followed by close. The connection is unusable
    /// afterwards.
    pub async fn close(&mut self) -> Result<()> {
        if self.poisoned {
            return Ok(());
        }
        self.poisoned = true;
        self.stream.shutdown().await.or_else(|e| {
            if e.kind() == io::ErrorKind::NotConnected {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        Ok(())
    }

    /// Reads the 4-byte status preamble that answers every control-channel
    /// request. On FAIL the peer's length-prefixed error message becomes a
    /// `RequestRejected`.
    pub async fn read_status(&mut self) -> Result<()> {
        let mut status = [0; 4];
        self.read_exact(&mut status).await?;
        trace!("<< status {:?}", bstr::BStr::new(&status));

        if &status == SyncCommand::Okay.code() {
            Ok(())
        } else if &status == SyncCommand::Fail.code() {
            let message = self.read_hex_block().await?;
            let message = std::str::from_utf8(&message)?.to_owned();
            Err(DeviceError::RequestRejected(message))
        } else {
            Err(DeviceError::UnexpectedTransportResponse(status))
        }
    }

    /// Reads one hex-length-prefixed block: 4 hex-ASCII digits, then that
    /// many payload bytes.
    pub async fn read_hex_block(&mut self) -> Result<Vec<u8>> {
        let mut header = [0; 4];
        self.read_exact(&mut header).await?;
        let len = wire::parse_hex_length(&header)?;

        let mut payload = vec![0; len];
        self.read_exact(&mut payload).await?;
        trace!("<< {:?}", bstr::BStr::new(&payload));

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_message;

    #[tokio::test]
    async fn okay_status_is_success() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);

        server.write_all(b"OKAY").await.unwrap();
        conn.read_status().await.unwrap();
    }

    #[tokio::test]
    async fn fail_status_carries_rejection_message() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);

        server.write_all(b"FAIL").await.unwrap();
        server
            .write_all(&encode_message(b"device offline").unwrap())
            .await
            .unwrap();

        match conn.read_status().await {
            Err(DeviceError::RequestRejected(message)) => {
                assert_eq!(message, "device offline");
            }
            other => panic!("expected RequestRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn garbage_status_is_unexpected_transport_response() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);

        server.write_all(b"YOLO").await.unwrap();

        assert!(matches!(
            conn.read_status().await,
            Err(DeviceError::UnexpectedTransportResponse(status)) if &status == b"YOLO"
        ));
    }

    #[tokio::test]
    async fn short_frame_reads_fail_with_short_read() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);

        server.write_all(b"OK").await.unwrap();
        drop(server);

        let mut status = [0; 4];
        assert!(matches!(
            conn.read_exact(&mut status).await,
            Err(DeviceError::ShortRead)
        ));
    }

    #[tokio::test]
    async fn read_available_reports_end_of_stream() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);

        server.write_all(b"abc").await.unwrap();
        drop(server);

        let mut buf = [0; 8];
        let n = conn.read_available(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(conn.read_available(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancellation_unblocks_pending_read() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);
        let token = conn.cancellation_token();

        let pending = tokio::spawn(async move {
            let mut buf = [0; 4];
            conn.read_exact(&mut buf).await
        });

        token.cancel();
        assert!(matches!(pending.await.unwrap(), Err(DeviceError::Cancelled)));
    }

    #[tokio::test]
    async fn poisoned_connection_refuses_further_io() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);

        conn.close().await.unwrap();
        conn.close().await.unwrap();

        server.write_all(b"OKAY").await.unwrap();
        assert!(conn.read_status().await.is_err());
    }
}
