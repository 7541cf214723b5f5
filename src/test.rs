/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! In-memory fake adb server pieces shared by the protocol tests.
//!
//! The client side talks through a [`Connection`] over one half of a
//! `tokio::io::duplex` pair; the test plays the server on the other half
//! with these helpers.

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::adb::SyncCommand;
use crate::transport::Connection;
use crate::wire;

pub fn connection_pair() -> (Connection<DuplexStream>, DuplexStream) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    (Connection::new(client), server)
}

/// Reads one control frame off the wire and returns its body.
pub async fn expect_message(server: &mut DuplexStream) -> Vec<u8> {
    let mut header = [0; 4];
    server.read_exact(&mut header).await.unwrap();
    let len = wire::parse_hex_length(&header).unwrap();

    let mut body = vec![0; len];
    server.read_exact(&mut body).await.unwrap();
    body
}

pub async fn send_okay(server: &mut DuplexStream) {
    server.write_all(b"OKAY").await.unwrap();
}

/// Sends a hex-length-prefixed payload block.
pub async fn send_hex_block(server: &mut DuplexStream, body: &[u8]) {
    let frame = wire::encode_message(body).unwrap();
    server.write_all(&frame).await.unwrap();
}

pub async fn send_raw(server: &mut DuplexStream, bytes: &[u8]) {
    server.write_all(bytes).await.unwrap();
}

/// Writes trailing output and closes the server side so the client sees
/// end of stream.
pub async fn send_raw_and_close(mut server: DuplexStream, bytes: &[u8]) {
    server.write_all(bytes).await.unwrap();
    server.shutdown().await.unwrap();
}

pub async fn read_exactly(server: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut bytes = vec![0; n];
    server.read_exact(&mut bytes).await.unwrap();
    bytes
}

pub async fn read_until_eof(server: &mut DuplexStream) -> Vec<u8> {
    let mut bytes = Vec::new();
    server.read_to_end(&mut bytes).await.unwrap();
    bytes
}

/// Accepts the transport selection and the `sync:` switch for `serial`.
pub async fn accept_sync_session(server: &mut DuplexStream, serial: &str) {
    let transport = expect_message(server).await;
    assert_eq!(transport, format!("host:transport:{}", serial).as_bytes());
    send_okay(server).await;

    let sync = expect_message(server).await;
    assert_eq!(sync, b"sync:");
    send_okay(server).await;
}

pub async fn read_sync_frame_header(server: &mut DuplexStream) -> (SyncCommand, u32) {
    let mut header = [0; wire::SYNC_HEADER_LENGTH];
    server.read_exact(&mut header).await.unwrap();
    wire::parse_sync_header(&header).unwrap()
}

/// Reads one sync request whose integer field is the argument length.
pub async fn expect_sync_request(server: &mut DuplexStream) -> (SyncCommand, Vec<u8>) {
    let (command, len) = read_sync_frame_header(server).await;
    let arg = read_exactly(server, len as usize).await;
    (command, arg)
}

/// Sends a sync frame with an explicit integer field and raw payload.
pub async fn send_sync_frame(
    server: &mut DuplexStream,
    command: SyncCommand,
    value: u32,
    payload: &[u8],
) {
    server
        .write_all(&wire::sync_header(command, value))
        .await
        .unwrap();
    if !payload.is_empty() {
        server.write_all(payload).await.unwrap();
    }
}

/// Sends one LIST directory entry.
pub async fn send_dent(server: &mut DuplexStream, mode: u32, size: u32, name: &[u8]) {
    send_sync_frame(server, SyncCommand::Dent, mode, &[]).await;
    server.write_all(&size.to_le_bytes()).await.unwrap();
    server.write_all(&1700000000u32.to_le_bytes()).await.unwrap();
    server
        .write_all(&(name.len() as u32).to_le_bytes())
        .await
        .unwrap();
    server.write_all(name).await.unwrap();
}
