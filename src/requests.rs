/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Single-shot control-channel requests answered by the adb server or by a
//! device shell.

use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::adb::{DeviceSerial, FeatureSet, SyncCommand};
use crate::request::{HostRequest, Target};
use crate::transport::Connection;
use crate::wire::encode_message;
use crate::{DeviceError, DeviceInfo, Result};

/// `host:version`: the server's own version number.
pub struct ServerVersion;

impl HostRequest for ServerVersion {
    type Output = u32;

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(b"host:version")
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<u32>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let payload = conn.read_hex_block().await?;
        let version = std::str::from_utf8(&payload)?;

        Ok(u32::from_str_radix(version, 16)?)
    }
}

/// `host:devices` / `host:devices-l`: the attached-device listing.
pub struct ListDevices {
    pub long: bool,
}

impl HostRequest for ListDevices {
    type Output = Vec<DeviceInfo>;

    fn serialize(&self) -> Result<Vec<u8>> {
        if self.long {
            encode_message(b"host:devices-l")
        } else {
            encode_message(b"host:devices")
        }
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<Vec<DeviceInfo>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let payload = conn.read_hex_block().await?;
        let listing = std::str::from_utf8(&payload)?;

        Ok(listing.lines().filter_map(parse_device_info).collect())
    }
}

fn parse_device_info(line: &str) -> Option<DeviceInfo> {
    // Turn "serial\tdevice key1:value1 key2:value2 ..." into a `DeviceInfo`.
    let mut pairs = line.split_whitespace();
    let serial = pairs.next();
    let state = pairs.next();
    if let (Some(serial), Some("device")) = (serial, state) {
        let info: BTreeMap<String, String> = pairs
            .filter_map(|pair| {
                let mut kv = pair.split(':');
                if let (Some(k), Some(v), None) = (kv.next(), kv.next(), kv.next()) {
                    Some((k.to_owned(), v.to_owned()))
                } else {
                    None
                }
            })
            .collect();

        Some(DeviceInfo {
            serial: serial.to_owned(),
            info,
        })
    } else {
        None
    }
}

/// `host-serial:<serial>:features`: the device's advertised feature tokens.
pub struct FetchFeatures {
    pub serial: DeviceSerial,
}

impl HostRequest for FetchFeatures {
    type Output = FeatureSet;

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(format!("host-serial:{}:features", self.serial).as_bytes())
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<FeatureSet>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let payload = conn.read_hex_block().await?;
        std::str::from_utf8(&payload)?.parse()
    }
}

/// `shell:<cmd>`: run a shell command, collecting its combined output as
/// text with line endings normalized.
pub struct ShellCommand {
    pub target: Target,
    pub command: String,
}

impl HostRequest for ShellCommand {
    type Output = String;

    fn target(&self) -> Target {
        self.target.clone()
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(format!("shell:{}", self.command).as_bytes())
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut output = Vec::new();
        conn.read_to_end(&mut output).await?;

        let text = std::str::from_utf8(&output)?;

        // Unify new lines by removing possible carriage returns
        Ok(text.replace("\r\n", "\n"))
    }
}

/// `exec:<cmd>`: binary-clean exec, output returned untouched.
pub struct ExecCommand {
    pub target: Target,
    pub command: String,
}

impl HostRequest for ExecCommand {
    type Output = Vec<u8>;

    fn target(&self) -> Target {
        self.target.clone()
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(format!("exec:{}", self.command).as_bytes())
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut output = Vec::new();
        conn.read_to_end(&mut output).await?;
        Ok(output)
    }
}

/// Reads everything after the arbiter's OKAY, tolerating the server quirks
/// around doubled status words.
pub(crate) async fn read_trailing_response<S>(conn: &mut Connection<S>) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut response = Vec::new();
    conn.read_to_end(&mut response).await?;

    if response.starts_with(SyncCommand::Okay.code()) {
        // Sometimes the server produces OKAYOKAY.  Sometimes there is a
        // transport OKAY and then the underlying command OKAY.
        response = response.split_off(4);
    }

    if response.starts_with(SyncCommand::Fail.code()) {
        // OKAYFAIL means the underlying command failed; split off the FAIL
        // and the length of the message.
        response = response.split_off(8);
        let message = std::str::from_utf8(&response)?;
        return Err(DeviceError::Adb(format!("adb error: {}", message)));
    }

    Ok(response)
}

/// Strips a leading 4-hex-digit length prefix when it matches the remainder.
fn strip_hex_length_prefix(response: &[u8]) -> &[u8] {
    if response.len() >= 4 {
        if let Ok(len) = crate::wire::parse_hex_length(&response[..4]) {
            if len == response.len() - 4 {
                return &response[4..];
            }
        }
    }
    response
}

/// `host-serial:<serial>:forward:tcp:<local>;tcp:<remote>`.
///
/// With `local` 0 the server picks a free port and reports it back.
pub struct ForwardPort {
    pub serial: DeviceSerial,
    pub local: u16,
    pub remote: u16,
}

impl HostRequest for ForwardPort {
    type Output = u16;

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(
            format!(
                "host-serial:{}:forward:tcp:{};tcp:{}",
                self.serial, self.local, self.remote
            )
            .as_bytes(),
        )
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<u16>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let response = read_trailing_response(conn).await?;

        if self.local != 0 {
            return Ok(self.local);
        }

        let port = std::str::from_utf8(strip_hex_length_prefix(&response))?;
        Ok(port.trim().parse()?)
    }
}

/// `host-serial:<serial>:killforward:tcp:<local>`.
pub struct KillForwardPort {
    pub serial: DeviceSerial,
    pub local: u16,
}

impl HostRequest for KillForwardPort {
    type Output = ();

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(
            format!("host-serial:{}:killforward:tcp:{}", self.serial, self.local).as_bytes(),
        )
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        read_trailing_response(conn).await.map(|_| ())
    }
}

/// `host-serial:<serial>:killforward-all`.
pub struct KillAllForwardPorts {
    pub serial: DeviceSerial,
}

impl HostRequest for KillAllForwardPorts {
    type Output = ();

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(format!("host-serial:{}:killforward-all", self.serial).as_bytes())
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        read_trailing_response(conn).await.map(|_| ())
    }
}

/// `reverse:forward:tcp:<remote>;tcp:<local>`, answered by the device.
pub struct ReversePort {
    pub serial: DeviceSerial,
    pub remote: u16,
    pub local: u16,
}

impl HostRequest for ReversePort {
    type Output = u16;

    fn target(&self) -> Target {
        Target::Serial(self.serial.clone())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(format!("reverse:forward:tcp:{};tcp:{}", self.remote, self.local).as_bytes())
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<u16>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let response = read_trailing_response(conn).await?;

        if self.remote != 0 {
            return Ok(self.remote);
        }

        let port = std::str::from_utf8(strip_hex_length_prefix(&response))?;
        Ok(port.trim().parse()?)
    }
}

/// `reverse:killforward:tcp:<remote>`.
pub struct KillReversePort {
    pub serial: DeviceSerial,
    pub remote: u16,
}

impl HostRequest for KillReversePort {
    type Output = ();

    fn target(&self) -> Target {
        Target::Serial(self.serial.clone())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(format!("reverse:killforward:tcp:{}", self.remote).as_bytes())
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        read_trailing_response(conn).await.map(|_| ())
    }
}

/// `reverse:killforward-all`.
pub struct KillAllReversePorts {
    pub serial: DeviceSerial,
}

impl HostRequest for KillAllReversePorts {
    type Output = ();

    fn target(&self) -> Target {
        Target::Serial(self.serial.clone())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(b"reverse:killforward-all")
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        read_trailing_response(conn).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::Feature;
    use crate::request::execute;
    use crate::test;

    #[tokio::test]
    async fn server_version_decodes_hex_payload() {
        let (mut conn, mut server) = test::connection_pair();

        let client = tokio::spawn(async move { execute(ServerVersion, &mut conn).await });

        let request = test::expect_message(&mut server).await;
        assert_eq!(request, b"host:version");
        test::send_okay(&mut server).await;
        test::send_hex_block(&mut server, b"001f").await;

        assert_eq!(client.await.unwrap().unwrap(), 0x001f);
    }

    #[tokio::test]
    async fn device_listing_parses_serial_and_pairs() {
        let (mut conn, mut server) = test::connection_pair();

        let client = tokio::spawn(async move { execute(ListDevices { long: true }, &mut conn).await });

        let request = test::expect_message(&mut server).await;
        assert_eq!(request, b"host:devices-l");
        test::send_okay(&mut server).await;
        test::send_hex_block(
            &mut server,
            b"emulator-5554\tdevice product:sdk_gphone model:Pixel_6\nTA9290FG\tunauthorized\n",
        )
        .await;

        let devices = client.await.unwrap().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[0].info["model"], "Pixel_6");
    }

    #[tokio::test]
    async fn feature_fetch_uses_host_serial_form() {
        let (mut conn, mut server) = test::connection_pair();

        let client = tokio::spawn(async move {
            execute(
                FetchFeatures {
                    serial: "emulator-5554".to_owned(),
                },
                &mut conn,
            )
            .await
        });

        let request = test::expect_message(&mut server).await;
        assert_eq!(request, b"host-serial:emulator-5554:features");
        test::send_okay(&mut server).await;
        test::send_hex_block(&mut server, b"cmd,shell_v2,abb_exec,apex").await;

        let features = client.await.unwrap().unwrap();
        assert!(features.supports(Feature::Cmd));
        assert!(features.supports(Feature::AbbExec));
        assert!(!features.supports(Feature::StatV2));
    }

    #[tokio::test]
    async fn shell_selects_transport_then_streams_output() {
        let (mut conn, mut server) = test::connection_pair();

        let client = tokio::spawn(async move {
            execute(
                ShellCommand {
                    target: Target::Serial("emulator-5554".to_owned()),
                    command: "getprop ro.build.version.sdk".to_owned(),
                },
                &mut conn,
            )
            .await
        });

        let transport = test::expect_message(&mut server).await;
        assert_eq!(transport, b"host:transport:emulator-5554");
        test::send_okay(&mut server).await;

        let request = test::expect_message(&mut server).await;
        assert_eq!(request, b"shell:getprop ro.build.version.sdk");
        test::send_okay(&mut server).await;
        test::send_raw_and_close(server, b"34\r\n").await;

        assert_eq!(client.await.unwrap().unwrap(), "34\n");
    }

    #[tokio::test]
    async fn forward_with_explicit_port_returns_it() {
        let (mut conn, mut server) = test::connection_pair();

        let client = tokio::spawn(async move {
            execute(
                ForwardPort {
                    serial: "TA9290FG".to_owned(),
                    local: 6100,
                    remote: 7100,
                },
                &mut conn,
            )
            .await
        });

        let request = test::expect_message(&mut server).await;
        assert_eq!(request, b"host-serial:TA9290FG:forward:tcp:6100;tcp:7100");
        test::send_okay(&mut server).await;
        test::send_raw_and_close(server, b"OKAY").await;

        assert_eq!(client.await.unwrap().unwrap(), 6100);
    }

    #[tokio::test]
    async fn forward_with_port_zero_parses_servers_choice() {
        let (mut conn, mut server) = test::connection_pair();

        let client = tokio::spawn(async move {
            execute(
                ForwardPort {
                    serial: "TA9290FG".to_owned(),
                    local: 0,
                    remote: 7100,
                },
                &mut conn,
            )
            .await
        });

        let _request = test::expect_message(&mut server).await;
        test::send_okay(&mut server).await;
        test::send_raw_and_close(server, b"OKAY000541234").await;

        assert_eq!(client.await.unwrap().unwrap(), 41234);
    }
}
