/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Package installation over the feature-negotiated transports.
//!
//! Newer devices expose the package manager through `abb_exec:`, older ones
//! through `exec:cmd package`; the multi-session requests additionally fall
//! back to the legacy `exec:pm` form. After the command is written, the
//! device reads the package payload straight off the socket until the byte
//! count announced with `-S` has arrived, then answers with a textual
//! verdict.

use std::path::{Path, PathBuf};

use log::debug;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::adb::{DeviceSerial, Feature, FeatureSet};
use crate::request::{
    HostRequest, StreamRequest, Target, TransferEvent, ValidationResponse,
};
use crate::transport::Connection;
use crate::wire::{encode_message, MAX_FILE_PACKET_LENGTH};
use crate::{DeviceError, Result};

/// Verdict reported by the device-side package manager.
///
/// `success` is true iff the trimmed reply begins with `Success`. Replies
/// like `Success\nWARNING: ...` therefore count as success; callers that
/// need more than the boolean can inspect `response`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InstallResult {
    pub success: bool,
    pub response: String,
}

fn parse_verdict(raw: &[u8]) -> InstallResult {
    let response = String::from_utf8_lossy(raw).into_owned();
    InstallResult {
        success: response.trim().starts_with("Success"),
        response,
    }
}

/// Serializes a package-manager invocation through the transport the device
/// features allow: `abb_exec` first, then `cmd`, then bare `pm`.
fn package_command(features: &FeatureSet, args: &[String]) -> Vec<u8> {
    if features.supports(Feature::AbbExec) {
        let mut payload = b"abb_exec:package".to_vec();
        for arg in args {
            payload.push(0);
            payload.extend_from_slice(arg.as_bytes());
        }
        payload
    } else if features.supports(Feature::Cmd) {
        format!("exec:cmd package {}", args.join(" ")).into_bytes()
    } else {
        format!("exec:pm {}", args.join(" ")).into_bytes()
    }
}

/// Extra user arguments ride as one single-quoted argument on the `cmd`
/// and `pm` transports, embedded quotes backslash-escaped. `abb_exec` takes
/// them verbatim since its argv is NUL-delimited.
fn quote_extra_args(extra_args: &[String]) -> Option<String> {
    if extra_args.is_empty() {
        None
    } else {
        Some(format!("'{}'", extra_args.join(" ").replace('\'', "\\'")))
    }
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

enum InstallState {
    Init,
    Streaming,
    Finished,
}

/// Single-shot streamed install of one `.apk` or `.apex` file.
pub struct InstallPackage {
    serial: DeviceSerial,
    path: PathBuf,
    features: FeatureSet,
    reinstall: bool,
    extra_args: Vec<String>,
    state: InstallState,
    file: Option<File>,
    size: u64,
    sent: u64,
    buf: Vec<u8>,
}

impl InstallPackage {
    pub fn new(
        serial: DeviceSerial,
        path: impl Into<PathBuf>,
        features: FeatureSet,
        reinstall: bool,
        extra_args: Vec<String>,
    ) -> InstallPackage {
        let path = path.into();
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        InstallPackage {
            serial,
            path,
            features,
            reinstall,
            extra_args,
            state: InstallState::Init,
            file: None,
            size,
            sent: 0,
            buf: vec![0; MAX_FILE_PACKET_LENGTH],
        }
    }

    fn is_apex(&self) -> bool {
        has_extension(&self.path, "apex")
    }

    fn arguments(&self) -> Vec<String> {
        let mut args = vec!["install".to_owned()];

        if self.features.supports(Feature::AbbExec) {
            args.extend(self.extra_args.iter().cloned());
        } else if let Some(quoted) = quote_extra_args(&self.extra_args) {
            args.push(quoted);
        }

        if self.reinstall {
            args.push("-r".to_owned());
        }
        args.push("-S".to_owned());
        args.push(self.size.to_string());
        if self.is_apex() {
            args.push("--apex".to_owned());
        }

        args
    }
}

impl StreamRequest for InstallPackage {
    type Progress = f64;
    type Output = InstallResult;

    fn validate(&self) -> ValidationResponse {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(_) => {
                return ValidationResponse::failure(format!(
                    "{} does not exist",
                    self.path.display()
                ))
            }
        };
        if !metadata.is_file() {
            return ValidationResponse::failure(format!(
                "{} is not a regular file",
                self.path.display()
            ));
        }

        if !has_extension(&self.path, "apk") && !self.is_apex() {
            return ValidationResponse::failure(format!(
                "{} is neither an .apk nor an .apex package",
                self.path.display()
            ));
        }

        if self.is_apex() && !self.features.supports(Feature::Apex) {
            return ValidationResponse::failure("device does not support .apex packages");
        }

        if !self.features.supports(Feature::Cmd) && !self.features.supports(Feature::AbbExec) {
            return ValidationResponse::failure(
                "streamed install needs the cmd or abb_exec feature",
            );
        }

        ValidationResponse::success()
    }

    fn target(&self) -> Target {
        Target::Serial(self.serial.clone())
    }

    fn required_features(&self) -> &'static [Feature] {
        &[Feature::Cmd, Feature::AbbExec]
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(&package_command(&self.features, &self.arguments()))
    }

    async fn advance<S>(
        &mut self,
        conn: &mut Connection<S>,
    ) -> Result<TransferEvent<f64, InstallResult>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self.state {
            InstallState::Init => {
                debug!("Installing {}", self.path.display());
                self.file = Some(File::open(&self.path).await?);
                self.state = InstallState::Streaming;

                Ok(TransferEvent::Progress(if self.size == 0 {
                    1.0
                } else {
                    0.0
                }))
            }
            InstallState::Streaming => {
                let file = self
                    .file
                    .as_mut()
                    .ok_or_else(|| DeviceError::Adb("install source vanished".to_owned()))?;

                let n = file.read(&mut self.buf).await?;
                if n > 0 {
                    conn.write_all(&self.buf[..n]).await?;
                    self.sent += n as u64;

                    let ratio = if self.size == 0 {
                        1.0
                    } else {
                        (self.sent as f64 / self.size as f64).min(1.0)
                    };
                    return Ok(TransferEvent::Progress(ratio));
                }

                // Payload complete: signal EOF and collect the verdict.
                self.file = None;
                conn.shutdown_write().await?;

                let mut response = Vec::new();
                conn.read_to_end(&mut response).await?;
                self.state = InstallState::Finished;

                Ok(TransferEvent::Done(parse_verdict(&response)))
            }
            InstallState::Finished => {
                Err(DeviceError::Adb("install stream already finished".to_owned()))
            }
        }
    }
}

/// `install-create`: opens a multi-package staging session and returns its
/// id.
pub struct InstallCreate {
    pub serial: DeviceSerial,
    pub features: FeatureSet,
    pub args: Vec<String>,
}

impl InstallCreate {
    fn arguments(&self) -> Vec<String> {
        let mut args = vec!["install-create".to_owned()];
        if self.features.supports(Feature::AbbExec) {
            args.extend(self.args.iter().cloned());
        } else if let Some(quoted) = quote_extra_args(&self.args) {
            args.push(quoted);
        }
        args
    }
}

impl HostRequest for InstallCreate {
    type Output = String;

    fn target(&self) -> Target {
        Target::Serial(self.serial.clone())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(&package_command(&self.features, &self.arguments()))
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut response = Vec::new();
        conn.read_to_end(&mut response).await?;
        let text = String::from_utf8_lossy(&response);

        // The reply reads "Success: created install session [1234]".
        let session = text
            .find('[')
            .and_then(|open| text[open + 1..].find(']').map(|close| (open, close)))
            .map(|(open, close)| text[open + 1..open + 1 + close].to_owned());

        match session {
            Some(id) if text.trim().starts_with("Success") => Ok(id),
            _ => Err(DeviceError::RequestRejected(text.into_owned())),
        }
    }
}

/// `install-write`: streams one package of a staging session, the trailing
/// `-` telling the package manager to read it from stdin.
pub struct InstallWrite<'a, R> {
    serial: DeviceSerial,
    features: FeatureSet,
    session_id: String,
    file_name: String,
    source: &'a mut R,
    size: u64,
    sent: u64,
    streaming: bool,
    buf: Vec<u8>,
}

impl<'a, R> InstallWrite<'a, R> {
    pub fn new(
        serial: DeviceSerial,
        features: FeatureSet,
        session_id: impl Into<String>,
        file_name: impl Into<String>,
        source: &'a mut R,
        size: u64,
    ) -> InstallWrite<'a, R> {
        InstallWrite {
            serial,
            features,
            session_id: session_id.into(),
            file_name: file_name.into(),
            source,
            size,
            sent: 0,
            streaming: false,
            buf: vec![0; MAX_FILE_PACKET_LENGTH],
        }
    }

    fn arguments(&self) -> Vec<String> {
        vec![
            "install-write".to_owned(),
            "-S".to_owned(),
            self.size.to_string(),
            self.session_id.clone(),
            self.file_name.clone(),
            "-".to_owned(),
        ]
    }
}

impl<'a, R> StreamRequest for InstallWrite<'a, R>
where
    R: AsyncRead + Unpin + Send,
{
    type Progress = f64;
    type Output = ();

    fn validate(&self) -> ValidationResponse {
        if self.session_id.is_empty() {
            ValidationResponse::failure("install session id is empty")
        } else if self.file_name.is_empty() {
            ValidationResponse::failure("install file name is empty")
        } else {
            ValidationResponse::success()
        }
    }

    fn target(&self) -> Target {
        Target::Serial(self.serial.clone())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_message(&package_command(&self.features, &self.arguments()))
    }

    async fn advance<S>(
        &mut self,
        conn: &mut Connection<S>,
    ) -> Result<TransferEvent<f64, ()>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !self.streaming {
            self.streaming = true;
            return Ok(TransferEvent::Progress(if self.size == 0 {
                1.0
            } else {
                0.0
            }));
        }

        let n = self.source.read(&mut self.buf).await?;
        if n > 0 {
            conn.write_all(&self.buf[..n]).await?;
            self.sent += n as u64;

            let ratio = if self.size == 0 {
                1.0
            } else {
                (self.sent as f64 / self.size as f64).min(1.0)
            };
            return Ok(TransferEvent::Progress(ratio));
        }

        conn.shutdown_write().await?;

        let mut response = Vec::new();
        conn.read_to_end(&mut response).await?;

        let verdict = parse_verdict(&response);
        if verdict.success {
            Ok(TransferEvent::Done(()))
        } else {
            Err(DeviceError::RequestRejected(verdict.response))
        }
    }
}

/// `install-commit`: finalizes a staging session.
pub struct InstallCommit {
    pub serial: DeviceSerial,
    pub features: FeatureSet,
    pub session_id: String,
}

impl HostRequest for InstallCommit {
    type Output = ();

    fn validate(&self) -> ValidationResponse {
        if self.session_id.is_empty() {
            ValidationResponse::failure("install session id is empty")
        } else {
            ValidationResponse::success()
        }
    }

    fn target(&self) -> Target {
        Target::Serial(self.serial.clone())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let args = vec!["install-commit".to_owned(), self.session_id.clone()];
        encode_message(&package_command(&self.features, &args))
    }

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut response = Vec::new();
        conn.read_to_end(&mut response).await?;

        let verdict = parse_verdict(&response);
        if verdict.success {
            Ok(())
        } else {
            Err(DeviceError::RequestRejected(verdict.response))
        }
    }
}
