/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub mod adb;
pub mod install;
pub mod request;
pub mod requests;
pub mod shell;
pub mod sync;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub mod test;

use std::collections::BTreeMap;
use std::io;
use std::num::{ParseIntError, TryFromIntError};
use std::path::{Component, Path};
use std::str::Utf8Error;
use std::time::SystemTime;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

pub use unix_path::{Path as UnixPath, PathBuf as UnixPathBuf};

pub use crate::adb::{DeviceSerial, Feature, FeatureSet};
pub use crate::install::InstallResult;
pub use crate::request::{StreamSession, Target, TransferEvent};
pub use crate::sync::{FileEntry, RemoteDirEntry, RemoteFileMetadata, RemoteMetadata};

use crate::install::{InstallCommit, InstallCreate, InstallPackage, InstallWrite};
use crate::request::{HostRequest, StreamRequest};
use crate::requests::{
    ExecCommand, FetchFeatures, ForwardPort, KillAllForwardPorts, KillAllReversePorts,
    KillForwardPort, KillReversePort, ListDevices, ReversePort, ServerVersion, ShellCommand,
};
use crate::sync::{ListDir, PullRequest, PushRequest, StatFile};
use crate::transport::Connection;

pub type Result<T> = std::result::Result<T, DeviceError>;

static SHELL_QUOTE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_@%+=:,./-]").unwrap());

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{0}")]
    Adb(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    FromInt(#[from] TryFromIntError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Multiple Android devices online")]
    MultipleDevices,
    #[error(transparent)]
    ParseInt(#[from] ParseIntError),
    #[error("pull of {path} failed: {message}")]
    PullFailed { path: String, message: String },
    #[error("push failed: {0}")]
    PushFailed(String),
    #[error("request rejected: {0}")]
    RequestRejected(String),
    #[error("invalid request: {0}")]
    RequestValidation(String),
    #[error("connection closed mid-frame")]
    ShortRead,
    #[error("unexpected sync tag {0:?}")]
    UnexpectedTag([u8; 4]),
    #[error("unexpected transport response {0:?}")]
    UnexpectedTransportResponse([u8; 4]),
    #[error("Unknown Android device with serial '{0}'")]
    UnknownDevice(String),
    #[error("unsupported sync protocol: {0}")]
    UnsupportedSyncProtocol(String),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
}

/// Detailed information about an ADB device.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct DeviceInfo {
    pub serial: DeviceSerial,
    pub info: BTreeMap<String, String>,
}

/// Represents a connection to an ADB host, which multiplexes the connections
/// to individual devices.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    /// The TCP host to connect to.  Defaults to `"localhost"`.
    pub host: Option<String>,
    /// The TCP port to connect to.  Defaults to `5037`.
    pub port: Option<u16>,
}

impl Default for Host {
    fn default() -> Host {
        Host {
            host: Some("localhost".to_string()),
            port: Some(5037),
        }
    }
}

impl Host {
    /// Searches for available devices, and selects the one as specified by
    /// `device_serial`.
    ///
    /// If multiple devices are online, and no device has been specified,
    /// the `ANDROID_SERIAL` environment variable can be used to select one.
    pub async fn device_or_default<T: AsRef<str>>(
        self,
        device_serial: Option<&T>,
    ) -> Result<Device> {
        let serials: Vec<String> = self
            .devices::<Vec<_>>()
            .await?
            .into_iter()
            .map(|d| d.serial)
            .collect();

        if let Some(ref serial) = device_serial
            .map(|v| v.as_ref().to_owned())
            .or_else(|| std::env::var("ANDROID_SERIAL").ok())
        {
            if !serials.contains(serial) {
                return Err(DeviceError::UnknownDevice(serial.clone()));
            }

            return Ok(Device::new(self, serial.to_owned()));
        }

        if serials.len() > 1 {
            return Err(DeviceError::MultipleDevices);
        }

        if let Some(serial) = serials.into_iter().next() {
            return Ok(Device::new(self, serial));
        }

        Err(DeviceError::Adb("No Android devices are online".to_owned()))
    }

    /// Opens a fresh connection to the adb server. Every request runs on its
    /// own connection; sync sessions keep theirs until they terminate.
    pub async fn connect(&self) -> Result<Connection<TcpStream>> {
        self.connect_with_token(CancellationToken::new()).await
    }

    pub async fn connect_with_token(
        &self,
        token: CancellationToken,
    ) -> Result<Connection<TcpStream>> {
        let stream = TcpStream::connect(format!(
            "{}:{}",
            self.host.clone().unwrap_or_else(|| "localhost".to_owned()),
            self.port.unwrap_or(5037)
        ))
        .await?;

        Ok(Connection::with_token(stream, token))
    }

    /// Runs a single-shot request to completion.
    pub async fn run<R: HostRequest>(&self, request: R) -> Result<R::Output> {
        let mut conn = self.connect().await?;
        let result = request::execute(request, &mut conn).await;
        conn.close().await.ok();
        result
    }

    /// Submits a streaming request, handing back the session that drives it.
    pub async fn start<R: StreamRequest>(
        &self,
        request: R,
    ) -> Result<StreamSession<R, TcpStream>> {
        let conn = self.connect().await?;
        request::start(request, conn).await
    }

    pub async fn version(&self) -> Result<u32> {
        self.run(ServerVersion).await
    }

    pub async fn devices<B: FromIterator<DeviceInfo>>(&self) -> Result<B> {
        let devices = self.run(ListDevices { long: true }).await?;
        Ok(devices.into_iter().collect())
    }
}

/// Represents an ADB device.
#[derive(Debug, Clone)]
pub struct Device {
    /// ADB host that controls this device.
    pub host: Host,

    /// Serial number uniquely identifying this ADB device.
    pub serial: DeviceSerial,
}

impl Device {
    pub fn new(host: Host, serial: DeviceSerial) -> Device {
        Device { host, serial }
    }

    fn target(&self) -> Target {
        Target::Serial(self.serial.clone())
    }

    /// Fetches a fresh feature snapshot for this device.
    pub async fn features(&self) -> Result<FeatureSet> {
        self.host
            .run(FetchFeatures {
                serial: self.serial.clone(),
            })
            .await
    }

    pub async fn shell_command(&self, shell_command: &str) -> Result<String> {
        self.host
            .run(ShellCommand {
                target: self.target(),
                command: shell_command.to_owned(),
            })
            .await
    }

    pub async fn exec_out(&self, command: &str) -> Result<Vec<u8>> {
        self.host
            .run(ExecCommand {
                target: self.target(),
                command: command.to_owned(),
            })
            .await
    }

    pub async fn clear_app_data(&self, package: &str) -> Result<bool> {
        self.shell_command(&format!("pm clear {}", package))
            .await
            .map(|v| v.contains("Success"))
    }

    pub async fn is_app_installed(&self, package: &str) -> Result<bool> {
        self.shell_command(&format!("pm path {}", package))
            .await
            .map(|v| v.contains("package:"))
    }

    pub async fn launch<T: AsRef<str>>(
        &self,
        package: &str,
        activity: &str,
        am_start_args: &[T],
    ) -> Result<bool> {
        let mut am_start = format!("am start -W -n {}/{}", package, activity);

        for arg in am_start_args {
            am_start.push(' ');
            if SHELL_QUOTE_REGEX.is_match(arg.as_ref()) {
                am_start.push_str(&format!("\"{}\"", &shell::escape(arg.as_ref())));
            } else {
                am_start.push_str(&shell::escape(arg.as_ref()));
            };
        }

        self.shell_command(&am_start)
            .await
            .map(|v| v.contains("Complete"))
    }

    pub async fn force_stop(&self, package: &str) -> Result<()> {
        debug!("Force stopping Android package: {}", package);
        self.shell_command(&format!("am force-stop {}", package))
            .await
            .and(Ok(()))
    }

    pub async fn path_exists(&self, path: &UnixPath) -> Result<bool> {
        self.shell_command(format!("ls {}", path.display()).as_str())
            .await
            .map(|path| !path.contains("No such file or directory"))
    }

    pub async fn create_dir(&self, path: &UnixPath) -> Result<()> {
        debug!("Creating {}", path.display());
        self.shell_command(&format!("mkdir -p {}", path.display()))
            .await?;

        Ok(())
    }

    pub async fn chmod(&self, path: &UnixPath, mask: &str, recursive: bool) -> Result<()> {
        let recursive = match recursive {
            true => " -R",
            false => "",
        };

        self.shell_command(&format!("chmod{} {} {}", recursive, mask, path.display()))
            .await?;

        Ok(())
    }

    pub async fn remove(&self, path: &UnixPath) -> Result<()> {
        debug!("Deleting {}", path.display());
        self.shell_command(&format!("rm -rf {}", path.display()))
            .await?;

        Ok(())
    }

    pub async fn forward_port(&self, local: u16, remote: u16) -> Result<u16> {
        self.host
            .run(ForwardPort {
                serial: self.serial.clone(),
                local,
                remote,
            })
            .await
    }

    pub async fn kill_forward_port(&self, local: u16) -> Result<()> {
        self.host
            .run(KillForwardPort {
                serial: self.serial.clone(),
                local,
            })
            .await
    }

    pub async fn kill_forward_all_ports(&self) -> Result<()> {
        self.host
            .run(KillAllForwardPorts {
                serial: self.serial.clone(),
            })
            .await
    }

    pub async fn reverse_port(&self, remote: u16, local: u16) -> Result<u16> {
        self.host
            .run(ReversePort {
                serial: self.serial.clone(),
                remote,
                local,
            })
            .await
    }

    pub async fn kill_reverse_port(&self, remote: u16) -> Result<()> {
        self.host
            .run(KillReversePort {
                serial: self.serial.clone(),
                remote,
            })
            .await
    }

    pub async fn kill_reverse_all_ports(&self) -> Result<()> {
        self.host
            .run(KillAllReversePorts {
                serial: self.serial.clone(),
            })
            .await
    }

    /// Stats a remote file through the sync service.
    pub async fn stat(&self, path: &UnixPath) -> Result<FileEntry> {
        self.host
            .run(StatFile {
                target: self.target(),
                path: path.to_path_buf(),
            })
            .await
    }

    /// Lists a remote directory tree through the sync service.
    pub async fn list_dir(&self, src: &UnixPath) -> Result<Vec<RemoteDirEntry>> {
        let src = src.to_path_buf();
        let mut queue = vec![(src.clone(), 0, "".to_string())];

        let mut listings = Vec::new();

        while let Some((next, depth, prefix)) = queue.pop() {
            let request = ListDir::descend(self.target(), next, depth, prefix);
            for listing in self.host.run(request).await? {
                if listing.metadata == RemoteMetadata::RemoteDir {
                    let mut child = src.clone();
                    child.push(listing.name.clone());
                    queue.push((child, depth + 1, listing.name.clone()));
                }

                listings.push(listing);
            }
        }

        Ok(listings)
    }

    /// Pulls a remote file into `sink`, discarding progress. On failure any
    /// partially written data stays in the sink; cleanup is the caller's
    /// choice.
    pub async fn pull<W>(&self, src: &UnixPath, sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let conn = self.host.connect().await?;
        let session = request::start(PullRequest::new(self.target(), src, sink), conn).await?;
        session.complete().await
    }

    /// Pulls a remote file, exposing the progress-emitting session.
    pub async fn start_pull<'a, W>(
        &self,
        src: &UnixPath,
        sink: &'a mut W,
    ) -> Result<StreamSession<PullRequest<'a, W>, TcpStream>>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.host
            .start(PullRequest::new(self.target(), src, sink))
            .await
    }

    pub async fn pull_dir(&self, src: &UnixPath, dest_dir: &Path) -> Result<()> {
        let src = src.to_path_buf();
        let dest_dir = dest_dir.to_path_buf();

        for entry in self.list_dir(&src).await? {
            match entry.metadata {
                RemoteMetadata::RemoteSymlink => {} // Ignored.
                RemoteMetadata::RemoteDir => {
                    let mut d = dest_dir.clone();
                    d.push(&entry.name);

                    std::fs::create_dir_all(&d)?;
                }
                RemoteMetadata::RemoteFile(_) => {
                    let mut s = src.clone();
                    s.push(&entry.name);
                    let mut d = dest_dir.clone();
                    d.push(&entry.name);

                    self.pull(&s, &mut File::create(d).await?).await?;
                }
            }
        }

        Ok(())
    }

    /// Pushes bytes from `source` to a remote path. `size` drives the
    /// progress ratio and `mtime` (whole seconds) is stamped on the remote
    /// file.
    pub async fn push<R>(
        &self,
        source: &mut R,
        size: u64,
        mtime: u32,
        dest: &UnixPath,
        mode: u32,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let conn = self.host.connect().await?;
        let request = PushRequest::new(self.target(), source, size, mtime, dest, mode);
        let session = request::start(request, conn).await?;
        session.complete().await
    }

    /// Pushes from `source`, exposing the progress-emitting session.
    pub async fn start_push<'a, R>(
        &self,
        source: &'a mut R,
        size: u64,
        mtime: u32,
        dest: &UnixPath,
        mode: u32,
    ) -> Result<StreamSession<PushRequest<'a, R>, TcpStream>>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.host
            .start(PushRequest::new(
                self.target(),
                source,
                size,
                mtime,
                dest,
                mode,
            ))
            .await
    }

    /// Pushes a local file to the device, creating missing destination
    /// directories first on devices whose push still mishandles them.
    pub async fn push_file(&self, local: &Path, dest: &UnixPath, mode: u32) -> Result<()> {
        let metadata = std::fs::metadata(local)?;
        let mtime = file_mtime(&metadata);

        let features = self.features().await?;
        if !features.supports(Feature::FixedPushMkdir) {
            self.ensure_push_directories(dest).await?;
        }

        let mut file = File::open(local).await?;
        self.push(&mut file, metadata.len(), mtime, dest, mode)
            .await
    }

    /// Android 9 (P) has a bug in its push implementation which causes a
    /// push that creates directories to fail with `secure_mkdirs failed`.
    /// Creating the destination directories and relaxing their permissions
    /// prior to the push works around it.
    async fn ensure_push_directories(&self, dest: &UnixPath) -> Result<()> {
        let mut current = dest.parent();
        let mut leaf: Option<&UnixPath> = None;
        let mut root: Option<&UnixPath> = None;

        while let Some(path) = current {
            if self.path_exists(path).await? {
                break;
            }
            if leaf.is_none() {
                leaf = Some(path);
            }
            root = Some(path);
            current = path.parent();
        }

        if let Some(path) = leaf {
            self.create_dir(path).await?;
        }

        if let Some(path) = root {
            self.chmod(path, "777", true).await?;
        }

        Ok(())
    }

    pub async fn push_dir(&self, source: &Path, dest_dir: &UnixPath, mode: u32) -> Result<()> {
        debug!("Pushing {} to {}", source.display(), dest_dir.display());

        let walker = WalkDir::new(source).follow_links(false).into_iter();

        for entry in walker {
            let entry = entry?;
            let path = entry.path();

            if !entry.metadata()?.is_file() {
                continue;
            }

            let tail = path
                .strip_prefix(source)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

            let dest = append_components(dest_dir, tail)?;
            self.push_file(path, &dest, mode).await?;
        }

        Ok(())
    }

    /// Installs a single `.apk` or `.apex` over the transport the device's
    /// features select, failing with the package manager's own message.
    pub async fn install_package(
        &self,
        package: &Path,
        reinstall: bool,
        extra_args: Vec<String>,
    ) -> Result<()> {
        let features = self.features().await?;
        let request =
            InstallPackage::new(self.serial.clone(), package, features, reinstall, extra_args);

        let session = self.host.start(request).await?;
        let result = session.complete().await?;

        if result.success {
            Ok(())
        } else {
            Err(DeviceError::RequestRejected(result.response))
        }
    }

    /// Installs a single package, exposing the progress-emitting session.
    pub async fn start_install(
        &self,
        package: &Path,
        reinstall: bool,
        extra_args: Vec<String>,
    ) -> Result<StreamSession<InstallPackage, TcpStream>> {
        let features = self.features().await?;
        self.host
            .start(InstallPackage::new(
                self.serial.clone(),
                package,
                features,
                reinstall,
                extra_args,
            ))
            .await
    }

    /// Installs a set of packages atomically through an install session:
    /// `install-create`, one `install-write` per package, `install-commit`.
    pub async fn install_packages(&self, packages: &[&Path], reinstall: bool) -> Result<()> {
        let features = self.features().await?;

        let mut args = Vec::new();
        if reinstall {
            args.push("-r".to_owned());
        }

        let session_id = self
            .host
            .run(InstallCreate {
                serial: self.serial.clone(),
                features: features.clone(),
                args,
            })
            .await?;

        for package in packages {
            let metadata = std::fs::metadata(package)?;
            let file_name = package
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| {
                    DeviceError::RequestValidation(format!(
                        "{} has no usable file name",
                        package.display()
                    ))
                })?;

            let mut file = File::open(package).await?;
            let request = InstallWrite::new(
                self.serial.clone(),
                features.clone(),
                session_id.clone(),
                file_name,
                &mut file,
                metadata.len(),
            );

            if let Err(e) = self.host.start(request).await?.complete().await {
                warn!("install session {} failed on {}: {}", session_id, file_name, e);
                return Err(e);
            }
        }

        self.host
            .run(InstallCommit {
                serial: self.serial.clone(),
                features,
                session_id,
            })
            .await
    }
}

fn file_mtime(metadata: &std::fs::Metadata) -> u32 {
    metadata
        .modified()
        .unwrap_or_else(|_| SystemTime::now())
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| (d.as_secs() & 0xFFFF_FFFF) as u32)
        .unwrap_or(0)
}

pub(crate) fn append_components(
    base: &UnixPath,
    tail: &Path,
) -> std::result::Result<UnixPathBuf, io::Error> {
    let mut buf = base.to_path_buf();

    for component in tail.components() {
        if let Component::Normal(segment) = component {
            let utf8 = segment.to_str().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::Other,
                    "Could not represent path segment as UTF-8",
                )
            })?;
            buf.push(utf8);
        } else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "Unexpected path component".to_owned(),
            ));
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_components_joins_normal_segments() {
        let base = UnixPath::new("/data/local/tmp");
        let tail = Path::new("bundle/base.apk");

        let joined = append_components(base, tail).unwrap();
        assert_eq!(joined, UnixPathBuf::from("/data/local/tmp/bundle/base.apk"));
    }

    #[test]
    fn append_components_rejects_parent_segments() {
        let base = UnixPath::new("/data/local/tmp");
        let tail = Path::new("../escape");

        assert!(append_components(base, tail).is_err());
    }
}
