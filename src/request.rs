/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The typed request contract every adb conversation goes through.
//!
//! A request is validated before any network work, optionally selects a
//! device transport, serializes exactly one control-channel payload, and
//! decodes its own result. Single-shot requests implement [`HostRequest`];
//! transfers that emit progress implement [`StreamRequest`] and are driven
//! through a [`StreamSession`].

use log::trace;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::adb::{DeviceSerial, Feature};
use crate::transport::Connection;
use crate::wire::encode_message;
use crate::{DeviceError, Result};

/// Which transport the adb server should bind the connection to before the
/// request proper runs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Target {
    /// Any single attached device.
    Any,
    /// The device with this serial.
    Serial(DeviceSerial),
    /// The single USB-attached device.
    Usb,
    /// The single running emulator.
    Emulator,
    /// No transport: the request is answered by the server itself.
    HostSide,
}

impl Target {
    /// The `host:transport` prefix command, or `None` for host-side requests.
    pub fn prefix(&self) -> Option<String> {
        match self {
            Target::Any => Some("host:transport-any".to_owned()),
            Target::Serial(serial) => Some(format!("host:transport:{}", serial)),
            Target::Usb => Some("host:transport-usb".to_owned()),
            Target::Emulator => Some("host:transport-local".to_owned()),
            Target::HostSide => None,
        }
    }
}

/// Outcome of validating a request's parameters, produced synchronously
/// before any I/O.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ValidationResponse {
    pub ok: bool,
    pub message: Option<String>,
}

impl ValidationResponse {
    pub fn success() -> ValidationResponse {
        ValidationResponse {
            ok: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> ValidationResponse {
        ValidationResponse {
            ok: false,
            message: Some(message.into()),
        }
    }

    fn into_result(self) -> Result<()> {
        if self.ok {
            Ok(())
        } else {
            Err(DeviceError::RequestValidation(
                self.message.unwrap_or_else(|| "invalid request".to_owned()),
            ))
        }
    }
}

/// A single-shot request: one framed payload, one decoded value.
#[allow(async_fn_in_trait)]
pub trait HostRequest {
    type Output;

    fn validate(&self) -> ValidationResponse {
        ValidationResponse::success()
    }

    fn target(&self) -> Target {
        Target::HostSide
    }

    /// Features the device must advertise for this request to be usable.
    /// Validation consults the caller-supplied feature snapshot.
    fn required_features(&self) -> &'static [Feature] {
        &[]
    }

    /// Produces the framed control-channel payload. Deterministic; may be
    /// called multiple times.
    fn serialize(&self) -> Result<Vec<u8>>;

    async fn read_result<S>(&mut self, conn: &mut Connection<S>) -> Result<Self::Output>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send;
}

/// One step of a streaming transfer: either a progress value or the
/// terminal result.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransferEvent<P, T> {
    Progress(P),
    Done(T),
}

/// A streaming request: one framed payload, then a lazy sequence of
/// progress values terminated by a result.
#[allow(async_fn_in_trait)]
pub trait StreamRequest {
    type Progress;
    type Output;

    fn validate(&self) -> ValidationResponse {
        ValidationResponse::success()
    }

    fn target(&self) -> Target {
        Target::HostSide
    }

    fn required_features(&self) -> &'static [Feature] {
        &[]
    }

    fn serialize(&self) -> Result<Vec<u8>>;

    /// Advances the transfer by one step. Must not be called again after it
    /// returns [`TransferEvent::Done`] or an error.
    async fn advance<S>(
        &mut self,
        conn: &mut Connection<S>,
    ) -> Result<TransferEvent<Self::Progress, Self::Output>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send;
}

/// Sends the `host:transport` prefix, when the target has one, and waits
/// for its arbiter response before the request proper is serialized.
async fn select_target<S>(target: Target, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Some(prefix) = target.prefix() {
        trace!(">> {:?}", prefix);
        conn.write_all(&encode_message(prefix.as_bytes())?).await?;
        conn.read_status().await?;
    }

    Ok(())
}

/// Writes the framed payload and reads its status, leaving the connection
/// positioned for the request's decoder.
async fn submit<S>(payload: Vec<u8>, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    trace!(">> {:?}", bstr::BStr::new(&payload));
    conn.write_all(&payload).await?;
    conn.read_status().await
}

/// Runs a single-shot request to completion over `conn`.
pub async fn execute<R, S>(mut request: R, conn: &mut Connection<S>) -> Result<R::Output>
where
    R: HostRequest,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    request.validate().into_result()?;
    select_target(request.target(), conn).await?;
    submit(request.serialize()?, conn).await?;
    request.read_result(conn).await
}

/// Submits a streaming request and hands back the session that drives it.
pub async fn start<R, S>(request: R, mut conn: Connection<S>) -> Result<StreamSession<R, S>>
where
    R: StreamRequest,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    request.validate().into_result()?;
    select_target(request.target(), &mut conn).await?;
    submit(request.serialize()?, &mut conn).await?;

    Ok(StreamSession {
        request,
        conn,
        finished: false,
    })
}

/// Drives a [`StreamRequest`] over its single-use connection.
///
/// Progress is emitted synchronously from the transfer loop: a consumer that
/// stops polling blocks the transfer and lets TCP backpressure propagate to
/// the device. Any error poisons the session and closes the socket.
pub struct StreamSession<R: StreamRequest, S> {
    request: R,
    conn: Connection<S>,
    finished: bool,
}

impl<R, S> StreamSession<R, S>
where
    R: StreamRequest,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Next transfer event, or `None` once the terminal event has been
    /// consumed.
    pub async fn next_event(
        &mut self,
    ) -> Result<Option<TransferEvent<R::Progress, R::Output>>> {
        if self.finished {
            return Ok(None);
        }

        match self.request.advance(&mut self.conn).await {
            Ok(TransferEvent::Done(output)) => {
                self.finished = true;
                self.conn.close().await.ok();
                Ok(Some(TransferEvent::Done(output)))
            }
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                // A failure mid-transfer leaves the peer's state unknown;
                // the socket must be discarded.
                self.finished = true;
                self.conn.close().await.ok();
                Err(e)
            }
        }
    }

    /// Token cancelling the underlying connection.
    pub fn cancellation_token(&self) -> tokio_util::sync::CancellationToken {
        self.conn.cancellation_token()
    }

    /// Drains the session, discarding progress, and returns the terminal
    /// value.
    pub async fn complete(mut self) -> Result<R::Output> {
        loop {
            match self.next_event().await? {
                Some(TransferEvent::Done(output)) => return Ok(output),
                Some(TransferEvent::Progress(_)) => {}
                None => {
                    return Err(DeviceError::Adb(
                        "stream ended without a terminal event".to_owned(),
                    ))
                }
            }
        }
    }
}
