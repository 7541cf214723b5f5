/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The two wire framings spoken on an adb server socket.
//!
//! Control-channel frames prefix a UTF-8 body with its byte length as four
//! uppercase hex digits. Sync frames are a fixed 8-byte header, a 4-byte
//! ASCII tag followed by a little-endian u32 whose meaning depends on the
//! tag. The endianness split is part of the protocol; do not unify.

use crate::adb::SyncCommand;
use crate::{DeviceError, Result};

/// Upper bound on a sync DATA chunk. Larger chunks are a protocol error.
pub const MAX_FILE_PACKET_LENGTH: usize = 64 * 1024;

/// Remote paths are limited to 1024 bytes of UTF-8 by the device daemon.
pub const MAX_REMOTE_PATH_LENGTH: usize = 1024;

/// Byte length of a sync frame header.
pub const SYNC_HEADER_LENGTH: usize = 8;

/// Frames a control-channel payload as `NNNN<body>`.
pub fn encode_message(payload: &[u8]) -> Result<Vec<u8>> {
    let hex_length = u16::try_from(payload.len()).map(|len| format!("{:0>4X}", len))?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(hex_length.as_bytes());
    frame.extend_from_slice(payload);

    Ok(frame)
}

/// Splits a complete control frame back into its body.
pub fn decode_message(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < 4 {
        return Err(DeviceError::MalformedFrame(format!(
            "frame too short for a length header: {} bytes",
            frame.len()
        )));
    }

    let (header, body) = frame.split_at(4);
    let expected = parse_hex_length(header)?;
    if body.len() != expected {
        return Err(DeviceError::MalformedFrame(format!(
            "length header says {} bytes but body has {}",
            expected,
            body.len()
        )));
    }

    Ok(body)
}

/// Parses the 4-digit hex length that prefixes control-channel payloads.
pub fn parse_hex_length(header: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| DeviceError::MalformedFrame(format!("length header {:?} is not ASCII", header)))?;

    usize::from_str_radix(text, 16)
        .map_err(|_| DeviceError::MalformedFrame(format!("length header {:?} is not hex", text)))
}

/// Encodes a sync frame header: 4-byte tag plus little-endian u32.
pub fn sync_header(command: SyncCommand, value: u32) -> [u8; SYNC_HEADER_LENGTH] {
    let mut header = [0; SYNC_HEADER_LENGTH];
    header[..4].copy_from_slice(command.code());
    header[4..].copy_from_slice(&value.to_le_bytes());
    header
}

/// Decodes a sync frame header into its tag and integer field.
pub fn parse_sync_header(header: &[u8; SYNC_HEADER_LENGTH]) -> Result<(SyncCommand, u32)> {
    let mut tag = [0; 4];
    tag.copy_from_slice(&header[..4]);

    let command = SyncCommand::from_code(&tag).ok_or(DeviceError::UnexpectedTag(tag))?;
    let value = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    Ok((command, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_with_uppercase_hex_length() {
        let frame = encode_message(b"host:version").unwrap();
        assert_eq!(frame, b"000Chost:version");
    }

    #[test]
    fn round_trips_across_representative_lengths() {
        for len in [0usize, 1, 15, 16, 255, 256, 4096, 65535] {
            let body = vec![b'x'; len];
            let frame = encode_message(&body).unwrap();

            assert_eq!(&frame[..4], format!("{:04X}", len).as_bytes());
            assert_eq!(decode_message(&frame).unwrap(), &body[..]);
        }
    }

    #[test]
    fn rejects_oversized_payload() {
        let body = vec![0u8; 65536];
        assert!(encode_message(&body).is_err());
    }

    #[test]
    fn rejects_malformed_length_header() {
        assert!(matches!(
            parse_hex_length(b"zzzz"),
            Err(DeviceError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode_message(b"00"),
            Err(DeviceError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode_message(b"0005abc"),
            Err(DeviceError::MalformedFrame(_))
        ));
    }

    #[test]
    fn sync_header_is_tag_plus_little_endian_length() {
        let header = sync_header(SyncCommand::Data, 0x1234);
        assert_eq!(&header, b"DATA\x34\x12\x00\x00");

        let (command, value) = parse_sync_header(&header).unwrap();
        assert_eq!(command, SyncCommand::Data);
        assert_eq!(value, 0x1234);
    }

    #[test]
    fn sync_header_rejects_unknown_tag() {
        let mut header = sync_header(SyncCommand::Done, 0);
        header[..4].copy_from_slice(b"WHAT");

        assert!(matches!(
            parse_sync_header(&header),
            Err(DeviceError::UnexpectedTag(tag)) if &tag == b"WHAT"
        ));
    }
}
