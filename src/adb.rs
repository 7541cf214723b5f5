/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use log::trace;

use crate::DeviceError;

/// Serial number uniquely identifying an ADB device.
pub type DeviceSerial = String;

/// The 4-byte command tags used by the sync sub-protocol.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyncCommand {
    Data,
    Dent,
    Done,
    Fail,
    List,
    Lstat,
    Okay,
    Recv,
    Send,
    Stat,
}

impl SyncCommand {
    pub fn code(&self) -> &'static [u8; 4] {
        use self::SyncCommand::*;
        match *self {
            Data => b"DATA",
            Dent => b"DENT",
            Done => b"DONE",
            Fail => b"FAIL",
            List => b"LIST",
            Lstat => b"LSTA",
            Okay => b"OKAY",
            Recv => b"RECV",
            Send => b"SEND",
            Stat => b"STAT",
        }
    }

    pub fn from_code(code: &[u8; 4]) -> Option<SyncCommand> {
        use self::SyncCommand::*;
        match code {
            b"DATA" => Some(Data),
            b"DENT" => Some(Dent),
            b"DONE" => Some(Done),
            b"FAIL" => Some(Fail),
            b"LIST" => Some(List),
            b"LSTA" => Some(Lstat),
            b"OKAY" => Some(Okay),
            b"RECV" => Some(Recv),
            b"SEND" => Some(Send),
            b"STAT" => Some(Stat),
            _ => None,
        }
    }
}

impl fmt::Display for SyncCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(std::str::from_utf8(self.code()).unwrap_or("????"))
    }
}

/// A protocol capability advertised by a device.
///
/// The set of tokens a device reports gates which transports and protocol
/// extensions the client may use against it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum Feature {
    /// `cmd` binary is available, enabling `exec:cmd package` installs.
    Cmd,
    /// App Binary Bridge exec, the low-overhead replacement for `exec:cmd`.
    AbbExec,
    /// Device accepts `.apex` packages.
    Apex,
    /// Multiplexed shell protocol (`shell,v2:`).
    ShellV2,
    /// Sync v2 stat (`LST2`).
    StatV2,
    /// Sync v2 directory listing (`LSV2`).
    LsV2,
    /// Push creates missing directories with correct permissions.
    FixedPushMkdir,
}

impl Feature {
    pub fn token(&self) -> &'static str {
        use self::Feature::*;
        match *self {
            Cmd => "cmd",
            AbbExec => "abb_exec",
            Apex => "apex",
            ShellV2 => "shell_v2",
            StatV2 => "stat_v2",
            LsV2 => "ls_v2",
            FixedPushMkdir => "fixed_push_mkdir",
        }
    }

    pub fn from_token(token: &str) -> Option<Feature> {
        use self::Feature::*;
        match token {
            "cmd" => Some(Cmd),
            "abb_exec" => Some(AbbExec),
            "apex" => Some(Apex),
            "shell_v2" => Some(ShellV2),
            "stat_v2" => Some(StatV2),
            "ls_v2" => Some(LsV2),
            "fixed_push_mkdir" => Some(FixedPushMkdir),
            _ => None,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Snapshot of the features a device advertised on one connection.
///
/// Feature negotiation is per-device and per-connection; callers refresh the
/// snapshot when the device changes.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FeatureSet {
    features: BTreeSet<Feature>,
}

impl FeatureSet {
    pub fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.features.iter().copied()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> FeatureSet {
        FeatureSet {
            features: iter.into_iter().collect(),
        }
    }
}

impl FromStr for FeatureSet {
    type Err = DeviceError;

    /// Parses a comma-separated token list. Unknown tokens are dropped so
    /// newer servers keep working against this client.
    fn from_str(s: &str) -> crate::Result<FeatureSet> {
        let features = s
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .filter_map(|token| {
                let feature = Feature::from_token(token);
                if feature.is_none() {
                    trace!("dropping unknown feature token {:?}", token);
                }
                feature
            })
            .collect();

        Ok(FeatureSet { features })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_codes_round_trip() {
        for cmd in [
            SyncCommand::Data,
            SyncCommand::Dent,
            SyncCommand::Done,
            SyncCommand::Fail,
            SyncCommand::List,
            SyncCommand::Lstat,
            SyncCommand::Okay,
            SyncCommand::Recv,
            SyncCommand::Send,
            SyncCommand::Stat,
        ] {
            assert_eq!(SyncCommand::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(SyncCommand::from_code(b"QUIT"), None);
    }

    #[test]
    fn parses_advertised_features() {
        let features: FeatureSet = "cmd,shell_v2,abb_exec,apex".parse().unwrap();

        assert!(features.supports(Feature::Cmd));
        assert!(features.supports(Feature::ShellV2));
        assert!(features.supports(Feature::AbbExec));
        assert!(features.supports(Feature::Apex));
        assert!(!features.supports(Feature::StatV2));
    }

    #[test]
    fn drops_unknown_tokens() {
        let features: FeatureSet = "cmd,sendrecv_v2_brotli,track_app,apex".parse().unwrap();

        let parsed: Vec<Feature> = features.iter().collect();
        assert_eq!(parsed, vec![Feature::Cmd, Feature::Apex]);
    }

    #[test]
    fn empty_list_is_empty_set() {
        let features: FeatureSet = "".parse().unwrap();
        assert!(features.is_empty());
    }
}
