// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The YAML configuration file.

use base::{err, Error};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_FRAGMENT_DURATION_DIVISOR: u32 = 12_000;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "BaseDir")]
    pub base_dir: PathBuf,

    /// Listen address for the webcast HTTP server, e.g. `":8080"`.
    #[serde(rename = "WebCastPort", default)]
    pub web_cast_port: Option<String>,

    /// Divisor applied to frame durations advertised to MSE viewers; the
    /// default under-reports so the browser's decode buffer stays hungry.
    #[serde(rename = "FragmentDurationDivisor", default = "default_divisor")]
    pub fragment_duration_divisor: u32,

    #[serde(rename = "Cameras", default)]
    pub cameras: Vec<CameraConfig>,
}

fn default_divisor() -> u32 {
    DEFAULT_FRAGMENT_DURATION_DIVISOR
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Deserialize)]
#[serde(try_from = "u8")]
pub enum StreamId {
    Main,
    Extra,
}

impl TryFrom<u8> for StreamId {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(StreamId::Main),
            1 => Ok(StreamId::Extra),
            _ => Err(format!("stream id must be 0 (main) or 1 (extra), not {v}")),
        }
    }
}

impl StreamId {
    /// The numeric form used in URLs and recording file suffixes.
    pub fn index(self) -> u8 {
        match self {
            StreamId::Main => 0,
            StreamId::Extra => 1,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(from = "String")]
pub enum CameraType {
    /// A Sofia/XMeye-style DVR speaking DVRIP on port 34567; the default.
    #[default]
    Dvr,
    Bitvision,
}

impl From<String> for CameraType {
    fn from(s: String) -> Self {
        // Any unrecognized value behaves like the default DVR type.
        if s == "BITVISION" {
            CameraType::Bitvision
        } else {
            CameraType::Dvr
        }
    }
}

#[derive(Copy, Clone, Debug, Deserialize)]
pub struct StreamConfig {
    #[serde(rename = "ID")]
    pub id: StreamId,
    #[serde(rename = "UseRTSP", default)]
    pub use_rtsp: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CameraConfig {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "User", default = "default_user")]
    pub user: String,
    #[serde(rename = "Password", default)]
    pub password: String,
    #[serde(rename = "Type", default)]
    pub type_: CameraType,
    #[serde(rename = "UseRTSP", default)]
    pub use_rtsp: bool,
    #[serde(rename = "HasAudio", default)]
    pub has_audio: bool,
    #[serde(rename = "Streams", default)]
    pub streams: Vec<StreamConfig>,
    /// Streams to record to MKV files.
    #[serde(rename = "Save", default)]
    pub save: Vec<StreamId>,
    /// Streams to re-broadcast via MSE.
    #[serde(rename = "WebCast", default)]
    pub webcast: Vec<StreamId>,
    #[serde(rename = "Disabled", default)]
    pub disabled: bool,
}

fn default_user() -> String {
    "admin".to_owned()
}

impl CameraConfig {
    pub fn has_anything_to_do(&self) -> bool {
        !self.disabled && (!self.save.is_empty() || !self.webcast.is_empty())
    }

    /// Whether the given stream should be pulled over RTSP rather than DVRIP.
    pub fn stream_uses_rtsp(&self, id: StreamId) -> bool {
        self.type_ == CameraType::Bitvision
            || self.use_rtsp
            || self
                .streams
                .iter()
                .any(|s| s.id == id && s.use_rtsp)
    }

    /// The TCP port probed to decide whether the camera is online.
    pub fn probe_port(&self) -> u16 {
        if self.type_ == CameraType::Bitvision || self.use_rtsp {
            554
        } else {
            crate::dvrip::PORT
        }
    }

    pub fn rtsp_url(&self, id: StreamId) -> String {
        match self.type_ {
            CameraType::Bitvision => format!(
                "rtsp://{}:{}@{}:554/{}",
                self.user, self.password, self.address, id
            ),
            CameraType::Dvr => format!(
                "rtsp://{}/user={}&password={}&channel=1&stream={}.sdp",
                self.address, self.user, self.password, id
            ),
        }
    }
}

/// Reads and parses the configuration file.
pub fn load(path: &Path) -> Result<Config, Error> {
    let raw = std::fs::read(path)
        .map_err(|e| err!(NotFound, msg("failed to open config file {}", path.display()), source(e)))?;
    let mut config: Config = serde_yaml::from_slice(&raw)
        .map_err(|e| err!(InvalidArgument, msg("failed to parse {}", path.display()), source(e)))?;
    dedup_cameras(&mut config.cameras);
    Ok(config)
}

/// Drops duplicate camera names, keeping the first occurrence.
fn dedup_cameras(cameras: &mut Vec<CameraConfig>) {
    let mut seen = std::collections::HashSet::new();
    cameras.retain(|c| {
        if seen.insert(c.name.clone()) {
            true
        } else {
            warn!("duplicate camera name: {}", c.name);
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
BaseDir: /var/recordings
WebCastPort: ":8080"
Cameras:
  - Name: porch
    Address: 192.168.1.50
    Password: secret
    HasAudio: true
    Streams:
      - ID: 1
        UseRTSP: true
    Save: [0]
    WebCast: [0, 1]
  - Name: gate
    Address: 192.168.1.51
    User: viewer
    Type: BITVISION
    Save: [0]
"#;

    #[test]
    fn parses_sample() {
        let c: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(c.base_dir, PathBuf::from("/var/recordings"));
        assert_eq!(c.web_cast_port.as_deref(), Some(":8080"));
        assert_eq!(c.fragment_duration_divisor, DEFAULT_FRAGMENT_DURATION_DIVISOR);
        assert_eq!(c.cameras.len(), 2);

        let porch = &c.cameras[0];
        assert_eq!(porch.user, "admin"); // default
        assert_eq!(porch.type_, CameraType::Dvr);
        assert!(porch.has_audio);
        assert_eq!(porch.save, vec![StreamId::Main]);
        assert_eq!(porch.webcast, vec![StreamId::Main, StreamId::Extra]);
        assert!(!porch.stream_uses_rtsp(StreamId::Main));
        assert!(porch.stream_uses_rtsp(StreamId::Extra));
        assert!(porch.has_anything_to_do());

        let gate = &c.cameras[1];
        assert_eq!(gate.user, "viewer");
        assert_eq!(gate.type_, CameraType::Bitvision);
        assert_eq!(gate.probe_port(), 554);
        assert!(gate.stream_uses_rtsp(StreamId::Main));
    }

    #[test]
    fn rtsp_url_shapes() {
        let c: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(
            c.cameras[0].rtsp_url(StreamId::Extra),
            "rtsp://192.168.1.50/user=admin&password=secret&channel=1&stream=1.sdp"
        );
        assert_eq!(
            c.cameras[1].rtsp_url(StreamId::Main),
            "rtsp://viewer:@192.168.1.51:554/0"
        );
    }

    #[test]
    fn duplicate_names_dropped() {
        let mut cams: Vec<CameraConfig> = serde_yaml::from_str(
            r#"
- Name: a
  Address: h1
- Name: a
  Address: h2
- Name: b
  Address: h3
"#,
        )
        .unwrap();
        dedup_cameras(&mut cams);
        assert_eq!(cams.len(), 2);
        assert_eq!(cams[0].address, "h1");
        assert_eq!(cams[1].name, "b");
    }

    #[test]
    fn bad_stream_id_rejected() {
        let r: Result<Config, _> = serde_yaml::from_str("BaseDir: /x\nCameras:\n  - Name: a\n    Address: h\n    Save: [2]\n");
        assert!(r.is_err());
    }

    #[test]
    fn disabled_camera_has_nothing_to_do() {
        let c: CameraConfig = serde_yaml::from_str(
            "Name: a\nAddress: h\nSave: [0]\nDisabled: true\n",
        )
        .unwrap();
        assert!(!c.has_anything_to_do());
    }
}
