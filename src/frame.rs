// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The normalized media unit flowing from a monitor to its subscribers.

use bytes::Bytes;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameKind {
    Video { key: bool, hevc: bool },
    Audio,
}

/// A single video or audio frame.
///
/// Video payloads are AVCC-framed: each NAL unit is preceded by its length as
/// a 4-byte big-endian integer. Audio payloads are raw G.711 A-law bytes.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub duration: Duration,
    pub data: Bytes,
}

impl Frame {
    pub fn video(key: bool, hevc: bool, duration: Duration, data: Bytes) -> Self {
        Frame {
            kind: FrameKind::Video { key, hevc },
            duration,
            data,
        }
    }

    /// An audio frame; the duration follows from the payload length because
    /// A-law carries one sample per byte.
    pub fn audio(sample_rate: u32, data: Bytes) -> Self {
        let ms = 1000 * data.len() as u64 / u64::from(sample_rate);
        Frame {
            kind: FrameKind::Audio,
            duration: Duration::from_millis(ms),
            data,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self.kind, FrameKind::Video { .. })
    }

    pub fn is_audio(&self) -> bool {
        self.kind == FrameKind::Audio
    }

    pub fn is_key(&self) -> bool {
        matches!(self.kind, FrameKind::Video { key: true, .. })
    }

    pub fn is_hevc(&self) -> bool {
        matches!(self.kind, FrameKind::Video { hevc: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_duration_from_payload() {
        let f = Frame::audio(8000, Bytes::from(vec![0u8; 320]));
        assert_eq!(f.duration, Duration::from_millis(40));
        assert!(f.is_audio());
        assert!(!f.is_video());
    }

    #[test]
    fn kind_predicates() {
        let f = Frame::video(true, false, Duration::from_millis(40), Bytes::new());
        assert!(f.is_video());
        assert!(f.is_key());
        assert!(!f.is_hevc());
        assert!(!f.is_audio());
    }
}
