// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Decoding of the per-frame sub-headers inside DVRIP media messages.
//!
//! Every media message body begins with `00 00 01 <type>`; the type byte
//! selects one of five little-endian sub-header shapes. Bodies starting with
//! anything else are skipped so the reader can resynchronize.

use base::{bail, err, Error};
use byteorder::{ByteOrder, LittleEndian};

pub const EXPECTED_AUDIO_SAMPLE_RATE: u32 = 8000;

const TYPE_VIDEO_I: u8 = 0xFC;
const TYPE_VIDEO_P: u8 = 0xFD;
const TYPE_AUDIO: u8 = 0xFA;
const TYPE_PICTURE: u8 = 0xFE;
const TYPE_INFO: u8 = 0xF9;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MediaKind {
    VideoI,
    VideoP,
    Audio,
    Picture,
    Info,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VideoCodec {
    Mpeg4,
    H264,
    H265,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VideoInfo {
    pub codec: Option<VideoCodec>,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MediaHeader {
    pub kind: MediaKind,
    /// Payload length as declared by the device; see [`payload_length`].
    pub declared_length: u32,
    /// Video format; key frames only.
    pub video: Option<VideoInfo>,
    /// Full wall-clock time (UTC); key frames and pictures only.
    pub date_time: Option<jiff::civil::DateTime>,
    /// Audio frames only; `None` for an unrecognized sample rate index.
    pub sample_rate: Option<u32>,
    /// Total sub-header length including the 4-byte common prefix.
    pub header_len: usize,
}

/// Decodes the sub-header at the start of a media message body. `Ok(None)`
/// means the body doesn't start with the common prefix (or carries an unknown
/// type byte) and should be skipped for resynchronization.
pub fn decode(body: &[u8]) -> Result<Option<MediaHeader>, Error> {
    if body.len() < 4 {
        bail!(InvalidArgument, msg("media body too short: {} bytes", body.len()));
    }
    if body[0] != 0 || body[1] != 0 || body[2] != 1 {
        return Ok(None);
    }
    let h = match body[3] {
        TYPE_VIDEO_I => {
            let b = sub_header(body, 16)?;
            let misc = &b[0..4];
            MediaHeader {
                kind: MediaKind::VideoI,
                declared_length: LittleEndian::read_u32(&b[8..12]),
                video: Some(VideoInfo {
                    codec: video_codec(misc[0]),
                    width: (u16::from((misc[0] & 0x30) >> 4) << 8 | u16::from(misc[2])) * 8,
                    height: (u16::from((misc[0] & 0xC0) >> 6) << 8 | u16::from(misc[3])) * 8,
                    fps: misc[1],
                }),
                // Cameras with an unset RTC send nonsense here; that must
                // not break the stream.
                date_time: unpack_date_time(LittleEndian::read_u32(&b[4..8])).ok(),
                sample_rate: None,
                header_len: 16,
            }
        }
        TYPE_VIDEO_P => {
            let b = sub_header(body, 8)?;
            MediaHeader {
                kind: MediaKind::VideoP,
                declared_length: LittleEndian::read_u32(&b[0..4]),
                video: None,
                date_time: None,
                sample_rate: None,
                header_len: 8,
            }
        }
        TYPE_AUDIO => {
            let b = sub_header(body, 8)?;
            MediaHeader {
                kind: MediaKind::Audio,
                declared_length: u32::from(LittleEndian::read_u16(&b[2..4])),
                video: None,
                date_time: None,
                // Index 2 is the only rate observed in the wild.
                sample_rate: (b[1] == 2).then_some(EXPECTED_AUDIO_SAMPLE_RATE),
                header_len: 8,
            }
        }
        TYPE_PICTURE => {
            let b = sub_header(body, 16)?;
            MediaHeader {
                kind: MediaKind::Picture,
                declared_length: LittleEndian::read_u32(&b[8..12]),
                video: None,
                date_time: unpack_date_time(LittleEndian::read_u32(&b[4..8])).ok(),
                sample_rate: None,
                header_len: 16,
            }
        }
        TYPE_INFO => {
            let b = sub_header(body, 8)?;
            MediaHeader {
                kind: MediaKind::Info,
                declared_length: u32::from(LittleEndian::read_u16(&b[2..4])),
                video: None,
                date_time: None,
                sample_rate: None,
                header_len: 8,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(h))
}

fn sub_header(body: &[u8], total_len: usize) -> Result<&[u8], Error> {
    if body.len() < total_len {
        bail!(
            InvalidArgument,
            msg("truncated media sub-header: {} of {total_len} bytes", body.len())
        );
    }
    Ok(&body[4..total_len])
}

fn video_codec(misc0: u8) -> Option<VideoCodec> {
    match misc0 & 0x0F {
        0x01 => Some(VideoCodec::Mpeg4),
        0x02 => Some(VideoCodec::H264),
        0x03 => Some(VideoCodec::H265),
        _ => None,
    }
}

/// Reconciles the declared payload length against the actual message size.
/// A surplus of exactly 168 bytes is a frequent and benign device quirk;
/// any other mismatch is fatal.
pub fn payload_length(h: &MediaHeader, body_len: usize) -> Result<usize, Error> {
    let actual = body_len
        .checked_sub(h.header_len)
        .ok_or_else(|| err!(InvalidArgument, msg("media body shorter than its header")))?;
    let diff = actual as i64 - i64::from(h.declared_length);
    if diff != 0 && diff != 168 {
        bail!(
            InvalidArgument,
            msg(
                "unexpected media payload length: got {actual}, declared {}, diff {diff}",
                h.declared_length
            )
        );
    }
    Ok(actual)
}

/// Packed date-time layout (32 bits): second\[5:0\], minute\[11:6\],
/// hour\[16:12\], day\[21:17\], month\[25:22\], year\[31:26\]+2000. UTC.
fn unpack_date_time(v: u32) -> Result<jiff::civil::DateTime, Error> {
    let second = (v & 0x3F) as i8;
    let minute = ((v & 0xFC0) >> 6) as i8;
    let hour = ((v & 0x1F000) >> 12) as i8;
    let day = ((v & 0x3E_0000) >> 17) as i8;
    let month = ((v & 0x3C0_0000) >> 22) as i8;
    let year = ((v & 0xFC00_0000) >> 26) as i16 + 2000;
    jiff::civil::DateTime::new(year, month, day, hour, minute, second, 0)
        .map_err(|e| err!(InvalidArgument, msg("bad packed date-time {v:#010x}"), source(e)))
}

#[cfg(test)]
fn pack_date_time(dt: jiff::civil::DateTime) -> u32 {
    (dt.second() as u32)
        | (dt.minute() as u32) << 6
        | (dt.hour() as u32) << 12
        | (dt.day() as u32) << 17
        | (dt.month() as u32) << 22
        | ((dt.year() - 2000) as u32) << 26
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i_frame_body(misc: [u8; 4], dt: u32, len: u32, payload: &[u8]) -> Vec<u8> {
        let mut b = vec![0, 0, 1, TYPE_VIDEO_I];
        b.extend_from_slice(&misc);
        b.extend_from_slice(&dt.to_le_bytes());
        b.extend_from_slice(&len.to_le_bytes());
        b.extend_from_slice(payload);
        b
    }

    #[test]
    fn i_frame_header() {
        // 1920x1080 H.265 at 25 fps: width = 0x780 / 8 = 240 = 0x0F0,
        // height = 1080 / 8 = 135 = 0x087.
        let misc = [0x03 | 0x00 << 4 | 0x00 << 6, 25, 0xF0, 0x87];
        let dt = pack_date_time(jiff::civil::DateTime::new(2024, 3, 9, 13, 5, 7, 0).unwrap());
        let body = i_frame_body(misc, dt, 4, &[1, 2, 3, 4]);
        let h = decode(&body).unwrap().unwrap();
        assert_eq!(h.kind, MediaKind::VideoI);
        let v = h.video.unwrap();
        assert_eq!(v.codec, Some(VideoCodec::H265));
        assert_eq!((v.width, v.height, v.fps), (1920, 1080, 25));
        assert_eq!(
            h.date_time.unwrap(),
            jiff::civil::DateTime::new(2024, 3, 9, 13, 5, 7, 0).unwrap()
        );
        assert_eq!(payload_length(&h, body.len()).unwrap(), 4);
    }

    #[test]
    fn large_dimensions_use_misc_high_bits() {
        // 3840x2160: 3840/8 = 480 = 0x1E0 (high bit via misc[0] bits 4-5),
        // 2160/8 = 270 = 0x10E (high bit via misc[0] bits 6-7).
        let misc = [0x02 | 0x01 << 4 | 0x01 << 6, 30, 0xE0, 0x0E];
        // 2001-01-01 00:00:00 packed.
        let body = i_frame_body(misc, 0x0442_0000, 0, &[]);
        let v = decode(&body).unwrap().unwrap().video.unwrap();
        assert_eq!((v.width, v.height), (3840, 2160));
        assert_eq!(v.codec, Some(VideoCodec::H264));
    }

    #[test]
    fn p_frame_header() {
        let mut b = vec![0, 0, 1, TYPE_VIDEO_P];
        b.extend_from_slice(&8u32.to_le_bytes());
        b.extend_from_slice(&[0u8; 8]);
        let h = decode(&b).unwrap().unwrap();
        assert_eq!(h.kind, MediaKind::VideoP);
        assert_eq!(h.declared_length, 8);
        assert_eq!(h.header_len, 8);
        assert_eq!(payload_length(&h, b.len()).unwrap(), 8);
    }

    #[test]
    fn audio_header() {
        let b = vec![0, 0, 1, TYPE_AUDIO, 0x0E, 2, 160, 0, /* payload */ 0xAA];
        let h = decode(&b).unwrap().unwrap();
        assert_eq!(h.kind, MediaKind::Audio);
        assert_eq!(h.sample_rate, Some(8000));
        assert_eq!(h.declared_length, 160);
    }

    #[test]
    fn resync_on_bad_prefix() {
        assert!(decode(&[1, 2, 3, 4, 5]).unwrap().is_none());
        assert!(decode(&[0, 0, 2, TYPE_VIDEO_I, 0, 0, 0, 0]).unwrap().is_none());
        // Unknown type byte after a valid prefix is skipped too.
        assert!(decode(&[0, 0, 1, 0x42, 0, 0, 0, 0]).unwrap().is_none());
    }

    #[test]
    fn truncated_body_is_fatal() {
        assert!(decode(&[0, 0, 1]).is_err());
        assert!(decode(&[0, 0, 1, TYPE_VIDEO_I, 1, 2]).is_err());
    }

    #[test]
    fn length_reconciliation() {
        let b = i_frame_body([0x02, 25, 0x50, 0x2D], 0x0442_0000, 100, &[]);
        let h = decode(&b).unwrap().unwrap();
        // Exact match.
        assert!(payload_length(&h, 16 + 100).is_ok());
        // The benign 168-byte surplus.
        assert_eq!(payload_length(&h, 16 + 268).unwrap(), 268);
        // Anything else is fatal.
        assert!(payload_length(&h, 16 + 99).is_err());
        assert!(payload_length(&h, 16 + 101).is_err());
    }

    #[test]
    fn date_time_round_trip() {
        for (y, mo, d, h, mi, s) in [
            (2000, 1, 1, 0, 0, 0),
            (2024, 12, 31, 23, 59, 59),
            (2037, 6, 15, 12, 30, 30),
        ] {
            let dt = jiff::civil::DateTime::new(y, mo, d, h, mi, s, 0).unwrap();
            assert_eq!(unpack_date_time(pack_date_time(dt)).unwrap(), dt);
        }
    }
}
