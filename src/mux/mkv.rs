// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Matroska file muxing.
//!
//! Writes one `.mkv` file: EBML header, a Segment of unknown size holding
//! SeekHead, Info, Tracks, a sequence of Clusters of SimpleBlocks, and a
//! Cues index. `finalize` seeks back and rewrites the leading elements with
//! the then-known seek positions, duration, pixel dimensions, and codec
//! private data; every back-patched value uses a fixed-width encoding so the
//! rewritten header is byte-for-byte the same size.
//!
//! See <https://www.matroska.org/technical/elements.html>.

use crate::{h264, h265};
use base::{bail, err, Error};
use byteorder::{BigEndian, ByteOrder};
use std::io::{Seek, SeekFrom, Write};
use std::time::Duration;

// Element IDs, written verbatim (the ID bytes encode their own length).
const EL_EBML: u32 = 0x1A45_DFA3;
const EL_EBML_VERSION: u32 = 0x4286;
const EL_EBML_READ_VERSION: u32 = 0x42F7;
const EL_EBML_MAX_ID_LENGTH: u32 = 0x42F2;
const EL_EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
const EL_DOC_TYPE: u32 = 0x4282;
const EL_DOC_TYPE_VERSION: u32 = 0x4287;
const EL_DOC_TYPE_READ_VERSION: u32 = 0x4285;
const EL_SEGMENT: u32 = 0x1853_8067;
const EL_SEEK_HEAD: u32 = 0x114D_9B74;
const EL_SEEK: u32 = 0x4DBB;
const EL_SEEK_ID: u32 = 0x53AB;
const EL_SEEK_POSITION: u32 = 0x53AC;
const EL_INFO: u32 = 0x1549_A966;
const EL_TIMESTAMP_SCALE: u32 = 0x2AD7B1;
const EL_MUXING_APP: u32 = 0x4D80;
const EL_WRITING_APP: u32 = 0x5741;
const EL_DURATION: u32 = 0x4489;
const EL_DATE_UTC: u32 = 0x4461;
const EL_TRACKS: u32 = 0x1654_AE6B;
const EL_TRACK_ENTRY: u32 = 0xAE;
const EL_TRACK_NUMBER: u32 = 0xD7;
const EL_TRACK_UID: u32 = 0x73C5;
const EL_TRACK_TYPE: u32 = 0x83;
const EL_FLAG_LACING: u32 = 0x9C;
const EL_CODEC_ID: u32 = 0x86;
const EL_CODEC_PRIVATE: u32 = 0x63A2;
const EL_VIDEO: u32 = 0xE0;
const EL_PIXEL_WIDTH: u32 = 0xB0;
const EL_PIXEL_HEIGHT: u32 = 0xBA;
const EL_AUDIO: u32 = 0xE1;
const EL_SAMPLING_FREQUENCY: u32 = 0xB5;
const EL_CHANNELS: u32 = 0x9F;
const EL_CLUSTER: u32 = 0x1F43_B675;
const EL_CLUSTER_TIMESTAMP: u32 = 0xE7;
const EL_PREV_SIZE: u32 = 0xAB;
const EL_SIMPLE_BLOCK: u32 = 0xA3;
const EL_CUES: u32 = 0x1C53_BB6B;
const EL_CUE_POINT: u32 = 0xBB;
const EL_CUE_TIME: u32 = 0xB3;
const EL_CUE_TRACK_POSITIONS: u32 = 0xB7;
const EL_CUE_TRACK: u32 = 0xF7;
const EL_CUE_CLUSTER_POSITION: u32 = 0xF1;
const EL_CUE_BLOCK_NUMBER: u32 = 0x5378;
const EL_VOID: u32 = 0xEC;

const APP_NAME: &str = concat!("watchpost ", env!("CARGO_PKG_VERSION"));

/// One millisecond per timestamp unit.
const TIMESTAMP_SCALE: u64 = 1_000_000;

const VIDEO_TRACK: u64 = 1;
const AUDIO_TRACK: u64 = 2;

/// Reserved bytes for the video track's CodecPrivate content, back-filled at
/// finalize. The region is `CodecPrivate` (4-byte header + n) followed by a
/// `Void` soaking up the remaining `255 - n` bytes.
const CODEC_PRIVATE_RESERVE: usize = 255;

/// Cluster-relative block timecodes are i16; leave headroom before opening a
/// new cluster on a non-key frame.
const MAX_CLUSTER_TIMECODE: i64 = 32_000;

fn write_id(buf: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    buf.extend_from_slice(&bytes[skip..]);
}

/// Writes a minimal-width EBML size vint.
fn write_size(buf: &mut Vec<u8>, size: u64) {
    for width in 1..=8u32 {
        // The all-ones pattern of each width is reserved for "unknown".
        let max = (1u64 << (7 * width)) - 2;
        if size <= max {
            let marker = 1u64 << (7 * width);
            let v = marker | size;
            let bytes = v.to_be_bytes();
            buf.extend_from_slice(&bytes[8 - width as usize..]);
            return;
        }
    }
    unreachable!("size {size} fits in 8 vint bytes");
}

const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

fn minimal_uint_width(v: u64) -> usize {
    (8 - v.leading_zeros() as usize / 8).max(1)
}

fn write_uint(buf: &mut Vec<u8>, id: u32, v: u64) {
    write_uint_fixed(buf, id, v, minimal_uint_width(v));
}

fn write_uint_fixed(buf: &mut Vec<u8>, id: u32, v: u64, width: usize) {
    write_id(buf, id);
    write_size(buf, width as u64);
    buf.extend_from_slice(&v.to_be_bytes()[8 - width..]);
}

fn write_int_fixed8(buf: &mut Vec<u8>, id: u32, v: i64) {
    write_id(buf, id);
    write_size(buf, 8);
    buf.extend_from_slice(&v.to_be_bytes());
}

fn write_float8(buf: &mut Vec<u8>, id: u32, v: f64) {
    write_id(buf, id);
    write_size(buf, 8);
    buf.extend_from_slice(&v.to_be_bytes());
}

fn write_string(buf: &mut Vec<u8>, id: u32, s: &str) {
    write_binary(buf, id, s.as_bytes());
}

fn write_binary(buf: &mut Vec<u8>, id: u32, b: &[u8]) {
    write_id(buf, id);
    write_size(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

fn write_master(buf: &mut Vec<u8>, id: u32, content: &[u8]) {
    write_id(buf, id);
    write_size(buf, content.len() as u64);
    buf.extend_from_slice(content);
}

/// A Void element with a forced 2-byte size vint, so its total length is
/// `content_len + 3` regardless of value.
fn write_void_fixed(buf: &mut Vec<u8>, content_len: usize) {
    debug_assert!(content_len <= 0x3FFE);
    write_id(buf, EL_VOID);
    buf.push(0x40 | (content_len >> 8) as u8);
    buf.push(content_len as u8);
    buf.resize(buf.len() + content_len, 0);
}

#[derive(Copy, Clone, Debug)]
pub struct VideoTrack {
    pub hevc: bool,
}

#[derive(Copy, Clone, Debug)]
pub struct AudioTrack {
    pub sample_rate: u32,
    pub channels: u16,
}

enum VideoParams {
    Avc(h264::ParameterSets),
    Hevc(h265::ParameterSets),
}

impl VideoParams {
    fn update_from(&mut self, avcc: &[u8]) {
        // Parameter sets ride along with key frames; a malformed payload
        // just leaves the cache as it was.
        match self {
            VideoParams::Avc(ps) => {
                let _ = ps.update_from_avcc(avcc);
            }
            VideoParams::Hevc(ps) => {
                let _ = ps.update_from_avcc(avcc);
            }
        }
    }

    fn codec_private(&self) -> Option<Vec<u8>> {
        match self {
            VideoParams::Avc(ps) => ps.decoder_configuration().ok(),
            VideoParams::Hevc(ps) => ps.decoder_configuration().ok(),
        }
    }

    fn pixel_dimensions(&self) -> Option<(u16, u16)> {
        match self {
            VideoParams::Avc(ps) => ps.pixel_dimensions().ok(),
            VideoParams::Hevc(ps) => ps.pixel_dimensions(),
        }
    }
}

struct CuePoint {
    time_ms: u64,
    cluster_pos: u64, // relative to the segment data start
}

struct OpenCluster {
    /// Absolute file offset this cluster will be written at.
    offset: u64,
    /// Absolute timestamp (ms) of its first block.
    base_ms: i64,
    blocks: Vec<u8>,
    block_count: u64,
    first_block_is_video_key: bool,
}

/// A single Matroska file being written.
pub struct MkvFile<W: Write + Seek> {
    w: W,
    video: VideoTrack,
    audio: Option<AudioTrack>,
    params: VideoParams,
    date_utc: jiff::Timestamp,

    /// Absolute offset just past the Segment header; seek positions are
    /// relative to this.
    segment_data_start: u64,
    /// Absolute offset where clusters begin (= initial header length).
    clusters_start: u64,
    /// Absolute offset where the next cluster/cues write lands.
    pos: u64,

    cluster: Option<OpenCluster>,
    prev_cluster_size: u64,
    first_ms: Option<i64>,
    last_ms: i64,
    cues: Vec<CuePoint>,
}

impl<W: Write + Seek> MkvFile<W> {
    pub fn new(
        w: W,
        video: VideoTrack,
        audio: Option<AudioTrack>,
        date_utc: jiff::Timestamp,
    ) -> Result<Self, Error> {
        let params = if video.hevc {
            VideoParams::Hevc(h265::ParameterSets::default())
        } else {
            VideoParams::Avc(h264::ParameterSets::default())
        };
        let mut f = MkvFile {
            w,
            video,
            audio,
            params,
            date_utc,
            segment_data_start: 0,
            clusters_start: 0,
            pos: 0,
            cluster: None,
            prev_cluster_size: 0,
            first_ms: None,
            last_ms: 0,
            cues: Vec::new(),
        };
        let header = f.build_header(0, 0, 0.0);
        f.clusters_start = header.len() as u64;
        f.pos = f.clusters_start;
        f.w.write_all(&header)?;
        Ok(f)
    }

    /// Builds the EBML header + Segment prefix (SeekHead/Info/Tracks).
    /// Every value patched at finalize has a fixed width, so the result's
    /// length does not depend on the arguments.
    fn build_header(&mut self, cluster_pos: u64, cues_pos: u64, duration_ms: f64) -> Vec<u8> {
        let mut ebml = Vec::with_capacity(40);
        write_uint(&mut ebml, EL_EBML_VERSION, 1);
        write_uint(&mut ebml, EL_EBML_READ_VERSION, 1);
        write_uint(&mut ebml, EL_EBML_MAX_ID_LENGTH, 4);
        write_uint(&mut ebml, EL_EBML_MAX_SIZE_LENGTH, 8);
        write_string(&mut ebml, EL_DOC_TYPE, "matroska");
        write_uint(&mut ebml, EL_DOC_TYPE_VERSION, 4);
        write_uint(&mut ebml, EL_DOC_TYPE_READ_VERSION, 2);

        let mut buf = Vec::with_capacity(1024);
        write_master(&mut buf, EL_EBML, &ebml);
        write_id(&mut buf, EL_SEGMENT);
        buf.extend_from_slice(&UNKNOWN_SIZE);
        let data_start = buf.len() as u64;
        self.segment_data_start = data_start;

        // SeekHead: Info and Tracks immediately follow it; Cluster and Cues
        // are known only at finalize.
        let mut seeks = Vec::with_capacity(96);
        let mut info = Vec::with_capacity(96);
        write_uint(&mut info, EL_TIMESTAMP_SCALE, TIMESTAMP_SCALE);
        write_string(&mut info, EL_MUXING_APP, APP_NAME);
        write_string(&mut info, EL_WRITING_APP, APP_NAME);
        write_float8(&mut info, EL_DURATION, duration_ms);
        write_int_fixed8(&mut info, EL_DATE_UTC, date_utc_value(self.date_utc));
        let tracks = self.build_tracks();

        // The SeekHead's own encoded length is constant: 4 entries with
        // 8-byte positions.
        let seek_head_len = {
            let mut probe = Vec::new();
            for id in [EL_INFO, EL_TRACKS, EL_CLUSTER, EL_CUES] {
                probe.extend(seek_entry(id, 0));
            }
            let mut sh = Vec::new();
            write_master(&mut sh, EL_SEEK_HEAD, &probe);
            sh.len() as u64
        };
        let info_pos = seek_head_len;
        let tracks_pos = info_pos + info_element_len(&info);
        for (id, pos) in [
            (EL_INFO, info_pos),
            (EL_TRACKS, tracks_pos),
            (EL_CLUSTER, cluster_pos),
            (EL_CUES, cues_pos),
        ] {
            seeks.extend(seek_entry(id, pos));
        }
        write_master(&mut buf, EL_SEEK_HEAD, &seeks);
        write_master(&mut buf, EL_INFO, &info);
        write_master(&mut buf, EL_TRACKS, &tracks);
        buf
    }

    fn build_tracks(&self) -> Vec<u8> {
        let mut tracks = Vec::with_capacity(512);

        let mut v = Vec::with_capacity(384);
        write_uint(&mut v, EL_TRACK_NUMBER, VIDEO_TRACK);
        write_uint(&mut v, EL_TRACK_UID, VIDEO_TRACK);
        write_uint(&mut v, EL_TRACK_TYPE, 1);
        write_uint(&mut v, EL_FLAG_LACING, 0);
        let codec_id = if self.video.hevc {
            "V_MPEGH/ISO/HEVC"
        } else {
            "V_MPEG4/ISO/AVC"
        };
        write_string(&mut v, EL_CODEC_ID, codec_id);
        let (w, h) = self.params.pixel_dimensions().unwrap_or((1, 1));
        let mut vid = Vec::with_capacity(16);
        write_uint_fixed(&mut vid, EL_PIXEL_WIDTH, u64::from(w), 2);
        write_uint_fixed(&mut vid, EL_PIXEL_HEIGHT, u64::from(h), 2);
        write_master(&mut v, EL_VIDEO, &vid);
        write_codec_private_region(&mut v, self.params.codec_private().as_deref());
        write_master(&mut tracks, EL_TRACK_ENTRY, &v);

        if let Some(a) = self.audio {
            let mut t = Vec::with_capacity(96);
            write_uint(&mut t, EL_TRACK_NUMBER, AUDIO_TRACK);
            write_uint(&mut t, EL_TRACK_UID, AUDIO_TRACK);
            write_uint(&mut t, EL_TRACK_TYPE, 2);
            write_uint(&mut t, EL_FLAG_LACING, 0);
            write_string(&mut t, EL_CODEC_ID, "A_MS/ACM");
            write_binary(&mut t, EL_CODEC_PRIVATE, &waveformatex_alaw(a));
            let mut aud = Vec::with_capacity(16);
            write_float8(&mut aud, EL_SAMPLING_FREQUENCY, f64::from(a.sample_rate));
            write_uint(&mut aud, EL_CHANNELS, u64::from(a.channels));
            write_master(&mut t, EL_AUDIO, &aud);
            write_master(&mut tracks, EL_TRACK_ENTRY, &t);
        }
        tracks
    }

    pub fn write_video(&mut self, timestamp: Duration, key: bool, avcc: &[u8]) -> Result<(), Error> {
        if key {
            self.params.update_from(avcc);
        }
        self.write_block(VIDEO_TRACK, timestamp, key, avcc)
    }

    pub fn write_audio(&mut self, timestamp: Duration, data: &[u8]) -> Result<(), Error> {
        if self.audio.is_none() {
            bail!(FailedPrecondition, msg("no audio track configured"));
        }
        // A-law frames are all independently decodable.
        self.write_block(AUDIO_TRACK, timestamp, true, data)
    }

    fn write_block(
        &mut self,
        track: u64,
        timestamp: Duration,
        key: bool,
        data: &[u8],
    ) -> Result<(), Error> {
        let ms = timestamp.as_millis() as i64;
        if self.first_ms.is_none() {
            self.first_ms = Some(ms);
        }
        self.last_ms = self.last_ms.max(ms);

        let needs_new = match &self.cluster {
            None => true,
            Some(c) => {
                (track == VIDEO_TRACK && key && c.block_count > 0)
                    || ms - c.base_ms > MAX_CLUSTER_TIMECODE
            }
        };
        if needs_new {
            self.flush_cluster()?;
            self.cluster = Some(OpenCluster {
                offset: self.pos,
                base_ms: ms,
                blocks: Vec::with_capacity(4096),
                block_count: 0,
                first_block_is_video_key: track == VIDEO_TRACK && key,
            });
        }
        let c = self.cluster.as_mut().expect("cluster was just ensured");
        let rel = ms - c.base_ms;
        if rel < -(i16::MAX as i64) {
            // Snapped far into the past; dropping beats corrupting timecodes.
            return Ok(());
        }
        let mut block = Vec::with_capacity(5 + data.len());
        block.push(0x80 | track as u8);
        block.extend_from_slice(&(rel as i16).to_be_bytes());
        block.push(if key { 0x80 } else { 0x00 });
        block.extend_from_slice(data);
        write_master(&mut c.blocks, EL_SIMPLE_BLOCK, &block);
        c.block_count += 1;
        Ok(())
    }

    fn flush_cluster(&mut self) -> Result<(), Error> {
        let Some(c) = self.cluster.take() else {
            return Ok(());
        };
        let first = self.first_ms.unwrap_or(c.base_ms);
        let mut content = Vec::with_capacity(c.blocks.len() + 16);
        write_uint(&mut content, EL_CLUSTER_TIMESTAMP, (c.base_ms - first) as u64);
        if self.prev_cluster_size > 0 {
            write_uint(&mut content, EL_PREV_SIZE, self.prev_cluster_size);
        }
        content.extend_from_slice(&c.blocks);
        let mut out = Vec::with_capacity(content.len() + 12);
        write_master(&mut out, EL_CLUSTER, &content);
        self.w.write_all(&out)?;
        if c.first_block_is_video_key {
            self.cues.push(CuePoint {
                time_ms: (c.base_ms - first) as u64,
                cluster_pos: c.offset - self.segment_data_start,
            });
        }
        self.pos += out.len() as u64;
        self.prev_cluster_size = out.len() as u64;
        Ok(())
    }

    /// Flushes the final cluster, writes the Cues index, and rewrites the
    /// header with the real seek positions, duration, and codec data.
    pub fn finalize(mut self) -> Result<W, Error> {
        if self.cluster.is_none() && self.cues.is_empty() && self.pos == self.clusters_start {
            // Zero frames were written; emit an empty cluster so the file
            // still has the shape readers expect.
            self.cluster = Some(OpenCluster {
                offset: self.pos,
                base_ms: 0,
                blocks: Vec::new(),
                block_count: 0,
                first_block_is_video_key: false,
            });
        }
        self.flush_cluster()?;

        let cues_abs = self.pos;
        let mut cues = Vec::with_capacity(self.cues.len() * 32);
        for cue in &self.cues {
            let mut positions = Vec::with_capacity(24);
            write_uint(&mut positions, EL_CUE_TRACK, VIDEO_TRACK);
            write_uint(&mut positions, EL_CUE_CLUSTER_POSITION, cue.cluster_pos);
            write_uint(&mut positions, EL_CUE_BLOCK_NUMBER, 1);
            let mut point = Vec::with_capacity(32);
            write_uint(&mut point, EL_CUE_TIME, cue.time_ms);
            write_master(&mut point, EL_CUE_TRACK_POSITIONS, &positions);
            write_master(&mut cues, EL_CUE_POINT, &point);
        }
        let mut out = Vec::with_capacity(cues.len() + 8);
        write_master(&mut out, EL_CUES, &cues);
        self.w.write_all(&out)?;

        let duration = self.first_ms.map(|f| (self.last_ms - f) as f64).unwrap_or(0.0);
        let header = self.build_header(
            self.clusters_start - self.segment_data_start,
            cues_abs - self.segment_data_start,
            duration,
        );
        if header.len() as u64 != self.clusters_start {
            bail!(
                Internal,
                msg(
                    "rewritten header is {} bytes, expected {}",
                    header.len(),
                    self.clusters_start
                )
            );
        }
        self.w.seek(SeekFrom::Start(0))?;
        self.w.write_all(&header)?;
        self.w.flush()?;
        Ok(self.w)
    }
}

fn seek_entry(id: u32, pos: u64) -> Vec<u8> {
    let mut id_bytes = Vec::with_capacity(4);
    write_id(&mut id_bytes, id);
    let mut content = Vec::with_capacity(20);
    write_binary(&mut content, EL_SEEK_ID, &id_bytes);
    let mut e = Vec::with_capacity(24);
    write_id(&mut e, EL_SEEK_POSITION);
    write_size(&mut e, 8);
    let mut posb = [0u8; 8];
    BigEndian::write_u64(&mut posb, pos);
    e.extend_from_slice(&posb);
    content.extend_from_slice(&e);
    let mut entry = Vec::with_capacity(32);
    write_master(&mut entry, EL_SEEK, &content);
    entry
}

/// Encoded length of the Info element (header + content).
fn info_element_len(content: &[u8]) -> u64 {
    let mut probe = Vec::with_capacity(content.len() + 8);
    write_master(&mut probe, EL_INFO, content);
    probe.len() as u64
}

/// The fixed-size CodecPrivate reservation: the real configuration record
/// (when known) followed by a Void absorbing the remaining reserve. Both
/// layouts are exactly `CODEC_PRIVATE_RESERVE + 7` bytes, so the finalize
/// rewrite can't shift anything that follows.
fn write_codec_private_region(buf: &mut Vec<u8>, private: Option<&[u8]>) {
    match private {
        Some(p) if p.len() <= CODEC_PRIVATE_RESERVE => {
            write_id(buf, EL_CODEC_PRIVATE);
            // Forced 2-byte size so the region stays fixed regardless of p.
            buf.push(0x40);
            buf.push(p.len() as u8);
            buf.extend_from_slice(p);
            write_void_fixed(buf, CODEC_PRIVATE_RESERVE - p.len());
        }
        _ => {
            // Not yet known (or absurdly large): keep the whole region Void.
            write_void_fixed(buf, CODEC_PRIVATE_RESERVE + 4);
        }
    }
}

/// An 18-byte little-endian WAVEFORMATEX describing G.711 A-law.
fn waveformatex_alaw(a: AudioTrack) -> [u8; 18] {
    let mut b = [0u8; 18];
    b[0..2].copy_from_slice(&6u16.to_le_bytes()); // wFormatTag = WAVE_FORMAT_ALAW
    b[2..4].copy_from_slice(&a.channels.to_le_bytes());
    b[4..8].copy_from_slice(&a.sample_rate.to_le_bytes());
    let byte_rate = a.sample_rate * u32::from(a.channels);
    b[8..12].copy_from_slice(&byte_rate.to_le_bytes());
    b[12..14].copy_from_slice(&1u16.to_le_bytes()); // nBlockAlign
    b[14..16].copy_from_slice(&8u16.to_le_bytes()); // wBitsPerSample
    // cbSize = 0
    b
}

/// DateUTC: nanoseconds since 2001-01-01T00:00:00 UTC as a signed integer.
fn date_utc_value(ts: jiff::Timestamp) -> i64 {
    const MILLENNIUM_UNIX_NANOS: i128 = 978_307_200 * 1_000_000_000;
    i64::try_from(ts.as_nanosecond() - MILLENNIUM_UNIX_NANOS).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn avcc(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|w| w == needle)
    }

    fn ts() -> jiff::Timestamp {
        jiff::Timestamp::from_second(1_700_000_000).unwrap()
    }

    #[test]
    fn header_shape() {
        let f = MkvFile::new(
            Cursor::new(Vec::new()),
            VideoTrack { hevc: false },
            Some(AudioTrack {
                sample_rate: 8000,
                channels: 1,
            }),
            ts(),
        )
        .unwrap();
        let bytes = f.finalize().unwrap().into_inner();
        assert_eq!(&bytes[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        assert!(find(&bytes, b"matroska").is_some());
        assert!(find(&bytes, b"V_MPEG4/ISO/AVC").is_some());
        assert!(find(&bytes, b"A_MS/ACM").is_some());
        assert!(find(&bytes, &[0x1F, 0x43, 0xB6, 0x75]).is_some(), "no cluster");
        assert!(find(&bytes, &[0x1C, 0x53, 0xBB, 0x6B]).is_some(), "no cues");
    }

    #[test]
    fn hevc_codec_id() {
        let f = MkvFile::new(Cursor::new(Vec::new()), VideoTrack { hevc: true }, None, ts())
            .unwrap();
        let bytes = f.finalize().unwrap().into_inner();
        assert!(find(&bytes, b"V_MPEGH/ISO/HEVC").is_some());
    }

    #[test]
    fn clusters_open_on_key_frames() {
        let mut f =
            MkvFile::new(Cursor::new(Vec::new()), VideoTrack { hevc: false }, None, ts()).unwrap();
        let key = avcc(&[&[0x65, 1, 2, 3]]);
        let delta = avcc(&[&[0x41, 1, 2, 3]]);
        f.write_video(Duration::from_millis(0), true, &key).unwrap();
        f.write_video(Duration::from_millis(40), false, &delta).unwrap();
        f.write_video(Duration::from_millis(80), false, &delta).unwrap();
        f.write_video(Duration::from_millis(120), true, &key).unwrap();
        f.write_video(Duration::from_millis(160), false, &delta).unwrap();
        let bytes = f.finalize().unwrap().into_inner();

        let cluster_id = [0x1F, 0x43, 0xB6, 0x75];
        let count = bytes
            .windows(4)
            .filter(|w| *w == cluster_id)
            .count();
        // SeekHead references the Cluster ID once; two real clusters follow.
        assert_eq!(count, 3, "expected 2 clusters plus 1 seek entry");
    }

    #[test]
    fn finalize_rewrites_header_in_place() {
        let mut f =
            MkvFile::new(Cursor::new(Vec::new()), VideoTrack { hevc: false }, None, ts()).unwrap();
        let header_len = f.clusters_start;
        let key = avcc(&[&[0x65, 0, 1, 2]]);
        f.write_video(Duration::from_millis(0), true, &key).unwrap();
        f.write_video(Duration::from_millis(500), true, &key).unwrap();
        let bytes = f.finalize().unwrap().into_inner();

        // The first cluster starts exactly where the header ends.
        assert_eq!(
            &bytes[header_len as usize..header_len as usize + 4],
            &[0x1F, 0x43, 0xB6, 0x75]
        );
        // Duration = 500 ms, written as an 8-byte float.
        let duration = 500.0f64.to_be_bytes();
        assert!(find(&bytes, &duration).is_some(), "no duration");
    }

    #[test]
    fn seek_position_points_at_cluster() {
        let mut f =
            MkvFile::new(Cursor::new(Vec::new()), VideoTrack { hevc: false }, None, ts()).unwrap();
        let data_start = f.segment_data_start;
        let clusters_start = f.clusters_start;
        f.write_video(Duration::from_millis(0), true, &avcc(&[&[0x65, 9]]))
            .unwrap();
        let bytes = f.finalize().unwrap().into_inner();

        // SeekID for Cluster followed by an 8-byte SeekPosition.
        let seek_id = [0x53, 0xAB, 0x84, 0x1F, 0x43, 0xB6, 0x75];
        let at = find(&bytes, &seek_id).expect("no cluster seek entry");
        let pos_at = at + seek_id.len() + 3; // skip SeekPosition id (2) + size (1)
        let pos = BigEndian::read_u64(&bytes[pos_at..pos_at + 8]);
        assert_eq!(pos, clusters_start - data_start);
    }

    #[test]
    fn audio_requires_track() {
        let mut f =
            MkvFile::new(Cursor::new(Vec::new()), VideoTrack { hevc: false }, None, ts()).unwrap();
        assert!(f.write_audio(Duration::ZERO, &[0u8; 8]).is_err());
    }

    #[test]
    fn simple_block_layout() {
        let mut f = MkvFile::new(
            Cursor::new(Vec::new()),
            VideoTrack { hevc: false },
            Some(AudioTrack {
                sample_rate: 8000,
                channels: 1,
            }),
            ts(),
        )
        .unwrap();
        f.write_video(Duration::from_millis(0), true, &avcc(&[&[0x65, 0xAB]]))
            .unwrap();
        f.write_audio(Duration::from_millis(7), &[0x55, 0x55]).unwrap();
        let bytes = f.finalize().unwrap().into_inner();

        // Video block: track 1, timecode 0, key flag, AVCC payload.
        assert!(find(&bytes, &[0x81, 0x00, 0x00, 0x80, 0, 0, 0, 2, 0x65, 0xAB]).is_some());
        // Audio block: track 2, timecode +7, "key" flag, raw A-law payload.
        assert!(find(&bytes, &[0x82, 0x00, 0x07, 0x80, 0x55, 0x55]).is_some());
    }

    #[test]
    fn vint_encoding() {
        let mut b = Vec::new();
        write_size(&mut b, 0);
        assert_eq!(b, vec![0x80]);
        b.clear();
        write_size(&mut b, 126);
        assert_eq!(b, vec![0xFE]);
        b.clear();
        write_size(&mut b, 127); // all-ones is reserved; must widen
        assert_eq!(b, vec![0x40, 0x7F]);
        b.clear();
        write_size(&mut b, 500);
        assert_eq!(b, vec![0x41, 0xF4]);
    }
}
