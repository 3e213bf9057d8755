// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Fragmented `.mp4` muxing for Media Source Extensions.
//!
//! Builds ISO/IEC 14496-12 initialization segments (`ftyp` + `moov`) and
//! per-frame fragments (`moof` + `mdat`) for a single H.265 video track.
//! Each viewer owns its own instance: fragment sequence numbers and decode
//! times must start at zero at connection start, so the state cannot be
//! shared between viewers.

use crate::h265;

const TRACK_ID: u32 = 1;

const SAMPLE_IS_NON_SYNC: u32 = 0x10000;
const SAMPLE_DEPENDS_ON_1: u32 = 0x100_0000;
const SAMPLE_DEPENDS_ON_2: u32 = 0x200_0000;

pub const SAMPLE_VIDEO_I_FRAME: u32 = SAMPLE_DEPENDS_ON_2;
pub const SAMPLE_VIDEO_NON_I_FRAME: u32 = SAMPLE_DEPENDS_ON_1 | SAMPLE_IS_NON_SYNC;

// tfhd flags.
const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SAMPLE_SIZE: u32 = 0x000010;
const TFHD_DEFAULT_SAMPLE_FLAGS: u32 = 0x000020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

// trun flags.
const TRUN_DATA_OFFSET: u32 = 0x000001;

/// A growing box tree; `begin`/`end` maintain the length prefixes.
struct BoxWriter {
    buf: Vec<u8>,
    stack: Vec<usize>,
}

impl BoxWriter {
    fn with_capacity(cap: usize) -> Self {
        BoxWriter {
            buf: Vec::with_capacity(cap),
            stack: Vec::new(),
        }
    }

    fn begin(&mut self, name: &[u8; 4]) {
        self.stack.push(self.buf.len());
        self.buf.extend_from_slice(&[0; 4]);
        self.buf.extend_from_slice(name);
    }

    fn end(&mut self) {
        let start = self.stack.pop().expect("unbalanced box end");
        let size = (self.buf.len() - start) as u32;
        self.buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn skip(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u24(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes()[1..]);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// 16.16 fixed point.
    fn fixed32(&mut self, v: u32) {
        self.u16(v as u16);
        self.u16(0);
    }

    /// 8.8 fixed point.
    fn fixed16(&mut self, v: u8) {
        self.buf.push(v);
        self.buf.push(0);
    }

    fn matrix(&mut self) {
        self.u32(0x0001_0000);
        self.skip(4);
        self.skip(4);
        self.skip(4);
        self.u32(0x0001_0000);
        self.skip(4);
        self.skip(4);
        self.skip(4);
        self.u32(0x4000_0000);
    }

    fn into_bytes(self) -> Vec<u8> {
        debug_assert!(self.stack.is_empty(), "unbalanced boxes");
        self.buf
    }
}

/// Per-viewer fragment muxer state.
pub struct FragmentStream {
    sequence: u32,
    decode_time: u64,
}

impl Default for FragmentStream {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentStream {
    pub fn new() -> Self {
        FragmentStream {
            sequence: 0,
            decode_time: 0,
        }
    }

    /// Builds the initialization segment from an AVCC-framed H.265 key frame
    /// payload, using its VPS/SPS/PPS (with stock substitutes for any that
    /// are missing).
    pub fn init_segment(&self, avcc_key_payload: &[u8], clock_rate: u32) -> Vec<u8> {
        let params = h265::ParameterSets::from_avcc(avcc_key_payload);
        let (width, height) = params.pixel_dimensions().unwrap_or((1920, 1080));
        let config = params
            .decoder_configuration()
            .expect("from_avcc always yields complete parameter sets");

        let mut w = BoxWriter::with_capacity(1024);
        w.begin(b"ftyp");
        w.bytes(b"iso5");
        w.u32(512);
        w.bytes(b"iso5");
        w.bytes(b"iso6");
        w.bytes(b"mp41");
        w.end();

        w.begin(b"moov");
        write_mvhd(&mut w);
        write_video_trak(&mut w, clock_rate, width, height, &config);
        w.begin(b"mvex");
        w.begin(b"trex");
        w.skip(4); // version + flags
        w.u32(TRACK_ID);
        w.u32(1); // default sample description index
        w.skip(4); // default sample duration
        w.skip(4); // default sample size
        w.skip(4); // default sample flags
        w.end();
        w.end(); // mvex
        w.end(); // moov
        w.into_bytes()
    }

    /// Builds one `moof` + `mdat` fragment for an AVCC-framed frame.
    /// `duration` is in track timescale ticks; zero is patched to a small
    /// placeholder because a zero-length first frame makes some decoders
    /// glitch until the next fragment lands.
    pub fn fragment(&mut self, payload: &[u8], mut duration: u32) -> Vec<u8> {
        if duration == 0 {
            duration = 6000;
        }
        self.sequence += 1;
        let flags = if h265::is_key_frame(payload) {
            SAMPLE_VIDEO_I_FRAME
        } else {
            SAMPLE_VIDEO_NON_I_FRAME
        };

        let mut w = BoxWriter::with_capacity(256 + payload.len());
        w.begin(b"moof");
        w.begin(b"mfhd");
        w.skip(4); // version + flags
        w.u32(self.sequence);
        w.end();
        w.begin(b"traf");
        w.begin(b"tfhd");
        w.skip(1); // version
        w.u24(
            TFHD_DEFAULT_SAMPLE_DURATION
                | TFHD_DEFAULT_SAMPLE_SIZE
                | TFHD_DEFAULT_SAMPLE_FLAGS
                | TFHD_DEFAULT_BASE_IS_MOOF,
        );
        w.u32(TRACK_ID);
        w.u32(duration);
        w.u32(payload.len() as u32);
        w.u32(flags);
        w.end();
        w.begin(b"tfdt");
        w.buf.push(1); // version 1: 64-bit decode time
        w.skip(3); // flags
        w.u64(self.decode_time);
        w.end();
        w.begin(b"trun");
        w.skip(1); // version
        w.u24(TRUN_DATA_OFFSET);
        w.u32(1); // sample count
        // Data offset from moof start: everything written once the open
        // boxes close, plus this field, plus the mdat header.
        w.u32((w.buf.len() + 4 + 8) as u32);
        w.end(); // trun
        w.end(); // traf
        w.end(); // moof
        w.begin(b"mdat");
        w.bytes(payload);
        w.end();

        self.decode_time += u64::from(duration);
        w.into_bytes()
    }
}

fn write_mvhd(w: &mut BoxWriter) {
    w.begin(b"mvhd");
    w.skip(1); // version
    w.skip(3); // flags
    w.skip(4); // creation time
    w.skip(4); // modification time
    w.u32(1000); // timescale
    w.skip(4); // duration
    w.fixed32(1); // preferred rate
    w.fixed16(1); // preferred volume
    w.skip(10); // reserved
    w.matrix();
    w.skip(6 * 4); // pre_defined
    w.u32(0xFFFF_FFFF); // next track id
    w.end();
}

fn write_video_trak(w: &mut BoxWriter, clock_rate: u32, width: u16, height: u16, config: &[u8]) {
    const TKHD_TRACK_ENABLED: u32 = 0x0001;
    const TKHD_TRACK_IN_MOVIE: u32 = 0x0002;

    w.begin(b"trak");
    w.begin(b"tkhd");
    w.skip(1); // version
    w.u24(TKHD_TRACK_ENABLED | TKHD_TRACK_IN_MOVIE);
    w.skip(4); // creation time
    w.skip(4); // modification time
    w.u32(TRACK_ID);
    w.skip(4); // reserved
    w.skip(4); // duration
    w.skip(8); // reserved
    w.skip(2); // layer
    w.skip(2); // alternate group
    w.skip(2); // volume
    w.skip(2); // reserved
    w.matrix();
    w.fixed32(u32::from(width));
    w.fixed32(u32::from(height));
    w.end();

    w.begin(b"mdia");
    w.begin(b"mdhd");
    w.skip(1); // version
    w.skip(3); // flags
    w.skip(4); // creation time
    w.skip(4); // modification time
    w.u32(clock_rate); // timescale
    w.skip(4); // duration
    w.u16(0x55C4); // language (und)
    w.skip(2); // quality
    w.end();
    w.begin(b"hdlr");
    w.skip(1); // version
    w.skip(3); // flags
    w.skip(4); // pre_defined
    w.bytes(b"vide");
    w.skip(3 * 4); // reserved
    w.bytes(b"VideoHandler");
    w.skip(1); // NUL
    w.end();

    w.begin(b"minf");
    w.begin(b"vmhd");
    w.skip(1); // version
    w.u24(1); // flags
    w.skip(2); // graphics mode
    w.skip(3 * 2); // opcolor
    w.end();
    w.begin(b"dinf");
    w.begin(b"dref");
    w.skip(1); // version
    w.skip(3); // flags
    w.u32(1); // entry count
    w.begin(b"url ");
    w.skip(1); // version
    w.u24(1); // flags: self-contained
    w.end();
    w.end(); // dref
    w.end(); // dinf

    w.begin(b"stbl");
    w.begin(b"stsd");
    w.skip(1); // version
    w.skip(3); // flags
    w.u32(1); // entry count
    w.begin(b"hev1");
    w.skip(6); // reserved
    w.u16(1); // data reference index
    w.skip(2); // version
    w.skip(2); // revision
    w.skip(4); // vendor
    w.skip(4); // temporal quality
    w.skip(4); // spatial quality
    w.u16(width);
    w.u16(height);
    w.fixed32(72); // horizontal resolution
    w.fixed32(72); // vertical resolution
    w.skip(4); // reserved
    w.u16(1); // frame count
    w.skip(32); // compressor name
    w.u16(24); // depth
    w.u16(0xFFFF); // color table id (-1)
    w.begin(b"hvcC");
    w.bytes(config);
    w.end();
    w.begin(b"pasp");
    w.u32(1); // hSpacing
    w.u32(1); // vSpacing
    w.end();
    w.end(); // hev1
    w.end(); // stsd
    for name in [b"stts", b"stsc"] {
        w.begin(name);
        w.skip(1); // version
        w.skip(3); // flags
        w.skip(4); // entry count
        w.end();
    }
    w.begin(b"stsz");
    w.skip(1); // version
    w.skip(3); // flags
    w.skip(4); // sample size
    w.skip(4); // entry count
    w.end();
    w.begin(b"stco");
    w.skip(1); // version
    w.skip(3); // flags
    w.skip(4); // entry count
    w.end();
    w.end(); // stbl

    w.end(); // minf
    w.end(); // mdia
    w.end(); // trak
}

#[cfg(test)]
impl FragmentStream {
    pub(crate) fn decode_time_for_tests(&self) -> u64 {
        self.decode_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};

    fn avcc(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out
    }

    fn key_frame() -> Vec<u8> {
        avcc(&[&[h265::NAL_IDR_W_RADL << 1, 0x01, 0xaa, 0xbb]])
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[test]
    fn init_segment_shape() {
        let init = FragmentStream::new().init_segment(&key_frame(), 90000);
        assert_eq!(&init[4..8], b"ftyp");
        assert_eq!(&init[8..12], b"iso5");
        let ftyp_len = BigEndian::read_u32(&init[0..4]) as usize;
        assert_eq!(&init[ftyp_len + 4..ftyp_len + 8], b"moov");
        for b in [&b"mvhd"[..], b"trak", b"hev1", b"hvcC", b"mvex", b"trex"] {
            assert!(find(&init, b).is_some(), "missing {}", String::from_utf8_lossy(b));
        }
    }

    #[test]
    fn fragment_shape_and_offsets() {
        let mut s = FragmentStream::new();
        let payload = key_frame();
        let frag = s.fragment(&payload, 7500);

        assert_eq!(&frag[4..8], b"moof");
        let moof_len = BigEndian::read_u32(&frag[0..4]) as usize;
        assert_eq!(&frag[moof_len + 4..moof_len + 8], b"mdat");
        // The fragment ends with the payload.
        assert_eq!(&frag[frag.len() - payload.len()..], &payload[..]);

        // trun's data offset points just past the mdat header.
        let trun = find(&frag, b"trun").unwrap();
        let data_offset = BigEndian::read_u32(&frag[trun + 12..trun + 16]) as usize;
        assert_eq!(data_offset, moof_len + 8);
    }

    #[test]
    fn sequence_and_decode_time_advance() {
        let mut s = FragmentStream::new();
        let f1 = s.fragment(&key_frame(), 7500);
        let f2 = s.fragment(&key_frame(), 7500);

        let seq_at = |f: &[u8]| {
            let mfhd = find(f, b"mfhd").unwrap();
            BigEndian::read_u32(&f[mfhd + 8..mfhd + 12])
        };
        assert_eq!(seq_at(&f1), 1);
        assert_eq!(seq_at(&f2), 2);

        let tfdt_at = |f: &[u8]| {
            let tfdt = find(f, b"tfdt").unwrap();
            BigEndian::read_u64(&f[tfdt + 8..tfdt + 16])
        };
        assert_eq!(tfdt_at(&f1), 0);
        assert_eq!(tfdt_at(&f2), 7500);
    }

    #[test]
    fn zero_duration_is_patched() {
        let mut s = FragmentStream::new();
        let _ = s.fragment(&key_frame(), 0);
        assert_eq!(s.decode_time, 6000);
    }

    #[test]
    fn sample_flags_follow_frame_type() {
        let mut s = FragmentStream::new();
        let key = s.fragment(&key_frame(), 100);
        let delta = s.fragment(&avcc(&[&[h265::NAL_TRAIL_R << 1, 0x01, 0xcc]]), 100);

        let flags_at = |f: &[u8]| {
            let tfhd = find(f, b"tfhd").unwrap();
            // version+flags(4) track(4) duration(4) size(4) then flags.
            BigEndian::read_u32(&f[tfhd + 16..tfhd + 20])
        };
        assert_eq!(flags_at(&key), SAMPLE_VIDEO_I_FRAME);
        assert_eq!(flags_at(&delta), SAMPLE_VIDEO_NON_I_FRAME);
    }
}
