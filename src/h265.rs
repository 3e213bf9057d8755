// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! H.265 (HEVC) byte-stream handling: NAL unit classification, parameter set
//! extraction, the `HEVCDecoderConfigurationRecord`, and just enough SPS
//! parsing to learn the coded picture size. See Rec. ITU-T H.265.

use crate::h264::each_avcc_nal;
use base::{bail, Error};
use byteorder::{BigEndian, ByteOrder};

// Rec. ITU-T H.265 table 7-1.
pub const NAL_TRAIL_R: u8 = 1;
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_IDR_N_LP: u8 = 20;
pub const NAL_CRA: u8 = 21;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
pub const NAL_AUD: u8 = 35;
pub const NAL_PREFIX_SEI: u8 = 39;

/// The NAL unit type from the first byte of the two-byte H.265 NAL header.
pub fn nal_unit_type(nal: &[u8]) -> u8 {
    (nal[0] >> 1) & 0x3F
}

/// Whether an AVCC-framed access unit is a random access point. The first
/// slice NALU decides: IDR/CRA means key, a trailing-picture slice means
/// not, and everything ahead of the slices (parameter sets, SEI) is walked
/// past. Malformed framing reads as a non-key frame.
pub fn is_key_frame(avcc: &[u8]) -> bool {
    let mut rest = avcc;
    while rest.len() >= 4 {
        let len = BigEndian::read_u32(rest) as usize;
        let Some(nal) = rest.get(4..4 + len) else {
            return false;
        };
        if nal.len() >= 2 {
            match nal_unit_type(nal) {
                NAL_TRAIL_R => return false,
                NAL_IDR_W_RADL | NAL_IDR_N_LP | NAL_CRA => return true,
                _ => {}
            }
        }
        rest = &rest[4 + len..];
    }
    false
}

/// Cached parameter sets of an H.265 stream, NAL-encoded without framing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ParameterSets {
    pub vps: Vec<u8>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

// Stock 1080p parameter sets, used so a viewer joining mid-stream can still
// be initialized before the camera's own sets have been observed. Decoders
// re-latch on the in-band sets carried by the next key frame.
const FALLBACK_VPS: &[u8] = &[
    0x40, 0x01, 0x0c, 0x01, 0xff, 0xff, 0x01, 0x40, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00,
    0x00, 0x03, 0x00, 0x00, 0x03, 0x00, 0x99, 0xac, 0x09,
];
const FALLBACK_SPS: &[u8] = &[
    0x42, 0x01, 0x01, 0x01, 0x40, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00,
    0x00, 0x03, 0x00, 0x99, 0xa0, 0x01, 0x40, 0x20, 0x05, 0xa1, 0xfe, 0x5a, 0xee, 0x46, 0xc1,
    0xae, 0x55, 0x04,
];
const FALLBACK_PPS: &[u8] = &[0x44, 0x01, 0xc0, 0x73, 0xc0, 0x4c, 0x90];

impl ParameterSets {
    /// Updates from any parameter sets present in the given AVCC payload.
    pub fn update_from_avcc(&mut self, avcc: &[u8]) -> Result<(), Error> {
        each_avcc_nal(avcc, &mut |nal| {
            if nal.len() >= 2 {
                match nal_unit_type(nal) {
                    NAL_VPS => self.vps = nal.to_vec(),
                    NAL_SPS => self.sps = nal.to_vec(),
                    NAL_PPS => self.pps = nal.to_vec(),
                    _ => {}
                }
            }
            Ok(())
        })
    }

    /// Extracts parameter sets from an AVCC-framed key frame payload,
    /// substituting stock ones for any that are absent.
    pub fn from_avcc(avcc: &[u8]) -> Self {
        let mut ps = ParameterSets::default();
        let _ = ps.update_from_avcc(avcc);
        if ps.vps.is_empty() {
            ps.vps = FALLBACK_VPS.to_vec();
        }
        if ps.sps.is_empty() {
            ps.sps = FALLBACK_SPS.to_vec();
        }
        if ps.pps.is_empty() {
            ps.pps = FALLBACK_PPS.to_vec();
        }
        ps
    }

    /// Builds an ISO/IEC 14496-15 section 8.3.3.1
    /// `HEVCDecoderConfigurationRecord` with one array per parameter set.
    pub fn decoder_configuration(&self) -> Result<Vec<u8>, Error> {
        if self.sps.len() < 6 || self.vps.is_empty() || self.pps.is_empty() {
            bail!(FailedPrecondition, msg("missing or short H.265 parameter sets"));
        }
        let mut c = Vec::with_capacity(23 + 15 + self.vps.len() + self.sps.len() + self.pps.len());
        c.push(1); // configurationVersion
        c.extend_from_slice(&self.sps[3..6]); // general_profile_space..compat
        c.resize(21, 0);
        c.push(3); // lengthSizeMinusOne = 3, plus reserved bits
        c.push(3); // numOfArrays
        for nal in [&self.vps, &self.sps, &self.pps] {
            c.push((nal[0] >> 1) & 0x3F); // NAL_unit_type
            c.extend_from_slice(&1u16.to_be_bytes()); // numNalus
            c.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            c.extend_from_slice(nal);
        }
        Ok(c)
    }

    /// The coded picture dimensions from the SPS, if it parses.
    pub fn pixel_dimensions(&self) -> Option<(u16, u16)> {
        parse_sps_dimensions(&self.sps)
    }
}

/// Removes emulation prevention bytes (00 00 03 -> 00 00) from a NAL payload.
fn unescape_rbsp(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0usize;
    for &b in nal {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize, // in bits
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BitReader { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Option<u32> {
        let byte = self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(u32::from(bit))
    }

    fn read_bits(&mut self, n: u32) -> Option<u32> {
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.read_bit()?;
        }
        Some(v)
    }

    fn skip(&mut self, n: u32) -> Option<()> {
        let end = self.pos + n as usize;
        if end > self.data.len() * 8 {
            return None;
        }
        self.pos = end;
        Some(())
    }

    /// Unsigned exp-Golomb.
    fn read_ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return None;
            }
        }
        let rest = self.read_bits(leading_zeros)?;
        Some((1u32 << leading_zeros) - 1 + rest)
    }
}

/// Parses `pic_width_in_luma_samples` / `pic_height_in_luma_samples` from an
/// H.265 SPS NAL (header included). Only `general_profile_idc == 1` (Main)
/// profile_tier_level layouts are understood; anything else yields `None`
/// and the caller falls back to a default.
fn parse_sps_dimensions(sps_nal: &[u8]) -> Option<(u16, u16)> {
    if sps_nal.len() < 3 {
        return None;
    }
    let rbsp = unescape_rbsp(&sps_nal[2..]); // past the 2-byte NAL header
    let mut r = BitReader::new(&rbsp);

    let _sps_video_parameter_set_id = r.read_bits(4)?;
    let max_sub_layers_minus1 = r.read_bits(3)?;
    let _temporal_id_nesting = r.read_bit()?;

    // profile_tier_level
    let _profile_space = r.read_bits(2)?;
    let _tier_flag = r.read_bit()?;
    let profile_idc = r.read_bits(5)?;
    r.skip(32)?; // general_profile_compatibility_flags
    r.skip(48)?; // general constraint flags
    if profile_idc != 1 {
        return None;
    }
    let _level_idc = r.read_bits(8)?;
    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    for i in 0..max_sub_layers_minus1 as usize {
        profile_present[i] = r.read_bit()? == 1;
        level_present[i] = r.read_bit()? == 1;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            r.skip(2)?; // reserved_zero_2bits
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            let _space = r.read_bits(2)?;
            let _tier = r.read_bit()?;
            let sub_profile_idc = r.read_bits(5)?;
            r.skip(32)?;
            r.skip(48)?;
            if sub_profile_idc != 1 {
                return None;
            }
        }
        if level_present[i] {
            r.skip(8)?;
        }
    }

    let _sps_seq_parameter_set_id = r.read_ue()?;
    let chroma_format_idc = r.read_ue()?;
    if chroma_format_idc == 3 {
        let _separate_colour_plane = r.read_bit()?;
    }
    let width = r.read_ue()?;
    let height = r.read_ue()?;
    Some((u16::try_from(width).ok()?, u16::try_from(height).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};

    fn avcc(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            let mut len = [0u8; 4];
            BigEndian::write_u32(&mut len, nal.len() as u32);
            out.extend_from_slice(&len);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn key_frame_detection() {
        let idr = [NAL_IDR_W_RADL << 1, 0x01, 0xaa];
        let cra = [NAL_CRA << 1, 0x01, 0xcc];
        let trail = [NAL_TRAIL_R << 1, 0x01, 0xbb];
        let vps = [NAL_VPS << 1, 0x01];
        assert!(is_key_frame(&avcc(&[&idr])));
        assert!(is_key_frame(&avcc(&[&cra])));
        assert!(!is_key_frame(&avcc(&[&trail])));
        // The first slice decides; a later IDR doesn't make this a key frame.
        assert!(!is_key_frame(&avcc(&[&trail, &idr])));
        // Non-slice NALUs ahead of the slice are walked past.
        assert!(is_key_frame(&avcc(&[&vps, &idr])));
        assert!(!is_key_frame(&[]));
    }

    #[test]
    fn parameter_set_extraction() {
        let payload = avcc(&[FALLBACK_VPS, FALLBACK_SPS, FALLBACK_PPS, &[NAL_IDR_W_RADL << 1, 1]]);
        let ps = ParameterSets::from_avcc(&payload);
        assert_eq!(ps.vps, FALLBACK_VPS);
        assert_eq!(ps.sps, FALLBACK_SPS);
        assert_eq!(ps.pps, FALLBACK_PPS);
    }

    #[test]
    fn parameter_set_fallbacks() {
        let payload = avcc(&[&[NAL_IDR_W_RADL << 1, 1, 0xaa]]);
        let ps = ParameterSets::from_avcc(&payload);
        assert!(!ps.vps.is_empty());
        assert!(!ps.sps.is_empty());
        assert!(!ps.pps.is_empty());
    }

    #[test]
    fn decoder_configuration_layout() {
        let ps = ParameterSets::from_avcc(&[]);
        let c = ps.decoder_configuration().unwrap();
        assert_eq!(c[0], 1);
        assert_eq!(c[22], 3); // numOfArrays
        assert_eq!(c[23], NAL_VPS); // first array holds the VPS
        let vps_len = BigEndian::read_u16(&c[26..28]) as usize;
        assert_eq!(&c[28..28 + vps_len], FALLBACK_VPS);
    }

    #[test]
    fn sps_dimension_parse_is_total() {
        // Garbage and truncated input must yield None, never panic.
        assert_eq!(parse_sps_dimensions(&[]), None);
        assert_eq!(parse_sps_dimensions(&[0x42]), None);
        assert_eq!(parse_sps_dimensions(&[0x42, 0x01, 0xff, 0xff, 0xff]), None);
    }

    #[test]
    fn rbsp_unescape() {
        assert_eq!(unescape_rbsp(&[0, 0, 3, 1]), vec![0, 0, 1]);
        assert_eq!(unescape_rbsp(&[0, 0, 3, 0, 0, 3]), vec![0, 0, 0, 0]);
        assert_eq!(unescape_rbsp(&[1, 2, 3]), vec![1, 2, 3]);
    }
}
