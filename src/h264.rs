// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! H.264 byte-stream handling.
//!
//! H.264 has two byte stream encodings: ISO/IEC 14496-10 Annex B, and ISO/IEC
//! 14496-15 AVC access units. Cameras send the former; both the Matroska and
//! the fragmented-MP4 muxers want the latter, so monitors convert once at the
//! source. The Annex B scanner here is codec-agnostic (start codes and access
//! unit delimiters look the same for H.265), so `h265.rs` shares it.

use base::{bail, err, Error};
use byteorder::{BigEndian, ByteOrder};

// See ISO/IEC 14496-10 table 7-1.
pub const NAL_SLICE_NON_IDR: u8 = 1;
pub const NAL_SLICE_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SEQ_PARAMETER_SET: u8 = 7;
pub const NAL_PIC_PARAMETER_SET: u8 = 8;
pub const NAL_ACCESS_UNIT_DELIMITER: u8 = 9;

const NAL_UNIT_TYPE_MASK: u8 = 0x1F; // bottom 5 bits of the first byte.

pub fn nal_unit_type(nal: &[u8]) -> u8 {
    nal[0] & NAL_UNIT_TYPE_MASK
}

/// True for an access unit delimiter of either codec.
fn is_aud(first_byte: u8) -> bool {
    first_byte & 0x1F == NAL_ACCESS_UNIT_DELIMITER || first_byte & 0x7E == 35 << 1
}

/// Converts an Annex B byte stream into AVCC framing (4-byte big-endian
/// lengths), dropping access unit delimiters. Bytes before the first start
/// code are ignored; devices occasionally prepend garbage after a resync.
pub fn annex_b_to_avcc(annex_b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(annex_b.len() + 8);
    each_annex_b_nal(annex_b, |nal| {
        if nal.is_empty() || is_aud(nal[0]) {
            return;
        }
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, nal.len() as u32);
        out.extend_from_slice(&len);
        out.extend_from_slice(nal);
    });
    out
}

/// Calls `f` for each NAL unit in an Annex B byte stream, handling both the
/// 3- and 4-byte start code forms.
fn each_annex_b_nal(data: &[u8], mut f: impl FnMut(&[u8])) {
    let mut i = 0;
    let mut start = None;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let end = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                f(&data[s..end]);
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        f(&data[s..]);
    }
}

/// Calls `f` for each NAL unit in an AVCC-framed payload.
pub fn each_avcc_nal(data: &[u8], f: &mut dyn FnMut(&[u8]) -> Result<(), Error>) -> Result<(), Error> {
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 4 {
            bail!(InvalidArgument, msg("truncated AVCC length prefix"));
        }
        let len = BigEndian::read_u32(rest) as usize;
        rest = &rest[4..];
        if len == 0 || rest.len() < len {
            bail!(
                InvalidArgument,
                msg("AVCC NAL length {len} exceeds remaining {}", rest.len())
            );
        }
        f(&rest[..len])?;
        rest = &rest[len..];
    }
    Ok(())
}

/// Cached parameter sets of an H.264 stream, NAL-encoded without framing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ParameterSets {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

impl ParameterSets {
    /// Updates from any parameter sets present in the given AVCC payload.
    pub fn update_from_avcc(&mut self, avcc: &[u8]) -> Result<(), Error> {
        each_avcc_nal(avcc, &mut |nal| {
            match nal_unit_type(nal) {
                NAL_SEQ_PARAMETER_SET => self.sps = nal.to_vec(),
                NAL_PIC_PARAMETER_SET => self.pps = nal.to_vec(),
                _ => {}
            }
            Ok(())
        })
    }

    pub fn is_complete(&self) -> bool {
        !self.sps.is_empty() && !self.pps.is_empty()
    }

    /// Builds an ISO/IEC 14496-15 section 5.2.4.1
    /// `AVCDecoderConfigurationRecord`.
    pub fn decoder_configuration(&self) -> Result<Vec<u8>, Error> {
        if !self.is_complete() {
            bail!(FailedPrecondition, msg("missing SPS or PPS"));
        }
        if self.sps.len() < 4 {
            bail!(InvalidArgument, msg("SPS too short: {} bytes", self.sps.len()));
        }
        let mut c = Vec::with_capacity(11 + self.sps.len() + self.pps.len());
        c.push(1); // configurationVersion
        c.push(self.sps[1]); // AVCProfileIndication
        c.push(self.sps[2]); // profile_compatibility
        c.push(self.sps[3]); // AVCLevelIndication
        c.push(0xFF); // lengthSizeMinusOne = 3 (4-byte lengths)
        c.push(0xE1); // numOfSequenceParameterSets = 1
        c.extend_from_slice(&(self.sps.len() as u16).to_be_bytes());
        c.extend_from_slice(&self.sps);
        c.push(1); // numOfPictureParameterSets
        c.extend_from_slice(&(self.pps.len() as u16).to_be_bytes());
        c.extend_from_slice(&self.pps);
        Ok(c)
    }

    /// The coded picture dimensions declared in the SPS.
    pub fn pixel_dimensions(&self) -> Result<(u16, u16), Error> {
        if self.sps.len() < 2 {
            bail!(FailedPrecondition, msg("no SPS seen yet"));
        }
        let sps = h264_reader::nal::sps::SeqParameterSet::from_bits(
            h264_reader::rbsp::BitReader::new(&self.sps[1..]),
        )
        .map_err(|e| err!(InvalidArgument, msg("bad H.264 SPS: {e:?}")))?;
        let (w, h) = sps
            .pixel_dimensions()
            .map_err(|e| err!(InvalidArgument, msg("bad H.264 SPS dimensions: {e:?}")))?;
        Ok((
            u16::try_from(w).map_err(|_| err!(OutOfRange, msg("width {w}")))?,
            u16::try_from(h).map_err(|_| err!(OutOfRange, msg("height {h}")))?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A real 320x240 baseline SPS + PPS pair.
    const SPS: [u8; 11] = [0x67, 0x42, 0xc0, 0x0d, 0xda, 0x05, 0x07, 0xe8, 0x40, 0x00, 0x00];
    const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

    #[test]
    fn annex_b_to_avcc_basic() {
        let mut annex_b = vec![0, 0, 0, 1];
        annex_b.extend_from_slice(&SPS);
        annex_b.extend_from_slice(&[0, 0, 1]);
        annex_b.extend_from_slice(&PPS);
        let avcc = annex_b_to_avcc(&annex_b);

        let mut nals = Vec::new();
        each_avcc_nal(&avcc, &mut |nal| {
            nals.push(nal.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(nals, vec![SPS.to_vec(), PPS.to_vec()]);
    }

    #[test]
    fn annex_b_to_avcc_drops_aud() {
        // AUD, then a non-IDR slice.
        let annex_b = [0, 0, 0, 1, 0x09, 0xf0, 0, 0, 1, 0x41, 0x9a, 0x02];
        let avcc = annex_b_to_avcc(&annex_b);
        assert_eq!(avcc, vec![0, 0, 0, 3, 0x41, 0x9a, 0x02]);
    }

    #[test]
    fn avcc_walk_rejects_truncation() {
        assert!(each_avcc_nal(&[0, 0, 0, 9, 0x41], &mut |_| Ok(())).is_err());
        assert!(each_avcc_nal(&[0, 0, 0], &mut |_| Ok(())).is_err());
    }

    #[test]
    fn decoder_configuration_layout() {
        let mut ps = ParameterSets::default();
        ps.sps = SPS.to_vec();
        ps.pps = PPS.to_vec();
        let c = ps.decoder_configuration().unwrap();
        assert_eq!(c[0], 1);
        assert_eq!(c[1], SPS[1]);
        assert_eq!(c[4], 0xFF);
        assert_eq!(c[5], 0xE1);
        assert_eq!(&c[8..8 + SPS.len()], &SPS);
    }

    #[test]
    fn incomplete_parameter_sets() {
        let ps = ParameterSets::default();
        assert!(ps.decoder_configuration().is_err());
    }
}
