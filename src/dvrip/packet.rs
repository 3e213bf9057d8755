// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! DVRIP wire framing: a fixed 20-byte little-endian header followed by
//! `data_length` bytes, and the reassembly of multi-packet messages.
//!
//! There are two packet families sharing the header layout:
//!
//! * control packets: `total_or_channel` is the packet count of a
//!   multi-packet message (0 and 1 both mean single), `current_or_end` is the
//!   ordinal starting at 0.
//! * media packets (code 1412): `total_or_channel` is the channel number,
//!   `current_or_end == 1` marks the last packet. A media message is
//!   multi-packet iff its first packet's `data_length` is ≥ 16384 or
//!   exactly 8192.

use base::{bail, Error};
use byteorder::{ByteOrder, LittleEndian};

pub type Code = u16;

pub const LOGIN_REQ: Code = 1000;
/// Received right after `LOGIN_REQ`. The protocol reuses 1001 for the logout
/// request as well; direction alone disambiguates, so never dispatch on this
/// value outside a login exchange.
pub const LOGIN_RSP: Code = 1001;
pub const LOGOUT_REQ: Code = 1001;
pub const KEEPALIVE_REQ: Code = 1005;
pub const KEEPALIVE_RSP: Code = 1006;
pub const MONITOR_REQ: Code = 1410;
pub const MONITOR_DATA: Code = 1412;
pub const MONITOR_CLAIM: Code = 1413;
pub const SYSMANAGER_REQ: Code = 1450;

pub const HEADER_LEN: usize = 20;
pub const HEAD_FLAG: u8 = 0xFF;

/// Every outgoing control body ends with a JSON newline + NUL, included in
/// the advertised `data_length`.
pub const MAGIC_END: [u8; 2] = [0x0A, 0x00];

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PacketHeader {
    pub version: u8,
    pub session_id: i32,
    pub sequence: u32,
    pub total_or_channel: u8,
    pub current_or_end: u8,
    pub code: Code,
    pub data_length: u32,
}

impl PacketHeader {
    pub fn parse(b: &[u8; HEADER_LEN]) -> Result<Self, Error> {
        if b[0] != HEAD_FLAG {
            bail!(InvalidArgument, msg("unexpected packet head flag: {:#04x}", b[0]));
        }
        Ok(PacketHeader {
            version: b[1],
            session_id: LittleEndian::read_i32(&b[4..8]),
            sequence: LittleEndian::read_u32(&b[8..12]),
            total_or_channel: b[12],
            current_or_end: b[13],
            code: LittleEndian::read_u16(&b[14..16]),
            data_length: LittleEndian::read_u32(&b[16..20]),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0] = HEAD_FLAG;
        b[1] = self.version;
        LittleEndian::write_i32(&mut b[4..8], self.session_id);
        LittleEndian::write_u32(&mut b[8..12], self.sequence);
        b[12] = self.total_or_channel;
        b[13] = self.current_or_end;
        LittleEndian::write_u16(&mut b[14..16], self.code);
        LittleEndian::write_u32(&mut b[16..20], self.data_length);
        b
    }
}

#[derive(Clone, Debug)]
pub struct Packet {
    pub header: PacketHeader,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn is_media(&self) -> bool {
        self.header.code == MONITOR_DATA
    }

    pub fn is_single(&self) -> bool {
        if self.is_media() {
            self.header.data_length < 16384 && self.header.data_length != 8192
        } else {
            self.header.total_or_channel < 2
        }
    }

    fn ordinal(&self) -> u8 {
        self.header.current_or_end
    }

    fn total(&self) -> u8 {
        self.header.total_or_channel
    }

    fn is_last(&self) -> bool {
        if self.is_single() {
            true
        } else if self.is_media() {
            self.header.current_or_end == 1
        } else {
            self.total() == self.header.current_or_end + 1
        }
    }
}

/// A reassembled message: the concatenation of its packets' payloads.
#[derive(Clone, Debug)]
pub struct Message {
    pub code: Code,
    pub data: Vec<u8>,
}

enum State {
    Idle,
    Media { code: Code, data: Vec<u8> },
    Control { code: Code, data: Vec<u8>, total: u8, next: u8 },
}

/// Incremental multi-packet reassembly.
#[derive(Default)]
pub struct Assembler {
    state: State,
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

impl Assembler {
    pub fn new() -> Self {
        Assembler { state: State::Idle }
    }

    /// Feeds one packet, returning a complete message when this packet ends
    /// one. A non-media packet arriving in the middle of a media message
    /// finishes that message; the stray packet is dropped.
    pub fn push(&mut self, p: Packet) -> Result<Option<Message>, Error> {
        match std::mem::take(&mut self.state) {
            State::Idle => {
                if p.is_single() {
                    return Ok(Some(Message {
                        code: p.header.code,
                        data: p.data,
                    }));
                }
                if p.is_media() {
                    self.state = State::Media {
                        code: p.header.code,
                        data: p.data,
                    };
                } else {
                    self.state = State::Control {
                        code: p.header.code,
                        total: p.total(),
                        next: 1,
                        data: p.data,
                    };
                }
                Ok(None)
            }
            State::Media { code, mut data } => {
                if !p.is_media() {
                    return Ok(Some(Message { code, data }));
                }
                let last = p.is_last();
                data.extend_from_slice(&p.data);
                if last {
                    return Ok(Some(Message { code, data }));
                }
                self.state = State::Media { code, data };
                Ok(None)
            }
            State::Control {
                code,
                mut data,
                total,
                next,
            } => {
                if p.ordinal() != next {
                    bail!(
                        InvalidArgument,
                        msg("wrong packet ordinal: expected {next}, got {}", p.ordinal())
                    );
                }
                data.extend_from_slice(&p.data);
                if next + 1 == total {
                    return Ok(Some(Message { code, data }));
                }
                self.state = State::Control {
                    code,
                    data,
                    total,
                    next: next + 1,
                };
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_packet(total: u8, ordinal: u8, data: &[u8]) -> Packet {
        Packet {
            header: PacketHeader {
                total_or_channel: total,
                current_or_end: ordinal,
                code: LOGIN_RSP,
                data_length: data.len() as u32,
                ..Default::default()
            },
            data: data.to_vec(),
        }
    }

    fn media_packet(data_length: u32, end: u8, data: &[u8]) -> Packet {
        Packet {
            header: PacketHeader {
                current_or_end: end,
                code: MONITOR_DATA,
                data_length,
                ..Default::default()
            },
            data: data.to_vec(),
        }
    }

    #[test]
    fn header_round_trip() {
        let h = PacketHeader {
            version: 1,
            session_id: -0x1234_5678,
            sequence: 0xDEAD_BEEF,
            total_or_channel: 3,
            current_or_end: 2,
            code: MONITOR_CLAIM,
            data_length: 0x0102_0304,
        };
        let b = h.encode();
        assert_eq!(b[0], 0xFF);
        assert_eq!(PacketHeader::parse(&b).unwrap(), h);
    }

    #[test]
    fn header_rejects_bad_flag() {
        let mut b = PacketHeader::default().encode();
        b[0] = 0xFE;
        assert!(PacketHeader::parse(&b).is_err());
    }

    #[test]
    fn classification() {
        assert!(control_packet(0, 0, &[]).is_single());
        assert!(control_packet(1, 0, &[]).is_single());
        assert!(!control_packet(2, 0, &[]).is_single());
        assert!(media_packet(100, 0, &[]).is_single());
        assert!(!media_packet(8192, 0, &[]).is_single());
        assert!(!media_packet(16384, 0, &[]).is_single());
        assert!(media_packet(16383, 0, &[]).is_single());
    }

    #[test]
    fn control_reassembly() {
        let mut a = Assembler::new();
        assert!(a.push(control_packet(3, 0, b"aa")).unwrap().is_none());
        assert!(a.push(control_packet(3, 1, b"bb")).unwrap().is_none());
        let m = a.push(control_packet(3, 2, b"cc")).unwrap().unwrap();
        assert_eq!(m.data, b"aabbcc");
        assert_eq!(m.code, LOGIN_RSP);
    }

    #[test]
    fn control_reassembly_bad_ordinal() {
        let mut a = Assembler::new();
        assert!(a.push(control_packet(3, 0, b"aa")).unwrap().is_none());
        assert!(a.push(control_packet(3, 2, b"cc")).is_err());
    }

    #[test]
    fn media_reassembly_by_end_flag() {
        let mut a = Assembler::new();
        assert!(a.push(media_packet(16384, 0, b"xx")).unwrap().is_none());
        assert!(a.push(media_packet(16384, 0, b"yy")).unwrap().is_none());
        let m = a.push(media_packet(16384, 1, b"zz")).unwrap().unwrap();
        assert_eq!(m.data, b"xxyyzz");
    }

    #[test]
    fn media_reassembly_short_tail() {
        // A trailing packet below the multi-packet threshold is also last.
        let mut a = Assembler::new();
        assert!(a.push(media_packet(8192, 0, b"xx")).unwrap().is_none());
        let m = a.push(media_packet(100, 0, b"yy")).unwrap().unwrap();
        assert_eq!(m.data, b"xxyy");
    }

    #[test]
    fn single_control_passthrough() {
        let mut a = Assembler::new();
        let m = a.push(control_packet(1, 0, b"hello")).unwrap().unwrap();
        assert_eq!(m.data, b"hello");
    }
}
