// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Per-frame duration regeneration.
//!
//! DVRIP devices do not timestamp individual frames; they only declare a
//! frame rate on each key frame. This module turns that rate into a sequence
//! of millisecond durations which sums to exactly 1000 over any whole second:
//! `1000/fps` is split into `lo = ⌊1000/fps⌋` and `hi = lo + 1`, emitted in a
//! cycle of `num` highs followed by `den - num` lows where `num/den` is the
//! Stern–Brocot approximation of the fractional part.

use base::{bail, Error};

/// Regenerates frame durations for a declared frame rate.
#[derive(Debug)]
pub struct Pts {
    fps: u8,
    lo: u32,
    hi: u32,
    num: u32,
    den: u32,
    /// 1-based position in the emission cycle; unused when `den == 0`.
    index: u32,
}

impl Pts {
    pub fn new(fps: u8) -> Result<Self, Error> {
        if fps == 0 {
            bail!(InvalidArgument, msg("frame rate of zero"));
        }
        let fps32 = u32::from(fps);
        let lo = 1000 / fps32;
        let rem = 1000 % fps32;
        if rem == 0 {
            return Ok(Pts {
                fps,
                lo,
                hi: 0,
                num: 0,
                den: 0,
                index: 0,
            });
        }
        let (num, den) = approximate(rem, fps32);
        Ok(Pts {
            fps,
            lo,
            hi: lo + 1,
            num,
            den,
            index: 1,
        })
    }

    pub fn fps(&self) -> u8 {
        self.fps
    }

    /// The next frame duration in milliseconds.
    pub fn next(&mut self) -> u32 {
        if self.den == 0 {
            return self.lo;
        }
        let v = if self.index <= self.num { self.hi } else { self.lo };
        if self.index == self.den {
            self.index = 1;
        } else {
            self.index += 1;
        }
        v
    }
}

/// Best rational approximation of `num/den` (in (0, 1)) with numerator and
/// denominator both ≤ 255, found by walking the Stern–Brocot tree. For
/// `den ≤ 255` the walk reaches the value exactly.
fn approximate(num: u32, den: u32) -> (u32, u32) {
    debug_assert!(0 < num && num < den);
    let (mut ln, mut ld) = (0u32, 1u32);
    let (mut hn, mut hd) = (1u32, 1u32);
    loop {
        let (mn, md) = (ln + hn, ld + hd);
        if mn > 255 || md > 255 {
            // Out of room; return the closer bound. Compare
            // |num/den - ln/ld| vs |hn/hd - num/den| by cross-multiplying.
            let low_err = num * ld - ln * den; // scaled by ld*den
            let high_err = hn * den - num * hd; // scaled by hd*den
            return if low_err * hd <= high_err * ld {
                (ln, ld)
            } else {
                (hn, hd)
            };
        }
        match (mn * den).cmp(&(num * md)) {
            std::cmp::Ordering::Equal => return (mn, md),
            std::cmp::Ordering::Less => (ln, ld) = (mn, md),
            std::cmp::Ordering::Greater => (hn, hd) = (mn, md),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_rate_is_constant() {
        let mut pts = Pts::new(25).unwrap();
        for _ in 0..100 {
            assert_eq!(pts.next(), 40);
        }
    }

    #[test]
    fn thirty_fps_cycle() {
        // 1000/30 = 33⅓: one 34 then two 33s per cycle of three.
        let mut pts = Pts::new(30).unwrap();
        let cycle: Vec<u32> = (0..6).map(|_| pts.next()).collect();
        assert_eq!(cycle, vec![34, 33, 33, 34, 33, 33]);
        let mut pts = Pts::new(30).unwrap();
        assert_eq!((0..30).map(|_| pts.next()).sum::<u32>(), 1000);
    }

    #[test]
    fn one_second_sums_to_1000_for_all_rates() {
        for fps in 1..=120u8 {
            let mut pts = Pts::new(fps).unwrap();
            let sum: u32 = (0..u32::from(fps)).map(|_| pts.next()).sum();
            assert_eq!(sum, 1000, "fps {fps}");
            // And again for a second whole second.
            let sum: u32 = (0..u32::from(fps)).map(|_| pts.next()).sum();
            assert_eq!(sum, 1000, "fps {fps}, second second");
        }
    }

    #[test]
    fn zero_rate_rejected() {
        assert!(Pts::new(0).is_err());
    }

    #[test]
    fn approximation_is_exact_for_small_denominators() {
        assert_eq!(approximate(1, 3), (1, 3));
        assert_eq!(approximate(2, 6), (1, 3));
        assert_eq!(approximate(6, 7), (6, 7));
        assert_eq!(approximate(857, 1000), (6, 7)); // 0.857 ≈ 6/7
    }
}
