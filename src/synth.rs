/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Divider arithmetic for the PLL and the output multisynths.
//!
//! The chip synthesizes `Fvco = Fxtal * (a + b/c)` in the feedback multisynth and
//! `Fout = Fvco / ((a + b/c) * 2^r)` in every output multisynth. All math here is
//! integer-only and call-local.

use log::{debug, warn};

use crate::{Error, OutputDivider};

/// Largest value the 20-bit P2 and P3 fields hold.
pub const MAX_DENOMINATOR: u32 = 0xF_FFFF;

/// Largest value the 18-bit P1 field holds.
const MAX_P1: u32 = 0x3_FFFF;

/// Feedback multisynth integer range.
pub const PLL_MIN_MULT: u32 = 15;
pub const PLL_MAX_MULT: u32 = 90;

/// Output multisynth integer range. Dividers below 6 need the divide-by-4 mode,
/// which this driver never programs; 2048 is the datasheet's largest integer divider.
pub const MS_MIN_DIV: u32 = 6;
pub const MS_MAX_DIV: u32 = 2048;

/// Auto R-divider selection keeps halving while the remaining ratio is at least this.
pub const R_DIV_HALVING_THRESHOLD: u32 = 16;

const MAX_R_DIV_EXPONENT: u8 = 7;

/// VCO ceiling indexed by the REVID field of the device status register.
const MAX_VCO_BY_REVISION: [u32; 4] = [720_000_000, 900_000_000, 900_000_000, 900_000_000];

/// Highest VCO frequency the part with the given revision is driven at.
pub fn max_vco_frequency(revision: u8) -> u32 {
    MAX_VCO_BY_REVISION[(revision & 0b11) as usize]
}

/// Greatest common divisor.
pub fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Least common multiple, `None` if it does not fit in `u32`.
pub fn lcm(a: u32, b: u32) -> Option<u32> {
    if a == 0 || b == 0 {
        return Some(0);
    }
    (a / gcd(a, b)).checked_mul(b)
}

/// `a + b/c` with `0 <= b < c <= MAX_DENOMINATOR`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Fraction {
    a: u32,
    b: u32,
    c: u32,
}

impl Fraction {
    pub fn new(a: u32, b: u32, c: u32) -> Result<Self, Error> {
        if c == 0 || c > MAX_DENOMINATOR || b >= c {
            return Err(Error::InvalidParameter);
        }
        Ok(Fraction { a, b, c })
    }

    pub fn integer(a: u32) -> Self {
        Fraction { a, b: 0, c: 1 }
    }

    /// Approximates `numerator / base`.
    ///
    /// The remainder is reduced by the gcd first; if the denominator still does not
    /// fit in 20 bits, numerator and denominator are halved together until it does.
    /// That last step loses precision: the result is within `1/c` of the exact ratio.
    pub fn approximate(numerator: u32, base: u32) -> Result<Self, Error> {
        if base == 0 {
            return Err(Error::InvalidParameter);
        }

        let mut a = numerator / base;
        let rem = numerator % base;
        let g = gcd(base, rem);
        let mut b = rem / g;
        let mut c = base / g;

        while c > MAX_DENOMINATOR {
            b >>= 1;
            c >>= 1;
        }

        // halving an odd denominator can round b up to c
        if b >= c {
            a += 1;
            b -= c;
        }

        Ok(Fraction { a, b, c })
    }

    pub fn a(&self) -> u32 {
        self.a
    }

    pub fn b(&self) -> u32 {
        self.b
    }

    pub fn c(&self) -> u32 {
        self.c
    }

    pub fn is_integer(&self) -> bool {
        self.b == 0
    }

    /// Register encoding `(P1, P2, P3)`:
    ///
    /// ```text
    /// P1 = 128 * a + floor(128 * b / c) - 512
    /// P2 = 128 * b - c * floor(128 * b / c)
    /// P3 = c
    /// ```
    ///
    /// `None` if P1 does not fit its 18-bit field, which includes every `a < 4`.
    pub fn params(&self) -> Option<(u32, u32, u32)> {
        let ratio = 128 * self.b / self.c;
        let p1 = self
            .a
            .checked_mul(128)?
            .checked_add(ratio)?
            .checked_sub(512)?;
        if p1 > MAX_P1 {
            return None;
        }
        let p2 = 128 * self.b - self.c * ratio;
        Some((p1, p2, self.c))
    }
}

/// Feedback multisynth setting, `Fvco / Fxtal`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PllParams {
    ratio: Fraction,
}

impl PllParams {
    pub fn new(vco_freq: u32, xtal_freq: u32) -> Result<Self, Error> {
        let ratio = Fraction::approximate(vco_freq, xtal_freq)?;
        if ratio.a < PLL_MIN_MULT || ratio.a > PLL_MAX_MULT {
            return Err(Error::DividerOutOfRange);
        }
        Ok(PllParams { ratio })
    }

    pub fn ratio(&self) -> Fraction {
        self.ratio
    }

    /// VCO frequency the programmed ratio actually produces.
    pub fn vco_frequency(&self, xtal_freq: u32) -> u32 {
        let xtal = xtal_freq as u64;
        let f = self.ratio;
        (xtal * f.a as u64 + xtal * f.b as u64 / f.c as u64) as u32
    }
}

/// Output multisynth setting, `Fvco / (Fout * 2^r)`, plus its R divider.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MultisynthParams {
    ratio: Fraction,
    r_div: OutputDivider,
}

impl MultisynthParams {
    pub fn new(vco_freq: u32, freq: u32, forced_r_div: Option<u8>) -> Result<Self, Error> {
        if freq == 0 {
            return Err(Error::InvalidParameter);
        }

        let r_div = OutputDivider::select(vco_freq, freq, forced_r_div);
        let ms_freq = freq
            .checked_mul(r_div.denominator())
            .ok_or(Error::DividerOutOfRange)?;
        let ratio = Fraction::approximate(vco_freq, ms_freq)?;
        if ratio.a < MS_MIN_DIV || ratio.a > MS_MAX_DIV {
            return Err(Error::DividerOutOfRange);
        }

        Ok(MultisynthParams { ratio, r_div })
    }

    pub fn ratio(&self) -> Fraction {
        self.ratio
    }

    pub fn r_div(&self) -> OutputDivider {
        self.r_div
    }

    pub fn is_integer(&self) -> bool {
        self.ratio.is_integer()
    }

    /// Output frequency produced from `vco_freq`.
    pub fn output_frequency(&self, vco_freq: u32) -> u32 {
        let f = self.ratio;
        let divisor = (f.a as u64 * f.c as u64 + f.b as u64) << self.r_div.exponent();
        (vco_freq as u64 * f.c as u64 / divisor) as u32
    }
}

impl OutputDivider {
    /// Picks the R divider for an output of `freq` from `vco_freq`.
    ///
    /// A forced divider is honoured if it is a power of two. Otherwise the ratio is
    /// halved while it stays even and at least [`R_DIV_HALVING_THRESHOLD`], which
    /// keeps the multisynth divider at 8 or above.
    pub fn select(vco_freq: u32, freq: u32, forced: Option<u8>) -> OutputDivider {
        if let Some(div) = forced {
            if div.is_power_of_two() {
                let mut exponent = 0;
                let mut rest = div;
                while rest > 1 {
                    rest >>= 1;
                    exponent += 1;
                }
                return OutputDivider::from_exponent(exponent);
            }
            warn!("ignoring R divider {}: not a power of two", div);
        }

        let mut ratio = vco_freq.checked_div(freq).unwrap_or(0);
        let mut exponent = 0;
        while ratio % 2 == 0 && ratio >= R_DIV_HALVING_THRESHOLD && exponent < MAX_R_DIV_EXPONENT {
            exponent += 1;
            ratio >>= 1;
        }
        OutputDivider::from_exponent(exponent)
    }
}

/// Requested output frequency as a multiple of the sampling frequency.
///
/// Zero disables the channel, a negative value inverts the output.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ScaleFactor(pub i32);

impl ScaleFactor {
    pub const DISABLED: ScaleFactor = ScaleFactor(0);

    pub fn is_enabled(&self) -> bool {
        self.0 != 0
    }

    pub fn is_inverted(&self) -> bool {
        self.0 < 0
    }

    pub fn magnitude(&self) -> u32 {
        self.0.unsigned_abs()
    }
}

impl From<i32> for ScaleFactor {
    fn from(fs: i32) -> Self {
        ScaleFactor(fs)
    }
}

/// R divider that would let two channels share one multisynth, if any.
///
/// Only reported: the driver never programs a shared multisynth or integer mode.
pub fn shared_output_divider(fs_a: u32, fs_b: u32) -> Option<OutputDivider> {
    if fs_a == 0 || fs_b == 0 {
        return None;
    }
    match lcm(fs_a, fs_b) {
        Some(l) if l.is_power_of_two() && l <= 128 => {
            Some(OutputDivider::from_exponent(l.trailing_zeros() as u8))
        }
        _ => None,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelPlan {
    pub multisynth: MultisynthParams,
    pub inverted: bool,
}

/// Everything needed to program one common VCO and up to three outputs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrequencyPlan {
    pub vco_freq: u32,
    pub pll: PllParams,
    pub channels: [Option<ChannelPlan>; 3],
    /// Sharing candidates for the channel pairs (0, 1) and (0, 2).
    pub shareable: [Option<OutputDivider>; 2],
}

impl FrequencyPlan {
    /// Chooses the largest VCO frequency not above `max_vco` that is a multiple of
    /// every requested output, then derives the PLL and per-channel dividers.
    pub fn new(
        xtal_freq: u32,
        max_vco: u32,
        sampling_freq: u32,
        scale: [ScaleFactor; 3],
        forced_r_div: [Option<u8>; 3],
    ) -> Result<Self, Error> {
        if sampling_freq == 0 || xtal_freq == 0 {
            return Err(Error::InvalidParameter);
        }

        let lcm_all = scale
            .iter()
            .try_fold(1u32, |acc, fs| lcm(acc, fs.magnitude().max(1)))
            .ok_or(Error::DividerOutOfRange)?;
        let step = sampling_freq
            .checked_mul(lcm_all)
            .ok_or(Error::DividerOutOfRange)?;
        let min_div = max_vco / step;
        if min_div == 0 {
            return Err(Error::DividerOutOfRange);
        }
        let vco_freq = step * min_div;
        let pll = PllParams::new(vco_freq, xtal_freq)?;
        debug!(
            "vco {} Hz (lcm {}, x{}), pll {:?}",
            vco_freq,
            lcm_all,
            min_div,
            pll.ratio()
        );

        let mut channels = [None; 3];
        for (ix, (fs, forced)) in scale.iter().zip(forced_r_div.iter()).enumerate() {
            if !fs.is_enabled() {
                continue;
            }
            // |fs| divides lcm_all, so this stays below step
            let freq = sampling_freq * fs.magnitude();
            let multisynth = MultisynthParams::new(vco_freq, freq, *forced)?;
            debug!(
                "clk{}: {} Hz, ms {:?}, r {:?}",
                ix,
                freq,
                multisynth.ratio(),
                multisynth.r_div()
            );
            channels[ix] = Some(ChannelPlan {
                multisynth,
                inverted: fs.is_inverted(),
            });
        }

        let shareable = [
            shared_output_divider(scale[0].magnitude(), scale[1].magnitude()),
            shared_output_divider(scale[0].magnitude(), scale[2].magnitude()),
        ];
        if shareable.iter().any(Option::is_some) {
            debug!("multisynth sharing possible {:?}, not used", shareable);
        }

        Ok(FrequencyPlan {
            vco_freq,
            pll,
            channels,
            shareable,
        })
    }

    pub fn enabled_channels(&self) -> usize {
        self.channels.iter().filter(|ch| ch.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const XTAL: u32 = 25_000_000;

    fn fs(scale: [i32; 3]) -> [ScaleFactor; 3] {
        [scale[0].into(), scale[1].into(), scale[2].into()]
    }

    fn unpack(p1: u32, p2: u32, p3: u32) -> (u32, u32, u32) {
        let a = (p1 + 512) / 128;
        let ratio = (p1 + 512) % 128;
        let b = (p2 + p3 * ratio) / 128;
        (a, b, p3)
    }

    #[test]
    fn revision_selects_vco_ceiling() {
        assert_eq!(max_vco_frequency(0), 720_000_000);
        assert_eq!(max_vco_frequency(1), 900_000_000);
        assert_eq!(max_vco_frequency(2), 900_000_000);
        assert_eq!(max_vco_frequency(3), 900_000_000);
        assert_eq!(max_vco_frequency(0b1111_1100), 720_000_000);
    }

    #[test]
    fn gcd_lcm_basics() {
        assert_eq!(gcd(48, 18), 6);
        assert_eq!(gcd(7, 0), 7);
        assert_eq!(lcm(256, 384), Some(768));
        assert_eq!(lcm(0, 5), Some(0));
        assert_eq!(lcm(0xFFFF_FFFF, 0xFFFF_FFFE), None);
    }

    #[test]
    fn approximate_reduces_by_gcd() {
        let f = Fraction::approximate(897_024_000, XTAL).unwrap();
        assert_eq!((f.a(), f.b(), f.c()), (35, 2753, 3125));
        assert_eq!(f.params(), Some((4080, 2384, 3125)));
    }

    #[test]
    fn approximate_exact_integer() {
        let f = Fraction::approximate(897_024_000, 12_288_000).unwrap();
        assert_eq!(f, Fraction::integer(73));
        assert_eq!(f.params(), Some((8832, 0, 1)));
    }

    #[test]
    fn approximate_shrinks_large_denominator() {
        // 0x100001 is odd and coprime to the remainder
        let f = Fraction::approximate(3 * 0x10_0001 + 0x10_0000, 0x10_0001).unwrap();
        assert!(f.c() <= MAX_DENOMINATOR);
        assert!(f.b() < f.c());
        assert_eq!(f.a(), 4);
        assert_eq!(f.b(), 0);
    }

    #[test]
    fn approximate_rejects_zero_base() {
        assert_eq!(Fraction::approximate(1, 0), Err(Error::InvalidParameter));
    }

    #[test]
    fn small_integer_part_has_no_encoding() {
        assert_eq!(Fraction::integer(3).params(), None);
        assert_eq!(Fraction::integer(4).params(), Some((0, 0, 1)));
    }

    #[test]
    fn fraction_new_checks_invariant() {
        assert!(Fraction::new(10, 0, 0).is_err());
        assert!(Fraction::new(10, 5, 5).is_err());
        assert!(Fraction::new(10, 1, MAX_DENOMINATOR + 1).is_err());
        assert!(Fraction::new(10, 1, MAX_DENOMINATOR).is_ok());
    }

    #[test]
    fn pll_range_is_enforced() {
        assert_eq!(PllParams::new(100_000_000, XTAL), Err(Error::DividerOutOfRange));
        assert_eq!(PllParams::new(2_300_000_000, XTAL), Err(Error::DividerOutOfRange));
        let pll = PllParams::new(897_024_000, XTAL).unwrap();
        assert_eq!(pll.vco_frequency(XTAL), 897_024_000);
    }

    #[test]
    fn r_divider_auto() {
        assert_eq!(OutputDivider::select(897_024_000, 12_288_000, None), OutputDivider::Div1);
        assert_eq!(OutputDivider::select(712_704_000, 12_288_000, None), OutputDivider::Div2);
        // ratio 16 halves once more, 8 stops
        assert_eq!(OutputDivider::select(16, 1, None), OutputDivider::Div2);
        assert_eq!(OutputDivider::select(1 << 20, 1, None), OutputDivider::Div128);
        assert_eq!(OutputDivider::select(100, 0, None), OutputDivider::Div1);
    }

    #[test]
    fn r_divider_forced() {
        assert_eq!(OutputDivider::select(897_024_000, 12_288_000, Some(32)), OutputDivider::Div32);
        assert_eq!(OutputDivider::select(897_024_000, 12_288_000, Some(1)), OutputDivider::Div1);
        // not a power of two: falls back to auto
        assert_eq!(OutputDivider::select(712_704_000, 12_288_000, Some(3)), OutputDivider::Div2);
        assert_eq!(OutputDivider::select(712_704_000, 12_288_000, Some(0)), OutputDivider::Div2);
    }

    #[test]
    fn multisynth_applies_r_divider() {
        let ms = MultisynthParams::new(712_704_000, 12_288_000, None).unwrap();
        assert_eq!(ms.r_div(), OutputDivider::Div2);
        assert_eq!(ms.ratio(), Fraction::integer(29));
        assert!(ms.is_integer());
        assert_eq!(ms.output_frequency(712_704_000), 12_288_000);
    }

    #[test]
    fn multisynth_range_is_enforced() {
        // 900 MHz / 48 kHz leaves 9375 after one halving
        assert_eq!(
            MultisynthParams::new(900_000_000, 48_000, None),
            Err(Error::DividerOutOfRange)
        );
        assert_eq!(
            MultisynthParams::new(900_000_000, 300_000_000, None),
            Err(Error::DividerOutOfRange)
        );
        assert_eq!(MultisynthParams::new(900_000_000, 0, None), Err(Error::InvalidParameter));
    }

    #[test]
    fn multisynth_accepts_dividers_up_to_2048() {
        // 900 MHz / 480 kHz is odd, so no R divider
        let ms = MultisynthParams::new(900_000_000, 480_000, None).unwrap();
        assert_eq!(ms.r_div(), OutputDivider::Div1);
        assert_eq!(ms.ratio(), Fraction::integer(1875));
        assert_eq!(ms.ratio().params(), Some((239_488, 0, 1)));

        let ms = MultisynthParams::new(204_800_000, 100_000, Some(1)).unwrap();
        assert_eq!(ms.ratio(), Fraction::integer(MS_MAX_DIV));
        assert!(ms.ratio().params().is_some());
        assert_eq!(
            MultisynthParams::new(204_900_000, 100_000, Some(1)),
            Err(Error::DividerOutOfRange)
        );
    }

    #[test]
    fn plan_single_channel() {
        let plan =
            FrequencyPlan::new(XTAL, 900_000_000, 48_000, fs([256, 0, 0]), [None; 3]).unwrap();
        assert_eq!(plan.vco_freq, 897_024_000);
        assert_eq!(plan.vco_freq % (48_000 * 256), 0);
        assert!(plan.vco_freq + 48_000 * 256 > 900_000_000);
        assert_eq!(plan.enabled_channels(), 1);
        let ch0 = plan.channels[0].unwrap();
        assert_eq!(ch0.multisynth.ratio(), Fraction::integer(73));
        assert!(!ch0.inverted);
        assert!(plan.channels[1].is_none());
        assert!(plan.channels[2].is_none());
    }

    #[test]
    fn plan_lower_revision_ceiling() {
        let plan =
            FrequencyPlan::new(XTAL, 720_000_000, 48_000, fs([256, 0, 0]), [None; 3]).unwrap();
        assert_eq!(plan.vco_freq, 712_704_000);
        let ch0 = plan.channels[0].unwrap();
        assert_eq!(ch0.multisynth.r_div(), OutputDivider::Div2);
    }

    #[test]
    fn plan_common_vco_for_three_outputs() {
        let plan =
            FrequencyPlan::new(XTAL, 900_000_000, 48_000, fs([256, -128, 384]), [None; 3]).unwrap();
        assert_eq!(plan.vco_freq, 48_000 * 768 * 24);
        for (ix, m) in [256u32, 128, 384].iter().enumerate() {
            let ch = plan.channels[ix].unwrap();
            assert_eq!(ch.multisynth.output_frequency(plan.vco_freq), 48_000 * m);
        }
        assert!(plan.channels[1].unwrap().inverted);
        assert!(!plan.channels[2].unwrap().inverted);
    }

    #[test]
    fn plan_rejects_unreachable_requests() {
        assert_eq!(
            FrequencyPlan::new(XTAL, 900_000_000, 0, fs([256, 0, 0]), [None; 3]),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            FrequencyPlan::new(0, 900_000_000, 48_000, fs([256, 0, 0]), [None; 3]),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            FrequencyPlan::new(XTAL, 900_000_000, 48_000, fs([20_000, 0, 0]), [None; 3]),
            Err(Error::DividerOutOfRange)
        );
        assert_eq!(
            FrequencyPlan::new(XTAL, 900_000_000, 48_000, fs([1, 0, 0]), [None; 3]),
            Err(Error::DividerOutOfRange)
        );
    }

    #[test]
    fn sharing_is_reported_only_for_power_of_two_lcm() {
        assert_eq!(shared_output_divider(2, 4), Some(OutputDivider::Div4));
        assert_eq!(shared_output_divider(1, 1), Some(OutputDivider::Div1));
        assert_eq!(shared_output_divider(256, 128), None);
        assert_eq!(shared_output_divider(3, 4), None);
        assert_eq!(shared_output_divider(0, 4), None);

        let plan =
            FrequencyPlan::new(XTAL, 900_000_000, 48_000, fs([64, 32, 0]), [None; 3]).unwrap();
        assert_eq!(plan.shareable, [Some(OutputDivider::Div64), None]);
    }

    proptest! {
        #[test]
        fn gcd_is_symmetric(a in 1u32.., b in 1u32..) {
            prop_assert_eq!(gcd(a, b), gcd(b, a));
            prop_assert_eq!(gcd(a, 0), a);
        }

        #[test]
        fn lcm_times_gcd_is_product(a in 1u32..=0xFFFF, b in 1u32..=0xFFFF) {
            let l = lcm(a, b).unwrap() as u64;
            prop_assert_eq!(l * gcd(a, b) as u64, a as u64 * b as u64);
        }

        #[test]
        fn approximation_is_bounded(numerator in any::<u32>(), base in 1u32..) {
            let f = Fraction::approximate(numerator, base).unwrap();
            prop_assert!(f.b() < f.c());
            prop_assert!(f.c() <= MAX_DENOMINATOR);
            // |numerator/base - (a + b/c)| < 1/c
            let lhs = numerator as i128 * f.c() as i128;
            let rhs = base as i128 * (f.a() as i128 * f.c() as i128 + f.b() as i128);
            prop_assert!((lhs - rhs).abs() < base as i128);
        }

        #[test]
        fn r_exponent_in_range(vco: u32, freq: u32, forced: Option<u8>) {
            prop_assert!(OutputDivider::select(vco, freq, forced).exponent() <= 7);
        }

        #[test]
        fn params_unpack_to_fraction(
            a in 4u32..2000,
            base in 1u32..2_000_000,
            seed in any::<u32>()
        ) {
            let numerator = a * base + seed % base;
            let f = Fraction::approximate(numerator, base).unwrap();
            let (p1, p2, p3) = f.params().unwrap();
            prop_assert_eq!(unpack(p1, p2, p3), (f.a(), f.b(), f.c()));
        }
    }
}
