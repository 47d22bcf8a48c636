/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Packing of a [`FrequencyPlan`] into the chip's register layout.

use crate::synth::{ChannelPlan, Fraction, FrequencyPlan};
use crate::{ClockControlBits, ClockOutput, Error, OutputDivider};

/// Length of one multisynth parameter block.
pub const BLOCK_LEN: usize = 8;

/// Packs `(P1, P2, P3)` of `ratio` and the R divider into one parameter block.
///
/// Feedback and output multisynths share the layout; the feedback block always
/// carries `OutputDivider::Div1`. MSx_DIVBY4 (bits 3:2 of byte 2) stays zero.
pub fn pack_divider(ratio: &Fraction, r_div: OutputDivider) -> Result<[u8; BLOCK_LEN], Error> {
    let (p1, p2, p3) = ratio.params().ok_or(Error::DividerOutOfRange)?;

    Ok([
        ((p3 & 0x0000_FF00) >> 8) as u8,
        p3 as u8,
        ((r_div.exponent() << 4) & 0x70) | ((p1 & 0x0003_0000) >> 16) as u8,
        ((p1 & 0x0000_FF00) >> 8) as u8,
        p1 as u8,
        (((p3 & 0x000F_0000) >> 12) | ((p2 & 0x000F_0000) >> 16)) as u8,
        ((p2 & 0x0000_FF00) >> 8) as u8,
        p2 as u8,
    ])
}

/// CLKx_CONTROL for a channel; `None` powers it down.
pub fn clock_control(channel: Option<&ChannelPlan>) -> u8 {
    let base = ClockControlBits::CLK_SRC_MS | ClockControlBits::CLK_DRV_8;

    match channel {
        None => (ClockControlBits::CLK_PDN | base).bits(),
        Some(ch) if ch.inverted => (ClockControlBits::CLK_INV | base).bits(),
        Some(_) => base.bits(),
    }
}

/// Register contents for one programming pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterImage {
    pub pll: [u8; BLOCK_LEN],
    pub multisynth: [Option<[u8; BLOCK_LEN]>; 3],
    pub clock_control: [u8; 3],
    /// Output enable control, active low.
    pub output_enable: u8,
}

impl RegisterImage {
    pub fn build(plan: &FrequencyPlan) -> Result<Self, Error> {
        let pll = pack_divider(&plan.pll.ratio(), OutputDivider::Div1)?;

        let mut multisynth = [None; 3];
        let mut clock_ctl = [0u8; 3];
        let mut enabled = 0u8;
        for (&clk, channel) in ClockOutput::ALL.iter().zip(plan.channels.iter()) {
            let ix = clk.ix() as usize;
            if let Some(ch) = channel {
                multisynth[ix] = Some(pack_divider(&ch.multisynth.ratio(), ch.multisynth.r_div())?);
                enabled |= 1 << clk.ix();
            }
            clock_ctl[ix] = clock_control(channel.as_ref());
        }

        Ok(RegisterImage {
            pll,
            multisynth,
            clock_control: clock_ctl,
            output_enable: !enabled,
        })
    }
}
