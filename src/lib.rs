/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
/*!
A platform agnostic Rust driver that programs the [Si5351A] as an audio clock
source, based on the [`embedded-hal`] traits.

## The Device

The Silicon Labs [Si5351A] is an any-frequency CMOS clock generator with one
crystal input and three outputs on the 10-MSOP package.

The device has an I²C interface.

## Operation

All three outputs run from PLLA. Each output is requested as a multiple of a
sampling frequency (256·fs for an MCLK, 64·fs for a BCLK and so on). The driver
picks the highest VCO frequency that is an exact multiple of every requested
output, so each output multisynth divides by an integer ratio.

## Usage

Initialize the I²C bus (differs between `embedded_hal` implementations), then
instantiate the device and program the outputs:

```ignore
use si5351_audio::{AudioClock, Config, ScaleFactor, Si5351Audio};

let mut clock = Si5351Audio::new(i2c, Config::default());

// 12.288 MHz MCLK on CLK0, inverted 3.072 MHz BCLK on CLK1
let plan = clock.begin(48_000, [ScaleFactor(256), ScaleFactor(-64), ScaleFactor::DISABLED])?;

// ...

clock.end()?;
let i2c = clock.release();
```

[Si5351A]: https://www.silabs.com/documents/public/data-sheets/Si5351-B.pdf
[`embedded-hal`]: https://github.com/rust-embedded/embedded-hal
*/
#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate bitflags;
use embedded_hal as hal;

use crate::hal::blocking::i2c::{Write, WriteRead};
use core::fmt;
use log::{debug, trace};

pub mod image;
pub mod synth;

pub use crate::image::RegisterImage;
pub use crate::synth::{
    ChannelPlan, Fraction, FrequencyPlan, MultisynthParams, PllParams, ScaleFactor,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The bus reported a failed transaction.
    CommunicationError,
    InvalidParameter,
    /// A divider the request needs is outside what the chip can be programmed with.
    DividerOutOfRange,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::CommunicationError => write!(f, "Communication Error"),
            Error::InvalidParameter => write!(f, "Invalid Parameter"),
            Error::DividerOutOfRange => write!(f, "Divider Out Of Range"),
        }
    }
}

/// Crystal load capacitance at or below which the 6 pF preset is used.
pub const CRYSTAL_LOAD_LOW_PF: u8 = 6;
/// Crystal load capacitance at or above which the 10 pF preset is used.
pub const CRYSTAL_LOAD_HIGH_PF: u8 = 10;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrystalLoad {
    _6,
    _8,
    _10,
}

impl CrystalLoad {
    /// Nearest preset for a crystal specified with `pf` picofarads of load.
    pub fn from_picofarads(pf: u8) -> Self {
        if pf <= CRYSTAL_LOAD_LOW_PF {
            CrystalLoad::_6
        } else if pf >= CRYSTAL_LOAD_HIGH_PF {
            CrystalLoad::_10
        } else {
            CrystalLoad::_8
        }
    }

    fn bits(self) -> u8 {
        (CrystalLoadBits::RESERVED
            | match self {
                CrystalLoad::_6 => CrystalLoadBits::CL_6,
                CrystalLoad::_8 => CrystalLoadBits::CL_8,
                CrystalLoad::_10 => CrystalLoadBits::CL_10,
            })
        .bits()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockOutput {
    Clk0 = 0,
    Clk1,
    Clk2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutputDivider {
    Div1 = 0,
    Div2,
    Div4,
    Div8,
    Div16,
    Div32,
    Div64,
    Div128,
}

const ADDRESS: u8 = 0b0110_0000;

/// Bytes in the clock control bank, CLK0..CLK7.
const CLOCK_CONTROL_COUNT: usize = 8;
/// Longest block written in one transaction.
const MAX_WRITE_LEN: usize = 8;

#[derive(Debug, Copy, Clone)]
enum Register {
    DeviceStatus = 0,
    InterruptMask = 2,
    OutputEnable = 3,
    PllInputConfig = 7,
    PllInputSource = 15,
    Clk0 = 16,
    Msna = 26,
    Ms0 = 42,
    Ms1 = 50,
    Ms2 = 58,
    Ms67P1 = 90,
    SpreadSpectrum = 149,
    Vcxo = 162,
    PLLReset = 177,
    CrystalLoad = 183,
}

impl Register {
    pub fn addr(&self) -> u8 {
        *self as u8
    }
}

bitflags! {
    pub struct DeviceStatusBits: u8 {
        const SYS_INIT = 0b1000_0000;
        const LOL_B = 0b0100_0000;
        const LOL_A = 0b0010_0000;
        const LOS = 0b0001_0000;
        const REVID = 0b0000_0011;
    }
}

impl DeviceStatusBits {
    /// The 2-bit revision id.
    pub fn revision(&self) -> u8 {
        (*self & DeviceStatusBits::REVID).bits()
    }
}

bitflags! {
    struct InterruptMaskBits: u8 {
        const LOL_B_MASK = 0b0100_0000;
        const LOS_MASK = 0b0001_0000;
        const RESERVED = 0b0000_0011;
    }
}

/// PLLB loss of lock and loss of signal stay masked.
const INTERRUPT_MASK: InterruptMaskBits = InterruptMaskBits::from_bits_truncate(
    InterruptMaskBits::LOL_B_MASK.bits()
        | InterruptMaskBits::LOS_MASK.bits()
        | InterruptMaskBits::RESERVED.bits(),
);

bitflags! {
    struct CrystalLoadBits: u8 {
        const RESERVED = 0b00_010010;
        const CL_6 = 0b01_000000;
        const CL_8 = 0b10_000000;
        const CL_10 = 0b11_000000;
    }
}

bitflags! {
    struct ClockControlBits: u8 {
        const CLK_PDN = 0b1000_0000;
        /// Never set: every output runs its multisynth in fractional mode.
        const MS_INT = 0b0100_0000;
        const CLK_INV = 0b0001_0000;
        const CLK_SRC_MS = 0b0000_1100;
        const CLK_DRV_8 = 0b0000_0011;
    }
}

bitflags! {
    struct PLLResetBits: u8 {
        const PLLB_RST = 0b1000_0000;
        const PLLA_RST = 0b0010_0000;
        const RESERVED = 0b0000_1100;
    }
}

/// Both PLLs take the crystal, CLKIN undivided.
const PLL_INPUT_XTAL: u8 = 0x00;

impl ClockOutput {
    pub const ALL: [ClockOutput; 3] = [ClockOutput::Clk0, ClockOutput::Clk1, ClockOutput::Clk2];

    fn multisynth_register(self) -> Register {
        match self {
            ClockOutput::Clk0 => Register::Ms0,
            ClockOutput::Clk1 => Register::Ms1,
            ClockOutput::Clk2 => Register::Ms2,
        }
    }

    fn ix(&self) -> u8 {
        *self as u8
    }
}

impl OutputDivider {
    /// log2 of the division ratio, as written to Rx_DIV.
    pub fn exponent(&self) -> u8 {
        *self as u8
    }

    pub fn from_exponent(exponent: u8) -> OutputDivider {
        match exponent & 0b111 {
            0 => OutputDivider::Div1,
            1 => OutputDivider::Div2,
            2 => OutputDivider::Div4,
            3 => OutputDivider::Div8,
            4 => OutputDivider::Div16,
            5 => OutputDivider::Div32,
            6 => OutputDivider::Div64,
            _ => OutputDivider::Div128,
        }
    }

    pub fn denominator(&self) -> u32 {
        1 << self.exponent()
    }
}

fn i2c_error<E>(_: E) -> Error {
    Error::CommunicationError
}

/// Session configuration, fixed at construction.
#[derive(Debug, Copy, Clone)]
pub struct Config {
    pub xtal_freq: u32,
    pub crystal_load: CrystalLoad,
    /// State of the A0 address pin on parts that have one.
    pub address_bit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            xtal_freq: 25_000_000,
            crystal_load: CrystalLoad::_8,
            address_bit: false,
        }
    }
}

/// Si5351A audio clock driver
pub struct Si5351Audio<I2C> {
    i2c: I2C,
    address: u8,
    config: Config,
}

pub trait AudioClock {
    /// Programs all three outputs from `sampling_freq` and per-channel scale factors.
    fn begin(
        &mut self,
        sampling_freq: u32,
        scale: [ScaleFactor; 3],
    ) -> Result<FrequencyPlan, Error>;
    /// Like [`begin`](AudioClock::begin), with optional per-channel R dividers (1..=128,
    /// powers of two) overriding the automatic choice.
    fn begin_with_output_dividers(
        &mut self,
        sampling_freq: u32,
        scale: [ScaleFactor; 3],
        r_div: [Option<u8>; 3],
    ) -> Result<FrequencyPlan, Error>;
    /// Disables every output and powers down every clock control.
    fn end(&mut self) -> Result<(), Error>;

    fn read_device_status(&mut self) -> Result<DeviceStatusBits, Error>;
    fn read_max_vco_frequency(&mut self) -> Result<u32, Error>;
}

impl<I2C, E> Si5351Audio<I2C>
where
    I2C: WriteRead<Error = E> + Write<Error = E>,
{
    /// Creates a new driver from a I2C peripheral
    pub fn new(i2c: I2C, config: Config) -> Self {
        Si5351Audio {
            i2c,
            address: ADDRESS | if config.address_bit { 1 } else { 0 },
            config,
        }
    }

    /// Adafruit breakout: 25 MHz crystal with 10 pF load.
    pub fn new_adafruit_module(i2c: I2C) -> Self {
        Si5351Audio::new(
            i2c,
            Config {
                crystal_load: CrystalLoad::_10,
                ..Config::default()
            },
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Gives the bus back.
    pub fn release(self) -> I2C {
        self.i2c
    }

    fn read_register(&mut self, reg: Register) -> Result<u8, Error> {
        let mut buffer = [0u8; 1];
        self.i2c
            .write_read(self.address, &[reg.addr()], &mut buffer)
            .map_err(i2c_error)?;
        trace!("read {:#04x}: {:#04x}", reg.addr(), buffer[0]);
        Ok(buffer[0])
    }

    fn write_register(&mut self, reg: Register, byte: u8) -> Result<(), Error> {
        self.write_registers(reg, &[byte])
    }

    /// Writes `data` to consecutive registers starting at `reg` in one transaction.
    fn write_registers(&mut self, reg: Register, data: &[u8]) -> Result<(), Error> {
        if data.len() > MAX_WRITE_LEN {
            return Err(Error::InvalidParameter);
        }

        let mut buffer = [0u8; MAX_WRITE_LEN + 1];
        buffer[0] = reg.addr();
        buffer[1..=data.len()].copy_from_slice(data);

        trace!("write {:#04x}: {:02x?}", reg.addr(), data);
        self.i2c
            .write(self.address, &buffer[..=data.len()])
            .map_err(i2c_error)
    }

    fn disable_outputs(&mut self, clock_control: ClockControlBits) -> Result<(), Error> {
        self.write_register(Register::OutputEnable, 0xFF)?;
        self.write_registers(
            Register::Clk0,
            &[clock_control.bits(); CLOCK_CONTROL_COUNT],
        )
    }
}

impl<I2C, E> AudioClock for Si5351Audio<I2C>
where
    I2C: WriteRead<Error = E> + Write<Error = E>,
{
    fn begin(
        &mut self,
        sampling_freq: u32,
        scale: [ScaleFactor; 3],
    ) -> Result<FrequencyPlan, Error> {
        self.begin_with_output_dividers(sampling_freq, scale, [None; 3])
    }

    fn begin_with_output_dividers(
        &mut self,
        sampling_freq: u32,
        scale: [ScaleFactor; 3],
        r_div: [Option<u8>; 3],
    ) -> Result<FrequencyPlan, Error> {
        let max_vco = self.read_max_vco_frequency()?;
        let plan = FrequencyPlan::new(
            self.config.xtal_freq,
            max_vco,
            sampling_freq,
            scale,
            r_div,
        )?;
        let image = RegisterImage::build(&plan)?;
        debug!(
            "programming {} output(s) at fs {} Hz, vco {} Hz",
            plan.enabled_channels(),
            sampling_freq,
            plan.vco_freq
        );

        self.disable_outputs(ClockControlBits::CLK_PDN)?;

        self.write_registers(Register::SpreadSpectrum, &[0; 7])?;
        self.write_registers(Register::Vcxo, &[0; 3])?;
        self.write_registers(Register::Ms67P1, &[0; 2])?;

        self.write_register(Register::CrystalLoad, self.config.crystal_load.bits())?;

        self.write_register(Register::InterruptMask, INTERRUPT_MASK.bits())?;
        self.write_register(Register::PllInputConfig, PLL_INPUT_XTAL)?;
        self.write_register(Register::PllInputSource, PLL_INPUT_XTAL)?;

        self.write_registers(Register::Msna, &image.pll)?;
        for (&clk, block) in ClockOutput::ALL.iter().zip(image.multisynth.iter()) {
            if let Some(block) = block {
                self.write_registers(clk.multisynth_register(), block)?;
            }
        }

        self.write_registers(Register::Clk0, &image.clock_control)?;

        self.write_register(
            Register::PLLReset,
            (PLLResetBits::PLLB_RST | PLLResetBits::PLLA_RST | PLLResetBits::RESERVED).bits(),
        )?;

        self.write_register(Register::OutputEnable, image.output_enable)?;

        Ok(plan)
    }

    fn end(&mut self) -> Result<(), Error> {
        self.disable_outputs(ClockControlBits::CLK_PDN | ClockControlBits::CLK_SRC_MS)
    }

    fn read_device_status(&mut self) -> Result<DeviceStatusBits, Error> {
        Ok(DeviceStatusBits::from_bits_truncate(
            self.read_register(Register::DeviceStatus)?,
        ))
    }

    fn read_max_vco_frequency(&mut self) -> Result<u32, Error> {
        let revision = self.read_device_status()?.revision();
        let max_vco = synth::max_vco_frequency(revision);
        debug!("revision {}, vco ceiling {} Hz", revision, max_vco);
        Ok(max_vco)
    }
}
