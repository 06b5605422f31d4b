//! NAU7802 24-bit sigma-delta ADC driver.
//!
//! The NAU7802 digitizes a wheatstone bridge through a programmable gain
//! amplifier, with all control going over a byte-addressed register space
//! on the serial bus. This module owns the register map and exposes
//! validated, typed access to it: power lifecycle, gain/rate/LDO/channel
//! configuration, the calibration procedure and the conversion read-out.

use embedded_hal::delay::DelayNs;

use crate::RegisterBus;

/// Register reset hold time. Datasheet minimum is 10 ms.
const RESET_HOLD_MS: u32 = 100;
/// Power rail and bandgap settle time after power-up. Datasheet minimum is 400 ms.
const POWER_UP_SETTLE_MS: u32 = 750;
/// Safe power-down time. Datasheet minimum is 200 us.
const POWER_DOWN_SETTLE_MS: u32 = 10;
/// Analog multiplexer settle time after a channel switch at 10 SPS.
const CHANNEL_SETTLE_MS: u32 = 400;
/// Default wait between calibration-completion polls.
const CAL_POLL_INTERVAL_MS: u32 = 10;

/// Device register map.
#[allow(dead_code)]
mod reg {
    /// Power-up control
    pub const PU_CTRL: u8 = 0x00;
    /// Control 1: gain and LDO voltage selects
    pub const CTRL1: u8 = 0x01;
    /// Control 2: calibration, conversion rate and channel selects
    pub const CTRL2: u8 = 0x02;
    /// Channel 1 offset calibration [23:16] down to [7:0]
    pub const OCAL1_B2: u8 = 0x03;
    pub const OCAL1_B1: u8 = 0x04;
    pub const OCAL1_B0: u8 = 0x05;
    /// Channel 1 gain calibration [31:24] down to [7:0]
    pub const GCAL1_B3: u8 = 0x06;
    pub const GCAL1_B2: u8 = 0x07;
    pub const GCAL1_B1: u8 = 0x08;
    pub const GCAL1_B0: u8 = 0x09;
    /// Channel 2 offset calibration [23:16] down to [7:0]
    pub const OCAL2_B2: u8 = 0x0A;
    pub const OCAL2_B1: u8 = 0x0B;
    pub const OCAL2_B0: u8 = 0x0C;
    /// Channel 2 gain calibration [31:24] down to [7:0]
    pub const GCAL2_B3: u8 = 0x0D;
    pub const GCAL2_B2: u8 = 0x0E;
    pub const GCAL2_B1: u8 = 0x0F;
    pub const GCAL2_B0: u8 = 0x10;
    /// I2C control
    pub const I2C_CTRL: u8 = 0x11;
    /// Conversion result [23:16], most significant byte first
    pub const ADCO_B2: u8 = 0x12;
    /// Conversion result [15:8]
    pub const ADCO_B1: u8 = 0x13;
    /// Conversion result [7:0]
    pub const ADCO_B0: u8 = 0x14;
    /// ADC control; shares this address with OTP[15:8] on read
    pub const ADC_CTRL: u8 = 0x15;
    /// OTP [7:0]
    pub const OTP_B0: u8 = 0x16;
    /// Programmable gain amplifier control
    pub const PGA: u8 = 0x1B;
    /// Power control
    pub const PWR_CTRL: u8 = 0x1C;
    /// Chip revision, low nibble
    pub const REV_ID: u8 = 0x1F;
}

/// `PU_CTRL` bit positions.
#[allow(dead_code)]
mod pu_ctrl {
    /// Register reset
    pub const RR: u8 = 0;
    /// Power up digital circuit
    pub const PUD: u8 = 1;
    /// Power up analog circuit
    pub const PUA: u8 = 2;
    /// Power-up ready status (read-only)
    pub const PUR: u8 = 3;
    /// Cycle start
    pub const CS: u8 = 4;
    /// Cycle ready: a finished conversion is waiting in ADCO (read-only)
    pub const CR: u8 = 5;
    /// System clock source select
    pub const OSCS: u8 = 6;
    /// AVDD source select: 1 = internal LDO, 0 = external pin
    pub const AVDDS: u8 = 7;
}

/// `CTRL1` field layout.
mod ctrl1 {
    /// PGA gain select
    pub const GAINS_OFFSET: u8 = 0;
    pub const GAINS_WIDTH: u8 = 3;
    /// LDO voltage select
    pub const VLDO_OFFSET: u8 = 3;
    pub const VLDO_WIDTH: u8 = 3;
}

/// `CTRL2` field layout.
mod ctrl2 {
    /// Calibration mode select
    pub const CALMOD_OFFSET: u8 = 0;
    pub const CALMOD_WIDTH: u8 = 2;
    /// Calibration start; self-clears when the procedure completes
    pub const CALS: u8 = 2;
    /// Calibration error (read-only after a calibration)
    pub const CAL_ERR: u8 = 3;
    /// Conversion rate select
    pub const CRS_OFFSET: u8 = 4;
    pub const CRS_WIDTH: u8 = 3;
    /// Channel select
    pub const CHS: u8 = 7;
}

/// `ADC_CTRL` field layout. Write-only: reads of the register return OTP
/// data instead of the last written value.
mod adc_ctrl {
    /// Chopper clock frequency select
    pub const REG_CHPS_OFFSET: u8 = 4;
    /// Selector value that disables the chopper clock
    pub const CHOP_CLOCK_OFF: u8 = 0x3;
}

/// `PGA` bit positions.
mod pga {
    /// LDO stability/accuracy mode; 0 selects low-ESR capacitor operation
    pub const LDOMODE: u8 = 6;
}

/// `PWR_CTRL` bit positions.
mod pwr_ctrl {
    /// PGA output stabilizer capacitor enable; single-channel use only
    pub const PGA_CAP_EN: u8 = 7;
}

/// Driver error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// The register bus transaction failed.
    Bus(E),
    /// A value outside the closed set accepted by a setter; the device
    /// registers were left unmodified.
    InvalidParameter,
    /// The device did not report power-up ready, or a bounded
    /// calibration poll ran out of attempts.
    NotReady,
}

/// PGA gain factor selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Gain {
    X1,
    X2,
    X4,
    X8,
    X16,
    X32,
    X64,
    X128,
}

impl Gain {
    /// Maps a public gain factor to its selector. Anything outside
    /// {1, 2, 4, 8, 16, 32, 64, 128} has no selector.
    pub fn from_factor(factor: u16) -> Option<Self> {
        match factor {
            1 => Some(Gain::X1),
            2 => Some(Gain::X2),
            4 => Some(Gain::X4),
            8 => Some(Gain::X8),
            16 => Some(Gain::X16),
            32 => Some(Gain::X32),
            64 => Some(Gain::X64),
            128 => Some(Gain::X128),
            _ => None,
        }
    }

    /// The amplification factor this selector applies.
    pub fn factor(self) -> u16 {
        match self {
            Gain::X1 => 1,
            Gain::X2 => 2,
            Gain::X4 => 4,
            Gain::X8 => 8,
            Gain::X16 => 16,
            Gain::X32 => 32,
            Gain::X64 => 64,
            Gain::X128 => 128,
        }
    }

    /// `CTRL1.GAINS` field encoding.
    fn bits(self) -> u8 {
        match self {
            Gain::X1 => 0x0,
            Gain::X2 => 0x1,
            Gain::X4 => 0x2,
            Gain::X8 => 0x3,
            Gain::X16 => 0x4,
            Gain::X32 => 0x5,
            Gain::X64 => 0x6,
            Gain::X128 => 0x7,
        }
    }
}

/// Conversion rate selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConversionRate {
    Sps10,
    Sps20,
    Sps40,
    Sps80,
    Sps320,
}

impl ConversionRate {
    /// Maps a samples-per-second value to its selector. Anything outside
    /// {10, 20, 40, 80, 320} has no selector.
    pub fn from_sps(sps: u16) -> Option<Self> {
        match sps {
            10 => Some(ConversionRate::Sps10),
            20 => Some(ConversionRate::Sps20),
            40 => Some(ConversionRate::Sps40),
            80 => Some(ConversionRate::Sps80),
            320 => Some(ConversionRate::Sps320),
            _ => None,
        }
    }

    /// The rate in samples per second.
    pub fn sps(self) -> u16 {
        match self {
            ConversionRate::Sps10 => 10,
            ConversionRate::Sps20 => 20,
            ConversionRate::Sps40 => 40,
            ConversionRate::Sps80 => 80,
            ConversionRate::Sps320 => 320,
        }
    }

    /// `CTRL2.CRS` field encoding.
    fn bits(self) -> u8 {
        match self {
            ConversionRate::Sps10 => 0x0,
            ConversionRate::Sps20 => 0x1,
            ConversionRate::Sps40 => 0x2,
            ConversionRate::Sps80 => 0x3,
            ConversionRate::Sps320 => 0x7,
        }
    }
}

/// Analog supply (AVDD) selection.
///
/// Any internal voltage routes AVDD from the on-chip LDO; `External`
/// keeps AVDD on the supply pin and leaves the voltage select untouched.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LdoVoltage {
    V2_4,
    V2_7,
    V3_0,
    V3_3,
    V3_6,
    V3_9,
    V4_2,
    V4_5,
    External,
}

impl LdoVoltage {
    /// `CTRL1.VLDO` field encoding; `None` for the external supply.
    fn bits(self) -> Option<u8> {
        match self {
            LdoVoltage::V4_5 => Some(0x0),
            LdoVoltage::V4_2 => Some(0x1),
            LdoVoltage::V3_9 => Some(0x2),
            LdoVoltage::V3_6 => Some(0x3),
            LdoVoltage::V3_3 => Some(0x4),
            LdoVoltage::V3_0 => Some(0x5),
            LdoVoltage::V2_7 => Some(0x6),
            LdoVoltage::V2_4 => Some(0x7),
            LdoVoltage::External => None,
        }
    }

    /// Printable label, e.g. `"3V0"`.
    pub fn label(self) -> &'static str {
        match self {
            LdoVoltage::V2_4 => "2V4",
            LdoVoltage::V2_7 => "2V7",
            LdoVoltage::V3_0 => "3V0",
            LdoVoltage::V3_3 => "3V3",
            LdoVoltage::V3_6 => "3V6",
            LdoVoltage::V3_9 => "3V9",
            LdoVoltage::V4_2 => "4V2",
            LdoVoltage::V4_5 => "4V5",
            LdoVoltage::External => "EXT",
        }
    }
}

/// Calibration procedure selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationMode {
    /// Zero offset against the internal short.
    Internal,
    /// System zero against the external input.
    Offset,
    /// System full-scale against the external input.
    Gain,
}

impl CalibrationMode {
    /// `CTRL2.CALMOD` field encoding.
    fn bits(self) -> u8 {
        match self {
            CalibrationMode::Internal => 0b00,
            CalibrationMode::Offset => 0b10,
            CalibrationMode::Gain => 0b11,
        }
    }
}

/// Number of bridge inputs wired to the device, fixed at construction.
///
/// Governs whether channel 2 may be selected and whether the PGA output
/// stabilizer capacitor is enabled (it sits across the channel 2 pins, so
/// it is only usable in single-channel operation).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Channels {
    One,
    Two,
}

/// Diagnostic snapshot of the cached configuration and raw register
/// contents, produced by [`Nau7802::status`]. Reads only; taking a
/// snapshot never mutates the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    pub chip_revision: u8,
    pub ldo_voltage: LdoVoltage,
    pub conversion_rate: u16,
    pub gain: u16,
    pub channel: u8,
    pub pu_ctrl: u8,
    pub ctrl1: u8,
    pub ctrl2: u8,
    pub adc_ctrl: u8,
    pub pga: u8,
}

/// NAU7802 device handle.
///
/// Owns the register bus and a delay source. All operations are blocking
/// and synchronous; the handle is not safe to share between threads
/// without external serialization.
pub struct Nau7802<B, D> {
    bus: B,
    delay: D,
    channels: Channels,
    ldo_voltage: LdoVoltage,
    gain: Gain,
    rate: ConversionRate,
    channel: u8,
    last_reading: i32,
    cal_poll_interval_ms: u32,
    cal_poll_limit: Option<u32>,
}

impl<B, D> Nau7802<B, D>
where
    B: RegisterBus,
    D: DelayNs,
{
    /// Brings up the device and applies the power-on configuration:
    /// 3.0 V internal LDO, gain x128, 10 samples per second, chopper
    /// clock disabled, low-ESR capacitor mode, and the PGA output
    /// stabilizer capacitor enabled only for single-channel operation.
    ///
    /// Fails with [`Error::NotReady`] when the device does not report
    /// power-up ready after reset or enable; that status bit is the one
    /// observable difference between a present and an absent device.
    pub fn new(bus: B, delay: D, channels: Channels) -> Result<Self, Error<B::Error>> {
        let mut adc = Self {
            bus,
            delay,
            channels,
            ldo_voltage: LdoVoltage::External,
            gain: Gain::X1,
            rate: ConversionRate::Sps10,
            channel: 1,
            last_reading: 0,
            cal_poll_interval_ms: CAL_POLL_INTERVAL_MS,
            cal_poll_limit: None,
        };

        if !adc.reset()? {
            return Err(Error::NotReady);
        }
        if !adc.enable(true)? {
            return Err(Error::NotReady);
        }

        adc.set_ldo_voltage(LdoVoltage::V3_0)?;
        adc.set_gain(128)?;
        adc.set_conversion_rate(10)?;
        adc.write_reg(
            reg::ADC_CTRL,
            adc_ctrl::CHOP_CLOCK_OFF << adc_ctrl::REG_CHPS_OFFSET,
        )?;
        adc.write_flag(reg::PGA, pga::LDOMODE, false)?;
        adc.write_flag(
            reg::PWR_CTRL,
            pwr_ctrl::PGA_CAP_EN,
            channels == Channels::One,
        )?;

        Ok(adc)
    }

    /// Resets every device register and powers the digital domain back
    /// up. Returns the power-up ready status bit.
    pub fn reset(&mut self) -> Result<bool, Error<B::Error>> {
        self.write_flag(reg::PU_CTRL, pu_ctrl::RR, true)?;
        self.delay.delay_ms(RESET_HOLD_MS);
        self.write_flag(reg::PU_CTRL, pu_ctrl::RR, false)?;
        self.write_flag(reg::PU_CTRL, pu_ctrl::PUD, true)?;
        self.delay.delay_ms(POWER_UP_SETTLE_MS);

        let ready = self.read_flag(reg::PU_CTRL, pu_ctrl::PUR)?;
        #[cfg(feature = "defmt")]
        defmt::trace!("reset: power-up ready = {}", ready);
        #[cfg(feature = "log")]
        log::trace!("reset: power-up ready = {}", ready);
        Ok(ready)
    }

    /// Powers the analog and digital domains up or down without touching
    /// the cached configuration.
    ///
    /// Enabling waits out the power rail and bandgap settle time, starts
    /// continuous conversion cycling and returns the live power-up ready
    /// bit. Disabling always returns `false`; powering down cannot fail.
    pub fn enable(&mut self, power: bool) -> Result<bool, Error<B::Error>> {
        if power {
            self.write_flag(reg::PU_CTRL, pu_ctrl::PUA, true)?;
            self.write_flag(reg::PU_CTRL, pu_ctrl::PUD, true)?;
            self.delay.delay_ms(POWER_UP_SETTLE_MS);
            self.write_flag(reg::PU_CTRL, pu_ctrl::CS, true)?;

            let ready = self.read_flag(reg::PU_CTRL, pu_ctrl::PUR)?;
            #[cfg(feature = "defmt")]
            defmt::trace!("enable: power-up ready = {}", ready);
            #[cfg(feature = "log")]
            log::trace!("enable: power-up ready = {}", ready);
            return Ok(ready);
        }

        self.write_flag(reg::PU_CTRL, pu_ctrl::PUA, false)?;
        self.write_flag(reg::PU_CTRL, pu_ctrl::PUD, false)?;
        self.delay.delay_ms(POWER_DOWN_SETTLE_MS);
        Ok(false)
    }

    /// Whether a finished conversion is waiting in the output registers.
    /// Never blocks or sleeps.
    pub fn available(&mut self) -> Result<bool, Error<B::Error>> {
        self.read_flag(reg::PU_CTRL, pu_ctrl::CR)
    }

    /// Reads the latest 24-bit conversion as a sign-extended integer.
    ///
    /// Callers must have observed [`available`](Self::available) return
    /// `true` first; reading earlier yields a stale or partially updated
    /// sample rather than an error.
    pub fn read(&mut self) -> Result<i32, Error<B::Error>> {
        let mut out = [0u8; 3];
        self.bus
            .read_registers(reg::ADCO_B2, &mut out)
            .map_err(Error::Bus)?;

        // MSB first into the top 24 bits of an i32, then an arithmetic
        // shift back down so the sign of the 24-bit sample survives.
        let value = i32::from_be_bytes([out[0], out[1], out[2], 0]) >> 8;
        self.last_reading = value;
        Ok(value)
    }

    /// The most recent conversion returned by [`read`](Self::read).
    pub fn last_reading(&self) -> i32 {
        self.last_reading
    }

    /// Runs the selected calibration procedure and blocks until the
    /// device reports completion. Returns `true` when calibration
    /// succeeded and `false` when the device flagged a calibration
    /// error, a recoverable outcome the caller may retry.
    ///
    /// Completion is detected by polling the calibration-start bit until
    /// it self-clears, sleeping the configured interval between checks
    /// (see [`set_calibration_poll`](Self::set_calibration_poll)). With
    /// no poll limit configured the wait is unbounded.
    pub fn calibrate(&mut self, mode: CalibrationMode) -> Result<bool, Error<B::Error>> {
        self.write_field(
            reg::CTRL2,
            ctrl2::CALMOD_OFFSET,
            ctrl2::CALMOD_WIDTH,
            mode.bits(),
        )?;
        self.write_flag(reg::CTRL2, ctrl2::CALS, true)?;

        let mut polls = 0u32;
        while self.read_flag(reg::CTRL2, ctrl2::CALS)? {
            if let Some(limit) = self.cal_poll_limit {
                if polls >= limit {
                    return Err(Error::NotReady);
                }
            }
            polls += 1;
            self.delay.delay_ms(self.cal_poll_interval_ms);
        }

        let ok = !self.read_flag(reg::CTRL2, ctrl2::CAL_ERR)?;
        #[cfg(feature = "defmt")]
        defmt::debug!("calibrate {}: ok = {}", mode, ok);
        #[cfg(feature = "log")]
        log::debug!("calibrate {:?}: ok = {}", mode, ok);
        Ok(ok)
    }

    /// Sets the wait between calibration-completion polls and an
    /// optional bound on the number of polls.
    ///
    /// The default is a 10 ms interval with no bound, matching the
    /// hardware contract that calibration always terminates. With a
    /// bound configured, a stalled device surfaces as
    /// [`Error::NotReady`] instead of hanging the caller.
    pub fn set_calibration_poll(&mut self, interval_ms: u32, limit: Option<u32>) {
        self.cal_poll_interval_ms = interval_ms;
        self.cal_poll_limit = limit;
    }

    /// The chip revision code, the low 4 bits of the revision register.
    pub fn chip_revision(&mut self) -> Result<u8, Error<B::Error>> {
        self.read_field(reg::REV_ID, 0, 4)
    }

    /// Selected channel number, 1 or 2.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Selects the active input channel.
    ///
    /// Channel 2 is only accepted when the driver was constructed with
    /// [`Channels::Two`]. After the select the driver waits out the
    /// analog multiplexer settling time.
    pub fn set_channel(&mut self, channel: u8) -> Result<(), Error<B::Error>> {
        let select = match (channel, self.channels) {
            (1, _) => false,
            (2, Channels::Two) => true,
            _ => return Err(Error::InvalidParameter),
        };
        self.write_flag(reg::CTRL2, ctrl2::CHS, select)?;
        self.delay.delay_ms(CHANNEL_SETTLE_MS);
        self.channel = channel;
        Ok(())
    }

    /// The PGA gain factor.
    pub fn gain(&self) -> u16 {
        self.gain.factor()
    }

    /// Sets the PGA gain factor. Valid factors are 1, 2, 4, 8, 16, 32,
    /// 64 and 128; anything else is rejected without touching the device.
    pub fn set_gain(&mut self, factor: u16) -> Result<(), Error<B::Error>> {
        let gain = Gain::from_factor(factor).ok_or(Error::InvalidParameter)?;
        self.write_field(reg::CTRL1, ctrl1::GAINS_OFFSET, ctrl1::GAINS_WIDTH, gain.bits())?;
        self.gain = gain;
        Ok(())
    }

    /// The conversion rate in samples per second.
    pub fn conversion_rate(&self) -> u16 {
        self.rate.sps()
    }

    /// Sets the conversion rate. Valid rates are 10, 20, 40, 80 and 320
    /// samples per second; anything else is rejected without touching
    /// the device.
    pub fn set_conversion_rate(&mut self, sps: u16) -> Result<(), Error<B::Error>> {
        let rate = ConversionRate::from_sps(sps).ok_or(Error::InvalidParameter)?;
        self.write_field(reg::CTRL2, ctrl2::CRS_OFFSET, ctrl2::CRS_WIDTH, rate.bits())?;
        self.rate = rate;
        Ok(())
    }

    /// The analog supply selection.
    pub fn ldo_voltage(&self) -> LdoVoltage {
        self.ldo_voltage
    }

    /// Selects the analog supply. Internal voltages program the LDO and
    /// switch AVDD to the internal source; [`LdoVoltage::External`]
    /// hands AVDD back to the supply pin.
    pub fn set_ldo_voltage(&mut self, voltage: LdoVoltage) -> Result<(), Error<B::Error>> {
        if let Some(bits) = voltage.bits() {
            self.write_field(reg::CTRL1, ctrl1::VLDO_OFFSET, ctrl1::VLDO_WIDTH, bits)?;
        }
        self.write_flag(
            reg::PU_CTRL,
            pu_ctrl::AVDDS,
            voltage != LdoVoltage::External,
        )?;
        self.ldo_voltage = voltage;
        Ok(())
    }

    /// Captures a diagnostic snapshot. Performs reads only; repeated
    /// calls with no intervening writes return identical snapshots.
    pub fn status(&mut self) -> Result<Status, Error<B::Error>> {
        Ok(Status {
            chip_revision: self.chip_revision()?,
            ldo_voltage: self.ldo_voltage,
            conversion_rate: self.rate.sps(),
            gain: self.gain.factor(),
            channel: self.channel,
            pu_ctrl: self.read_reg(reg::PU_CTRL)?,
            ctrl1: self.read_reg(reg::CTRL1)?,
            ctrl2: self.read_reg(reg::CTRL2)?,
            adc_ctrl: self.read_reg(reg::ADC_CTRL)?,
            pga: self.read_reg(reg::PGA)?,
        })
    }

    /// Releases the register bus and delay source.
    pub fn release(self) -> (B, D) {
        (self.bus, self.delay)
    }

    // Register access helpers; the bus error is wrapped once here and
    // propagated with `?` everywhere else.

    fn read_reg(&mut self, register: u8) -> Result<u8, Error<B::Error>> {
        self.bus.read_register(register).map_err(Error::Bus)
    }

    fn write_reg(&mut self, register: u8, value: u8) -> Result<(), Error<B::Error>> {
        self.bus.write_register(register, value).map_err(Error::Bus)
    }

    fn read_field(&mut self, register: u8, offset: u8, width: u8) -> Result<u8, Error<B::Error>> {
        self.bus
            .read_bits(register, offset, width)
            .map_err(Error::Bus)
    }

    fn write_field(
        &mut self,
        register: u8,
        offset: u8,
        width: u8,
        value: u8,
    ) -> Result<(), Error<B::Error>> {
        self.bus
            .write_bits(register, offset, width, value)
            .map_err(Error::Bus)
    }

    fn read_flag(&mut self, register: u8, bit: u8) -> Result<bool, Error<B::Error>> {
        self.bus.read_bit(register, bit).map_err(Error::Bus)
    }

    fn write_flag(&mut self, register: u8, bit: u8, set: bool) -> Result<(), Error<B::Error>> {
        self.bus.write_bit(register, bit, set).map_err(Error::Bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct DeviceModel {
        regs: [u8; 32],
        /// PUR tracks PUD on a present, healthy device.
        ready: bool,
        /// CALS sticks set when the simulated device has stalled.
        cal_hangs: bool,
        /// CAL_ERR outcome reported once a calibration completes.
        cal_error: bool,
        writes: usize,
    }

    /// Shared-handle register-file simulation of the device, so tests run
    /// without hardware on the bus.
    #[derive(Clone)]
    struct SimBus(Rc<RefCell<DeviceModel>>);

    impl SimBus {
        fn new() -> Self {
            SimBus(Rc::new(RefCell::new(DeviceModel {
                ready: true,
                ..Default::default()
            })))
        }

        fn dead() -> Self {
            SimBus(Rc::new(RefCell::new(DeviceModel::default())))
        }

        fn reg(&self, register: u8) -> u8 {
            self.0.borrow().regs[register as usize]
        }

        fn set_reg(&self, register: u8, value: u8) {
            self.0.borrow_mut().regs[register as usize] = value;
        }

        fn writes(&self) -> usize {
            self.0.borrow().writes
        }

        fn fail_calibration(&self) {
            self.0.borrow_mut().cal_error = true;
        }

        fn stall_calibration(&self) {
            self.0.borrow_mut().cal_hangs = true;
        }
    }

    impl RegisterBus for SimBus {
        type Error = core::convert::Infallible;

        fn read_register(&mut self, register: u8) -> Result<u8, Self::Error> {
            Ok(self.0.borrow().regs[register as usize])
        }

        fn write_register(&mut self, register: u8, value: u8) -> Result<(), Self::Error> {
            let mut dev = self.0.borrow_mut();
            dev.writes += 1;

            let mut value = value;
            if register == reg::PU_CTRL {
                // PUR is a status output: it follows PUD on a healthy
                // device and stays low on a dead one.
                let powered = value & (1 << pu_ctrl::PUD) != 0;
                if dev.ready && powered {
                    value |= 1 << pu_ctrl::PUR;
                } else {
                    value &= !(1 << pu_ctrl::PUR);
                }
            }
            if register == reg::CTRL2 && value & (1 << ctrl2::CALS) != 0 && !dev.cal_hangs {
                // Calibration completes instantly: CALS self-clears and
                // CAL_ERR reports the programmed outcome.
                value &= !(1 << ctrl2::CALS);
                if dev.cal_error {
                    value |= 1 << ctrl2::CAL_ERR;
                } else {
                    value &= !(1 << ctrl2::CAL_ERR);
                }
            }
            dev.regs[register as usize] = value;
            Ok(())
        }

        fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<(), Self::Error> {
            let dev = self.0.borrow();
            let start = register as usize;
            buf.copy_from_slice(&dev.regs[start..start + buf.len()]);
            Ok(())
        }
    }

    /// Accumulates requested delay instead of sleeping.
    #[derive(Clone, Default)]
    struct RecordingDelay(Rc<RefCell<u64>>);

    impl RecordingDelay {
        fn total_ns(&self) -> u64 {
            *self.0.borrow()
        }
    }

    impl DelayNs for RecordingDelay {
        fn delay_ns(&mut self, ns: u32) {
            *self.0.borrow_mut() += u64::from(ns);
        }
    }

    fn new_adc(bus: &SimBus, channels: Channels) -> Nau7802<SimBus, RecordingDelay> {
        Nau7802::new(bus.clone(), RecordingDelay::default(), channels).unwrap()
    }

    #[test]
    fn construction_applies_power_on_defaults() {
        let bus = SimBus::new();
        let adc = new_adc(&bus, Channels::One);

        assert_eq!(adc.gain(), 128);
        assert_eq!(adc.conversion_rate(), 10);
        assert_eq!(adc.ldo_voltage(), LdoVoltage::V3_0);
        assert_eq!(adc.channel(), 1);

        assert_eq!(bus.reg(reg::CTRL1) & 0x07, 0x7); // gain x128
        assert_eq!((bus.reg(reg::CTRL1) >> 3) & 0x07, 0x5); // LDO 3V0
        assert_ne!(bus.reg(reg::PU_CTRL) & (1 << pu_ctrl::AVDDS), 0);
        assert_ne!(bus.reg(reg::PU_CTRL) & (1 << pu_ctrl::CS), 0);
        assert_eq!(bus.reg(reg::ADC_CTRL), 0x30); // chopper clock off
        assert_eq!(bus.reg(reg::PGA) & (1 << pga::LDOMODE), 0);
        assert_ne!(bus.reg(reg::PWR_CTRL) & (1 << pwr_ctrl::PGA_CAP_EN), 0);
    }

    #[test]
    fn dual_channel_construction_disables_stabilizer_cap() {
        let bus = SimBus::new();
        let _adc = new_adc(&bus, Channels::Two);
        assert_eq!(bus.reg(reg::PWR_CTRL) & (1 << pwr_ctrl::PGA_CAP_EN), 0);
    }

    #[test]
    fn construction_fails_on_an_absent_device() {
        let result = Nau7802::new(SimBus::dead(), RecordingDelay::default(), Channels::One);
        assert_eq!(result.err(), Some(Error::NotReady));
    }

    #[test]
    fn reset_then_enable_report_ready() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::One);
        assert_eq!(adc.reset(), Ok(true));
        assert_eq!(adc.enable(true), Ok(true));
    }

    #[test]
    fn disable_always_reports_false() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::One);
        assert_eq!(adc.enable(false), Ok(false));
        assert_eq!(bus.reg(reg::PU_CTRL) & (1 << pu_ctrl::PUR), 0);
    }

    #[test]
    fn reset_waits_out_the_power_up_times() {
        let bus = SimBus::new();
        let delay = RecordingDelay::default();
        let mut adc = Nau7802::new(bus, delay.clone(), Channels::One).unwrap();

        let before = delay.total_ns();
        adc.reset().unwrap();
        // 100 ms reset hold plus 750 ms rail settle
        assert!(delay.total_ns() - before >= 850_000_000);
    }

    #[test]
    fn gain_round_trips_with_documented_encoding() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::One);

        for (factor, bits) in [
            (1, 0x0),
            (2, 0x1),
            (4, 0x2),
            (8, 0x3),
            (16, 0x4),
            (32, 0x5),
            (64, 0x6),
            (128, 0x7),
        ] {
            adc.set_gain(factor).unwrap();
            assert_eq!(adc.gain(), factor);
            assert_eq!(bus.reg(reg::CTRL1) & 0x07, bits);
        }
    }

    #[test]
    fn invalid_gain_is_rejected_without_a_register_write() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::One);
        adc.set_gain(64).unwrap();
        let before = bus.reg(reg::CTRL1);

        for factor in [0u16, 3, 5, 127, 256] {
            assert_eq!(adc.set_gain(factor), Err(Error::InvalidParameter));
            assert_eq!(bus.reg(reg::CTRL1), before);
            assert_eq!(adc.gain(), 64);
        }
    }

    #[test]
    fn conversion_rate_round_trips_with_documented_encoding() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::One);

        for (sps, bits) in [(10, 0x0), (20, 0x1), (40, 0x2), (80, 0x3), (320, 0x7)] {
            adc.set_conversion_rate(sps).unwrap();
            assert_eq!(adc.conversion_rate(), sps);
            assert_eq!((bus.reg(reg::CTRL2) >> 4) & 0x07, bits);
        }

        assert_eq!(adc.set_conversion_rate(160), Err(Error::InvalidParameter));
        assert_eq!(adc.conversion_rate(), 320);
    }

    #[test]
    fn read_round_trips_twos_complement() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::One);

        for (bytes, expected) in [
            ([0x00, 0x00, 0x01], 1),
            ([0xFF, 0xFF, 0xFF], -1),
            ([0x7F, 0xFF, 0xFF], 8_388_607),
            ([0x80, 0x00, 0x00], -8_388_608),
            ([0x00, 0x00, 0x00], 0),
        ] {
            bus.set_reg(reg::ADCO_B2, bytes[0]);
            bus.set_reg(reg::ADCO_B1, bytes[1]);
            bus.set_reg(reg::ADCO_B0, bytes[2]);
            assert_eq!(adc.read(), Ok(expected));
            assert_eq!(adc.last_reading(), expected);
        }
    }

    #[test]
    fn available_tracks_the_cycle_ready_bit() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::One);

        bus.set_reg(reg::PU_CTRL, bus.reg(reg::PU_CTRL) & !(1 << pu_ctrl::CR));
        assert_eq!(adc.available(), Ok(false));

        bus.set_reg(reg::PU_CTRL, bus.reg(reg::PU_CTRL) | (1 << pu_ctrl::CR));
        assert_eq!(adc.available(), Ok(true));
    }

    #[test]
    fn calibrate_reports_the_error_bit() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::One);

        assert_eq!(adc.calibrate(CalibrationMode::Gain), Ok(true));
        assert_eq!(bus.reg(reg::CTRL2) & 0x03, 0b11); // mode written

        bus.fail_calibration();
        assert_eq!(adc.calibrate(CalibrationMode::Gain), Ok(false));
    }

    #[test]
    fn calibrate_writes_each_mode_encoding() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::One);

        for (mode, bits) in [
            (CalibrationMode::Internal, 0b00),
            (CalibrationMode::Offset, 0b10),
            (CalibrationMode::Gain, 0b11),
        ] {
            adc.calibrate(mode).unwrap();
            assert_eq!(bus.reg(reg::CTRL2) & 0x03, bits);
        }
    }

    #[test]
    fn bounded_poll_turns_a_stall_into_not_ready() {
        let bus = SimBus::new();
        bus.stall_calibration();
        let mut adc = new_adc(&bus, Channels::One);
        adc.set_calibration_poll(1, Some(3));

        assert_eq!(
            adc.calibrate(CalibrationMode::Internal),
            Err(Error::NotReady)
        );
    }

    #[test]
    fn channel_two_needs_a_dual_channel_device() {
        let bus = SimBus::new();
        let mut single = new_adc(&bus, Channels::One);
        let before = bus.reg(reg::CTRL2);

        assert_eq!(single.set_channel(2), Err(Error::InvalidParameter));
        assert_eq!(single.channel(), 1);
        assert_eq!(bus.reg(reg::CTRL2), before);

        let bus = SimBus::new();
        let mut dual = new_adc(&bus, Channels::Two);
        dual.set_channel(2).unwrap();
        assert_eq!(dual.channel(), 2);
        assert_ne!(bus.reg(reg::CTRL2) & (1 << ctrl2::CHS), 0);

        dual.set_channel(1).unwrap();
        assert_eq!(dual.channel(), 1);
        assert_eq!(bus.reg(reg::CTRL2) & (1 << ctrl2::CHS), 0);

        assert_eq!(dual.set_channel(3), Err(Error::InvalidParameter));
    }

    #[test]
    fn ldo_selection_drives_the_avdd_source_bit() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::One);

        adc.set_ldo_voltage(LdoVoltage::V2_4).unwrap();
        assert_eq!((bus.reg(reg::CTRL1) >> 3) & 0x07, 0x7);
        assert_ne!(bus.reg(reg::PU_CTRL) & (1 << pu_ctrl::AVDDS), 0);

        adc.set_ldo_voltage(LdoVoltage::External).unwrap();
        assert_eq!(bus.reg(reg::PU_CTRL) & (1 << pu_ctrl::AVDDS), 0);
        // the voltage select is left untouched by the external switch
        assert_eq!((bus.reg(reg::CTRL1) >> 3) & 0x07, 0x7);
        assert_eq!(adc.ldo_voltage(), LdoVoltage::External);
    }

    #[test]
    fn status_is_idempotent_and_write_free() {
        let bus = SimBus::new();
        let mut adc = new_adc(&bus, Channels::Two);
        bus.set_reg(reg::REV_ID, 0xAF); // only the low nibble is revision

        let writes = bus.writes();
        let first = adc.status().unwrap();
        let second = adc.status().unwrap();

        assert_eq!(first, second);
        assert_eq!(bus.writes(), writes);
        assert_eq!(first.chip_revision, 0x0F);
        assert_eq!(first.gain, 128);
        assert_eq!(first.conversion_rate, 10);
        assert_eq!(first.ldo_voltage, LdoVoltage::V3_0);
        assert_eq!(first.channel, 1);
    }
}
