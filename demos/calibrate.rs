//! Calibration walk-through for a dual-channel scale
//!
//! Re-zeroes each bridge input in turn, dumps the diagnostic snapshot,
//! then prints raw values so a reference weight can be dialed in.

#![no_std]
#![no_main]

use bridge_adc::i2c::I2cRegisterBus;
use bridge_adc::nau7802::{CalibrationMode, Channels, Nau7802};
use bridge_adc::RegisterBus;
use embedded_hal::delay::DelayNs;
use esp_backtrace as _;
use esp_hal::{
    clock::ClockControl, delay::Delay, gpio::Io, i2c::I2C, peripherals::Peripherals, prelude::*,
    system::SystemControl,
};
use esp_println::println;

const SAMPLE_AVG: u32 = 100;

#[entry]
fn main() -> ! {
    let peripherals = Peripherals::take();
    let system = SystemControl::new(peripherals.SYSTEM);
    let clocks = ClockControl::boot_defaults(system.clock_control).freeze();

    let io = Io::new(peripherals.GPIO, peripherals.IO_MUX);
    let i2c = I2C::new(
        peripherals.I2C0,
        io.pins.gpio21,
        io.pins.gpio22,
        100.kHz(),
        &clocks,
    );
    let delay = Delay::new(&clocks);

    let mut adc = Nau7802::new(I2cRegisterBus::new(i2c), delay, Channels::Two)
        .expect("no NAU7802 on the bus");
    adc.set_gain(64).unwrap();

    for channel in [1u8, 2] {
        adc.set_channel(channel).unwrap();
        println!(
            "channel {} calibrate internal: {}",
            channel,
            adc.calibrate(CalibrationMode::Internal).unwrap()
        );
        println!(
            "channel {} calibrate offset:   {}",
            channel,
            adc.calibrate(CalibrationMode::Offset).unwrap()
        );
        let zero = average(&mut adc, SAMPLE_AVG);
        println!("channel {} zero offset: {}", channel, zero);
    }

    let status = adc.status().unwrap();
    println!(
        "rev 0x{:X} ldo {} rate {}SPS gain x{} channel {}",
        status.chip_revision,
        status.ldo_voltage.label(),
        status.conversion_rate,
        status.gain,
        status.channel
    );
    println!(
        "pu 0x{:02X} ctrl1 0x{:02X} ctrl2 0x{:02X} adc 0x{:02X} pga 0x{:02X}",
        status.pu_ctrl, status.ctrl1, status.ctrl2, status.adc_ctrl, status.pga
    );

    adc.set_channel(1).unwrap();
    println!("place the calibration weight on channel 1");

    loop {
        let value = average(&mut adc, SAMPLE_AVG);
        println!("raw value: {} (0x{:06X})", value, value & 0x00FF_FFFF);
    }
}

/// Averages `samples` consecutive conversions, polling for each one.
fn average<B, D>(adc: &mut Nau7802<B, D>, samples: u32) -> i32
where
    B: RegisterBus,
    B::Error: core::fmt::Debug,
    D: DelayNs,
{
    let mut sum: i64 = 0;
    let mut taken = 0;
    while taken < samples {
        if adc.available().unwrap() {
            sum += i64::from(adc.read().unwrap());
            taken += 1;
        }
    }
    (sum / i64::from(samples)) as i32
}
