//! Continuous weighing example
//!
//! Zeroes the load cell at boot, then polls for conversions and prints
//! the scaled mass.

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

/// Grams per raw count at gain x128, determined with a calibration weight;
/// individual load cell dependent.
const CALIB_RATIO: f32 = 100.0 / 215_300.0;
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

    // bring up the sensor
    let mut adc = Nau7802::new(I2cRegisterBus::new(i2c), delay, Channels::One)
        .expect("no NAU7802 on the bus");

    adc.set_gain(128).unwrap();
    adc.set_conversion_rate(20).unwrap();

    println!(
        "calibrate internal: {}",
        adc.calibrate(CalibrationMode::Internal).unwrap()
    );
    // only use offset calibration with the load cell at zero
    println!(
        "calibrate offset:   {}",
        adc.calibrate(CalibrationMode::Offset).unwrap()
    );

    // zero the readings
    let zero = average(&mut adc, SAMPLE_AVG);

    loop {
        let value = average(&mut adc, SAMPLE_AVG);
        let mass = (value - zero) as f32 * CALIB_RATIO;
        println!("raw {} mass {} g", value, mass);
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
