//! I2C transport for the register bus.

use embedded_hal::i2c::{I2c, SevenBitAddress};

use crate::RegisterBus;

/// Factory-programmed I2C address of the NAU7802.
pub const DEFAULT_ADDRESS: SevenBitAddress = 0x2A;

/// [`RegisterBus`] over any embedded-hal I2C peripheral, bound to a fixed
/// 7-bit device address at construction.
pub struct I2cRegisterBus<I2C> {
    i2c: I2C,
    address: SevenBitAddress,
}

impl<I2C: I2c> I2cRegisterBus<I2C> {
    /// Binds `i2c` to the factory-default device address.
    pub fn new(i2c: I2C) -> Self {
        Self {
            i2c,
            address: DEFAULT_ADDRESS,
        }
    }

    /// Binds `i2c` to a custom 7-bit device address.
    pub fn new_with_address(i2c: I2C, address: SevenBitAddress) -> Self {
        Self { i2c, address }
    }

    /// Releases the underlying I2C peripheral.
    pub fn release(self) -> I2C {
        self.i2c
    }
}

impl<I2C: I2c> RegisterBus for I2cRegisterBus<I2C> {
    type Error = I2C::Error;

    fn read_register(&mut self, register: u8) -> Result<u8, Self::Error> {
        let mut buf = [0u8; 1];
        self.i2c.write_read(self.address, &[register], &mut buf)?;
        Ok(buf[0])
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), Self::Error> {
        self.i2c.write(self.address, &[register, value])
    }

    fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.i2c.write_read(self.address, &[register], buf)
    }
}
