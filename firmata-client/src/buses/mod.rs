//! Bus facades composing the client into request/reply operations: I2C, 1-Wire and single pins.

mod gpio;
mod i2c;
mod onewire;

pub use gpio::{Edge, GpioPin, Pull};
pub use i2c::I2cBus;
pub use onewire::{OneWireBus, Pullup};
