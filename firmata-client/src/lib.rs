#![doc(html_root_url = "https://docs.rs/firmata-client/0.1.0")]

//! <h1 align="center">FIRMATA-CLIENT - Firmata protocol core for Rust</h1>
//!
//! # Features
//!
//! **Firmata-Client** drives a microcontroller running a Firmata sketch over a single duplex byte
//! stream (a serial port most of the time). The stream is shared by several independent
//! "virtual buses", all multiplexed through one reader thread and one writer lock:
//!
//! - request/response queries (firmware, capabilities, analog mapping, pin state) correlated
//!   FIFO per response id,
//! - exclusive [`Listener`](io::Listener)s for digital pin changes, analog readings, I2C replies,
//!   1-Wire replies and custom sysex features,
//! - bus facades: [`I2cBus`](buses::I2cBus), [`OneWireBus`](buses::OneWireBus) and
//!   [`GpioPin`](buses::GpioPin).
//!
//! When the stream ends or the device sends something the protocol cannot recover from, the
//! client moves to a faulted state: every pending and future call fails with the recorded
//! [`Fault`](io::Fault) instead of hanging.
//!
//! # Prerequisites
//!
//! [StandardFirmata](https://github.com/firmata/arduino) (or ConfigurableFirmata for 1-Wire)
//! **MUST** be installed on the board.
//!
//! # Getting Started
//!
//! ```no_run
//! use firmata_client::buses::I2cBus;
//! use firmata_client::io::{Client, Serial};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), firmata_client::errors::Error> {
//!     let client = Client::new(Serial::default());
//!     client.start().await?;
//!
//!     client.i2c_config(Duration::ZERO)?;
//!     let bus = I2cBus::new(&client);
//!     let mut temperature = [0u8; 2];
//!     bus.transact(0x48, &[0x00], &mut temperature).await?;
//!
//!     client.close()
//! }
//! ```
//!
//! # Feature flags
//!
//! - **libudev** -- (enabled by default) Activates `serialport` crate _libudev_ feature under-the-hood (required on Linux only for port listing).
//! - **serde** -- Enables serialize/deserialize capabilities for most entities.
//! - **mocks** -- Provides mocked entities (in-memory transport), useful for tests mostly.

pub mod buses;
pub mod errors;
pub mod io;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod utils;
