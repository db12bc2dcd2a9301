use log::trace;

use crate::errors::HardwareError::{I2cNotConfigured, OutOfRange};
use crate::errors::ProtocolError::MessageTooShort;
use crate::errors::*;
use crate::io::codec::{pack_7bit_pair, split_14bit};
use crate::io::constants::{I2C_MAX_READ_LENGTH, I2C_READ, I2C_REQUEST, I2C_WRITE};
use crate::io::Client;

/// An I2C bus driven by the device (7-bit/8-bit addressing only).
///
/// Requires a prior [`Client::i2c_config`].
#[derive(Clone, Debug)]
pub struct I2cBus {
    client: Client,
}

impl I2cBus {
    pub fn new(client: &Client) -> Self {
        Self {
            client: client.clone(),
        }
    }

    /// Writes `write` to `address`, then reads `read.len()` bytes from it.
    ///
    /// Either side may be empty. The address listener is held for the duration of the call.
    ///
    /// # Errors
    /// * `OutOfRange`: 10-bit address or read length beyond what the wire can carry.
    /// * `I2cNotConfigured`: [`Client::i2c_config`] was never sent.
    /// * `AlreadyRegistered`: another transaction with `address` is running.
    /// * `MessageTooShort`: the device replied with fewer bytes than requested.
    pub async fn transact(&self, address: u16, write: &[u8], read: &mut [u8]) -> Result<(), Error> {
        if address >= 0xFF {
            return Err(OutOfRange {
                context: "i2c address (10-bit addressing is not supported)",
                value: address as usize,
                max: 0xFE,
            }
            .into());
        }
        if read.len() > I2C_MAX_READ_LENGTH {
            return Err(OutOfRange {
                context: "i2c read length",
                value: read.len(),
                max: I2C_MAX_READ_LENGTH,
            }
            .into());
        }
        if !self.client.is_i2c_configured() {
            return Err(I2cNotConfigured.into());
        }

        let mut listener = self.client.listen_i2c(address)?;
        let (address_lsb, address_msb) = split_14bit(address);

        if !write.is_empty() {
            let mut body = Vec::with_capacity(2 + write.len() * 2);
            body.push(address_lsb);
            body.push((I2C_WRITE << 3) | (address_msb & 0x07));
            for &byte in write {
                let (lsb, msb) = pack_7bit_pair(byte);
                body.push(lsb);
                body.push(msb);
            }
            self.client.send_sysex(I2C_REQUEST, &body)?;
        }

        if !read.is_empty() {
            let (length_lsb, length_msb) = split_14bit(read.len() as u16);
            self.client.send_sysex(
                I2C_REQUEST,
                &[
                    address_lsb,
                    (I2C_READ << 3) | (address_msb & 0x07),
                    length_lsb,
                    length_msb,
                ],
            )?;
            let packet = self.client.next_from(&mut listener, "i2c read").await?;
            trace!("I2C reply from {:#04X}: {:?}", address, packet);
            if packet.data.len() < read.len() {
                return Err(MessageTooShort {
                    operation: "i2c read",
                    expected: read.len(),
                    received: packet.data.len(),
                }
                .into());
            }
            read.copy_from_slice(&packet.data[..read.len()]);
        }
        Ok(())
    }
}
