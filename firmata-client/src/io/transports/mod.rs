use std::fmt::{Debug, Display};
use std::time::Duration;

use dyn_clone::DynClone;

use crate::errors::Error;

pub mod serial;

dyn_clone::clone_trait_object!(IoTransport);

/// The duplex byte stream a client runs over.
///
/// Clones must share the same underlying stream: the client keeps one clone for writing and hands
/// another one to its reader thread.
pub trait IoTransport: Debug + Display + DynClone + Send + Sync {
    /// Opens communication (in a blocking way) using the transport layer.
    ///
    /// # Notes
    ///  The method is sync and may block until the connection is established.
    fn open(&mut self) -> Result<(), Error>;

    /// Gracefully shuts down the transport layer.
    ///
    /// A reader blocked on the stream must observe an error soon after.
    fn close(&mut self) -> Result<(), Error>;

    /// Sets the read timeout of the transport layer.
    ///
    /// # Notes
    /// A read that times out returns a `Timeout` error: the reader uses it to poll for shutdown.
    fn set_timeout(&mut self, duration: Duration) -> Result<(), Error>;

    /// Write bytes to the internal connection. For more details see [`std::io::Write::write`].
    ///
    /// # Notes
    /// This function blocks until the write operation is complete. Ensure proper error handling in calling code.
    fn write(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Reads from the internal connection. For more details see [`std::io::Read::read_exact`].
    ///
    /// # Notes
    /// This function blocks until the buffer is filled or an error occurs. Ensure proper error handling in calling code.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error>;
}
