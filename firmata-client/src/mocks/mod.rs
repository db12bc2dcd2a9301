//! Mocked entities for tests: an in-memory transport and canned device frames.

mod transport;

pub use transport::MockTransport;

use crate::io::codec::encode_ascii_pairs;
use crate::io::constants::{END_SYSEX, REPORT_FIRMWARE, START_SYSEX};
use crate::io::{Client, ClientOptions};

/// REPORT_FIRMWARE frame announcing "Mock v2.5".
pub fn firmware_frame() -> Vec<u8> {
    let mut frame = vec![START_SYSEX, REPORT_FIRMWARE, 0x02, 0x05];
    frame.extend(encode_ascii_pairs("Mock"));
    frame.push(END_SYSEX);
    frame
}

/// A started client over a fresh [`MockTransport`], with the host writes of the start sequence
/// already cleared.
pub async fn started_client() -> (Client, MockTransport) {
    started_client_with_options(ClientOptions::default()).await
}

pub async fn started_client_with_options(options: ClientOptions) -> (Client, MockTransport) {
    let transport = MockTransport::new();
    transport.push(&firmware_frame());
    let client = Client::with_options(transport.clone(), options);
    if let Err(error) = client.start().await {
        panic!("Mock client failed to start: {}", error);
    }
    transport.take_written();
    (client, transport)
}
