use crate::prelude::*;
use std::io::{Error, ErrorKind, Result};

/// Ceiling for a single JSON message read off a peer stream.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Read a Serde Deserialize from a futures::io::AsyncRead.
///
/// This is difficult because there is no framing other than JSON succeeding
/// to parse. All we can do, it seems, is to repeatedly try parsing and wait
/// for more content to arrive if it fails.
///
/// TODO: Remove once Serde gains async support.
/// See <https://github.com/serde-rs/json/issues/316>
pub async fn read_json<R, T>(io: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin + Send,
    T: for<'a> Deserialize<'a>,
{
    trace!("Attempting to read JSON from socket");
    let mut buffer = Vec::new();
    loop {
        // Read another (partial) block
        let mut block = [0_u8; 1024];
        let n = match io.read(&mut block).await {
            Ok(0) => Err(Error::new(
                ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading JSON.",
            )),
            r => r,
        }?;
        buffer.extend(&block[..n]);
        trace!("Read {} more bytes, total {} in buffer", n, buffer.len());

        // Try to parse
        match serde_json::de::from_slice::<T>(&buffer) {
            Err(e) if e.is_eof() => {
                if buffer.len() > MAX_MESSAGE_SIZE {
                    return Err(Error::new(ErrorKind::InvalidData, "JSON message too large"));
                }
                // Read some more
                continue;
            }
            Err(e) => {
                debug!("Could not parse: {}", String::from_utf8_lossy(&buffer));
                return Err(e.into());
            }
            Ok(value) => return Ok(value),
        }
    }
}
