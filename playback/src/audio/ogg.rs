//! Just enough Ogg (RFC 3533) to split the encoder's stdout into packets.
//!
//! The encoder emits Opus framed in Ogg pages; the voice transport wants
//! bare Opus packets. Pages are parsed structurally (capture pattern,
//! segment table, lacing values); CRC is not checked, the stream comes from
//! a local pipe.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const HEADER_LEN: usize = 27;

pub struct PacketReader<R> {
    reader: R,
    /// Tail of a packet continued onto the next page.
    partial: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            partial: Vec::new(),
        }
    }

    /// The complete packets of the next page holding any; `None` at EOF.
    pub async fn next_packets(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        loop {
            let mut header = [0u8; HEADER_LEN];
            match self.reader.read_exact(&mut header).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }

            if &header[0..4] != CAPTURE_PATTERN {
                return Err(Error::Other(anyhow::anyhow!(
                    "ogg capture pattern missing, stream out of sync"
                )));
            }

            let mut lacing = vec![0u8; header[26] as usize];
            self.reader.read_exact(&mut lacing).await?;

            let body_len = lacing.iter().map(|&l| usize::from(l)).sum();
            let mut body = vec![0u8; body_len];
            self.reader.read_exact(&mut body).await?;

            let packets = split_packets(&lacing, &body, &mut self.partial);
            if !packets.is_empty() {
                return Ok(Some(packets));
            }
            // page ended mid-packet, keep reading
        }
    }
}

/// Chain lacing values into packets: every value below 255 terminates one,
/// a trailing 255 carries the accumulated bytes over to the next page.
fn split_packets(lacing: &[u8], body: &[u8], partial: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut offset = 0usize;
    for &lace in lacing {
        let len = usize::from(lace);
        partial.extend_from_slice(&body[offset..offset + len]);
        offset += len;
        if lace < 255 {
            packets.push(std::mem::take(partial));
        }
    }
    packets
}
