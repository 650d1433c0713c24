//! Payload decompression ahead of parsing.

use std::io::Read;

use agent_clap_blocks::kinesis::ContentEncoding;
use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to decode {encoding:?} payload: {source}")]
pub struct DecodeError {
    encoding: ContentEncoding,
    #[source]
    source: std::io::Error,
}

/// Undo the producer-side compression of a record payload.
pub fn decode(encoding: ContentEncoding, payload: &Bytes) -> Result<Bytes, DecodeError> {
    let mut out = Vec::new();
    let res = match encoding {
        ContentEncoding::Identity => return Ok(payload.clone()),
        ContentEncoding::Gzip => MultiGzDecoder::new(payload.as_ref()).read_to_end(&mut out),
        ContentEncoding::Zlib => ZlibDecoder::new(payload.as_ref()).read_to_end(&mut out),
    };
    res.map(|_| Bytes::from(out))
        .map_err(|source| DecodeError { encoding, source })
}
