use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use flate2::bufread::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::ProtocolError;
use crate::util::buf_ext::BufExt;

pub const COMPRESSION_LEVEL: u32 = 7;

/// Upper bound for a decompressed batch - anything bigger is treated as a decompression bomb
pub const MAX_DECOMPRESSED_LEN: usize = 8 * 1024 * 1024;

/// Writes each message with a var-int length prefix and compresses the result with raw
///  deflate
pub fn encode_batch(messages: &[Bytes]) -> anyhow::Result<Vec<u8>> {
    let mut raw = BytesMut::with_capacity(messages.iter().map(|m| m.len() + 5).sum());
    for msg in messages {
        raw.put_u32_varint(msg.len() as u32);
        raw.extend_from_slice(msg);
    }

    let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw.len() / 2 + 16), Compression::new(COMPRESSION_LEVEL));
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

/// Decompresses a batch and splits it into its messages.
///
/// Bytes after the end of the deflate stream, and bytes after the last complete message, are
///  both malformed: they mean that the peer's encoder does not match ours.
pub fn decode_batch(compressed: &[u8]) -> anyhow::Result<Vec<Bytes>> {
    let mut decoder = DeflateDecoder::new(compressed);
    let mut raw = Vec::new();
    (&mut decoder).take(MAX_DECOMPRESSED_LEN as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| ProtocolError::malformed(format!("invalid deflate stream: {}", e)))?;

    if raw.len() > MAX_DECOMPRESSED_LEN {
        return Err(ProtocolError::PayloadTooLarge { len: raw.len(), limit: MAX_DECOMPRESSED_LEN }.into());
    }

    let unconsumed = decoder.into_inner();
    if !unconsumed.is_empty() {
        return Err(ProtocolError::malformed(format!("{} trailing bytes after the compressed batch", unconsumed.len())));
    }

    let mut buf = Bytes::from(raw);
    let mut messages = Vec::new();
    while !buf.is_empty() {
        let len = buf.get_var_u32_checked()? as usize;
        messages.push(buf.get_bytes_checked(len)?);
    }
    Ok(messages)
}
