// Copyright 2025 The rfbserver Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Zlib encoding: translated pixels through a persistent deflate stream.
//!
//! One stream lives per client for the whole connection, flushed with
//! `Z_SYNC_FLUSH` after every rectangle so the dictionary keeps improving
//! across updates. The payload is a 4-byte big-endian length followed by
//! the compressed bytes.

use bytes::{BufMut, BytesMut};
use flate2::{Compress, FlushCompress, Status};
use std::io;

/// Runs `input` through a persistent compressor with a sync flush,
/// returning every byte the stream produced for it.
///
/// # Errors
///
/// Returns an error when the deflate stream reports a failure or stops
/// making progress before consuming all input.
pub fn compress_sync(compressor: &mut Compress, input: &[u8]) -> io::Result<Vec<u8>> {
    let mut output = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];

    let start_in = compressor.total_in();
    let start_out = compressor.total_out();

    loop {
        let consumed_before = (compressor.total_in() - start_in) as usize;
        let produced_before = (compressor.total_out() - start_out) as usize;

        let status = compressor
            .compress(&input[consumed_before..], &mut chunk, FlushCompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let produced = (compressor.total_out() - start_out) as usize - produced_before;
        output.extend_from_slice(&chunk[..produced]);

        let consumed = (compressor.total_in() - start_in) as usize;
        match status {
            Status::Ok => {
                // A sync flush is complete once all input is consumed and
                // the stream had room to emit its flush marker.
                if consumed >= input.len() && produced < chunk.len() {
                    break;
                }
            }
            Status::BufError => {
                if consumed >= input.len() && produced == 0 {
                    break;
                }
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "deflate stream stopped making progress",
                ));
            }
            Status::StreamEnd => break,
        }
    }

    let consumed = (compressor.total_in() - start_in) as usize;
    if consumed != input.len() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("deflate consumed {}/{} bytes", consumed, input.len()),
        ));
    }

    Ok(output)
}

/// Encodes translated pixel bytes for the Zlib encoding.
///
/// # Errors
///
/// Propagates compression failures; the caller abandons the update.
pub fn encode_zlib_persistent(data: &[u8], compressor: &mut Compress) -> io::Result<Vec<u8>> {
    let compressed = compress_sync(compressor, data)?;

    let mut result = BytesMut::with_capacity(4 + compressed.len());
    result.put_u32(compressed.len() as u32);
    result.extend_from_slice(&compressed);
    Ok(result.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, Decompress, FlushDecompress};

    fn inflate(stream: &mut Decompress, data: &[u8], expected_len: usize) -> Vec<u8> {
        let mut out = vec![0u8; expected_len + 64];
        let before = stream.total_out();
        stream
            .decompress(data, &mut out, FlushDecompress::Sync)
            .unwrap();
        let produced = (stream.total_out() - before) as usize;
        out.truncate(produced);
        out
    }

    #[test]
    fn roundtrip_through_persistent_stream() {
        let mut compressor = Compress::new(Compression::new(6), true);
        let mut decompressor = Decompress::new(true);

        let first = vec![7u8; 4096];
        let encoded = encode_zlib_persistent(&first, &mut compressor).unwrap();
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - 4);
        assert_eq!(inflate(&mut decompressor, &encoded[4..], first.len()), first);

        // Second rectangle reuses the same stream and dictionary.
        let second: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let encoded = encode_zlib_persistent(&second, &mut compressor).unwrap();
        assert_eq!(inflate(&mut decompressor, &encoded[4..], second.len()), second);
    }

    #[test]
    fn incompressible_data_roundtrips() {
        let mut compressor = Compress::new(Compression::new(1), true);
        let mut decompressor = Decompress::new(true);

        // A pseudo-random buffer larger than the internal chunk size.
        let mut data = Vec::with_capacity(100_000);
        let mut state = 0x1234_5678u32;
        for _ in 0..100_000 {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            data.push((state >> 24) as u8);
        }

        let encoded = encode_zlib_persistent(&data, &mut compressor).unwrap();
        assert_eq!(inflate(&mut decompressor, &encoded[4..], data.len()), data);
    }
}
