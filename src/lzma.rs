//! XZ chunk decoding using xz2::Stream.
//!
//! PBZX chunks are complete XZ frames of known decoded size, so this is a
//! one-shot buffer-to-buffer decode rather than a streaming state machine.

use xz2::stream::{Action, Status, Stream};

use crate::error::{Error, Result};

fn decode_error(reason: impl Into<String>) -> Error {
    Error::Decode {
        codec: "xz",
        reason: reason.into(),
    }
}

/// Decode one complete XZ stream into a buffer of exactly
/// `decompressed_size` bytes.
///
/// Errors if the stream is malformed, ends early, or produces any other
/// amount of output.
pub fn decompress_chunk(input: &[u8], decompressed_size: usize) -> Result<Box<[u8]>> {
    let mut stream =
        Stream::new_stream_decoder(u64::MAX, 0).map_err(|e| decode_error(e.to_string()))?;

    let mut output = vec![0u8; decompressed_size];
    let mut in_pos = 0usize;
    let mut out_pos = 0usize;

    loop {
        let before_in = stream.total_in();
        let before_out = stream.total_out();
        let status = stream
            .process(&input[in_pos..], &mut output[out_pos..], Action::Run)
            .map_err(|e| decode_error(e.to_string()))?;
        in_pos += (stream.total_in() - before_in) as usize;
        out_pos += (stream.total_out() - before_out) as usize;

        match status {
            Status::StreamEnd => break,
            Status::Ok => {
                if stream.total_in() == before_in && stream.total_out() == before_out {
                    return Err(decode_error("truncated chunk stream"));
                }
            }
            Status::GetCheck | Status::MemNeeded => {
                return Err(decode_error("unexpected decoder state"));
            }
        }
    }

    if out_pos != decompressed_size {
        return Err(decode_error(format!(
            "chunk decoded to {out_pos} bytes, record declares {decompressed_size}"
        )));
    }
    Ok(output.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::new();
        xz2::read::XzEncoder::new(data, 6)
            .read_to_end(&mut encoded)
            .unwrap();
        encoded
    }

    #[test]
    fn round_trip() {
        let payload: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let encoded = compress(&payload);
        let decoded = decompress_chunk(&encoded, payload.len()).unwrap();
        assert_eq!(&*decoded, &payload[..]);
    }

    #[test]
    fn wrong_declared_size_is_an_error() {
        let encoded = compress(b"some chunk payload");
        assert!(decompress_chunk(&encoded, 4).is_err());
        assert!(decompress_chunk(&encoded, 64).is_err());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let encoded = compress(&[7u8; 4096]);
        assert!(decompress_chunk(&encoded[..encoded.len() / 2], 4096).is_err());
    }
}
