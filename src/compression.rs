use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("codec error: {0}")]
    Codec(#[from] std::io::Error),

    #[error("unexpected decompressed size: got {got}, expected {expected}")]
    Size { got: usize, expected: usize },
}

/// Compress a contiguous point buffer.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    Ok(zstd::bulk::compress(data, zstd::DEFAULT_COMPRESSION_LEVEL)?)
}

/// Decompress a chunk payload whose decompressed size is known from the
/// chunk envelope. A size mismatch means the payload is corrupt.
pub fn decompress(data: &[u8], expected: usize) -> Result<Vec<u8>, CompressionError> {
    let out = zstd::bulk::decompress(data, expected)?;

    if out.len() != expected {
        return Err(CompressionError::Size {
            got: out.len(),
            expected,
        });
    }

    Ok(out)
}
