//! Chunk codec: fixed-size splitting, transport-safe text, ordered joining.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::TransferError;

/// One fixed-size slice of a larger buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSlice<'a> {
    pub index: usize,
    /// Offset of the first byte.
    pub start: u64,
    /// Offset one past the last byte.
    pub end: u64,
    pub data: &'a [u8],
}

/// Split `bytes` into consecutive chunks of at most `chunk_size` bytes.
///
/// An empty buffer yields no chunks.
///
/// # Panics
///
/// Panics if `chunk_size` is zero.
pub fn split(bytes: &[u8], chunk_size: usize) -> impl Iterator<Item = ChunkSlice<'_>> {
    assert!(chunk_size > 0, "chunk size must be positive");
    bytes
        .chunks(chunk_size)
        .enumerate()
        .map(move |(index, data)| {
            let start = (index * chunk_size) as u64;
            ChunkSlice {
                index,
                start,
                end: start + data.len() as u64,
                data,
            }
        })
}

/// Number of chunks needed to cover `total` bytes.
#[must_use]
pub fn chunk_count(total: u64, chunk_size: u64) -> u64 {
    total.div_ceil(chunk_size.max(1))
}

/// Encode bytes as transport-safe text.
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode transport-safe text.
///
/// # Errors
///
/// Returns a protocol error if the text is not valid base64.
pub fn decode(text: &str) -> Result<Vec<u8>, TransferError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| TransferError::Protocol(format!("invalid chunk encoding: {e}")))
}

/// Concatenate resolved chunks in index order.
///
/// The slots must cover `[0, n)` with no gaps. Arrival order does not matter:
/// callers store each payload at its own index.
///
/// # Errors
///
/// Returns a resource error if the plan is empty or any index is missing.
pub fn join(slots: Vec<Option<Vec<u8>>>) -> Result<Vec<u8>, TransferError> {
    if slots.is_empty() {
        return Err(TransferError::ResourceExhaustion(
            "no chunks to assemble".to_string(),
        ));
    }
    if let Some(missing) = slots.iter().position(Option::is_none) {
        return Err(TransferError::ResourceExhaustion(format!(
            "chunk {missing} of {} never resolved",
            slots.len()
        )));
    }

    let total = slots.iter().flatten().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    for part in slots.into_iter().flatten() {
        out.extend_from_slice(&part);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_offsets_are_contiguous() {
        let data: Vec<u8> = (0..=255).collect();
        let chunks: Vec<_> = split(&data, 100).collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 100));
        assert_eq!((chunks[1].start, chunks[1].end), (100, 200));
        assert_eq!((chunks[2].start, chunks[2].end), (200, 256));
        assert_eq!(chunks[2].index, 2);
    }

    #[test]
    fn test_split_empty_yields_nothing() {
        assert_eq!(split(&[], 10).count(), 0);
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 10), 0);
        assert_eq!(chunk_count(1, 10), 1);
        assert_eq!(chunk_count(10, 10), 1);
        assert_eq!(chunk_count(11, 10), 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode("not base64!!"),
            Err(TransferError::Protocol(_))
        ));
        assert_eq!(decode(&encode(b"hello")).unwrap(), b"hello");
    }

    #[test]
    fn test_join_reports_gap() {
        let err = join(vec![Some(vec![1]), None, Some(vec![3])]).unwrap_err();
        assert!(err.to_string().contains("chunk 1 of 3"));
    }

    #[test]
    fn test_join_empty_plan() {
        assert!(matches!(
            join(Vec::new()),
            Err(TransferError::ResourceExhaustion(_))
        ));
    }
}
