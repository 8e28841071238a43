//! Embedding blob layout: 2-byte little-endian vector count
//! (0 ≤ count < 65536), then `count × vector_size × 4` bytes of
//! little-endian IEEE-754 f32. Any other length is rejected.

use parley_core::constants::MAX_EMBEDDINGS_PER_DOC;
use parley_core::error::ParleyError;

/// Pack embedding vectors into the blob form. The caller has already
/// validated per-vector length against the docstore's vector size.
pub fn encode_embeddings(embeddings: &[Vec<f32>]) -> Result<Vec<u8>, ParleyError> {
    if embeddings.len() >= MAX_EMBEDDINGS_PER_DOC {
        return Err(ParleyError::TooManyEmbeddings { got: embeddings.len() });
    }

    let floats: usize = embeddings.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(2 + floats * 4);
    out.extend_from_slice(&(embeddings.len() as u16).to_le_bytes());
    for vector in embeddings {
        for value in vector {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    Ok(out)
}

/// Unpack a blob produced by [`encode_embeddings`].
pub fn decode_embeddings(blob: &[u8], vector_size: usize) -> Result<Vec<Vec<f32>>, ParleyError> {
    if blob.len() < 2 {
        return Err(ParleyError::BlobCorrupt(blob.len()));
    }
    let count = u16::from_le_bytes([blob[0], blob[1]]) as usize;
    let expected = 2 + count * vector_size * 4;
    if blob.len() != expected {
        return Err(ParleyError::BlobCorrupt(blob.len()));
    }

    let mut vectors = Vec::with_capacity(count);
    let mut offset = 2;
    for _ in 0..count {
        let mut vector = Vec::with_capacity(vector_size);
        for _ in 0..vector_size {
            let bytes: [u8; 4] = blob[offset..offset + 4]
                .try_into()
                .expect("bounds checked above");
            vector.push(f32::from_le_bytes(bytes));
            offset += 4;
        }
        vectors.push(vector);
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blob_decodes_to_no_vectors() {
        let blob = encode_embeddings(&[]).unwrap();
        assert_eq!(blob, vec![0, 0]);
        assert!(decode_embeddings(&blob, 3).unwrap().is_empty());
    }

    #[test]
    fn single_vector_round_trip_is_14_bytes() {
        let embeddings = vec![vec![1.0f32, -2.5, 0.25]];
        let blob = encode_embeddings(&embeddings).unwrap();
        assert_eq!(blob.len(), 2 + 12);
        assert_eq!(decode_embeddings(&blob, 3).unwrap(), embeddings);
    }

    #[test]
    fn multi_vector_round_trip() {
        let embeddings: Vec<Vec<f32>> =
            (0..17).map(|i| vec![i as f32, (i * 2) as f32]).collect();
        let blob = encode_embeddings(&embeddings).unwrap();
        assert_eq!(decode_embeddings(&blob, 2).unwrap(), embeddings);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let embeddings = vec![vec![1.0f32, 2.0, 3.0]];
        let mut blob = encode_embeddings(&embeddings).unwrap();
        blob.pop();
        let err = decode_embeddings(&blob, 3).unwrap_err();
        assert_eq!(err.code(), "blob-corrupt");
    }

    #[test]
    fn wrong_vector_size_is_rejected() {
        let embeddings = vec![vec![1.0f32, 2.0, 3.0]];
        let blob = encode_embeddings(&embeddings).unwrap();
        assert!(decode_embeddings(&blob, 4).is_err());
    }
}
