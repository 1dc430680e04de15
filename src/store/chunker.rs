//! Content-defined chunking
//!
//! Splits a byte stream at offsets chosen by a multiplicative rolling hash over a
//! fixed window, so an edit only disturbs the chunks that touch it.

/// Rolling hash window length in bytes
pub const WINDOW: usize = 32;
/// Rolling hash base
pub const BASE: u64 = 31;
/// No boundary before this many bytes into a chunk
pub const MIN_CHUNK: usize = 2048;
/// Boundary when `hash % TARGET_CHUNK == 1`
pub const TARGET_CHUNK: u64 = 4096;
/// Unconditional boundary at this length
pub const MAX_CHUNK: usize = 8192;

/// Rabin-Karp style chunker with a precomputed byte-weight table
#[derive(Debug, Clone)]
pub struct Chunker {
    /// `weights[b] = b * BASE^(WINDOW-1)`, the contribution of a byte leaving the window
    weights: [u64; 256],
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunker {
    pub fn new() -> Self {
        let mut top = 1u64;
        for _ in 0..WINDOW - 1 {
            top = top.wrapping_mul(BASE);
        }
        let mut weights = [0u64; 256];
        for (byte, weight) in weights.iter_mut().enumerate() {
            *weight = (byte as u64).wrapping_mul(top);
        }
        Chunker { weights }
    }

    /// Length of the next chunk at the start of `buf`
    pub fn next_boundary(&self, buf: &[u8]) -> usize {
        let mut hash = 0u64;
        let mut off = 0usize;

        while off < WINDOW && off < buf.len() {
            hash = hash.wrapping_mul(BASE).wrapping_add(buf[off] as u64);
            off += 1;
        }

        while off < buf.len() {
            hash = hash
                .wrapping_sub(self.weights[buf[off - WINDOW] as usize])
                .wrapping_mul(BASE)
                .wrapping_add(buf[off] as u64);
            off += 1;

            if (off >= MIN_CHUNK && hash % TARGET_CHUNK == 1) || off >= MAX_CHUNK {
                return off;
            }
        }
        off
    }

    /// Split `data` into consecutive chunks covering it exactly
    pub fn chunks<'a>(&'a self, data: &'a [u8]) -> Chunks<'a> {
        Chunks {
            chunker: self,
            data,
            offset: 0,
        }
    }

    /// Boundary offsets (exclusive ends) for `data`
    pub fn boundaries(&self, data: &[u8]) -> Vec<usize> {
        let mut ends = Vec::new();
        let mut offset = 0;
        for chunk in self.chunks(data) {
            offset += chunk.len();
            ends.push(offset);
        }
        ends
    }
}

/// Iterator over the chunks of a buffer
pub struct Chunks<'a> {
    chunker: &'a Chunker,
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.offset..];
        let len = self.chunker.next_boundary(rest);
        self.offset += len;
        Some(&rest[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn test_empty_input_has_no_chunks() {
        let chunker = Chunker::new();
        assert_eq!(chunker.chunks(&[]).count(), 0);
    }

    #[test]
    fn test_short_input_is_single_chunk() {
        let chunker = Chunker::new();
        let data = b"hi";
        let chunks: Vec<&[u8]> = chunker.chunks(data).collect();
        assert_eq!(chunks, vec![&data[..]]);
    }

    #[test]
    fn test_chunk_sizes_respect_bounds() {
        let chunker = Chunker::new();
        let data = pseudo_random(200_000, 7);
        let chunks: Vec<&[u8]> = chunker.chunks(&data).collect();
        assert!(chunks.len() > 1);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= MIN_CHUNK, "chunk too small: {}", chunk.len());
            assert!(chunk.len() <= MAX_CHUNK, "chunk too large: {}", chunk.len());
        }
    }

    #[test]
    fn test_uniform_input_splits_at_max() {
        let chunker = Chunker::new();
        let data = vec![0u8; MAX_CHUNK * 3];
        let boundaries = chunker.boundaries(&data);
        assert_eq!(boundaries, vec![MAX_CHUNK, MAX_CHUNK * 2, MAX_CHUNK * 3]);
    }

    #[test]
    fn test_insertion_only_disturbs_nearby_chunks() {
        let chunker = Chunker::new();
        let original = pseudo_random(256 * 1024, 42);
        let mut edited = original.clone();
        let middle = original.len() / 2;
        edited.insert(middle, 0xAB);

        let before: Vec<&[u8]> = chunker.chunks(&original).collect();
        let after: Vec<&[u8]> = chunker.chunks(&edited).collect();

        let shared_prefix = before
            .iter()
            .zip(after.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let shared_suffix = before
            .iter()
            .rev()
            .zip(after.iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        let changed_before = before.len() - shared_prefix - shared_suffix;
        assert!(shared_prefix > 0);
        assert!(shared_suffix > 0);
        assert!(
            changed_before <= 8,
            "insertion rewrote {} of {} chunks",
            changed_before,
            before.len()
        );
    }

    proptest! {
        #[test]
        fn prop_chunks_partition_input(data in proptest::collection::vec(any::<u8>(), 0..40_000)) {
            let chunker = Chunker::new();
            let joined: Vec<u8> = chunker.chunks(&data).flatten().copied().collect();
            prop_assert_eq!(joined, data.clone());
            let again: Vec<usize> = chunker.boundaries(&data);
            prop_assert_eq!(again, chunker.boundaries(&data));
        }
    }
}
