//! Blocked bloom filter over primary keys, one per RowGroup.
//!
//! The filter is split into 64-byte (512-bit) blocks so that every
//! membership probe touches a single cache line: the upper 32 bits of
//! the key hash select the block, and 7 derived bit positions inside
//! that block are tested. Sizing is 12 bits per key, rounded up to a
//! whole number of blocks.
//!
//! The serialized form is the raw block bytes — readers wrap a borrowed
//! slice with [`BloomFilter::new`] with no decoding step, which is what
//! lets the SSTable reader probe filters straight out of the memory
//! map.

#[cfg(test)]
mod tests;

/// Probes per key.
const NUM_PROBES: usize = 7;

/// Bytes per block — one cache line.
const BLOCK_BYTES: usize = 64;

/// Bits reserved per key when sizing a filter.
const BITS_PER_KEY: usize = 12;

fn hash_key(key: &[u8]) -> u64 {
    farmhash::hash64(key)
}

/// Builder accumulating keys for one RowGroup's filter.
pub struct BloomFilterBuilder {
    data: Vec<u8>,
    num_blocks: usize,
}

impl BloomFilterBuilder {
    /// Size the filter for an expected number of keys.
    pub fn new(num_keys: usize) -> Self {
        let total_bits = num_keys.max(1) * BITS_PER_KEY;
        let num_blocks = total_bits.div_ceil(BLOCK_BYTES * 8);
        Self {
            data: vec![0u8; num_blocks * BLOCK_BYTES],
            num_blocks,
        }
    }

    /// Set the probe bits for `key`.
    pub fn add_key(&mut self, key: &[u8]) {
        let h = hash_key(key);
        let block_idx = ((h >> 32) as usize) % self.num_blocks;
        let block = &mut self.data[block_idx * BLOCK_BYTES..(block_idx + 1) * BLOCK_BYTES];

        let mut current = h as u32;
        let delta = current.rotate_right(17);
        for _ in 0..NUM_PROBES {
            let bit_pos = (current & 511) as usize;
            block[bit_pos / 8] |= 1 << (bit_pos % 8);
            current = current.wrapping_add(delta);
        }
    }

    /// Consume the builder, returning the serialized filter bytes.
    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// Read-side view over serialized filter bytes.
///
/// Invalid or empty data degrades to "maybe present" so a damaged
/// filter can never hide a key.
pub struct BloomFilter<'a> {
    data: &'a [u8],
    num_blocks: usize,
}

impl<'a> BloomFilter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let num_blocks = if data.is_empty() || data.len() % BLOCK_BYTES != 0 {
            0
        } else {
            data.len() / BLOCK_BYTES
        };
        Self { data, num_blocks }
    }

    /// `false` means the key is definitely absent; `true` means it may
    /// be present.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.num_blocks == 0 {
            return true;
        }

        let h = hash_key(key);
        let block_idx = ((h >> 32) as usize) % self.num_blocks;
        let block = &self.data[block_idx * BLOCK_BYTES..(block_idx + 1) * BLOCK_BYTES];

        let mut current = h as u32;
        let delta = current.rotate_right(17);
        for _ in 0..NUM_PROBES {
            let bit_pos = (current & 511) as usize;
            if block[bit_pos / 8] & (1 << (bit_pos % 8)) == 0 {
                return false;
            }
            current = current.wrapping_add(delta);
        }
        true
    }
}
