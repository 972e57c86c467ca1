use bytes::Bytes;
use cid::Cid;

/// An immutable chunk of bytes together with the `Cid` that addresses it.
///
/// Cloning is cheap, the payload is reference counted and shared between the
/// store, the decision engine and every session that receives it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl Block {
    pub fn new(data: Bytes, cid: Cid) -> Self {
        Self { cid, data }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use multihash::Multihash;
    use sha2::{Digest, Sha256};

    use super::*;

    const RAW: u64 = 0x55;
    const SHA2_256: u64 = 0x12;

    /// Builds a raw (`0x55`) v1 block addressed by the sha2-256 of its content.
    pub fn create_block<B: Into<Bytes>>(bytes: B) -> Block {
        let bytes = bytes.into();
        let digest = Sha256::digest(&bytes);
        let hash = Multihash::<64>::wrap(SHA2_256, &digest).expect("digest fits");
        let cid = Cid::new_v1(RAW, hash);
        Block::new(bytes, cid)
    }

    /// Generates `n` distinct blocks.
    pub fn create_blocks(n: usize) -> Vec<Block> {
        (0..n)
            .map(|i| create_block(format!("block-{i}-{}", rand::random::<u64>())))
            .collect()
    }
}
