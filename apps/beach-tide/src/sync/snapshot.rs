use std::fmt;

use bytes::Bytes;
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotHash([u8; 32]);

impl SnapshotHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// First eight hex digits, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for SnapshotHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotHash({})", self.short())
    }
}

impl fmt::Display for SnapshotHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Opaque serialized scrollback as returned by the host. Written to the
/// display verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    data: Bytes,
    hash: SnapshotHash,
}

impl Snapshot {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let hash = SnapshotHash::of(&data);
        Self { data, hash }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash(&self) -> SnapshotHash {
        self.hash
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tracks_content() {
        let a = Snapshot::new(b"a.txt\n".to_vec());
        let b = Snapshot::new(Bytes::from_static(b"a.txt\n"));
        let c = Snapshot::new(b"a.txt\nb.txt\n".to_vec());
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash().short().len(), 8);
        assert_eq!(a.hash().to_string().len(), 64);
    }
}
