use std::cmp::Ordering;
use std::fmt;

/// An opaque hash digest. Carries no knowledge of which [`crate::Hasher`]
/// produced it - the aggregator and CLI only ever compare and print it.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Digest(Box<[u8]>);

impl Digest {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::LowerHex for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

/// One `(offset, size, hash)` entry of a file's signature.
///
/// Records are totally ordered by `offset`; two records with equal offset
/// never coexist by construction (one block owns each offset).
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Record {
    pub offset: u64,
    pub size: u32,
    pub hash: Digest,
}

impl Record {
    pub fn new(offset: u64, size: u32, hash: Digest) -> Self {
        Self { offset, size, hash }
    }

    /// The offset immediately past this record's range.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size as u64
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset.cmp(&other.offset)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}:0x{:x}:{}", self.offset, self.size, self.hash)
    }
}
