//! Kademlia node Id or a lookup target
use std::convert::TryInto;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target.
///
/// Also used as the inclusive bounds of a bucket range, interpreted as a
/// 160-bit big-endian unsigned integer.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// The smallest possible Id (the lower bound of the full table range).
    pub const MIN: Id = Id([0u8; ID_SIZE]);
    /// The largest possible Id (the upper bound of the full table range).
    pub const MAX: Id = Id([0xffu8; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();
        let tmp: [u8; ID_SIZE] = bytes.try_into().map_err(|_| InvalidIdSize(bytes.len()))?;

        Ok(Id(tmp))
    }

    /// Map an application key to its 160-bit lookup target (sha1 digest).
    pub fn for_key<T: AsRef<[u8]>>(key: T) -> Id {
        let digest = sha1_smol::Sha1::from(key.as_ref()).digest();

        Id(digest.bytes())
    }

    /// XOR distance between this Id and a target Id, compared as a
    /// big-endian unsigned integer.
    ///
    /// Distance to self is zero, and `a.xor(b) == b.xor(a)`.
    pub fn xor(&self, other: &Id) -> Distance {
        let mut result = [0u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(result)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq)]
/// XOR distance between two [Id]s, ordered as a 160-bit big-endian unsigned integer.
pub struct Distance(pub [u8; ID_SIZE]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_SIZE]);
}

/// The arithmetic midpoint `(lo + hi) / 2` of an inclusive bucket range.
pub fn midpoint(lo: &Id, hi: &Id) -> Id {
    // 161-bit addition, then a right shift by one.
    let mut sum = [0u8; ID_SIZE];
    let mut carry = 0u16;

    for i in (0..ID_SIZE).rev() {
        let total = lo.0[i] as u16 + hi.0[i] as u16 + carry;
        sum[i] = (total & 0xff) as u8;
        carry = total >> 8;
    }

    let mut out = [0u8; ID_SIZE];
    let mut high_bit = (carry & 1) as u8;

    for i in 0..ID_SIZE {
        out[i] = (sum[i] >> 1) | (high_bit << 7);
        high_bit = sum[i] & 1;
    }

    Id(out)
}

/// `id + 1`, saturating at [Id::MAX].
pub fn successor(id: &Id) -> Id {
    let mut out = id.0;

    for byte in out.iter_mut().rev() {
        let (sum, overflow) = byte.overflowing_add(1);
        *byte = sum;
        if !overflow {
            return Id(out);
        }
    }

    Id::MAX
}

/// A uniformly random Id within the inclusive range `[lo, hi]`.
///
/// Bucket ranges always come from repeated halving of the full space, so
/// `lo` and `hi` share a bit prefix and differ in every bit below it;
/// keeping the prefix and randomizing the rest stays in range.
pub fn random_in_range(lo: &Id, hi: &Id) -> Id {
    let random = Id::random();
    let prefix_bits = shared_prefix_bits(&[*lo, *hi]);

    let mut out = [0u8; ID_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        let bits = prefix_bits.saturating_sub(i * 8).min(8);
        let mask = if bits == 0 {
            0
        } else {
            0xffu8 << (8 - bits as u8)
        };
        *byte = (lo.0[i] & mask) | (random.0[i] & !mask);
    }

    let id = Id(out);
    if &id < lo {
        *lo
    } else if &id > hi {
        *hi
    } else {
        id
    }
}

/// Length in bits of the longest common prefix shared by all given ids.
pub fn shared_prefix_bits(ids: &[Id]) -> usize {
    let first = match ids.first() {
        Some(first) => first,
        None => return 0,
    };

    for bit in 0..ID_SIZE * 8 {
        let byte = bit / 8;
        let mask = 0x80u8 >> (bit % 8);
        let reference = first.0[byte] & mask;

        if ids.iter().any(|id| id.0[byte] & mask != reference) {
            return bit;
        }
    }

    ID_SIZE * 8
}

#[derive(thiserror::Error, Debug)]
#[error("Expected {ID_SIZE} bytes, got {0}")]
pub struct InvalidIdSize(pub usize);

#[derive(thiserror::Error, Debug)]
#[error("Invalid hex Id: {0}")]
pub struct InvalidIdHex(String);

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({:x?})", &self.0)
    }
}

impl FromStr for Id {
    type Err = InvalidIdHex;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_SIZE * 2 {
            return Err(InvalidIdHex(s.into()));
        }

        let mut bytes = [0u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte =
                u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| InvalidIdHex(s.into()))?;
        }

        Ok(Id(bytes))
    }
}
