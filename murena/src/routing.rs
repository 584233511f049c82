//! Token calculation and the token ring used for token-aware routing.

use std::num::Wrapping;

use bytes::Buf;
use uuid::Uuid;

/// A token on the Murmur3 ring, identifying the owner of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token {
    value: i64,
}

impl Token {
    pub fn new(value: i64) -> Self {
        Token { value }
    }

    pub fn value(self) -> i64 {
        self.value
    }
}

/// Streaming Murmur3 hasher matching Cassandra's partitioner variant
/// (signed-byte arithmetic included).
///
/// The algorithm consumes input 16 bytes at a time; a small internal
/// buffer bridges chunk boundaries so that composite partition keys
/// can be fed piecewise.
pub(crate) struct Murmur3PartitionerHasher {
    total_len: usize,
    buf: [u8; Self::BUF_CAPACITY],
    h1: Wrapping<i64>,
    h2: Wrapping<i64>,
}

impl Murmur3PartitionerHasher {
    const BUF_CAPACITY: usize = 16;

    const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
    const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

    pub(crate) fn new() -> Self {
        Self {
            total_len: 0,
            buf: Default::default(),
            h1: Wrapping(0),
            h2: Wrapping(0),
        }
    }

    pub(crate) fn hash_one(data: &[u8]) -> Token {
        let mut hasher = Self::new();
        hasher.write(data);
        hasher.finish()
    }

    fn hash_16_bytes(&mut self, mut k1: Wrapping<i64>, mut k2: Wrapping<i64>) {
        k1 *= Self::C1;
        k1 = Self::rotl64(k1, 31);
        k1 *= Self::C2;
        self.h1 ^= k1;

        self.h1 = Self::rotl64(self.h1, 27);
        self.h1 += self.h2;
        self.h1 = self.h1 * Wrapping(5) + Wrapping(0x52dce729);

        k2 *= Self::C2;
        k2 = Self::rotl64(k2, 33);
        k2 *= Self::C1;
        self.h2 ^= k2;

        self.h2 = Self::rotl64(self.h2, 31);
        self.h2 += self.h1;
        self.h2 = self.h2 * Wrapping(5) + Wrapping(0x38495ab5);
    }

    fn fetch_16_bytes_from_buf(buf: &mut &[u8]) -> (Wrapping<i64>, Wrapping<i64>) {
        let k1 = Wrapping(buf.get_i64_le());
        let k2 = Wrapping(buf.get_i64_le());
        (k1, k2)
    }

    #[inline]
    fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
        Wrapping((v.0 << n) | (v.0 as u64 >> (64 - n)) as i64)
    }

    #[inline]
    fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k *= Wrapping(0xff51afd7ed558ccd_u64 as i64);
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k *= Wrapping(0xc4ceb9fe1a85ec53_u64 as i64);
        k ^= Wrapping((k.0 as u64 >> 33) as i64);

        k
    }

    pub(crate) fn write(&mut self, mut pk_part: &[u8]) {
        let mut buf_len = self.total_len % Self::BUF_CAPACITY;
        self.total_len += pk_part.len();

        // If the buffer is nonempty and can be filled completely, fill it,
        // hash its contents and empty it.
        if buf_len > 0 && Self::BUF_CAPACITY - buf_len <= pk_part.len() {
            let to_write = Ord::min(Self::BUF_CAPACITY - buf_len, pk_part.len());
            self.buf[buf_len..buf_len + to_write].copy_from_slice(&pk_part[..to_write]);
            pk_part.advance(to_write);
            buf_len += to_write;

            debug_assert_eq!(buf_len, Self::BUF_CAPACITY);
            let mut buf_ptr = &self.buf[..];
            let (k1, k2) = Self::fetch_16_bytes_from_buf(&mut buf_ptr);
            debug_assert!(buf_ptr.is_empty());
            self.hash_16_bytes(k1, k2);
            buf_len = 0;
        }

        // With an empty buffer, further data can be hashed directly
        // from the input.
        if buf_len == 0 {
            while pk_part.len() >= Self::BUF_CAPACITY {
                let (k1, k2) = Self::fetch_16_bytes_from_buf(&mut pk_part);
                self.hash_16_bytes(k1, k2);
            }
        }

        // Move remaining bytes to the buffer.
        debug_assert!(pk_part.len() < Self::BUF_CAPACITY - buf_len);
        let to_write = pk_part.len();
        self.buf[buf_len..buf_len + to_write].copy_from_slice(&pk_part[..to_write]);
        pk_part.advance(to_write);
        buf_len += to_write;
        debug_assert!(pk_part.is_empty());

        debug_assert!(buf_len < Self::BUF_CAPACITY);
    }

    pub(crate) fn finish(&self) -> Token {
        let mut h1 = self.h1;
        let mut h2 = self.h2;

        let mut k1 = Wrapping(0_i64);
        let mut k2 = Wrapping(0_i64);

        let buf_len = self.total_len % Self::BUF_CAPACITY;

        if buf_len > 8 {
            for i in (8..buf_len).rev() {
                k2 ^= Wrapping(self.buf[i] as i8 as i64) << ((i - 8) * 8);
            }

            k2 *= Self::C2;
            k2 = Self::rotl64(k2, 33);
            k2 *= Self::C1;
            h2 ^= k2;
        }

        if buf_len > 0 {
            for i in (0..std::cmp::min(8, buf_len)).rev() {
                k1 ^= Wrapping(self.buf[i] as i8 as i64) << (i * 8);
            }

            k1 *= Self::C1;
            k1 = Self::rotl64(k1, 31);
            k1 *= Self::C2;
            h1 ^= k1;
        }

        h1 ^= Wrapping(self.total_len as i64);
        h2 ^= Wrapping(self.total_len as i64);

        h1 += h2;
        h2 += h1;

        h1 = Self::fmix(h1);
        h2 = Self::fmix(h2);

        h1 += h2;

        Token::new(h1.0)
    }
}

/// An immutable snapshot of token ownership: which host owns which
/// token range.
///
/// Only the primary replica of a token is tracked; full replica sets
/// would require keyspace replication settings, which the driver does
/// not fetch.
#[derive(Debug, Clone, Default)]
pub(crate) struct TokenRing {
    // Sorted by token.
    ring: Vec<(Token, Uuid)>,
}

impl TokenRing {
    pub(crate) fn new(mut entries: Vec<(Token, Uuid)>) -> Self {
        entries.sort_unstable_by_key(|(token, _)| *token);
        TokenRing { ring: entries }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// The host owning the given token: the one with the smallest ring
    /// token >= `token`, wrapping around to the start of the ring.
    pub(crate) fn owner(&self, token: Token) -> Option<Uuid> {
        if self.ring.is_empty() {
            return None;
        }
        let idx = self.ring.partition_point(|(t, _)| *t < token);
        let (_, host) = self.ring[idx % self.ring.len()];
        Some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_correct_murmur3_hash(pk: &'static str, expected_hash: i64) {
        let hash = Murmur3PartitionerHasher::hash_one(pk.as_bytes()).value();
        assert_eq!(hash, expected_hash);
    }

    #[test]
    fn murmur3_known_hashes() {
        for s in [
            ("test", -6017608668500074083),
            ("xd", 4507812186440344727),
            ("primary_key", -1632642444691073360),
            ("kremówki", 4354931215268080151),
        ] {
            assert_correct_murmur3_hash(s.0, s.1);
        }
    }

    #[test]
    fn murmur3_chunked_input_matches_single_write() {
        let data = "Ala ma kota, a kota ma Ala. Duzo wiecej niz szesnascie bajtow.".as_bytes();
        let whole = Murmur3PartitionerHasher::hash_one(data);

        for pivot in [1, 7, 15, 16, 17, 40, data.len() - 1] {
            let mut hasher = Murmur3PartitionerHasher::new();
            let (a, b) = data.split_at(pivot);
            hasher.write(a);
            hasher.write(b);
            assert_eq!(hasher.finish(), whole);
        }
    }

    #[test]
    fn token_ring_ownership_wraps_around() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ring = TokenRing::new(vec![(Token::new(0), a), (Token::new(1000), b)]);

        assert_eq!(ring.owner(Token::new(-5)), Some(a));
        assert_eq!(ring.owner(Token::new(0)), Some(a));
        assert_eq!(ring.owner(Token::new(1)), Some(b));
        assert_eq!(ring.owner(Token::new(1000)), Some(b));
        // Beyond the last token the ring wraps to its first entry.
        assert_eq!(ring.owner(Token::new(1001)), Some(a));
    }

    #[test]
    fn empty_ring_owns_nothing() {
        let ring = TokenRing::default();
        assert!(ring.owner(Token::new(42)).is_none());
    }
}
