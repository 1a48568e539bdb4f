//! Fixed-width keys and masks.

use std::net::{Ipv4Addr, Ipv6Addr};

/// A fixed-width bit string walked from the most significant bit down.
///
/// The same type doubles as the mask: a prefix of length `n` is a mask whose
/// first `n` bits are set. Walks stop at the first clear mask bit, so only
/// contiguous masks are meaningful.
pub trait RadixKey: Copy {
    /// Key width in bits.
    const BITS: u32;

    /// Bit `index`, counting from the most significant bit (`0`).
    ///
    /// `index` is always below [`BITS`](RadixKey::BITS).
    fn bit(&self, index: u32) -> bool;

    /// Key whose first `len` bits are the low `len` bits of `prefix`, the
    /// rest zero. `len` is at most 64.
    fn from_prefix(prefix: u64, len: u32) -> Self;

    /// Mask with the first `len` bits set, saturating at the key width.
    fn prefix_mask(len: u32) -> Self;
}

impl RadixKey for u32 {
    const BITS: u32 = 32;

    #[inline]
    fn bit(&self, index: u32) -> bool {
        debug_assert!(index < Self::BITS);
        self & (0x8000_0000 >> index) != 0
    }

    fn from_prefix(prefix: u64, len: u32) -> Self {
        match len {
            0 => 0,
            1..=32 => (prefix as u32) << (32 - len),
            _ => prefix as u32,
        }
    }

    fn prefix_mask(len: u32) -> Self {
        match len {
            0 => 0,
            1..=31 => u32::MAX << (32 - len),
            _ => u32::MAX,
        }
    }
}

impl RadixKey for [u8; 16] {
    const BITS: u32 = 128;

    #[inline]
    fn bit(&self, index: u32) -> bool {
        debug_assert!(index < Self::BITS);
        self[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
    }

    fn from_prefix(prefix: u64, len: u32) -> Self {
        let len = len.min(64);
        if len == 0 {
            return [0; 16];
        }
        (u128::from(prefix) << (128 - len)).to_be_bytes()
    }

    fn prefix_mask(len: u32) -> Self {
        match len {
            0 => [0; 16],
            1..=127 => (u128::MAX << (128 - len)).to_be_bytes(),
            _ => [0xFF; 16],
        }
    }
}

impl RadixKey for Ipv4Addr {
    const BITS: u32 = 32;

    #[inline]
    fn bit(&self, index: u32) -> bool {
        u32::from(*self).bit(index)
    }

    fn from_prefix(prefix: u64, len: u32) -> Self {
        Ipv4Addr::from(u32::from_prefix(prefix, len))
    }

    fn prefix_mask(len: u32) -> Self {
        Ipv4Addr::from(u32::prefix_mask(len))
    }
}

impl RadixKey for Ipv6Addr {
    const BITS: u32 = 128;

    #[inline]
    fn bit(&self, index: u32) -> bool {
        self.octets().bit(index)
    }

    fn from_prefix(prefix: u64, len: u32) -> Self {
        Ipv6Addr::from(<[u8; 16]>::from_prefix(prefix, len))
    }

    fn prefix_mask(len: u32) -> Self {
        Ipv6Addr::from(<[u8; 16]>::prefix_mask(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_bits() {
        let k = 0x8000_0001u32;
        assert!(k.bit(0));
        assert!(!k.bit(1));
        assert!(k.bit(31));
    }

    #[test]
    fn test_u32_prefix() {
        assert_eq!(u32::from_prefix(0b11, 2), 0xC000_0000);
        assert_eq!(u32::from_prefix(0, 0), 0);
        assert_eq!(u32::prefix_mask(8), 0xFF00_0000);
        assert_eq!(u32::prefix_mask(0), 0);
        assert_eq!(u32::prefix_mask(32), u32::MAX);
    }

    #[test]
    fn test_bytes_bits_match_u128() {
        let k = 0x2001_0db8_0000_0000_0000_0000_0000_0001u128.to_be_bytes();
        let v = u128::from_be_bytes(k);
        for i in 0..128 {
            assert_eq!(k.bit(i), v & (1u128 << (127 - i)) != 0, "bit {i}");
        }
    }

    #[test]
    fn test_bytes_prefix() {
        let m = <[u8; 16]>::prefix_mask(12);
        assert_eq!(&m[..3], &[0xFF, 0xF0, 0x00]);
        assert_eq!(<[u8; 16]>::prefix_mask(200), [0xFF; 16]);
        let k = <[u8; 16]>::from_prefix(0b101, 3);
        assert_eq!(k[0], 0b1010_0000);
        assert!(k[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_addr_keys() {
        let a: Ipv4Addr = "10.1.0.0".parse().unwrap();
        assert_eq!(u32::from(a), 0x0A01_0000);
        assert!(a.bit(4));
        assert_eq!(Ipv4Addr::prefix_mask(16), Ipv4Addr::new(255, 255, 0, 0));

        let b: Ipv6Addr = "8000::".parse().unwrap();
        assert!(b.bit(0));
        assert!(!b.bit(1));
    }
}
