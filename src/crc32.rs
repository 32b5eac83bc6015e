//! The CRC32 flavour GPT headers are protected with.
//!
//! This is the reflected IEEE 802.3 checksum (polynomial 0xEDB88320, initial
//! value 0xFFFFFFFF, final XOR 0xFFFFFFFF) — the same function zlib calls
//! `crc32`. Both CRC fields in a GPT header use it: one over the partition
//! entry array, one over the first `header_size` bytes of the header itself.

const POLYNOMIAL: u32 = 0xEDB8_8320;

// 256-entry lookup table, one round of the bitwise algorithm per byte value.
static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];

    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;

        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { POLYNOMIAL ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }

        table[n] = c;
        n += 1;
    }

    table
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut c = 0xFFFF_FFFF;

    for b in bytes {
        c = TABLE[((c ^ (*b as u32)) & 0xFF) as usize] ^ (c >> 8);
    }

    c ^ 0xFFFF_FFFF
}

#[cfg(test)]
mod crc32_tests {
    use super::*;

    #[test]
    fn empty() {
        assert_eq!(0, crc32(&[]));
    }

    // The check value every CRC32 reference quotes.
    #[test]
    fn check_string() {
        assert_eq!(0xCBF4_3926, crc32(b"123456789"));
    }

    #[test]
    fn single_bytes() {
        assert_eq!(0xD202_EF8D, crc32(&[0x00]));
        assert_eq!(0xE8B7_BE43, crc32(b"a"));
    }

    // Must agree with zlib; the `crc` crate's IEEE checksum is our stand-in.
    #[test]
    fn matches_reference_implementation() {
        let mut buf = [0u8; 1024];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31).wrapping_add(7);
        }

        for len in [0, 1, 2, 91, 92, 511, 512, 1024] {
            assert_eq!(
                crc::crc32::checksum_ieee(&buf[..len]),
                crc32(&buf[..len]),
                "length {}",
                len,
            );
        }
    }
}
