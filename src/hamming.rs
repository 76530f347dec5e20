//! Hamming (15,11) single-error-correcting code.
//!
//! Every persisted byte is stored as one little-endian 16-bit codeword, so an
//! encoded buffer is exactly twice the size of its payload. Parity bits live
//! at positions 0, 1, 3 and 7; data bits fill the rest.

const DATA_POSITIONS: [u32; 8] = [2, 4, 5, 6, 8, 9, 10, 11];

#[inline]
fn bit(word: u16, i: u32) -> u16 {
    (word >> i) & 1
}

fn parity(word: u16, positions: &[u32]) -> u16 {
    positions.iter().fold(0, |acc, &p| acc ^ bit(word, p))
}

pub fn encode_byte(data: u8) -> u16 {
    let mut word = 0u16;
    for (i, &pos) in DATA_POSITIONS.iter().enumerate() {
        word |= (((data >> i) & 1) as u16) << pos;
    }
    let p1 = parity(word, &[2, 4, 6, 8, 10, 12, 14]);
    let p2 = parity(word, &[2, 5, 6, 9, 10, 13, 14]);
    let p4 = parity(word, &[4, 5, 6, 11, 12, 13, 14]);
    let p8 = parity(word, &[8, 9, 10, 11, 12, 13, 14]);
    word | p1 | (p2 << 1) | (p4 << 3) | (p8 << 7)
}

/// Decodes one codeword, flipping back a single damaged bit if the syndrome
/// points at one.
pub fn decode_byte(word: u16) -> u8 {
    let s1 = parity(word, &[0, 2, 4, 6, 8, 10, 12, 14]);
    let s2 = parity(word, &[1, 2, 5, 6, 9, 10, 13, 14]);
    let s4 = parity(word, &[3, 4, 5, 6, 11, 12, 13, 14]);
    let s8 = parity(word, &[7, 8, 9, 10, 11, 12, 13, 14]);
    let error_pos = s1 | (s2 << 1) | (s4 << 2) | (s8 << 3);
    let word = if error_pos != 0 { word ^ (1 << (error_pos - 1)) } else { word };

    DATA_POSITIONS
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, &pos)| acc | ((bit(word, pos) as u8) << i))
}

/// Encodes `src` into `dst`, which must hold `2 * src.len()` bytes.
pub fn pack(src: &[u8], dst: &mut [u8]) {
    for (byte, out) in src.iter().zip(dst.chunks_exact_mut(2)) {
        out.copy_from_slice(&encode_byte(*byte).to_le_bytes());
    }
}

/// Decodes `src` into `dst` and returns how many codewords were not clean,
/// i.e. needed a correction or carried noise in the unused bits.
pub fn unpack(src: &[u8], dst: &mut [u8]) -> usize {
    let mut dirty = 0;
    for (word, out) in src.chunks_exact(2).zip(dst.iter_mut()) {
        let raw = u16::from_le_bytes([word[0], word[1]]);
        *out = decode_byte(raw);
        if encode_byte(*out) != raw {
            dirty += 1;
        }
    }
    dirty
}

pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; src.len() * 2];
    pack(src, &mut out);
    out
}

pub fn decode(src: &[u8]) -> (Vec<u8>, usize) {
    let mut out = vec![0u8; src.len() / 2];
    let dirty = unpack(src, &mut out);
    (out, dirty)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip_all_bytes() {
        for b in 0..=255u8 {
            assert_eq!(decode_byte(encode_byte(b)), b);
        }
    }

    #[test]
    fn test_corrects_any_single_flip() {
        for b in 0..=255u8 {
            let word = encode_byte(b);
            for pos in 0..15 {
                assert_eq!(decode_byte(word ^ (1 << pos)), b, "byte {b:#x} bit {pos}");
            }
        }
    }

    #[test]
    fn test_unpack_reports_corrections() {
        let data = b"NIFAT";
        let mut enc = encode(data);
        let (dec, dirty) = decode(&enc);
        assert_eq!(&dec, data);
        assert_eq!(dirty, 0);

        enc[2] ^= 0b0001_0000;
        enc[7] ^= 0b0000_0010;
        let (dec, dirty) = decode(&enc);
        assert_eq!(&dec, data);
        assert_eq!(dirty, 2);
    }
}
