//! CRC-32 over firmware images.
//!
//! Reflected polynomial `0xEDB88320`, processed four bits at a time through a
//! 16-entry table. The bootloader on the peripheral uses the same table, so
//! the result equals the usual CRC-32 (ISO-HDLC) of the image.

const NIBBLE_TABLE: [u32; 16] = [
    0x0000_0000, 0x1DB7_1064, 0x3B6E_20C8, 0x26D9_30AC,
    0x76DC_4190, 0x6B6B_51F4, 0x4DB2_6158, 0x5005_713C,
    0xEDB8_8320, 0xF00F_9344, 0xD6D6_A3E8, 0xCB61_B38C,
    0x9B64_C2B0, 0x86D3_D2D4, 0xA00A_E278, 0xBDBD_F21C,
];

const SEED: u32 = 0xFFFF_FFFF;

/// Compute the CRC-32 of `data`.
///
/// ```
/// use sensorgate_core::upgrade::crc32;
///
/// assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
/// ```
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = SEED;
    for &byte in data {
        crc = (crc >> 4) ^ NIBBLE_TABLE[((crc ^ u32::from(byte)) & 0x0F) as usize];
        crc = (crc >> 4) ^ NIBBLE_TABLE[((crc ^ (u32::from(byte) >> 4)) & 0x0F) as usize];
    }
    crc ^ SEED
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const REFERENCE: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

    #[test]
    fn test_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_matches_reference_on_block() {
        let image: Vec<u8> = (0..1600u32).map(|i| (i * 7 % 251) as u8).collect();
        assert_eq!(crc32(&image), REFERENCE.checksum(&image));
    }

    proptest! {
        #[test]
        fn crc_matches_reference(words in proptest::collection::vec(any::<[u8; 4]>(), 0..256)) {
            let data: Vec<u8> = words.concat();
            prop_assert_eq!(crc32(&data), REFERENCE.checksum(&data));
        }
    }
}
