//! CRC16 as used by the DS header, logo, secure area and banner.
//!
//! This is the reflected 0xA001 polynomial with an initial value of
//! `0xFFFF` (CRC-16/MODBUS), the same routine the BIOS `GetCRC16` call
//! implements.

/// Compute the CRC16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b""), 0xFFFF);
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_detects_single_bit_flip() {
        let mut data = vec![0u8; 0x200];
        let a = crc16(&data);
        data[0x100] ^= 0x10;
        assert_ne!(a, crc16(&data));
    }
}
