use std::fmt;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsdVersion {
    /// Standard capacity layout, also used by MMC.
    V1,
    /// High capacity layout.
    V2,
    Unknown(u8),
}

/// Card Specific Data register, 128 bits, most significant byte first.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Csd([u8; 16]);

impl Csd {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn version(&self) -> CsdVersion {
        match self.0[0] >> 6 {
            0 => CsdVersion::V1,
            1 => CsdVersion::V2,
            x => CsdVersion::Unknown(x),
        }
    }

    /// Capacity in 512 byte sectors, `None` when it does not fit 32-bit sector numbers.
    pub fn sector_count(&self) -> Option<u32> {
        match self.version() {
            CsdVersion::V2 => {
                let c_size = get_bits(&self.0, 69, 48);
                (c_size + 1).checked_mul(1024)
            }
            CsdVersion::V1 => {
                let read_bl_len = get_bits(&self.0, 83, 80);
                let c_size = get_bits(&self.0, 73, 62);
                let c_size_mult = get_bits(&self.0, 49, 47);
                let shift = (read_bl_len + c_size_mult + 2).checked_sub(9)?;
                (c_size + 1).checked_mul(1u32.checked_shl(shift)?)
            }
            CsdVersion::Unknown(_) => None,
        }
    }

    /// Erase unit size in 512 byte sectors.
    pub fn erase_block_sectors(&self) -> u32 {
        // SECTOR_SIZE counts write blocks, WRITE_BL_LEN gives their size.
        let sector_size = get_bits(&self.0, 45, 39) + 1;
        let write_bl_len = get_bits(&self.0, 25, 22);
        match write_bl_len.checked_sub(9) {
            Some(shift) if shift < 8 => sector_size << shift,
            _ => sector_size,
        }
    }
}

impl fmt::Debug for Csd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Csd(")?;
        for b in self.0.iter() {
            write!(f, "{:02X}", b)?;
        }
        write!(f, ")")
    }
}

/// Extracts the inclusive bit range `msb..=lsb`, bit 127 being the top bit of byte 0.
pub(crate) fn get_bits(csd: &[u8; 16], msb: u32, lsb: u32) -> u32 {
    debug_assert!(msb >= lsb && msb - lsb < 32 && msb < 128);
    let mut value = 0u32;
    for bit in (lsb..=msb).rev() {
        let byte = csd[15 - (bit / 8) as usize];
        value = (value << 1) | ((byte >> (bit % 8)) & 1) as u32;
    }
    value
}

pub(crate) fn set_bits(csd: &mut [u8; 16], msb: u32, lsb: u32, value: u32) {
    debug_assert!(msb >= lsb && msb - lsb < 32 && msb < 128);
    for bit in lsb..=msb {
        let byte = &mut csd[15 - (bit / 8) as usize];
        let mask = 1u8 << (bit % 8);
        if (value >> (bit - lsb)) & 1 != 0 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Register dump of a 4 GB SDHC card.
    const SDHC_CSD: [u8; 16] = [
        0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x1D, 0x8A, 0x7F, 0x80, 0x0A, 0x40, 0x00,
        0x8B,
    ];

    #[test]
    fn test_v2_capacity() {
        crate::tests_init();

        let csd = Csd::from_bytes(SDHC_CSD);
        assert_eq!(csd.version(), CsdVersion::V2);
        assert_eq!(csd.sector_count(), Some(7563 * 1024));
        assert_eq!(csd.erase_block_sectors(), 128);
    }

    #[test]
    fn test_v1_capacity_matches_byte_formula() {
        crate::tests_init();

        for &(read_bl_len, c_size, c_size_mult) in
            [(9u32, 3751u32, 7u32), (10, 4095, 7), (9, 1, 0), (11, 2000, 5)].iter()
        {
            let mut raw = [0u8; 16];
            set_bits(&mut raw, 83, 80, read_bl_len);
            set_bits(&mut raw, 73, 62, c_size);
            set_bits(&mut raw, 49, 47, c_size_mult);

            let csd = Csd::from_bytes(raw);
            assert_eq!(csd.version(), CsdVersion::V1);

            let n = (raw[5] & 15) as u32
                + ((raw[10] & 0x80) >> 7) as u32
                + ((raw[9] & 3) << 1) as u32
                + 2;
            let size = ((raw[6] & 3) as u32) << 10
                | (raw[7] as u32) << 2
                | ((raw[8] & 0xC0) >> 6) as u32;
            assert_eq!(csd.sector_count(), Some((size + 1) << (n - 9)));
        }
    }

    #[test]
    fn test_bits_roundtrip() {
        crate::tests_init();

        let mut raw = [0u8; 16];
        set_bits(&mut raw, 69, 48, 0x2A_BCDE);
        assert_eq!(get_bits(&raw, 69, 48), 0x2A_BCDE);
        set_bits(&mut raw, 127, 126, 1);
        assert_eq!(raw[0], 0x40);
        assert_eq!(get_bits(&raw, 69, 48), 0x2A_BCDE);
    }

    #[test]
    fn test_capacity_limit() {
        crate::tests_init();

        let mut raw = SDHC_CSD;
        set_bits(&mut raw, 69, 48, 0x3F_FFFE);
        assert_eq!(Csd::from_bytes(raw).sector_count(), Some(0xFFFF_FC00));
        set_bits(&mut raw, 69, 48, 0x3F_FFFF);
        assert_eq!(Csd::from_bytes(raw).sector_count(), None);
    }

    #[test]
    fn test_unknown_structure() {
        crate::tests_init();

        let mut raw = SDHC_CSD;
        raw[0] = 0xC0;
        let csd = Csd::from_bytes(raw);
        assert_eq!(csd.version(), CsdVersion::Unknown(3));
        assert_eq!(csd.sector_count(), None);
    }
}
