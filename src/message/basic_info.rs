use chrono::NaiveDate;

use super::words;

/// Bytes before the temperature readings
pub(crate) const FIXED_LEN: usize = 23;
/// Most temperature probes a JBD board reports
pub(crate) const MAX_NTC: usize = 8;
/// Newer firmware appends humidity, alarm, full charge capacity, remaining
/// capacity and balance current after the temperatures
pub(crate) const MAX_EXTENSION_LEN: usize = 9;

const KELVIN_OFFSET_DK: i32 = 2731;

/// The payload of register 0x03, which carries pack level state.
///
/// Fields keep the device's fixed point units so that the payload can be
/// re-encoded exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicInfo {
    /// Pack voltage in V/100
    pub total_voltage_cv: u16,
    /// Pack current in A/100, positive while charging
    pub current_ca: i16,
    /// Residual capacity in Ah/100
    pub residual_capacity_cah: u16,
    /// Nominal capacity in Ah/100
    pub nominal_capacity_cah: u16,
    pub cycles: u16,
    /// Packed as `day | month << 5 | (year - 2000) << 9`
    pub production_date: u16,
    /// One bit per cell, set while the cell is being balanced
    pub balance: u32,
    pub protection: u16,
    pub software_version: u8,
    pub state_of_charge_pct: u8,
    /// bit 0 charge MOSFET on, bit 1 discharge MOSFET on
    pub fet_status: u8,
    pub cell_count: u8,
    /// Raw temperature readings in K/10
    pub temperatures_dk: Vec<u16>,
    /// Trailing bytes after the temperatures, kept verbatim
    pub extension: Vec<u8>,
}

impl BasicInfo {
    pub fn decode(data: &[u8], max_cells: usize) -> Result<Self, &'static str> {
        if data.len() < FIXED_LEN {
            return Err("Basic info too short");
        }
        let w: Vec<u16> = words(&data[..18]).collect();

        let cell_count = data[21];
        if cell_count as usize > max_cells {
            return Err("Cell count exceeds bound");
        }
        let ntc_count = data[22] as usize;
        if ntc_count > MAX_NTC {
            return Err("Temperature count exceeds bound");
        }
        let temps_end = FIXED_LEN + 2 * ntc_count;
        if data.len() < temps_end {
            return Err("Temperatures truncated");
        }
        if data.len() > temps_end + MAX_EXTENSION_LEN {
            return Err("Basic info too long");
        }

        Ok(Self {
            total_voltage_cv: w[0],
            current_ca: w[1] as i16,
            residual_capacity_cah: w[2],
            nominal_capacity_cah: w[3],
            cycles: w[4],
            production_date: w[5],
            balance: ((w[7] as u32) << 16) | w[6] as u32,
            protection: w[8],
            software_version: data[18],
            state_of_charge_pct: data[19],
            fet_status: data[20],
            cell_count,
            temperatures_dk: words(&data[FIXED_LEN..temps_end]).collect(),
            extension: data[temps_end..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(FIXED_LEN + 2 * self.temperatures_dk.len() + self.extension.len());
        for word in [
            self.total_voltage_cv,
            self.current_ca as u16,
            self.residual_capacity_cah,
            self.nominal_capacity_cah,
            self.cycles,
            self.production_date,
            self.balance as u16,
            (self.balance >> 16) as u16,
            self.protection,
        ] {
            data.extend_from_slice(&word.to_be_bytes());
        }
        data.extend_from_slice(&[
            self.software_version,
            self.state_of_charge_pct,
            self.fet_status,
            self.cell_count,
            self.temperatures_dk.len() as u8,
        ]);
        for temp in &self.temperatures_dk {
            data.extend_from_slice(&temp.to_be_bytes());
        }
        data.extend_from_slice(&self.extension);
        data
    }

    /// Temperatures in °C/10
    pub fn temperatures_dc(&self) -> Vec<i32> {
        self.temperatures_dk
            .iter()
            .map(|&dk| dk as i32 - KELVIN_OFFSET_DK)
            .collect()
    }

    pub fn production_date(&self) -> Option<NaiveDate> {
        let day = (self.production_date & 0x1f) as u32;
        let month = ((self.production_date >> 5) & 0x0f) as u32;
        let year = 2000 + (self.production_date >> 9) as i32;
        NaiveDate::from_ymd_opt(year, month, day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 13.30V, -1.50A, 45.00Ah of 100.00Ah, 12 cycles, 2023-06-15, cells 0 and 2
    // balancing, no protection, version 0x2d, 45%, both FETs on, 4 cells, 2 probes at
    // 25.0°C and 23.5°C
    const BASIC_INFO: &str = "0532ff6a11942710000c2ecf0005000000002d2d0304020ba50b96";

    #[test]
    fn test_decode() {
        let data = hex::decode(BASIC_INFO).unwrap();
        let info = BasicInfo::decode(&data, 15).unwrap();
        assert_eq!(info.total_voltage_cv, 1330);
        assert_eq!(info.current_ca, -150);
        assert_eq!(info.residual_capacity_cah, 4500);
        assert_eq!(info.nominal_capacity_cah, 10000);
        assert_eq!(info.cycles, 12);
        assert_eq!(info.production_date(), NaiveDate::from_ymd_opt(2023, 6, 15));
        assert_eq!(info.balance, 0b101);
        assert_eq!(info.protection, 0);
        assert_eq!(info.software_version, 0x2d);
        assert_eq!(info.state_of_charge_pct, 45);
        assert_eq!(info.fet_status, 0b11);
        assert_eq!(info.cell_count, 4);
        assert_eq!(info.temperatures_dc(), vec![250, 235]);
        assert!(info.extension.is_empty());
    }

    #[test]
    fn test_encode_restores_payload() {
        let mut data = hex::decode(BASIC_INFO).unwrap();
        // extension fields from newer firmware
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x27, 0x10, 0x11, 0x94, 0x00, 0x00]);
        let info = BasicInfo::decode(&data, 15).unwrap();
        assert_eq!(info.extension.len(), 9);
        assert_eq!(info.encode(), data);
    }

    #[test]
    fn test_cell_count_bound() {
        let data = hex::decode(BASIC_INFO).unwrap();
        assert_eq!(BasicInfo::decode(&data, 3), Err("Cell count exceeds bound"));
    }

    #[test]
    fn test_truncated_temperatures() {
        let data = hex::decode(BASIC_INFO).unwrap();
        assert_eq!(BasicInfo::decode(&data[..data.len() - 1], 15), Err("Temperatures truncated"));
        assert_eq!(BasicInfo::decode(&data[..10], 15), Err("Basic info too short"));
    }

    #[test]
    fn test_faulted_probe_reading_does_not_wrap() {
        let mut data = hex::decode(BASIC_INFO).unwrap();
        let probe = data.len() - 4;
        data[probe..probe + 2].copy_from_slice(&0xffffu16.to_be_bytes());
        let info = BasicInfo::decode(&data, 15).unwrap();
        assert_eq!(info.temperatures_dc(), vec![65535 - 2731, 235]);
    }
}
