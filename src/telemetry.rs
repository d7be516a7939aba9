use chrono::{DateTime, FixedOffset, SecondsFormat};

use crate::message::{BasicInfo, CellVoltages};

/// Protection flags reported by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection(pub u16);

impl Protection {
    const NAMES: [&'static str; 13] = [
        "cell overvoltage",
        "cell undervoltage",
        "pack overvoltage",
        "pack undervoltage",
        "charge overtemperature",
        "charge undertemperature",
        "discharge overtemperature",
        "discharge undertemperature",
        "charge overcurrent",
        "discharge overcurrent",
        "short circuit",
        "front-end IC error",
        "MOSFET software lock",
    ];

    pub fn is_clear(self) -> bool {
        self.0 == 0
    }

    /// Names of the protections currently tripped
    pub fn active(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

/// The state of the battery as read in one poll cycle.
///
/// Values keep the fixed point units the BMS reports in; the `_v`/`_a`/`_c`
/// accessors convert to physical units.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    cell_voltage_mv: Vec<u16>,
    pack_voltage_cv: u16,
    pack_current_ca: i16,
    state_of_charge_pct: u8,
    temperatures_dc: Vec<i32>,
    residual_capacity_cah: u16,
    nominal_capacity_cah: u16,
    cycles_count: u16,
    balance: u32,
    protection: Protection,
    fet_status: u8,
    timestamp: DateTime<FixedOffset>,
}

impl TelemetryRecord {
    /// Combine the two register reads of one cycle. Fails if more cells than
    /// `max_cells` were reported.
    pub fn from_frames(
        info: &BasicInfo,
        cells: CellVoltages,
        max_cells: usize,
        timestamp: DateTime<FixedOffset>,
    ) -> Result<Self, &'static str> {
        if cells.0.len() > max_cells {
            return Err("Cell count exceeds bound");
        }
        if cells.0.len() != info.cell_count as usize {
            log::warn!(
                "BMS reports {} cells but sent {} cell voltages",
                info.cell_count,
                cells.0.len()
            );
        }

        Ok(Self {
            cell_voltage_mv: cells.0,
            pack_voltage_cv: info.total_voltage_cv,
            pack_current_ca: info.current_ca,
            state_of_charge_pct: info.state_of_charge_pct,
            temperatures_dc: info.temperatures_dc(),
            residual_capacity_cah: info.residual_capacity_cah,
            nominal_capacity_cah: info.nominal_capacity_cah,
            cycles_count: info.cycles,
            balance: info.balance,
            protection: Protection(info.protection),
            fet_status: info.fet_status,
            timestamp,
        })
    }

    /// The voltage of each cell in mV
    pub fn cell_voltage_mv(&self) -> &[u16] {
        &self.cell_voltage_mv
    }

    /// The battery voltage in V/100
    pub fn pack_voltage_cv(&self) -> u16 {
        self.pack_voltage_cv
    }

    /// The battery current in A/100, positive while charging
    pub fn pack_current_ca(&self) -> i16 {
        self.pack_current_ca
    }

    pub fn state_of_charge_pct(&self) -> u8 {
        self.state_of_charge_pct
    }

    /// Probe temperatures in °C/10
    pub fn temperatures_dc(&self) -> &[i32] {
        &self.temperatures_dc
    }

    /// The residual capacity of the battery in Ah/100
    pub fn residual_capacity_cah(&self) -> u16 {
        self.residual_capacity_cah
    }

    pub fn nominal_capacity_cah(&self) -> u16 {
        self.nominal_capacity_cah
    }

    pub fn cycles_count(&self) -> u16 {
        self.cycles_count
    }

    pub fn balance(&self) -> u32 {
        self.balance
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn charge_enabled(&self) -> bool {
        self.fet_status & 0b01 != 0
    }

    pub fn discharge_enabled(&self) -> bool {
        self.fet_status & 0b10 != 0
    }

    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    pub fn pack_voltage_v(&self) -> f32 {
        self.pack_voltage_cv as f32 / 100.0
    }

    pub fn pack_current_a(&self) -> f32 {
        self.pack_current_ca as f32 / 100.0
    }

    /// Spread between the highest and lowest cell in mV
    pub fn cell_delta_mv(&self) -> u16 {
        let max = self.cell_voltage_mv.iter().max().copied().unwrap_or(0);
        let min = self.cell_voltage_mv.iter().min().copied().unwrap_or(0);
        max - min
    }

    /// The record as ordered query parameters, physical units with fixed decimals.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let cells = self
            .cell_voltage_mv
            .iter()
            .map(|&mv| format!("{:.3}", mv as f32 / 1000.0))
            .collect::<Vec<_>>()
            .join(",");
        let temps = self
            .temperatures_dc
            .iter()
            .map(|&dc| format!("{:.1}", dc as f32 / 10.0))
            .collect::<Vec<_>>()
            .join(",");

        vec![
            ("time", self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false)),
            ("voltage", format!("{:.2}", self.pack_voltage_v())),
            ("current", format!("{:.2}", self.pack_current_a())),
            ("soc", self.state_of_charge_pct.to_string()),
            ("remaining", format!("{:.2}", self.residual_capacity_cah as f32 / 100.0)),
            ("nominal", format!("{:.2}", self.nominal_capacity_cah as f32 / 100.0)),
            ("cycles", self.cycles_count.to_string()),
            ("cells", cells),
            ("delta", self.cell_delta_mv().to_string()),
            ("temps", temps),
            ("protection", self.protection.0.to_string()),
            ("fet", self.fet_status.to_string()),
        ]
    }
}
