use super::words;

/// The payload of register 0x04: the voltage of each cell in mV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellVoltages(pub Vec<u16>);

impl CellVoltages {
    pub fn decode(data: &[u8], max_cells: usize) -> Result<Self, &'static str> {
        if data.len() % 2 != 0 {
            return Err("Odd cell data length");
        }
        if data.len() / 2 > max_cells {
            return Err("Cell count exceeds bound");
        }
        Ok(Self(words(data).collect()))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.iter().flat_map(|mv| mv.to_be_bytes()).collect()
    }
}

#[test]
fn test_decode_cells() {
    let data = hex::decode("0cf30cf50cf10cf4").unwrap();
    let cells = CellVoltages::decode(&data, 4).unwrap();
    assert_eq!(cells.0, vec![3315, 3317, 3313, 3316]);
    assert_eq!(cells.encode(), data);
}

#[test]
fn test_too_many_cells_is_an_error() {
    let data = hex::decode("0cf30cf50cf10cf4").unwrap();
    assert_eq!(CellVoltages::decode(&data, 3), Err("Cell count exceeds bound"));
    assert_eq!(CellVoltages::decode(&data[..3], 4), Err("Odd cell data length"));
}
