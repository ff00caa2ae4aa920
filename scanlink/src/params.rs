use crate::config::SessionConfig;
use crate::encoding::{read_fixed_str, write_fixed_str, ReadError, Readable, Writable};
use serde::{Deserialize, Serialize};

const ID_LEN: usize = 64;
const TARGETS: usize = 8;

/// Number of configurable IO functions per target
pub const CFG_IO_COUNT: usize = 17;

/// Encoded size of a [`ParamSet`] in the settings sector
pub const PARAMSET_SIZE: usize =
    2 + 2 + 4 + ID_LEN + 2 * TARGETS + 8 * TARGETS * 2 + 2 * TARGETS * 2 + TARGETS * 2
        + 2 * CFG_IO_COUNT * TARGETS;

/// Device settings stored in the settings sector, one column per target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    pub hw_id: u16,
    pub version_id: u16,
    pub serial_nr: u32,
    pub id: String,
    /// Physical address of each mapped target, zero when unmapped
    pub mac: [u16; TARGETS],
    pub field_size: [f64; TARGETS],
    pub field_size_z: [f64; TARGETS],
    pub drag_error: [u16; TARGETS],
    pub setpoint_fir: [u16; TARGETS],
    pub fct_ch1: [i8; TARGETS],
    pub fct_ch2: [i8; TARGETS],
    /// `CFG_IO_COUNT` rows of per-target IO function codes
    pub fct_io: Vec<u16>,
}

fn read_array<T: Readable + Copy + Default, const N: usize>(
    data: &mut &[u8],
) -> Result<[T; N], ReadError> {
    let mut v = [T::default(); N];
    for item in v.iter_mut() {
        *item = T::read(data)?;
    }
    Ok(v)
}

impl ParamSet {
    /// Settings written by the host when the device carries none
    pub fn defaults(config: &SessionConfig) -> Self {
        ParamSet {
            hw_id: config.hardware_id,
            version_id: 0,
            serial_nr: 0,
            id: String::new(),
            mac: [0; TARGETS],
            field_size: [config.default_field_size; TARGETS],
            field_size_z: [config.default_field_size_z; TARGETS],
            drag_error: [config.default_drag_error; TARGETS],
            setpoint_fir: [0; TARGETS],
            fct_ch1: [0; TARGETS],
            fct_ch2: [0; TARGETS],
            fct_io: vec![0; CFG_IO_COUNT * TARGETS],
        }
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, ReadError> {
        let data = &mut data;
        Ok(ParamSet {
            hw_id: u16::read(data)?,
            version_id: u16::read(data)?,
            serial_nr: u32::read(data)?,
            id: read_fixed_str(data, ID_LEN)?,
            mac: read_array(data)?,
            field_size: read_array(data)?,
            field_size_z: read_array(data)?,
            drag_error: read_array(data)?,
            setpoint_fir: read_array(data)?,
            fct_ch1: read_array(data)?,
            fct_ch2: read_array(data)?,
            fct_io: (0..CFG_IO_COUNT * TARGETS)
                .map(|_| u16::read(data))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PARAMSET_SIZE);
        self.hw_id.write(&mut out);
        self.version_id.write(&mut out);
        self.serial_nr.write(&mut out);
        write_fixed_str(&mut out, &self.id, ID_LEN);
        self.mac.iter().for_each(|v| v.write(&mut out));
        self.field_size.iter().for_each(|v| v.write(&mut out));
        self.field_size_z.iter().for_each(|v| v.write(&mut out));
        self.drag_error.iter().for_each(|v| v.write(&mut out));
        self.setpoint_fir.iter().for_each(|v| v.write(&mut out));
        self.fct_ch1.iter().for_each(|v| v.write(&mut out));
        self.fct_ch2.iter().for_each(|v| v.write(&mut out));
        for n in 0..CFG_IO_COUNT * TARGETS {
            self.fct_io.get(n).copied().unwrap_or(0).write(&mut out);
        }
        out
    }

    /// Decodes the settings sector, or `None` when it does not carry the expected hardware id
    pub fn from_sector(data: &[u8], config: &SessionConfig) -> Option<Self> {
        ParamSet::decode(data)
            .ok()
            .filter(|p| p.hw_id == config.hardware_id)
    }

    /// IO function `nr` (1 based) of target `target`
    pub fn cfg_io(&self, nr: usize, target: usize) -> Option<u16> {
        if !(1..=CFG_IO_COUNT).contains(&nr) {
            return None;
        }
        self.fct_io.get((nr - 1) * TARGETS + target).copied()
    }

    pub fn set_cfg_io(&mut self, nr: usize, target: usize, value: u16) -> bool {
        if !(1..=CFG_IO_COUNT).contains(&nr) {
            return false;
        }
        match self.fct_io.get_mut((nr - 1) * TARGETS + target) {
            Some(v) => {
                *v = value;
                true
            }
            None => false,
        }
    }
}
