// ── Holding-register parameter table ──
//
// One declared table of writable settings. The mapper decodes a register
// dump through it; the command surface resolves names to registers through
// the same table so reads and writes never disagree.

use sunpoll_api::{RawParameters, RegisterRange};

use crate::error::CoreError;
use crate::model::{Parameters, SensorValue};

/// Holding registers scanned by the deferred parameter read.
pub const PARAMETER_RANGE: RegisterRange = RegisterRange::new(0, 127);

/// Register carrying the boolean function bits.
pub const FUNCTION_REGISTER: u16 = 21;

/// A numeric setting stored in one holding register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericParameter {
    pub name: &'static str,
    pub register: u16,
    /// Engineering value = raw / divisor.
    pub divisor: f64,
    pub min: f64,
    pub max: f64,
    pub unit: &'static str,
}

/// One bit of the function register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionBit {
    pub name: &'static str,
    pub register: u16,
    pub bit: u8,
}

pub const NUMERIC_PARAMETERS: &[NumericParameter] = &[
    NumericParameter {
        name: "charge_power_percent",
        register: 64,
        divisor: 1.0,
        min: 0.0,
        max: 100.0,
        unit: "%",
    },
    NumericParameter {
        name: "discharge_power_percent",
        register: 65,
        divisor: 1.0,
        min: 0.0,
        max: 100.0,
        unit: "%",
    },
    NumericParameter {
        name: "ac_charge_power_percent",
        register: 66,
        divisor: 1.0,
        min: 0.0,
        max: 100.0,
        unit: "%",
    },
    NumericParameter {
        name: "ac_charge_soc_limit",
        register: 67,
        divisor: 1.0,
        min: 0.0,
        max: 100.0,
        unit: "%",
    },
    NumericParameter {
        name: "charge_current_limit",
        register: 101,
        divisor: 1.0,
        min: 0.0,
        max: 250.0,
        unit: "A",
    },
    NumericParameter {
        name: "discharge_current_limit",
        register: 102,
        divisor: 1.0,
        min: 0.0,
        max: 250.0,
        unit: "A",
    },
    NumericParameter {
        name: "on_grid_eod_soc",
        register: 105,
        divisor: 1.0,
        min: 10.0,
        max: 90.0,
        unit: "%",
    },
];

pub const FUNCTION_BITS: &[FunctionBit] = &[
    FunctionBit {
        name: "eps_enabled",
        register: FUNCTION_REGISTER,
        bit: 0,
    },
    FunctionBit {
        name: "ac_charge",
        register: FUNCTION_REGISTER,
        bit: 7,
    },
    FunctionBit {
        name: "standby",
        register: FUNCTION_REGISTER,
        bit: 9,
    },
    FunctionBit {
        name: "forced_discharge",
        register: FUNCTION_REGISTER,
        bit: 10,
    },
    FunctionBit {
        name: "charge_priority",
        register: FUNCTION_REGISTER,
        bit: 11,
    },
    FunctionBit {
        name: "feed_in_grid",
        register: FUNCTION_REGISTER,
        bit: 15,
    },
];

pub fn numeric(name: &str) -> Option<&'static NumericParameter> {
    NUMERIC_PARAMETERS.iter().find(|p| p.name == name)
}

pub fn function(name: &str) -> Option<&'static FunctionBit> {
    FUNCTION_BITS.iter().find(|f| f.name == name)
}

impl NumericParameter {
    /// Validate `value` and convert it to the raw register word.
    pub fn encode(&self, value: f64) -> Result<u16, CoreError> {
        if !value.is_finite() || value < self.min || value > self.max {
            return Err(CoreError::ValidationFailed {
                message: format!(
                    "{} must be between {} and {} {}, got {value}",
                    self.name, self.min, self.max, self.unit
                ),
            });
        }
        let raw = (value * self.divisor).round();
        // Bounded above by `max * divisor`, which the table keeps in range.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::as_conversions)]
        let word = raw as u16;
        Ok(word)
    }

    pub fn decode(&self, raw: u16) -> f64 {
        f64::from(raw) / self.divisor
    }
}

impl FunctionBit {
    pub fn mask(&self) -> u16 {
        1 << self.bit
    }

    pub fn is_set(&self, word: u16) -> bool {
        word & self.mask() != 0
    }

    /// `word` with this bit set or cleared, other bits preserved.
    pub fn apply(&self, word: u16, enabled: bool) -> u16 {
        if enabled {
            word | self.mask()
        } else {
            word & !self.mask()
        }
    }
}

/// Decode a holding-register dump into named settings. Registers missing
/// from the dump leave their settings absent.
pub fn map_parameters(raw: &RawParameters) -> Parameters {
    let mut out = Parameters::new();
    for p in NUMERIC_PARAMETERS {
        if let Some(&word) = raw.get(&p.register) {
            out.insert(p.name.to_owned(), SensorValue::Float(p.decode(word)));
        }
    }
    for f in FUNCTION_BITS {
        if let Some(&word) = raw.get(&f.register) {
            out.insert(f.name.to_owned(), SensorValue::Bool(f.is_set(word)));
        }
    }
    out
}
