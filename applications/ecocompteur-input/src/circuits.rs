//! The fixed set of circuits monitored on the meter.
//!
//! Real circuits carry a label, a power and an energy value. `Total` is
//! derived from the real circuits and must stay last among the power-bearing
//! circuits. `TIC` is the meter's own cumulative counter and is energy only.

use regex::Regex;

use crate::error::{AppError, Result};
use crate::state::StateDefinition;

pub const TOTAL_NAME: &str = "Total";
pub const TIC_NAME: &str = "TIC";

/// Raw TIC values are reported in Wh.
pub const TIC_SCALE: f64 = 1000.0;

#[derive(Debug, Clone)]
pub enum CircuitKind {
    /// A metered branch: label and power come from the index page, power alone
    /// from the JSON payload.
    Metered {
        label_pattern: Regex,
        json_field: String,
    },
    /// Sum of the metered circuits for the current poll.
    Total,
    /// Cumulative counter read directly from the index page; the raw value is
    /// divided by `scale` to give kWh.
    Tic { energy_pattern: Regex, scale: f64 },
}

/// Running integration state; only the energy integrator writes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulator {
    /// Monotonic ms of the last accepted power sample.
    pub last_timestamp: Option<u64>,
    pub last_power: f64,
}

impl Accumulator {
    pub fn has_sample(&self) -> bool {
        self.last_timestamp.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Circuit {
    pub name: String,
    pub kind: CircuitKind,
    pub label_key: Option<String>,
    pub power_key: Option<String>,
    pub energy_key: String,
    pub accumulator: Accumulator,
}

impl Circuit {
    /// Metered circuit `c{n}` with keys `c{n}.label`, `c{n}.power`, `c{n}.energy`.
    pub fn metered(n: u8) -> Result<Self> {
        let name = format!("c{n}");
        let label_pattern = Regex::new(&format!(
            r#"(?sm){name}Name = getLabel\("([^"]*)"\);.*?\b{name} = (\d+)\s*(?:;|$)"#
        ))
        .map_err(|e| AppError::Config(format!("label pattern for {name}: {e}")))?;

        Ok(Self {
            kind: CircuitKind::Metered {
                label_pattern,
                json_field: format!("data{n}"),
            },
            label_key: Some(format!("{name}.label")),
            power_key: Some(format!("{name}.power")),
            energy_key: format!("{name}.energy"),
            accumulator: Accumulator::default(),
            name,
        })
    }

    pub fn total() -> Self {
        Self {
            name: TOTAL_NAME.into(),
            kind: CircuitKind::Total,
            label_key: None,
            power_key: Some("cTotal.power".into()),
            energy_key: "cTotal.energy".into(),
            accumulator: Accumulator::default(),
        }
    }

    pub fn tic() -> Result<Self> {
        let energy_pattern = Regex::new(r"conso_base = '(\d+)'")
            .map_err(|e| AppError::Config(format!("TIC pattern: {e}")))?;

        Ok(Self {
            name: TIC_NAME.into(),
            kind: CircuitKind::Tic {
                energy_pattern,
                scale: TIC_SCALE,
            },
            label_key: None,
            power_key: None,
            energy_key: "TICReading".into(),
            accumulator: Accumulator::default(),
        })
    }

    pub fn is_metered(&self) -> bool {
        matches!(self.kind, CircuitKind::Metered { .. })
    }

    /// Every key this circuit writes, with the metadata to register for it.
    pub fn definitions(&self) -> Vec<(String, StateDefinition)> {
        let mut defs = Vec::with_capacity(3);
        if let Some(key) = &self.label_key {
            defs.push((key.clone(), StateDefinition::text(format!("{} label", self.name))));
        }
        if let Some(key) = &self.power_key {
            defs.push((
                key.clone(),
                StateDefinition::number(format!("{} instantaneous power", self.name), Some("W")),
            ));
        }
        let energy_name = match self.kind {
            CircuitKind::Tic { .. } => "TIC Reading".to_string(),
            _ => format!("{} energy", self.name),
        };
        defs.push((
            self.energy_key.clone(),
            StateDefinition::number(energy_name, Some("kWh")),
        ));
        defs
    }
}

/// c1..c5, then Total, then TIC.
pub fn registry() -> Result<Vec<Circuit>> {
    let mut circuits = (1..=5).map(Circuit::metered).collect::<Result<Vec<_>>>()?;
    circuits.push(Circuit::total());
    circuits.push(Circuit::tic()?);
    Ok(circuits)
}
