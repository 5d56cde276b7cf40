//! Power to energy integration.
//!
//! Each sample's power is held constant until the next sample (left
//! rectangle), so the increment for an interval always uses the previous
//! power.

use tracing::{debug, warn};

use crate::circuits::Circuit;
use crate::error::Result;
use crate::state::StateStore;

pub const MS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyIntegrator;

impl EnergyIntegrator {
    /// Fold a new power sample into the circuit's stored energy.
    ///
    /// Returns the new accumulated kWh, or `None` for a circuit's first sample.
    /// The accumulator moves to `(timestamp, power)` unless the store fails.
    pub fn update_energy<S: StateStore + ?Sized>(
        &self,
        store: &S,
        circuit: &mut Circuit,
        timestamp: u64,
        power: f64,
    ) -> Result<Option<f64>> {
        let Some(last_timestamp) = circuit.accumulator.last_timestamp else {
            debug!(circuit = %circuit.name, power, "first sample; seeding accumulator");
            circuit.accumulator.last_timestamp = Some(timestamp);
            circuit.accumulator.last_power = power;
            return Ok(None);
        };

        let elapsed_ms = timestamp.saturating_sub(last_timestamp) as f64;
        let period_hours = elapsed_ms / MS_PER_HOUR;
        let increment = circuit.accumulator.last_power / 1000.0 * period_hours;

        let previous = match store.get(&circuit.energy_key)?.and_then(|v| v.as_f64()) {
            Some(v) => v,
            None => {
                warn!(
                    circuit = %circuit.name,
                    key = %circuit.energy_key,
                    "no stored energy; accumulating from 0"
                );
                0.0
            }
        };
        let energy = previous + increment;
        store.set(&circuit.energy_key, energy.into())?;

        debug!(
            circuit = %circuit.name,
            last_power = circuit.accumulator.last_power,
            period_hours,
            increment,
            energy,
            "energy updated"
        );

        circuit.accumulator.last_timestamp = Some(timestamp);
        circuit.accumulator.last_power = power;
        Ok(Some(energy))
    }
}
