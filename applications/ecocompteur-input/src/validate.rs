use tracing::warn;

use crate::circuits::Circuit;

/// Rejects power readings above a configured ceiling.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadingValidator {
    ceiling: Option<f64>,
}

impl ReadingValidator {
    /// A ceiling of `None` or `<= 0` disables validation.
    pub fn new(ceiling: Option<f64>) -> Self {
        Self {
            ceiling: ceiling.filter(|c| *c > 0.0),
        }
    }

    /// Spikes above the ceiling are replaced by the circuit's last accepted
    /// power, or 0 when it has none.
    pub fn validate(&self, circuit: &Circuit, raw_power: f64) -> f64 {
        let Some(ceiling) = self.ceiling else {
            return raw_power;
        };
        if raw_power <= ceiling {
            return raw_power;
        }

        if circuit.accumulator.has_sample() {
            let kept = circuit.accumulator.last_power;
            warn!(
                circuit = %circuit.name,
                raw_power,
                ceiling,
                kept,
                "power above ceiling; keeping last accepted value"
            );
            kept
        } else {
            warn!(
                circuit = %circuit.name,
                raw_power,
                ceiling,
                "power above ceiling with no prior reading; using 0"
            );
            0.0
        }
    }
}
