//! Extraction of readings from the two device responses.
//!
//! `1.html` embeds the circuit labels, their current power and the TIC
//! counter in inline script; `inst.json` carries power only.

use serde_json::Value;
use tracing::debug;

use crate::circuits::{Circuit, CircuitKind};
use crate::error::{AppError, Result};

/// One extracted value set, consumed immediately by the ingestor.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub circuit: String,
    pub power: Option<f64>,
    pub label: Option<String>,
    pub energy_absolute: Option<f64>,
    pub timestamp: u64,
}

#[derive(Debug, Default)]
pub struct IndexPage {
    /// Label and power for each metered circuit that matched.
    pub readings: Vec<Reading>,
    /// Cumulative kWh from the TIC counter, if it matched.
    pub tic: Option<Reading>,
    /// Circuits skipped this cycle, with the reason.
    pub failures: Vec<(String, AppError)>,
}

pub fn parse_index_page(body: &str, circuits: &[Circuit], timestamp: u64) -> IndexPage {
    let mut page = IndexPage::default();

    for circuit in circuits {
        match &circuit.kind {
            CircuitKind::Metered { label_pattern, .. } => {
                match label_pattern.captures(body) {
                    Some(caps) => {
                        let label = caps[1].trim().to_string();
                        match caps[2].parse::<u64>() {
                            Ok(watts) => {
                                debug!(circuit = %circuit.name, label = %label, watts, "index reading");
                                page.readings.push(Reading {
                                    circuit: circuit.name.clone(),
                                    power: Some(watts as f64),
                                    label: Some(label),
                                    energy_absolute: None,
                                    timestamp,
                                });
                            }
                            Err(e) => page.failures.push((
                                circuit.name.clone(),
                                AppError::Parse(format!("power for {}: {e}", circuit.name)),
                            )),
                        }
                    }
                    None => page.failures.push((
                        circuit.name.clone(),
                        AppError::Parse(format!("no label/power match for {}", circuit.name)),
                    )),
                }
            }
            CircuitKind::Tic {
                energy_pattern,
                scale,
            } => {
                let raw = energy_pattern
                    .captures(body)
                    .map(|caps| caps[1].parse::<u64>());
                match raw {
                    Some(Ok(raw)) => {
                        let kwh = raw as f64 / scale;
                        debug!(circuit = %circuit.name, kwh, "TIC reading");
                        page.tic = Some(Reading {
                            circuit: circuit.name.clone(),
                            power: None,
                            label: None,
                            energy_absolute: Some(kwh),
                            timestamp,
                        });
                    }
                    Some(Err(e)) => page.failures.push((
                        circuit.name.clone(),
                        AppError::Parse(format!("TIC value: {e}")),
                    )),
                    None => page.failures.push((
                        circuit.name.clone(),
                        AppError::Parse("no TIC counter match".into()),
                    )),
                }
            }
            CircuitKind::Total => {}
        }
    }

    page
}

/// Power for every metered circuit, or an error that applies to all of them.
pub fn parse_json_page(body: &str, circuits: &[Circuit], timestamp: u64) -> Result<Vec<Reading>> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| AppError::Parse(format!("malformed JSON payload: {e}")))?;
    let obj = json
        .as_object()
        .ok_or_else(|| AppError::Parse("JSON payload is not an object".into()))?;

    circuits
        .iter()
        .filter_map(|c| match &c.kind {
            CircuitKind::Metered { json_field, .. } => Some((c, json_field)),
            _ => None,
        })
        .map(|(circuit, field)| {
            let watts = obj
                .get(field)
                .and_then(Value::as_f64)
                .filter(|w| w.is_finite() && *w >= 0.0)
                .ok_or_else(|| {
                    AppError::Parse(format!("missing or invalid '{field}' for {}", circuit.name))
                })?;
            Ok(Reading {
                circuit: circuit.name.clone(),
                power: Some(watts),
                label: None,
                energy_absolute: None,
                timestamp,
            })
        })
        .collect()
}
