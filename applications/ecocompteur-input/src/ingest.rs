use tracing::{debug, error, info, warn};

use crate::circuits::{registry, Circuit, CircuitKind};
use crate::energy::EnergyIntegrator;
use crate::error::Result;
use crate::parser::{parse_index_page, parse_json_page, Reading};
use crate::state::{StateStore, StateValue};
use crate::validate::ReadingValidator;

/// Applies parsed device responses to the state store.
///
/// Owns the circuits and their accumulators; every `handle_*` call is one
/// complete unit of work for a poll.
pub struct Ingestor<S> {
    store: S,
    circuits: Vec<Circuit>,
    validator: ReadingValidator,
    integrator: EnergyIntegrator,
}

impl<S: StateStore> Ingestor<S> {
    pub fn new(store: S, validator: ReadingValidator) -> Result<Self> {
        Ok(Self::with_circuits(store, registry()?, validator))
    }

    pub fn with_circuits(store: S, circuits: Vec<Circuit>, validator: ReadingValidator) -> Self {
        Self {
            store,
            circuits,
            validator,
            integrator: EnergyIntegrator,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn circuits(&self) -> &[Circuit] {
        &self.circuits
    }

    pub fn circuit(&self, name: &str) -> Option<&Circuit> {
        self.circuits.iter().find(|c| c.name == name)
    }

    /// Register metadata for every key the circuits write.
    pub fn define_states(&self) -> Result<()> {
        for circuit in &self.circuits {
            for (key, definition) in circuit.definitions() {
                self.store.define(&key, &definition)?;
            }
        }
        self.store.flush()
    }

    /// Labels, power and the TIC counter from `1.html`.
    ///
    /// Circuits whose pattern did not match are logged and left untouched.
    pub fn handle_index(&mut self, body: &str, timestamp: u64) -> Result<()> {
        let page = parse_index_page(body, &self.circuits, timestamp);

        for (circuit, e) in &page.failures {
            error!(circuit = %circuit, error = %e, "index page parse failed; skipping circuit");
        }

        if let Some(tic) = &page.tic {
            if let Err(e) = self.apply_absolute_energy(tic) {
                error!(circuit = %tic.circuit, error = %e, "failed to store counter reading");
            }
        }
        let applied = self.apply_power_readings(&page.readings, timestamp);
        self.finish_poll(applied)
    }

    /// Instantaneous power from `inst.json`; a bad payload changes nothing.
    pub fn handle_json(&mut self, body: &str, timestamp: u64) -> Result<()> {
        let readings = parse_json_page(body, &self.circuits, timestamp)?;
        let applied = self.apply_power_readings(&readings, timestamp);
        self.finish_poll(applied)
    }

    /// Write 0 to every power key and forget the accumulators.
    ///
    /// Best effort: a failing key is logged and the rest are still zeroed.
    pub fn zero_readings(&mut self) {
        info!("setting zero readings");
        for circuit in &mut self.circuits {
            circuit.accumulator = Default::default();
            let Some(key) = &circuit.power_key else {
                continue;
            };
            if let Err(e) = self.store.set(key, StateValue::Number(0.0)) {
                warn!(circuit = %circuit.name, key = %key, error = %e, "failed to zero power");
            }
        }
        if let Err(e) = self.store.flush() {
            warn!(error = %e, "failed to flush zeroed readings");
        }
    }

    /// Flush whatever the poll wrote, including a partial cycle that failed.
    fn finish_poll(&self, applied: Result<()>) -> Result<()> {
        let flushed = self.store.flush();
        applied.and(flushed)
    }

    fn apply_absolute_energy(&self, reading: &Reading) -> Result<()> {
        let (Some(kwh), Some(circuit)) = (reading.energy_absolute, self.circuit(&reading.circuit))
        else {
            return Ok(());
        };
        debug!(circuit = %circuit.name, kwh, "storing counter reading");
        self.store.set(&circuit.energy_key, kwh.into())
    }

    fn apply_power_readings(&mut self, readings: &[Reading], timestamp: u64) -> Result<()> {
        for reading in readings {
            let Some(circuit) = self
                .circuits
                .iter_mut()
                .find(|c| c.name == reading.circuit)
            else {
                continue;
            };

            if let (Some(label), Some(key)) = (&reading.label, &circuit.label_key) {
                self.store.set(key, label.as_str().into())?;
            }
            if let Some(raw) = reading.power {
                let power = self.validator.validate(circuit, raw);
                record_power(&self.store, &self.integrator, circuit, reading.timestamp, power)?;
            }
        }

        // Metered circuits skipped this cycle still count with their last power.
        let total: f64 = self
            .circuits
            .iter()
            .filter(|c| c.is_metered())
            .map(|c| c.accumulator.last_power)
            .sum();
        if let Some(circuit) = self
            .circuits
            .iter_mut()
            .find(|c| matches!(c.kind, CircuitKind::Total))
        {
            record_power(&self.store, &self.integrator, circuit, timestamp, total)?;
        }
        Ok(())
    }
}

fn record_power<S: StateStore>(
    store: &S,
    integrator: &EnergyIntegrator,
    circuit: &mut Circuit,
    timestamp: u64,
    power: f64,
) -> Result<()> {
    if let Some(key) = &circuit.power_key {
        store.set(key, power.into())?;
    }
    integrator.update_energy(store, circuit, timestamp, power)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::state::{MemoryStore, StateDefinition};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ingestor(ceiling: Option<f64>) -> (Ingestor<Arc<MemoryStore>>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ing = Ingestor::new(store.clone(), ReadingValidator::new(ceiling)).unwrap();
        (ing, store)
    }

    fn json(powers: [u32; 5]) -> String {
        format!(
            r#"{{"data1": {}, "data2": {}, "data3": {}, "data4": {}, "data5": {}}}"#,
            powers[0], powers[1], powers[2], powers[3], powers[4]
        )
    }

    fn index(powers: [&str; 5], c3_label: &str) -> String {
        format!(
            r#"<script>
c1Name = getLabel("Kitchen");
c1 = {};
c2Name = getLabel("Heating");
c2 = {};
c3Name = getLabel("{c3_label}");
c3 = {};
c4Name = getLabel("Washer");
c4 = {};
c5Name = getLabel("Other");
c5 = {};
var conso_base = '123456';
</script>"#,
            powers[0], powers[1], powers[2], powers[3], powers[4]
        )
    }

    /// Memory store that rejects writes to one key and counts flushes.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        reject: Option<&'static str>,
        flushes: AtomicUsize,
    }

    impl StateStore for RecordingStore {
        fn define(&self, key: &str, definition: &StateDefinition) -> Result<()> {
            self.inner.define(key, definition)
        }

        fn get(&self, key: &str) -> Result<Option<StateValue>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: StateValue) -> Result<()> {
            if self.reject == Some(key) {
                return Err(AppError::State(format!("write to {key} rejected")));
            }
            self.inner.set(key, value)
        }

        fn flush(&self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_total_is_sum_of_validated_powers() {
        let (mut ing, store) = ingestor(None);

        ing.handle_json(&json([100, 0, 50, 0, 0]), 1_000).unwrap();
        assert_eq!(store.number("cTotal.power"), Some(150.0));
        assert_eq!(store.number("cTotal.energy"), None);

        ing.handle_json(&json([0, 0, 0, 0, 0]), 3_601_000).unwrap();
        assert_eq!(store.number("cTotal.power"), Some(0.0));
        assert_eq!(store.number("cTotal.energy"), Some(0.15));
        assert_eq!(store.number("c1.energy"), Some(0.1));
        assert_eq!(store.number("c3.energy"), Some(0.05));
    }

    #[test]
    fn test_spike_is_frozen_before_storage_and_integration() {
        let (mut ing, store) = ingestor(Some(1000.0));

        ing.handle_json(&json([50, 0, 0, 0, 0]), 1_000).unwrap();
        ing.handle_json(&json([5000, 0, 0, 0, 0]), 3_601_000).unwrap();

        assert_eq!(store.number("c1.power"), Some(50.0));
        assert_eq!(store.number("cTotal.power"), Some(50.0));
        assert_eq!(ing.circuit("c1").unwrap().accumulator.last_power, 50.0);
    }

    #[test]
    fn test_bad_json_leaves_state_untouched() {
        let (mut ing, store) = ingestor(None);
        ing.handle_json(&json([10, 20, 30, 40, 50]), 1_000).unwrap();

        assert!(ing.handle_json("not json", 2_000).is_err());
        assert_eq!(store.number("c1.power"), Some(10.0));
        assert_eq!(store.number("cTotal.power"), Some(150.0));
        assert_eq!(ing.circuit("c1").unwrap().accumulator.last_timestamp, Some(1_000));
    }

    #[test]
    fn test_zero_readings_clears_powers_and_accumulators() {
        let (mut ing, store) = ingestor(None);
        ing.handle_json(&json([10, 20, 30, 40, 50]), 1_000).unwrap();

        ing.zero_readings();

        for key in ["c1.power", "c2.power", "c3.power", "c4.power", "c5.power", "cTotal.power"] {
            assert_eq!(store.number(key), Some(0.0), "{key}");
        }
        assert!(ing.circuits().iter().all(|c| !c.accumulator.has_sample()));
        assert_eq!(store.get("TICReading").unwrap(), None);
    }

    #[test]
    fn test_skipped_index_circuit_keeps_state_and_counts_in_total() {
        let (mut ing, store) = ingestor(None);
        let full = ["100", "200", "300", "400", "500"];
        ing.handle_index(&index(full, "Lights"), 1_000).unwrap();
        ing.handle_index(&index(full, "Lights"), 3_601_000).unwrap();

        let c3_energy = store.number("c3.energy");
        assert!(c3_energy.is_some());
        let c3_accumulator = ing.circuit("c3").unwrap().accumulator.clone();

        ing.handle_index(&index(["10", "20", "n/a", "40", "50"], "Renamed"), 7_201_000)
            .unwrap();

        assert_eq!(store.text("c3.label").as_deref(), Some("Lights"));
        assert_eq!(store.number("c3.power"), Some(300.0));
        assert_eq!(store.number("c3.energy"), c3_energy);
        assert_eq!(ing.circuit("c3").unwrap().accumulator, c3_accumulator);

        assert_eq!(store.number("c1.power"), Some(10.0));
        assert_eq!(store.number("c5.power"), Some(50.0));
        assert_eq!(store.number("cTotal.power"), Some(10.0 + 20.0 + 300.0 + 40.0 + 50.0));
    }

    #[test]
    fn test_counter_write_failure_still_applies_powers() {
        let store = Arc::new(RecordingStore {
            reject: Some("TICReading"),
            ..Default::default()
        });
        let mut ing = Ingestor::new(store.clone(), ReadingValidator::new(None)).unwrap();

        ing.handle_index(&index(["100", "200", "300", "400", "500"], "Lights"), 1_000)
            .unwrap();

        assert_eq!(store.inner.get("TICReading").unwrap(), None);
        assert_eq!(store.inner.number("c1.power"), Some(100.0));
        assert_eq!(store.inner.text("c3.label").as_deref(), Some("Lights"));
        assert_eq!(store.inner.number("cTotal.power"), Some(1500.0));
    }

    #[test]
    fn test_each_poll_flushes_once() {
        let store = Arc::new(RecordingStore::default());
        let mut ing = Ingestor::new(store.clone(), ReadingValidator::new(None)).unwrap();

        ing.define_states().unwrap();
        assert_eq!(store.flushes.load(Ordering::SeqCst), 1);

        ing.handle_index(&index(["1", "2", "3", "4", "5"], "Lights"), 1_000)
            .unwrap();
        ing.handle_json(&json([1, 2, 3, 4, 5]), 2_000).unwrap();
        assert_eq!(store.flushes.load(Ordering::SeqCst), 3);

        assert!(ing.handle_json("not json", 3_000).is_err());
        assert_eq!(store.flushes.load(Ordering::SeqCst), 3);

        ing.zero_readings();
        assert_eq!(store.flushes.load(Ordering::SeqCst), 4);
    }
}
