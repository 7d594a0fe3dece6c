//! Change detection against the last emitted snapshot per instrument.
//!
//! Guarantees:
//! - The baseline is always the most recently *emitted* snapshot, never a
//!   partially-applied one: detection and baseline replacement happen
//!   inside a single lock scope, with no await held across it.
//! - A first-ever snapshot for a symbol is always material.
//! - Otherwise an update is material when the price moved by more than
//!   the configured epsilon, or when the volume changed at all.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::market::types::{InstrumentSnapshot, UpdateRecord, UpdateSource};

pub struct ChangeDetector {
    /// Price moves within this absolute epsilon are noise.
    epsilon: f64,

    /// Last emitted snapshot per symbol. Unbounded by design; bounded in
    /// practice by the fixed instrument universe.
    baselines: Mutex<HashMap<String, InstrumentSnapshot>>,
}

impl ChangeDetector {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    /// Compares `snapshot` against the baseline and produces the update
    /// record. On a material change the baseline is replaced before the
    /// lock is released; otherwise it is left untouched and the record
    /// still flows downstream so cache TTLs get refreshed.
    pub fn observe(&self, snapshot: InstrumentSnapshot, source: UpdateSource) -> UpdateRecord {
        let mut baselines = self.baselines.lock();

        let change_detected = match baselines.get(&snapshot.symbol) {
            None => true,
            Some(prev) => {
                (snapshot.price - prev.price).abs() > self.epsilon
                    || snapshot.volume != prev.volume
            }
        };

        if change_detected {
            baselines.insert(snapshot.symbol.clone(), snapshot.clone());
        } else {
            debug!(symbol = %snapshot.symbol, "update below materiality threshold");
        }

        UpdateRecord {
            snapshot,
            source,
            change_detected,
        }
    }

    /// Latest emitted snapshot for one symbol.
    pub fn baseline(&self, symbol: &str) -> Option<InstrumentSnapshot> {
        self.baselines.lock().get(symbol).cloned()
    }

    /// Latest emitted snapshot of every tracked symbol.
    pub fn baselines(&self) -> Vec<InstrumentSnapshot> {
        self.baselines.lock().values().cloned().collect()
    }

    pub fn tracked(&self) -> usize {
        self.baselines.lock().len()
    }
}
