use crate::host::application::AnalysisResult;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct DeviceResults {
    /// Profile generation the cached results belong to
    generation: u64,
    apps: HashMap<String, AnalysisResult>,
}

/// Latest analysis result per (device, application)
///
/// Guarded by its own lock, independent of the device-state lock. Entries are
/// overwritten each cycle; no history is kept. Each device remembers the
/// newest profile generation seen, and writes computed from an older
/// generation are discarded.
#[derive(Debug, Default)]
pub struct ResultTable {
    inner: RwLock<HashMap<String, DeviceResults>>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result computed from a snapshot of profile `generation`
    ///
    /// Returns `false` when the device has since moved to a newer profile.
    pub fn store(
        &self,
        device_id: &str,
        generation: u64,
        app_id: &str,
        result: AnalysisResult,
    ) -> bool {
        let mut inner = self.inner.write();
        let entry = inner.entry(device_id.to_string()).or_default();
        if generation < entry.generation {
            return false;
        }
        if generation > entry.generation {
            entry.generation = generation;
            entry.apps.clear();
        }
        entry.apps.insert(app_id.to_string(), result);
        true
    }

    /// Copy of the latest results for a device; empty if no cycle produced any
    pub fn device_results(&self, device_id: &str) -> HashMap<String, AnalysisResult> {
        self.inner
            .read()
            .get(device_id)
            .map(|entry| entry.apps.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, device_id: &str, app_id: &str) -> Option<AnalysisResult> {
        self.inner
            .read()
            .get(device_id)
            .and_then(|entry| entry.apps.get(app_id))
            .cloned()
    }

    /// Drop cached results older than profile `generation` and reject later
    /// writes from older snapshots; returns whether anything was dropped
    pub fn reset_device(&self, device_id: &str, generation: u64) -> bool {
        let mut inner = self.inner.write();
        let entry = inner.entry(device_id.to_string()).or_default();
        if generation <= entry.generation {
            return false;
        }
        entry.generation = generation;
        let had_results = !entry.apps.is_empty();
        entry.apps.clear();
        had_results
    }

    /// Devices with at least one cached result
    pub fn device_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|entry| !entry.apps.is_empty())
            .count()
    }
}
