//! Per-lab serialization.
//!
//! Every compound operation that touches a lab's registry entry, queue, or
//! sessions runs while holding that lab's lane. Lanes for different labs are
//! independent, so work on different labs proceeds in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// One serialization lane per lab identifier.
#[derive(Default)]
pub struct LabLanes {
    lanes: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl LabLanes {
    /// Create an empty lane table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lane for `lab_id`, created on first use.
    ///
    /// Callers hold `lane.lock()` for the duration of the compound operation.
    /// Lanes are not reentrant.
    pub fn lane(&self, lab_id: &str) -> Arc<Mutex<()>> {
        if let Some(lane) = self.lanes.read().get(lab_id) {
            return Arc::clone(lane);
        }
        let mut lanes = self.lanes.write();
        Arc::clone(lanes.entry(lab_id.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_lab_shares_lane() {
        let lanes = LabLanes::new();
        let a = lanes.lane("lab-1");
        let b = lanes.lane("lab-1");
        assert!(Arc::ptr_eq(&a, &b));

        let _held = a.lock();
        assert!(b.try_lock().is_none());
        assert!(lanes.lane("lab-2").try_lock().is_some());
    }
}
