use std::collections::BTreeMap;

use fleet_core::{DeviceId, PositionUpdate, Timestamp};

/// Requested window for a single device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillWindow {
    pub from: Timestamp,
    pub to: Timestamp,
}

/// Per-device result of a backfill run
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceBackfillOutcome {
    Completed {
        window: BackfillWindow,
        fetched: usize,
        inserted: usize,
        deduped: usize,
    },
    Failed {
        window: BackfillWindow,
        reason: String,
    },
    /// Run was cancelled before this device's results were merged
    Discarded,
}

/// Result of one reconnect backfill across all tracked devices
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillSummary {
    pub requested_devices: usize,
    pub inserted_count: usize,
    pub deduped_count: usize,
    pub failed_devices: Vec<DeviceId>,
    pub outcomes: BTreeMap<DeviceId, DeviceBackfillOutcome>,
    /// Positions attached to novel events, for merging into the live view
    pub recovered_positions: Vec<PositionUpdate>,
    /// Anchor of each device after the run
    pub anchors: BTreeMap<DeviceId, Timestamp>,
}

impl BackfillSummary {
    pub fn fetched_count(&self) -> usize {
        self.outcomes
            .values()
            .map(|outcome| match outcome {
                DeviceBackfillOutcome::Completed { fetched, .. } => *fetched,
                _ => 0,
            })
            .sum()
    }

    /// True if every requested device completed
    pub fn is_complete(&self) -> bool {
        self.failed_devices.is_empty()
            && self
                .outcomes
                .values()
                .all(|outcome| matches!(outcome, DeviceBackfillOutcome::Completed { .. }))
    }
}
