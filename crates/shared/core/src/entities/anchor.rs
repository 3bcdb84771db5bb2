use serde::{Deserialize, Serialize};

use crate::values::{DeviceId, Timestamp};

/// Persisted watermark of the last record known to be processed for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayAnchor {
    pub device_id: DeviceId,
    pub last_seen: Timestamp,
}

impl ReplayAnchor {
    pub fn new(device_id: DeviceId, last_seen: Timestamp) -> Self {
        ReplayAnchor {
            device_id,
            last_seen,
        }
    }

    /// Move the anchor to `observed` if it is newer. Returns true if it moved.
    pub fn advance(&mut self, observed: Timestamp) -> bool {
        if observed > self.last_seen {
            self.last_seen = observed;
            true
        } else {
            false
        }
    }

    /// Forward-only merge of an optional stored value and a new observation
    pub fn merged(existing: Option<Timestamp>, observed: Timestamp) -> Timestamp {
        match existing {
            Some(existing) if existing > observed => existing,
            _ => observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_anchor_never_regresses() {
        let now = Utc::now();
        let mut anchor = ReplayAnchor::new(DeviceId::new(1), now);

        assert!(!anchor.advance(now - Duration::minutes(5)));
        assert_eq!(anchor.last_seen, now);

        assert!(anchor.advance(now + Duration::minutes(5)));
        assert_eq!(anchor.last_seen, now + Duration::minutes(5));
    }

    #[test]
    fn test_merged_takes_max() {
        let now = Utc::now();
        let earlier = now - Duration::seconds(30);

        assert_eq!(ReplayAnchor::merged(Some(now), earlier), now);
        assert_eq!(ReplayAnchor::merged(Some(earlier), now), now);
        assert_eq!(ReplayAnchor::merged(None, earlier), earlier);
    }
}
