// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scale bridge liveness.
//!
//! Only the newest heartbeat matters. Online status is derived at read time
//! from its age, so a bridge that stops pinging goes offline without any
//! timer firing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::reading::{Heartbeat, ScriptStatus};

#[derive(Debug)]
pub struct HeartbeatMonitor {
    latest: RwLock<Option<Heartbeat>>,
    online_window: Duration,
}

impl HeartbeatMonitor {
    pub fn new(online_window: Duration) -> Self {
        Self {
            latest: RwLock::new(None),
            online_window,
        }
    }

    /// Record a heartbeat. Out-of-order heartbeats older than the current one
    /// are ignored. Returns whether it became the latest.
    pub fn record(&self, heartbeat: Heartbeat) -> bool {
        let mut latest = self.latest.write();
        if let Some(current) = latest.as_ref() {
            if heartbeat.created_at < current.created_at {
                debug!(device = %heartbeat.device_id, "Ignoring out-of-order heartbeat");
                return false;
            }
        }
        *latest = Some(heartbeat);
        true
    }

    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> ScriptStatus {
        match self.latest.read().as_ref() {
            Some(heartbeat) => ScriptStatus::from_heartbeat(heartbeat, now, self.online_window),
            None => ScriptStatus::offline(),
        }
    }

    pub fn clear(&self) {
        *self.latest.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn heartbeat(secs: i64) -> Heartbeat {
        Heartbeat {
            device_id: "tanita-01".into(),
            device_name: Some("Front desk".into()),
            created_at: at(secs),
        }
    }

    #[test]
    fn test_offline_before_any_heartbeat() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        assert_eq!(monitor.status(at(0)), ScriptStatus::offline());
    }

    #[test]
    fn test_goes_offline_when_pings_stop() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        monitor.record(heartbeat(0));
        assert!(monitor.status(at(10)).is_online);
        assert!(!monitor.status(at(31)).is_online);

        monitor.record(heartbeat(40));
        let status = monitor.status(at(41));
        assert!(status.is_online);
        assert_eq!(status.last_heartbeat, Some(at(40)));
    }

    #[test]
    fn test_out_of_order_heartbeat_ignored() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        assert!(monitor.record(heartbeat(20)));
        assert!(!monitor.record(heartbeat(5)));
        assert_eq!(monitor.status(at(21)).last_heartbeat, Some(at(20)));

        monitor.clear();
        assert!(!monitor.status(at(21)).is_online);
    }
}
