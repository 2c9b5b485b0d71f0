//! Read-mostly zone reference data
//!
//! Readers take a cheap `Arc` snapshot and never observe a partially
//! updated set; writers replace the whole set at once.

use crate::domain::error::ZoneError;
use crate::domain::zone::Zone;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ZoneSet {
    zones: RwLock<Arc<[Zone]>>,
}

impl ZoneSet {
    pub fn new(zones: Vec<Zone>) -> Self {
        for zone in &zones {
            if let Err(e) = zone.validate() {
                warn!(zone_id = %zone.id, error = %e, "zone_definition_malformed");
            }
        }
        Self { zones: RwLock::new(zones.into()) }
    }

    pub fn empty() -> Self {
        Self { zones: RwLock::new(Arc::from(Vec::new())) }
    }

    /// Consistent view of every zone, active or not
    #[inline]
    pub fn snapshot(&self) -> Arc<[Zone]> {
        self.zones.read().clone()
    }

    /// Atomically swap in a new zone set after checking every definition
    pub fn replace(&self, zones: Vec<Zone>) -> Result<usize, ZoneError> {
        let mut seen = FxHashSet::default();
        for zone in &zones {
            zone.validate()?;
            if !seen.insert(zone.id) {
                return Err(ZoneError::DuplicateId(zone.id));
            }
        }

        let count = zones.len();
        let active = zones.iter().filter(|z| z.active).count();
        *self.zones.write() = zones.into();
        info!(zones = %count, active = %active, "zone_set_replaced");
        Ok(count)
    }

    /// Active zones containing the point, independent of any transition state
    pub fn containing(&self, lat: f64, lon: f64) -> Vec<Zone> {
        self.snapshot().iter().filter(|z| z.active && z.contains(lat, lon)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.zones.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ZoneSet {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ZoneId;
    use crate::domain::zone::ZoneKind;

    fn zones() -> Vec<Zone> {
        vec![
            Zone::circle(1, "depot", ZoneKind::Allowed, 0.0, 0.0, 1000.0),
            Zone::polygon(
                2,
                "square",
                ZoneKind::Restricted,
                vec![[-0.01, -0.01], [-0.01, 0.01], [0.01, 0.01], [0.01, -0.01]],
            ),
            Zone::circle(3, "closed", ZoneKind::Checkpoint, 0.0, 0.0, 5000.0).inactive(),
        ]
    }

    #[test]
    fn test_containing_skips_inactive() {
        let set = ZoneSet::new(zones());
        let ids: Vec<_> = set.containing(0.0, 0.0).iter().map(|z| z.id).collect();
        assert_eq!(ids, vec![ZoneId(1), ZoneId(2)]);
        assert!(set.containing(10.0, 10.0).is_empty());
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let set = ZoneSet::new(zones());
        let before = set.snapshot();
        set.replace(vec![Zone::circle(7, "new", ZoneKind::Checkpoint, 5.0, 5.0, 10.0)]).unwrap();
        assert_eq!(before.len(), 3);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_replace_rejects_bad_input_and_keeps_old_set() {
        let set = ZoneSet::new(zones());
        let bad = vec![Zone::polygon(9, "line", ZoneKind::Checkpoint, vec![[0.0, 0.0], [1.0, 1.0]])];
        assert!(matches!(set.replace(bad), Err(ZoneError::TooFewVertices { .. })));

        let dup = vec![
            Zone::circle(4, "a", ZoneKind::Checkpoint, 0.0, 0.0, 10.0),
            Zone::circle(4, "b", ZoneKind::Checkpoint, 0.0, 0.0, 10.0),
        ];
        assert_eq!(set.replace(dup), Err(ZoneError::DuplicateId(ZoneId(4))));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_empty_set() {
        let set = ZoneSet::empty();
        assert!(set.is_empty());
        assert!(set.containing(0.0, 0.0).is_empty());
    }
}
