use super::{wall_clock_seconds, PointValue, TagStore};
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Owns the two point stores (internal tags and external i/o points), the
/// alias mapping between them, the binary/analog classification lists, and
/// the pending update queues protocol servers push writes through.
///
/// Reads and writes by tag follow at most one level of indirection: a tag
/// with an alias resolves through `tag_to_point` into the external store,
/// anything else operates on the internal store directly.
#[derive(Default)]
pub struct TagManager {
    internal: TagStore,
    external: TagStore,
    /// io id -> external point
    external_points: RwLock<HashMap<String, String>>,
    /// alias tag -> io id
    tag_to_point: RwLock<HashMap<String, String>>,
    binary_tags: RwLock<Vec<String>>,
    analog_tags: RwLock<Vec<String>>,
    updated_binary: Mutex<HashMap<String, bool>>,
    updated_analog: Mutex<HashMap<String, f64>>,
}

impl TagManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an external i/o point, seeding the external store with the
    /// type's default value.
    pub fn add_external_data<T: PointValue>(&self, id: &str, point: &str) {
        self.external.add(point, T::default());
        self.external_points
            .write()
            .insert(id.to_string(), point.to_string());
    }

    /// Registers an internal tag with its configured initial value.
    pub fn add_internal_data(&self, tag: &str, value: impl PointValue) {
        self.internal.add(tag, value);
    }

    /// Maps an alias tag onto an i/o point id. Fails without touching any
    /// state when the point id has not been registered.
    pub fn add_tag_to_point_mapping(&self, tag: &str, point_id: &str) -> bool {
        if !self.external_points.read().contains_key(point_id) {
            return false;
        }
        self.tag_to_point
            .write()
            .insert(tag.to_string(), point_id.to_string());
        true
    }

    /// Resolves an alias tag to its external point, if it has one.
    pub fn point_by_tag(&self, tag: &str) -> Option<String> {
        let point_id = self.tag_to_point.read().get(tag).cloned()?;
        self.external_points.read().get(&point_id).cloned()
    }

    pub fn get_data_by_tag<T: PointValue>(&self, tag: &str) -> T {
        match self.point_by_tag(tag) {
            Some(point) => self.external.get(&point),
            None => self.internal.get(tag),
        }
    }

    pub fn get_data_by_point<T: PointValue>(&self, point: &str) -> T {
        self.external.get(point)
    }

    pub fn timestamp_by_tag(&self, tag: &str) -> f64 {
        match self.point_by_tag(tag) {
            Some(point) => self.external.timestamp(&point),
            None => 0.0,
        }
    }

    /// Writes through an alias into the external store. Tags without an
    /// alias cannot be written this way.
    pub fn set_data_by_tag(&self, tag: &str, value: impl PointValue) -> bool {
        match self.point_by_tag(tag) {
            Some(point) => self.external.set(&point, value, 0.0),
            None => false,
        }
    }

    /// Writes an external point directly, stamping it with the wall clock.
    pub fn set_data_by_point(&self, point: &str, value: impl PointValue) -> bool {
        self.external.set(point, value, wall_clock_seconds())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        if let Some(point_id) = self.tag_to_point.read().get(tag) {
            return match self.external_points.read().get(point_id) {
                Some(point) => self.external.has(point),
                None => false,
            };
        }
        self.internal.has(tag)
    }

    pub fn has_point(&self, point: &str) -> bool {
        self.external.has(point)
    }

    pub fn add_binary_tag(&self, tag: &str) {
        self.binary_tags.write().push(tag.to_string());
    }

    pub fn add_analog_tag(&self, tag: &str) {
        self.analog_tags.write().push(tag.to_string());
    }

    pub fn binary_tags(&self) -> Vec<String> {
        self.binary_tags.read().clone()
    }

    pub fn analog_tags(&self) -> Vec<String> {
        self.analog_tags.read().clone()
    }

    pub fn is_binary(&self, tag: &str) -> bool {
        self.binary_tags.read().iter().any(|name| name == tag)
    }

    pub fn is_analog(&self, tag: &str) -> bool {
        self.analog_tags.read().iter().any(|name| name == tag)
    }

    /// Queues a binary value for the next scan cycle to apply.
    pub fn add_updated_binary(&self, tag: &str, status: bool) {
        self.updated_binary.lock().insert(tag.to_string(), status);
    }

    /// Queues an analog value for the next scan cycle to apply.
    pub fn add_updated_analog(&self, tag: &str, value: f64) {
        self.updated_analog.lock().insert(tag.to_string(), value);
    }

    pub fn is_updated_binary(&self, tag: &str) -> bool {
        self.updated_binary.lock().contains_key(tag)
    }

    pub fn is_updated_analog(&self, tag: &str) -> bool {
        self.updated_analog.lock().contains_key(tag)
    }

    /// Applies every queued update whose tag lives in the internal store.
    /// Aliased tags were already written straight to their external points
    /// by the producer, so only internal tags move here.
    pub fn update_internal_data(&self) {
        {
            let updated = self.updated_binary.lock();
            for (tag, status) in updated.iter() {
                if self.internal.has(tag) {
                    self.internal.set(tag, *status, 0.0);
                }
            }
        }
        {
            let updated = self.updated_analog.lock();
            for (tag, value) in updated.iter() {
                if self.internal.has(tag) {
                    self.internal.set(tag, *value, 0.0);
                }
            }
        }
    }

    /// Applies queued updates for aliased tags to their external points,
    /// stamping the point timestamps. This is the output half of the scan
    /// cycle's drain.
    pub fn update_external_data(&self) {
        {
            let updated = self.updated_binary.lock();
            for (tag, status) in updated.iter() {
                if let Some(point) = self.point_by_tag(tag) {
                    self.external.set(&point, *status, wall_clock_seconds());
                }
            }
        }
        {
            let updated = self.updated_analog.lock();
            for (tag, value) in updated.iter() {
                if let Some(point) = self.point_by_tag(tag) {
                    self.external.set(&point, *value, wall_clock_seconds());
                }
            }
        }
    }

    /// Empties both pending queues. Each queue is cleared under its own
    /// class lock.
    pub fn clear_updated_tags(&self) {
        self.updated_binary.lock().clear();
        self.updated_analog.lock().clear();
    }

    /// Debug dump of the external store, emitted periodically by the scan
    /// cycle.
    pub fn dump_external_data(&self) {
        let snapshot = self.external.snapshot();
        if snapshot.is_empty() {
            return;
        }
        debug!("============ DATA ============");
        for (point, record) in snapshot {
            debug!("{} -- {:?}", point, record.value);
        }
        debug!("==============================");
    }
}

#[cfg(test)]
mod test {
    use super::TagManager;

    #[test]
    fn test_mapping_requires_known_point() {
        let manager = TagManager::new();
        assert!(!manager.add_tag_to_point_mapping("brkr", "io.1"));
        manager.add_external_data::<bool>("io.1", "branch-1.closed");
        assert!(manager.add_tag_to_point_mapping("brkr", "io.1"));
    }

    #[test]
    fn test_tag_and_point_reads_agree() {
        let manager = TagManager::new();
        manager.add_external_data::<f64>("io.2", "bus-1.voltage");
        assert!(manager.add_tag_to_point_mapping("volts", "io.2"));

        manager.set_data_by_point("bus-1.voltage", 118.4);
        assert_eq!(manager.get_data_by_tag::<f64>("volts"), 118.4);
        assert_eq!(manager.get_data_by_point::<f64>("bus-1.voltage"), 118.4);
    }

    #[test]
    fn test_point_write_timestamps_advance() {
        let manager = TagManager::new();
        manager.add_external_data::<f64>("io.3", "gen-1.mw");
        manager.add_tag_to_point_mapping("gen-power", "io.3");

        assert_eq!(manager.timestamp_by_tag("gen-power"), 0.0);
        manager.set_data_by_point("gen-1.mw", 1.0);
        let first = manager.timestamp_by_tag("gen-power");
        assert!(first > 0.0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        manager.set_data_by_point("gen-1.mw", 2.0);
        assert!(manager.timestamp_by_tag("gen-power") > first);
    }

    #[test]
    fn test_internal_fallback_without_alias() {
        let manager = TagManager::new();
        manager.add_internal_data("foo", false);
        assert!(manager.has_tag("foo"));
        assert!(!manager.set_data_by_tag("foo", true));
        assert!(!manager.get_data_by_tag::<bool>("foo"));
    }

    #[test]
    fn test_pending_updates_apply_to_internal_tags_only() {
        let manager = TagManager::new();
        manager.add_internal_data("foo", false);
        manager.add_external_data::<bool>("io.4", "xfmr.lockout");
        manager.add_tag_to_point_mapping("lockout", "io.4");

        manager.add_updated_binary("foo", true);
        manager.add_updated_binary("lockout", true);
        assert!(manager.is_updated_binary("foo"));

        manager.update_internal_data();
        assert!(manager.get_data_by_tag::<bool>("foo"));
        // The aliased tag resolves externally and is not moved by the drain
        assert!(!manager.get_data_by_tag::<bool>("lockout"));

        manager.clear_updated_tags();
        assert!(!manager.is_updated_binary("foo"));
        assert!(!manager.is_updated_analog("foo"));
    }
}
