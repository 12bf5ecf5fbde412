use super::{PointRecord, PointValue, TagValue};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Key value store of typed points guarded by a single writer / many
/// reader lock. Missing keys never fail a read; they degrade to the
/// requested type's default so logic evaluation always makes progress.
#[derive(Default)]
pub struct TagStore {
    points: RwLock<HashMap<String, PointRecord>>,
}

impl TagStore {
    /// Inserts a point with the provided initial value and a zero
    /// timestamp. Repeated adds for the same key overwrite.
    pub fn add(&self, key: &str, value: impl Into<TagValue>) {
        self.points.write().insert(
            key.to_string(),
            PointRecord {
                value: value.into(),
                timestamp: 0.0,
            },
        );
    }

    /// Replaces the value and timestamp of an existing point. Returns
    /// false without creating the point when the key is unknown.
    pub fn set(&self, key: &str, value: impl Into<TagValue>, timestamp: f64) -> bool {
        let mut points = self.points.write();
        match points.get_mut(key) {
            Some(record) => {
                record.value = value.into();
                record.timestamp = timestamp;
                true
            }
            None => false,
        }
    }

    /// Reads a point as `T`, substituting `T::default()` when the key is
    /// missing or holds a different variant.
    pub fn get<T: PointValue>(&self, key: &str) -> T {
        self.points
            .read()
            .get(key)
            .and_then(|record| T::from_value(record.value))
            .unwrap_or_default()
    }

    pub fn timestamp(&self, key: &str) -> f64 {
        self.points
            .read()
            .get(key)
            .map(|record| record.timestamp)
            .unwrap_or_default()
    }

    pub fn has(&self, key: &str) -> bool {
        self.points.read().contains_key(key)
    }

    pub fn clear(&self) {
        self.points.write().clear();
    }

    /// Copies out the current contents, sorted by key for stable output.
    pub fn snapshot(&self) -> Vec<(String, PointRecord)> {
        let mut entries: Vec<(String, PointRecord)> = self
            .points
            .read()
            .iter()
            .map(|(key, record)| (key.clone(), *record))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
