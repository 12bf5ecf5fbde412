//! Typed point storage for the device: the tag stores themselves and the
//! manager that owns the internal/external split, the tag to point mapping,
//! and the pending update queues the protocol modules write into.

pub mod manager;
pub mod store;

pub use manager::TagManager;
pub use store::TagStore;

/// Value stored at a point. Every value carries its type; reads through a
/// mismatched type degrade to that type's zero value rather than failing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TagValue {
    Bool(bool),
    Int32(i32),
    Float64(f64),
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        TagValue::Int32(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float64(value)
    }
}

/// Types that can be read back out of a [`TagValue`]. Reads return `None`
/// on a variant mismatch so the stores can substitute the type's default.
pub trait PointValue: Copy + Default + Into<TagValue> {
    fn from_value(value: TagValue) -> Option<Self>;
}

impl PointValue for bool {
    fn from_value(value: TagValue) -> Option<Self> {
        match value {
            TagValue::Bool(value) => Some(value),
            _ => None,
        }
    }
}

impl PointValue for i32 {
    fn from_value(value: TagValue) -> Option<Self> {
        match value {
            TagValue::Int32(value) => Some(value),
            _ => None,
        }
    }
}

impl PointValue for f64 {
    fn from_value(value: TagValue) -> Option<Self> {
        match value {
            TagValue::Float64(value) => Some(value),
            _ => None,
        }
    }
}

/// Classification of a tag. Every tag belongs to exactly one class; the
/// class decides which pending update queue carries its writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Binary,
    Analog,
}

/// Stored value plus the wall clock instant of its last write. The
/// timestamp stays zero until the point is written through `set`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRecord {
    pub value: TagValue,
    pub timestamp: f64,
}

/// Wall clock in fractional seconds since the unix epoch.
pub fn wall_clock_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
