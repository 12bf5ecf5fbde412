//! IEC 61850 GOOSE adapter: layer 2 publish/subscribe outstation.

pub mod codec;
pub mod link;
pub mod outstation;

pub use link::{GooseLink, RawEthernetLink};
pub use outstation::{DatasetEntry, GooseControlBlock, GooseOutstation};
