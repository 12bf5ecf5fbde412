//! DNP3 adapter: outstation with class scans and SBO controls, master with
//! per-class polling.

pub mod client;
pub mod codec;
pub mod server;

pub use client::{Dnp3Client, Dnp3Connection, ScanRates};
pub use codec::ClassField;
pub use server::Dnp3Server;
