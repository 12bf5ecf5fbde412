//! IEC 60870-5-104 adapter: CS104 style slave with reverse polling and
//! station interrogation, and a client that mirrors monitored points.

pub mod client;
pub mod codec;
pub mod server;

pub use client::{Iec104Client, Iec104Connection};
pub use server::Iec104Server;
