//! BACnet/IP adapter: device object server and polling client with
//! WhoIs/IAm binding and the on-disk address cache.

pub mod cache;
pub mod client;
pub mod codec;
pub mod server;

pub use cache::AddressCache;
pub use client::{BacnetClient, BacnetConnection};
pub use server::BacnetServer;
