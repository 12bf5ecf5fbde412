//! On-disk peer address cache kept for compatibility with stock BACnet
//! tooling: one `<device-id> <mac> <net> <addr> <max-apdu>` line per bound
//! device, written to the working directory and removed on teardown.

use log::error;
use std::fs;
use std::io::{self, Write};
use std::net::SocketAddrV4;
use std::path::PathBuf;

pub const ADDRESS_CACHE_FILE: &str = "address_cache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub device_id: u32,
    pub mac: String,
    pub network: u16,
    pub address: u8,
    pub max_apdu: u16,
}

pub struct AddressCache {
    path: PathBuf,
}

impl AddressCache {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(ADDRESS_CACHE_FILE),
        }
    }

    #[cfg(test)]
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// The BACnet/IP MAC is the ip:port pair, six bytes of colon hex.
    pub fn mac_of(addr: &SocketAddrV4) -> String {
        let ip = addr.ip().octets();
        let port = addr.port().to_be_bytes();
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            ip[0], ip[1], ip[2], ip[3], port[0], port[1]
        )
    }

    pub fn write_entry(&self, entry: &CacheEntry) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(
            file,
            "{} {} {} {} {}",
            entry.device_id, entry.mac, entry.network, entry.address, entry.max_apdu
        )
    }

    pub fn read_all(&self) -> io::Result<Vec<CacheEntry>> {
        let content = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 {
                continue;
            }
            let parsed = (
                fields[0].parse(),
                fields[2].parse(),
                fields[3].parse(),
                fields[4].parse(),
            );
            if let (Ok(device_id), Ok(network), Ok(address), Ok(max_apdu)) = parsed {
                entries.push(CacheEntry {
                    device_id,
                    mac: fields[1].to_string(),
                    network,
                    address,
                    max_apdu,
                });
            }
        }
        Ok(entries)
    }
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AddressCache {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(err) = fs::remove_file(&self.path) {
                error!("failed to remove {}: {}", self.path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{AddressCache, CacheEntry};
    use std::net::SocketAddrV4;

    #[test]
    fn test_cache_round_trip_and_cleanup() {
        let path = std::env::temp_dir().join("bacnet_cache_test");
        let _ = std::fs::remove_file(&path);
        {
            let cache = AddressCache::at(path.clone());
            let addr: SocketAddrV4 = "192.168.1.20:47808".parse().unwrap();
            let entry = CacheEntry {
                device_id: 1234,
                mac: AddressCache::mac_of(&addr),
                network: 0,
                address: 0,
                max_apdu: 1476,
            };
            cache.write_entry(&entry).unwrap();
            let read = cache.read_all().unwrap();
            assert_eq!(read, vec![entry]);
            assert_eq!(read[0].mac, "c0:a8:01:14:ba:c0");
        }
        // Dropped caches take the file with them
        assert!(!path.exists());
    }
}
