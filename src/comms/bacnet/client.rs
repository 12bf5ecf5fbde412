//! BACnet/IP client: binds a peer with WhoIs/IAm (recording it in the
//! address cache file), polls the configured objects with ReadProperty on
//! the present value, and writes through WriteProperty with no priority.

use super::cache::{AddressCache, CacheEntry};
use super::codec::{
    BacnetMessage, ObjectId, ObjectType, PropertyValue, BACNET_NO_PRIORITY, PROP_PRESENT_VALUE,
};
use crate::comms::{
    CommsClient, CommsError, Endpoint, RegisterBank, RegisterDescriptor, RegisterKind,
};
use async_trait::async_trait;
use log::{debug, error, info};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// How long to wait on one reply before retrying
const APDU_TIMEOUT: Duration = Duration::from_millis(3000);
/// Request retries before a call is reported failed
const APDU_RETRIES: usize = 3;

pub struct BacnetConnection {
    instance: u32,
    remote_endpoint: Endpoint,
    remote_instance: u32,
    scan_rate: Duration,
    bank: RegisterBank,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    invoke_id: AtomicU8,
    cache: AddressCache,
}

impl BacnetConnection {
    pub fn new(
        instance: u32,
        remote_endpoint: Endpoint,
        remote_instance: u32,
        scan_rate_secs: u64,
    ) -> Self {
        Self {
            instance,
            remote_endpoint,
            remote_instance,
            scan_rate: Duration::from_secs(scan_rate_secs),
            bank: RegisterBank::default(),
            socket: Mutex::new(None),
            invoke_id: AtomicU8::new(1),
            cache: AddressCache::new(),
        }
    }

    pub fn add_binary(&self, tag: &str, descriptor: RegisterDescriptor) {
        self.bank.add_binary(tag, descriptor);
    }

    pub fn add_analog(&self, tag: &str, descriptor: RegisterDescriptor) {
        self.bank.add_analog(tag, descriptor);
    }

    pub fn bank(&self) -> &RegisterBank {
        &self.bank
    }

    fn remote_addr(&self) -> Result<String, CommsError> {
        match &self.remote_endpoint {
            Endpoint::Udp { .. } => Ok(self.remote_endpoint.socket_addr().unwrap()),
            other => Err(CommsError::InvalidEndpoint(other.to_string())),
        }
    }

    /// Sends WhoIs until the peer answers with IAm, then records the
    /// binding in the address cache. Binding failure is fatal for this
    /// connection.
    pub async fn bind_device(&self) -> Result<(), CommsError> {
        let remote = self.remote_addr()?;
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        socket.connect(&remote).await?;

        let mut buffer = [0u8; 1500];
        for attempt in 0..APDU_RETRIES {
            socket.send(&BacnetMessage::WhoIs.encode()).await?;
            let received =
                match tokio::time::timeout(APDU_TIMEOUT, socket.recv(&mut buffer)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => return Err(err.into()),
                    Err(_) => {
                        debug!("who-is attempt {} timed out", attempt + 1);
                        continue;
                    }
                };
            if let Ok(BacnetMessage::IAm { device_id, max_apdu }) =
                BacnetMessage::decode(&buffer[..received])
            {
                if device_id != self.remote_instance {
                    continue;
                }
                if let Ok(addr) = remote.parse::<SocketAddrV4>() {
                    let entry = CacheEntry {
                        device_id,
                        mac: AddressCache::mac_of(&addr),
                        network: 0,
                        address: 0,
                        max_apdu,
                    };
                    if let Err(err) = self.cache.write_entry(&entry) {
                        error!("failed to write address cache: {}", err);
                    }
                }
                info!(
                    "bacnet client {} bound to device {} at {}",
                    self.instance, device_id, remote
                );
                *self.socket.lock().await = Some(socket);
                return Ok(());
            }
        }
        Err(CommsError::BindFailed(remote))
    }

    async fn request(&self, message: BacnetMessage, invoke_id: u8) -> Result<BacnetMessage, CommsError> {
        let guard = self.socket.lock().await;
        let socket = guard.as_ref().ok_or_else(|| {
            CommsError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "device not bound",
            ))
        })?;
        let datagram = message.encode();
        let mut buffer = [0u8; 1500];
        for _ in 0..APDU_RETRIES {
            socket.send(&datagram).await?;
            let deadline = tokio::time::Instant::now() + APDU_TIMEOUT;
            loop {
                let remaining = deadline - tokio::time::Instant::now();
                let received =
                    match tokio::time::timeout(remaining, socket.recv(&mut buffer)).await {
                        Ok(Ok(size)) => size,
                        Ok(Err(err)) => return Err(err.into()),
                        Err(_) => break,
                    };
                match BacnetMessage::decode(&buffer[..received]) {
                    Ok(reply) => {
                        let matches = match &reply {
                            BacnetMessage::ReadPropertyAck { invoke_id: id, .. }
                            | BacnetMessage::SimpleAck { invoke_id: id, .. }
                            | BacnetMessage::Error { invoke_id: id, .. } => *id == invoke_id,
                            _ => false,
                        };
                        if matches {
                            return Ok(reply);
                        }
                    }
                    Err(err) => debug!("dropping undecodable reply: {}", err),
                }
            }
        }
        Err(CommsError::Transport(io::Error::new(
            io::ErrorKind::TimedOut,
            "no reply from device",
        )))
    }

    fn next_invoke_id(&self) -> u8 {
        self.invoke_id.fetch_add(1, Ordering::Relaxed)
    }

    fn binary_object(descriptor: &RegisterDescriptor) -> ObjectId {
        let object_type = match descriptor.kind {
            RegisterKind::StatusReadOnly => ObjectType::BinaryInput,
            _ => ObjectType::BinaryOutput,
        };
        ObjectId::new(object_type, descriptor.address as u32)
    }

    fn analog_object(descriptor: &RegisterDescriptor) -> ObjectId {
        let object_type = match descriptor.kind {
            RegisterKind::ValueReadOnly => ObjectType::AnalogInput,
            _ => ObjectType::AnalogOutput,
        };
        ObjectId::new(object_type, descriptor.address as u32)
    }

    /// One ReadProperty pass over every mirrored object.
    pub async fn poll(&self) {
        for address in self.bank.binary_addresses() {
            let Some(descriptor) = self.bank.binary_descriptor_at(address) else {
                continue;
            };
            let invoke_id = self.next_invoke_id();
            let request = BacnetMessage::ReadProperty {
                invoke_id,
                object: Self::binary_object(&descriptor),
                property: PROP_PRESENT_VALUE,
            };
            match self.request(request, invoke_id).await {
                Ok(BacnetMessage::ReadPropertyAck { value, .. }) => {
                    self.bank.update_binary(address, value.as_bool());
                }
                Ok(other) => debug!("read property answered {:?}", other),
                Err(err) => {
                    error!("bacnet poll failed: {}", err);
                    return;
                }
            }
        }
        for address in self.bank.analog_addresses() {
            let Some(descriptor) = self.bank.analog_descriptor_at(address) else {
                continue;
            };
            let invoke_id = self.next_invoke_id();
            let request = BacnetMessage::ReadProperty {
                invoke_id,
                object: Self::analog_object(&descriptor),
                property: PROP_PRESENT_VALUE,
            };
            match self.request(request, invoke_id).await {
                Ok(BacnetMessage::ReadPropertyAck { value, .. }) => {
                    self.bank.update_analog(address, value.as_f32());
                }
                Ok(other) => debug!("read property answered {:?}", other),
                Err(err) => {
                    error!("bacnet poll failed: {}", err);
                    return;
                }
            }
        }
    }

    pub async fn write_binary(&self, tag: &str, value: bool) -> Result<(), CommsError> {
        let descriptor = self.bank.read_by_tag(tag)?;
        let invoke_id = self.next_invoke_id();
        let request = BacnetMessage::WriteProperty {
            invoke_id,
            object: Self::binary_object(&descriptor),
            property: PROP_PRESENT_VALUE,
            value: PropertyValue::Enumerated(value as u32),
            priority: BACNET_NO_PRIORITY,
        };
        match self.request(request, invoke_id).await? {
            BacnetMessage::SimpleAck { .. } => {
                // Mirror the written value, not the ack status
                self.bank.update_binary(descriptor.address, value);
                Ok(())
            }
            BacnetMessage::Error { .. } => {
                Err(CommsError::RemoteException("write refused".to_string()))
            }
            other => Err(CommsError::MalformedFrame(format!("{:?}", other))),
        }
    }

    pub async fn write_analog(&self, tag: &str, value: f64) -> Result<(), CommsError> {
        let descriptor = self.bank.read_by_tag(tag)?;
        let invoke_id = self.next_invoke_id();
        let request = BacnetMessage::WriteProperty {
            invoke_id,
            object: Self::analog_object(&descriptor),
            property: PROP_PRESENT_VALUE,
            value: PropertyValue::Real(value as f32),
            priority: BACNET_NO_PRIORITY,
        };
        match self.request(request, invoke_id).await? {
            BacnetMessage::SimpleAck { .. } => {
                self.bank.update_analog(descriptor.address, value as f32);
                Ok(())
            }
            BacnetMessage::Error { .. } => {
                Err(CommsError::RemoteException("write refused".to_string()))
            }
            other => Err(CommsError::MalformedFrame(format!("{:?}", other))),
        }
    }

    /// Binds the device then spawns the recurring poll task.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, CommsError> {
        self.bind_device().await?;
        let connection = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                connection.poll().await;
                tokio::time::sleep(connection.scan_rate).await;
            }
        }))
    }
}

/// Client adapter shell routing tag operations onto its connections.
#[derive(Default)]
pub struct BacnetClient {
    connections: Vec<Arc<BacnetConnection>>,
    tag_to_connection: HashMap<String, usize>,
}

impl BacnetClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&mut self, connection: Arc<BacnetConnection>) -> usize {
        self.connections.push(connection);
        self.connections.len() - 1
    }

    pub fn add_tag_connection(&mut self, tag: &str, index: usize) {
        self.tag_to_connection.insert(tag.to_string(), index);
    }

    pub fn connections(&self) -> &[Arc<BacnetConnection>] {
        &self.connections
    }

    fn connection_for(&self, tag: &str) -> Result<&Arc<BacnetConnection>, CommsError> {
        self.tag_to_connection
            .get(tag)
            .and_then(|index| self.connections.get(*index))
            .ok_or_else(|| CommsError::UnknownTag(tag.to_string()))
    }
}

#[async_trait]
impl CommsClient for BacnetClient {
    fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.tag_to_connection.keys().cloned().collect();
        tags.sort();
        tags
    }

    fn is_valid_tag(&self, tag: &str) -> bool {
        self.tag_to_connection.contains_key(tag)
    }

    fn read_tag(&self, tag: &str) -> Result<RegisterDescriptor, CommsError> {
        self.connection_for(tag)?.bank().read_by_tag(tag)
    }

    async fn write_binary_tag(&self, tag: &str, status: bool) -> Result<(), CommsError> {
        self.connection_for(tag)?.write_binary(tag, status).await
    }

    async fn write_analog_tag(&self, tag: &str, value: f64) -> Result<(), CommsError> {
        self.connection_for(tag)?.write_analog(tag, value).await
    }
}

#[cfg(test)]
mod test {
    use super::{BacnetClient, BacnetConnection};
    use crate::comms::bacnet::server::BacnetServer;
    use crate::comms::{CommsClient, Endpoint, RegisterDescriptor, RegisterKind};
    use crate::tags::TagManager;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_bind_poll_and_write() {
        let manager = Arc::new(TagManager::new());
        manager.add_internal_data("pump-run", true);
        manager.add_binary_tag("pump-run");
        manager.add_internal_data("tank-level", 3.5);
        manager.add_analog_tag("tank-level");

        let server = Arc::new(BacnetServer::new(manager.clone(), 900));
        assert!(server.add_binary_output(1, "pump-run"));
        assert!(server.add_analog_input(2, "tank-level"));
        let endpoint = Endpoint::parse("udp://127.0.0.1:35130").unwrap();
        server.start(&endpoint).await.unwrap();
        server.refresh_present_values();

        let connection = Arc::new(BacnetConnection::new(100, endpoint, 900, 10));
        connection.add_binary(
            "pump-run",
            RegisterDescriptor::binary(1, "pump-run", RegisterKind::StatusReadWrite),
        );
        connection.add_analog(
            "tank-level",
            RegisterDescriptor::analog(2, "tank-level", RegisterKind::ValueReadOnly),
        );
        connection.bind_device().await.unwrap();
        connection.poll().await;

        let mut client = BacnetClient::new();
        let index = client.add_connection(connection);
        client.add_tag_connection("pump-run", index);
        client.add_tag_connection("tank-level", index);

        assert!(client.read_tag("pump-run").unwrap().status);
        let level = client.read_tag("tank-level").unwrap();
        assert!((level.float_value - 3.5).abs() < 1e-6);

        client.write_binary_tag("pump-run", false).await.unwrap();
        // Mirrors the written value without waiting for the next poll
        assert!(!client.read_tag("pump-run").unwrap().status);
        assert!(manager.is_updated_binary("pump-run"));
    }
}
