//! Modbus client: each connection polls one remote server over TCP,
//! mirroring the addressed registers into a local bank. Writes go out as
//! single coil/register commands and optimistically update the mirror so
//! reads see the commanded value before the next poll lands.

use super::codec::{Request, Response, TcpCodec, TcpFrame};
use super::ScaledValue;
use crate::comms::{
    CommsClient, CommsError, Endpoint, RegisterBank, RegisterDescriptor, RegisterKind,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

type Transport = Framed<TcpStream, TcpCodec>;

pub struct ModbusConnection {
    endpoint: Endpoint,
    unit_id: u8,
    scan_rate: Duration,
    bank: RegisterBank,
    ranges: SyncMutex<HashMap<u16, ScaledValue>>,
    transport: Mutex<Option<Transport>>,
    next_transaction: AtomicU16,
}

impl ModbusConnection {
    pub fn new(endpoint: Endpoint, unit_id: u8, scan_rate_secs: u64) -> Self {
        Self {
            endpoint,
            unit_id,
            scan_rate: Duration::from_secs(scan_rate_secs),
            bank: RegisterBank::default(),
            ranges: SyncMutex::new(HashMap::new()),
            transport: Mutex::new(None),
            next_transaction: AtomicU16::new(1),
        }
    }

    pub fn add_register(&self, tag: &str, descriptor: RegisterDescriptor) {
        match descriptor.kind {
            RegisterKind::StatusReadOnly | RegisterKind::StatusReadWrite => {
                self.bank.add_binary(tag, descriptor)
            }
            _ => self.bank.add_analog(tag, descriptor),
        }
    }

    pub fn set_range(&self, address: u16, range: (f64, f64)) {
        self.ranges
            .lock()
            .insert(address, ScaledValue::new(range.0, range.1));
    }

    pub fn bank(&self) -> &RegisterBank {
        &self.bank
    }

    fn scale_at(&self, address: u16) -> ScaledValue {
        self.ranges
            .lock()
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    /// Issues one request and waits for its paired response, reconnecting
    /// lazily. Any transport failure drops the connection so the next
    /// attempt dials again.
    async fn request(&self, request: &Request) -> Result<Response, CommsError> {
        let mut guard = self.transport.lock().await;
        if guard.is_none() {
            let addr = self
                .endpoint
                .socket_addr()
                .ok_or_else(|| CommsError::InvalidEndpoint(self.endpoint.to_string()))?;
            let stream = TcpStream::connect(&addr).await?;
            debug!("modbus client connected to {}", addr);
            *guard = Some(Framed::new(stream, TcpCodec));
        }
        let framed = guard.as_mut().unwrap();

        let transaction_id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        let mut pdu = Vec::new();
        request.encode(&mut pdu);
        let frame = TcpFrame {
            transaction_id,
            unit_id: self.unit_id,
            pdu,
        };
        if let Err(err) = framed.send(frame).await {
            *guard = None;
            return Err(err.into());
        }

        let expected_bits = match request {
            Request::ReadCoils { quantity, .. } | Request::ReadDiscreteInputs { quantity, .. } => {
                *quantity as usize
            }
            _ => 0,
        };
        loop {
            match framed.next().await {
                Some(Ok(frame)) => {
                    if frame.transaction_id != transaction_id {
                        continue;
                    }
                    return Response::decode(&frame.pdu, expected_bits).map_err(Into::into);
                }
                Some(Err(err)) => {
                    *guard = None;
                    return Err(err.into());
                }
                None => {
                    *guard = None;
                    return Err(CommsError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    )));
                }
            }
        }
    }

    /// One pass over every mirrored address. Read failures log and leave
    /// the cached value alone; the next scheduled poll retries.
    pub async fn poll(&self) {
        for address in self.bank.binary_addresses() {
            let Some(descriptor) = self.bank.binary_descriptor_at(address) else {
                continue;
            };
            let request = match descriptor.kind {
                RegisterKind::StatusReadOnly => Request::ReadDiscreteInputs {
                    address,
                    quantity: 1,
                },
                _ => Request::ReadCoils {
                    address,
                    quantity: 1,
                },
            };
            match self.request(&request).await {
                Ok(Response::Bits(_, bits)) => {
                    if let Some(status) = bits.first() {
                        self.bank.update_binary(address, *status);
                    }
                }
                Ok(Response::Exception(_, code)) => {
                    error!("modbus poll exception at {}: {:?}", address, code);
                }
                Ok(other) => error!("unexpected modbus response: {:?}", other),
                Err(err) => {
                    error!("modbus poll failed: {}", err);
                    return;
                }
            }
        }
        for address in self.bank.analog_addresses() {
            let Some(descriptor) = self.bank.analog_descriptor_at(address) else {
                continue;
            };
            let request = match descriptor.kind {
                RegisterKind::ValueReadOnly => Request::ReadInputRegisters {
                    address,
                    quantity: 1,
                },
                _ => Request::ReadHoldingRegisters {
                    address,
                    quantity: 1,
                },
            };
            match self.request(&request).await {
                Ok(Response::Registers(_, words)) => {
                    if let Some(wire) = words.first() {
                        let value = self.scale_at(address).to_engineering(*wire);
                        self.bank.update_analog(address, value as f32);
                    }
                }
                Ok(Response::Exception(_, code)) => {
                    error!("modbus poll exception at {}: {:?}", address, code);
                }
                Ok(other) => error!("unexpected modbus response: {:?}", other),
                Err(err) => {
                    error!("modbus poll failed: {}", err);
                    return;
                }
            }
        }
    }

    pub async fn write_binary(&self, tag: &str, value: bool) -> Result<(), CommsError> {
        let descriptor = self.bank.read_by_tag(tag)?;
        let response = self
            .request(&Request::WriteSingleCoil {
                address: descriptor.address,
                value,
            })
            .await?;
        match response {
            Response::Echo(..) => {
                // Mirror the written value so reads before the next poll
                // already see the command
                self.bank.update_binary(descriptor.address, value);
                Ok(())
            }
            Response::Exception(_, code) => {
                Err(CommsError::RemoteException(format!("{:?}", code)))
            }
            other => Err(CommsError::MalformedFrame(format!("{:?}", other))),
        }
    }

    pub async fn write_analog(&self, tag: &str, value: f64) -> Result<(), CommsError> {
        let descriptor = self.bank.read_by_tag(tag)?;
        let wire = self.scale_at(descriptor.address).to_wire(value);
        let response = self
            .request(&Request::WriteSingleRegister {
                address: descriptor.address,
                value: wire,
            })
            .await?;
        match response {
            Response::Echo(..) => {
                self.bank.update_analog(descriptor.address, value as f32);
                Ok(())
            }
            Response::Exception(_, code) => {
                Err(CommsError::RemoteException(format!("{:?}", code)))
            }
            other => Err(CommsError::MalformedFrame(format!("{:?}", other))),
        }
    }

    /// Spawns the recurring poll task for this connection.
    pub fn spawn_poll(self: &Arc<Self>) -> JoinHandle<()> {
        let connection = self.clone();
        info!(
            "modbus client polling {} every {:?}",
            connection.endpoint, connection.scan_rate
        );
        tokio::spawn(async move {
            loop {
                connection.poll().await;
                tokio::time::sleep(connection.scan_rate).await;
            }
        })
    }
}

/// Client adapter: owns its connections and routes tag operations to the
/// connection that mirrors the tag.
#[derive(Default)]
pub struct ModbusClient {
    connections: Vec<Arc<ModbusConnection>>,
    tag_to_connection: HashMap<String, usize>,
}

impl ModbusClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&mut self, connection: Arc<ModbusConnection>) -> usize {
        self.connections.push(connection);
        self.connections.len() - 1
    }

    pub fn add_tag_connection(&mut self, tag: &str, index: usize) {
        self.tag_to_connection.insert(tag.to_string(), index);
    }

    pub fn connections(&self) -> &[Arc<ModbusConnection>] {
        &self.connections
    }

    fn connection_for(&self, tag: &str) -> Result<&Arc<ModbusConnection>, CommsError> {
        self.tag_to_connection
            .get(tag)
            .and_then(|index| self.connections.get(*index))
            .ok_or_else(|| CommsError::UnknownTag(tag.to_string()))
    }
}

#[async_trait]
impl CommsClient for ModbusClient {
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
    use super::{ModbusClient, ModbusConnection};
    use crate::comms::modbus::server::ModbusServer;
    use crate::comms::{CommsClient, Endpoint, RegisterDescriptor, RegisterKind};
    use crate::tags::TagManager;
    use std::sync::Arc;

    async fn start_server(port: u16) -> Arc<TagManager> {
        let manager = Arc::new(TagManager::new());
        manager.add_internal_data("brkr", false);
        manager.add_binary_tag("brkr");
        manager.add_internal_data("volts", 25.0);
        manager.add_analog_tag("volts");
        let server = Arc::new(ModbusServer::new(manager.clone()));
        assert!(server.add_coil(5, "brkr"));
        assert!(server.add_holding_register(10, "volts", (0.0, 100.0)));
        let endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        server.start(&endpoint).await.unwrap();
        manager
    }

    fn client(port: u16) -> (ModbusClient, Arc<ModbusConnection>) {
        let endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let connection = Arc::new(ModbusConnection::new(endpoint, 1, 5));
        connection.add_register(
            "brkr",
            RegisterDescriptor::binary(5, "brkr", RegisterKind::StatusReadWrite),
        );
        connection.add_register(
            "volts",
            RegisterDescriptor::analog(10, "volts", RegisterKind::ValueReadWrite),
        );
        connection.set_range(10, (0.0, 100.0));

        let mut client = ModbusClient::new();
        let index = client.add_connection(connection.clone());
        client.add_tag_connection("brkr", index);
        client.add_tag_connection("volts", index);
        (client, connection)
    }

    #[tokio::test]
    async fn test_poll_mirrors_server_values() {
        let manager = start_server(35082).await;
        manager.add_updated_analog("volts", 73.5);
        manager.update_internal_data();
        manager.clear_updated_tags();

        let (client, connection) = client(35082);
        connection.poll().await;

        let volts = client.read_tag("volts").unwrap();
        assert!((volts.float_value - 73.5).abs() < 0.01);
        let brkr = client.read_tag("brkr").unwrap();
        assert!(!brkr.status);
    }

    #[tokio::test]
    async fn test_write_mirrors_before_next_poll() {
        let manager = start_server(35083).await;
        let (client, _connection) = client(35083);

        client.write_binary_tag("brkr", true).await.unwrap();
        // Visible locally straight away, before any poll
        assert!(client.read_tag("brkr").unwrap().status);

        // And the server queued the tag update
        assert!(manager.is_updated_binary("brkr"));

        client.write_analog_tag("volts", 50.0).await.unwrap();
        assert!((client.read_tag("volts").unwrap().float_value - 50.0).abs() < 0.01);
        manager.update_internal_data();
        assert!((manager.get_data_by_tag::<f64>("volts") - 50.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_unknown_tag_fails() {
        let (client, _) = client(35084);
        let err = client.read_tag("nope").unwrap_err();
        assert_eq!(err.to_string(), "Unable to find tag -- nope");
    }
}
