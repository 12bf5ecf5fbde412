//! DNP3 master: polls the outstation with per-class integrity scans and
//! mirrors returned points. Binary/analog commands go out direct-operate,
//! or select-then-operate for points configured with SBO.

use super::codec::{
    AppFunction, ClassField, CommandStatus, Dnp3Codec, Fragment, LinkFrame, ObjectBlock,
    OperationType,
};
use crate::comms::{
    CommsClient, CommsError, Endpoint, RegisterBank, RegisterDescriptor,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// Scan schedule: seconds per class, zero disables that scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanRates {
    pub all: u64,
    pub class0: u64,
    pub class1: u64,
    pub class2: u64,
    pub class3: u64,
}

pub struct Dnp3Connection {
    endpoint: Endpoint,
    local_address: u16,
    remote_address: u16,
    scan_rates: ScanRates,
    bank: RegisterBank,
    sbo_tags: SyncMutex<HashSet<String>>,
    transport: Mutex<Option<Framed<TcpStream, Dnp3Codec>>>,
    seq: AtomicU8,
}

impl Dnp3Connection {
    pub fn new(
        endpoint: Endpoint,
        local_address: u16,
        remote_address: u16,
        scan_rates: ScanRates,
    ) -> Self {
        Self {
            endpoint,
            local_address,
            remote_address,
            scan_rates,
            bank: RegisterBank::default(),
            sbo_tags: SyncMutex::new(HashSet::new()),
            transport: Mutex::new(None),
            seq: AtomicU8::new(0),
        }
    }

    pub fn add_binary(&self, tag: &str, descriptor: RegisterDescriptor, sbo: bool) {
        if sbo {
            self.sbo_tags.lock().insert(tag.to_string());
        }
        self.bank.add_binary(tag, descriptor);
    }

    pub fn add_analog(&self, tag: &str, descriptor: RegisterDescriptor, sbo: bool) {
        if sbo {
            self.sbo_tags.lock().insert(tag.to_string());
        }
        self.bank.add_analog(tag, descriptor);
    }

    pub fn bank(&self) -> &RegisterBank {
        &self.bank
    }

    async fn request(&self, function: AppFunction, block: ObjectBlock) -> Result<Fragment, CommsError> {
        let mut guard = self.transport.lock().await;
        if guard.is_none() {
            let addr = self
                .endpoint
                .socket_addr()
                .ok_or_else(|| CommsError::InvalidEndpoint(self.endpoint.to_string()))?;
            let stream = TcpStream::connect(&addr).await?;
            debug!("dnp3 master connected to {}", addr);
            *guard = Some(Framed::new(stream, Dnp3Codec));
        }
        let framed = guard.as_mut().unwrap();

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) & 0x0F;
        let mut fragment = Fragment::new(seq, function);
        fragment.objects.push(block);
        let frame = LinkFrame {
            destination: self.remote_address,
            source: self.local_address,
            payload: fragment.encode(),
        };
        if let Err(err) = framed.send(frame).await {
            *guard = None;
            return Err(err.into());
        }
        loop {
            match framed.next().await {
                Some(Ok(frame)) => {
                    let response = Fragment::decode(&frame.payload)?;
                    if response.function != AppFunction::Response || response.seq != seq {
                        continue;
                    }
                    return Ok(response);
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

    /// One integrity scan over the selected classes; decoded points land
    /// in the register mirror.
    pub async fn scan(&self, classes: ClassField) {
        let response = match self
            .request(AppFunction::Read, ObjectBlock::ClassRead(classes))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!("dnp3 class scan failed: {}", err);
                return;
            }
        };
        for block in response.objects {
            match block {
                ObjectBlock::BinaryInputs(points) => {
                    for (index, value) in points {
                        self.bank.update_binary(index, value);
                    }
                }
                ObjectBlock::AnalogInputs(points) => {
                    for (index, value) in points {
                        self.bank.update_analog(index, value);
                    }
                }
                other => debug!("ignoring scan response block {:?}", other),
            }
        }
    }

    pub async fn write_binary(&self, tag: &str, value: bool) -> Result<(), CommsError> {
        let descriptor = self.bank.read_by_tag(tag)?;
        let operation = OperationType::from_bool(value);
        let sbo = self.sbo_tags.lock().contains(tag);
        if sbo {
            let select = self
                .request(
                    AppFunction::Select,
                    ObjectBlock::Crob {
                        index: descriptor.address,
                        operation,
                        status: CommandStatus::Success,
                    },
                )
                .await?;
            check_crob(&select)?;
        }
        let function = if sbo {
            AppFunction::Operate
        } else {
            AppFunction::DirectOperate
        };
        let response = self
            .request(
                function,
                ObjectBlock::Crob {
                    index: descriptor.address,
                    operation,
                    status: CommandStatus::Success,
                },
            )
            .await?;
        check_crob(&response)?;
        // Mirror locally so reads see the command before the next scan
        self.bank.update_binary(descriptor.address, value);
        Ok(())
    }

    pub async fn write_analog(&self, tag: &str, value: f64) -> Result<(), CommsError> {
        let descriptor = self.bank.read_by_tag(tag)?;
        let sbo = self.sbo_tags.lock().contains(tag);
        if sbo {
            let select = self
                .request(
                    AppFunction::Select,
                    ObjectBlock::AnalogOutput {
                        index: descriptor.address,
                        value: value as f32,
                        status: CommandStatus::Success,
                    },
                )
                .await?;
            check_analog_output(&select)?;
        }
        let function = if sbo {
            AppFunction::Operate
        } else {
            AppFunction::DirectOperate
        };
        let response = self
            .request(
                function,
                ObjectBlock::AnalogOutput {
                    index: descriptor.address,
                    value: value as f32,
                    status: CommandStatus::Success,
                },
            )
            .await?;
        check_analog_output(&response)?;
        self.bank.update_analog(descriptor.address, value as f32);
        Ok(())
    }

    /// Spawns one recurring scan task per configured class rate, plus the
    /// startup integrity scan.
    pub fn spawn_scans(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let rates = [
            (ClassField::all_classes(), self.scan_rates.all),
            (ClassField::CLASS_0, self.scan_rates.class0),
            (ClassField::CLASS_1, self.scan_rates.class1),
            (ClassField::CLASS_2, self.scan_rates.class2),
            (ClassField::CLASS_3, self.scan_rates.class3),
        ];
        info!(
            "dnp3 master {} -> {} on {}",
            self.local_address, self.remote_address, self.endpoint
        );
        // Startup integrity poll
        let connection = self.clone();
        handles.push(tokio::spawn(async move {
            connection.scan(ClassField::CLASS_0).await;
        }));
        for (classes, rate) in rates {
            if rate == 0 {
                continue;
            }
            let connection = self.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(rate)).await;
                    connection.scan(classes).await;
                }
            }));
        }
        handles
    }
}

fn check_crob(response: &Fragment) -> Result<(), CommsError> {
    match response.objects.first() {
        Some(ObjectBlock::Crob {
            status: CommandStatus::Success,
            ..
        }) => Ok(()),
        Some(ObjectBlock::Crob { status, .. }) => {
            Err(CommsError::RemoteException(format!("{:?}", status)))
        }
        other => Err(CommsError::MalformedFrame(format!("{:?}", other))),
    }
}

fn check_analog_output(response: &Fragment) -> Result<(), CommsError> {
    match response.objects.first() {
        Some(ObjectBlock::AnalogOutput {
            status: CommandStatus::Success,
            ..
        }) => Ok(()),
        Some(ObjectBlock::AnalogOutput { status, .. }) => {
            Err(CommsError::RemoteException(format!("{:?}", status)))
        }
        other => Err(CommsError::MalformedFrame(format!("{:?}", other))),
    }
}

/// Master adapter shell routing tag operations onto its connections.
#[derive(Default)]
pub struct Dnp3Client {
    connections: Vec<Arc<Dnp3Connection>>,
    tag_to_connection: HashMap<String, usize>,
}

impl Dnp3Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&mut self, connection: Arc<Dnp3Connection>) -> usize {
        self.connections.push(connection);
        self.connections.len() - 1
    }

    pub fn add_tag_connection(&mut self, tag: &str, index: usize) {
        self.tag_to_connection.insert(tag.to_string(), index);
    }

    pub fn connections(&self) -> &[Arc<Dnp3Connection>] {
        &self.connections
    }

    fn connection_for(&self, tag: &str) -> Result<&Arc<Dnp3Connection>, CommsError> {
        self.tag_to_connection
            .get(tag)
            .and_then(|index| self.connections.get(*index))
            .ok_or_else(|| CommsError::UnknownTag(tag.to_string()))
    }
}

#[async_trait]
impl CommsClient for Dnp3Client {
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
    use super::{Dnp3Client, Dnp3Connection, ScanRates};
    use crate::comms::dnp3::codec::ClassField;
    use crate::comms::dnp3::server::Dnp3Server;
    use crate::comms::{CommsClient, Endpoint, RegisterDescriptor, RegisterKind};
    use crate::tags::TagManager;
    use std::sync::Arc;

    async fn harness(port: u16, sbo: bool) -> (Arc<TagManager>, Dnp3Client) {
        let manager = Arc::new(TagManager::new());
        manager.add_internal_data("gen-breaker", true);
        manager.add_binary_tag("gen-breaker");
        manager.add_internal_data("gen-mw", 81.5);
        manager.add_analog_tag("gen-mw");

        let server = Arc::new(Dnp3Server::new(manager.clone(), 10));
        assert!(server.add_binary_output(1, "gen-breaker", sbo));
        assert!(server.add_analog_input(0, "gen-mw", ClassField::CLASS_2));
        let endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        server.start(&endpoint).await.unwrap();

        let connection = Arc::new(Dnp3Connection::new(
            endpoint,
            1,
            10,
            ScanRates::default(),
        ));
        connection.add_binary(
            "gen-breaker",
            RegisterDescriptor::binary(1, "gen-breaker", RegisterKind::StatusReadWrite),
            sbo,
        );
        connection.add_analog(
            "gen-mw",
            RegisterDescriptor::analog(0, "gen-mw", RegisterKind::ValueReadOnly),
            false,
        );

        let mut client = Dnp3Client::new();
        let index = client.add_connection(connection);
        client.add_tag_connection("gen-breaker", index);
        client.add_tag_connection("gen-mw", index);
        (manager, client)
    }

    #[tokio::test]
    async fn test_integrity_scan_mirrors_points() {
        let (_, client) = harness(35120, false).await;
        client.connections()[0].scan(ClassField::CLASS_0).await;

        assert!(client.read_tag("gen-breaker").unwrap().status);
        let mw = client.read_tag("gen-mw").unwrap();
        assert!((mw.float_value - 81.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_select_before_operate_write() {
        let (manager, client) = harness(35121, true).await;
        client.write_binary_tag("gen-breaker", false).await.unwrap();
        // Optimistic mirror
        assert!(!client.read_tag("gen-breaker").unwrap().status);
        // And the outstation queued the update
        assert!(manager.is_updated_binary("gen-breaker"));
    }

    #[tokio::test]
    async fn test_direct_operate_write() {
        let (manager, client) = harness(35122, false).await;
        client.write_binary_tag("gen-breaker", false).await.unwrap();
        assert!(manager.is_updated_binary("gen-breaker"));
        manager.update_internal_data();
        assert!(!manager.get_data_by_tag::<bool>("gen-breaker"));
    }
}
