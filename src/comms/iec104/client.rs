//! IEC 60870-5-104 client: activates the link, interrogates the station at
//! startup, and folds monitored points pushed by the server into the local
//! register mirror. Commands go out as double commands / float setpoints.

use super::codec::{
    Apdu, Asdu, Cot, DoublePointValue, Element, Iec104Codec, InformationObject, TypeId, UFrame,
};
use crate::comms::{
    CommsClient, CommsError, Endpoint, RegisterBank, RegisterDescriptor,
};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub struct Iec104Connection {
    endpoint: Endpoint,
    common_address: u16,
    bank: RegisterBank,
    outbound: Mutex<Option<mpsc::UnboundedSender<Asdu>>>,
}

impl Iec104Connection {
    pub fn new(endpoint: Endpoint, common_address: u16) -> Self {
        Self {
            endpoint,
            common_address,
            bank: RegisterBank::default(),
            outbound: Mutex::new(None),
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

    /// Connects, activates the link, and interrogates the station. The
    /// spawned reader keeps mirroring monitored points until the
    /// connection drops.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, CommsError> {
        let addr = match &self.endpoint {
            Endpoint::Tcp { .. } => self.endpoint.socket_addr().unwrap(),
            other => return Err(CommsError::InvalidEndpoint(other.to_string())),
        };
        let stream = TcpStream::connect(&addr).await?;
        info!("iec104 client connected to {}", addr);
        let framed = Framed::new(stream, Iec104Codec);
        let (mut sink, mut stream) = framed.split();

        sink.send(Apdu::U(UFrame::StartDtAct)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx.clone());

        let recv_counter = Arc::new(AtomicU16::new(0));
        tokio::spawn(write_loop(sink, rx, recv_counter.clone()));

        let connection = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        error!("iec104 client framing error: {}", err);
                        break;
                    }
                };
                match frame {
                    Apdu::U(UFrame::StartDtCon) => {
                        debug!("iec104 link activation confirmed, interrogating");
                        let mut interrogation = Asdu::new(
                            TypeId::Interrogation,
                            Cot::Activation,
                            connection.common_address,
                        );
                        interrogation.objects.push(InformationObject {
                            address: 0,
                            element: Element::Interrogation(20),
                        });
                        let _ = tx.send(interrogation);
                    }
                    Apdu::U(UFrame::TestFrAct) => {
                        // Keep alive handled by the writer as a plain frame
                    }
                    Apdu::U(_) | Apdu::S { .. } => {}
                    Apdu::I { send_seq, asdu, .. } => {
                        recv_counter.store(send_seq.wrapping_add(1) & 0x7FFF, Ordering::SeqCst);
                        connection.process_asdu(asdu);
                    }
                }
            }
            connection.outbound.lock().take();
            info!("iec104 client connection closed");
        }))
    }

    fn process_asdu(&self, asdu: Asdu) {
        match asdu.type_id {
            TypeId::SinglePoint => {
                for object in asdu.objects {
                    if let Element::SinglePoint(status) = object.element {
                        self.bank.update_binary(object.address, status);
                    }
                }
            }
            TypeId::DoublePoint => {
                for object in asdu.objects {
                    if let Element::DoublePoint(state) = object.element {
                        self.bank
                            .update_binary(object.address, state == DoublePointValue::On);
                    }
                }
            }
            TypeId::MeasuredFloat => {
                for object in asdu.objects {
                    if let Element::MeasuredFloat(value) = object.element {
                        self.bank.update_analog(object.address, value);
                    }
                }
            }
            _ => {}
        }
    }

    fn send(&self, asdu: Asdu) -> Result<(), CommsError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or_else(|| {
            CommsError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection not started",
            ))
        })?;
        tx.send(asdu).map_err(|_| {
            CommsError::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            ))
        })
    }

    pub fn write_binary(&self, tag: &str, status: bool) -> Result<(), CommsError> {
        let descriptor = self.bank.read_by_tag(tag)?;
        let mut command = Asdu::new(TypeId::DoubleCommand, Cot::Activation, self.common_address);
        command.objects.push(InformationObject {
            address: descriptor.address,
            element: Element::DoubleCommand(DoublePointValue::from_bool(status)),
        });
        self.send(command)?;
        self.bank.update_binary(descriptor.address, status);
        Ok(())
    }

    pub fn write_analog(&self, tag: &str, value: f64) -> Result<(), CommsError> {
        let descriptor = self.bank.read_by_tag(tag)?;
        let mut command = Asdu::new(TypeId::SetpointFloat, Cot::Activation, self.common_address);
        command.objects.push(InformationObject {
            address: descriptor.address,
            element: Element::SetpointFloat(value as f32),
        });
        self.send(command)?;
        self.bank.update_analog(descriptor.address, value as f32);
        Ok(())
    }
}

async fn write_loop(
    mut sink: SplitSink<Framed<TcpStream, Iec104Codec>, Apdu>,
    mut rx: mpsc::UnboundedReceiver<Asdu>,
    recv_counter: Arc<AtomicU16>,
) {
    let mut send_seq: u16 = 0;
    while let Some(asdu) = rx.recv().await {
        let frame = Apdu::I {
            send_seq,
            recv_seq: recv_counter.load(Ordering::SeqCst),
            asdu,
        };
        send_seq = send_seq.wrapping_add(1) & 0x7FFF;
        if let Err(err) = sink.send(frame).await {
            error!("iec104 client send failed: {}", err);
            break;
        }
    }
}

/// Client adapter shell routing tag operations onto its connections.
#[derive(Default)]
pub struct Iec104Client {
    connections: Vec<Arc<Iec104Connection>>,
    tag_to_connection: HashMap<String, usize>,
}

impl Iec104Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&mut self, connection: Arc<Iec104Connection>) -> usize {
        self.connections.push(connection);
        self.connections.len() - 1
    }

    pub fn add_tag_connection(&mut self, tag: &str, index: usize) {
        self.tag_to_connection.insert(tag.to_string(), index);
    }

    pub fn connections(&self) -> &[Arc<Iec104Connection>] {
        &self.connections
    }

    fn connection_for(&self, tag: &str) -> Result<&Arc<Iec104Connection>, CommsError> {
        self.tag_to_connection
            .get(tag)
            .and_then(|index| self.connections.get(*index))
            .ok_or_else(|| CommsError::UnknownTag(tag.to_string()))
    }
}

#[async_trait]
impl CommsClient for Iec104Client {
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
        self.connection_for(tag)?.write_binary(tag, status)
    }

    async fn write_analog_tag(&self, tag: &str, value: f64) -> Result<(), CommsError> {
        self.connection_for(tag)?.write_analog(tag, value)
    }
}

#[cfg(test)]
mod test {
    use super::{Iec104Client, Iec104Connection};
    use crate::comms::iec104::server::Iec104Server;
    use crate::comms::{CommsClient, Endpoint, RegisterDescriptor, RegisterKind};
    use crate::tags::TagManager;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrogation_populates_mirror() {
        let manager = Arc::new(TagManager::new());
        manager.add_internal_data("switch", true);
        manager.add_binary_tag("switch");
        manager.add_internal_data("flow", 42.5);
        manager.add_analog_tag("flow");

        let server = Arc::new(Iec104Server::new(manager.clone(), 1, 60));
        assert!(server.add_binary_input(7, "switch"));
        assert!(server.add_analog_input(2001, "flow"));
        let endpoint = Endpoint::parse("tcp://127.0.0.1:35110").unwrap();
        server.start(&endpoint).await.unwrap();

        let connection = Arc::new(Iec104Connection::new(endpoint, 1));
        connection.add_binary(
            "switch",
            RegisterDescriptor::binary(7, "switch", RegisterKind::StatusReadWrite),
        );
        connection.add_analog(
            "flow",
            RegisterDescriptor::analog(2001, "flow", RegisterKind::ValueReadOnly),
        );
        connection.start().await.unwrap();

        let mut client = Iec104Client::new();
        let index = client.add_connection(connection);
        client.add_tag_connection("switch", index);
        client.add_tag_connection("flow", index);

        // Wait for the interrogation round trip to land
        let mut mirrored = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let switch = client.read_tag("switch").unwrap();
            let flow = client.read_tag("flow").unwrap();
            if switch.status && (flow.float_value - 42.5).abs() < 0.01 {
                mirrored = true;
                break;
            }
        }
        assert!(mirrored, "interrogated values never reached the mirror");

        // A command mirrors optimistically and queues the tag update
        client.write_binary_tag("switch", false).await.unwrap();
        assert!(!client.read_tag("switch").unwrap().status);
        let mut queued = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if manager.is_updated_binary("switch") {
                queued = true;
                break;
            }
        }
        assert!(queued, "double command never reached the server");
    }
}
