//! IEC 60870-5-104 server: a slave that answers general interrogation,
//! accepts double commands and float setpoints, and reverse-polls current
//! values to the connected master once the link is activated.

use super::codec::{
    Apdu, Asdu, Cot, DoublePointValue, Element, Iec104Codec, InformationObject, TypeId, UFrame,
    MAX_ASDU_PAYLOAD,
};
use crate::comms::{CommsError, Endpoint, PointDirection};
use crate::tags::TagManager;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

struct MasterLink {
    tx: mpsc::UnboundedSender<Apdu>,
    activated: Arc<AtomicBool>,
}

pub struct Iec104Server {
    manager: Arc<TagManager>,
    common_address: u16,
    reverse_poll_rate: Duration,
    binary_points: RwLock<BTreeMap<u16, (String, PointDirection)>>,
    analog_points: RwLock<BTreeMap<u16, (String, PointDirection)>>,
    link: Mutex<Option<MasterLink>>,
}

impl Iec104Server {
    pub fn new(manager: Arc<TagManager>, common_address: u16, reverse_poll_rate_secs: u64) -> Self {
        Self {
            manager,
            common_address,
            reverse_poll_rate: Duration::from_secs(reverse_poll_rate_secs),
            binary_points: RwLock::new(BTreeMap::new()),
            analog_points: RwLock::new(BTreeMap::new()),
            link: Mutex::new(None),
        }
    }

    pub fn add_binary_input(&self, address: u16, tag: &str) -> bool {
        self.add_binary(address, tag, PointDirection::Input)
    }

    pub fn add_binary_output(&self, address: u16, tag: &str) -> bool {
        self.add_binary(address, tag, PointDirection::Output)
    }

    pub fn add_analog_input(&self, address: u16, tag: &str) -> bool {
        self.add_analog(address, tag, PointDirection::Input)
    }

    pub fn add_analog_output(&self, address: u16, tag: &str) -> bool {
        self.add_analog(address, tag, PointDirection::Output)
    }

    fn add_binary(&self, address: u16, tag: &str, direction: PointDirection) -> bool {
        if !self.manager.has_tag(tag) {
            return false;
        }
        self.binary_points
            .write()
            .insert(address, (tag.to_string(), direction));
        true
    }

    fn add_analog(&self, address: u16, tag: &str, direction: PointDirection) -> bool {
        if !self.manager.has_tag(tag) {
            return false;
        }
        self.analog_points
            .write()
            .insert(address, (tag.to_string(), direction));
        true
    }

    /// Binds the slave endpoint and spawns the accept loop plus the
    /// reverse poll task.
    pub async fn start(self: &Arc<Self>, endpoint: &Endpoint) -> Result<JoinHandle<()>, CommsError> {
        let addr = match endpoint {
            Endpoint::Tcp { .. } => endpoint.socket_addr().unwrap(),
            _ => return Err(CommsError::InvalidEndpoint(endpoint.to_string())),
        };
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|_| CommsError::BindFailed(addr.clone()))?;
        info!("iec60870-5-104 server listening on {}", addr);

        let server = self.clone();
        tokio::spawn(async move {
            server.reverse_poll().await;
        });

        let server = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(value) => value,
                    Err(err) => {
                        error!("iec104 accept failed: {}", err);
                        continue;
                    }
                };
                info!("iec104 master connected from {}", peer);
                server.clone().attach_master(stream);
            }
        }))
    }

    /// Wires up a freshly accepted master connection: a writer task that
    /// owns the sink and the sequence counters, and a reader task that
    /// dispatches inbound frames.
    fn attach_master(self: Arc<Self>, stream: TcpStream) {
        let framed = Framed::new(stream, Iec104Codec);
        let (sink, stream) = framed.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let activated = Arc::new(AtomicBool::new(false));
        let recv_counter = Arc::new(AtomicU16::new(0));

        *self.link.lock() = Some(MasterLink {
            tx: tx.clone(),
            activated: activated.clone(),
        });

        tokio::spawn(write_loop(sink, rx, recv_counter.clone()));
        tokio::spawn(self.read_loop(stream, tx, activated, recv_counter));
    }

    async fn read_loop(
        self: Arc<Self>,
        mut stream: SplitStream<Framed<TcpStream, Iec104Codec>>,
        tx: mpsc::UnboundedSender<Apdu>,
        activated: Arc<AtomicBool>,
        recv_counter: Arc<AtomicU16>,
    ) {
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    error!("iec104 framing error: {}", err);
                    break;
                }
            };
            match frame {
                Apdu::U(UFrame::StartDtAct) => {
                    debug!("iec104 link activated");
                    activated.store(true, Ordering::SeqCst);
                    let _ = tx.send(Apdu::U(UFrame::StartDtCon));
                }
                Apdu::U(UFrame::StopDtAct) => {
                    debug!("iec104 link deactivated");
                    activated.store(false, Ordering::SeqCst);
                    let _ = tx.send(Apdu::U(UFrame::StopDtCon));
                }
                Apdu::U(UFrame::TestFrAct) => {
                    let _ = tx.send(Apdu::U(UFrame::TestFrCon));
                }
                Apdu::U(_) => {}
                Apdu::S { .. } => {}
                Apdu::I { send_seq, asdu, .. } => {
                    recv_counter.store(send_seq.wrapping_add(1) & 0x7FFF, Ordering::SeqCst);
                    self.handle_asdu(asdu, &tx);
                }
            }
        }
        activated.store(false, Ordering::SeqCst);
        info!("iec104 master connection closed");
    }

    fn handle_asdu(&self, asdu: Asdu, tx: &mpsc::UnboundedSender<Apdu>) {
        let send = |asdu: Asdu| {
            let _ = tx.send(Apdu::I {
                send_seq: 0,
                recv_seq: 0,
                asdu,
            });
        };
        match asdu.type_id {
            TypeId::Interrogation => {
                let qoi = match asdu.objects.first() {
                    Some(InformationObject {
                        element: Element::Interrogation(qoi),
                        ..
                    }) => *qoi,
                    _ => return,
                };
                debug!("received interrogation for group {}", qoi);
                // Only station interrogation is served
                if qoi != 20 {
                    let mut nack = asdu.clone();
                    nack.cot = Cot::ActivationCon;
                    nack.negative = true;
                    send(nack);
                    return;
                }
                let mut con = asdu.clone();
                con.cot = Cot::ActivationCon;
                send(con);
                for chunk in self.binary_asdus(Cot::InterrogatedByStation) {
                    send(chunk);
                }
                for chunk in self.analog_asdus(Cot::InterrogatedByStation) {
                    send(chunk);
                }
                let mut term = asdu;
                term.cot = Cot::ActivationTerm;
                send(term);
            }
            TypeId::DoubleCommand => {
                if asdu.cot != Cot::Activation {
                    let mut nack = asdu;
                    nack.cot = Cot::UnknownCot;
                    send(nack);
                    return;
                }
                let Some(object) = asdu.objects.first().copied() else {
                    error!("double command without information object");
                    return;
                };
                let mut con = asdu.clone();
                con.cot = Cot::ActivationCon;
                send(con);
                if let Element::DoubleCommand(state) = object.element {
                    self.write_binary(object.address, state);
                }
                let mut term = asdu;
                term.cot = Cot::ActivationTerm;
                send(term);
            }
            TypeId::SetpointFloat => {
                if asdu.cot != Cot::Activation {
                    let mut nack = asdu;
                    nack.cot = Cot::UnknownCot;
                    send(nack);
                    return;
                }
                let Some(object) = asdu.objects.first().copied() else {
                    error!("setpoint command without information object");
                    return;
                };
                if let Element::SetpointFloat(value) = object.element {
                    self.write_analog(object.address, value);
                }
                let mut con = asdu;
                con.cot = Cot::ActivationCon;
                send(con);
            }
            _ => {}
        }
    }

    /// Queues a pending binary tag update for a commanded point. Anything
    /// but a determinate OFF/ON state defaults to false.
    fn write_binary(&self, address: u16, state: DoublePointValue) {
        let points = self.binary_points.read();
        let Some((tag, _)) = points.get(&address) else {
            error!("invalid binary point command request address: {}", address);
            return;
        };
        let status = match state {
            DoublePointValue::On => true,
            DoublePointValue::Off => false,
            other => {
                error!("double point value {:?} is indeterminate, defaulting to off", other);
                false
            }
        };
        self.manager.add_updated_binary(tag, status);
    }

    fn write_analog(&self, address: u16, value: f32) {
        let points = self.analog_points.read();
        let Some((tag, _)) = points.get(&address) else {
            error!("invalid analog point command request address: {}", address);
            return;
        };
        self.manager.add_updated_analog(tag, value as f64);
    }

    /// All binary points as double point ASDUs, split so no ASDU exceeds
    /// the payload bound.
    fn binary_asdus(&self, cot: Cot) -> Vec<Asdu> {
        let points = self.binary_points.read();
        let mut asdus = Vec::new();
        let mut current = Asdu::new(TypeId::DoublePoint, cot, self.common_address);
        for (address, (tag, _)) in points.iter() {
            if !self.manager.has_tag(tag) {
                continue;
            }
            let object = InformationObject {
                address: *address,
                element: Element::DoublePoint(DoublePointValue::from_bool(
                    self.manager.get_data_by_tag::<bool>(tag),
                )),
            };
            if current.payload_size() + object.size() > MAX_ASDU_PAYLOAD {
                asdus.push(std::mem::replace(
                    &mut current,
                    Asdu::new(TypeId::DoublePoint, cot, self.common_address),
                ));
            }
            current.objects.push(object);
        }
        if !current.objects.is_empty() {
            asdus.push(current);
        }
        asdus
    }

    fn analog_asdus(&self, cot: Cot) -> Vec<Asdu> {
        let points = self.analog_points.read();
        let mut asdus = Vec::new();
        let mut current = Asdu::new(TypeId::MeasuredFloat, cot, self.common_address);
        for (address, (tag, _)) in points.iter() {
            if !self.manager.has_tag(tag) {
                continue;
            }
            let object = InformationObject {
                address: *address,
                element: Element::MeasuredFloat(self.manager.get_data_by_tag::<f64>(tag) as f32),
            };
            if current.payload_size() + object.size() > MAX_ASDU_PAYLOAD {
                asdus.push(std::mem::replace(
                    &mut current,
                    Asdu::new(TypeId::MeasuredFloat, cot, self.common_address),
                ));
            }
            current.objects.push(object);
        }
        if !current.objects.is_empty() {
            asdus.push(current);
        }
        asdus
    }

    /// Server initiated publication: sleeps until a master has activated
    /// the link, then pushes current values at the configured period.
    async fn reverse_poll(self: Arc<Self>) {
        loop {
            let link = {
                let guard = self.link.lock();
                guard
                    .as_ref()
                    .filter(|link| link.activated.load(Ordering::SeqCst))
                    .map(|link| link.tx.clone())
            };
            let Some(tx) = link else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };
            for asdu in self.binary_asdus(Cot::Spontaneous) {
                let _ = tx.send(Apdu::I {
                    send_seq: 0,
                    recv_seq: 0,
                    asdu,
                });
            }
            for asdu in self.analog_asdus(Cot::Periodic) {
                let _ = tx.send(Apdu::I {
                    send_seq: 0,
                    recv_seq: 0,
                    asdu,
                });
            }
            tokio::time::sleep(self.reverse_poll_rate).await;
        }
    }
}

/// Owns the sink half of a master connection: stamps outbound I frames
/// with the link's send/receive sequence counters.
async fn write_loop(
    mut sink: SplitSink<Framed<TcpStream, Iec104Codec>, Apdu>,
    mut rx: mpsc::UnboundedReceiver<Apdu>,
    recv_counter: Arc<AtomicU16>,
) {
    let mut send_seq: u16 = 0;
    while let Some(mut apdu) = rx.recv().await {
        if let Apdu::I {
            send_seq: frame_send,
            recv_seq: frame_recv,
            ..
        } = &mut apdu
        {
            *frame_send = send_seq;
            *frame_recv = recv_counter.load(Ordering::SeqCst);
            send_seq = send_seq.wrapping_add(1) & 0x7FFF;
        }
        if let Err(err) = sink.send(apdu).await {
            error!("iec104 send failed: {}", err);
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use super::Iec104Server;
    use crate::comms::iec104::codec::{
        Apdu, Asdu, Cot, DoublePointValue, Element, Iec104Codec, InformationObject, TypeId,
        UFrame, MAX_ASDU_PAYLOAD,
    };
    use crate::comms::Endpoint;
    use crate::tags::TagManager;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    fn populated_server(points: usize) -> (Arc<TagManager>, Arc<Iec104Server>) {
        let manager = Arc::new(TagManager::new());
        let server = Arc::new(Iec104Server::new(manager.clone(), 1, 60));
        for index in 0..points {
            let binary = format!("switch-{}", index);
            manager.add_internal_data(&binary, index % 2 == 0);
            manager.add_binary_tag(&binary);
            assert!(server.add_binary_input(index as u16, &binary));

            let analog = format!("feeder-{}", index);
            manager.add_internal_data(&analog, index as f64);
            manager.add_analog_tag(&analog);
            assert!(server.add_analog_input(1000 + index as u16, &analog));
        }
        (manager, server)
    }

    #[test]
    fn test_asdu_chunking_respects_payload_bound() {
        // 100 float points at 8 bytes each do not fit one ASDU
        let (_, server) = populated_server(100);
        let asdus = server.analog_asdus(Cot::Periodic);
        assert!(asdus.len() > 1);
        let mut total = 0;
        for asdu in &asdus {
            assert!(asdu.payload_size() <= MAX_ASDU_PAYLOAD);
            total += asdu.objects.len();
        }
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn test_station_interrogation_sequence() {
        let (_, server) = populated_server(4);
        let endpoint = Endpoint::parse("tcp://127.0.0.1:35104").unwrap();
        server.start(&endpoint).await.unwrap();

        let stream = TcpStream::connect("127.0.0.1:35104").await.unwrap();
        let mut framed = Framed::new(stream, Iec104Codec);

        framed.send(Apdu::U(UFrame::StartDtAct)).await.unwrap();
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            Apdu::U(UFrame::StartDtCon)
        );

        let mut interrogation = Asdu::new(TypeId::Interrogation, Cot::Activation, 1);
        interrogation.objects.push(InformationObject {
            address: 0,
            element: Element::Interrogation(20),
        });
        framed
            .send(Apdu::I {
                send_seq: 0,
                recv_seq: 0,
                asdu: interrogation,
            })
            .await
            .unwrap();

        let mut binaries = 0;
        let mut analogs = 0;
        let mut saw_con = false;
        loop {
            let frame = framed.next().await.unwrap().unwrap();
            let Apdu::I { asdu, .. } = frame else {
                continue;
            };
            match (asdu.type_id, asdu.cot) {
                (TypeId::Interrogation, Cot::ActivationCon) => {
                    assert!(!asdu.negative);
                    saw_con = true;
                }
                (TypeId::DoublePoint, Cot::InterrogatedByStation) => {
                    assert!(saw_con);
                    binaries += asdu.objects.len();
                }
                (TypeId::MeasuredFloat, Cot::InterrogatedByStation) => {
                    assert!(saw_con);
                    analogs += asdu.objects.len();
                }
                (TypeId::Interrogation, Cot::ActivationTerm) => break,
                // Reverse poll traffic may interleave
                _ => {}
            }
        }
        assert_eq!(binaries, 4);
        assert_eq!(analogs, 4);
    }

    #[tokio::test]
    async fn test_double_command_queues_tag_update() {
        let (manager, server) = populated_server(2);
        let endpoint = Endpoint::parse("tcp://127.0.0.1:35105").unwrap();
        server.start(&endpoint).await.unwrap();

        let stream = TcpStream::connect("127.0.0.1:35105").await.unwrap();
        let mut framed = Framed::new(stream, Iec104Codec);
        framed.send(Apdu::U(UFrame::StartDtAct)).await.unwrap();
        framed.next().await.unwrap().unwrap();

        let mut command = Asdu::new(TypeId::DoubleCommand, Cot::Activation, 1);
        command.objects.push(InformationObject {
            address: 1,
            element: Element::DoubleCommand(DoublePointValue::On),
        });
        framed
            .send(Apdu::I {
                send_seq: 0,
                recv_seq: 0,
                asdu: command,
            })
            .await
            .unwrap();

        // ACT_CON then ACT_TERM for the command
        loop {
            let frame = framed.next().await.unwrap().unwrap();
            if let Apdu::I { asdu, .. } = frame {
                if asdu.type_id == TypeId::DoubleCommand && asdu.cot == Cot::ActivationTerm {
                    break;
                }
            }
        }
        assert!(manager.is_updated_binary("switch-1"));
        manager.update_internal_data();
        assert!(manager.get_data_by_tag::<bool>("switch-1"));
    }
}
