//! DNP3 outstation: serves class scans from the tag manager and applies
//! CROB / analog output commands through the pending update queues, with
//! select-before-operate enforcement per point.

use super::codec::{
    AppFunction, ClassField, CommandStatus, Dnp3Codec, Fragment, LinkFrame, ObjectBlock,
    OperationType,
};
use crate::comms::{CommsError, Endpoint};
use crate::tags::TagManager;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// How long a select stays armed before an operate stops matching it
const SELECT_TIMEOUT: Duration = Duration::from_secs(10);

struct BinaryPoint {
    tag: String,
    class: ClassField,
    sbo: bool,
}

struct AnalogPoint {
    tag: String,
    class: ClassField,
    sbo: bool,
}

pub struct Dnp3Server {
    manager: Arc<TagManager>,
    local_address: u16,
    binary_points: RwLock<BTreeMap<u16, BinaryPoint>>,
    analog_points: RwLock<BTreeMap<u16, AnalogPoint>>,
    selected_binary: Mutex<HashMap<u16, Instant>>,
    selected_analog: Mutex<HashMap<u16, Instant>>,
}

impl Dnp3Server {
    pub fn new(manager: Arc<TagManager>, local_address: u16) -> Self {
        Self {
            manager,
            local_address,
            binary_points: RwLock::new(BTreeMap::new()),
            analog_points: RwLock::new(BTreeMap::new()),
            selected_binary: Mutex::new(HashMap::new()),
            selected_analog: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_binary_input(&self, address: u16, tag: &str, class: ClassField) -> bool {
        self.add_binary(address, tag, class, false)
    }

    pub fn add_binary_output(&self, address: u16, tag: &str, sbo: bool) -> bool {
        self.add_binary(address, tag, ClassField::CLASS_0, sbo)
    }

    pub fn add_analog_input(&self, address: u16, tag: &str, class: ClassField) -> bool {
        self.add_analog(address, tag, class, false)
    }

    pub fn add_analog_output(&self, address: u16, tag: &str, sbo: bool) -> bool {
        self.add_analog(address, tag, ClassField::CLASS_0, sbo)
    }

    fn add_binary(&self, address: u16, tag: &str, class: ClassField, sbo: bool) -> bool {
        if !self.manager.has_tag(tag) {
            return false;
        }
        self.binary_points.write().insert(
            address,
            BinaryPoint {
                tag: tag.to_string(),
                class,
                sbo,
            },
        );
        true
    }

    fn add_analog(&self, address: u16, tag: &str, class: ClassField, sbo: bool) -> bool {
        if !self.manager.has_tag(tag) {
            return false;
        }
        self.analog_points.write().insert(
            address,
            AnalogPoint {
                tag: tag.to_string(),
                class,
                sbo,
            },
        );
        true
    }

    /// Builds the response fragment for one inbound request.
    pub fn handle_fragment(&self, request: Fragment) -> Fragment {
        let mut response = Fragment::new(request.seq, AppFunction::Response);
        for block in request.objects {
            match (request.function, block) {
                (AppFunction::Read, ObjectBlock::ClassRead(classes)) => {
                    self.serve_class_read(classes, &mut response);
                }
                (AppFunction::Select, ObjectBlock::Crob { index, operation, .. }) => {
                    let status = self.select_binary(index);
                    response.objects.push(ObjectBlock::Crob {
                        index,
                        operation,
                        status,
                    });
                }
                (AppFunction::Operate, ObjectBlock::Crob { index, operation, .. }) => {
                    let status = self.operate_binary(index, operation, true);
                    response.objects.push(ObjectBlock::Crob {
                        index,
                        operation,
                        status,
                    });
                }
                (AppFunction::DirectOperate, ObjectBlock::Crob { index, operation, .. }) => {
                    let status = self.operate_binary(index, operation, false);
                    response.objects.push(ObjectBlock::Crob {
                        index,
                        operation,
                        status,
                    });
                }
                (AppFunction::Select, ObjectBlock::AnalogOutput { index, value, .. }) => {
                    let status = self.select_analog(index);
                    response.objects.push(ObjectBlock::AnalogOutput {
                        index,
                        value,
                        status,
                    });
                }
                (AppFunction::Operate, ObjectBlock::AnalogOutput { index, value, .. }) => {
                    let status = self.operate_analog(index, value, true);
                    response.objects.push(ObjectBlock::AnalogOutput {
                        index,
                        value,
                        status,
                    });
                }
                (AppFunction::DirectOperate, ObjectBlock::AnalogOutput { index, value, .. }) => {
                    let status = self.operate_analog(index, value, false);
                    response.objects.push(ObjectBlock::AnalogOutput {
                        index,
                        value,
                        status,
                    });
                }
                (function, block) => {
                    debug!("ignoring {:?} with {:?}", function, block);
                }
            }
        }
        response
    }

    fn serve_class_read(&self, classes: ClassField, response: &mut Fragment) {
        let statics = classes.contains(ClassField::CLASS_0);
        let binaries: Vec<(u16, bool)> = self
            .binary_points
            .read()
            .iter()
            .filter(|(_, point)| statics || classes.intersects(point.class))
            .filter(|(_, point)| self.manager.has_tag(&point.tag))
            .map(|(address, point)| (*address, self.manager.get_data_by_tag::<bool>(&point.tag)))
            .collect();
        if !binaries.is_empty() {
            response.objects.push(ObjectBlock::BinaryInputs(binaries));
        }
        let analogs: Vec<(u16, f32)> = self
            .analog_points
            .read()
            .iter()
            .filter(|(_, point)| statics || classes.intersects(point.class))
            .filter(|(_, point)| self.manager.has_tag(&point.tag))
            .map(|(address, point)| {
                (
                    *address,
                    self.manager.get_data_by_tag::<f64>(&point.tag) as f32,
                )
            })
            .collect();
        if !analogs.is_empty() {
            response.objects.push(ObjectBlock::AnalogInputs(analogs));
        }
    }

    fn select_binary(&self, index: u16) -> CommandStatus {
        if !self.binary_points.read().contains_key(&index) {
            return CommandStatus::OutOfRange;
        }
        self.selected_binary.lock().insert(index, Instant::now());
        CommandStatus::Success
    }

    fn select_analog(&self, index: u16) -> CommandStatus {
        if !self.analog_points.read().contains_key(&index) {
            return CommandStatus::OutOfRange;
        }
        self.selected_analog.lock().insert(index, Instant::now());
        CommandStatus::Success
    }

    fn operate_binary(
        &self,
        index: u16,
        operation: OperationType,
        select_before_operate: bool,
    ) -> CommandStatus {
        let points = self.binary_points.read();
        let Some(point) = points.get(&index) else {
            return CommandStatus::OutOfRange;
        };
        let selected = self
            .selected_binary
            .lock()
            .remove(&index)
            .map(|armed| armed.elapsed() < SELECT_TIMEOUT)
            .unwrap_or(false);
        if point.sbo && !(select_before_operate && selected) {
            return CommandStatus::NoSelect;
        }
        let value = operation == OperationType::LatchOn;
        self.manager.add_updated_binary(&point.tag, value);
        CommandStatus::Success
    }

    fn operate_analog(&self, index: u16, value: f32, select_before_operate: bool) -> CommandStatus {
        let points = self.analog_points.read();
        let Some(point) = points.get(&index) else {
            return CommandStatus::OutOfRange;
        };
        let selected = self
            .selected_analog
            .lock()
            .remove(&index)
            .map(|armed| armed.elapsed() < SELECT_TIMEOUT)
            .unwrap_or(false);
        if point.sbo && !(select_before_operate && selected) {
            return CommandStatus::NoSelect;
        }
        self.manager.add_updated_analog(&point.tag, value as f64);
        CommandStatus::Success
    }

    pub async fn start(self: &Arc<Self>, endpoint: &Endpoint) -> Result<JoinHandle<()>, CommsError> {
        let addr = match endpoint {
            Endpoint::Tcp { .. } => endpoint.socket_addr().unwrap(),
            other => return Err(CommsError::InvalidEndpoint(other.to_string())),
        };
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|_| CommsError::BindFailed(addr.clone()))?;
        info!("dnp3 outstation listening on {}", addr);
        let server = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(value) => value,
                    Err(err) => {
                        error!("dnp3 accept failed: {}", err);
                        continue;
                    }
                };
                debug!("dnp3 master connected from {}", peer);
                let server = server.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, Dnp3Codec);
                    while let Some(frame) = framed.next().await {
                        let frame = match frame {
                            Ok(frame) => frame,
                            Err(err) => {
                                error!("dnp3 framing error: {}", err);
                                break;
                            }
                        };
                        let fragment = match Fragment::decode(&frame.payload) {
                            Ok(fragment) => fragment,
                            Err(err) => {
                                error!("dnp3 fragment error: {}", err);
                                continue;
                            }
                        };
                        let response = server.handle_fragment(fragment);
                        let reply = LinkFrame {
                            destination: frame.source,
                            source: server.local_address,
                            payload: response.encode(),
                        };
                        if let Err(err) = framed.send(reply).await {
                            error!("dnp3 send failed: {}", err);
                            break;
                        }
                    }
                });
            }
        }))
    }
}

#[cfg(test)]
mod test {
    use super::Dnp3Server;
    use crate::comms::dnp3::codec::{
        AppFunction, ClassField, CommandStatus, Fragment, ObjectBlock, OperationType,
    };
    use crate::tags::TagManager;
    use std::sync::Arc;

    fn outstation() -> (Arc<TagManager>, Dnp3Server) {
        let manager = Arc::new(TagManager::new());
        manager.add_internal_data("gen-breaker", false);
        manager.add_binary_tag("gen-breaker");
        manager.add_internal_data("gen-mw", 80.0);
        manager.add_analog_tag("gen-mw");
        manager.add_internal_data("setpoint", 0.0);
        manager.add_analog_tag("setpoint");

        let server = Dnp3Server::new(manager.clone(), 10);
        assert!(server.add_binary_output(1, "gen-breaker", true));
        assert!(server.add_analog_input(0, "gen-mw", ClassField::CLASS_2));
        assert!(server.add_analog_output(5, "setpoint", false));
        (manager, server)
    }

    fn crob(function: AppFunction, index: u16) -> Fragment {
        let mut fragment = Fragment::new(1, function);
        fragment.objects.push(ObjectBlock::Crob {
            index,
            operation: OperationType::LatchOn,
            status: CommandStatus::Success,
        });
        fragment
    }

    fn crob_status(response: &Fragment) -> CommandStatus {
        match response.objects.first() {
            Some(ObjectBlock::Crob { status, .. }) => *status,
            other => panic!("unexpected response objects: {:?}", other),
        }
    }

    #[test]
    fn test_class_read_serves_points() {
        let (_, server) = outstation();
        let mut request = Fragment::new(0, AppFunction::Read);
        request
            .objects
            .push(ObjectBlock::ClassRead(ClassField::CLASS_0));
        let response = server.handle_fragment(request);
        let mut saw_binary = false;
        let mut saw_analog = false;
        for block in &response.objects {
            match block {
                ObjectBlock::BinaryInputs(points) => {
                    assert_eq!(points, &vec![(1, false)]);
                    saw_binary = true;
                }
                ObjectBlock::AnalogInputs(points) => {
                    assert_eq!(points.len(), 2);
                    saw_analog = true;
                }
                other => panic!("unexpected block {:?}", other),
            }
        }
        assert!(saw_binary && saw_analog);
    }

    #[test]
    fn test_operate_unknown_index_is_out_of_range() {
        let (_, server) = outstation();
        let response = server.handle_fragment(crob(AppFunction::Operate, 42));
        assert_eq!(crob_status(&response), CommandStatus::OutOfRange);
    }

    #[test]
    fn test_sbo_point_requires_select() {
        let (manager, server) = outstation();

        // Direct operate against an SBO point is refused
        let response = server.handle_fragment(crob(AppFunction::DirectOperate, 1));
        assert_eq!(crob_status(&response), CommandStatus::NoSelect);
        assert!(!manager.is_updated_binary("gen-breaker"));

        // Operate without a select is refused as well
        let response = server.handle_fragment(crob(AppFunction::Operate, 1));
        assert_eq!(crob_status(&response), CommandStatus::NoSelect);

        // Select then operate succeeds and queues the write
        let response = server.handle_fragment(crob(AppFunction::Select, 1));
        assert_eq!(crob_status(&response), CommandStatus::Success);
        let response = server.handle_fragment(crob(AppFunction::Operate, 1));
        assert_eq!(crob_status(&response), CommandStatus::Success);
        assert!(manager.is_updated_binary("gen-breaker"));

        manager.update_internal_data();
        assert!(manager.get_data_by_tag::<bool>("gen-breaker"));
    }

    #[test]
    fn test_direct_operate_analog() {
        let (manager, server) = outstation();
        let mut fragment = Fragment::new(2, AppFunction::DirectOperate);
        fragment.objects.push(ObjectBlock::AnalogOutput {
            index: 5,
            value: 66.5,
            status: CommandStatus::Success,
        });
        let response = server.handle_fragment(fragment);
        match response.objects.first() {
            Some(ObjectBlock::AnalogOutput { status, .. }) => {
                assert_eq!(*status, CommandStatus::Success)
            }
            other => panic!("unexpected response objects: {:?}", other),
        }
        manager.update_internal_data();
        assert!((manager.get_data_by_tag::<f64>("setpoint") - 66.5).abs() < 1e-6);
    }
}
