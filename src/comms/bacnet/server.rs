//! BACnet/IP server: publishes analog/binary input and output objects for
//! the mapped tags, answers WhoIs/ReadProperty, and feeds WriteProperty
//! commands into the pending update queues. A one second update task keeps
//! the object present values in step with the tag manager.

use super::codec::{
    BacnetMessage, ObjectId, ObjectType, PropertyValue, PROP_PRESENT_VALUE,
};
use crate::comms::{CommsError, Endpoint, PointDirection};
use crate::tags::TagManager;
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub struct BacnetServer {
    manager: Arc<TagManager>,
    instance: u32,
    binary_points: RwLock<BTreeMap<u16, (String, PointDirection)>>,
    analog_points: RwLock<BTreeMap<u16, (String, PointDirection)>>,
    /// Present values of the published objects, refreshed by the update
    /// task
    present_values: Mutex<HashMap<ObjectId, PropertyValue>>,
}

impl BacnetServer {
    pub fn new(manager: Arc<TagManager>, instance: u32) -> Self {
        Self {
            manager,
            instance,
            binary_points: RwLock::new(BTreeMap::new()),
            analog_points: RwLock::new(BTreeMap::new()),
            present_values: Mutex::new(HashMap::new()),
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

    fn binary_object(address: u16, direction: PointDirection) -> ObjectId {
        let object_type = match direction {
            PointDirection::Input => ObjectType::BinaryInput,
            PointDirection::Output => ObjectType::BinaryOutput,
        };
        ObjectId::new(object_type, address as u32)
    }

    fn analog_object(address: u16, direction: PointDirection) -> ObjectId {
        let object_type = match direction {
            PointDirection::Input => ObjectType::AnalogInput,
            PointDirection::Output => ObjectType::AnalogOutput,
        };
        ObjectId::new(object_type, address as u32)
    }

    /// Copies current tag values into the object present values.
    pub fn refresh_present_values(&self) {
        let mut values = self.present_values.lock();
        for (address, (tag, direction)) in self.binary_points.read().iter() {
            if !self.manager.has_tag(tag) {
                continue;
            }
            let status = self.manager.get_data_by_tag::<bool>(tag);
            values.insert(
                Self::binary_object(*address, *direction),
                PropertyValue::Enumerated(status as u32),
            );
        }
        for (address, (tag, direction)) in self.analog_points.read().iter() {
            if !self.manager.has_tag(tag) {
                continue;
            }
            let value = self.manager.get_data_by_tag::<f64>(tag) as f32;
            values.insert(
                Self::analog_object(*address, *direction),
                PropertyValue::Real(value),
            );
        }
    }

    /// Resolves a ReadProperty request against the published objects.
    pub fn read_property(&self, object: ObjectId, property: u32) -> Option<PropertyValue> {
        if property != PROP_PRESENT_VALUE {
            return None;
        }
        self.present_values.lock().get(&object).copied()
    }

    /// Applies a WriteProperty command: commands resolve through the point
    /// maps into pending tag updates.
    pub fn write_property(
        &self,
        object: ObjectId,
        property: u32,
        value: PropertyValue,
    ) -> bool {
        if property != PROP_PRESENT_VALUE {
            return false;
        }
        let address = object.instance as u16;
        match object.object_type {
            ObjectType::BinaryInput | ObjectType::BinaryOutput => {
                let points = self.binary_points.read();
                let Some((tag, _)) = points.get(&address) else {
                    error!("invalid binary point command request address: {}", address);
                    return false;
                };
                self.manager.add_updated_binary(tag, value.as_bool());
                true
            }
            ObjectType::AnalogInput | ObjectType::AnalogOutput => {
                let points = self.analog_points.read();
                let Some((tag, _)) = points.get(&address) else {
                    error!("invalid analog point command request address: {}", address);
                    return false;
                };
                self.manager.add_updated_analog(tag, value.as_f32() as f64);
                true
            }
            ObjectType::Device => false,
        }
    }

    fn handle_message(&self, message: BacnetMessage) -> Option<BacnetMessage> {
        match message {
            BacnetMessage::WhoIs => Some(BacnetMessage::IAm {
                device_id: self.instance,
                max_apdu: 1476,
            }),
            BacnetMessage::ReadProperty {
                invoke_id,
                object,
                property,
            } => match self.read_property(object, property) {
                Some(value) => Some(BacnetMessage::ReadPropertyAck {
                    invoke_id,
                    object,
                    property,
                    value,
                }),
                None => Some(BacnetMessage::Error {
                    invoke_id,
                    service: 12,
                }),
            },
            BacnetMessage::WriteProperty {
                invoke_id,
                object,
                property,
                value,
                ..
            } => {
                if self.write_property(object, property, value) {
                    Some(BacnetMessage::SimpleAck {
                        invoke_id,
                        service: 15,
                    })
                } else {
                    Some(BacnetMessage::Error {
                        invoke_id,
                        service: 15,
                    })
                }
            }
            _ => None,
        }
    }

    /// Binds the UDP endpoint and spawns the datagram loop plus the
    /// present value update task.
    pub async fn start(self: &Arc<Self>, endpoint: &Endpoint) -> Result<JoinHandle<()>, CommsError> {
        let addr = match endpoint {
            Endpoint::Udp { .. } => endpoint.socket_addr().unwrap(),
            other => return Err(CommsError::InvalidEndpoint(other.to_string())),
        };
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|_| CommsError::BindFailed(addr.clone()))?;
        info!("bacnet server {} listening on {}", self.instance, addr);

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                server.refresh_present_values();
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        let server = self.clone();
        Ok(tokio::spawn(async move {
            let mut buffer = [0u8; 1500];
            loop {
                let (size, peer) = match socket.recv_from(&mut buffer).await {
                    Ok(value) => value,
                    Err(err) => {
                        error!("bacnet recv failed: {}", err);
                        continue;
                    }
                };
                let message = match BacnetMessage::decode(&buffer[..size]) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!("dropping undecodable bacnet datagram from {}: {}", peer, err);
                        continue;
                    }
                };
                if let Some(reply) = server.handle_message(message) {
                    if let Err(err) = socket.send_to(&reply.encode(), peer).await {
                        error!("bacnet send failed: {}", err);
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod test {
    use super::BacnetServer;
    use crate::comms::bacnet::codec::{
        ObjectId, ObjectType, PropertyValue, PROP_PRESENT_VALUE,
    };
    use crate::tags::TagManager;
    use std::sync::Arc;

    fn server() -> (Arc<TagManager>, BacnetServer) {
        let manager = Arc::new(TagManager::new());
        manager.add_internal_data("pump-run", true);
        manager.add_binary_tag("pump-run");
        manager.add_internal_data("tank-level", 6.25);
        manager.add_analog_tag("tank-level");
        let server = BacnetServer::new(manager.clone(), 500);
        assert!(server.add_binary_output(1, "pump-run"));
        assert!(server.add_analog_input(2, "tank-level"));
        assert!(!server.add_analog_input(3, "ghost"));
        (manager, server)
    }

    #[test]
    fn test_present_values_follow_tags() {
        let (_, server) = server();
        server.refresh_present_values();

        let binary = server
            .read_property(
                ObjectId::new(ObjectType::BinaryOutput, 1),
                PROP_PRESENT_VALUE,
            )
            .unwrap();
        assert!(binary.as_bool());

        let analog = server
            .read_property(
                ObjectId::new(ObjectType::AnalogInput, 2),
                PROP_PRESENT_VALUE,
            )
            .unwrap();
        assert!((analog.as_f32() - 6.25).abs() < 1e-6);

        assert!(server
            .read_property(ObjectId::new(ObjectType::AnalogInput, 9), PROP_PRESENT_VALUE)
            .is_none());
    }

    #[test]
    fn test_write_property_queues_updates() {
        let (manager, server) = server();
        assert!(server.write_property(
            ObjectId::new(ObjectType::BinaryOutput, 1),
            PROP_PRESENT_VALUE,
            PropertyValue::Enumerated(0),
        ));
        assert!(server.write_property(
            ObjectId::new(ObjectType::AnalogInput, 2),
            PROP_PRESENT_VALUE,
            PropertyValue::Real(9.5),
        ));
        // Unknown instance logs and drops
        assert!(!server.write_property(
            ObjectId::new(ObjectType::BinaryOutput, 77),
            PROP_PRESENT_VALUE,
            PropertyValue::Enumerated(1),
        ));

        manager.update_internal_data();
        assert!(!manager.get_data_by_tag::<bool>("pump-run"));
        assert!((manager.get_data_by_tag::<f64>("tank-level") - 9.5).abs() < 1e-6);
    }
}
