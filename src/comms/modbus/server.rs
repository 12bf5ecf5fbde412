//! Modbus server: maps addressed coils, discrete inputs, and registers
//! onto tags, answers read requests straight from the tag manager, and
//! feeds write requests into the pending update queues.

use super::codec::{
    ExceptionCode, Request, Response, RtuCodec, RtuFrame, TcpCodec, TcpFrame, MAX_READ_BITS,
    MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS,
};
use super::ScaledValue;
use crate::comms::{CommsError, Endpoint};
use crate::tags::TagManager;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::Framed;

#[derive(Default)]
struct PointMaps {
    coils: BTreeMap<u16, String>,
    discrete_inputs: BTreeMap<u16, String>,
    holding_registers: BTreeMap<u16, String>,
    input_registers: BTreeMap<u16, String>,
    scaling: HashMap<u16, ScaledValue>,
}

pub struct ModbusServer {
    manager: Arc<TagManager>,
    points: RwLock<PointMaps>,
}

impl ModbusServer {
    pub fn new(manager: Arc<TagManager>) -> Self {
        Self {
            manager,
            points: RwLock::new(PointMaps::default()),
        }
    }

    /// Point registration; each returns false when the tag is unknown to
    /// the tag manager, leaving the maps untouched.
    pub fn add_coil(&self, address: u16, tag: &str) -> bool {
        if !self.manager.has_tag(tag) {
            return false;
        }
        self.points.write().coils.insert(address, tag.to_string());
        true
    }

    pub fn add_discrete_input(&self, address: u16, tag: &str) -> bool {
        if !self.manager.has_tag(tag) {
            return false;
        }
        self.points
            .write()
            .discrete_inputs
            .insert(address, tag.to_string());
        true
    }

    pub fn add_holding_register(&self, address: u16, tag: &str, range: (f64, f64)) -> bool {
        if !self.manager.has_tag(tag) {
            return false;
        }
        let mut points = self.points.write();
        points.holding_registers.insert(address, tag.to_string());
        points
            .scaling
            .insert(address, ScaledValue::new(range.0, range.1));
        true
    }

    pub fn add_input_register(&self, address: u16, tag: &str, range: (f64, f64)) -> bool {
        if !self.manager.has_tag(tag) {
            return false;
        }
        let mut points = self.points.write();
        points.input_registers.insert(address, tag.to_string());
        points
            .scaling
            .insert(address, ScaledValue::new(range.0, range.1));
        true
    }

    /// Applies one decoded request against the point maps, producing the
    /// response PDU to send back.
    pub fn handle_request(&self, request: Request) -> Response {
        let function = request.function();
        let result = match request {
            Request::ReadCoils { address, quantity } => self
                .read_bits(address, quantity, false)
                .map(|bits| Response::Bits(function, bits)),
            Request::ReadDiscreteInputs { address, quantity } => self
                .read_bits(address, quantity, true)
                .map(|bits| Response::Bits(function, bits)),
            Request::ReadHoldingRegisters { address, quantity } => self
                .read_words(address, quantity, false)
                .map(|words| Response::Registers(function, words)),
            Request::ReadInputRegisters { address, quantity } => self
                .read_words(address, quantity, true)
                .map(|words| Response::Registers(function, words)),
            Request::WriteSingleCoil { address, value } => self
                .write_bits(address, &[value])
                .map(|_| Response::Echo(function, address, if value { 0xFF00 } else { 0x0000 })),
            Request::WriteSingleRegister { address, value } => self
                .write_words(address, &[value])
                .map(|_| Response::Echo(function, address, value)),
            Request::WriteMultipleCoils { address, values } => {
                let quantity = values.len() as u16;
                if quantity == 0 || quantity > MAX_WRITE_BITS {
                    Err(ExceptionCode::IllegalDataValue)
                } else {
                    self.write_bits(address, &values)
                        .map(|_| Response::WriteAck(function, address, quantity))
                }
            }
            Request::WriteMultipleRegisters { address, values } => {
                let quantity = values.len() as u16;
                if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
                    Err(ExceptionCode::IllegalDataValue)
                } else {
                    self.write_words(address, &values)
                        .map(|_| Response::WriteAck(function, address, quantity))
                }
            }
        };
        match result {
            Ok(response) => response,
            Err(code) => {
                error!("{:?} request failed with {:?}", function, code);
                Response::Exception(function as u8, code)
            }
        }
    }

    fn read_bits(
        &self,
        address: u16,
        quantity: u16,
        discrete: bool,
    ) -> Result<Vec<bool>, ExceptionCode> {
        if quantity == 0 || quantity > MAX_READ_BITS {
            return Err(ExceptionCode::IllegalDataValue);
        }
        if address as u32 + quantity as u32 > 65536 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let points = self.points.read();
        let map = if discrete {
            &points.discrete_inputs
        } else {
            &points.coils
        };
        let mut values = Vec::with_capacity(quantity as usize);
        for offset in 0..quantity {
            let tag = map
                .get(&(address + offset))
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            if !self.manager.has_tag(tag) {
                return Err(ExceptionCode::IllegalDataValue);
            }
            values.push(self.manager.get_data_by_tag::<bool>(tag));
        }
        Ok(values)
    }

    fn read_words(
        &self,
        address: u16,
        quantity: u16,
        input: bool,
    ) -> Result<Vec<u16>, ExceptionCode> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(ExceptionCode::IllegalDataValue);
        }
        if address as u32 + quantity as u32 > 65536 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let points = self.points.read();
        let map = if input {
            &points.input_registers
        } else {
            &points.holding_registers
        };
        let mut values = Vec::with_capacity(quantity as usize);
        for offset in 0..quantity {
            let register = address + offset;
            let tag = map
                .get(&register)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            if !self.manager.has_tag(tag) {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let value = self.manager.get_data_by_tag::<f64>(tag);
            let wire = match points.scaling.get(&register) {
                Some(scale) => scale.to_wire(value),
                None => value as u16,
            };
            values.push(wire);
        }
        Ok(values)
    }

    fn write_bits(&self, address: u16, values: &[bool]) -> Result<(), ExceptionCode> {
        if address as u32 + values.len() as u32 > 65536 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let points = self.points.read();
        // Resolve the whole span before queueing anything so a partial
        // write never lands
        for offset in 0..values.len() {
            if !points.coils.contains_key(&(address + offset as u16)) {
                return Err(ExceptionCode::IllegalDataAddress);
            }
        }
        for (offset, value) in values.iter().enumerate() {
            let tag = &points.coils[&(address + offset as u16)];
            self.manager.add_updated_binary(tag, *value);
        }
        Ok(())
    }

    fn write_words(&self, address: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        if address as u32 + values.len() as u32 > 65536 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let points = self.points.read();
        for offset in 0..values.len() {
            if !points
                .holding_registers
                .contains_key(&(address + offset as u16))
            {
                return Err(ExceptionCode::IllegalDataAddress);
            }
        }
        for (offset, wire) in values.iter().enumerate() {
            let register = address + offset as u16;
            let tag = &points.holding_registers[&register];
            let value = match points.scaling.get(&register) {
                Some(scale) => scale.to_engineering(*wire),
                None => *wire as f64,
            };
            self.manager.add_updated_analog(tag, value);
        }
        Ok(())
    }

    /// Binds the configured endpoint and spawns the accept (TCP) or frame
    /// (serial RTU) loop.
    pub async fn start(
        self: &Arc<Self>,
        endpoint: &Endpoint,
    ) -> Result<JoinHandle<()>, CommsError> {
        match endpoint {
            Endpoint::Tcp { .. } => {
                let addr = endpoint.socket_addr().unwrap();
                let listener = TcpListener::bind(&addr)
                    .await
                    .map_err(|_| CommsError::BindFailed(addr.clone()))?;
                info!("modbus server listening on {}", addr);
                let server = self.clone();
                Ok(tokio::spawn(async move {
                    loop {
                        let (stream, peer) = match listener.accept().await {
                            Ok(value) => value,
                            Err(err) => {
                                error!("modbus accept failed: {}", err);
                                continue;
                            }
                        };
                        debug!("modbus connection from {}", peer);
                        let server = server.clone();
                        tokio::spawn(async move {
                            let mut framed = Framed::new(stream, TcpCodec);
                            while let Some(frame) = framed.next().await {
                                let frame = match frame {
                                    Ok(frame) => frame,
                                    Err(err) => {
                                        error!("modbus framing error: {}", err);
                                        break;
                                    }
                                };
                                let response = match Request::decode(&frame.pdu) {
                                    Ok(request) => server.handle_request(request),
                                    Err((function, code)) => Response::Exception(function, code),
                                };
                                let mut pdu = Vec::new();
                                response.encode(&mut pdu);
                                let reply = TcpFrame {
                                    transaction_id: frame.transaction_id,
                                    unit_id: frame.unit_id,
                                    pdu,
                                };
                                if let Err(err) = framed.send(reply).await {
                                    error!("modbus send failed: {}", err);
                                    break;
                                }
                            }
                        });
                    }
                }))
            }
            Endpoint::Serial { device } => {
                let port = tokio_serial::new(device, 9600)
                    .open_native_async()
                    .map_err(|_| CommsError::BindFailed(device.clone()))?;
                info!("modbus server on serial {}", device);
                let server = self.clone();
                Ok(tokio::spawn(async move {
                    let mut framed = Framed::new(port, RtuCodec);
                    while let Some(frame) = framed.next().await {
                        let frame = match frame {
                            Ok(frame) => frame,
                            Err(err) => {
                                error!("modbus rtu framing error: {}", err);
                                continue;
                            }
                        };
                        let response = match Request::decode(&frame.pdu) {
                            Ok(request) => server.handle_request(request),
                            Err((function, code)) => Response::Exception(function, code),
                        };
                        let mut pdu = Vec::new();
                        response.encode(&mut pdu);
                        let reply = RtuFrame {
                            unit_id: frame.unit_id,
                            pdu,
                        };
                        if let Err(err) = framed.send(reply).await {
                            error!("modbus rtu send failed: {}", err);
                            break;
                        }
                    }
                }))
            }
            Endpoint::Udp { .. } => Err(CommsError::InvalidEndpoint(endpoint.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::ModbusServer;
    use crate::comms::modbus::codec::{ExceptionCode, FunctionCode, Request, Response};
    use crate::tags::TagManager;
    use std::sync::Arc;

    fn server() -> (Arc<TagManager>, ModbusServer) {
        let manager = Arc::new(TagManager::new());
        manager.add_internal_data("brkr", false);
        manager.add_binary_tag("brkr");
        manager.add_internal_data("volts", 0.0);
        manager.add_analog_tag("volts");
        let server = ModbusServer::new(manager.clone());
        assert!(server.add_coil(5, "brkr"));
        assert!(server.add_holding_register(10, "volts", (0.0, 100.0)));
        assert!(!server.add_coil(6, "missing"));
        (manager, server)
    }

    #[test]
    fn test_coil_write_then_read() {
        let (manager, server) = server();
        let response = server.handle_request(Request::WriteSingleCoil {
            address: 5,
            value: true,
        });
        assert_eq!(
            response,
            Response::Echo(FunctionCode::WriteSingleCoil, 5, 0xFF00)
        );

        // The write lands in the pending queue; the scan cycle drains it
        manager.update_internal_data();
        manager.clear_updated_tags();

        let response = server.handle_request(Request::ReadCoils {
            address: 5,
            quantity: 1,
        });
        assert_eq!(
            response,
            Response::Bits(FunctionCode::ReadCoils, vec![true])
        );
        let mut pdu = Vec::new();
        response.encode(&mut pdu);
        // function, byte count, one packed byte
        assert_eq!(pdu, vec![0x01, 0x01, 0x01]);
    }

    #[test]
    fn test_register_scaling_round_trip() {
        let (manager, server) = server();
        let response = server.handle_request(Request::WriteSingleRegister {
            address: 10,
            value: 32768,
        });
        assert!(matches!(response, Response::Echo(..)));
        manager.update_internal_data();
        manager.clear_updated_tags();

        let volts = manager.get_data_by_tag::<f64>("volts");
        assert!((volts - 50.0).abs() < 0.01);

        let response = server.handle_request(Request::ReadHoldingRegisters {
            address: 10,
            quantity: 1,
        });
        match response {
            Response::Registers(_, values) => {
                assert!(values[0] == 32767 || values[0] == 32768);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_quantity_bounds() {
        let (_, server) = server();
        let response = server.handle_request(Request::ReadCoils {
            address: 5,
            quantity: 0,
        });
        assert_eq!(
            response,
            Response::Exception(0x01, ExceptionCode::IllegalDataValue)
        );
        let response = server.handle_request(Request::ReadCoils {
            address: 5,
            quantity: 2001,
        });
        assert_eq!(
            response,
            Response::Exception(0x01, ExceptionCode::IllegalDataValue)
        );
        let response = server.handle_request(Request::ReadHoldingRegisters {
            address: 10,
            quantity: 126,
        });
        assert_eq!(
            response,
            Response::Exception(0x03, ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn test_address_overflow_and_unmapped() {
        let (_, server) = server();
        let response = server.handle_request(Request::ReadCoils {
            address: 65535,
            quantity: 2,
        });
        assert_eq!(
            response,
            Response::Exception(0x01, ExceptionCode::IllegalDataValue)
        );
        let response = server.handle_request(Request::ReadCoils {
            address: 4,
            quantity: 2,
        });
        assert_eq!(
            response,
            Response::Exception(0x01, ExceptionCode::IllegalDataAddress)
        );
        let response = server.handle_request(Request::WriteSingleCoil {
            address: 9,
            value: true,
        });
        assert_eq!(
            response,
            Response::Exception(0x05, ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn test_read_then_rewrite_is_stable() {
        let (manager, server) = server();
        manager.add_updated_analog("volts", 73.2);
        manager.update_internal_data();
        manager.clear_updated_tags();

        let first = match server.handle_request(Request::ReadHoldingRegisters {
            address: 10,
            quantity: 1,
        }) {
            Response::Registers(_, values) => values,
            other => panic!("unexpected response {:?}", other),
        };
        let response = server.handle_request(Request::WriteMultipleRegisters {
            address: 10,
            values: first.clone(),
        });
        assert!(matches!(response, Response::WriteAck(..)));
        manager.update_internal_data();
        manager.clear_updated_tags();

        let second = match server.handle_request(Request::ReadHoldingRegisters {
            address: 10,
            quantity: 1,
        }) {
            Response::Registers(_, values) => values,
            other => panic!("unexpected response {:?}", other),
        };
        assert_eq!(first, second);
    }
}
