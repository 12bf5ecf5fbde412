//! Configuration tree of the device: element names follow the document
//! layout (`field-device`, `cycle-time`, `tags`, `comms`, per protocol
//! server/client blocks with per point entries), loaded from the file
//! named on the command line.

use crate::comms::Endpoint;
use log::LevelFilter;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::Path;
use thiserror::Error;

/// The runtime version extracted from the Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {0}")]
    Unreadable(String),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let data = read_to_string(path)
        .map_err(|_| ConfigError::Unreadable(path.display().to_string()))?;
    let config: Config = serde_json::from_str(&data)?;
    Ok(config)
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "field-device")]
    pub field_device: DeviceConfig,
}

fn default_cycle_time() -> u64 {
    1000
}

fn default_logging() -> LevelFilter {
    LevelFilter::Info
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(rename = "cycle-time", default = "default_cycle_time")]
    pub cycle_time: u64,
    #[serde(default = "default_logging")]
    pub logging: LevelFilter,
    #[serde(default)]
    pub logic: Option<String>,
    #[serde(default)]
    pub input: Vec<IoConfig>,
    #[serde(default)]
    pub output: Vec<IoConfig>,
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default)]
    pub comms: CommsConfig,
}

/// Provider side i/o block: the external points this device fronts.
#[derive(Debug, Default, Deserialize)]
pub struct IoConfig {
    #[serde(default)]
    pub binary: Vec<IoPoint>,
    #[serde(default)]
    pub analog: Vec<IoPoint>,
}

#[derive(Debug, Deserialize)]
pub struct IoPoint {
    pub id: String,
    /// Point name in the external store; defaults to the id
    #[serde(default)]
    pub point: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TagsConfig {
    #[serde(rename = "external-tag", default)]
    pub external_tags: Vec<ExternalTag>,
    #[serde(rename = "internal-tag", default)]
    pub internal_tags: Vec<InternalTag>,
}

#[derive(Debug, Deserialize)]
pub struct ExternalTag {
    pub name: String,
    pub io: String,
    #[serde(rename = "type")]
    pub tag_type: TagType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagType {
    Binary,
    Analog,
}

#[derive(Debug, Deserialize)]
pub struct InternalTag {
    pub name: String,
    #[serde(default)]
    pub status: Option<bool>,
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommsConfig {
    #[serde(rename = "modbus-server", default)]
    pub modbus_servers: Vec<ModbusServerConfig>,
    #[serde(rename = "modbus-client", default)]
    pub modbus_clients: Vec<ModbusClientConfig>,
    #[serde(rename = "dnp3-server", default)]
    pub dnp3_servers: Vec<Dnp3ServerConfig>,
    #[serde(rename = "dnp3-client", default)]
    pub dnp3_clients: Vec<Dnp3ClientConfig>,
    #[serde(rename = "iec60870-5-104-server", default)]
    pub iec104_servers: Vec<Iec104ServerConfig>,
    #[serde(rename = "iec60870-5-104-client", default)]
    pub iec104_clients: Vec<Iec104ClientConfig>,
    #[serde(rename = "bacnet-server", default)]
    pub bacnet_servers: Vec<BacnetServerConfig>,
    #[serde(rename = "bacnet-client", default)]
    pub bacnet_clients: Vec<BacnetClientConfig>,
    #[serde(rename = "iec61850-goose", default)]
    pub goose_outstations: Vec<GooseConfig>,
}

/// Plain addressed point
#[derive(Debug, Deserialize)]
pub struct PointEntry {
    pub address: u16,
    pub tag: String,
}

/// Addressed register with an optional engineering range
#[derive(Debug, Deserialize)]
pub struct RegisterEntry {
    pub address: u16,
    pub tag: String,
    #[serde(rename = "min-value", default)]
    pub min_value: Option<f64>,
    #[serde(rename = "max-value", default)]
    pub max_value: Option<f64>,
}

impl RegisterEntry {
    pub fn range(&self) -> (f64, f64) {
        match (self.min_value, self.max_value) {
            (Some(min), Some(max)) => (min, max),
            _ => crate::comms::modbus::DEFAULT_RANGE,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ModbusServerConfig {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub coil: Vec<PointEntry>,
    #[serde(rename = "discrete-input", default)]
    pub discrete_input: Vec<PointEntry>,
    #[serde(rename = "holding-register", default)]
    pub holding_register: Vec<RegisterEntry>,
    #[serde(rename = "input-register", default)]
    pub input_register: Vec<RegisterEntry>,
}

fn default_modbus_scan_rate() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
pub struct ModbusClientConfig {
    #[serde(rename = "command-interface", default)]
    pub command_interface: Option<Endpoint>,
    #[serde(rename = "modbus-connection", default)]
    pub connections: Vec<ModbusConnectionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ModbusConnectionConfig {
    pub endpoint: Endpoint,
    #[serde(rename = "unit-id", default)]
    pub unit_id: u8,
    #[serde(rename = "scan-rate", default = "default_modbus_scan_rate")]
    pub scan_rate: u64,
    #[serde(default)]
    pub coil: Vec<PointEntry>,
    #[serde(rename = "discrete-input", default)]
    pub discrete_input: Vec<PointEntry>,
    #[serde(rename = "holding-register", default)]
    pub holding_register: Vec<RegisterEntry>,
    #[serde(rename = "input-register", default)]
    pub input_register: Vec<RegisterEntry>,
}

fn default_link_address() -> u16 {
    10
}

fn default_class() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
pub struct Dnp3PointEntry {
    pub address: u16,
    pub tag: String,
    #[serde(default = "default_class")]
    pub class: u8,
}

#[derive(Debug, Deserialize)]
pub struct Dnp3OutputEntry {
    pub address: u16,
    pub tag: String,
    #[serde(default)]
    pub sbo: bool,
}

#[derive(Debug, Deserialize)]
pub struct Dnp3ServerConfig {
    pub endpoint: Endpoint,
    #[serde(default = "default_link_address")]
    pub address: u16,
    #[serde(rename = "binary-input", default)]
    pub binary_input: Vec<Dnp3PointEntry>,
    #[serde(rename = "binary-output", default)]
    pub binary_output: Vec<Dnp3OutputEntry>,
    #[serde(rename = "analog-input", default)]
    pub analog_input: Vec<Dnp3PointEntry>,
    #[serde(rename = "analog-output", default)]
    pub analog_output: Vec<Dnp3OutputEntry>,
}

fn default_scan_rate_all() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct Dnp3ClientConfig {
    #[serde(rename = "command-interface", default)]
    pub command_interface: Option<Endpoint>,
    #[serde(rename = "dnp3-connection", default)]
    pub connections: Vec<Dnp3ConnectionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Dnp3ConnectionConfig {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub address: u16,
    #[serde(rename = "rtu-address", default = "default_link_address")]
    pub rtu_address: u16,
    #[serde(rename = "scan-rate-all", default = "default_scan_rate_all")]
    pub scan_rate_all: u64,
    #[serde(rename = "scan-rate-class0", default)]
    pub scan_rate_class0: u64,
    #[serde(rename = "scan-rate-class1", default)]
    pub scan_rate_class1: u64,
    #[serde(rename = "scan-rate-class2", default)]
    pub scan_rate_class2: u64,
    #[serde(rename = "scan-rate-class3", default)]
    pub scan_rate_class3: u64,
    #[serde(rename = "binary-input", default)]
    pub binary_input: Vec<PointEntry>,
    #[serde(rename = "binary-output", default)]
    pub binary_output: Vec<Dnp3OutputEntry>,
    #[serde(rename = "analog-input", default)]
    pub analog_input: Vec<PointEntry>,
    #[serde(rename = "analog-output", default)]
    pub analog_output: Vec<Dnp3OutputEntry>,
}

fn default_common_address() -> u16 {
    1
}

fn default_reverse_poll_rate() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
pub struct Iec104ServerConfig {
    pub endpoint: Endpoint,
    #[serde(rename = "common-address", default = "default_common_address")]
    pub common_address: u16,
    #[serde(rename = "reverse-poll-rate", default = "default_reverse_poll_rate")]
    pub reverse_poll_rate: u64,
    #[serde(rename = "binary-input", default)]
    pub binary_input: Vec<PointEntry>,
    #[serde(rename = "binary-output", default)]
    pub binary_output: Vec<PointEntry>,
    #[serde(rename = "analog-input", default)]
    pub analog_input: Vec<PointEntry>,
    #[serde(rename = "analog-output", default)]
    pub analog_output: Vec<PointEntry>,
}

#[derive(Debug, Deserialize)]
pub struct Iec104ClientConfig {
    #[serde(rename = "command-interface", default)]
    pub command_interface: Option<Endpoint>,
    #[serde(rename = "iec60870-5-104-connection", default)]
    pub connections: Vec<Iec104ConnectionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Iec104ConnectionConfig {
    pub endpoint: Endpoint,
    #[serde(rename = "common-address", default = "default_common_address")]
    pub common_address: u16,
    #[serde(rename = "binary-input", default)]
    pub binary_input: Vec<PointEntry>,
    #[serde(rename = "binary-output", default)]
    pub binary_output: Vec<PointEntry>,
    #[serde(rename = "analog-input", default)]
    pub analog_input: Vec<PointEntry>,
    #[serde(rename = "analog-output", default)]
    pub analog_output: Vec<PointEntry>,
}

fn default_instance() -> u32 {
    1
}

fn default_bacnet_scan_rate() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
pub struct BacnetServerConfig {
    pub endpoint: Endpoint,
    #[serde(default = "default_instance")]
    pub instance: u32,
    #[serde(rename = "binary-input", default)]
    pub binary_input: Vec<PointEntry>,
    #[serde(rename = "binary-output", default)]
    pub binary_output: Vec<PointEntry>,
    #[serde(rename = "analog-input", default)]
    pub analog_input: Vec<PointEntry>,
    #[serde(rename = "analog-output", default)]
    pub analog_output: Vec<PointEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BacnetClientConfig {
    #[serde(rename = "command-interface", default)]
    pub command_interface: Option<Endpoint>,
    #[serde(rename = "bacnet-connection", default)]
    pub connections: Vec<BacnetConnectionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct BacnetConnectionConfig {
    pub endpoint: Endpoint,
    #[serde(default = "default_instance")]
    pub instance: u32,
    #[serde(rename = "rtu-instance", default = "default_instance")]
    pub rtu_instance: u32,
    #[serde(rename = "scan-rate", default = "default_bacnet_scan_rate")]
    pub scan_rate: u64,
    #[serde(rename = "binary-input", default)]
    pub binary_input: Vec<PointEntry>,
    #[serde(rename = "binary-output", default)]
    pub binary_output: Vec<PointEntry>,
    #[serde(rename = "analog-input", default)]
    pub analog_input: Vec<PointEntry>,
    #[serde(rename = "analog-output", default)]
    pub analog_output: Vec<PointEntry>,
}

fn default_publish_rate() -> u64 {
    5
}

fn default_conf_rev() -> u32 {
    1
}

fn default_ttl() -> u32 {
    10000
}

#[derive(Debug, Deserialize)]
pub struct GooseConfig {
    pub interface: String,
    #[serde(default)]
    pub vlan: Option<u16>,
    #[serde(rename = "publish-rate", default = "default_publish_rate")]
    pub publish_rate: u64,
    #[serde(rename = "control-block", default)]
    pub control_blocks: Vec<GooseControlBlockConfig>,
    #[serde(default)]
    pub subscription: Vec<GooseSubscriptionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GooseControlBlockConfig {
    #[serde(rename = "gocb-ref")]
    pub gocb_ref: String,
    #[serde(rename = "dataset-ref")]
    pub dataset_ref: String,
    #[serde(rename = "go-id")]
    pub go_id: String,
    #[serde(default)]
    pub appid: u16,
    #[serde(rename = "conf-rev", default = "default_conf_rev")]
    pub conf_rev: u32,
    #[serde(rename = "time-to-live", default = "default_ttl")]
    pub time_to_live: u32,
    #[serde(default)]
    pub entry: Vec<GooseEntryConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GooseSubscriptionConfig {
    #[serde(rename = "dataset-ref")]
    pub dataset_ref: String,
    #[serde(default)]
    pub entry: Vec<GooseEntryConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GooseEntryConfig {
    pub tag: String,
    #[serde(rename = "type")]
    pub tag_type: TagType,
}
