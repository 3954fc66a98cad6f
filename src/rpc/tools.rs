//! Tool catalogue and dispatch
//!
//! Every session operation is exposed as a named tool with a JSON input
//! schema. Results carry the raw hex of any value read alongside its
//! decoded form, when the characteristic has a known format.

use super::RpcError;
use crate::domain::models::{CharacteristicInfo, DiscoveredDevice, WriteMode};
use crate::infrastructure::bluetooth::control::clamp_power;
use crate::infrastructure::bluetooth::protocol::{self, uuids, FtmsFeatures, SimulationParameters};
use crate::infrastructure::bluetooth::{BluetoothService, FitnessMachineControl};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use uuid::Uuid;

const DEFAULT_SUBSCRIBE_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_SUBSCRIBE_COUNT: usize = 10;
/// Longest scan or collection window a caller may ask for
const MAX_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

fn tool(name: &'static str, description: &'static str, input_schema: Value) -> ToolDefinition {
    ToolDefinition {
        name,
        description,
        input_schema,
    }
}

fn no_params() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn characteristic_only() -> Value {
    json!({
        "type": "object",
        "properties": {
            "characteristic": {
                "type": "string",
                "description": "Characteristic UUID, short (2A37) or full form"
            }
        },
        "required": ["characteristic"]
    })
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        tool(
            "ble_scan",
            "Scan for BLE peripherals and list what was seen, strongest signal first",
            json!({
                "type": "object",
                "properties": {
                    "duration_seconds": { "type": "number", "description": "Scan length in seconds" },
                    "service": { "type": "string", "description": "Only report devices advertising this service" },
                    "name_filter": { "type": "string", "description": "Case-insensitive name substring" }
                }
            }),
        ),
        tool(
            "ble_connect",
            "Connect to a scanned peripheral by identifier or name substring",
            json!({
                "type": "object",
                "properties": {
                    "target": { "type": "string", "description": "Identifier or name substring" }
                },
                "required": ["target"]
            }),
        ),
        tool("ble_disconnect", "Disconnect from the current peripheral", no_params()),
        tool("ble_status", "Connection and radio state", no_params()),
        tool(
            "ble_get_services",
            "Services of the connected peripheral with their characteristics",
            no_params(),
        ),
        tool(
            "ble_get_characteristics",
            "Characteristics of the connected peripheral, optionally for one service",
            json!({
                "type": "object",
                "properties": {
                    "service": { "type": "string", "description": "Service UUID" }
                }
            }),
        ),
        tool("ble_device_info", "Summary of the connected peripheral", no_params()),
        tool("ble_read_rssi", "Signal strength of the connected peripheral", no_params()),
        tool("ble_read", "Read a characteristic value", characteristic_only()),
        tool(
            "ble_write",
            "Write hex bytes to a characteristic",
            json!({
                "type": "object",
                "properties": {
                    "characteristic": { "type": "string" },
                    "data": { "type": "string", "description": "Hex bytes, e.g. \"05 96 00\"" },
                    "with_response": { "type": "boolean", "default": true }
                },
                "required": ["characteristic", "data"]
            }),
        ),
        tool(
            "ble_subscribe",
            "Enable notifications and collect values for a while; notifications stay enabled",
            json!({
                "type": "object",
                "properties": {
                    "characteristic": { "type": "string" },
                    "duration_seconds": { "type": "number", "default": 5 },
                    "max_count": { "type": "integer", "default": 10 }
                },
                "required": ["characteristic"]
            }),
        ),
        tool(
            "ble_unsubscribe",
            "Disable notifications for a characteristic",
            characteristic_only(),
        ),
        tool(
            "ble_get_buffered",
            "Values buffered from notifications, oldest first",
            json!({
                "type": "object",
                "properties": {
                    "characteristic": { "type": "string" },
                    "last": { "type": "integer", "description": "Only the newest N values" }
                },
                "required": ["characteristic"]
            }),
        ),
        tool(
            "ftms_read_features",
            "Read and decode the Fitness Machine Feature characteristic",
            no_params(),
        ),
        tool(
            "ftms_read_bike_data",
            "Wait for the next Indoor Bike Data notification and decode it",
            no_params(),
        ),
        tool(
            "ftms_request_control",
            "Request control of the fitness machine",
            no_params(),
        ),
        tool("ftms_reset", "Reset the fitness machine", no_params()),
        tool(
            "ftms_set_power",
            "Set the ERG target power in watts",
            json!({
                "type": "object",
                "properties": {
                    "watts": { "type": "integer" }
                },
                "required": ["watts"]
            }),
        ),
        tool("ftms_start", "Start or resume the workout", no_params()),
        tool(
            "ftms_stop",
            "Stop or pause the workout",
            json!({
                "type": "object",
                "properties": {
                    "pause": { "type": "boolean", "default": false }
                }
            }),
        ),
        tool(
            "ftms_set_simulation",
            "Set indoor bike simulation parameters",
            json!({
                "type": "object",
                "properties": {
                    "wind_speed": { "type": "number", "description": "m/s", "default": 0 },
                    "grade": { "type": "number", "description": "Percent", "default": 0 },
                    "rolling_resistance": { "type": "number", "default": 0.004 },
                    "wind_resistance": { "type": "number", "description": "kg/m", "default": 0.51 }
                }
            }),
        ),
        tool(
            "hr_read",
            "Wait for the next Heart Rate Measurement notification and decode it",
            no_params(),
        ),
        tool(
            "log_start",
            "Record every received value to a CSV file",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"]
            }),
        ),
        tool("log_stop", "Stop recording and report the record count", no_params()),
    ]
}

#[derive(Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct ScanParams {
    duration_seconds: Option<f64>,
    service: Option<String>,
    name_filter: Option<String>,
}

#[derive(Deserialize)]
struct ConnectParams {
    target: String,
}

#[derive(Deserialize)]
struct CharacteristicParams {
    characteristic: String,
}

#[derive(Deserialize)]
struct ServiceParams {
    service: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct WriteParams {
    characteristic: String,
    data: String,
    #[serde(default = "default_true")]
    with_response: bool,
}

#[derive(Deserialize)]
struct SubscribeParams {
    characteristic: String,
    duration_seconds: Option<f64>,
    max_count: Option<usize>,
}

#[derive(Deserialize)]
struct BufferedParams {
    characteristic: String,
    last: Option<usize>,
}

#[derive(Deserialize)]
struct PowerParams {
    watts: i64,
}

#[derive(Deserialize)]
struct StopParams {
    #[serde(default)]
    pause: bool,
}

fn default_rolling_resistance() -> f64 {
    0.004
}

fn default_wind_resistance() -> f64 {
    0.51
}

#[derive(Deserialize)]
struct SimulationParams {
    #[serde(default)]
    wind_speed: f64,
    #[serde(default)]
    grade: f64,
    #[serde(default = "default_rolling_resistance")]
    rolling_resistance: f64,
    #[serde(default = "default_wind_resistance")]
    wind_resistance: f64,
}

#[derive(Deserialize)]
struct LogStartParams {
    path: String,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn seconds(value: Option<f64>, default: Duration) -> Result<Duration, RpcError> {
    match value {
        None => Ok(default),
        Some(secs) => Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|d| *d <= MAX_WAIT)
            .ok_or_else(|| {
                RpcError::invalid_params(format!(
                    "duration must be between 0 and {} seconds, got {}",
                    MAX_WAIT.as_secs(),
                    secs
                ))
            }),
    }
}

fn value_json(characteristic: &Uuid, data: &[u8]) -> Value {
    let mut value = json!({
        "characteristic": uuids::display_uuid(characteristic),
        "hex": protocol::format_hex(data),
        "length": data.len(),
    });
    if let Some(decoded) =
        protocol::decode(characteristic, data).and_then(|d| serde_json::to_value(d).ok())
    {
        value["decoded"] = decoded;
    }
    value
}

fn device_json(device: &DiscoveredDevice) -> Value {
    let manufacturer_data: Map<String, Value> = device
        .advertisement
        .manufacturer_data
        .iter()
        .map(|(company, data)| {
            (
                format!("0x{:04X}", company),
                Value::String(protocol::format_hex(data)),
            )
        })
        .collect();
    json!({
        "identifier": device.identifier,
        "name": device.name,
        "rssi": device.rssi,
        "services": device.services.iter().map(uuids::display_uuid).collect::<Vec<_>>(),
        "manufacturer_data": manufacturer_data,
    })
}

fn characteristic_json(info: &CharacteristicInfo) -> Value {
    json!({
        "uuid": uuids::display_uuid(&info.uuid),
        "name": uuids::known_name(&info.uuid),
        "service": uuids::display_uuid(&info.service),
        "properties": info.properties.names(),
    })
}

fn command_json(command: &str, sent: &[u8]) -> Value {
    json!({ "command": command, "sent": protocol::format_hex(sent) })
}

/// Routes tool calls to the session
#[derive(Clone)]
pub struct Dispatcher {
    service: BluetoothService,
    control: FitnessMachineControl,
    default_scan: Duration,
}

impl Dispatcher {
    pub fn new(service: BluetoothService, default_scan: Duration) -> Self {
        Self {
            control: FitnessMachineControl::new(service.clone()),
            service,
            default_scan,
        }
    }

    pub fn service(&self) -> &BluetoothService {
        &self.service
    }

    /// Handle one method. `tools/call` wraps a tool name and its arguments;
    /// tools may also be called directly by name.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "tools/list" => Ok(json!({ "tools": tool_definitions() })),
            "tools/call" => {
                let call: ToolCall = parse(params)?;
                self.call_tool(&call.name, call.arguments).await
            }
            name => self.call_tool(name, params).await,
        }
    }

    async fn call_tool(&self, name: &str, params: Value) -> Result<Value, RpcError> {
        debug!("Tool call {}", name);
        match name {
            "ble_scan" => self.scan(parse(params)?).await,
            "ble_connect" => self.connect(parse(params)?).await,
            "ble_disconnect" => {
                self.service.disconnect().await?;
                Ok(json!({ "state": self.service.state() }))
            }
            "ble_status" => {
                let status = self.service.status();
                Ok(json!({ "state": status.state, "radio": status.radio }))
            }
            "ble_get_services" => self.services().await,
            "ble_get_characteristics" => {
                let params: ServiceParams = parse(params)?;
                let service = params.service.as_deref().map(uuids::parse_uuid).transpose()?;
                let characteristics = self.service.characteristics(service).await?;
                Ok(json!({
                    "count": characteristics.len(),
                    "characteristics": characteristics.iter().map(characteristic_json).collect::<Vec<_>>(),
                }))
            }
            "ble_device_info" => {
                let info = self.service.device_info().await?;
                serde_json::to_value(info).map_err(|e| RpcError::invalid_request(e.to_string()))
            }
            "ble_read_rssi" => {
                let rssi = self.service.read_rssi().await?;
                Ok(json!({ "rssi": rssi }))
            }
            "ble_read" => {
                let params: CharacteristicParams = parse(params)?;
                let uuid = uuids::parse_uuid(&params.characteristic)?;
                let data = self.service.read(uuid).await?;
                Ok(value_json(&uuid, &data))
            }
            "ble_write" => self.write(parse(params)?).await,
            "ble_subscribe" => self.subscribe(parse(params)?).await,
            "ble_unsubscribe" => {
                let params: CharacteristicParams = parse(params)?;
                let uuid = uuids::parse_uuid(&params.characteristic)?;
                self.service.unsubscribe(uuid).await?;
                Ok(json!({ "characteristic": uuids::display_uuid(&uuid), "subscribed": false }))
            }
            "ble_get_buffered" => self.buffered(parse(params)?).await,
            "ftms_read_features" => {
                let data = self.service.read(uuids::FITNESS_MACHINE_FEATURE).await?;
                let mut result = value_json(&uuids::FITNESS_MACHINE_FEATURE, &data);
                if let Some(features) = FtmsFeatures::parse(&data) {
                    result["supports_power_target"] =
                        Value::Bool(features.supports_target("Power Target"));
                }
                Ok(result)
            }
            "ftms_read_bike_data" => {
                let data = self
                    .service
                    .next_notification(uuids::INDOOR_BIKE_DATA)
                    .await?;
                Ok(value_json(&uuids::INDOOR_BIKE_DATA, &data))
            }
            "ftms_request_control" => {
                let sent = self.control.request_control().await?;
                Ok(command_json("request_control", &sent))
            }
            "ftms_reset" => {
                let sent = self.control.reset().await?;
                Ok(command_json("reset", &sent))
            }
            "ftms_set_power" => {
                let params: PowerParams = parse(params)?;
                let sent = self.control.set_target_power(params.watts).await?;
                let mut result = command_json("set_target_power", &sent);
                result["watts"] = json!(clamp_power(params.watts));
                Ok(result)
            }
            "ftms_start" => {
                let sent = self.control.start().await?;
                Ok(command_json("start", &sent))
            }
            "ftms_stop" => {
                let params: StopParams = parse(params)?;
                if params.pause {
                    let sent = self.control.pause().await?;
                    Ok(command_json("pause", &sent))
                } else {
                    let sent = self.control.stop().await?;
                    Ok(command_json("stop", &sent))
                }
            }
            "ftms_set_simulation" => {
                let params: SimulationParams = parse(params)?;
                let sim = SimulationParameters::from_physical(
                    params.wind_speed,
                    params.grade,
                    params.rolling_resistance,
                    params.wind_resistance,
                );
                let sent = self.control.set_simulation(sim).await?;
                Ok(command_json("set_indoor_bike_simulation", &sent))
            }
            "hr_read" => {
                let data = self
                    .service
                    .next_notification(uuids::HEART_RATE_MEASUREMENT)
                    .await?;
                Ok(value_json(&uuids::HEART_RATE_MEASUREMENT, &data))
            }
            "log_start" => {
                let params: LogStartParams = parse(params)?;
                self.service.start_log(&params.path).await?;
                Ok(json!({ "logging": true, "path": params.path }))
            }
            "log_stop" => match self.service.stop_log().await? {
                Some(summary) => Ok(json!({
                    "logging": false,
                    "path": summary.path.display().to_string(),
                    "records": summary.records,
                })),
                None => Ok(json!({ "logging": false, "records": 0 })),
            },
            other => Err(RpcError::method_not_found(other)),
        }
    }

    async fn scan(&self, params: ScanParams) -> Result<Value, RpcError> {
        let duration = seconds(params.duration_seconds, self.default_scan)?;
        let filter = params
            .service
            .as_deref()
            .map(uuids::parse_uuid)
            .transpose()?;
        let mut devices = self.service.scan(duration, filter).await?;

        if let Some(name) = params.name_filter {
            let needle = name.to_lowercase();
            devices.retain(|d| {
                d.name
                    .as_deref()
                    .map(|n| n.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            });
        }
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        Ok(json!({
            "count": devices.len(),
            "devices": devices.iter().map(device_json).collect::<Vec<_>>(),
        }))
    }

    async fn connect(&self, params: ConnectParams) -> Result<Value, RpcError> {
        let identifier = self.service.connect(&params.target).await?;
        let info = self.service.device_info().await?;
        Ok(json!({
            "connected": identifier,
            "name": info.name,
            "services": info.service_count,
            "characteristics": info.characteristic_count,
        }))
    }

    async fn services(&self) -> Result<Value, RpcError> {
        let services = self.service.services().await?;
        let characteristics = self.service.characteristics(None).await?;
        let services: Vec<Value> = services
            .iter()
            .map(|service| {
                let children: Vec<Value> = characteristics
                    .iter()
                    .filter(|c| c.service == service.uuid)
                    .map(characteristic_json)
                    .collect();
                json!({
                    "uuid": uuids::display_uuid(&service.uuid),
                    "name": uuids::known_name(&service.uuid),
                    "characteristics": children,
                })
            })
            .collect();
        Ok(json!({ "count": services.len(), "services": services }))
    }

    async fn write(&self, params: WriteParams) -> Result<Value, RpcError> {
        let uuid = uuids::parse_uuid(&params.characteristic)?;
        let data = protocol::parse_hex(&params.data)?;
        let mode = WriteMode::from_response_flag(params.with_response);
        self.service.write(uuid, &data, mode).await?;
        Ok(json!({
            "characteristic": uuids::display_uuid(&uuid),
            "written": protocol::format_hex(&data),
            "length": data.len(),
            "with_response": params.with_response,
        }))
    }

    async fn subscribe(&self, params: SubscribeParams) -> Result<Value, RpcError> {
        let uuid = uuids::parse_uuid(&params.characteristic)?;
        let duration = seconds(params.duration_seconds, DEFAULT_SUBSCRIBE_DURATION)?;
        let max_count = params.max_count.unwrap_or(DEFAULT_SUBSCRIBE_COUNT);

        let mut stream = self.service.subscribe(uuid).await?;
        let deadline = Instant::now() + duration;
        let mut values = Vec::new();
        let mut ended = false;
        while values.len() < max_count {
            match timeout_at(deadline, stream.next()).await {
                Ok(Some(value)) => values.push(value_json(&uuid, &value)),
                Ok(None) => {
                    ended = true;
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(json!({
            "characteristic": uuids::display_uuid(&uuid),
            "count": values.len(),
            "values": values,
            "subscribed": !ended,
        }))
    }

    async fn buffered(&self, params: BufferedParams) -> Result<Value, RpcError> {
        let uuid = uuids::parse_uuid(&params.characteristic)?;
        let buffered = self.service.buffered(uuid).await?;
        let skip = params
            .last
            .map(|last| buffered.len().saturating_sub(last))
            .unwrap_or(0);
        let values: Vec<Value> = buffered[skip..]
            .iter()
            .map(|value| value_json(&uuid, value))
            .collect();
        Ok(json!({
            "characteristic": uuids::display_uuid(&uuid),
            "count": values.len(),
            "values": values,
        }))
    }
}
