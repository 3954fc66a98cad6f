use ble_fitness_bridge::domain::models::{ConnectionState, WriteMode};
use ble_fitness_bridge::infrastructure::bluetooth::fake::{FakeHost, HostCall};
use ble_fitness_bridge::infrastructure::bluetooth::protocol::{self, uuids, DecodedValue};
use ble_fitness_bridge::infrastructure::bluetooth::{
    host_event_channel, BluetoothService, FitnessMachineControl, SessionConfig,
};
use ble_fitness_bridge::rpc::{server, tools::Dispatcher};
use ble_fitness_bridge::BleError;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

fn session() -> (Arc<FakeHost>, BluetoothService) {
    let (tx, rx) = host_event_channel();
    let host = Arc::new(FakeHost::fitness_bike(tx));
    let service = BluetoothService::spawn(host.clone(), rx, SessionConfig::default());
    (host, service)
}

#[tokio::test(start_paused = true)]
async fn test_erg_workout() {
    let (host, service) = session();

    let devices = service
        .scan(Duration::from_secs(3), Some(uuids::FITNESS_MACHINE_SERVICE))
        .await
        .unwrap();
    assert_eq!(devices.len(), 1);
    service.connect(&devices[0].identifier).await.unwrap();
    assert_eq!(service.state(), ConnectionState::Connected);

    let control = FitnessMachineControl::new(service.clone());
    control.request_control().await.unwrap();
    control.start().await.unwrap();
    control.set_target_power(200).await.unwrap();

    let mut bike = service.subscribe(uuids::INDOOR_BIKE_DATA).await.unwrap();
    host.emit_value(
        uuids::INDOOR_BIKE_DATA,
        vec![0x44, 0x00, 0x90, 0x03, 0x98, 0x00, 0x64, 0x00],
    );
    let value = bike.next().await.unwrap();
    match protocol::decode(&uuids::INDOOR_BIKE_DATA, &value) {
        Some(DecodedValue::IndoorBike(data)) => {
            assert_eq!(data.instantaneous_power_w, Some(100));
            assert_eq!(data.instantaneous_cadence_rpm, Some(76.0));
        }
        other => panic!("unexpected decode {:?}", other),
    }

    control.stop().await.unwrap();
    service.disconnect().await.unwrap();
    assert_eq!(bike.next().await, None);
    assert_eq!(
        service
            .write(uuids::FITNESS_MACHINE_CONTROL_POINT, &[0x00], WriteMode::WithResponse)
            .await,
        Err(BleError::NotConnected)
    );

    let writes: Vec<Vec<u8>> = host
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            HostCall::Write(_, data, _) => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(
        writes,
        vec![vec![0x00], vec![0x07], vec![0x05, 0xC8, 0x00], vec![0x08, 0x01]]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rpc_round_trip() {
    let (_host, service) = session();
    let dispatcher = Dispatcher::new(service, Duration::from_secs(1));

    let lines = [
        r#"{"jsonrpc":"2.0","id":1,"method":"ble_scan"}"#,
        r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"ble_connect","arguments":{"target":"KICKR"}}}"#,
        r#"{"jsonrpc":"2.0","id":3,"method":"ble_get_services"}"#,
        r#"{"jsonrpc":"2.0","id":4,"method":"ble_disconnect"}"#,
    ];
    let mut responses = Vec::new();
    for line in lines {
        let response = server::handle_line(&dispatcher, line).await.unwrap();
        responses.push(serde_json::from_str::<Value>(&response).unwrap());
    }

    assert_eq!(responses[0]["result"]["count"], 2);
    assert_eq!(responses[1]["result"]["services"], 2);
    let services = responses[2]["result"]["services"].as_array().unwrap();
    assert!(services
        .iter()
        .any(|s| s["uuid"] == "1826" && s["name"] == "Fitness Machine"));
    assert_eq!(responses[3]["result"]["state"], "disconnected");
}
