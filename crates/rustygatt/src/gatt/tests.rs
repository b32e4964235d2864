//! End-to-end GATT scenarios over the mock backend

use std::sync::Arc;
use std::time::Duration;

use crate::config::GattConfig;
use crate::device::{BondState, Device, DeviceAddress};
use crate::error::GattError;
use crate::gatt::client::{Central, ClientSession};
use crate::gatt::constants::{CCCD, CCCD_INDICATE, CCCD_NOTIFY};
use crate::gatt::operation::OperationKind;
use crate::gatt::server::ServerConnectionEvent;
use crate::gatt::state::LinkState;
use crate::gatt::status::{ConnectionStatus, GattStatus};
use crate::gatt::tree::{Characteristic, CharacteristicConfig, GattTree, ServiceConfig};
use crate::gatt::types::{CharacteristicProperty, Permission, Phy, PhyOption, PhyPair, WriteType};
use crate::transport::mock::{MockNetwork, MockPeripheral};
use crate::uuid::Uuid;

const HEART_RATE: Uuid = Uuid::from_u16(0x180D);
const HR_MEASUREMENT: Uuid = Uuid::from_u16(0x2A37);
const BODY_SENSOR_LOCATION: Uuid = Uuid::from_u16(0x2A38);
const CONTROL_POINT: Uuid = Uuid::from_u16(0x2A39);

const CUSTOM: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
const FIELD_A: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
const FIELD_B: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);
const ALERT: Uuid = Uuid::from_u128(0x0000fff3_0000_1000_8000_00805f9b34fb);
const SECRET: Uuid = Uuid::from_u128(0x0000fff4_0000_1000_8000_00805f9b34fb);

fn services() -> Vec<ServiceConfig> {
    let read_write = CharacteristicProperty::READ | CharacteristicProperty::WRITE;
    vec![
        ServiceConfig::primary(
            HEART_RATE,
            vec![
                CharacteristicConfig::new(
                    HR_MEASUREMENT,
                    CharacteristicProperty::NOTIFY,
                    Permission::empty(),
                ),
                CharacteristicConfig::new(
                    BODY_SENSOR_LOCATION,
                    CharacteristicProperty::READ,
                    Permission::READ,
                )
                .with_initial_value(vec![0x01]),
                CharacteristicConfig::new(
                    CONTROL_POINT,
                    read_write | CharacteristicProperty::WRITE_WITHOUT_RESPONSE,
                    Permission::read_write(),
                ),
            ],
        ),
        ServiceConfig::primary(
            CUSTOM,
            vec![
                CharacteristicConfig::new(FIELD_A, read_write, Permission::read_write())
                    .with_initial_value(vec![0xAA]),
                CharacteristicConfig::new(FIELD_B, read_write, Permission::read_write())
                    .with_initial_value(vec![0xBB]),
                CharacteristicConfig::new(ALERT, CharacteristicProperty::INDICATE, Permission::empty()),
                CharacteristicConfig::new(SECRET, CharacteristicProperty::READ, Permission::empty())
                    .with_initial_value(vec![0x42]),
            ],
        ),
    ]
}

fn device(last: u8, name: &str) -> Device {
    Device::new(DeviceAddress::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, last])).with_name(name)
}

fn config() -> GattConfig {
    GattConfig::new()
        .with_operation_timeout(Duration::from_secs(5))
        .with_connect_timeout(Duration::from_secs(2))
}

/// A central network with one peripheral in range
fn setup() -> (MockNetwork, Arc<MockPeripheral>) {
    let network = MockNetwork::new(device(0x01, "central"));
    let peripheral = Arc::new(MockPeripheral::new(device(0x10, "serverDevice"), &services(), config()).unwrap());
    network.add_peripheral(peripheral.clone());
    (network, peripheral)
}

async fn connect(network: &MockNetwork, peripheral: &MockPeripheral) -> ClientSession {
    ClientSession::connect(peripheral.device().clone(), network, config())
        .await
        .unwrap()
}

fn characteristic(tree: &GattTree, service: Uuid, uuid: Uuid) -> Characteristic {
    tree.service(service)
        .unwrap()
        .characteristic(uuid)
        .unwrap()
        .clone()
}

/// Lets spawned tasks drain their channels
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_connect_and_discover() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    assert!(session.is_connected());
    assert_eq!(session.snapshot().status, ConnectionStatus::Success);

    let tree = session.discover_services().await.unwrap();
    assert_eq!(tree.services().len(), 2);
    let hr = characteristic(&tree, HEART_RATE, HR_MEASUREMENT);
    assert!(hr.cccd().is_some());
    // Permissions are a server-side notion
    assert!(hr.permissions.is_empty());

    settle().await;
    let connected = peripheral.server().connected_devices();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].address, network.local().address);
}

#[tokio::test]
async fn test_concurrent_rssi_on_two_peripherals() {
    let (network, first) = setup();
    let second = Arc::new(MockPeripheral::new(device(0x11, "serverDevice2"), &services(), config()).unwrap());
    network.add_peripheral(second.clone());

    let a = connect(&network, &first).await;
    let b = connect(&network, &second).await;

    let (rssi_a, rssi_b) = tokio::join!(a.read_rssi(), b.read_rssi());
    let rssi_a = rssi_a.unwrap();
    let rssi_b = rssi_b.unwrap();
    assert!((-60..=-50).contains(&rssi_a));
    assert!((-60..=-50).contains(&rssi_b));
}

#[tokio::test]
async fn test_operations_on_one_connection_complete_in_call_order() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let field = characteristic(&tree, CUSTOM, FIELD_A);
    let mut changes = peripheral.server().value_events();

    let (first, second, third) = tokio::join!(
        session.write_characteristic(&field, &[1], WriteType::WithResponse),
        session.write_characteristic(&field, &[2], WriteType::WithResponse),
        session.write_characteristic(&field, &[3], WriteType::WithResponse),
    );
    first.unwrap();
    second.unwrap();
    third.unwrap();

    for expected in 1..=3u8 {
        let changed = changes.recv().await.unwrap();
        assert_eq!(changed.handle, field.handle);
        assert_eq!(changed.value, vec![expected]);
    }
    assert_eq!(peripheral.server().value(field.handle).unwrap(), vec![3]);
}

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let field = characteristic(&tree, CUSTOM, FIELD_B);

    assert_eq!(session.read_characteristic(&field).await.unwrap(), vec![0xBB]);
    session
        .write_characteristic(&field, &[0x10, 0x20, 0x30], WriteType::WithResponse)
        .await
        .unwrap();
    assert_eq!(
        session.read_characteristic(&field).await.unwrap(),
        vec![0x10, 0x20, 0x30]
    );
    // The read value is cached on the client tree
    assert_eq!(tree.value(field.handle).unwrap(), vec![0x10, 0x20, 0x30]);
}

#[tokio::test]
async fn test_write_without_response_lands_on_server() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let control = characteristic(&tree, HEART_RATE, CONTROL_POINT);
    let mut changes = peripheral.server().value_events();

    session
        .write_characteristic(&control, &[0x01], WriteType::WithoutResponse)
        .await
        .unwrap();
    let changed = changes.recv().await.unwrap();
    assert_eq!(changed.value, vec![0x01]);
    assert_eq!(changed.device.address, network.local().address);

    let too_long = vec![0u8; 21];
    let result = session
        .write_characteristic(&control, &too_long, WriteType::WithoutResponse)
        .await;
    assert!(matches!(result, Err(GattError::NotPermitted(_))));
}

#[tokio::test]
async fn test_failure_goes_to_its_caller_only() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let secret = characteristic(&tree, CUSTOM, SECRET);
    let location = characteristic(&tree, HEART_RATE, BODY_SENSOR_LOCATION);

    let (denied, allowed) = tokio::join!(
        session.read_characteristic(&secret),
        session.read_characteristic(&location),
    );
    match denied {
        Err(GattError::PlatformStatus { kind, status }) => {
            assert_eq!(kind, OperationKind::ReadCharacteristic);
            assert_eq!(status, GattStatus::ReadNotPermitted);
        }
        other => panic!("expected ReadNotPermitted, got {:?}", other),
    }
    assert_eq!(allowed.unwrap(), vec![0x01]);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_discovery_is_idempotent_and_keeps_subscriptions() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let first = session.discover_services().await.unwrap();
    let hr = characteristic(&first, HEART_RATE, HR_MEASUREMENT);
    let _values = session.subscribe(&hr).await.unwrap();

    let second = session.discover_services().await.unwrap();
    assert_eq!(first.services(), second.services());
    assert!(session.is_subscribed(&hr));

    // Subscribing again opens a stream without another CCCD write
    let _more = session.subscribe(&hr).await.unwrap();
    assert!(session.is_subscribed(&hr));
    assert!(peripheral
        .server()
        .subscription(&network.local().address, hr.handle)
        .notify);
}

#[tokio::test]
async fn test_requests_before_discovery_are_not_ready() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let remote = GattTree::build(&services()).unwrap();
    let field = characteristic(&remote, CUSTOM, FIELD_A);

    assert!(matches!(session.tree(), Err(GattError::NotReady)));
    assert!(matches!(
        session.read_characteristic(&field).await,
        Err(GattError::NotReady)
    ));
    assert!(matches!(
        session.subscribe(&field).await,
        Err(GattError::NotReady)
    ));
}

#[tokio::test]
async fn test_requests_before_link_is_up_are_not_ready() {
    let (network, peripheral) = setup();
    let session = ClientSession::open(peripheral.device().clone(), &network, config())
        .await
        .unwrap();
    assert_eq!(session.snapshot().state, LinkState::Connecting);

    assert!(matches!(session.read_rssi().await, Err(GattError::NotReady)));
    assert!(matches!(
        session.discover_services().await,
        Err(GattError::NotReady)
    ));

    session.wait_until_connected().await.unwrap();
    assert!((-60..=-50).contains(&session.read_rssi().await.unwrap()));
}

#[tokio::test]
async fn test_notify_delivers_exactly_one_value() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let hr = characteristic(&tree, HEART_RATE, HR_MEASUREMENT);
    let mut values = session.subscribe(&hr).await.unwrap();

    let report = peripheral
        .server()
        .set_value_and_notify(hr.handle, &[0x01])
        .await
        .unwrap();
    assert_eq!(report.notified, vec![network.local().address]);
    assert!(report.failed.is_empty());

    assert_eq!(values.recv().await, Some(vec![0x01]));
    let extra = tokio::time::timeout(Duration::from_millis(50), values.recv()).await;
    assert!(extra.is_err());
    assert_eq!(tree.value(hr.handle).unwrap(), vec![0x01]);
}

#[tokio::test]
async fn test_indication_waits_for_confirmation() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let alert = characteristic(&tree, CUSTOM, ALERT);
    let mut values = session.subscribe(&alert).await.unwrap();

    let cccd = alert.cccd().unwrap();
    assert_eq!(cccd.uuid, CCCD);
    assert_eq!(
        session.read_descriptor(cccd).await.unwrap(),
        CCCD_INDICATE.to_vec()
    );

    let report = peripheral
        .server()
        .set_value_and_notify(alert.handle, &[0x07])
        .await
        .unwrap();
    assert_eq!(report.indicated, vec![network.local().address]);
    assert!(report.notified.is_empty());
    assert_eq!(values.recv().await, Some(vec![0x07]));
}

#[tokio::test]
async fn test_subscriptions_are_per_connection() {
    let (network, peripheral) = setup();
    let other = network.as_central(device(0x02, "other central"));

    let subscriber = connect(&network, &peripheral).await;
    let bystander = connect(&other, &peripheral).await;
    let tree = subscriber.discover_services().await.unwrap();
    bystander.discover_services().await.unwrap();
    let hr = characteristic(&tree, HEART_RATE, HR_MEASUREMENT);
    let _values = subscriber.subscribe(&hr).await.unwrap();

    let server = peripheral.server();
    assert!(server.subscription(&network.local().address, hr.handle).notify);
    assert!(!server.subscription(&other.local().address, hr.handle).is_enabled());

    // A CCCD read reflects the reader's own subscription
    let cccd = hr.cccd().unwrap();
    assert_eq!(
        subscriber.read_descriptor(cccd).await.unwrap(),
        CCCD_NOTIFY.to_vec()
    );
    assert_eq!(bystander.read_descriptor(cccd).await.unwrap(), vec![0, 0]);

    let report = server.set_value_and_notify(hr.handle, &[0x3C]).await.unwrap();
    assert_eq!(report.delivered(), 1);
}

#[tokio::test]
async fn test_reliable_write_abort_leaves_values_untouched() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let a = characteristic(&tree, CUSTOM, FIELD_A);
    let b = characteristic(&tree, CUSTOM, FIELD_B);
    let server = peripheral.server();

    session.begin_reliable_write().await.unwrap();
    session
        .write_characteristic(&a, &[0x01], WriteType::WithResponse)
        .await
        .unwrap();
    session
        .write_characteristic(&b, &[0x02], WriteType::WithResponse)
        .await
        .unwrap();
    assert!(server.has_open_transaction(&network.local().address));
    assert_eq!(server.value(a.handle).unwrap(), vec![0xAA]);

    session.abort_reliable_write().await.unwrap();
    // Round trip so the abort has reached the server
    session.read_rssi().await.unwrap();
    settle().await;
    assert!(!server.has_open_transaction(&network.local().address));
    assert_eq!(server.value(a.handle).unwrap(), vec![0xAA]);
    assert_eq!(server.value(b.handle).unwrap(), vec![0xBB]);
}

#[tokio::test]
async fn test_reliable_write_execute_applies_all_values() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let a = characteristic(&tree, CUSTOM, FIELD_A);
    let b = characteristic(&tree, CUSTOM, FIELD_B);
    let server = peripheral.server();
    let mut changes = server.value_events();

    session.begin_reliable_write().await.unwrap();
    session
        .write_characteristic(&a, &[0x01], WriteType::WithResponse)
        .await
        .unwrap();
    session
        .write_characteristic(&b, &[0x02], WriteType::WithResponse)
        .await
        .unwrap();
    session.execute_reliable_write().await.unwrap();

    assert_eq!(server.value(a.handle).unwrap(), vec![0x01]);
    assert_eq!(server.value(b.handle).unwrap(), vec![0x02]);
    let mut changed = vec![
        changes.recv().await.unwrap().handle,
        changes.recv().await.unwrap().handle,
    ];
    changed.sort();
    assert_eq!(changed, vec![a.handle, b.handle]);
}

#[tokio::test]
async fn test_reliable_write_last_write_to_a_characteristic_wins() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let a = characteristic(&tree, CUSTOM, FIELD_A);
    let server = peripheral.server();

    session.begin_reliable_write().await.unwrap();
    session
        .write_characteristic(&a, &[0x01, 0x02], WriteType::WithResponse)
        .await
        .unwrap();
    session
        .write_characteristic(&a, &[0x03], WriteType::WithResponse)
        .await
        .unwrap();
    assert_eq!(server.value(a.handle).unwrap(), vec![0xAA]);

    session.execute_reliable_write().await.unwrap();
    assert_eq!(server.value(a.handle).unwrap(), vec![0x03]);
}

#[tokio::test]
async fn test_link_loss_cancels_open_server_transaction() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let a = characteristic(&tree, CUSTOM, FIELD_A);
    let server = peripheral.server();
    let central = network.local().address;

    session.begin_reliable_write().await.unwrap();
    session
        .write_characteristic(&a, &[0x01], WriteType::WithResponse)
        .await
        .unwrap();
    assert!(server.has_open_transaction(&central));

    peripheral.drop_link(&central);
    session
        .connection_state()
        .wait_for(|s| s.state.is_terminal())
        .await
        .unwrap();

    let again = connect(&network, &peripheral).await;
    settle().await;
    assert!(again.is_connected());
    assert!(!server.has_open_transaction(&central));
    assert_eq!(server.value(a.handle).unwrap(), vec![0xAA]);
    // The new connection starts without a transaction
    assert!(matches!(
        again.execute_reliable_write().await,
        Err(GattError::NoOpenTransaction)
    ));
}

#[tokio::test]
async fn test_reliable_write_misuse() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;

    assert!(matches!(
        session.execute_reliable_write().await,
        Err(GattError::NoOpenTransaction)
    ));
    assert!(matches!(
        session.abort_reliable_write().await,
        Err(GattError::NoOpenTransaction)
    ));
    session.begin_reliable_write().await.unwrap();
    assert!(matches!(
        session.begin_reliable_write().await,
        Err(GattError::TransactionAlreadyOpen)
    ));
    // Nothing prepared: executing is a no-op
    session.execute_reliable_write().await.unwrap();

    settle().await;
    let server = peripheral.server();
    let central = network.local().address;
    server.begin_reliable_write(&central).unwrap();
    assert!(matches!(
        server.begin_reliable_write(&central),
        Err(GattError::TransactionAlreadyOpen)
    ));
    server.cancel_reliable_write(&central).unwrap();
    assert!(matches!(
        server.execute_reliable_write(&central),
        Err(GattError::NoOpenTransaction)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_lost_callback_times_out_without_killing_session() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;

    peripheral.drop_next_callback();
    match session.read_rssi().await {
        Err(GattError::OperationTimeout { kind }) => assert_eq!(kind, OperationKind::ReadRssi),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(session.is_connected());
    assert!(session.read_rssi().await.is_ok());
}

#[tokio::test]
async fn test_link_loss_fails_every_queued_operation() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let mut state = session.connection_state();

    peripheral.drop_next_callback();
    let stuck = tokio::spawn({
        let session = session.clone();
        async move { session.read_rssi().await }
    });
    let queued = tokio::spawn({
        let session = session.clone();
        async move { session.read_phy().await }
    });
    settle().await;

    peripheral.drop_link(&network.local().address);
    assert!(matches!(stuck.await.unwrap(), Err(GattError::ConnectionLost)));
    assert!(matches!(queued.await.unwrap(), Err(GattError::ConnectionLost)));

    let snapshot = *state
        .wait_for(|s| s.state.is_terminal())
        .await
        .unwrap();
    assert_eq!(snapshot.state, LinkState::Disconnected);
    assert_eq!(snapshot.status, ConnectionStatus::LinkLoss);
    assert!(!snapshot.status.is_clean());
    assert!(matches!(
        session.read_rssi().await,
        Err(GattError::ConnectionLost)
    ));
}

#[tokio::test]
async fn test_clean_disconnect() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    settle().await;
    let mut events = peripheral.server().connection_events();

    session.disconnect().await.unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, LinkState::Disconnected);
    assert!(snapshot.status.is_clean());
    assert!(!peripheral.is_connected(&network.local().address));

    match events.recv().await.unwrap() {
        ServerConnectionEvent::DeviceDisconnected { device, .. } => {
            assert_eq!(device.address, network.local().address)
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_link_parameters() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;

    assert_eq!(session.request_mtu(600).await.unwrap(), 517);
    assert_eq!(session.params().mtu, 517);
    assert_eq!(session.params().max_payload(), 514);

    let phy = session
        .set_preferred_phy(Phy::Le2M, Phy::Le2M, PhyOption::NoPreferred)
        .await
        .unwrap();
    assert_eq!(phy, PhyPair { tx: Phy::Le2M, rx: Phy::Le2M });
    assert_eq!(session.read_phy().await.unwrap(), phy);
    assert_eq!(session.params().phy, phy);

    settle().await;
    let central = network.local().address;
    assert_eq!(peripheral.server().mtu(&central), Some(517));
    assert_eq!(peripheral.server().phy(&central), Some(phy));
}

#[tokio::test]
async fn test_service_changed_requires_rediscovery() {
    let (network, peripheral) = setup();
    let session = connect(&network, &peripheral).await;
    let tree = session.discover_services().await.unwrap();
    let hr = characteristic(&tree, HEART_RATE, HR_MEASUREMENT);
    let _values = session.subscribe(&hr).await.unwrap();

    peripheral.signal_service_changed();
    peripheral.set_bond_state(&network.local().address, BondState::Bonded);
    // Events on one connection are handled in order
    session.read_rssi().await.unwrap();

    assert!(matches!(session.tree(), Err(GattError::NotReady)));
    assert!(!session.is_subscribed(&hr));
    assert_eq!(session.device().bond_state, BondState::Bonded);
    let rediscovered = session.discover_services().await.unwrap();
    assert_eq!(rediscovered.services(), tree.services());
}

#[tokio::test]
async fn test_reentrant_connect_reuses_session() {
    let (network, peripheral) = setup();
    let central = Central::new(Arc::new(network.clone()), config());
    let target = peripheral.device().clone();

    let (first, second) = tokio::join!(central.connect(&target), central.connect(&target));
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(first.is_connected());
    assert!(second.is_connected());

    settle().await;
    assert_eq!(peripheral.server().connected_devices().len(), 1);
    assert!(central.session(&target.address).await.is_some());

    central.disconnect_all().await;
    assert!(central.session(&target.address).await.is_none());
    assert_eq!(first.snapshot().state, LinkState::Closed);
}

#[tokio::test]
async fn test_connect_to_absent_peripheral_fails() {
    let (network, _peripheral) = setup();
    let missing = device(0x99, "nowhere");
    let result = ClientSession::connect(missing, &network, config()).await;
    assert!(matches!(result, Err(GattError::Transport(_))));
}
