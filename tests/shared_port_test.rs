//! Integration tests for port sharing between drivers
//!
//! Several supplies on one serial line share a single open port; drivers that need a port of
//! their own are refused while anyone else holds it.

use psu_bench::error::BenchError;
use psu_bench::hardware::mock::MockOpener;
use psu_bench::hardware::{ConnectionRegistry, PortSettings};
use psu_bench::instrument::{build_driver, DeviceDescriptor, DeviceFamily};
use std::sync::Arc;
use std::time::Duration;

fn registry(opener: &MockOpener) -> ConnectionRegistry {
    ConnectionRegistry::with_opener(Arc::new(opener.clone())).with_settle_delay(Duration::ZERO)
}

fn port(name: &str) -> PortSettings {
    PortSettings::new(name, 9600, Duration::from_millis(20))
}

fn descriptor(label: &str, family: DeviceFamily, port_name: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(label, family, port(port_name)).with_command_delay(Duration::ZERO)
}

#[tokio::test]
async fn test_two_addressable_drivers_share_one_open() {
    let opener = MockOpener::new();
    opener.respond("COM1", "MDL?", "Z36-6\r\n");
    let registry = registry(&opener);

    let first = build_driver(
        descriptor("Zup (1)", DeviceFamily::ZupSupply, "COM1").with_address(1),
        &registry,
    )
    .await
    .expect("first driver");
    let second = build_driver(
        descriptor("Zup (2)", DeviceFamily::ZupSupply, "COM1").with_address(2),
        &registry,
    )
    .await
    .expect("second driver");

    assert_eq!(opener.open_count("COM1"), 1);
    assert_eq!(registry.ref_count("COM1"), 2);

    drop(first);
    assert!(registry.is_open("COM1"));
    assert!(!opener.is_closed("COM1"));

    drop(second);
    assert!(!registry.is_open("COM1"));
    assert!(opener.is_closed("COM1"));
}

#[tokio::test]
async fn test_direct_driver_refused_on_shared_port() {
    let opener = MockOpener::new();
    let registry = registry(&opener);

    let _zup = build_driver(
        descriptor("Zup (1)", DeviceFamily::ZupSupply, "COM1").with_address(1),
        &registry,
    )
    .await
    .expect("zup driver");

    let genesys = build_driver(
        descriptor("Genesys", DeviceFamily::GenesysSupply, "COM1"),
        &registry,
    )
    .await;
    assert!(matches!(genesys, Err(BenchError::PortUnavailable { .. })));
    assert_eq!(registry.ref_count("COM1"), 1);
}

#[tokio::test]
async fn test_failed_open_leaves_no_entry() {
    let opener = MockOpener::new();
    opener.fail_port("COM8");
    let registry = registry(&opener);

    let result = build_driver(descriptor("N3300", DeviceFamily::N3300Supply, "COM8"), &registry).await;
    assert!(matches!(result, Err(BenchError::PortUnavailable { .. })));
    assert!(registry.open_ports().is_empty());
}

#[tokio::test]
async fn test_address_switching_on_shared_line() {
    let opener = MockOpener::new();
    opener.respond("COM1", "MDL?", "Z36-6\r\n");
    let registry = registry(&opener);

    let mut first = build_driver(
        descriptor("Zup (1)", DeviceFamily::ZupSupply, "COM1").with_address(1),
        &registry,
    )
    .await
    .unwrap();
    let mut second = build_driver(
        descriptor("Zup (2)", DeviceFamily::ZupSupply, "COM1").with_address(2),
        &registry,
    )
    .await
    .unwrap();
    opener.clear_written("COM1");

    first.write("VOL 5").await.unwrap();
    second.write("VOL 6").await.unwrap();
    second.write("CUR 1").await.unwrap();
    assert_eq!(first.query("MDL?").await.unwrap(), "Z36-6");

    assert_eq!(
        opener.written_text("COM1"),
        vec![":ADR01;", ":VOL5;", ":ADR02;", ":VOL6;", ":CUR1;", ":ADR01;", ":MDL?;"]
    );
}

#[tokio::test]
async fn test_binary_device_round_trip() {
    let opener = MockOpener::new();
    opener.respond("COM5", [5u8], "V=12.00;");
    let registry = registry(&opener);

    let mut tester = build_driver(descriptor("Test", DeviceFamily::BinaryTester, "COM5"), &registry)
        .await
        .unwrap();
    assert!(!tester.is_connected());
    opener.clear_written("COM5");

    assert_eq!(tester.query("5?").await.unwrap(), "V=12.00;");
    assert_eq!(opener.written("COM5"), vec![vec![5u8]]);
}
