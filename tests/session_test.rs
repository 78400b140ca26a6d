//! End-to-end session tests: CSV tables in, report out, mock ports underneath.

use psu_bench::config::{DeviceTable, SerialConfig, StepTable};
use psu_bench::hardware::mock::MockOpener;
use psu_bench::hardware::ConnectionRegistry;
use psu_bench::report::{ReportFile, SessionReport};
use psu_bench::session::{SessionState, SlotStatus, StepOutcome, TestSession};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, NamedTempFile};

fn serial() -> SerialConfig {
    SerialConfig {
        timeout_ms: 20,
        command_delay_ms: 0,
        settle_delay_ms: 0,
        ..SerialConfig::default()
    }
}

fn csv_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn session_from(opener: &MockOpener, devices: &str, steps: &str) -> TestSession {
    let devices = DeviceTable::load(csv_file(devices).path()).unwrap();
    let steps = StepTable::load(csv_file(steps).path()).unwrap();
    let registry =
        ConnectionRegistry::with_opener(Arc::new(opener.clone())).with_settle_delay(Duration::ZERO);
    TestSession::new(registry, serial(), devices.rows().to_vec(), steps.into_steps())
}

#[tokio::test]
async fn test_single_zup_step_end_to_end() {
    let opener = MockOpener::new();
    opener.respond("COM1", "MDL?", "Z36-6\r\n");
    let mut session = session_from(
        &opener,
        "Device,COM,Address\nTDK-Lambda Zup,1,1\n",
        "Step,Zup\n1,OUT1;MDL?\n",
    );

    session.check_connections().await;
    assert!(session.all_connected());
    opener.clear_written("COM1");

    let StepOutcome::Completed(result) = session.run_step(0).await.unwrap() else {
        panic!("step should run");
    };

    // The unit is still selected from the probe, so no select frame goes out.
    assert_eq!(opener.written_text("COM1"), vec![":OUT1;", ":MDL?;"]);
    let responses = result.device("TDK-Lambda Zup").expect("zup responses");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses.get("MDL?"), Some("Z36-6"));
}

#[tokio::test]
async fn test_blocked_session_sends_nothing() {
    let opener = MockOpener::new();
    opener.respond("COM1", "MDL?", "Z36-6\r\n");
    let mut session = session_from(
        &opener,
        "Device,COM,Address\nTDK-Lambda Zup (1),1,1\nTDK-Lambda Genesys,3,\n",
        "Step,Zup,Genesys\n1,OUT 1,OUT 1\n",
    );

    let slots = session.check_connections().await.to_vec();
    assert_eq!(slots[0].status, SlotStatus::Connected);
    assert_eq!(slots[1].status, SlotStatus::Unreachable);
    opener.clear_written("COM1");
    opener.clear_written("COM3");

    assert_eq!(session.run_step(0).await.unwrap(), StepOutcome::Blocked);
    assert!(opener.written("COM1").is_empty());
    assert!(opener.written("COM3").is_empty());
    assert_eq!(session.state(), SessionState::DevicesChecked);
}

#[tokio::test]
async fn test_full_bench_run_all_with_report() {
    let opener = MockOpener::new();
    opener.respond("COM1", "MDL?", "Z36-6\r\n");
    opener.respond("COM1", "VOL?", "5.000\r\n");
    opener.respond("COM3", "*IDN?", "TDK-LAMBDA,GEN60-12\r\n");
    opener.respond("COM3", "MEAS:CURR?", "1.25\r\n");
    opener.respond("COM5", [0u8], "READY-01");
    opener.respond("COM5", [3u8], "V=05.00;");

    let mut session = session_from(
        &opener,
        "Device,COM,Address\n\
         TDK-Lambda Zup (1),1,1\n\
         TDK-Lambda Zup (2),1,2\n\
         TDK-Lambda Genesys,3,\n\
         Test,5,\n",
        "Step,Zup (1),Zup (2),Genesys,Test\n\
         1,OUT 1;VOL 5,OUT 1,OUT 1,\n\
         2,VOL?,,MEAS:CURR?,3?\n\
         3,OUT 0,OUT 0,OUT 0,\n",
    );

    session.check_connections().await;
    assert!(session.all_connected());

    let dir = tempdir().unwrap();
    let mut file = ReportFile::create(dir.path()).unwrap();
    let mut report = SessionReport::new(session.slots().to_vec());

    let summary = session.run_all().await;
    assert!(summary.is_success());
    assert_eq!(summary.completed.len(), 3);
    assert!(summary.completed[0].is_empty());
    assert!(summary.completed[2].is_empty());

    let second = &summary.completed[1];
    assert_eq!(
        second.device("TDK-Lambda Zup (1)").and_then(|r| r.get("VOL?")),
        Some("5.000")
    );
    assert_eq!(
        second.device("TDK-Lambda Genesys").and_then(|r| r.get("MEAS:CURR?")),
        Some("1.25")
    );
    assert_eq!(
        second.device("Test").and_then(|r| r.get("3?")),
        Some("V=05.00;")
    );
    assert!(second.device("TDK-Lambda Zup (2)").is_none());

    for result in &summary.completed {
        file.append(result).unwrap();
    }
    report.extend_from(summary);

    let path = file.finish().unwrap().expect("report kept");
    let text = std::fs::read_to_string(path).unwrap();
    assert!(text.contains("---------- Test #2 ----------\nTDK-Lambda Zup (1):\n\tVOL?: 5.000\n"));
    assert!(report.to_json().unwrap().contains("MEAS:CURR?"));
}

#[tokio::test]
async fn test_reassign_then_recheck_uses_new_port() {
    let opener = MockOpener::new();
    opener.respond("COM4", "*IDN?", "N3300A\r\n");
    let mut table =
        DeviceTable::from_reader("Device,COM,Address\nAgilent N3300,2,1\n".as_bytes()).unwrap();
    let registry =
        ConnectionRegistry::with_opener(Arc::new(opener.clone())).with_settle_delay(Duration::ZERO);
    let mut session = TestSession::new(registry, serial(), table.rows().to_vec(), Vec::new());

    session.check_connections().await;
    assert!(!session.all_connected());

    table
        .reassign(&[psu_bench::config::Assignment::new(0, "4", "1")])
        .unwrap();
    session.set_layout(table.rows().to_vec());
    assert_eq!(session.state(), SessionState::Idle);
    assert!(opener.is_closed("COM2"));

    session.check_connections().await;
    assert!(session.all_connected());
}
