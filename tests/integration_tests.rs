/*
 * Integration tests for Casterd
 *
 * These tests drive whole interfaces through the manager the way the
 * HTTP layer does, using the offline (none) hardware backends.
 */

use std::sync::Arc;
use std::time::Duration;

use ini::Ini;
use serial_test::serial;
use tempfile::NamedTempFile;

use casterd::caster::{MachineState, OperationMode};
use casterd::config;
use casterd::interface::{Command, InterfaceManager};
use casterd::signals::Combination;
use casterd::translate::Row16Mode;

/// An offline two-interface setup: a caster without its sensor attached
/// and a perforator, sharing nothing.
const OFFLINE_CONFIG: &str = "\
[DEFAULT]
listen_address = 127.0.0.1:0
sensor_driver = none
output_driver = none
startup_timeout = 0.05
sensor_timeout = 0.05
pump_stop_timeout = 0.1
punching_on_time = 0.01
punching_off_time = 0.01
input_bounce_time = 0.001

[Caster]
supported_modes = testing, casting, punching, manual punching

[Perforator]
supported_modes = punching, manual punching
supported_row16_modes = off
";

fn offline_manager() -> InterfaceManager {
    let ini = Ini::load_from_str(OFFLINE_CONFIG).unwrap();
    let cfg = config::parse(&ini).unwrap();
    InterfaceManager::from_config(&cfg).unwrap()
}

fn combos(texts: &[&str]) -> Vec<Combination> {
    texts.iter().map(|t| Combination::parse(t).unwrap()).collect()
}

#[test]
fn test_config_file_round_trip() {
    use std::io::Write;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(OFFLINE_CONFIG.as_bytes()).unwrap();
    file.flush().unwrap();

    let cfg = config::load(file.path()).unwrap();
    assert_eq!(cfg.interfaces.len(), 2);
    let names: Vec<&str> = cfg.interfaces.iter().map(|i| i.name.as_str()).collect();
    assert!(names.contains(&"caster"));
    assert!(names.contains(&"perforator"));
}

#[tokio::test]
#[serial]
async fn test_full_punching_run() {
    let manager = Arc::new(offline_manager());
    let handle = manager.get("perforator").unwrap();

    let snap = handle
        .call(Command::Start {
            mode: OperationMode::Punching,
        })
        .await
        .unwrap();
    assert_eq!(snap.state, MachineState::Ready);

    let snap = handle
        .call(Command::Punch {
            combinations: combos(&["GS2", "A", "NJS 0005"]),
            row16_mode: Row16Mode::Off,
            manual: false,
        })
        .await
        .unwrap();
    assert_eq!(snap.state, MachineState::Ready);
    // the last combination is displayed N-first
    assert_eq!(snap.signals[0], "N");

    let snap = handle.call(Command::Stop).await.unwrap();
    assert_eq!(snap.state, MachineState::Stopped);
    manager.shutdown();
}

#[tokio::test]
#[serial]
async fn test_casting_without_sensor_faults_and_resets() {
    let manager = Arc::new(offline_manager());
    let handle = manager.get("caster").unwrap();

    // starting in casting mode needs rotation; the absent sensor times out
    let err = handle
        .call(Command::Start {
            mode: OperationMode::Casting,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "timeout");
    let status = handle.status();
    assert_eq!(status.state, MachineState::Fault);
    let report = status.last_error.unwrap();
    assert_eq!(report.kind, "timeout");
    assert_eq!(report.during, MachineState::Starting);

    // fault refuses everything until the reset
    let err = handle
        .call(Command::Start {
            mode: OperationMode::Testing,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "faulted");

    let snap = handle.call(Command::Reset).await.unwrap();
    assert_eq!(snap.state, MachineState::Stopped);
    assert!(snap.last_error.is_none());
    manager.shutdown();
}

#[tokio::test]
#[serial]
async fn test_mode_gating_per_interface() {
    let manager = Arc::new(offline_manager());
    let perforator = manager.get("perforator").unwrap();

    // the perforator supports punching only
    let err = perforator
        .call(Command::Start {
            mode: OperationMode::Casting,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unsupported_mode");

    // and only the off row16 mode
    perforator
        .call(Command::Start {
            mode: OperationMode::Punching,
        })
        .await
        .unwrap();
    let err = perforator
        .call(Command::Punch {
            combinations: combos(&["16"]),
            row16_mode: Row16Mode::Hmn,
            manual: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unsupported_row16_mode");
    manager.shutdown();
}

#[tokio::test]
#[serial]
async fn test_interfaces_operate_independently() {
    let manager = Arc::new(offline_manager());
    let caster = manager.get("caster").unwrap();
    let perforator = manager.get("perforator").unwrap();

    caster
        .call(Command::Start {
            mode: OperationMode::Testing,
        })
        .await
        .unwrap();
    perforator
        .call(Command::Start {
            mode: OperationMode::ManualPunching,
        })
        .await
        .unwrap();

    // a fault on one interface leaves the other alone
    let _ = caster
        .call(Command::Cast {
            combinations: combos(&["N"]),
            row16_mode: Row16Mode::Off,
        })
        .await
        .unwrap_err();
    assert_eq!(caster.status().state, MachineState::Fault);
    assert_eq!(perforator.status().state, MachineState::Ready);

    let snap = perforator
        .call(Command::Punch {
            combinations: combos(&["A 1"]),
            row16_mode: Row16Mode::Off,
            manual: true,
        })
        .await
        .unwrap();
    assert_eq!(snap.state, MachineState::Ready);
    manager.shutdown();
}

#[tokio::test]
#[serial]
async fn test_emergency_stop_preempts_a_long_run() {
    let manager = Arc::new(offline_manager());
    let handle = manager.get("perforator").unwrap();

    handle
        .call(Command::Start {
            mode: OperationMode::Punching,
        })
        .await
        .unwrap();

    // several seconds of punching work
    let many: Vec<Combination> = (0..200)
        .map(|_| Combination::parse("A 1").unwrap())
        .collect();
    let punching = handle.call(Command::Punch {
        combinations: many,
        row16_mode: Row16Mode::Off,
        manual: false,
    });

    let stopper = {
        let manager = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            manager.emergency_stop_all();
        })
    };

    let started = std::time::Instant::now();
    let err = punching.await.unwrap_err();
    assert_eq!(err.kind(), "interrupted");
    assert!(started.elapsed() < Duration::from_secs(2));
    stopper.await.unwrap();

    // the queued stop lands after the preempted command
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.status().state, MachineState::Stopped);
    manager.shutdown();
}

#[tokio::test]
#[serial]
async fn test_status_stays_readable_during_a_run() {
    let manager = Arc::new(offline_manager());
    let handle = manager.get("perforator").unwrap();

    handle
        .call(Command::Start {
            mode: OperationMode::Punching,
        })
        .await
        .unwrap();

    let many: Vec<Combination> = (0..20)
        .map(|_| Combination::parse("A 1").unwrap())
        .collect();
    let punching = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let handle = manager.get("perforator").unwrap();
            handle
                .call(Command::Punch {
                    combinations: many,
                    row16_mode: Row16Mode::Off,
                    manual: false,
                })
                .await
        })
    };

    // status reads do not go through the worker queue
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.status().state, MachineState::Punching);

    punching.await.unwrap().unwrap();
    assert_eq!(handle.status().state, MachineState::Ready);
    manager.shutdown();
}
