//! Loading real TOML files from disk.
#![allow(clippy::unwrap_used)]

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::ExposeSecret;
use sunpoll_config::{ConfigError, load_config_from, to_coordinator_config};
use sunpoll_core::{DeviceRole, LocalLink};

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

const FULL: &str = r#"
[defaults]
cloud_interval = 120
local_interval = 5
read_timeout = 3

[defaults.backoff]
max_secs = 30

[cloud]
base_url = "https://monitor.test/WManage"
username = "owner"
password = "hunter2"

[[devices]]
serial = "4512670118"
name = "Garage"
group = 1
cloud = true
modbus_tcp = { host = "192.168.1.40" }

[[devices]]
serial = "4512670119"
modbus_serial = { path = "/dev/ttyUSB0", unit_id = 2 }

[[devices]]
serial = "5212000001"
kind = "grid_controller"
dongle = { host = "192.168.1.41", datalogger = "BA32401949" }
"#;

#[test]
fn full_file_builds_coordinator_config() {
    let file = write_config(FULL);
    let cfg = load_config_from(file.path()).unwrap();
    let coordinator = to_coordinator_config(&cfg).unwrap();

    assert_eq!(coordinator.intervals.cloud, Duration::from_secs(120));
    assert_eq!(coordinator.intervals.local, Duration::from_secs(5));
    assert_eq!(coordinator.read_timeout, Duration::from_secs(3));
    assert_eq!(coordinator.backoff.max_delay, Duration::from_secs(30));
    assert_eq!(coordinator.backoff.base, Duration::from_secs(1));

    let cloud = coordinator.cloud.as_ref().unwrap();
    assert_eq!(cloud.username, "owner");
    assert_eq!(cloud.password.expose_secret(), "hunter2");

    assert_eq!(coordinator.devices.len(), 3);
    let garage = &coordinator.devices[0];
    assert_eq!(garage.display_name(), "Garage");
    assert_eq!(garage.group, Some(1));
    assert!(garage.cloud);
    assert_eq!(
        garage.local,
        Some(LocalLink::ModbusTcp {
            host: "192.168.1.40".into(),
            port: 502,
            unit_id: 1,
        })
    );

    assert_eq!(
        coordinator.devices[1].local,
        Some(LocalLink::ModbusSerial {
            path: PathBuf::from("/dev/ttyUSB0"),
            baud_rate: 19_200,
            unit_id: 2,
        })
    );

    let controller = &coordinator.devices[2];
    assert_eq!(controller.role, DeviceRole::GridController);
    assert_eq!(
        controller.local,
        Some(LocalLink::Dongle {
            host: "192.168.1.41".into(),
            port: 8000,
            datalogger: "BA32401949".into(),
        })
    );
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();
    assert!(cfg.devices.is_empty());
    assert!(cfg.cloud.is_none());
    assert_eq!(cfg.defaults.local_interval, 10);
}

#[test]
fn two_local_links_are_rejected() {
    let file = write_config(
        r#"
[[devices]]
serial = "4512670118"
modbus_tcp = { host = "192.168.1.40" }
dongle = { host = "192.168.1.40", datalogger = "BA32401949" }
"#,
    );
    let cfg = load_config_from(file.path()).unwrap();
    let err = to_coordinator_config(&cfg).unwrap_err();
    match err {
        ConfigError::Validation { field, .. } => assert_eq!(field, "devices[0].local"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn cloud_device_without_account_is_rejected() {
    let file = write_config(
        r#"
[[devices]]
serial = "4512670118"
cloud = true
"#,
    );
    let cfg = load_config_from(file.path()).unwrap();
    let err = to_coordinator_config(&cfg).unwrap_err();
    assert!(err.to_string().contains("devices[0].cloud"), "{err}");
}

#[test]
fn duplicate_serials_are_rejected() {
    let file = write_config(
        r#"
[[devices]]
serial = "4512670118"
modbus_tcp = { host = "192.168.1.40" }

[[devices]]
serial = "4512670118"
modbus_tcp = { host = "192.168.1.41" }
"#,
    );
    let cfg = load_config_from(file.path()).unwrap();
    let err = to_coordinator_config(&cfg).unwrap_err();
    assert!(err.to_string().contains("duplicate serial"), "{err}");
}

#[test]
fn unknown_device_kind_fails_to_load() {
    let file = write_config(
        r#"
[[devices]]
serial = "4512670118"
kind = "toaster"
"#,
    );
    assert!(matches!(
        load_config_from(file.path()),
        Err(ConfigError::Figment(_))
    ));
}
