// sunpoll-api: Async transport adapters for inverter, battery and grid-controller links.
//
// Every adapter speaks one wire channel (cloud HTTP, Modbus TCP, Modbus RTU,
// WiFi dongle) and hands back raw, unscaled register-level structs. Scaling
// and sensor naming live in `sunpoll-core`.

pub mod cloud;
pub mod dongle;
pub mod error;
pub mod local;
pub mod modbus;
pub mod models;
pub mod registers;
pub mod transport;

pub use cloud::{CloudClient, CloudTransport, HttpConfig, TlsMode};
pub use dongle::{DongleConnection, DongleTransport};
pub use error::Error;
pub use modbus::{ModbusConnection, ModbusTransport};
pub use models::{
    FirmwareInfo, RawBattery, RawBatteryBank, RawControllerEnergy, RawControllerRuntime,
    RawEnergy, RawParameters, RawRuntime,
};
pub use local::{LocalTransport, RegisterIo, RegisterTable};
pub use transport::{
    ControllerTransport, DeviceRole, Endpoint, RegisterRange, Transport, TransportKind,
};
