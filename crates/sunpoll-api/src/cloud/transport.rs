use std::sync::Arc;

use async_trait::async_trait;

use crate::cloud::client::CloudClient;
use crate::error::Error;
use crate::models::{
    FirmwareInfo, RawBatteryBank, RawControllerEnergy, RawControllerRuntime, RawEnergy,
    RawParameters, RawRuntime,
};
use crate::transport::{
    ControllerTransport, DeviceRole, Endpoint, RegisterRange, Transport, TransportKind,
};

/// A device read through the cloud portal.
///
/// The session belongs to the shared [`CloudClient`]; `connect` only makes
/// sure it is established, `disconnect` never logs out.
pub struct CloudTransport {
    client: Arc<CloudClient>,
    serial: String,
    role: DeviceRole,
    endpoint: Endpoint,
    connected: bool,
}

impl CloudTransport {
    pub fn new(client: Arc<CloudClient>, serial: impl Into<String>) -> Self {
        let endpoint = Endpoint::Cloud {
            base_url: client.base_url().to_string(),
        };
        Self {
            client,
            serial: serial.into(),
            role: DeviceRole::Inverter,
            endpoint,
            connected: false,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: DeviceRole) -> Self {
        self.role = role;
        self
    }

    fn track<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_auth_expired() || e.is_connection_lost() {
                self.connected = false;
            }
        }
        result
    }

    fn require_role(&self, role: DeviceRole, operation: &'static str) -> Result<(), Error> {
        if self.role == role {
            Ok(())
        } else {
            Err(Error::ProtocolUnsupported {
                operation,
                transport: TransportKind::Cloud,
            })
        }
    }
}

#[async_trait]
impl Transport for CloudTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Cloud
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn is_connected(&self) -> bool {
        self.connected && self.client.is_logged_in()
    }

    async fn connect(&mut self) -> Result<(), Error> {
        self.client.ensure_session().await?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read_runtime(&mut self) -> Result<RawRuntime, Error> {
        self.require_role(DeviceRole::Inverter, "read_runtime")?;
        let result = self.client.inverter_runtime(&self.serial).await;
        self.track(result)
    }

    async fn read_energy(&mut self) -> Result<RawEnergy, Error> {
        self.require_role(DeviceRole::Inverter, "read_energy")?;
        let result = self.client.inverter_energy(&self.serial).await;
        self.track(result)
    }

    async fn read_battery(&mut self) -> Result<RawBatteryBank, Error> {
        self.require_role(DeviceRole::Inverter, "read_battery")?;
        let result = self.client.battery_info(&self.serial).await;
        self.track(result)
    }

    async fn read_parameters(&mut self, range: RegisterRange) -> Result<RawParameters, Error> {
        let result = self.client.remote_read(&self.serial, range).await;
        self.track(result)
    }

    async fn read_firmware_version(&mut self) -> Result<FirmwareInfo, Error> {
        let result = self.client.inverter_info(&self.serial).await;
        self.track(result)
    }

    async fn write_register(&mut self, register: u16, value: u16) -> Result<(), Error> {
        let result = self.client.remote_write(&self.serial, register, value).await;
        self.track(result)
    }

    fn supports_controller(&self) -> bool {
        self.role == DeviceRole::GridController
    }

    fn as_controller(&mut self) -> Option<&mut dyn ControllerTransport> {
        if self.supports_controller() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl ControllerTransport for CloudTransport {
    async fn read_controller_runtime(&mut self) -> Result<RawControllerRuntime, Error> {
        self.require_role(DeviceRole::GridController, "read_controller_runtime")?;
        let result = self.client.midbox_runtime(&self.serial).await;
        self.track(result).map(|(runtime, _)| runtime)
    }

    async fn read_controller_energy(&mut self) -> Result<RawControllerEnergy, Error> {
        self.require_role(DeviceRole::GridController, "read_controller_energy")?;
        let result = self.client.midbox_runtime(&self.serial).await;
        self.track(result).map(|(_, energy)| energy)
    }
}
