// ── Local register links ──
//
// Modbus TCP, Modbus RTU and the WiFi dongle differ only in framing and in
// how a device is addressed on the shared link. `RegisterIo` captures that
// difference; `LocalTransport` layers the register map on top of it once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Error;
use crate::models::{
    FirmwareInfo, RawBatteryBank, RawControllerEnergy, RawControllerRuntime, RawEnergy,
    RawParameters, RawRuntime,
};
use crate::registers::{self, RegisterBlock, MAX_BATTERY_MODULES, MAX_REGISTERS_PER_READ};
use crate::transport::{
    ControllerTransport, DeviceRole, Endpoint, RegisterRange, Transport, TransportKind,
};

/// Default per-read deadline for local links.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Register table addressed by a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterTable {
    Input,
    Holding,
}

/// A shared physical link able to move raw register words.
///
/// One value exists per endpoint and is shared (via `Arc`) by every device
/// addressed over it. Implementations serialize requests internally, so two
/// devices on the same endpoint never have frames in flight at once.
#[async_trait]
pub trait RegisterIo: Send + Sync {
    /// How a device is addressed on this link (unit id, inverter serial).
    type Address: Clone + Send + Sync + std::fmt::Debug;

    fn kind(&self) -> TransportKind;

    fn endpoint(&self) -> &Endpoint;

    /// Open the link if it is not open yet.
    async fn open(&self) -> Result<(), Error>;

    async fn close(&self);

    /// Read at most [`MAX_REGISTERS_PER_READ`] registers. A timeout or
    /// connection error closes the link.
    async fn read(
        &self,
        address: &Self::Address,
        table: RegisterTable,
        range: RegisterRange,
        timeout: Duration,
    ) -> Result<Vec<u16>, Error>;

    async fn write(
        &self,
        address: &Self::Address,
        register: u16,
        value: u16,
        timeout: Duration,
    ) -> Result<(), Error>;
}

/// A [`Transport`] for one device addressed over a shared [`RegisterIo`].
pub struct LocalTransport<C: RegisterIo> {
    link: Arc<C>,
    address: C::Address,
    serial: String,
    role: DeviceRole,
    timeout: Duration,
    connected: bool,
}

impl<C: RegisterIo> LocalTransport<C> {
    pub fn new(link: Arc<C>, address: C::Address, serial: impl Into<String>) -> Self {
        Self {
            link,
            address,
            serial: serial.into(),
            role: DeviceRole::Inverter,
            timeout: DEFAULT_READ_TIMEOUT,
            connected: false,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: DeviceRole) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    /// Read `range` in frames of at most [`MAX_REGISTERS_PER_READ`].
    async fn read_block(
        &mut self,
        table: RegisterTable,
        range: RegisterRange,
    ) -> Result<RegisterBlock, Error> {
        if !self.connected {
            return Err(Error::NotConnected {
                endpoint: self.link.endpoint().to_string(),
            });
        }
        let mut words = Vec::with_capacity(usize::from(range.count));
        for chunk in range.chunks(MAX_REGISTERS_PER_READ) {
            let result = self
                .link
                .read(&self.address, table, chunk, self.timeout)
                .await;
            match result {
                Ok(part) if part.len() == usize::from(chunk.count) => words.extend(part),
                Ok(part) => {
                    return Err(Error::read(format!(
                        "short read at {chunk}: got {} registers",
                        part.len()
                    )));
                }
                Err(e) => {
                    if e.is_connection_lost() || matches!(e, Error::Timeout { .. }) {
                        self.connected = false;
                    }
                    return Err(e);
                }
            }
        }
        Ok(RegisterBlock::new(range.start, words))
    }

    fn require_role(&self, role: DeviceRole, operation: &'static str) -> Result<(), Error> {
        if self.role == role {
            Ok(())
        } else {
            Err(Error::ProtocolUnsupported {
                operation,
                transport: self.link.kind(),
            })
        }
    }
}

#[async_trait]
impl<C: RegisterIo + 'static> Transport for LocalTransport<C> {
    fn kind(&self) -> TransportKind {
        self.link.kind()
    }

    fn endpoint(&self) -> &Endpoint {
        self.link.endpoint()
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), Error> {
        self.link.open().await?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        // Siblings keep the shared link; `close` releases it.
        self.connected = false;
    }

    async fn close(&mut self) {
        self.connected = false;
        self.link.close().await;
    }

    async fn read_runtime(&mut self) -> Result<RawRuntime, Error> {
        self.require_role(DeviceRole::Inverter, "read_runtime")?;
        let block = self
            .read_block(RegisterTable::Input, registers::RUNTIME_BLOCK)
            .await?;
        // Older firmware rejects the parallel register; treat that as standalone.
        let parallel = match self
            .read_block(RegisterTable::Input, registers::PARALLEL_BLOCK)
            .await
        {
            Ok(p) => Some(p),
            Err(Error::Read { message }) => {
                debug!(serial = %self.serial, %message, "parallel register unavailable");
                None
            }
            Err(e) => return Err(e),
        };
        Ok(registers::decode_runtime(&block, parallel.as_ref()))
    }

    async fn read_energy(&mut self) -> Result<RawEnergy, Error> {
        self.require_role(DeviceRole::Inverter, "read_energy")?;
        let block = self
            .read_block(RegisterTable::Input, registers::ENERGY_BLOCK)
            .await?;
        Ok(registers::decode_energy(&block))
    }

    async fn read_battery(&mut self) -> Result<RawBatteryBank, Error> {
        self.require_role(DeviceRole::Inverter, "read_battery")?;
        let block = self
            .read_block(RegisterTable::Input, registers::BATTERY_BLOCK)
            .await?;
        let mut bank = registers::decode_battery_bank(&block);

        let count = bank.module_count.unwrap_or(0).min(MAX_BATTERY_MODULES);
        for index in 0..count {
            let range = registers::battery_module_range(index);
            match self.read_block(RegisterTable::Input, range).await {
                Ok(module_block) => {
                    let slot = u8::try_from(index).unwrap_or(u8::MAX);
                    if let Some(module) = registers::decode_battery_module(slot, &module_block) {
                        bank.modules.push(module);
                    }
                }
                Err(Error::Read { message }) => {
                    warn!(serial = %self.serial, index, %message, "battery module read rejected");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(bank)
    }

    async fn read_parameters(&mut self, range: RegisterRange) -> Result<RawParameters, Error> {
        let block = self.read_block(RegisterTable::Holding, range).await?;
        Ok((range.start..)
            .zip(block.words().iter().copied())
            .collect())
    }

    async fn read_firmware_version(&mut self) -> Result<FirmwareInfo, Error> {
        let block = self
            .read_block(RegisterTable::Holding, registers::FIRMWARE_BLOCK)
            .await?;
        Ok(registers::decode_firmware(&block))
    }

    async fn write_register(&mut self, register: u16, value: u16) -> Result<(), Error> {
        if !self.connected {
            return Err(Error::NotConnected {
                endpoint: self.link.endpoint().to_string(),
            });
        }
        let result = self
            .link
            .write(&self.address, register, value, self.timeout)
            .await;
        if let Err(e) = &result {
            if e.is_connection_lost() || matches!(e, Error::Timeout { .. }) {
                self.connected = false;
            }
        }
        result
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
impl<C: RegisterIo + 'static> ControllerTransport for LocalTransport<C> {
    async fn read_controller_runtime(&mut self) -> Result<RawControllerRuntime, Error> {
        self.require_role(DeviceRole::GridController, "read_controller_runtime")?;
        let block = self
            .read_block(RegisterTable::Input, registers::CONTROLLER_RUNTIME_BLOCK)
            .await?;
        Ok(registers::decode_controller_runtime(&block))
    }

    async fn read_controller_energy(&mut self) -> Result<RawControllerEnergy, Error> {
        self.require_role(DeviceRole::GridController, "read_controller_energy")?;
        let block = self
            .read_block(RegisterTable::Input, registers::CONTROLLER_ENERGY_BLOCK)
            .await?;
        Ok(registers::decode_controller_energy(&block))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// In-memory link serving a fixed register image.
    struct FakeLink {
        endpoint: Endpoint,
        input: Vec<u16>,
        frames: Mutex<Vec<RegisterRange>>,
        fail_at: Option<u16>,
        closes: AtomicUsize,
    }

    impl FakeLink {
        fn new(input: Vec<u16>) -> Self {
            Self {
                endpoint: Endpoint::Tcp {
                    host: "fake".into(),
                    port: 502,
                },
                input,
                frames: Mutex::new(Vec::new()),
                fail_at: None,
                closes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RegisterIo for FakeLink {
        type Address = u8;

        fn kind(&self) -> TransportKind {
            TransportKind::ModbusTcp
        }

        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        async fn open(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        async fn read(
            &self,
            _address: &u8,
            _table: RegisterTable,
            range: RegisterRange,
            timeout: Duration,
        ) -> Result<Vec<u16>, Error> {
            self.frames.lock().unwrap().push(range);
            if self.fail_at == Some(range.start) {
                return Err(Error::timeout(timeout));
            }
            let start = usize::from(range.start);
            let end = start + usize::from(range.count);
            Ok(self.input.get(start..end).map_or_else(
                || vec![0; usize::from(range.count)],
                <[u16]>::to_vec,
            ))
        }

        async fn write(&self, _: &u8, _: u16, _: u16, _: Duration) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn runtime_read_is_split_into_frames() {
        let mut image = vec![0u16; 120];
        image[7] = 1500;
        let link = Arc::new(FakeLink::new(image));
        let mut transport = LocalTransport::new(Arc::clone(&link), 1, "INV001");
        transport.connect().await.unwrap();

        let raw = transport.read_runtime().await.unwrap();
        assert_eq!(raw.ppv[0], Some(1500));

        let frames = link.frames.lock().unwrap().clone();
        assert!(frames.iter().all(|f| f.count <= MAX_REGISTERS_PER_READ));
        assert_eq!(frames[0], RegisterRange::new(0, 40));
        assert_eq!(frames[1], RegisterRange::new(40, 28));
    }

    #[tokio::test]
    async fn timeout_clears_connected_flag() {
        let mut link = FakeLink::new(vec![0; 120]);
        link.fail_at = Some(28);
        let mut transport = LocalTransport::new(Arc::new(link), 1, "INV001");
        transport.connect().await.unwrap();

        let err = transport.read_energy().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(!transport.is_connected());

        let err = transport.read_energy().await.unwrap_err();
        assert!(matches!(err, Error::NotConnected { .. }));
    }

    #[tokio::test]
    async fn only_close_releases_the_shared_link() {
        let link = Arc::new(FakeLink::new(vec![0; 120]));
        let mut transport = LocalTransport::new(Arc::clone(&link), 1, "INV001");
        transport.connect().await.unwrap();

        transport.disconnect().await;
        assert!(!transport.is_connected());
        assert_eq!(link.closes.load(Ordering::SeqCst), 0);

        transport.connect().await.unwrap();
        transport.close().await;
        assert!(!transport.is_connected());
        assert_eq!(link.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inverter_link_has_no_controller_capability() {
        let mut transport = LocalTransport::new(Arc::new(FakeLink::new(vec![])), 1, "INV001");
        assert!(!transport.supports_controller());
        assert!(transport.as_controller().is_none());

        let mut controller = LocalTransport::new(Arc::new(FakeLink::new(vec![0; 80])), 2, "GC001")
            .with_role(DeviceRole::GridController);
        controller.connect().await.unwrap();
        assert!(controller.as_controller().is_some());
        let err = controller.read_runtime().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolUnsupported { .. }));
    }

    #[tokio::test]
    async fn parameters_are_keyed_by_register() {
        let image: Vec<u16> = (0..200).collect();
        let mut transport = LocalTransport::new(Arc::new(FakeLink::new(image)), 1, "INV001");
        transport.connect().await.unwrap();
        let params = transport
            .read_parameters(RegisterRange::new(60, 50))
            .await
            .unwrap();
        assert_eq!(params.len(), 50);
        assert_eq!(params.get(&64), Some(&64));
        assert_eq!(params.get(&109), Some(&109));
    }
}
