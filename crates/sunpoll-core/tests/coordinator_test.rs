//! Integration tests for the poll coordinator.
//!
//! Every link is an in-process fake, so these exercise grouping, merging,
//! aggregation and command routing without any network.
#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use sunpoll_api::{
    ControllerTransport, Endpoint, Error, FirmwareInfo, LocalTransport, RawBatteryBank,
    RawControllerEnergy, RawControllerRuntime, RawEnergy, RawParameters, RawRuntime, RegisterIo,
    RegisterRange, RegisterTable, Transport, TransportKind,
};
use sunpoll_core::{
    Binding, CommandResult, Coordinator, CoordinatorConfig, CoreError, DeviceKind, DeviceRole,
    SensorValue,
};
use tokio::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Healthy,
    /// Never answers; the coordinator's read timeout has to fire.
    Hang,
    /// Refuses the connection.
    Refuse,
    /// Rejects the login.
    Reject,
}

/// Counts concurrent reads across every fake that shares it.
#[derive(Clone, Default)]
struct Gauge {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Gauge {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct FakeInverter {
    serial: String,
    kind: TransportKind,
    endpoint: Endpoint,
    runtime: Arc<Mutex<RawRuntime>>,
    energy: Arc<Mutex<RawEnergy>>,
    behavior: Arc<Mutex<Behavior>>,
    logins: Arc<AtomicUsize>,
    registers: Arc<Mutex<BTreeMap<u16, u16>>>,
    gauges: Vec<Gauge>,
    delay: Duration,
    connected: bool,
}

impl FakeInverter {
    fn local(serial: &str, host: &str) -> Self {
        Self {
            serial: serial.into(),
            kind: TransportKind::ModbusTcp,
            endpoint: Endpoint::Tcp {
                host: host.into(),
                port: 502,
            },
            runtime: Arc::new(Mutex::new(RawRuntime {
                status: 16,
                ppv: [Some(1000), None, None],
                soc: Some(80),
                ..RawRuntime::default()
            })),
            energy: Arc::new(Mutex::new(RawEnergy {
                import_today: Some(42),
                ..RawEnergy::default()
            })),
            behavior: Arc::new(Mutex::new(Behavior::Healthy)),
            logins: Arc::new(AtomicUsize::new(0)),
            registers: Arc::new(Mutex::new(BTreeMap::new())),
            gauges: Vec::new(),
            delay: Duration::ZERO,
            connected: false,
        }
    }

    fn cloud(serial: &str) -> Self {
        Self {
            kind: TransportKind::Cloud,
            endpoint: Endpoint::Cloud {
                base_url: "https://monitor.test/".into(),
            },
            ..Self::local(serial, "unused")
        }
    }

    fn pv(self, watts: u16) -> Self {
        self.runtime.lock().unwrap().ppv = [Some(watts), None, None];
        self
    }

    fn grid_import(self, watts: u16) -> Self {
        {
            let mut runtime = self.runtime.lock().unwrap();
            runtime.p_to_user = Some(watts);
            runtime.p_to_grid = Some(0);
        }
        self
    }

    fn parallel(self, group: u8, role: u8) -> Self {
        {
            let mut runtime = self.runtime.lock().unwrap();
            runtime.parallel_group = Some(group);
            runtime.parallel_role = Some(role);
        }
        self
    }

    fn counting_logins(mut self, logins: &Arc<AtomicUsize>) -> Self {
        self.logins = Arc::clone(logins);
        self
    }

    fn behaving(mut self, behavior: &Arc<Mutex<Behavior>>) -> Self {
        self.behavior = Arc::clone(behavior);
        self
    }

    fn registers(mut self, registers: &Arc<Mutex<BTreeMap<u16, u16>>>) -> Self {
        self.registers = Arc::clone(registers);
        self
    }

    fn metered(mut self, gauges: &[&Gauge], delay: Duration) -> Self {
        self.gauges = gauges.iter().map(|p| (*p).clone()).collect();
        self.delay = delay;
        self
    }

    fn binding(self) -> Binding {
        Binding::new(DeviceRole::Inverter, Box::new(self))
    }

    async fn io(&mut self) -> Result<(), Error> {
        for p in &self.gauges {
            p.enter();
        }
        tokio::time::sleep(self.delay).await;
        for p in &self.gauges {
            p.leave();
        }

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            Behavior::Healthy | Behavior::Reject => Ok(()),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Behavior::Refuse => {
                self.connected = false;
                Err(Error::Connection {
                    endpoint: self.endpoint.to_string(),
                    reason: "connection refused".into(),
                })
            }
        }
    }
}

#[async_trait]
impl Transport for FakeInverter {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), Error> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            Behavior::Refuse => Err(Error::Connection {
                endpoint: self.endpoint.to_string(),
                reason: "connection refused".into(),
            }),
            Behavior::Reject => Err(Error::Authentication {
                message: "invalid username or password".into(),
            }),
            Behavior::Healthy | Behavior::Hang => {
                self.connected = true;
                Ok(())
            }
        }
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read_runtime(&mut self) -> Result<RawRuntime, Error> {
        self.io().await?;
        Ok(self.runtime.lock().unwrap().clone())
    }

    async fn read_energy(&mut self) -> Result<RawEnergy, Error> {
        self.io().await?;
        Ok(self.energy.lock().unwrap().clone())
    }

    async fn read_battery(&mut self) -> Result<RawBatteryBank, Error> {
        self.io().await?;
        Ok(RawBatteryBank::default())
    }

    async fn read_parameters(&mut self, range: RegisterRange) -> Result<RawParameters, Error> {
        self.io().await?;
        let registers = self.registers.lock().unwrap();
        Ok(registers
            .iter()
            .filter(|(reg, _)| u32::from(**reg) >= u32::from(range.start) && u32::from(**reg) < range.end())
            .map(|(reg, value)| (*reg, *value))
            .collect())
    }

    async fn read_firmware_version(&mut self) -> Result<FirmwareInfo, Error> {
        self.io().await?;
        Ok(FirmwareInfo {
            code: "FAAB".into(),
            primary: 0x25,
            secondary: 0x25,
            ..FirmwareInfo::default()
        })
    }

    async fn write_register(&mut self, register: u16, value: u16) -> Result<(), Error> {
        self.io().await?;
        self.registers.lock().unwrap().insert(register, value);
        Ok(())
    }
}

struct FakeController {
    serial: String,
    endpoint: Endpoint,
    grid_power: [i16; 2],
    connected: bool,
}

impl FakeController {
    fn binding(serial: &str, host: &str, grid_power: [i16; 2]) -> Binding {
        let fake = Self {
            serial: serial.into(),
            endpoint: Endpoint::Tcp {
                host: host.into(),
                port: 502,
            },
            grid_power,
            connected: false,
        };
        Binding::new(DeviceRole::GridController, Box::new(fake))
    }
}

#[async_trait]
impl Transport for FakeController {
    fn kind(&self) -> TransportKind {
        TransportKind::ModbusTcp
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), Error> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read_runtime(&mut self) -> Result<RawRuntime, Error> {
        Err(unsupported("read_runtime"))
    }

    async fn read_energy(&mut self) -> Result<RawEnergy, Error> {
        Err(unsupported("read_energy"))
    }

    async fn read_battery(&mut self) -> Result<RawBatteryBank, Error> {
        Err(unsupported("read_battery"))
    }

    async fn read_parameters(&mut self, _range: RegisterRange) -> Result<RawParameters, Error> {
        Err(unsupported("read_parameters"))
    }

    async fn read_firmware_version(&mut self) -> Result<FirmwareInfo, Error> {
        Ok(FirmwareInfo {
            code: "GCAA".into(),
            ..FirmwareInfo::default()
        })
    }

    async fn write_register(&mut self, _register: u16, _value: u16) -> Result<(), Error> {
        Err(unsupported("write_register"))
    }

    fn supports_controller(&self) -> bool {
        true
    }

    fn as_controller(&mut self) -> Option<&mut dyn ControllerTransport> {
        Some(self)
    }
}

#[async_trait]
impl ControllerTransport for FakeController {
    async fn read_controller_runtime(&mut self) -> Result<RawControllerRuntime, Error> {
        Ok(RawControllerRuntime {
            grid_power: [Some(self.grid_power[0]), Some(self.grid_power[1])],
            ..RawControllerRuntime::default()
        })
    }

    async fn read_controller_energy(&mut self) -> Result<RawControllerEnergy, Error> {
        Ok(RawControllerEnergy::default())
    }
}

/// One Modbus gateway shared by several units. A read addressed to a dead
/// unit times out and drops the link for everyone, as a real gateway does.
struct SharedBus {
    endpoint: Endpoint,
    dead: Vec<u8>,
    open: AtomicBool,
}

impl SharedBus {
    fn new(host: &str, dead: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            endpoint: Endpoint::Tcp {
                host: host.into(),
                port: 502,
            },
            dead: dead.to_vec(),
            open: AtomicBool::new(false),
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn binding(self: &Arc<Self>, unit: u8, serial: &str) -> Binding {
        let transport = LocalTransport::new(Arc::clone(self), unit, serial);
        Binding::new(DeviceRole::Inverter, Box::new(transport))
    }
}

#[async_trait]
impl RegisterIo for SharedBus {
    type Address = u8;

    fn kind(&self) -> TransportKind {
        TransportKind::ModbusTcp
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open(&self) -> Result<(), Error> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn read(
        &self,
        unit: &u8,
        _table: RegisterTable,
        range: RegisterRange,
        timeout: Duration,
    ) -> Result<Vec<u16>, Error> {
        if !self.is_open() {
            return Err(Error::NotConnected {
                endpoint: self.endpoint.to_string(),
            });
        }
        if self.dead.contains(unit) {
            self.open.store(false, Ordering::SeqCst);
            return Err(Error::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap(),
            });
        }
        Ok(vec![0; usize::from(range.count)])
    }

    async fn write(&self, _: &u8, _: u16, _: u16, _: Duration) -> Result<(), Error> {
        Ok(())
    }
}

/// Collects the message of every event emitted while installed.
#[derive(Clone, Default)]
struct Messages(Arc<Mutex<Vec<String>>>);

impl Messages {
    fn count(&self, message: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|m| *m == message).count()
    }
}

impl<S: Subscriber> Layer<S> for Messages {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.0.lock().unwrap().push(message);
        }
    }
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

fn unsupported(operation: &'static str) -> Error {
    Error::ProtocolUnsupported {
        operation,
        transport: TransportKind::ModbusTcp,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        read_timeout: Duration::from_secs(1),
        background: false,
        ..CoordinatorConfig::default()
    }
}

fn float(coordinator: &Coordinator, serial: &str, key: &str) -> Option<f64> {
    coordinator.snapshot().device(serial)?.sensors.float(key)
}

// ── Polling ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn slow_endpoint_does_not_block_other_endpoints() {
    let hang = Arc::new(Mutex::new(Behavior::Hang));
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![
            FakeInverter::local("SLOW000001", "10.0.0.1").behaving(&hang).binding(),
            FakeInverter::local("FAST000002", "10.0.0.2").pv(2500).binding(),
        ],
        None,
    );

    let snapshot = coordinator.refresh().await.unwrap();
    assert_eq!(snapshot.version, 1);

    let slow = snapshot.device("SLOW000001").unwrap();
    assert!(!slow.available);
    let fast = snapshot.device("FAST000002").unwrap();
    assert!(fast.available);
    assert_eq!(fast.sensors.float("pv_total_power"), Some(2500.0));
}

#[tokio::test(start_paused = true)]
async fn reads_on_one_endpoint_never_overlap() {
    let shared = Gauge::default();
    let other = Gauge::default();
    let global = Gauge::default();
    let delay = Duration::from_millis(100);

    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![
            FakeInverter::local("GW00000001", "10.0.0.9").metered(&[&shared, &global], delay).binding(),
            FakeInverter::local("GW00000002", "10.0.0.9").metered(&[&shared, &global], delay).binding(),
            FakeInverter::local("SOLO000003", "10.0.0.7").metered(&[&other, &global], delay).binding(),
        ],
        None,
    );

    coordinator.refresh().await.unwrap();

    assert_eq!(shared.peak(), 1, "bindings behind one gateway overlapped");
    assert_eq!(other.peak(), 1);
    assert_eq!(global.peak(), 2, "independent endpoints should poll concurrently");
    assert_eq!(coordinator.health().endpoints.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn total_failure_keeps_previous_snapshot() {
    let behavior = Arc::new(Mutex::new(Behavior::Healthy));
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![FakeInverter::local("ONLY000001", "10.0.0.1").behaving(&behavior).binding()],
        None,
    );

    coordinator.refresh().await.unwrap();
    assert_eq!(coordinator.snapshot().version, 1);

    *behavior.lock().unwrap() = Behavior::Refuse;
    tokio::time::advance(Duration::from_secs(11)).await;

    let err = coordinator.refresh().await.unwrap_err();
    assert!(matches!(err, CoreError::UpdateFailed { failed: 1 }));

    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.version, 1);
    assert!(snapshot.device("ONLY000001").unwrap().available);
    assert_eq!(coordinator.health().unavailable, vec!["ONLY000001".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn failed_device_keeps_its_last_sensors() {
    let behavior = Arc::new(Mutex::new(Behavior::Healthy));
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![
            FakeInverter::local("DOWN000001", "10.0.0.1").pv(1500).behaving(&behavior).binding(),
            FakeInverter::local("UP00000002", "10.0.0.2").pv(700).binding(),
        ],
        None,
    );

    coordinator.refresh().await.unwrap();
    *behavior.lock().unwrap() = Behavior::Refuse;
    tokio::time::advance(Duration::from_secs(11)).await;

    let snapshot = coordinator.refresh().await.unwrap();
    assert_eq!(snapshot.version, 2);
    let down = snapshot.device("DOWN000001").unwrap();
    assert!(!down.available);
    assert_eq!(down.sensors.float("pv_total_power"), Some(1500.0));
    assert!(snapshot.device("UP00000002").unwrap().available);
    assert_eq!(coordinator.health().unavailable, vec!["DOWN000001".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn sibling_timeout_does_not_fail_healthy_unit() {
    let bus = SharedBus::new("10.0.0.5", &[1]);
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![
            bus.binding(2, "GOOD000002"),
            bus.binding(1, "DEAD000001"),
            FakeInverter::local("AWAY000003", "10.0.0.6").binding(),
        ],
        None,
    );

    for cycle in 1..=4 {
        let snapshot = coordinator.refresh().await.unwrap();
        assert!(
            snapshot.device("GOOD000002").unwrap().available,
            "healthy unit dropped in cycle {cycle}"
        );
        assert!(!snapshot.device("DEAD000001").unwrap().available);
        tokio::time::advance(Duration::from_secs(11)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn rejected_login_is_not_retried_until_reconfigured() {
    let behavior = Arc::new(Mutex::new(Behavior::Reject));
    let logins = Arc::new(AtomicUsize::new(0));
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![
            FakeInverter::cloud("AUTH000001").behaving(&behavior).counting_logins(&logins).binding(),
            FakeInverter::cloud("AUTH000002").behaving(&behavior).counting_logins(&logins).binding(),
        ],
        None,
    );

    for _ in 0..5 {
        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err, CoreError::AuthenticationFailed { .. }), "got {err:?}");
        tokio::time::advance(Duration::from_secs(61)).await;
    }
    // The first login plus one immediate retry, then nothing.
    assert_eq!(logins.load(Ordering::SeqCst), 2);

    *behavior.lock().unwrap() = Behavior::Healthy;
    coordinator
        .reconfigure_with(
            test_config(),
            vec![FakeInverter::cloud("AUTH000001").behaving(&behavior).counting_logins(&logins).binding()],
            None,
        )
        .await;
    let snapshot = coordinator.refresh().await.unwrap();
    assert!(snapshot.device("AUTH000001").unwrap().available);
    assert_eq!(logins.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn lifetime_counters_never_go_backwards() {
    let fake = FakeInverter::local("CNT0000001", "10.0.0.1");
    let energy = Arc::clone(&fake.energy);
    energy.lock().unwrap().import_total = Some(5000);
    let coordinator = Coordinator::from_bindings(test_config(), vec![fake.binding()], None);

    coordinator.refresh().await.unwrap();
    assert_eq!(float(&coordinator, "CNT0000001", "grid_import_total"), Some(500.0));

    energy.lock().unwrap().import_total = Some(4000);
    tokio::time::advance(Duration::from_secs(11)).await;
    coordinator.refresh().await.unwrap();
    assert_eq!(float(&coordinator, "CNT0000001", "grid_import_total"), Some(500.0));

    energy.lock().unwrap().import_total = Some(5100);
    tokio::time::advance(Duration::from_secs(11)).await;
    coordinator.refresh().await.unwrap();
    assert_eq!(float(&coordinator, "CNT0000001", "grid_import_total"), Some(510.0));
}

#[tokio::test(start_paused = true)]
async fn restored_device_is_announced_once() {
    let messages = Messages::default();
    let _guard = tracing::subscriber::set_default(
        tracing_subscriber::registry().with(messages.clone()),
    );

    let behavior = Arc::new(Mutex::new(Behavior::Healthy));
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![
            FakeInverter::local("FLAP000001", "10.0.0.1").behaving(&behavior).binding(),
            FakeInverter::local("STAY000002", "10.0.0.2").binding(),
        ],
        None,
    );

    for state in [
        Behavior::Healthy,
        Behavior::Refuse,
        Behavior::Refuse,
        Behavior::Healthy,
        Behavior::Healthy,
    ] {
        *behavior.lock().unwrap() = state;
        coordinator.refresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
    }

    assert_eq!(messages.count("device unavailable"), 1);
    assert_eq!(messages.count("device restored"), 1);
    assert_eq!(messages.count("device poll failed"), 1);
}

#[tokio::test(start_paused = true)]
async fn background_ticks_keep_their_cadence() {
    let config = CoordinatorConfig {
        read_timeout: Duration::from_secs(1),
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::from_bindings(
        config,
        vec![
            FakeInverter::local("TICK000001", "10.0.0.1")
                .metered(&[], Duration::from_millis(300))
                .binding(),
        ],
        None,
    );

    let origin = Instant::now();
    let mut rx = coordinator.subscribe();
    coordinator.start().await;

    let mut published = Vec::new();
    let deadline = origin + Duration::from_secs(42);
    while let Ok(Ok(())) = tokio::time::timeout_at(deadline, rx.changed()).await {
        published.push(origin.elapsed());
    }
    coordinator.shutdown().await;

    // The follow-up after the parameter scan must not push the next tick out.
    for tick in [10, 20, 30, 40] {
        let from = Duration::from_secs(tick);
        let to = from + Duration::from_secs(2);
        assert!(
            published.iter().any(|t| *t >= from && *t < to),
            "no publish after the {tick}s tick: {published:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn interval_gating_skips_families_not_due() {
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![FakeInverter::local("GATE000001", "10.0.0.1").binding()],
        None,
    );

    coordinator.refresh().await.unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;
    let snapshot = coordinator.refresh().await.unwrap();
    assert_eq!(snapshot.version, 1, "local family polled again before its interval");

    tokio::time::advance(Duration::from_secs(8)).await;
    let snapshot = coordinator.refresh().await.unwrap();
    assert_eq!(snapshot.version, 2);
}

#[tokio::test(start_paused = true)]
async fn hybrid_device_prefers_local_and_falls_back_to_cloud() {
    let local_behavior = Arc::new(Mutex::new(Behavior::Healthy));
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![
            FakeInverter::local("HYB0000001", "10.0.0.1")
                .pv(1000)
                .behaving(&local_behavior)
                .binding(),
            FakeInverter::cloud("HYB0000001").pv(900).binding(),
        ],
        None,
    );

    coordinator.refresh().await.unwrap();
    assert_eq!(float(&coordinator, "HYB0000001", "pv_total_power"), Some(1000.0));

    *local_behavior.lock().unwrap() = Behavior::Refuse;
    tokio::time::advance(Duration::from_secs(61)).await;

    let snapshot = coordinator.refresh().await.unwrap();
    let device = snapshot.device("HYB0000001").unwrap();
    assert!(device.available);
    assert_eq!(device.sensors.float("pv_total_power"), Some(900.0));
}

// ── Aggregation ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn controller_overlays_parallel_group() {
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![
            FakeInverter::local("PAR0000001", "10.0.0.1")
                .pv(2000)
                .grid_import(1000)
                .parallel(1, 1)
                .binding(),
            FakeInverter::local("PAR0000002", "10.0.0.2")
                .pv(2000)
                .grid_import(1000)
                .parallel(1, 2)
                .binding(),
            FakeController::binding("CT00000001", "10.0.0.3", [100, 50]),
        ],
        None,
    );

    let snapshot = coordinator.refresh().await.unwrap();
    let group = snapshot.device("parallel_group_a").unwrap();
    assert_eq!(group.kind, DeviceKind::ParallelGroup);
    assert!(group.available);
    assert_eq!(group.sensors.float("grid_power"), Some(150.0));
    assert_eq!(group.sensors.float("pv_total_power"), Some(4000.0));
    // 4000 pv + 150 grid, no battery flow
    assert_eq!(group.sensors.float("consumption_power"), Some(4150.0));

    for serial in ["PAR0000001", "PAR0000002", "CT00000001"] {
        assert_eq!(
            snapshot.device(serial).unwrap().parent_group.as_deref(),
            Some("parallel_group_a")
        );
    }
    assert_eq!(float(&coordinator, "PAR0000001", "grid_power"), Some(1000.0));

    let descriptor = coordinator.device_descriptor("parallel_group_a").unwrap();
    assert_eq!(descriptor.name, "Parallel Group A");
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn commands_require_a_started_coordinator() {
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![FakeInverter::local("CMD0000001", "10.0.0.1").binding()],
        None,
    );
    let err = coordinator
        .write_parameter("CMD0000001", "charge_power_percent", 50.0)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CoordinatorStopped));
}

#[tokio::test(start_paused = true)]
async fn writes_go_through_the_command_processor() {
    let registers = Arc::new(Mutex::new(BTreeMap::from([(21, 0b0000_0001)])));
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![FakeInverter::local("CMD0000001", "10.0.0.1").registers(&registers).binding()],
        None,
    );
    coordinator.start().await;

    let result = coordinator
        .write_parameter("CMD0000001", "charge_power_percent", 50.0)
        .await
        .unwrap();
    assert_eq!(result, CommandResult::Written { register: 64, value: 50 });

    let result = coordinator
        .set_boolean_function("CMD0000001", "ac_charge", true)
        .await
        .unwrap();
    assert_eq!(result, CommandResult::Written { register: 21, value: 0b1000_0001 });
    assert_eq!(registers.lock().unwrap().get(&21), Some(&0b1000_0001));

    let err = coordinator
        .write_parameter("CMD0000001", "charge_power_percent", 150.0)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationFailed { .. }));

    let err = coordinator
        .write_parameter("CMD0000001", "no_such_setting", 1.0)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UnknownParameter { .. }));

    let err = coordinator
        .set_boolean_function("MISSING001", "ac_charge", true)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DeviceNotFound { .. }));

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn immediate_refresh_bypasses_cached_readings() {
    let fake = FakeInverter::cloud("NOW0000001").pv(1000);
    let runtime = Arc::clone(&fake.runtime);
    let coordinator = Coordinator::from_bindings(test_config(), vec![fake.binding()], None);
    coordinator.start().await;

    coordinator.refresh().await.unwrap();
    coordinator.wait_deferred().await;
    assert_eq!(float(&coordinator, "NOW0000001", "pv_total_power"), Some(1000.0));

    runtime.lock().unwrap().ppv = [Some(2000), None, None];
    tokio::time::advance(Duration::from_secs(5)).await;
    coordinator.request_immediate_refresh().await.unwrap();
    assert_eq!(float(&coordinator, "NOW0000001", "pv_total_power"), Some(2000.0));

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn write_invalidates_cached_parameters() {
    let registers = Arc::new(Mutex::new(BTreeMap::from([(64, 80)])));
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![FakeInverter::local("WRT0000001", "10.0.0.1").registers(&registers).binding()],
        None,
    );
    coordinator.start().await;

    coordinator.refresh().await.unwrap();
    coordinator.wait_deferred().await;
    let params = coordinator.snapshot().parameters.get("WRT0000001").cloned().unwrap();
    assert_eq!(params.get("charge_power_percent"), Some(&SensorValue::Float(80.0)));

    coordinator
        .write_parameter("WRT0000001", "charge_power_percent", 50.0)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(11)).await;
    coordinator.refresh().await.unwrap();

    let params = coordinator.snapshot().parameters.get("WRT0000001").cloned().unwrap();
    assert_eq!(params.get("charge_power_percent"), Some(&SensorValue::Float(50.0)));

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_shared_links() {
    let bus = SharedBus::new("10.0.0.5", &[]);
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![bus.binding(1, "LINK000001"), bus.binding(2, "LINK000002")],
        None,
    );
    coordinator.start().await;
    coordinator.refresh().await.unwrap();
    assert!(bus.is_open());

    coordinator.shutdown().await;
    assert!(!bus.is_open());
}

#[tokio::test(start_paused = true)]
async fn deferred_scan_publishes_parameters() {
    let registers = Arc::new(Mutex::new(BTreeMap::from([(21, 0b1000_0000), (64, 80)])));
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![FakeInverter::local("SCAN000001", "10.0.0.1").registers(&registers).binding()],
        None,
    );
    coordinator.start().await;

    let first = coordinator.refresh().await.unwrap();
    assert!(first.parameters.is_empty());

    coordinator.wait_deferred().await;
    let snapshot = coordinator.snapshot();
    assert!(snapshot.version > first.version);

    let params = snapshot.parameters.get("SCAN000001").unwrap();
    assert_eq!(params.get("charge_power_percent"), Some(&SensorValue::Float(80.0)));
    assert_eq!(params.get("ac_charge"), Some(&SensorValue::Bool(true)));
    assert_eq!(
        snapshot.device("SCAN000001").unwrap().firmware.as_deref(),
        Some("FAAB-2525")
    );

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconfigure_replaces_the_device_set() {
    let coordinator = Coordinator::from_bindings(
        test_config(),
        vec![FakeInverter::local("OLD0000001", "10.0.0.1").binding()],
        None,
    );
    coordinator.refresh().await.unwrap();
    assert!(coordinator.snapshot().devices.contains_key("OLD0000001"));

    coordinator
        .reconfigure_with(
            test_config(),
            vec![FakeInverter::local("NEW0000001", "10.0.0.2").binding()],
            None,
        )
        .await;
    assert!(coordinator.snapshot().devices.is_empty());

    // Interval gating restarts with the new topology, so this polls at once.
    let snapshot = coordinator.refresh().await.unwrap();
    assert_eq!(snapshot.version, 2);
    assert!(snapshot.devices.contains_key("NEW0000001"));
    assert!(!snapshot.devices.contains_key("OLD0000001"));
    assert!(coordinator.health().unavailable.is_empty());
}
