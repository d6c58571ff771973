// ── Poll strategies ──
//
// How one binding is read during a cycle. The shared sequence (connect,
// back off, read through the cache, map) lives in `poll_binding`; the
// parts that differ between the cloud and local families (session
// handling, error recovery, cloud-only extras) sit behind `PollStrategy`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::Serialize;
use strum::Display;
use sunpoll_api::{
    CloudClient, DeviceRole, Endpoint, FirmwareInfo, RawBatteryBank, RawControllerEnergy,
    RawControllerRuntime, RawEnergy, RawParameters, RawRuntime, Transport, TransportKind,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backoff::{FailureController, RequestClass};
use crate::cache::{EndpointKind, ResponseCache};
use crate::error::CoreError;
use crate::features::Features;
use crate::mapper;
use crate::model::Sensors;
use crate::parameters::PARAMETER_RANGE;

/// Bound on the cloud-only quick charge lookup.
const QUICK_CHARGE_TIMEOUT: Duration = Duration::from_secs(30);

// ── Families ────────────────────────────────────────────────────────

/// Transport family; each has its own poll interval and strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Family {
    Cloud,
    Local,
}

impl From<TransportKind> for Family {
    fn from(kind: TransportKind) -> Self {
        if kind.is_local() {
            Self::Local
        } else {
            Self::Cloud
        }
    }
}

// ── Bindings and endpoint groups ────────────────────────────────────

/// One device reachable over one transport.
pub struct Binding {
    pub serial: String,
    pub role: DeviceRole,
    pub transport: Box<dyn Transport>,
    /// Read once per process; cleared on reconfigure.
    pub firmware: Option<FirmwareInfo>,
}

impl Binding {
    pub fn new(role: DeviceRole, transport: Box<dyn Transport>) -> Self {
        Self {
            serial: transport.serial().to_owned(),
            role,
            transport,
            firmware: None,
        }
    }

    pub fn family(&self) -> Family {
        self.transport.kind().into()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.transport.endpoint()
    }
}

/// Every binding sharing one physical endpoint, plus the state that
/// belongs to that endpoint. The bindings mutex serialises all traffic on
/// the link.
pub struct EndpointGroup {
    pub endpoint: Endpoint,
    pub family: Family,
    pub bindings: Mutex<Vec<Binding>>,
    pub failure: FailureController,
    pub cache: ResponseCache<Response>,
}

// ── Cached responses ────────────────────────────────────────────────

/// Any response the cache can hold.
#[derive(Debug, Clone)]
pub enum Response {
    Runtime(RawRuntime),
    Energy(RawEnergy),
    Battery(RawBatteryBank),
    ControllerRuntime(RawControllerRuntime),
    ControllerEnergy(RawControllerEnergy),
    Parameters(RawParameters),
    QuickCharge(bool),
}

/// A raw type stored in the response cache under one endpoint kind.
pub trait Cached: Clone + Sized {
    const KIND: EndpointKind;
    fn wrap(self) -> Response;
    fn unwrap(response: Response) -> Option<Self>;
}

macro_rules! cached {
    ($ty:ty, $kind:expr, $variant:ident) => {
        impl Cached for $ty {
            const KIND: EndpointKind = $kind;

            fn wrap(self) -> Response {
                Response::$variant(self)
            }

            fn unwrap(response: Response) -> Option<Self> {
                match response {
                    Response::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

cached!(RawRuntime, EndpointKind::Runtime, Runtime);
cached!(RawEnergy, EndpointKind::Energy, Energy);
cached!(RawBatteryBank, EndpointKind::BatteryInfo, Battery);
cached!(RawControllerRuntime, EndpointKind::ControllerRuntime, ControllerRuntime);
cached!(RawParameters, EndpointKind::ParameterRead, Parameters);
cached!(bool, EndpointKind::QuickChargeStatus, QuickCharge);

// Controller energy shares the energy TTL but must not collide with an
// inverter energy entry for the same serial; roles never share a serial.
impl Cached for RawControllerEnergy {
    const KIND: EndpointKind = EndpointKind::Energy;

    fn wrap(self) -> Response {
        Response::ControllerEnergy(self)
    }

    fn unwrap(response: Response) -> Option<Self> {
        match response {
            Response::ControllerEnergy(v) => Some(v),
            _ => None,
        }
    }
}

// ── Poll context and result ─────────────────────────────────────────

/// Per-cycle knobs handed to every binding poll.
#[derive(Debug, Clone, Copy)]
pub struct PollContext {
    pub read_timeout: Duration,
    /// Include the holding-register parameter scan.
    pub parameters: bool,
}

/// What one successful binding poll produced.
#[derive(Debug, Clone, Default)]
pub struct Reading {
    pub sensors: Sensors,
    pub batteries: BTreeMap<String, Sensors>,
    pub runtime: Option<RawRuntime>,
    pub parameters: Option<RawParameters>,
    pub firmware: Option<FirmwareInfo>,
}

/// Wrap a transport call in the coordinator's own read timeout.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, sunpoll_api::Error>>,
) -> Result<T, sunpoll_api::Error> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(sunpoll_api::Error::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Serve `T` from the cache, or await `fetch` and store its result.
/// `fetch` is dropped unpolled on a hit.
async fn read_cached<T: Cached>(
    cache: &ResponseCache<Response>,
    serial: &str,
    timeout: Duration,
    fetch: impl Future<Output = Result<T, sunpoll_api::Error>>,
) -> Result<T, sunpoll_api::Error> {
    let response = cache
        .get_or_fetch(serial, T::KIND, || async move {
            bounded(timeout, fetch).await.map(T::wrap)
        })
        .await?;
    T::unwrap(response).ok_or_else(|| sunpoll_api::Error::Read {
        message: format!("cached {} entry holds another response", T::KIND),
    })
}

// ── Strategy trait ──────────────────────────────────────────────────

#[async_trait]
pub trait PollStrategy: Send + Sync {
    fn family(&self) -> Family;

    /// Make sure the binding can be read: connect or log in.
    async fn prepare(&self, binding: &mut Binding, failure: &FailureController)
    -> Result<(), CoreError>;

    /// Called once after a failed read. `true` means the strategy repaired
    /// the binding and the read should be retried once.
    async fn recover(&self, binding: &mut Binding, error: &sunpoll_api::Error) -> bool;

    /// Family-specific sensors added after a successful read.
    async fn extras(
        &self,
        serial: &str,
        role: DeviceRole,
        cache: &ResponseCache<Response>,
        sensors: &mut Sensors,
    );
}

/// Cloud portal: one shared session, re-login once on expiry.
///
/// A login refused twice in a row latches: no binding logs in again until
/// the topology is rebuilt by a reconfigure.
pub struct CloudStrategy {
    client: Option<Arc<CloudClient>>,
    rejected: ArcSwapOption<String>,
}

impl CloudStrategy {
    pub fn new(client: Option<Arc<CloudClient>>) -> Self {
        Self {
            client,
            rejected: ArcSwapOption::empty(),
        }
    }

    /// The latched login error, if credentials were rejected.
    pub fn rejected(&self) -> Option<CoreError> {
        self.rejected
            .load_full()
            .map(|message| CoreError::AuthenticationFailed {
                message: message.to_string(),
            })
    }

    fn invalidate_session(&self) {
        if let Some(client) = &self.client {
            client.invalidate_session();
        }
    }

    /// Latch an authentication error from a repeated login.
    fn reject(&self, serial: &str, error: sunpoll_api::Error) -> CoreError {
        let err = CoreError::from(error);
        if let CoreError::AuthenticationFailed { message } = &err {
            warn!(serial, error = %message, "cloud login rejected; not retrying until reconfigured");
            self.rejected.store(Some(Arc::new(message.clone())));
        }
        err
    }
}

fn is_auth_error(error: &sunpoll_api::Error) -> bool {
    matches!(error, sunpoll_api::Error::Authentication { .. }) || error.is_auth_expired()
}

#[async_trait]
impl PollStrategy for CloudStrategy {
    fn family(&self) -> Family {
        Family::Cloud
    }

    async fn prepare(
        &self,
        binding: &mut Binding,
        failure: &FailureController,
    ) -> Result<(), CoreError> {
        if let Some(err) = self.rejected() {
            return Err(err);
        }
        if binding.transport.is_connected() {
            return Ok(());
        }
        // Logins skip the backoff wait but still count as failures.
        failure.before_request(RequestClass::Authentication).await;
        match binding.transport.connect().await {
            Ok(()) => Ok(()),
            Err(e) if is_auth_error(&e) => {
                info!(serial = %binding.serial, error = %e, "cloud login refused, retrying once");
                self.invalidate_session();
                binding
                    .transport
                    .connect()
                    .await
                    .map_err(|e| self.reject(&binding.serial, e))
            }
            Err(e) => Err(CoreError::from(e)),
        }
    }

    async fn recover(&self, binding: &mut Binding, error: &sunpoll_api::Error) -> bool {
        if !error.is_auth_expired() {
            return false;
        }
        info!(serial = %binding.serial, "cloud session expired, logging in again");
        self.invalidate_session();
        match binding.transport.connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!(serial = %binding.serial, error = %e, "re-login failed");
                let _ = self.reject(&binding.serial, e);
                false
            }
        }
    }

    async fn extras(
        &self,
        serial: &str,
        role: DeviceRole,
        cache: &ResponseCache<Response>,
        sensors: &mut Sensors,
    ) {
        let Some(client) = &self.client else {
            return;
        };
        if role != DeviceRole::Inverter {
            return;
        }
        let status: Result<bool, _> = read_cached(
            cache,
            serial,
            QUICK_CHARGE_TIMEOUT,
            client.quick_charge_status(serial),
        )
        .await;
        match status {
            Ok(active) => sensors.set("quick_charge_active", active),
            Err(e) => debug!(serial, error = %e, "quick charge status unavailable"),
        }
    }
}

/// Direct links: reopen before every poll, never retry inside a cycle.
pub struct LocalStrategy;

#[async_trait]
impl PollStrategy for LocalStrategy {
    fn family(&self) -> Family {
        Family::Local
    }

    async fn prepare(
        &self,
        binding: &mut Binding,
        _failure: &FailureController,
    ) -> Result<(), CoreError> {
        // A sibling's timeout can close the shared link under a binding
        // that still believes it is connected. Opening is idempotent.
        if !binding.transport.is_connected() {
            debug!(serial = %binding.serial, endpoint = %binding.endpoint(), "connecting");
        }
        binding.transport.connect().await.map_err(CoreError::from)
    }

    async fn recover(&self, _binding: &mut Binding, _error: &sunpoll_api::Error) -> bool {
        false
    }

    async fn extras(
        &self,
        _serial: &str,
        _role: DeviceRole,
        _cache: &ResponseCache<Response>,
        _sensors: &mut Sensors,
    ) {
    }
}

// ── Shared poll sequence ────────────────────────────────────────────

/// Poll one binding: prepare, back off, read, map; retry once if the
/// strategy repaired the binding. Updates the endpoint's failure state.
pub async fn poll_binding(
    strategy: &dyn PollStrategy,
    binding: &mut Binding,
    group: &EndpointGroup,
    ctx: PollContext,
) -> Result<Reading, CoreError> {
    if let Err(e) = strategy.prepare(binding, &group.failure).await {
        group.failure.record_failure(e.kind());
        return Err(e);
    }
    group.failure.before_request(RequestClass::Data).await;

    let mut result = read_binding(binding, &group.cache, ctx).await;
    if let Err(e) = &result {
        if strategy.recover(binding, e).await {
            result = read_binding(binding, &group.cache, ctx).await;
        }
    }

    match result {
        Ok(mut reading) => {
            strategy
                .extras(&binding.serial, binding.role, &group.cache, &mut reading.sensors)
                .await;
            group.failure.record_success();
            Ok(reading)
        }
        Err(e) => {
            if matches!(e, sunpoll_api::Error::Timeout { .. }) {
                // A timed-out link may hold a half-read frame.
                binding.transport.disconnect().await;
            }
            let err = CoreError::from(e);
            group.failure.record_failure(err.kind());
            Err(err)
        }
    }
}

async fn read_binding(
    binding: &mut Binding,
    cache: &ResponseCache<Response>,
    ctx: PollContext,
) -> Result<Reading, sunpoll_api::Error> {
    let mut reading = match binding.role {
        DeviceRole::Inverter => read_inverter(binding, cache, ctx.read_timeout).await?,
        DeviceRole::GridController => read_controller(binding, cache, ctx.read_timeout).await?,
    };

    if binding.firmware.is_none() {
        match bounded(ctx.read_timeout, binding.transport.read_firmware_version()).await {
            Ok(fw) => binding.firmware = Some(fw),
            Err(e) => debug!(serial = %binding.serial, error = %e, "firmware read failed"),
        }
    }
    reading.firmware.clone_from(&binding.firmware);

    if ctx.parameters && binding.role == DeviceRole::Inverter {
        let fetch = binding.transport.read_parameters(PARAMETER_RANGE);
        match read_cached(cache, &binding.serial, ctx.read_timeout, fetch).await {
            Ok(params) => reading.parameters = Some(params),
            Err(e) => warn!(serial = %binding.serial, error = %e, "parameter read failed"),
        }
    }
    Ok(reading)
}

async fn read_inverter(
    binding: &mut Binding,
    cache: &ResponseCache<Response>,
    timeout: Duration,
) -> Result<Reading, sunpoll_api::Error> {
    let serial = binding.serial.as_str();
    let transport = &mut binding.transport;

    let runtime: RawRuntime = read_cached(cache, serial, timeout, transport.read_runtime()).await?;
    let energy: RawEnergy = read_cached(cache, serial, timeout, transport.read_energy()).await?;

    let mut sensors = mapper::map_runtime(&runtime);
    sensors.extend(mapper::map_energy(&energy));

    // A missing battery bank does not make the inverter unavailable.
    let mut batteries = BTreeMap::new();
    match read_cached::<RawBatteryBank>(cache, serial, timeout, transport.read_battery()).await {
        Ok(bank) => {
            let (bank_sensors, modules) = mapper::map_battery(&bank);
            sensors.extend(bank_sensors);
            batteries = modules;
        }
        Err(e) if e.is_connection_lost() => return Err(e),
        Err(e) => debug!(%serial, error = %e, "battery read failed"),
    }

    Ok(Reading {
        sensors,
        batteries,
        runtime: Some(runtime),
        ..Reading::default()
    })
}

async fn read_controller(
    binding: &mut Binding,
    cache: &ResponseCache<Response>,
    timeout: Duration,
) -> Result<Reading, sunpoll_api::Error> {
    let serial = binding.serial.clone();
    let kind = binding.transport.kind();
    let Some(controller) = binding.transport.as_controller() else {
        return Err(sunpoll_api::Error::ProtocolUnsupported {
            operation: "read_controller_runtime",
            transport: kind,
        });
    };

    let runtime: RawControllerRuntime =
        read_cached(cache, &serial, timeout, controller.read_controller_runtime()).await?;
    let energy: RawControllerEnergy =
        read_cached(cache, &serial, timeout, controller.read_controller_energy()).await?;

    Ok(Reading {
        sensors: mapper::map_controller(&runtime, &energy),
        ..Reading::default()
    })
}

// ── Deferred parameter scan ─────────────────────────────────────────

/// Holding registers and detected features for one binding.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub serial: String,
    pub family: Family,
    pub parameters: Option<RawParameters>,
    pub features: Option<Features>,
}

/// Read the parameter block of every connected inverter on one endpoint.
/// Runs outside the poll cycle, so it holds the endpoint lock like a poll
/// would. Results also prime the parameter cache.
pub async fn scan_group(group: &EndpointGroup, timeout: Duration) -> Vec<ScanResult> {
    let mut bindings = group.bindings.lock().await;
    let mut out = Vec::new();
    for binding in bindings.iter_mut() {
        if binding.role != DeviceRole::Inverter || !binding.transport.is_connected() {
            continue;
        }
        let parameters = match bounded(timeout, binding.transport.read_parameters(PARAMETER_RANGE)).await {
            Ok(raw) => {
                group
                    .cache
                    .insert(&binding.serial, EndpointKind::ParameterRead, Response::Parameters(raw.clone()));
                Some(raw)
            }
            Err(e) => {
                warn!(serial = %binding.serial, error = %e, "parameter scan failed");
                None
            }
        };
        if binding.firmware.is_none() {
            if let Ok(fw) = bounded(timeout, binding.transport.read_firmware_version()).await {
                binding.firmware = Some(fw);
            }
        }
        let features = binding
            .firmware
            .as_ref()
            .map(|fw| Features::detect(fw, parameters.as_ref().unwrap_or(&RawParameters::new())));
        if let Some(f) = &features {
            debug!(serial = %binding.serial, family = ?f.family, pv_inputs = f.pv_inputs, "features detected");
        }
        out.push(ScanResult {
            serial: binding.serial.clone(),
            family: group.family,
            parameters,
            features,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_follows_transport_kind() {
        assert_eq!(Family::from(TransportKind::Cloud), Family::Cloud);
        assert_eq!(Family::from(TransportKind::Dongle), Family::Local);
        assert_eq!(Family::from(TransportKind::ModbusSerial), Family::Local);
    }

    #[test]
    fn cached_round_trip_rejects_other_variants() {
        let energy = RawControllerEnergy::default().wrap();
        assert!(RawEnergy::unwrap(energy.clone()).is_none());
        assert!(RawControllerEnergy::unwrap(energy).is_some());
    }
}
