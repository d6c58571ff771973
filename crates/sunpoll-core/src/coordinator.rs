// ── Poll coordinator ──
//
// Full lifecycle management for a set of inverter, battery and grid
// controller bindings. Drives the poll cycle (grouping, polling, merging,
// aggregating, publishing), routes commands, and runs the deferred
// parameter scan. Consumers read the published snapshot or subscribe to it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::NaiveDate;
use futures_util::future::join_all;
use serde::Serialize;
use strum::Display;
use sunpoll_api::{
    CloudClient, CloudTransport, DeviceRole, DongleConnection, DongleTransport, Endpoint,
    HttpConfig, ModbusConnection, ModbusTransport, RawParameters, RegisterRange, Transport,
};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::{self, GroupLetters};
use crate::backoff::{FailureController, FailureSnapshot};
use crate::cache::{CacheStats, ResponseCache};
use crate::command::{Command, CommandEnvelope, CommandResult};
use crate::config::{CoordinatorConfig, LocalLink};
use crate::counters;
use crate::error::CoreError;
use crate::features::Features;
use crate::model::{
    DeviceDescriptor, DeviceKind, DeviceSnapshot, Parameters, Sensors, Snapshot,
};
use crate::parameters::{self, map_parameters};
use crate::precedence::{self, Source};
use crate::store::SnapshotStore;
use crate::strategy::{
    self, Binding, CloudStrategy, EndpointGroup, Family, LocalStrategy, PollContext,
    PollStrategy, Reading, ScanResult,
};

const COMMAND_CHANNEL_SIZE: usize = 64;
const DEFERRED_CHANNEL_SIZE: usize = 4;

/// Shown as the manufacturer of every device.
pub const MANUFACTURER: &str = "EG4 Electronics";

// ── CycleState ───────────────────────────────────────────────────────

/// Where the coordinator is inside a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CycleState {
    Idle,
    Grouping,
    Polling,
    Merging,
    Aggregating,
    Published,
}

// ── Health ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub family: Family,
    pub devices: usize,
    #[serde(flatten)]
    pub failure: FailureSnapshot,
}

/// Introspection for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub state: CycleState,
    pub snapshot_version: u64,
    pub cache: CacheStats,
    pub endpoints: Vec<EndpointHealth>,
    pub unavailable: Vec<String>,
}

// ── Topology ─────────────────────────────────────────────────────────

/// Bindings grouped by endpoint, plus the strategy per family. Swapped
/// wholesale on reconfigure.
struct Topology {
    groups: Vec<Arc<EndpointGroup>>,
    /// Serials per group, parallel to `groups`.
    members: Vec<Vec<String>>,
    devices: Vec<(String, DeviceRole)>,
    cloud: CloudStrategy,
    local: LocalStrategy,
}

impl Topology {
    fn build(
        config: &CoordinatorConfig,
        bindings: Vec<Binding>,
        cloud: Option<Arc<CloudClient>>,
    ) -> Self {
        let mut devices: Vec<(String, DeviceRole)> = config
            .devices
            .iter()
            .map(|d| (d.serial.clone(), d.role))
            .collect();
        for b in &bindings {
            if !devices.iter().any(|(s, _)| *s == b.serial) {
                devices.push((b.serial.clone(), b.role));
            }
        }

        // Same endpoint → same group, in configured order.
        let mut grouped: Vec<(Endpoint, Family, Vec<Binding>)> = Vec::new();
        for binding in bindings {
            let endpoint = binding.endpoint().clone();
            match grouped.iter_mut().find(|(e, _, _)| *e == endpoint) {
                Some((_, _, members)) => members.push(binding),
                None => grouped.push((endpoint, binding.family(), vec![binding])),
            }
        }

        let members = grouped
            .iter()
            .map(|(_, _, bindings)| bindings.iter().map(|b| b.serial.clone()).collect())
            .collect();
        let groups = grouped
            .into_iter()
            .map(|(endpoint, family, members)| {
                let cache = match family {
                    Family::Local => ResponseCache::default().with_ttl_cap(config.intervals.local),
                    Family::Cloud => ResponseCache::default(),
                };
                Arc::new(EndpointGroup {
                    endpoint,
                    family,
                    bindings: Mutex::new(members),
                    failure: FailureController::new(config.backoff),
                    cache,
                })
            })
            .collect();

        Self {
            groups,
            members,
            devices,
            cloud: CloudStrategy::new(cloud),
            local: LocalStrategy,
        }
    }

    fn strategy(&self, family: Family) -> &dyn PollStrategy {
        match family {
            Family::Cloud => &self.cloud,
            Family::Local => &self.local,
        }
    }
}

// ── Process state ────────────────────────────────────────────────────

/// Everything the coordinator remembers between cycles. Cleared on
/// reconfigure.
#[derive(Default)]
struct ProcessState {
    /// Last successful reading per binding.
    readings: HashMap<(String, Family), Reading>,
    /// Outcome of the last attempt per binding.
    binding_ok: HashMap<(String, Family), bool>,
    /// Bindings whose failure has already been logged at warn.
    warned: HashSet<(String, Family)>,
    unavailable: HashSet<String>,
    update_failing: bool,
    last_due: HashMap<Family, Instant>,
    letters: GroupLetters,
    features: HashMap<String, Features>,
    parameters: BTreeMap<String, Parameters>,
    parameters_ready: bool,
    deferred_started: bool,
    last_date: Option<NaiveDate>,
    generation: u64,
}

/// What started a cycle.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    /// A regular tick. Families are gated on their interval as of this
    /// instant, which is also what the next gate is measured from.
    Scheduled(Instant),
    /// Commands and the follow-up after the parameter scan: every family
    /// is polled and the interval gates are left alone.
    Forced,
}

struct DeferredOutcome {
    generation: u64,
    results: Vec<ScanResult>,
}

struct PolledBinding {
    serial: String,
    family: Family,
    result: Result<Reading, CoreError>,
}

// ── Coordinator ──────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<CoordinatorInner>`. Owns the bindings, the
/// per-endpoint caches and failure controllers, the snapshot store and the
/// background tasks.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: ArcSwap<CoordinatorConfig>,
    topology: ArcSwap<Topology>,
    store: SnapshotStore,
    state: watch::Sender<CycleState>,
    cycle_lock: Mutex<()>,
    process: std::sync::Mutex<ProcessState>,
    command_tx: mpsc::Sender<CommandEnvelope>,
    command_rx: Mutex<Option<mpsc::Receiver<CommandEnvelope>>>,
    deferred_tx: mpsc::Sender<DeferredOutcome>,
    deferred_rx: Mutex<Option<mpsc::Receiver<DeferredOutcome>>>,
    deferred_done: watch::Sender<bool>,
    cancel: CancellationToken,
    running: AtomicBool,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build transports for every configured device. Does NOT connect --
    /// call [`start()`](Self::start) or [`refresh()`](Self::refresh).
    pub fn new(config: CoordinatorConfig) -> Result<Self, CoreError> {
        let (bindings, cloud) = build_bindings(&config)?;
        Ok(Self::from_bindings(config, bindings, cloud))
    }

    /// Build a coordinator over ready-made bindings.
    pub fn from_bindings(
        config: CoordinatorConfig,
        bindings: Vec<Binding>,
        cloud: Option<Arc<CloudClient>>,
    ) -> Self {
        let topology = Topology::build(&config, bindings, cloud);
        let (state, _) = watch::channel(CycleState::Idle);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (deferred_tx, deferred_rx) = mpsc::channel(DEFERRED_CHANNEL_SIZE);
        let (deferred_done, _) = watch::channel(false);

        Self {
            inner: Arc::new(CoordinatorInner {
                config: ArcSwap::from_pointee(config),
                topology: ArcSwap::from_pointee(topology),
                store: SnapshotStore::new(),
                state,
                cycle_lock: Mutex::new(()),
                process: std::sync::Mutex::new(ProcessState::default()),
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                deferred_tx,
                deferred_rx: Mutex::new(Some(deferred_rx)),
                deferred_done,
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> Arc<CoordinatorConfig> {
        self.inner.config.load_full()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the background tasks: command processor, deferred-result
    /// listener, and (unless disabled) the periodic poll loop whose first
    /// tick is the initial poll.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut handles = self.inner.task_handles.lock().await;

        if let Some(rx) = self.inner.command_rx.lock().await.take() {
            handles.push(tokio::spawn(command_processor_task(self.clone(), rx)));
        }
        if let Some(rx) = self.inner.deferred_rx.lock().await.take() {
            handles.push(tokio::spawn(deferred_listener_task(self.clone(), rx)));
        }

        let config = self.config();
        let tick = config.intervals.tick();
        if config.background && !tick.is_zero() {
            let cancel = self.inner.cancel.clone();
            handles.push(tokio::spawn(poll_task(self.clone(), tick, cancel)));
        }
        info!(devices = config.devices.len(), "coordinator started");
    }

    /// Cancel in-flight work, join background tasks and close every link.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.running.store(false, Ordering::Release);

        // Taken out first: a cycle finishing inside a task may still push.
        let handles = std::mem::take(&mut *self.inner.task_handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }

        let topology = self.inner.topology.load_full();
        disconnect_all(&topology).await;
        self.inner.state.send_replace(CycleState::Idle);
        debug!("coordinator shut down");
    }

    /// One-shot: poll once, run closure, shut down.
    ///
    /// Disables the periodic poll loop; the deferred scan still runs if
    /// the closure waits for it.
    pub async fn oneshot<F, Fut, T>(config: CoordinatorConfig, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(Coordinator) -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let mut cfg = config;
        cfg.background = false;

        let coordinator = Coordinator::new(cfg)?;
        coordinator.start().await;
        let result = match coordinator.refresh().await {
            Ok(_) => f(coordinator.clone()).await,
            Err(e) => Err(e),
        };
        coordinator.shutdown().await;
        result
    }

    /// Replace the device set. Builds new transports from `config`.
    pub async fn reconfigure(&self, config: CoordinatorConfig) -> Result<(), CoreError> {
        let (bindings, cloud) = build_bindings(&config)?;
        self.reconfigure_with(config, bindings, cloud).await;
        Ok(())
    }

    /// Replace the device set with ready-made bindings. Waits for any
    /// running cycle, closes the old links and forgets all per-process
    /// state (warned sets, group letters, parameters, features).
    pub async fn reconfigure_with(
        &self,
        config: CoordinatorConfig,
        bindings: Vec<Binding>,
        cloud: Option<Arc<CloudClient>>,
    ) {
        let _cycle = self.inner.cycle_lock.lock().await;

        let old = self.inner.topology.load_full();
        disconnect_all(&old).await;

        let topology = Topology::build(&config, bindings, cloud);
        self.inner.topology.store(Arc::new(topology));
        self.inner.config.store(Arc::new(config));

        self.with_process(|p| {
            let generation = p.generation + 1;
            *p = ProcessState {
                generation,
                ..ProcessState::default()
            };
        });
        self.inner.store.reset();
        self.inner.deferred_done.send_replace(false);
        info!("coordinator reconfigured");
    }

    // ── Polling ──────────────────────────────────────────────────────

    /// Run one poll cycle now, honouring per-family interval gating.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, CoreError> {
        self.run_cycle(Trigger::Scheduled(Instant::now())).await
    }

    /// Ask the command processor for an out-of-band cycle that polls
    /// every family regardless of its interval, bypassing cached
    /// per-cycle readings.
    pub async fn request_immediate_refresh(&self) -> Result<(), CoreError> {
        self.execute(Command::RefreshNow).await.map(|_| ())
    }

    async fn run_cycle(&self, trigger: Trigger) -> Result<Arc<Snapshot>, CoreError> {
        let _cycle = self.inner.cycle_lock.lock().await;
        self.set_state(CycleState::Grouping);

        let config = self.config();
        let topology = self.inner.topology.load_full();
        let (due, ctx) = self.with_process(|p| {
            let mut due = HashSet::new();
            for family in [Family::Cloud, Family::Local] {
                let interval = match family {
                    Family::Cloud => config.intervals.cloud,
                    Family::Local => config.intervals.local,
                };
                let is_due = match trigger {
                    Trigger::Forced => true,
                    Trigger::Scheduled(at) => {
                        let due = p
                            .last_due
                            .get(&family)
                            .is_none_or(|last| at.saturating_duration_since(*last) >= interval);
                        if due {
                            p.last_due.insert(family, at);
                        }
                        due
                    }
                };
                if is_due {
                    due.insert(family);
                }
            }
            let ctx = PollContext {
                read_timeout: config.read_timeout,
                parameters: p.parameters_ready,
            };
            (due, ctx)
        });

        let groups: Vec<Arc<EndpointGroup>> = topology
            .groups
            .iter()
            .filter(|g| due.contains(&g.family))
            .cloned()
            .collect();
        if groups.is_empty() {
            self.set_state(CycleState::Idle);
            return Ok(self.inner.store.current());
        }

        self.set_state(CycleState::Polling);
        let polls = groups
            .iter()
            .map(|group| poll_group(topology.strategy(group.family), group, ctx));
        let polled: Vec<PolledBinding> = tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => {
                self.set_state(CycleState::Idle);
                return Err(CoreError::CoordinatorStopped);
            }
            results = join_all(polls) => results.into_iter().flatten().collect(),
        };

        self.set_state(CycleState::Merging);
        let merged = self.merge(&config, &topology, polled);
        let (devices, day_changed) = match merged {
            Ok(merged) => merged,
            Err(e) => {
                self.set_state(CycleState::Idle);
                return Err(e);
            }
        };

        self.set_state(CycleState::Aggregating);
        let snapshot = self.aggregate(&config, devices, day_changed);

        let published = self.inner.store.publish(snapshot);
        self.set_state(CycleState::Published);
        debug!(
            version = published.version,
            devices = published.devices.len(),
            "snapshot published"
        );

        self.maybe_start_deferred(&topology, config.read_timeout).await;
        Ok(published)
    }

    /// Fold this cycle's binding results into per-device snapshots. Also
    /// reports whether the local date rolled over since the last publish.
    fn merge(
        &self,
        config: &CoordinatorConfig,
        topology: &Topology,
        polled: Vec<PolledBinding>,
    ) -> Result<(BTreeMap<String, DeviceSnapshot>, bool), CoreError> {
        let previous = self.inner.store.current();
        let today = chrono::Local::now().date_naive();

        self.with_process(|p| {
            let mut polled_devices = HashSet::new();
            let mut succeeded = HashSet::new();
            let mut rejected = None;

            for PolledBinding {
                serial,
                family,
                result,
            } in polled
            {
                polled_devices.insert(serial.clone());
                let key = (serial.clone(), family);
                match result {
                    Ok(reading) => {
                        succeeded.insert(serial.clone());
                        if let Some(raw) = &reading.parameters {
                            p.parameters.insert(serial.clone(), map_parameters(raw));
                        }
                        p.readings.insert(key.clone(), reading);
                        p.binding_ok.insert(key.clone(), true);
                        p.warned.remove(&key);
                    }
                    Err(e) => {
                        p.binding_ok.insert(key.clone(), false);
                        if let CoreError::AuthenticationFailed { message } = &e {
                            rejected.get_or_insert_with(|| message.clone());
                        }
                        if p.warned.insert(key) {
                            warn!(%serial, %family, error = %e, "device poll failed");
                        } else {
                            debug!(%serial, %family, error = %e, "device poll still failing");
                        }
                    }
                }
            }

            if !polled_devices.is_empty() && succeeded.is_empty() {
                p.unavailable.extend(polled_devices.iter().cloned());
                if !p.update_failing {
                    warn!(failed = polled_devices.len(), "every polled device failed; keeping previous snapshot");
                }
                p.update_failing = true;
                return Err(match rejected {
                    Some(message) => CoreError::AuthenticationFailed { message },
                    None => CoreError::UpdateFailed {
                        failed: polled_devices.len(),
                    },
                });
            }
            if p.update_failing {
                info!("updates restored");
                p.update_failing = false;
            }

            let day_changed = p.last_date.is_some_and(|d| d != today);
            p.last_date = Some(today);

            let mut devices = BTreeMap::new();
            for (serial, role) in &topology.devices {
                let device =
                    build_device(p, config, serial, *role, previous.device(serial), day_changed);
                if device.available {
                    if p.unavailable.remove(serial) {
                        info!(%serial, "device restored");
                    }
                } else if p.unavailable.insert(serial.clone()) {
                    warn!(%serial, "device unavailable");
                }
                devices.insert(serial.clone(), device);
            }

            let degraded = devices.values().filter(|d| !d.available).count();
            if degraded > 0 {
                warn!(degraded, total = devices.len(), "publishing partial snapshot");
            }
            Ok((devices, day_changed))
        })
    }

    /// Add parallel groups and assemble the final snapshot.
    fn aggregate(
        &self,
        config: &CoordinatorConfig,
        mut devices: BTreeMap<String, DeviceSnapshot>,
        day_changed: bool,
    ) -> Snapshot {
        let previous = self.inner.store.current();
        let order: Vec<(String, DeviceRole)> = self.inner.topology.load().devices.clone();

        self.with_process(|p| {
            // Group ids in discovery order.
            let mut members: Vec<(u8, Vec<String>)> = Vec::new();
            for (serial, role) in &order {
                if *role != DeviceRole::Inverter {
                    continue;
                }
                let configured = config.device(serial).and_then(|d| d.group);
                let Some(id) = best_runtime(p, serial)
                    .map(|rt| aggregate::group_id(configured, rt))
                    .unwrap_or(configured)
                else {
                    continue;
                };
                match members.iter_mut().find(|(g, _)| *g == id) {
                    Some((_, list)) => list.push(serial.clone()),
                    None => members.push((id, vec![serial.clone()])),
                }
            }

            let group_ids: Vec<u8> = members.iter().map(|(id, _)| *id).collect();
            for (id, serials) in &members {
                let letter = p.letters.letter(*id);
                let group_serial = aggregate::group_serial(&letter);

                let controller = order.iter().find_map(|(serial, role)| {
                    if *role != DeviceRole::GridController {
                        return None;
                    }
                    let attached = match config.device(serial).and_then(|d| d.group) {
                        Some(g) => g == *id,
                        None => group_ids.len() == 1,
                    };
                    attached.then(|| serial.clone())
                });

                let live: Vec<&Sensors> = serials
                    .iter()
                    .filter_map(|s| devices.get(s))
                    .filter(|d| d.available)
                    .map(|d| &d.sensors)
                    .collect();
                let controller_sensors = controller
                    .as_ref()
                    .and_then(|s| devices.get(s))
                    .filter(|d| d.available)
                    .map(|d| d.sensors.clone());

                let available = !live.is_empty();
                let mut sensors = if available {
                    aggregate::aggregate_group(&live, controller_sensors.as_ref())
                } else {
                    previous
                        .device(&group_serial)
                        .map(|d| d.sensors.clone())
                        .unwrap_or_default()
                };
                if let Some(prev) = previous.device(&group_serial) {
                    counters::clamp_counters(&mut sensors, &prev.sensors, day_changed);
                }

                for serial in serials.iter().chain(controller.iter()) {
                    if let Some(d) = devices.get_mut(serial) {
                        d.parent_group = Some(group_serial.clone());
                    }
                }
                devices.insert(
                    group_serial.clone(),
                    DeviceSnapshot {
                        serial: group_serial,
                        kind: DeviceKind::ParallelGroup,
                        model: Some(aggregate::group_name(&letter)),
                        firmware: None,
                        available,
                        sensors,
                        batteries: BTreeMap::new(),
                        parent_group: None,
                    },
                );
            }

            Snapshot {
                version: 0,
                taken_at: None,
                devices: devices.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
                parameters: p.parameters.clone(),
            }
        })
    }

    async fn maybe_start_deferred(&self, topology: &Arc<Topology>, timeout: Duration) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let start = self.with_process(|p| {
            let ready = !p.deferred_started && p.binding_ok.values().any(|ok| *ok);
            if ready {
                p.deferred_started = true;
            }
            ready.then_some(p.generation)
        });
        let Some(generation) = start else {
            return;
        };

        debug!("starting deferred parameter scan");
        let groups = topology.groups.clone();
        let tx = self.inner.deferred_tx.clone();
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(async move {
            let scans = groups.iter().map(|g| strategy::scan_group(g, timeout));
            let results = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                results = join_all(scans) => results.into_iter().flatten().collect(),
            };
            let _ = tx.send(DeferredOutcome {
                generation,
                results,
            })
            .await;
        });
        self.inner.task_handles.lock().await.push(handle);
    }

    /// Wait until the deferred scan finished and its follow-up cycle ran.
    pub async fn wait_deferred(&self) {
        let mut rx = self.inner.deferred_done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    // ── Command execution ────────────────────────────────────────────

    /// Execute a command through the command processor task.
    pub async fn execute(&self, cmd: Command) -> Result<CommandResult, CoreError> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(CoreError::CoordinatorStopped);
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(CommandEnvelope {
                command: cmd,
                response_tx: tx,
            })
            .await
            .map_err(|_| CoreError::CoordinatorStopped)?;

        rx.await.map_err(|_| CoreError::CoordinatorStopped)?
    }

    /// Write a numeric setting, in engineering units.
    pub async fn write_parameter(
        &self,
        serial: &str,
        name: &str,
        value: f64,
    ) -> Result<CommandResult, CoreError> {
        self.execute(Command::WriteParameter {
            serial: serial.into(),
            name: name.into(),
            value,
        })
        .await
    }

    /// Enable or disable one function bit.
    pub async fn set_boolean_function(
        &self,
        serial: &str,
        name: &str,
        enabled: bool,
    ) -> Result<CommandResult, CoreError> {
        self.execute(Command::SetFunction {
            serial: serial.into(),
            name: name.into(),
            enabled,
        })
        .await
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.store.current()
    }

    pub fn previous_snapshot(&self) -> Arc<Snapshot> {
        self.inner.store.previous()
    }

    /// Subscribe to published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.inner.store.subscribe()
    }

    /// Subscribe to cycle state changes.
    pub fn state(&self) -> watch::Receiver<CycleState> {
        self.inner.state.subscribe()
    }

    pub fn device_descriptor(&self, serial: &str) -> Option<DeviceDescriptor> {
        let snapshot = self.snapshot();
        let config = self.config();
        let device = snapshot.device(serial);

        if let Some(d) = device.filter(|d| d.kind == DeviceKind::ParallelGroup) {
            return Some(DeviceDescriptor {
                serial: serial.to_owned(),
                name: d.model.clone().unwrap_or_else(|| serial.to_owned()),
                manufacturer: MANUFACTURER.to_owned(),
                model: d.model.clone(),
                firmware: None,
                kind: DeviceKind::ParallelGroup,
                parent_group: None,
            });
        }

        let topology = self.inner.topology.load();
        let (_, role) = topology.devices.iter().find(|(s, _)| s == serial)?;
        let declared = config.device(serial);
        Some(DeviceDescriptor {
            serial: serial.to_owned(),
            name: declared.map_or(serial, |d| d.display_name()).to_owned(),
            manufacturer: MANUFACTURER.to_owned(),
            model: declared
                .and_then(|d| d.model.clone())
                .or_else(|| device.and_then(|d| d.model.clone())),
            firmware: device.and_then(|d| d.firmware.clone()),
            kind: DeviceKind::from(*role),
            parent_group: device.and_then(|d| d.parent_group.clone()),
        })
    }

    pub fn health(&self) -> Health {
        let topology = self.inner.topology.load_full();
        let mut cache = CacheStats::default();
        let mut endpoints = Vec::with_capacity(topology.groups.len());
        for (group, members) in topology.groups.iter().zip(&topology.members) {
            let stats = group.cache.stats();
            cache.valid += stats.valid;
            cache.expired += stats.expired;
            endpoints.push(EndpointHealth {
                endpoint: group.endpoint.to_string(),
                family: group.family,
                devices: members.len(),
                failure: group.failure.snapshot(),
            });
        }
        let mut unavailable: Vec<String> =
            self.with_process(|p| p.unavailable.iter().cloned().collect());
        unavailable.sort();

        Health {
            state: *self.inner.state.borrow(),
            snapshot_version: self.inner.store.version(),
            cache,
            endpoints,
            unavailable,
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn set_state(&self, state: CycleState) {
        self.inner.state.send_replace(state);
    }

    fn with_process<T>(&self, f: impl FnOnce(&mut ProcessState) -> T) -> T {
        let mut guard = self
            .inner
            .process
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Apply a finished deferred scan and run the follow-up cycle.
    async fn apply_deferred(&self, outcome: DeferredOutcome) {
        let applied = self.with_process(|p| {
            if outcome.generation != p.generation {
                return false;
            }
            // Local results first so they win over cloud for hybrid devices.
            let mut results = outcome.results;
            results.sort_by_key(|r| r.family != Family::Local);
            for r in results {
                if let Some(raw) = &r.parameters {
                    p.parameters
                        .entry(r.serial.clone())
                        .or_insert_with(|| map_parameters(raw));
                }
                if let Some(features) = r.features {
                    p.features.entry(r.serial).or_insert(features);
                }
            }
            p.parameters_ready = true;
            true
        });
        if !applied {
            debug!("discarding deferred scan from a previous configuration");
            return;
        }
        info!("deferred parameter scan complete");
        if let Err(e) = self.run_cycle(Trigger::Forced).await {
            warn!(error = %e, "follow-up poll after parameter scan failed");
        }
        self.inner.deferred_done.send_replace(true);
    }
}

// ── Device assembly ──────────────────────────────────────────────────

fn best_runtime<'a>(p: &'a ProcessState, serial: &str) -> Option<&'a sunpoll_api::RawRuntime> {
    [Family::Local, Family::Cloud]
        .into_iter()
        .find_map(|f| p.readings.get(&(serial.to_owned(), f)))
        .and_then(|r| r.runtime.as_ref())
}

/// Fuse a device's healthy bindings into one snapshot entry.
fn build_device(
    p: &ProcessState,
    config: &CoordinatorConfig,
    serial: &str,
    role: DeviceRole,
    previous: Option<&Arc<DeviceSnapshot>>,
    day_changed: bool,
) -> DeviceSnapshot {
    let healthy = |family: Family| -> Option<&Reading> {
        let key = (serial.to_owned(), family);
        if p.binding_ok.get(&key).copied().unwrap_or(false) {
            p.readings.get(&key)
        } else {
            None
        }
    };
    let local = healthy(Family::Local);
    let cloud = healthy(Family::Cloud);
    let available = local.is_some() || cloud.is_some();

    let empty = Sensors::new();
    let mut sensors = if available {
        precedence::resolve(&[
            (Source::Local, local.map_or(&empty, |r| &r.sensors)),
            (Source::Cloud, cloud.map_or(&empty, |r| &r.sensors)),
        ])
    } else {
        previous.map(|d| d.sensors.clone()).unwrap_or_default()
    };

    if let Some(features) = p.features.get(serial) {
        features.apply(&mut sensors);
    }
    if let Some(prev) = previous {
        counters::clamp_counters(&mut sensors, &prev.sensors, day_changed);
    }

    let batteries = [local, cloud]
        .into_iter()
        .flatten()
        .map(|r| &r.batteries)
        .find(|b| !b.is_empty())
        .cloned()
        .or_else(|| previous.map(|d| d.batteries.clone()))
        .unwrap_or_default();

    let firmware = [local, cloud]
        .into_iter()
        .flatten()
        .find_map(|r| r.firmware.as_ref())
        .or_else(|| {
            [Family::Local, Family::Cloud]
                .into_iter()
                .find_map(|f| p.readings.get(&(serial.to_owned(), f)))
                .and_then(|r| r.firmware.as_ref())
        });

    let model = config
        .device(serial)
        .and_then(|d| d.model.clone())
        .or_else(|| firmware.and_then(|f| f.model.clone()));

    DeviceSnapshot {
        serial: serial.to_owned(),
        kind: role.into(),
        model,
        firmware: firmware.map(sunpoll_api::FirmwareInfo::version),
        available,
        sensors,
        batteries,
        parent_group: None,
    }
}

// ── Group polling ────────────────────────────────────────────────────

/// Poll every binding of one endpoint, strictly one after another.
async fn poll_group(
    strategy: &dyn PollStrategy,
    group: &EndpointGroup,
    ctx: PollContext,
) -> Vec<PolledBinding> {
    let mut bindings = group.bindings.lock().await;
    let mut out = Vec::with_capacity(bindings.len());
    for binding in bindings.iter_mut() {
        let result = strategy::poll_binding(strategy, binding, group, ctx).await;
        out.push(PolledBinding {
            serial: binding.serial.clone(),
            family: group.family,
            result,
        });
    }
    out
}

/// Close every binding, releasing the shared links behind them.
async fn disconnect_all(topology: &Topology) {
    for group in &topology.groups {
        let mut bindings = group.bindings.lock().await;
        for binding in bindings.iter_mut() {
            binding.transport.close().await;
        }
        debug!(endpoint = %group.endpoint, "endpoint closed");
    }
}

/// Drop the per-cycle cache entries of every binding so the next cycle
/// reads fresh values.
async fn invalidate_readings(topology: &Topology) {
    for group in &topology.groups {
        let bindings = group.bindings.lock().await;
        for binding in bindings.iter() {
            group.cache.invalidate_fast(&binding.serial);
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Poll on a fixed cadence. The first tick fires immediately and is the
/// initial poll.
async fn poll_task(coordinator: Coordinator, tick: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            at = interval.tick() => {
                if let Err(e) = coordinator.run_cycle(Trigger::Scheduled(at)).await {
                    debug!(error = %e, "poll cycle did not publish");
                }
            }
        }
    }
}

async fn deferred_listener_task(coordinator: Coordinator, mut rx: mpsc::Receiver<DeferredOutcome>) {
    let cancel = coordinator.inner.cancel.clone();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outcome = rx.recv() => {
                let Some(outcome) = outcome else { break };
                coordinator.apply_deferred(outcome).await;
            }
        }
    }
}

/// Process commands from the mpsc channel.
async fn command_processor_task(coordinator: Coordinator, mut rx: mpsc::Receiver<CommandEnvelope>) {
    let cancel = coordinator.inner.cancel.clone();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let result = route_command(&coordinator, envelope.command).await;
                let _ = envelope.response_tx.send(result);
            }
        }
    }
}

// ── Command routing ──────────────────────────────────────────────────

async fn route_command(coordinator: &Coordinator, cmd: Command) -> Result<CommandResult, CoreError> {
    match cmd {
        Command::RefreshNow => {
            let topology = coordinator.inner.topology.load_full();
            invalidate_readings(&topology).await;
            coordinator.run_cycle(Trigger::Forced).await?;
            Ok(CommandResult::Ok)
        }

        Command::WriteParameter {
            serial,
            name,
            value,
        } => {
            let param = parameters::numeric(&name)
                .ok_or_else(|| CoreError::UnknownParameter { name: name.clone() })?;
            let raw = param.encode(value)?;
            write_register(coordinator, &serial, param.register, |_| raw).await
        }

        Command::SetFunction {
            serial,
            name,
            enabled,
        } => {
            let bit = parameters::function(&name)
                .ok_or_else(|| CoreError::UnknownParameter { name: name.clone() })?;
            write_register(coordinator, &serial, bit.register, |current| {
                bit.apply(current.unwrap_or(0), enabled)
            })
            .await
        }
    }
}

/// Write one holding register on the device's preferred binding (local
/// before cloud). `value` receives the register's current word when the
/// binding could read it, so bit writes preserve the other bits.
async fn write_register(
    coordinator: &Coordinator,
    serial: &str,
    register: u16,
    value: impl FnOnce(Option<u16>) -> u16 + Send,
) -> Result<CommandResult, CoreError> {
    let topology = coordinator.inner.topology.load_full();
    let timeout = coordinator.config().read_timeout;

    let mut candidates: Vec<&Arc<EndpointGroup>> = Vec::new();
    for group in &topology.groups {
        let bindings = group.bindings.lock().await;
        if bindings.iter().any(|b| b.serial == serial) {
            candidates.push(group);
        }
    }
    candidates.sort_by_key(|g| g.family != Family::Local);
    let Some(group) = candidates.first() else {
        return Err(CoreError::DeviceNotFound {
            serial: serial.to_owned(),
        });
    };

    let mut bindings = group.bindings.lock().await;
    let Some(binding) = bindings.iter_mut().find(|b| b.serial == serial) else {
        return Err(CoreError::DeviceNotFound {
            serial: serial.to_owned(),
        });
    };
    topology
        .strategy(group.family)
        .prepare(binding, &group.failure)
        .await?;

    let current = strategy::bounded(
        timeout,
        binding
            .transport
            .read_parameters(RegisterRange::new(register, 1)),
    )
    .await
    .ok()
    .and_then(|raw: RawParameters| raw.get(&register).copied());
    let word = value(current);

    info!(serial, register, value = word, family = %group.family, "writing register");
    strategy::bounded(timeout, binding.transport.write_register(register, word)).await?;
    drop(bindings);

    for g in &topology.groups {
        g.cache.invalidate_device(serial);
    }
    Ok(CommandResult::Written {
        register,
        value: word,
    })
}

// ── Transport construction ───────────────────────────────────────────

/// Build one binding per configured link, plus the shared cloud client.
pub fn build_bindings(
    config: &CoordinatorConfig,
) -> Result<(Vec<Binding>, Option<Arc<CloudClient>>), CoreError> {
    let cloud = match &config.cloud {
        Some(settings) => {
            let http = HttpConfig {
                tls: settings.tls.clone(),
                timeout: settings.timeout,
                cookie_jar: None,
            };
            let client = CloudClient::new(
                settings.base_url.clone(),
                settings.username.clone(),
                settings.password.clone(),
                &http,
            )?;
            Some(Arc::new(client))
        }
        None => None,
    };

    // Devices behind one gateway share its link.
    let mut tcp_links: HashMap<(String, u16), Arc<ModbusConnection>> = HashMap::new();
    let mut serial_links: HashMap<String, Arc<ModbusConnection>> = HashMap::new();
    let mut dongle_links: HashMap<(String, u16), Arc<DongleConnection>> = HashMap::new();

    let mut bindings = Vec::new();
    for device in &config.devices {
        if device.local.is_none() && !device.cloud {
            return Err(CoreError::Config {
                message: format!("device {} has no local link and cloud polling is off", device.serial),
            });
        }

        if let Some(link) = &device.local {
            let transport: Box<dyn Transport> = match link {
                LocalLink::ModbusTcp {
                    host,
                    port,
                    unit_id,
                } => {
                    let conn = tcp_links
                        .entry((host.clone(), *port))
                        .or_insert_with(|| ModbusConnection::tcp(host.clone(), *port));
                    Box::new(
                        ModbusTransport::new(Arc::clone(conn), *unit_id, device.serial.clone())
                            .with_role(device.role)
                            .with_timeout(config.read_timeout),
                    )
                }
                LocalLink::ModbusSerial {
                    path,
                    baud_rate,
                    unit_id,
                } => {
                    let path = path.to_string_lossy().into_owned();
                    let conn = serial_links
                        .entry(path.clone())
                        .or_insert_with(|| ModbusConnection::serial(path, *baud_rate));
                    Box::new(
                        ModbusTransport::new(Arc::clone(conn), *unit_id, device.serial.clone())
                            .with_role(device.role)
                            .with_timeout(config.read_timeout),
                    )
                }
                LocalLink::Dongle {
                    host,
                    port,
                    datalogger,
                } => {
                    let conn = dongle_links.entry((host.clone(), *port)).or_insert_with(|| {
                        DongleConnection::new(host.clone(), *port, datalogger.clone())
                    });
                    Box::new(
                        DongleTransport::new(
                            Arc::clone(conn),
                            device.serial.clone(),
                            device.serial.clone(),
                        )
                        .with_role(device.role)
                        .with_timeout(config.read_timeout),
                    )
                }
            };
            bindings.push(Binding::new(device.role, transport));
        }

        if device.cloud {
            let Some(client) = &cloud else {
                return Err(CoreError::Config {
                    message: format!(
                        "device {} polls the cloud but no cloud account is configured",
                        device.serial
                    ),
                });
            };
            let transport =
                CloudTransport::new(Arc::clone(client), device.serial.clone()).with_role(device.role);
            bindings.push(Binding::new(device.role, Box::new(transport)));
        }
    }
    Ok((bindings, cloud))
}
