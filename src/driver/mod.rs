//! Lifecycle of one driver process: open the transport, identify the
//! device, build its item table and poll it until asked to stop.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::MissedTickBehavior;

use crate::config::DriverConfig;
use crate::definitions::{generic_model, match_model, DeviceModelEntry, DriverDefinition};
use crate::engine::status::STATUS_KEY;
use crate::engine::transform::{format_value, parse_number};
use crate::engine::walker::{self, PassMode, PollResult};
use crate::engine::{ActiveTable, DriverError, StatusAccumulator, TelemetryItem};
use crate::models::{CommState, DeviceKind};
use crate::mqtt::{StateData, Transmission};
use crate::store::{DeviceState, StateStore};
use crate::transport::DataSource;

pub mod commands;

pub use commands::{CommandResult, DriverRequest};

pub const CHARGE_KEY: &str = "battery.charge";
pub const VOLTAGE_KEY: &str = "battery.voltage";
pub const VOLTAGE_LOW_KEY: &str = "battery.voltage.low";
pub const VOLTAGE_HIGH_KEY: &str = "battery.voltage.high";
pub const LOW_BATTERY_TOKEN: &str = "LB";
pub const ALARM_TOKEN: &str = "ALARM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Init,
    Identify,
    BuildTable,
    SteadyPoll,
    Shutdown,
    Terminated,
    /// The transport could not be opened or the device never answered
    Fatal,
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub name: String,
    pub poll_interval: Duration,
    pub full_poll_every: u32,
    pub max_failures: u32,
    pub identify_retries: Option<u32>,
    pub identify_delay: Option<Duration>,
    pub low_battery_charge: Option<f64>,
    pub comm_lost_token: String,
    pub max_index: u32,
    pub defaults: BTreeMap<String, String>,
    pub overrides: BTreeMap<String, String>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        DriverOptions {
            name: "ups".to_string(),
            poll_interval: Duration::from_secs(2),
            full_poll_every: 1,
            max_failures: 3,
            identify_retries: None,
            identify_delay: None,
            low_battery_charge: None,
            comm_lost_token: "OFF".to_string(),
            max_index: 64,
            defaults: BTreeMap::new(),
            overrides: BTreeMap::new(),
        }
    }
}

impl DriverOptions {
    pub fn from_config(config: &DriverConfig) -> Self {
        DriverOptions {
            name: config.name.clone(),
            poll_interval: Duration::from_secs(config.poll_interval),
            full_poll_every: config.full_poll_every.max(1),
            max_failures: config.max_failures.max(1),
            identify_retries: config.identify_retries,
            identify_delay: config.identify_delay_ms.map(Duration::from_millis),
            low_battery_charge: config.low_battery_charge,
            comm_lost_token: config.comm_lost_token.clone(),
            max_index: config.max_index,
            defaults: config.defaults.clone(),
            overrides: config.overrides.clone(),
        }
    }
}

pub struct Driver<D: DataSource> {
    options: DriverOptions,
    definition: DriverDefinition,
    source: D,
    state: DriverState,
    store: DeviceState,
    table: ActiveTable,
    status: StatusAccumulator,
    alarm: StatusAccumulator,
    model: Option<DeviceModelEntry>,
    estimate_charge: bool,
    passes: u64,
    failures: u32,
    comm: CommState,
    publisher: Option<Sender<Transmission>>,
}

impl<D: DataSource> Driver<D> {
    pub fn new(definition: DriverDefinition, source: D, options: DriverOptions) -> Self {
        Driver {
            options,
            definition,
            source,
            state: DriverState::Init,
            store: DeviceState::new(),
            table: ActiveTable::default(),
            status: StatusAccumulator::status(),
            alarm: StatusAccumulator::alarm(),
            model: None,
            estimate_charge: false,
            passes: 0,
            failures: 0,
            comm: CommState::Ok,
            publisher: None,
        }
    }

    /// Committed state is sent to MQTT after every pass that changed it
    pub fn with_publisher(mut self, publisher: Sender<Transmission>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn store(&self) -> &DeviceState {
        &self.store
    }

    pub fn table(&self) -> &ActiveTable {
        &self.table
    }

    pub fn source(&self) -> &D {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut D {
        &mut self.source
    }

    pub fn model(&self) -> Option<&DeviceModelEntry> {
        self.model.as_ref()
    }

    pub fn comm_state(&self) -> CommState {
        self.comm
    }

    pub fn definition(&self) -> &DriverDefinition {
        &self.definition
    }

    fn fatal(&mut self, message: String) -> DriverError {
        error!("{message}");
        self.state = DriverState::Fatal;
        DriverError::TransportUnreachable(message)
    }

    /// Open the transport, without it there is nothing to monitor
    pub async fn open(&mut self) -> Result<(), DriverError> {
        self.state = DriverState::Init;
        match self.source.connect().await {
            Ok(()) => {
                self.state = DriverState::Identify;
                Ok(())
            }
            Err(e) => Err(self.fatal(format!("Unable to open {}: {e}", self.source.describe()))),
        }
    }

    /// Ask the device who it is. An unknown answer selects the generic
    /// profile, no answer at all within the retry budget is fatal.
    pub async fn identify(&mut self) -> Result<(), DriverError> {
        self.state = DriverState::Identify;
        let Some(spec) = self.definition.identify.clone() else {
            debug!("Definition has no identification request, using the generic profile");
            self.model = Some(generic_model(&self.definition.manufacturer, &self.definition.model));
            self.state = DriverState::BuildTable;
            return Ok(());
        };

        let retries = self.options.identify_retries.unwrap_or(spec.retries).max(1);
        let delay = self.options.identify_delay.unwrap_or(Duration::from_millis(spec.delay_ms));

        for attempt in 1..=retries {
            self.source.begin_pass();
            match self.source.fetch(&spec.locator).await {
                Ok(ident) => {
                    let model = match match_model(&self.definition.models, &ident) {
                        Some(m) => m.clone(),
                        None => {
                            let e = DriverError::UnknownDevice(ident.trim().to_string());
                            warn!("{e}, using the generic {} {} profile", self.definition.manufacturer, self.definition.model);
                            generic_model(&self.definition.manufacturer, &self.definition.model)
                        }
                    };
                    info!("Identified {} {} ({})",
                        model.manufacturer.as_deref().unwrap_or(&self.definition.manufacturer),
                        model.model.as_deref().unwrap_or(&self.definition.model),
                        model.id);
                    self.model = Some(model);
                    self.state = DriverState::BuildTable;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Identification attempt {attempt}/{retries} failed: {e}");
                    if attempt < retries {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(self.fatal(format!("No answer from {} after {retries} attempts", self.source.describe())))
    }

    /// Materialize the item table and publish the static device description
    pub async fn build_table(&mut self) -> Result<(), DriverError> {
        self.state = DriverState::BuildTable;
        self.table = ActiveTable::new(
            self.definition.items.clone(),
            self.definition.lookup_tables(),
            self.options.max_index,
        );
        if self.table.is_empty() {
            warn!("Definition of {} has no items, nothing will be polled", self.options.name);
        } else {
            debug!("Item table of {} has {} entries", self.options.name, self.table.len());
        }

        let templates: Vec<TelemetryItem> = self.table.templates().cloned().collect();
        if !templates.is_empty() {
            self.source.begin_pass();
        }
        for template in templates.iter() {
            let count = match &template.count_key {
                Some(count_key) => self.read_count(count_key).await,
                None => self.probe_count(template).await,
            };
            info!("{} expands to {count} instances", template.key);
            self.table.counts.insert(template.key.clone(), count);
        }

        self.publish_metadata();
        self.estimate_charge = !self.table.items.iter().any(|i| i.key == CHARGE_KEY)
            && self.store.get(VOLTAGE_LOW_KEY).is_some()
            && self.store.get(VOLTAGE_HIGH_KEY).is_some();
        if self.estimate_charge {
            info!("Device reports no charge, estimating it from the battery voltage");
        }

        self.state = DriverState::SteadyPoll;
        Ok(())
    }

    async fn read_count(&mut self, count_key: &str) -> u32 {
        let Some(item) = self.table.items.iter().find(|i| i.key == count_key && !i.is_template()).cloned() else {
            warn!("Count item {count_key} is not part of the table");
            return 0;
        };

        let count = match self.source.fetch(&item.locator).await {
            Ok(raw) => parse_number(&raw).map(|v| (v * item.scale + item.offset).max(0.0) as u32),
            Err(e) => Err(e),
        };
        match count {
            Ok(c) => c.min(self.options.max_index),
            Err(e) => {
                warn!("Unable to read {count_key}: {e}");
                0
            }
        }
    }

    /// Sequential indices until the first one that does not answer
    async fn probe_count(&mut self, template: &TelemetryItem) -> u32 {
        let mut count = 0;
        while count < self.options.max_index {
            let item = template.expand(template.index_base + count);
            match self.source.fetch(&item.locator).await {
                Ok(_) => count += 1,
                Err(e) => {
                    debug!("Probing {} stopped: {e}", item.locator);
                    break;
                }
            }
        }
        count
    }

    fn publish_metadata(&mut self) {
        let kind = self.definition.kind;
        let (mfr, model, values) = match &self.model {
            Some(m) => (
                m.manufacturer.clone().unwrap_or_else(|| self.definition.manufacturer.clone()),
                m.model.clone().unwrap_or_else(|| self.definition.model.clone()),
                m.values.clone(),
            ),
            None => (self.definition.manufacturer.clone(), self.definition.model.clone(), BTreeMap::new()),
        };

        self.store.set("driver.name", env!("CARGO_PKG_NAME"));
        self.store.set("driver.version", env!("CARGO_PKG_VERSION"));
        self.store.set("driver.parameter.pollinterval", &self.options.poll_interval.as_secs().to_string());
        self.store.set("device.type", &kind.to_string());
        self.store.set("device.mfr", &mfr);
        self.store.set("device.model", &model);
        if kind == DeviceKind::Ups {
            self.store.set("ups.mfr", &mfr);
            self.store.set("ups.model", &model);
        }
        for (key, value) in values.iter() {
            self.store.set(key, value);
        }
        for (key, value) in self.options.defaults.iter() {
            if self.store.get(key).is_none() {
                self.store.set(key, value);
            }
        }
    }

    /// Open, identify and build the table in one go
    pub async fn start(&mut self) -> Result<(), DriverError> {
        self.open().await?;
        self.identify().await?;
        self.build_table().await?;
        self.publish().await;
        Ok(())
    }

    fn pass_mode(&self) -> PassMode {
        if (self.passes - 1) % u64::from(self.options.full_poll_every.max(1)) == 0 {
            PassMode::Full
        } else {
            PassMode::Quick
        }
    }

    /// One walk over the table bracketed by init and commit of the status words
    pub async fn poll_once(&mut self) -> Result<PollResult, DriverError> {
        self.passes += 1;
        let mode = self.pass_mode();

        self.status.init();
        self.alarm.init();
        let outcome = walker::poll(
            &mut self.table,
            &mut self.source,
            &mut self.store,
            &mut self.status,
            &mut self.alarm,
            mode,
        )
        .await;

        let result = match outcome {
            Ok(result) if result.comm_ok() => result,
            Ok(result) => {
                warn!("No answer from the device during pass {}", self.passes);
                self.status.rollback();
                self.alarm.rollback();
                self.pass_failed();
                self.publish().await;
                return Ok(result);
            }
            Err(e) => {
                warn!("Pass {} aborted: {e}", self.passes);
                self.status.rollback();
                self.alarm.rollback();
                self.pass_failed();
                self.publish().await;
                return Err(e);
            }
        };

        self.pass_succeeded();
        self.refresh_counts();
        self.apply_overrides();
        if self.estimate_charge {
            self.estimate_battery_charge();
        }
        self.apply_defaults();
        self.override_low_battery();

        if !self.alarm.is_empty() {
            self.status.set(ALARM_TOKEN);
        }
        self.alarm.commit(&mut self.store);
        if self.status.is_empty() {
            if let Some(token) = &self.definition.empty_status {
                self.status.set(token);
            }
        }
        let word = self.status.commit(&mut self.store);
        debug!("Pass {} ({:?}) committed status {word:?}", self.passes, mode);

        self.publish().await;
        Ok(result)
    }

    fn pass_failed(&mut self) {
        self.failures += 1;
        self.store.mark_stale();
        if self.comm == CommState::Ok {
            self.comm = CommState::Stale;
        }

        if self.failures >= self.options.max_failures && self.comm != CommState::Lost {
            error!("Communication with {} lost after {} failed passes", self.options.name, self.failures);
            self.comm = CommState::Lost;
            self.status.init();
            self.status.set(&self.options.comm_lost_token);
            self.status.commit(&mut self.store);
        }
    }

    fn pass_succeeded(&mut self) {
        if self.comm == CommState::Lost {
            info!("Communication with {} restored", self.options.name);
        }
        self.failures = 0;
        self.comm = CommState::Ok;
        self.store.mark_ok();
    }

    /// Templates with a count item follow the live count
    fn refresh_counts(&mut self) {
        let live: Vec<(String, u32)> = self
            .table
            .templates()
            .filter_map(|t| {
                let key = t.count_key.as_ref()?;
                let count = parse_number(self.store.get(key)?).ok()?;
                Some((t.key.clone(), (count.max(0.0) as u32).min(self.options.max_index)))
            })
            .collect();
        for (key, count) in live {
            self.table.counts.insert(key, count);
        }
    }

    fn apply_overrides(&mut self) {
        for (key, value) in self.options.overrides.iter() {
            if key == STATUS_KEY || key == self.alarm.key() {
                continue;
            }
            self.store.set(key, value);
        }
    }

    fn apply_defaults(&mut self) {
        for (key, value) in self.options.defaults.iter() {
            if self.store.get(key).is_none() {
                self.store.set(key, value);
            }
        }
    }

    fn estimate_battery_charge(&mut self) {
        let number = |key: &str| self.store.get(key).and_then(|v| parse_number(v).ok());
        let (Some(voltage), Some(low), Some(high)) = (number(VOLTAGE_KEY), number(VOLTAGE_LOW_KEY), number(VOLTAGE_HIGH_KEY)) else {
            self.store.delete(CHARGE_KEY);
            return;
        };

        match estimate_charge(voltage, low, high).and_then(|c| format_value(c, "%.0f").ok()) {
            Some(charge) => self.store.set(CHARGE_KEY, &charge),
            None => self.store.delete(CHARGE_KEY),
        }
    }

    /// A configured threshold decides LB on its own, whatever the device says
    fn override_low_battery(&mut self) {
        let Some(threshold) = self.options.low_battery_charge else {
            return;
        };
        let Some(charge) = self.store.get(CHARGE_KEY).and_then(|v| parse_number(v).ok()) else {
            return;
        };

        if charge <= threshold {
            if !self.status.contains(LOW_BATTERY_TOKEN) {
                debug!("Charge {charge} at or below {threshold}, setting {LOW_BATTERY_TOKEN}");
            }
            self.status.set(LOW_BATTERY_TOKEN);
        } else if self.status.contains(LOW_BATTERY_TOKEN) {
            debug!("Charge {charge} above {threshold}, ignoring the device's {LOW_BATTERY_TOKEN}");
            self.status.unset(LOW_BATTERY_TOKEN);
        }
    }

    async fn publish(&mut self) {
        if !self.store.take_changed() {
            return;
        }
        let Some(publisher) = &self.publisher else {
            return;
        };

        let data = StateData {
            name: self.options.name.clone(),
            timestamp: chrono::Utc::now(),
            stale: self.store.is_stale(),
            comm: self.comm,
            values: self.store.snapshot(),
        };
        if publisher.send(Transmission::State(data)).await.is_err() {
            warn!("MQTT publisher is gone, state of {} not sent", self.options.name);
        }
    }

    /// Poll at the configured interval and serve requests between passes
    /// until stopped. Returns after a shutdown sequence or a stop request.
    pub async fn run(&mut self, mut requests: Receiver<DriverRequest>) -> Result<(), DriverError> {
        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut requests_open = true;

        info!("{} polling {} every {:?}", self.options.name, self.source.describe(), self.options.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        debug!("Pass failed: {e}");
                    }
                }
                request = requests.recv(), if requests_open => {
                    match request {
                        None => {
                            debug!("Request channel closed, polling only");
                            requests_open = false;
                        }
                        Some(request) => {
                            if let ControlFlow::Break(result) = self.handle_request(request).await {
                                return result;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Linear charge estimate between the empty and full battery voltage
pub fn estimate_charge(voltage: f64, low: f64, high: f64) -> Option<f64> {
    if high <= low {
        return None;
    }
    Some(((voltage - low) / (high - low) * 100.0).clamp(0.0, 100.0))
}
