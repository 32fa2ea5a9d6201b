use std::collections::HashMap;
use log::{debug, info, warn};

use super::item::{split_date, split_firmware, split_time, ActiveTable, ItemFlag, ItemKind, ItemRuntime, TelemetryItem};
use super::lookup::LookupTable;
use super::status::StatusAccumulator;
use super::transform::{format_value, parse_number, scale_value, transform_string, STRING_FORMAT};
use super::DriverError;
use crate::store::StateStore;
use crate::transport::DataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    /// Every item of the table
    Full,
    /// Only items flagged `quick`
    Quick,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollResult {
    pub attempted: u32,
    pub written: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Keys removed from the store because their item failed
    pub stale_keys: Vec<String>,
    pub transport_failures: u32,
}

impl PollResult {
    /// The device answered at least one request of the pass
    pub fn comm_ok(&self) -> bool {
        self.attempted == 0 || self.transport_failures < self.attempted
    }
}

/// Walk `table` once in declaration order.
///
/// Failing items are contained: their key is removed from the store and the
/// walk continues. Only a framing error aborts the pass, the caller is
/// expected to roll back both accumulators then.
pub async fn poll<D: DataSource, S: StateStore>(
    table: &mut ActiveTable,
    source: &mut D,
    store: &mut S,
    status: &mut StatusAccumulator,
    alarm: &mut StatusAccumulator,
    mode: PassMode,
) -> Result<PollResult, DriverError> {
    source.begin_pass();

    let ActiveTable { items, lookups, runtime, counts, max_index } = table;
    let mut pass = Pass {
        source,
        store,
        status,
        alarm,
        lookups,
        runtime,
        result: PollResult::default(),
    };

    for item in items.iter() {
        if item.kind == ItemKind::Command {
            continue;
        }
        if mode == PassMode::Quick && !item.flags.contains(ItemFlag::Quick) {
            pass.result.skipped += 1;
            continue;
        }

        if !item.is_template() {
            pass.walk_item(item).await?;
            continue;
        }

        let count = template_count(item, &*pass.store, counts, *max_index);
        for idx in item.index_base..item.index_base + count {
            pass.walk_item(&item.expand(idx)).await?;
        }
    }

    Ok(pass.result)
}

/// Live count from the count item of this pass, else the one found while
/// building the table
fn template_count<S: StateStore>(item: &TelemetryItem, store: &S, counts: &HashMap<String, u32>, max: u32) -> u32 {
    let live = item
        .count_key
        .as_ref()
        .and_then(|k| store.get(k))
        .and_then(|v| parse_number(v).ok())
        .filter(|n| *n >= 0.0)
        .map(|n| n as u32);

    let count = live.or_else(|| counts.get(&item.key).copied()).unwrap_or(0);
    if count > max {
        warn!("{} reports {count} instances, only walking {max}", item.key);
        return max;
    }
    count
}

struct Pass<'a, D, S> {
    source: &'a mut D,
    store: &'a mut S,
    status: &'a mut StatusAccumulator,
    alarm: &'a mut StatusAccumulator,
    lookups: &'a HashMap<String, LookupTable>,
    runtime: &'a mut HashMap<String, ItemRuntime>,
    result: PollResult,
}

impl<'a, D: DataSource, S: StateStore> Pass<'a, D, S> {
    async fn walk_item(&mut self, item: &TelemetryItem) -> Result<(), DriverError> {
        let rt = self.runtime.get(&item.key).copied().unwrap_or_default();
        if item.flags.contains(ItemFlag::Static) && rt.fetched_once {
            self.result.skipped += 1;
            return Ok(());
        }

        self.result.attempted += 1;
        let outcome = match self.source.fetch(&item.locator).await {
            Ok(raw) => self.apply(item, &raw),
            Err(e @ DriverError::ProtocolFraming(_)) => {
                warn!("{} aborted the pass: {e}", item.key);
                return Err(e);
            }
            Err(e) => {
                if e.is_transport() {
                    self.result.transport_failures += 1;
                }
                Err(e)
            }
        };

        let entry = self.runtime.entry(item.key.clone()).or_default();
        match outcome {
            Ok(()) => {
                if !entry.present && entry.fetched_once {
                    info!("{} is available again", item.key);
                }
                entry.present = true;
                entry.fetched_once = true;
                self.result.written += 1;
            }
            Err(e) => {
                if entry.present {
                    info!("{} disappeared: {e}", item.key);
                } else {
                    debug!("{} not available: {e}", item.key);
                }
                entry.present = false;
                self.absent(item);
            }
        }
        Ok(())
    }

    /// The item could not be read, its value must not linger in the store
    fn absent(&mut self, item: &TelemetryItem) {
        self.result.failed += 1;
        if item.is_aggregated() {
            return;
        }

        match &item.default {
            Some(default) => self.store.set(&item.key, default),
            None => {
                self.store.delete(&item.key);
                self.result.stale_keys.push(item.key.clone());
            }
        }
        if let Some(extra) = &item.extra_key {
            self.store.delete(extra);
        }
    }

    fn lookup_of(&self, item: &TelemetryItem) -> Result<Option<&'a LookupTable>, DriverError> {
        let lookups: &'a HashMap<String, LookupTable> = self.lookups;
        match &item.lookup {
            None => Ok(None),
            Some(name) => lookups
                .get(name)
                .map(Some)
                .ok_or_else(|| DriverError::Definition(format!("lookup table {name} of {} is missing", item.key))),
        }
    }

    fn apply(&mut self, item: &TelemetryItem, raw: &str) -> Result<(), DriverError> {
        if item.flags.contains(ItemFlag::NegativeInvalid) && parse_number(raw)? < 0.0 {
            return Err(DriverError::BadValue(format!("negative value {raw} means not available")));
        }

        let table = self.lookup_of(item)?;

        match item.kind {
            ItemKind::Status | ItemKind::Alarm => {
                let resolved: Option<Vec<String>> = match table {
                    Some(t) => t.resolve(raw).map(|tokens| tokens.into_iter().map(str::to_string).collect()),
                    None => Some(vec![raw.trim().to_string()]),
                };
                let tokens: Vec<String> = match (resolved, &item.default) {
                    (Some(tokens), _) => tokens,
                    (None, Some(default)) => vec![default.clone()],
                    (None, None) => {
                        return Err(DriverError::BadValue(format!("{raw:?} has no status mapping")));
                    }
                };

                let accumulator = if item.kind == ItemKind::Status { &mut *self.status } else { &mut *self.alarm };
                for token in tokens.iter().filter(|t| !t.is_empty()) {
                    accumulator.set(token);
                }
                Ok(())
            }
            ItemKind::Numeric => {
                let value = match table {
                    Some(t) => match (t.lookup(raw), &item.default) {
                        (Some(token), _) => token.to_string(),
                        (None, Some(default)) => default.clone(),
                        (None, None) => return Err(DriverError::BadValue(format!("{raw:?} not in table {}", t.name))),
                    },
                    None if item.format.as_deref() == Some(STRING_FORMAT) => transform_string(raw, item.max_len),
                    /* a scale of zero publishes the format string as a constant */
                    None if item.scale == 0.0 => item.numeric_format().to_string(),
                    None => format_value(scale_value(raw, item.scale, item.offset)?, item.numeric_format())?,
                };
                self.store.set(&item.key, &value);
                Ok(())
            }
            ItemKind::String => {
                let value = match table.and_then(|t| t.lookup(raw)) {
                    Some(token) => token.to_string(),
                    None => transform_string(raw, item.max_len),
                };
                self.store.set(&item.key, &value);
                Ok(())
            }
            ItemKind::Date => {
                self.store.set(&item.key, split_date(raw));
                Ok(())
            }
            ItemKind::Time => {
                let time = split_time(raw).ok_or_else(|| DriverError::BadValue(format!("no time in {raw:?}")))?;
                self.store.set(&item.key, time);
                Ok(())
            }
            ItemKind::Firmware => {
                let (main, rest) = split_firmware(raw);
                self.store.set(&item.key, &transform_string(main, item.max_len));
                if let (Some(extra), Some(rest)) = (&item.extra_key, rest) {
                    self.store.set(extra, rest);
                }
                Ok(())
            }
            ItemKind::Command => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lookup::{LookupEntry, LookupKey};
    use crate::engine::status::STATUS_KEY;
    use crate::store::DeviceState;
    use crate::transport::MemorySource;

    fn numeric(key: &str, locator: &str) -> TelemetryItem {
        let mut item = TelemetryItem::new(key, locator, ItemKind::Numeric);
        item.format = Some("%.1f".to_string());
        item
    }

    fn status_item(locator: &str, table: &str) -> TelemetryItem {
        let mut item = TelemetryItem::new(STATUS_KEY, locator, ItemKind::Status);
        item.lookup = Some(table.to_string());
        item
    }

    fn tables() -> HashMap<String, LookupTable> {
        let entry = |raw: &str, token: &str| LookupEntry { raw: LookupKey::Text(raw.to_string()), token: token.to_string() };
        let mut lookups = HashMap::new();
        lookups.insert("utility".to_string(), LookupTable::new("utility", vec![entry("0", "OL"), entry("1", "OB")]));
        lookups.insert("battery".to_string(), LookupTable::new("battery", vec![entry("0", ""), entry("1", "LB")]));
        lookups
    }

    async fn walk(table: &mut ActiveTable, source: &mut MemorySource, store: &mut DeviceState, mode: PassMode) -> Result<PollResult, DriverError> {
        let mut status = StatusAccumulator::status();
        let mut alarm = StatusAccumulator::alarm();
        status.init();
        alarm.init();
        let result = poll(table, source, store, &mut status, &mut alarm, mode).await;
        match &result {
            Ok(_) => {
                status.commit(store);
                alarm.commit(store);
            }
            Err(_) => {
                status.rollback();
                alarm.rollback();
            }
        }
        result
    }

    #[tokio::test]
    async fn test_failed_item_does_not_abort_pass() {
        let mut table = ActiveTable::new(
            vec![numeric("input.voltage", "a"), numeric("output.voltage", "b"), numeric("battery.voltage", "c")],
            HashMap::new(),
            64,
        );
        let mut source = MemorySource::with_values([("a", "230"), ("b", "229"), ("c", "13.6")]);
        let mut store = DeviceState::new();

        walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        assert_eq!(store.get("output.voltage"), Some("229.0"));

        source.fail("b", DriverError::TransportTimeout("b".to_string()));
        let result = walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        assert_eq!(store.get("input.voltage"), Some("230.0"));
        assert_eq!(store.get("output.voltage"), None);
        assert_eq!(store.get("battery.voltage"), Some("13.6"));
        assert_eq!(result.attempted, 3);
        assert_eq!(result.written, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.stale_keys, vec!["output.voltage".to_string()]);
        assert!(result.comm_ok());
    }

    #[tokio::test]
    async fn test_status_tokens_follow_table_order() {
        let mut table = ActiveTable::new(
            vec![status_item("util", "utility"), status_item("batt", "battery"), status_item("util2", "utility")],
            tables(),
            64,
        );
        let mut source = MemorySource::with_values([("util", "1"), ("batt", "1"), ("util2", "0")]);
        let mut store = DeviceState::new();

        walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        assert_eq!(store.get(STATUS_KEY), Some("OB LB OL"));

        source.set("batt", "0");
        source.set("util2", "1");
        walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        assert_eq!(store.get(STATUS_KEY), Some("OB"));
    }

    #[tokio::test]
    async fn test_unmapped_status_uses_default() {
        let mut item = status_item("util", "utility");
        item.default = Some("OFF".to_string());
        let mut table = ActiveTable::new(vec![item, status_item("batt", "battery")], tables(), 64);
        let mut source = MemorySource::with_values([("util", "7"), ("batt", "9")]);
        let mut store = DeviceState::new();

        let result = walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        assert_eq!(store.get(STATUS_KEY), Some("OFF"));
        assert_eq!(result.failed, 1);
    }

    #[tokio::test]
    async fn test_framing_error_aborts_and_rolls_back() {
        let mut table = ActiveTable::new(
            vec![status_item("util", "utility"), numeric("input.voltage", "a")],
            tables(),
            64,
        );
        let mut source = MemorySource::with_values([("util", "0"), ("a", "230")]);
        let mut store = DeviceState::new();
        walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();

        source.set("util", "1");
        source.fail("a", DriverError::ProtocolFraming("short".to_string()));
        let result = walk(&mut table, &mut source, &mut store, PassMode::Full).await;
        assert!(matches!(result, Err(DriverError::ProtocolFraming(_))));
        assert_eq!(store.get(STATUS_KEY), Some("OL"));
    }

    #[tokio::test]
    async fn test_static_items_fetched_once() {
        let mut model = TelemetryItem::new("ups.model", "model", ItemKind::String);
        model.flags = model.flags.with(ItemFlag::Static);
        let mut table = ActiveTable::new(vec![model], HashMap::new(), 64);
        let mut source = MemorySource::with_values([("model", "Smart-UPS 1500")]);
        let mut store = DeviceState::new();

        walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        source.fail("model", DriverError::TransportTimeout("model".to_string()));
        let result = walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();

        assert_eq!(result.skipped, 1);
        assert_eq!(result.failed, 0);
        assert_eq!(store.get("ups.model"), Some("Smart-UPS 1500"));
        assert_eq!(source.fetched.len(), 1);
    }

    #[tokio::test]
    async fn test_templates_use_count_of_same_pass() {
        let mut count = numeric("outlet.count", "count");
        count.format = Some("%d".to_string());
        let mut outlet = numeric("outlet.%i.current", "cur.%i");
        outlet.flags = outlet.flags.with(ItemFlag::Indexed);
        outlet.count_key = Some("outlet.count".to_string());

        let mut table = ActiveTable::new(vec![count, outlet], HashMap::new(), 64);
        let mut source = MemorySource::with_values([("count", "2"), ("cur.1", "0.5"), ("cur.2", "1.5"), ("cur.3", "9")]);
        let mut store = DeviceState::new();

        walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        assert_eq!(store.get("outlet.1.current"), Some("0.5"));
        assert_eq!(store.get("outlet.2.current"), Some("1.5"));
        assert_eq!(store.get("outlet.3.current"), None);

        source.set("count", "3");
        walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        assert_eq!(store.get("outlet.3.current"), Some("9.0"));
    }

    #[tokio::test]
    async fn test_quick_pass_and_commands() {
        let mut charge = numeric("battery.charge", "charge");
        charge.flags = charge.flags.with(ItemFlag::Quick);
        let mut cmd = TelemetryItem::new("test.battery.start", "T", ItemKind::Command);
        cmd.value = Some("".to_string());
        let mut table = ActiveTable::new(vec![charge, numeric("input.voltage", "a"), cmd], HashMap::new(), 64);
        let mut source = MemorySource::with_values([("charge", "97"), ("a", "230")]);
        let mut store = DeviceState::new();

        let result = walk(&mut table, &mut source, &mut store, PassMode::Quick).await.unwrap();
        assert_eq!(result.attempted, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(store.get("input.voltage"), None);
        assert!(!source.fetched.contains(&"T".to_string()));
    }

    #[tokio::test]
    async fn test_kind_specific_values() {
        let mut negative = numeric("ambient.temperature", "temp");
        negative.flags = negative.flags.with(ItemFlag::NegativeInvalid);
        let mut constant = numeric("ups.type", "none");
        constant.scale = 0.0;
        constant.format = Some("online".to_string());
        let mut firmware = TelemetryItem::new("ups.firmware", "fw", ItemKind::Firmware);
        firmware.extra_key = Some("ups.firmware.aux".to_string());
        let date = TelemetryItem::new("ups.date", "clock", ItemKind::Date);
        let time = TelemetryItem::new("ups.time", "clock", ItemKind::Time);
        let mut alarm = TelemetryItem::new("ups.alarm", "alarm", ItemKind::Alarm);
        alarm.default = Some("Unknown alarm".to_string());

        let mut table = ActiveTable::new(vec![negative, constant, firmware, date, time, alarm], HashMap::new(), 64);
        let mut source = MemorySource::with_values([
            ("temp", "-1"),
            ("none", ""),
            ("fw", "UPS 09.3 ID18"),
            ("clock", "2024/05/01 12:30:00"),
            ("alarm", "Replace battery!"),
        ]);
        let mut store = DeviceState::new();

        walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        assert_eq!(store.get("ambient.temperature"), None);
        assert_eq!(store.get("ups.type"), Some("online"));
        assert_eq!(store.get("ups.firmware"), Some("UPS"));
        assert_eq!(store.get("ups.firmware.aux"), Some("09.3 ID18"));
        assert_eq!(store.get("ups.date"), Some("2024/05/01"));
        assert_eq!(store.get("ups.time"), Some("12:30:00"));
        assert_eq!(store.get("ups.alarm"), Some("Replace battery!"));
    }

    #[tokio::test]
    async fn test_string_format_copies_raw_value() {
        let mut serial = TelemetryItem::new("ups.serial", "serial", ItemKind::Numeric);
        serial.format = Some(STRING_FORMAT.to_string());
        let mut table = ActiveTable::new(vec![serial], HashMap::new(), 64);
        let mut source = MemorySource::with_values([("serial", "AS1234")]);
        let mut store = DeviceState::new();

        let result = walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        assert_eq!(result.failed, 0);
        assert_eq!(store.get("ups.serial"), Some("AS1234"));
    }

    #[tokio::test]
    async fn test_default_replaces_absent_value() {
        let mut item = numeric("battery.runtime.low", "lowrt");
        item.default = Some("120".to_string());
        let mut table = ActiveTable::new(vec![item], HashMap::new(), 64);
        let mut source = MemorySource::new();
        let mut store = DeviceState::new();

        let result = walk(&mut table, &mut source, &mut store, PassMode::Full).await.unwrap();
        assert_eq!(store.get("battery.runtime.low"), Some("120"));
        assert!(result.stale_keys.is_empty());
    }
}
