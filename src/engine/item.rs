use std::collections::HashMap;
use log::debug;
use serde::Deserialize;

use super::lookup::LookupTable;
use super::transform::STRING_FORMAT;

/// Placeholder substituted with the sub-unit index of templated items
pub const INDEX_PLACEHOLDER: &str = "%i";

/// Format used for numeric items that do not declare one
pub const DEFAULT_NUMERIC_FORMAT: &str = "%s";

/// How the raw value of an item is turned into published state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    #[default]
    Numeric,
    String,
    /// Feeds tokens into `ups.status`
    Status,
    /// Feeds phrases into `ups.alarm`
    Alarm,
    /// Date part of a combined "date time" value
    Date,
    /// Time part of a combined "date time" value
    Time,
    /// Firmware version, the part after the first space goes to `extra_key`
    Firmware,
    /// Never polled, written on instant-command dispatch
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemFlag {
    Writable,
    Static,
    Indexed,
    Quick,
    NegativeInvalid,
}

impl ItemFlag {
    fn bit(self) -> u16 {
        match self {
            ItemFlag::Writable => 1 << 0,
            ItemFlag::Static => 1 << 1,
            ItemFlag::Indexed => 1 << 2,
            ItemFlag::Quick => 1 << 3,
            ItemFlag::NegativeInvalid => 1 << 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "Vec<ItemFlag>")]
pub struct ItemFlags(u16);

impl ItemFlags {
    pub fn contains(&self, flag: ItemFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn with(self, flag: ItemFlag) -> Self {
        ItemFlags(self.0 | flag.bit())
    }

    pub fn without(self, flag: ItemFlag) -> Self {
        ItemFlags(self.0 & !flag.bit())
    }
}

impl From<Vec<ItemFlag>> for ItemFlags {
    fn from(flags: Vec<ItemFlag>) -> Self {
        flags.into_iter().fold(ItemFlags::default(), |acc, f| acc.with(f))
    }
}

fn default_scale() -> f64 {
    1.0
}

fn default_index_base() -> u32 {
    1
}

/// One row of a driver's declarative item table
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryItem {
    pub key: String,
    #[serde(default)]
    pub locator: String,
    #[serde(default)]
    pub kind: ItemKind,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub extra_key: Option<String>,
    /// Fixed value written by command items
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub max_len: Option<usize>,
    #[serde(default)]
    pub flags: ItemFlags,
    #[serde(default)]
    pub lookup: Option<String>,
    #[serde(default)]
    pub count_key: Option<String>,
    #[serde(default = "default_index_base")]
    pub index_base: u32,
    #[serde(skip)]
    pub index: Option<u32>,
}

impl TelemetryItem {
    pub fn new(key: &str, locator: &str, kind: ItemKind) -> Self {
        TelemetryItem {
            key: key.to_string(),
            locator: locator.to_string(),
            kind,
            scale: 1.0,
            offset: 0.0,
            format: None,
            default: None,
            extra_key: None,
            value: None,
            max_len: None,
            flags: ItemFlags::default(),
            lookup: None,
            count_key: None,
            index_base: 1,
            index: None,
        }
    }

    pub fn is_template(&self) -> bool {
        self.flags.contains(ItemFlag::Indexed) && self.index.is_none()
    }

    /// Concrete item for sub-unit `index`
    pub fn expand(&self, index: u32) -> TelemetryItem {
        TelemetryItem {
            key: expand_placeholder(&self.key, index),
            locator: expand_placeholder(&self.locator, index),
            extra_key: self.extra_key.as_ref().map(|k| expand_placeholder(k, index)),
            value: self.value.as_ref().map(|v| expand_placeholder(v, index)),
            index: Some(index),
            ..self.clone()
        }
    }

    pub fn numeric_format(&self) -> &str {
        match &self.format {
            Some(f) if f != STRING_FORMAT => f,
            _ => DEFAULT_NUMERIC_FORMAT,
        }
    }

    /// Items whose value lands in one of the accumulators rather than their own key
    pub fn is_aggregated(&self) -> bool {
        matches!(self.kind, ItemKind::Status | ItemKind::Alarm)
    }
}

pub fn expand_placeholder(s: &str, index: u32) -> String {
    s.replace(INDEX_PLACEHOLDER, &index.to_string())
}

/// Date part of "date time", everything before the first space
pub fn split_date(raw: &str) -> &str {
    let raw = raw.trim();
    match raw.find(' ') {
        Some(pos) => &raw[..pos],
        None => raw,
    }
}

/// Time part of "date time", between the first and the second space
pub fn split_time(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let rest = &raw[raw.find(' ')? + 1..];
    let time = match rest.find(' ') {
        Some(pos) => &rest[..pos],
        None => rest,
    };
    if time.is_empty() { None } else { Some(time) }
}

/// Firmware strings carry a second version (e.g. the UPS and the interface
/// card) after the first space
pub fn split_firmware(raw: &str) -> (&str, Option<&str>) {
    let raw = raw.trim();
    match raw.split_once(' ') {
        Some((main, rest)) => {
            let rest = rest.trim();
            (main, if rest.is_empty() { None } else { Some(rest) })
        }
        None => (raw, None),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ItemRuntime {
    pub present: bool,
    pub fetched_once: bool,
}

/// Items materialized for one device together with their lookup tables.
///
/// Templates stay in the table, the walker instantiates them once per pass
/// from the live count or the count discovered while building the table.
#[derive(Debug, Clone, Default)]
pub struct ActiveTable {
    pub items: Vec<TelemetryItem>,
    pub lookups: HashMap<String, LookupTable>,
    /// Presence per concrete destination key
    pub runtime: HashMap<String, ItemRuntime>,
    /// Discovered sub-unit count per template key
    pub counts: HashMap<String, u32>,
    pub max_index: u32,
}

impl ActiveTable {
    pub fn new(items: Vec<TelemetryItem>, lookups: HashMap<String, LookupTable>, max_index: u32) -> Self {
        ActiveTable {
            items,
            lookups,
            runtime: HashMap::new(),
            counts: HashMap::new(),
            max_index,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn templates(&self) -> impl Iterator<Item = &TelemetryItem> {
        self.items.iter().filter(|i| i.is_template())
    }

    pub fn lookup_for(&self, item: &TelemetryItem) -> Option<&LookupTable> {
        item.lookup.as_ref().and_then(|name| self.lookups.get(name))
    }

    pub fn count_of(&self, template: &TelemetryItem) -> u32 {
        self.counts.get(&template.key).copied().unwrap_or(0)
    }

    /// Concrete item for `key`, instantiating templates from the known count
    pub fn find(&self, key: &str) -> Option<TelemetryItem> {
        for item in &self.items {
            if !item.is_template() {
                if item.key == key {
                    return Some(item.clone());
                }
                continue;
            }

            let count = self.count_of(item);
            for idx in item.index_base..item.index_base + count {
                if expand_placeholder(&item.key, idx) == key {
                    return Some(item.expand(idx));
                }
            }
        }
        debug!("No item {key} in the active table");
        None
    }

    pub fn find_command(&self, name: &str) -> Option<TelemetryItem> {
        self.find(name).filter(|i| i.kind == ItemKind::Command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_expansion_is_idempotent() {
        let mut item = TelemetryItem::new("outlet.%i.voltage", "X.%i", ItemKind::Numeric);
        item.flags = item.flags.with(ItemFlag::Indexed);
        assert!(item.is_template());

        let first = item.expand(3);
        assert_eq!(first.locator, "X.3");
        assert_eq!(first.key, "outlet.3.voltage");
        assert_eq!(first.index, Some(3));
        assert!(!first.is_template());

        assert_eq!(item.expand(3).locator, first.locator);
        assert_eq!(first.expand(3).locator, "X.3");
    }

    #[test]
    fn test_flags_from_yaml() {
        let yaml = "key: battery.charge\nlocator: Q1:4\nflags: [quick, negative_invalid]\n";
        let item: TelemetryItem = serde_yml::from_str(yaml).unwrap();
        assert!(item.flags.contains(ItemFlag::Quick));
        assert!(item.flags.contains(ItemFlag::NegativeInvalid));
        assert!(!item.flags.contains(ItemFlag::Static));
        assert_eq!(item.scale, 1.0);
        assert_eq!(item.index_base, 1);
        assert_eq!(item.kind, ItemKind::Numeric);
        assert_eq!(item.numeric_format(), DEFAULT_NUMERIC_FORMAT);
    }

    #[test]
    fn test_date_time_split() {
        assert_eq!(split_date("2024/05/01 12:30:00"), "2024/05/01");
        assert_eq!(split_time("2024/05/01 12:30:00"), Some("12:30:00"));
        assert_eq!(split_time("2024/05/01 12:30:00 UTC"), Some("12:30:00"));
        assert_eq!(split_date("2024/05/01"), "2024/05/01");
        assert_eq!(split_time("2024/05/01"), None);
    }

    #[test]
    fn test_firmware_split() {
        assert_eq!(split_firmware("UPS 05.0 NMC 2.1"), ("UPS", Some("05.0 NMC 2.1")));
        assert_eq!(split_firmware("1.02 "), ("1.02", None));
    }

    #[test]
    fn test_find_instantiates_templates() {
        let mut cmd = TelemetryItem::new("outlet.%i.load.off", "holding:%i:1", ItemKind::Command);
        cmd.flags = cmd.flags.with(ItemFlag::Indexed);
        cmd.value = Some("0".to_string());
        let plain = TelemetryItem::new("beeper.disable", "Q", ItemKind::Command);

        let mut table = ActiveTable::new(vec![cmd, plain], HashMap::new(), 64);
        assert!(table.find_command("outlet.2.load.off").is_none());

        table.counts.insert("outlet.%i.load.off".to_string(), 2);
        let found = table.find_command("outlet.2.load.off").unwrap();
        assert_eq!(found.locator, "holding:2:1");
        assert!(table.find_command("outlet.3.load.off").is_none());
        assert_eq!(table.find_command("beeper.disable").unwrap().locator, "Q");
    }
}
