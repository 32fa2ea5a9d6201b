//! Driver definitions: the declarative item table of one device family,
//! its lookup tables and the models it knows how to identify.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Deserialize;

use crate::engine::item::INDEX_PLACEHOLDER;
use crate::engine::transform::validate_format;
use crate::engine::{DriverError, ItemFlag, ItemKind, LookupTable, TelemetryItem};
use crate::models::{DeviceKind, DeviceProtocol};

pub mod models;

pub use models::{generic_model, match_model, DeviceModelEntry, Matching};

/// User provided definitions are used first
const DEFINITION_DIRS: [&str; 2] = ["config/defs", "defs"];

fn identify_retries_default() -> u32 { 3 }
fn identify_delay_default() -> u64 { 1000 }

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdentifySpec {
    pub locator: String,
    #[serde(default = "identify_retries_default")]
    pub retries: u32,
    #[serde(default = "identify_delay_default")]
    pub delay_ms: u64,
}

/// Command items run on shutdown, depending on the power source at that time
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ShutdownSpec {
    #[serde(default)]
    pub on_line: Vec<String>,
    #[serde(default)]
    pub on_battery: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverDefinition {
    pub manufacturer: String,
    pub model: String,
    #[serde(default)]
    pub kind: DeviceKind,
    #[serde(default)]
    pub protocol: DeviceProtocol,
    #[serde(default)]
    pub identify: Option<IdentifySpec>,
    #[serde(default)]
    pub models: Vec<DeviceModelEntry>,
    #[serde(default)]
    pub lookups: Vec<LookupTable>,
    pub items: Vec<TelemetryItem>,
    #[serde(default)]
    pub shutdown: Option<ShutdownSpec>,
    /// Status word published when a pass produced no token
    #[serde(default)]
    pub empty_status: Option<String>,
}

impl DriverDefinition {
    /// Lookup tables by name with their fallbacks linked
    pub fn lookup_tables(&self) -> HashMap<String, LookupTable> {
        self.lookups.iter().map(|t| (t.name.clone(), t.clone())).collect()
    }

    pub fn command(&self, name: &str) -> Option<&TelemetryItem> {
        self.items.iter().find(|i| i.kind == ItemKind::Command && i.key == name)
    }
}

pub fn parse_definition(contents: &str) -> Result<DriverDefinition, DriverError> {
    let mut def: DriverDefinition =
        serde_yml::from_str(contents).map_err(|e| DriverError::Definition(e.to_string()))?;

    if def.items.is_empty() {
        return Err(DriverError::Definition(format!("{} {} declares no items", def.manufacturer, def.model)));
    }

    def.lookups = dedup_tables(std::mem::take(&mut def.lookups))?;
    for table in def.lookups.iter() {
        let dupes = table.duplicate_keys();
        if !dupes.is_empty() {
            warn!("Lookup table {} maps {:?} more than once, the first entry is used", table.name, dupes);
        }
    }
    def.lookups = link_fallbacks(&def.lookups)?;

    let names: HashSet<&str> = def.lookups.iter().map(|t| t.name.as_str()).collect();
    let mut seen_keys: HashSet<&str> = HashSet::new();
    for item in def.items.iter() {
        check_item(item, &names)?;
        if !item.is_aggregated() && !seen_keys.insert(item.key.as_str()) {
            warn!("{} is declared more than once, later values overwrite earlier ones", item.key);
        }
    }

    if let Some(shutdown) = &def.shutdown {
        for name in shutdown.on_line.iter().chain(shutdown.on_battery.iter()) {
            if def.command(name).is_none() {
                return Err(DriverError::Definition(format!("shutdown step {name} is not a command item")));
            }
        }
    }

    Ok(def)
}

/// A table declared twice with the same content is tolerated
fn dedup_tables(tables: Vec<LookupTable>) -> Result<Vec<LookupTable>, DriverError> {
    let mut result: Vec<LookupTable> = Vec::new();
    for table in tables {
        match result.iter().find(|t| t.name == table.name) {
            Some(known) if known.same_content(&table) => {
                warn!("Lookup table {} is declared twice with identical content", table.name);
            }
            Some(_) => {
                return Err(DriverError::Definition(format!("lookup table {} is declared twice with different content", table.name)));
            }
            None => result.push(table),
        }
    }
    Ok(result)
}

fn link_fallbacks(tables: &[LookupTable]) -> Result<Vec<LookupTable>, DriverError> {
    let by_name: HashMap<&str, &LookupTable> = tables.iter().map(|t| (t.name.as_str(), t)).collect();

    fn resolve(
        table: &LookupTable,
        by_name: &HashMap<&str, &LookupTable>,
        visiting: &mut Vec<String>,
    ) -> Result<LookupTable, DriverError> {
        if visiting.contains(&table.name) {
            return Err(DriverError::Definition(format!("lookup fallback loop through {}", visiting.join(" -> "))));
        }
        let mut resolved = table.clone();
        if let Some(next) = &table.fallback {
            let next = by_name
                .get(next.as_str())
                .ok_or_else(|| DriverError::Definition(format!("fallback table {next} of {} is missing", table.name)))?;
            visiting.push(table.name.clone());
            resolved.chained = Some(Box::new(resolve(next, by_name, visiting)?));
            visiting.pop();
        }
        Ok(resolved)
    }

    tables.iter().map(|t| resolve(t, &by_name, &mut Vec::new())).collect()
}

fn check_item(item: &TelemetryItem, tables: &HashSet<&str>) -> Result<(), DriverError> {
    let bad = |what: String| Err(DriverError::Definition(format!("item {}: {what}", item.key)));

    if item.key.is_empty() {
        return Err(DriverError::Definition("item without key".to_string()));
    }
    if item.kind != ItemKind::Command && item.locator.is_empty() && item.scale != 0.0 {
        return bad("no locator".to_string());
    }
    if let Some(name) = &item.lookup {
        if !tables.contains(name.as_str()) {
            return bad(format!("lookup table {name} is not declared"));
        }
    }
    if item.kind == ItemKind::Numeric && item.scale != 0.0 && item.lookup.is_none() {
        if let Some(format) = &item.format {
            validate_format(format)?;
        }
    }
    if item.flags.contains(ItemFlag::Indexed) && !item.key.contains(INDEX_PLACEHOLDER) {
        return bad(format!("indexed items need {INDEX_PLACEHOLDER} in their key"));
    }
    if item.flags.contains(ItemFlag::Indexed) && item.kind == ItemKind::Command && item.count_key.is_none() {
        return bad("indexed commands can not be probed and need a count_key".to_string());
    }
    if item.kind == ItemKind::Firmware && item.extra_key.is_none() {
        warn!("Firmware item {} has no extra_key, the second version is dropped", item.key);
    }
    Ok(())
}

fn read_definition(path: &Path) -> Result<DriverDefinition, DriverError> {
    let mut contents = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .map_err(|e| DriverError::Definition(format!("Unable to read {}: {e}", path.display())))?;
    parse_definition(&contents)
        .map_err(|e| DriverError::Definition(format!("{}: {e}", path.display())))
}

pub fn load_definition_from(dirs: &[PathBuf], name: &str) -> Result<DriverDefinition, DriverError> {
    for dir in dirs {
        let path = dir.join(format!("{name}.yaml"));
        if path.exists() {
            info!("Loading definition {}", path.display());
            return read_definition(&path);
        }
    }
    Err(DriverError::Definition(format!("definition of {name} not found")))
}

pub fn load_definition(name: &str) -> Result<DriverDefinition, DriverError> {
    let dirs: Vec<PathBuf> = DEFINITION_DIRS.iter().map(PathBuf::from).collect();
    load_definition_from(&dirs, name)
}
