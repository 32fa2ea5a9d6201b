use log::debug;
use serde::Deserialize;

/// Raw key that selects the default entry of a table
pub const DEFAULT_KEY: &str = "_";

/// Raw side of a lookup entry, either a protocol integer or a literal string
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LookupKey {
    Int(i64),
    Text(String),
}

impl LookupKey {
    pub fn is_default(&self) -> bool {
        matches!(self, LookupKey::Text(t) if t == DEFAULT_KEY)
    }

    pub fn matches(&self, raw: &str) -> bool {
        let raw = raw.trim();
        match self {
            LookupKey::Int(n) => match raw.parse::<i64>() {
                Ok(v) => v == *n,
                Err(_) => raw.parse::<f64>().map(|v| v == *n as f64).unwrap_or(false),
            },
            LookupKey::Text(t) => !self.is_default() && t == raw,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            LookupKey::Int(n) => Some(*n),
            LookupKey::Text(t) => t.parse().ok(),
        }
    }

    pub fn to_raw_string(&self) -> String {
        match self {
            LookupKey::Int(n) => n.to_string(),
            LookupKey::Text(t) => t.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LookupEntry {
    pub raw: LookupKey,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupMode {
    /// First entry whose raw value equals the input wins
    #[default]
    Exact,
    /// Every entry whose bits are all set in the input contributes
    Bitmask,
}

/// Ordered table translating raw protocol values into normalized tokens
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LookupTable {
    pub name: String,
    #[serde(default)]
    pub mode: LookupMode,
    pub entries: Vec<LookupEntry>,
    /// Name of a table consulted when no entry matches, resolved at load time
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(skip)]
    pub chained: Option<Box<LookupTable>>,
}

impl LookupTable {
    pub fn new(name: &str, entries: Vec<LookupEntry>) -> Self {
        LookupTable {
            name: name.to_string(),
            mode: LookupMode::Exact,
            entries,
            fallback: None,
            chained: None,
        }
    }

    pub fn bitmask(name: &str, entries: Vec<LookupEntry>) -> Self {
        LookupTable { mode: LookupMode::Bitmask, ..LookupTable::new(name, entries) }
    }

    /// First-match lookup, then the chained table, then the `_` default entry.
    ///
    /// An empty token is a valid answer: the state is known but carries no flag.
    pub fn lookup(&self, raw: &str) -> Option<&str> {
        if let Some(entry) = self.entries.iter().find(|e| e.raw.matches(raw)) {
            return Some(entry.token.as_str());
        }

        if let Some(chained) = &self.chained {
            if let Some(token) = chained.lookup(raw) {
                return Some(token);
            }
        }

        let default = self.entries.iter().find(|e| e.raw.is_default()).map(|e| e.token.as_str());
        if default.is_none() {
            debug!("No entry for {raw:?} in lookup table {}", self.name);
        }
        default
    }

    /// Whole entry tokens a raw value resolves to, `None` when nothing matched
    /// and the table has no default entry.
    ///
    /// Exact tables yield at most one entry, bitmask tables every entry whose
    /// mask is fully set in the raw integer.
    pub fn resolve(&self, raw: &str) -> Option<Vec<&str>> {
        match self.mode {
            LookupMode::Exact => self.lookup(raw).map(|t| vec![t]),
            LookupMode::Bitmask => {
                let bits = crate::engine::transform::parse_number(raw).ok()? as i64;

                let matched: Vec<&str> = self
                    .entries
                    .iter()
                    .filter_map(|e| e.raw.as_int().map(|mask| (mask, e.token.as_str())))
                    .filter(|(mask, _)| *mask != 0 && bits & mask == *mask)
                    .map(|(_, token)| token)
                    .collect();

                if matched.is_empty() {
                    if let Some(default) = self.entries.iter().find(|e| e.raw.is_default()) {
                        return Some(vec![default.token.as_str()]);
                    }
                    if bits != 0 {
                        debug!("No bit of {raw:?} known in lookup table {}", self.name);
                    }
                }
                Some(matched)
            }
        }
    }

    /// All status tokens a raw value expands to
    pub fn tokens(&self, raw: &str) -> Vec<&str> {
        self.resolve(raw)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|t| t.split_whitespace())
            .collect()
    }

    /// Raw value for a token, used when writing enumerated values back
    pub fn reverse(&self, token: &str) -> Option<&LookupKey> {
        self.entries
            .iter()
            .find(|e| e.token == token && !e.raw.is_default())
            .map(|e| &e.raw)
    }

    /// Raw keys declared more than once; the first declaration wins
    pub fn duplicate_keys(&self) -> Vec<String> {
        let mut seen: Vec<&LookupKey> = Vec::new();
        let mut dupes = Vec::new();
        for entry in &self.entries {
            if seen.contains(&&entry.raw) {
                dupes.push(entry.raw.to_raw_string());
            } else {
                seen.push(&entry.raw);
            }
        }
        dupes
    }

    /// Same entries under a different name
    pub fn same_content(&self, other: &LookupTable) -> bool {
        self.mode == other.mode && self.entries == other.entries && self.fallback == other.fallback
    }
}
