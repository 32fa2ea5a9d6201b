use std::collections::BTreeMap;
use log::debug;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matching {
    #[default]
    Exact,
    /// For devices answering with a fixed signature followed by noise
    Prefix,
    Contains,
}

/// Known model, selected by the answer to the identification request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceModelEntry {
    pub id: String,
    #[serde(default)]
    pub matching: Matching,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Calibration constants and thresholds, published as static values
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl DeviceModelEntry {
    fn matches(&self, ident: &str) -> bool {
        match self.matching {
            Matching::Exact => ident == self.id,
            Matching::Prefix => ident.starts_with(&self.id),
            Matching::Contains => ident.contains(&self.id),
        }
    }
}

/// Exact ids win over signatures, otherwise declaration order decides
pub fn match_model<'a>(models: &'a [DeviceModelEntry], ident: &str) -> Option<&'a DeviceModelEntry> {
    let ident = ident.trim();
    let found = models
        .iter()
        .filter(|m| m.matching == Matching::Exact)
        .find(|m| m.matches(ident))
        .or_else(|| {
            models
                .iter()
                .filter(|m| m.matching != Matching::Exact)
                .find(|m| m.matches(ident))
        });

    if let Some(m) = found {
        debug!("{ident:?} identified as {}", m.id);
    }
    found
}

/// Profile used when the device answered but is not in the model table
pub fn generic_model(manufacturer: &str, model: &str) -> DeviceModelEntry {
    DeviceModelEntry {
        id: "generic".to_string(),
        matching: Matching::Exact,
        manufacturer: Some(manufacturer.to_string()),
        model: Some(model.to_string()),
        values: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, matching: Matching, model: &str) -> DeviceModelEntry {
        DeviceModelEntry {
            id: id.to_string(),
            matching,
            manufacturer: None,
            model: Some(model.to_string()),
            values: BTreeMap::new(),
        }
    }

    #[test]
    fn test_exact_before_prefix() {
        let models = vec![
            entry("#MEC", Matching::Prefix, "any mec"),
            entry("#MEC0003", Matching::Exact, "mec 3"),
            entry("PowerWalker", Matching::Contains, "walker"),
        ];
        assert_eq!(match_model(&models, "#MEC0003").unwrap().model.as_deref(), Some("mec 3"));
        assert_eq!(match_model(&models, " #MEC0003 \r").unwrap().model.as_deref(), Some("mec 3"));
        assert_eq!(match_model(&models, "#MEC0010").unwrap().model.as_deref(), Some("any mec"));
        assert_eq!(match_model(&models, "#BlueWalker PowerWalker VI").unwrap().model.as_deref(), Some("walker"));
        assert!(match_model(&models, "#Unknown").is_none());
    }

    #[test]
    fn test_generic() {
        let m = generic_model("Generic", "Megatec Q1");
        assert_eq!(m.id, "generic");
        assert!(m.values.is_empty());
    }
}
