use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::StationError;

/// Relative tolerance, in steps, when checking that a value sits on the grid
const STEP_TOLERANCE: f64 = 1e-6;

/// Definition and current value of one tunable scan parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub label: String,
    pub start: f64,
    pub end: f64,
    pub step: f64,
    pub value: f64,
    pub unit: String,
}

impl ParamSpec {
    /// `value` lies in `[start, end]` and on the step grid anchored at `start`
    pub fn accepts(&self, value: f64) -> bool {
        if !value.is_finite() || value < self.start || value > self.end {
            return false;
        }
        let steps = (value - self.start) / self.step;
        (steps - steps.round()).abs() <= STEP_TOLERANCE * steps.abs().max(1.0)
    }

    fn out_of_range(&self, key: &str, value: f64) -> StationError {
        StationError::ParameterOutOfRange {
            key: key.to_string(),
            value,
            start: self.start,
            end: self.end,
            step: self.step,
        }
    }
}

/// Immutable view of parameter values handed to one measurement run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParamSnapshot(BTreeMap<String, f64>);

impl ParamSnapshot {
    pub fn get(&self, key: &str) -> Result<f64, StationError> {
        self.0
            .get(key)
            .copied()
            .ok_or_else(|| StationError::MissingParameter(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for ParamSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Primary parameters of one device under test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceParams {
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    /// Adjustment table to load at the start of each run
    #[serde(default)]
    pub adjustment: Option<PathBuf>,
    /// Result table the export row is synthesized from
    #[serde(default)]
    pub result_source: Option<PathBuf>,
}

/// Validated, persisted set of user-tunable scan parameters
#[derive(Debug, Clone, Default)]
pub struct SecondaryParams {
    /// Registration order
    specs: Vec<(String, ParamSpec)>,
    out_of_policy: Vec<String>,
}

impl SecondaryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// The station's standard parameter set
    pub fn standard() -> Self {
        let mut params = Self::new();
        let defs: [(&str, &str, (f64, f64), f64, f64, &str); 4] = [
            ("ref_f", "Fref=", (10.0, 3000.0), 10.0, 100.0, "MHz"),
            ("ref_p", "Pref=", (-60.0, 0.0), 1.0, 0.0, "dBm"),
            ("src_u", "Usrc=", (3.0, 3.5), 0.1, 3.3, "V"),
            ("src_i_max", "Isrc.max=", (10.0, 80.0), 1.0, 60.0, "mA"),
        ];
        for (key, label, range, step, default, unit) in defs {
            let defined = params.define_parameter(key, label, range, step, default, unit);
            debug_assert!(defined.is_ok(), "invalid standard parameter {key}: {defined:?}");
        }
        params
    }

    /// Register one tunable parameter
    pub fn define_parameter(
        &mut self,
        key: &str,
        label: &str,
        range: (f64, f64),
        step: f64,
        default: f64,
        unit: &str,
    ) -> Result<(), StationError> {
        let (start, end) = range;
        if !(start <= end) || !(step > 0.0) {
            return Err(StationError::InvalidParameter(format!(
                "{key}: range [{start}, {end}] with step {step}"
            )));
        }
        let spec = ParamSpec {
            label: label.to_string(),
            start,
            end,
            step,
            value: default,
            unit: unit.to_string(),
        };
        if !spec.accepts(default) {
            return Err(StationError::InvalidParameter(format!(
                "{key}: default {default} outside [{start}, {end}] step {step}"
            )));
        }

        match self.specs.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = spec,
            None => self.specs.push((key.to_string(), spec)),
        }
        Ok(())
    }

    pub fn spec(&self, key: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|(k, _)| k == key).map(|(_, s)| s)
    }

    pub fn specs(&self) -> impl Iterator<Item = (&str, &ParamSpec)> {
        self.specs.iter().map(|(k, s)| (k.as_str(), s))
    }

    /// Overlay persisted values onto the current ones.
    ///
    /// A missing file leaves everything untouched. Unregistered keys are
    /// ignored. Values that fail validation are rejected, keep the default
    /// and are listed by [`Self::out_of_policy`].
    pub fn load_from_config(&mut self, path: &Path) -> Result<(), StationError> {
        self.out_of_policy.clear();
        if !path.exists() {
            debug!("No persisted parameters at {}", path.display());
            return Ok(());
        }

        let persisted = read_json_object(path)?;
        for (key, spec) in self.specs.iter_mut() {
            let Some(raw) = persisted.get(key.as_str()) else {
                continue;
            };
            match raw.as_f64() {
                Some(value) if spec.accepts(value) => spec.value = value,
                _ => {
                    warn!(
                        "Persisted {key} = {raw} outside [{}, {}] step {}; keeping {}",
                        spec.start, spec.end, spec.step, spec.value
                    );
                    self.out_of_policy.push(key.clone());
                }
            }
        }
        info!("Loaded parameters from {}", path.display());
        Ok(())
    }

    /// Write current values, keeping any other keys already in the file
    pub fn save_to_config(&self, path: &Path) -> Result<(), StationError> {
        let mut persisted = if path.exists() {
            read_json_object(path)?
        } else {
            Map::new()
        };
        for (key, spec) in &self.specs {
            persisted.insert(key.clone(), Value::from(spec.value));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&Value::Object(persisted))?)?;
        info!("Saved parameters to {}", path.display());
        Ok(())
    }

    /// Replace values for known keys; unknown keys are ignored.
    ///
    /// All-or-nothing: one invalid value leaves every parameter unchanged.
    pub fn set_params(&mut self, values: &HashMap<String, f64>) -> Result<(), StationError> {
        for (key, value) in values {
            if let Some(spec) = self.spec(key) {
                if !spec.accepts(*value) {
                    return Err(spec.out_of_range(key, *value));
                }
            }
        }
        for (key, spec) in self.specs.iter_mut() {
            if let Some(value) = values.get(key.as_str()) {
                spec.value = *value;
            }
        }
        Ok(())
    }

    pub fn current_values(&self) -> ParamSnapshot {
        self.specs
            .iter()
            .map(|(k, s)| (k.clone(), s.value))
            .collect()
    }

    /// Keys whose persisted value was rejected by the last load
    pub fn out_of_policy(&self) -> &[String] {
        &self.out_of_policy
    }
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>, StationError> {
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content)? {
        Value::Object(map) => Ok(map),
        other => Err(StationError::InvalidParameter(format!(
            "{} holds {} instead of an object",
            path.display(),
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_standard_defaults() {
        let params = SecondaryParams::standard();
        let values = params.current_values();
        assert_eq!(values.len(), 4);
        assert_eq!(values.get("ref_f").unwrap(), 100.0);
        assert_eq!(values.get("ref_p").unwrap(), 0.0);
        assert_eq!(values.get("src_u").unwrap(), 3.3);
        assert_eq!(values.get("src_i_max").unwrap(), 60.0);
    }

    #[test]
    fn test_define_rejects_bad_definitions() {
        let mut params = SecondaryParams::new();
        assert!(params.define_parameter("a", "A", (5.0, 1.0), 1.0, 2.0, "V").is_err());
        assert!(params.define_parameter("b", "B", (0.0, 1.0), 0.0, 0.0, "V").is_err());
        assert!(params.define_parameter("c", "C", (0.0, 1.0), 0.5, 2.0, "V").is_err());
        assert!(params.define_parameter("d", "D", (0.0, 1.0), 0.5, 0.25, "V").is_err());
        assert!(params.current_values().is_empty());
    }

    #[test]
    fn test_step_grid_tolerance() {
        let params = SecondaryParams::standard();
        let src_u = params.spec("src_u").unwrap();
        assert!(src_u.accepts(3.1));
        assert!(src_u.accepts(3.5));
        assert!(!src_u.accepts(3.55));
        assert!(!src_u.accepts(3.6));
        assert!(!src_u.accepts(f64::NAN));
    }

    #[test]
    fn test_load_overlays_known_keys_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"ref_f": 250.0, "legacy": 7, "src_u": 3.4}"#).unwrap();

        let mut params = SecondaryParams::standard();
        params.load_from_config(&path).unwrap();
        let values = params.current_values();

        assert_eq!(values.get("ref_f").unwrap(), 250.0);
        assert_eq!(values.get("src_u").unwrap(), 3.4);
        assert_eq!(values.get("ref_p").unwrap(), 0.0);
        assert!(values.get("legacy").is_err());
        assert!(params.out_of_policy().is_empty());
    }

    #[test]
    fn test_load_rejects_out_of_range_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"ref_p": 12.0, "src_i_max": 55.5, "ref_f": "fast"}"#).unwrap();

        let mut params = SecondaryParams::standard();
        params.load_from_config(&path).unwrap();

        let mut rejected = params.out_of_policy().to_vec();
        rejected.sort();
        assert_eq!(rejected, vec!["ref_f", "ref_p", "src_i_max"]);

        for (key, value) in params.current_values().iter() {
            let spec = params.spec(key).unwrap();
            assert!(spec.accepts(value), "{key} = {value}");
        }
    }

    #[test]
    fn test_load_missing_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let mut params = SecondaryParams::standard();
        params.load_from_config(&dir.path().join("absent.json")).unwrap();
        assert_eq!(params.current_values(), SecondaryParams::standard().current_values());
    }

    #[test]
    fn test_load_rejects_non_object_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        let mut params = SecondaryParams::standard();
        assert!(params.load_from_config(&path).is_err());
    }

    #[test]
    fn test_save_preserves_unknown_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"ref_f": 200.0, "operator": "night shift"}"#).unwrap();

        let mut params = SecondaryParams::standard();
        params.load_from_config(&path).unwrap();
        params
            .set_params(&HashMap::from([("ref_p".to_string(), -10.0)]))
            .unwrap();
        params.save_to_config(&path).unwrap();

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["operator"], "night shift");
        assert_eq!(saved["ref_f"], 200.0);
        assert_eq!(saved["ref_p"], -10.0);

        let mut reloaded = SecondaryParams::standard();
        reloaded.load_from_config(&path).unwrap();
        assert_eq!(reloaded.current_values(), params.current_values());
    }

    #[test]
    fn test_set_params_is_all_or_nothing() {
        let mut params = SecondaryParams::standard();
        let update = HashMap::from([
            ("ref_f".to_string(), 500.0),
            ("src_u".to_string(), 9.0),
            ("unknown".to_string(), 1.0),
        ]);
        let err = params.set_params(&update).unwrap_err();
        assert!(matches!(err, StationError::ParameterOutOfRange { ref key, .. } if key == "src_u"));
        assert_eq!(params.current_values().get("ref_f").unwrap(), 100.0);

        let update = HashMap::from([("ref_f".to_string(), 500.0), ("unknown".to_string(), 1.0)]);
        params.set_params(&update).unwrap();
        assert_eq!(params.current_values().get("ref_f").unwrap(), 500.0);
        assert_eq!(params.current_values().len(), 4);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut params = SecondaryParams::standard();
        let snapshot = params.current_values();
        params
            .set_params(&HashMap::from([("ref_f".to_string(), 20.0)]))
            .unwrap();
        assert_eq!(snapshot.get("ref_f").unwrap(), 100.0);
    }
}
