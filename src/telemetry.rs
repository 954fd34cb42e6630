// telemetry.rs

use serde_json::{Map, Value};

use crate::*;

/// Outgoing telemetry: an ordered field-name to scalar mapping.
///
/// Built once per session. Later settings updates may patch fields that are
/// already present, so a repeated publish carries the corrected value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetryDocument {
    fields: Map<String, Value>,
}

impl TelemetryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_owned(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Overwrite a field only if the document already carries it.
    pub fn patch(&mut self, key: &str, value: impl Into<Value>) -> bool {
        match self.fields.get_mut(key) {
            Some(slot) => {
                *slot = value.into();
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(&self.fields)?)
    }

    pub fn build(
        settings: &Settings,
        data: &AttinyData,
        cdata: &CalculatedData,
        counter_types: (u8, u8),
        mode: WakeMode,
        now: Option<DateTime<Utc>>,
    ) -> Self {
        let (delta0, delta1) = cdata.delta_litres(settings);
        let mut doc = Self::new();

        doc.set("version", FW_VERSION);
        doc.set("version_attiny", data.version);
        doc.set("mode", mode.code());
        doc.set("ch0", round_m3(cdata.channel0));
        doc.set("ch1", round_m3(cdata.channel1));
        doc.set("delta0", delta0);
        doc.set("delta1", delta1);
        doc.set("imp0", data.impulses0);
        doc.set("imp1", data.impulses1);
        doc.set("f0", settings.factor0);
        doc.set("f1", settings.factor1);
        doc.set("cname0", settings.counter0_name);
        doc.set("cname1", settings.counter1_name);
        doc.set("data_type0", data_kind_by_name(settings.counter0_name) as u8);
        doc.set("data_type1", data_kind_by_name(settings.counter1_name) as u8);
        doc.set("ctype0", counter_types.0);
        doc.set("ctype1", counter_types.1);
        doc.set("serial0", settings.serial0.as_str());
        doc.set("serial1", settings.serial1.as_str());
        doc.set("period_min", settings.wakeup_per_min);
        doc.set("wake_on_consumption", settings.wake_on_consumption_only);
        doc.set("setup_finished", settings.setup_finished_counter);
        doc.set("setup_time", settings.setup_time);
        doc.set("ntp_errors", settings.ntp_error_counter);
        doc.set("company", settings.company.as_str());
        doc.set("place", settings.place.as_str());
        if let Some(now) = now {
            doc.set("timestamp", now.format("%Y-%m-%dT%H:%M:%SZ").to_string());
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_only_touches_existing_fields() {
        let mut doc = TelemetryDocument::new();
        doc.set("f0", 10);
        assert!(doc.patch("f0", 100));
        assert!(!doc.patch("f1", 100));
        assert_eq!(doc.get("f0"), Some(&Value::from(100)));
        assert!(!doc.contains("f1"));
    }

    #[test]
    fn built_document_keeps_field_order() {
        let settings = Settings { factor0: 1, ..Settings::default() };
        let data = AttinyData { impulses0: 25, ..AttinyData::default() };
        let cdata = CalculatedData::compute(&settings, &data);
        let doc = TelemetryDocument::build(&settings, &data, &cdata, (0, 2), WakeMode::AutoTransmit, None);

        let keys: Vec<&str> = doc.iter().map(|(k, _)| k.as_str()).take(4).collect();
        assert_eq!(keys, ["version", "version_attiny", "mode", "ch0"]);
        assert_eq!(doc.get("ch0"), Some(&Value::from(0.025)));
        assert_eq!(doc.get("delta0"), Some(&Value::from(25)));
        assert_eq!(doc.get("ctype1"), Some(&Value::from(2)));
        assert!(!doc.contains("timestamp"));
        assert!(doc.to_json().unwrap().starts_with("{\"version\":"));
    }
}

// EOF
