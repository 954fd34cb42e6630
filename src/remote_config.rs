// remote_config.rs - fetch, authenticate, validate and merge server-side settings

use std::str::FromStr;

use serde_json::{Map, Value};

use crate::*;

pub const CONFIG_ENDPOINT: &str = "cfg";

/// Anything shorter cannot be a config object carrying a key.
const MIN_CONFIG_RESPONSE_LEN: usize = 10;

enum FieldKind {
    Float {
        min: f32,
        max: f32,
        target: fn(&mut Settings) -> &mut f32,
    },
    Int {
        min: i64,
        max: i64,
        apply: fn(&mut Settings, i64) -> bool,
    },
    Text {
        capacity: usize,
        target: fn(&mut Settings) -> &mut String,
    },
    Flag {
        target: fn(&mut Settings) -> &mut bool,
    },
    Addr {
        target: fn(&mut Settings) -> &mut net::Ipv4Addr,
    },
}

/// One recognized payload field: where it goes and what it must satisfy.
struct FieldSpec {
    name: &'static str,
    kind: FieldKind,
    enabled: fn(&Settings) -> bool,
}

fn always(_: &Settings) -> bool {
    true
}

impl FieldSpec {
    fn float(name: &'static str, min: f32, max: f32, target: fn(&mut Settings) -> &mut f32) -> Self {
        Self { name, kind: FieldKind::Float { min, max, target }, enabled: always }
    }

    fn int(name: &'static str, min: i64, max: i64, apply: fn(&mut Settings, i64) -> bool) -> Self {
        Self { name, kind: FieldKind::Int { min, max, apply }, enabled: always }
    }

    fn text(name: &'static str, capacity: usize, target: fn(&mut Settings) -> &mut String) -> Self {
        Self { name, kind: FieldKind::Text { capacity, target }, enabled: always }
    }

    fn flag(name: &'static str, target: fn(&mut Settings) -> &mut bool) -> Self {
        Self { name, kind: FieldKind::Flag { target }, enabled: always }
    }

    fn addr(name: &'static str, target: fn(&mut Settings) -> &mut net::Ipv4Addr) -> Self {
        Self { name, kind: FieldKind::Addr { target }, enabled: always }
    }

    fn only_if(mut self, enabled: fn(&Settings) -> bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns true if the settings changed. Invalid values leave them untouched.
    fn apply(&self, settings: &mut Settings, value: &Value) -> bool {
        match &self.kind {
            FieldKind::Float { min, max, target } => value
                .as_f64()
                .is_some_and(|v| apply_range(target(settings), v as f32, *min, *max)),
            FieldKind::Int { min, max, apply } => match value.as_i64() {
                Some(v) if (*min..=*max).contains(&v) => apply(settings, v),
                _ => false,
            },
            FieldKind::Text { capacity, target } => value
                .as_str()
                .is_some_and(|v| apply_text(target(settings), v, *capacity)),
            FieldKind::Flag { target } => match value {
                Value::Bool(b) => apply_value(target(settings), *b),
                Value::Number(n) => n.as_i64().is_some_and(|v| apply_value(target(settings), v != 0)),
                _ => false,
            },
            FieldKind::Addr { target } => value
                .as_str()
                .and_then(|v| net::Ipv4Addr::from_str(v).ok())
                .is_some_and(|ip| apply_value(target(settings), ip)),
        }
    }
}

fn set_impulses(start: &mut u32, previous: &mut u32, v: i64) -> bool {
    let v = v as u32;
    let a = apply_value(start, v);
    let b = apply_value(previous, v);
    a || b
}

/// Order matters: enable flags precede the fields they gate.
fn config_fields() -> Vec<FieldSpec> {
    let mqtt_on = |s: &Settings| s.mqtt_on;
    vec![
        FieldSpec::float("channel0", 0.0, MAX_CHANNEL_VALUE, |s| &mut s.channel0_start),
        FieldSpec::float("channel1", 0.0, MAX_CHANNEL_VALUE, |s| &mut s.channel1_start),
        FieldSpec::text("serial0", SERIAL_LEN, |s| &mut s.serial0),
        FieldSpec::text("serial1", SERIAL_LEN, |s| &mut s.serial1),
        FieldSpec::int("cname0", 0, COUNTER_NAME_MAX as i64, |s, v| {
            apply_value(&mut s.counter0_name, v as u8)
        }),
        FieldSpec::int("cname1", 0, COUNTER_NAME_MAX as i64, |s, v| {
            apply_value(&mut s.counter1_name, v as u8)
        }),
        FieldSpec::int("factor0", 1, MAX_FACTOR as i64, |s, v| apply_value(&mut s.factor0, v as u16)),
        FieldSpec::int("factor1", 1, MAX_FACTOR as i64, |s, v| apply_value(&mut s.factor1, v as u16)),
        FieldSpec::int("impulses0", 0, u32::MAX as i64, |s, v| {
            set_impulses(&mut s.impulses0_start, &mut s.impulses0_previous, v)
        }),
        FieldSpec::int("impulses1", 0, u32::MAX as i64, |s, v| {
            set_impulses(&mut s.impulses1_start, &mut s.impulses1_previous, v)
        }),
        FieldSpec::int("wakeup_per_min", 1, MAX_WAKEUP_PER_MIN as i64, |s, v| {
            let period = apply_value(&mut s.wakeup_per_min, v as u16);
            let tuned = apply_value(&mut s.period_min_tuned, v as u16);
            period || tuned
        }),
        FieldSpec::int("wake_on_consumption_only", 0, 1, |s, v| {
            apply_value(&mut s.wake_on_consumption_only, v == 1)
        }),
        FieldSpec::text("ssid", WIFI_SSID_LEN, |s| &mut s.wifi_ssid),
        FieldSpec::text("password", WIFI_PWD_LEN, |s| &mut s.wifi_password),
        FieldSpec::flag("mqtt_on", |s| &mut s.mqtt_on),
        FieldSpec::text("mqtt_host", HOST_LEN, |s| &mut s.mqtt_host).only_if(mqtt_on),
        FieldSpec::int("mqtt_port", 1, u16::MAX as i64, |s, v| apply_value(&mut s.mqtt_port, v as u16))
            .only_if(mqtt_on),
        FieldSpec::text("mqtt_login", MQTT_LOGIN_LEN, |s| &mut s.mqtt_login).only_if(mqtt_on),
        FieldSpec::text("mqtt_password", MQTT_PASSWORD_LEN, |s| &mut s.mqtt_password).only_if(mqtt_on),
        FieldSpec::text("mqtt_topic", MQTT_TOPIC_LEN, |s| &mut s.mqtt_topic).only_if(mqtt_on),
        FieldSpec::flag("http_on", |s| &mut s.http_on),
        FieldSpec::text("http_url", HOST_LEN, |s| &mut s.http_url).only_if(|s| s.http_on),
        FieldSpec::text("ntp_server", HOST_LEN, |s| &mut s.ntp_server),
        FieldSpec::text("waterius_host", HOST_LEN, |s| &mut s.waterius_host),
        FieldSpec::text("waterius_key", WATERIUS_KEY_LEN, |s| &mut s.waterius_key),
        FieldSpec::text("waterius_email", EMAIL_LEN, |s| &mut s.waterius_email),
        FieldSpec::flag("waterius_on", |s| &mut s.waterius_on),
        FieldSpec::text("company", COMPANY_LEN, |s| &mut s.company),
        FieldSpec::text("place", PLACE_LEN, |s| &mut s.place),
        FieldSpec::flag("mqtt_auto_discovery", |s| &mut s.mqtt_auto_discovery),
        FieldSpec::text("mqtt_discovery_topic", MQTT_TOPIC_LEN, |s| &mut s.mqtt_discovery_topic),
        FieldSpec::flag("dhcp_off", |s| &mut s.dhcp_off),
        FieldSpec::addr("static_ip", |s| &mut s.ip).only_if(|s| s.dhcp_off),
        FieldSpec::addr("gateway", |s| &mut s.gateway).only_if(|s| s.dhcp_off),
        FieldSpec::addr("mask", |s| &mut s.mask).only_if(|s| s.dhcp_off),
        FieldSpec::flag("mdns_on", |s| &mut s.mdns_on),
    ]
}

/// The payload must carry `key` equal to the device key. This is the only
/// thing standing between the network and the device configuration.
pub fn validate_device_key(payload: &Value, key: &str) -> bool {
    if key.is_empty() {
        error!("RCFG: Device key is empty, refusing remote config");
        return false;
    }
    match payload.get("key").and_then(Value::as_str) {
        Some(k) if k == key => {
            info!("RCFG: Authorization successful - key verified");
            true
        }
        Some(_) => {
            error!("RCFG: Authorization failed - key mismatch!");
            false
        }
        None => {
            error!("RCFG: Authorization failed - no key in server response");
            false
        }
    }
}

fn field<'v>(obj: &'v Map<String, Value>, name: &str) -> Option<&'v Value> {
    obj.get(name).filter(|v| !v.is_null())
}

/// Applies remote configuration to the session's settings.
pub struct Reconciler<'a> {
    pub settings: &'a mut Settings,
    pub data: &'a AttinyData,
    pub counters: &'a mut SessionCounterContext,
    pub peripheral: &'a mut dyn Peripheral,
    pub store: &'a mut dyn SettingsStore,
}

impl Reconciler<'_> {
    /// POST the device key to `{base_url}/cfg` and apply what comes back.
    pub fn fetch_and_apply(&mut self, http: &mut dyn HttpClient, base_url: &str) -> bool {
        info!("RCFG: fetch cfg...");
        let key = self.settings.waterius_key.clone();
        if key.is_empty() {
            error!("RCFG: Key is empty, skipping config fetch");
            return false;
        }

        let mut url = base_url.to_owned();
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str(CONFIG_ENDPOINT);
        info!("RCFG: URL: {url}");

        let request = serde_json::json!({ "key": key }).to_string();
        let body = match http.post(&url, &[("Content-Type", "application/json")], request.as_bytes()) {
            Ok(mut resp) => read_bounded_body(resp.as_mut(), "RCFG"),
            Err(e) => {
                error!("RCFG: Failed to connect to server: {e}");
                None
            }
        };
        let Some(body) = body else {
            error!("RCFG: fetch failed");
            return false;
        };

        let payload: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                error!("RCFG: Failed to parse JSON response: {e}");
                return false;
            }
        };
        self.commit(&payload)
    }

    /// Look for configuration embedded in a delivery response body.
    pub fn apply_from_response(&mut self, body: &[u8]) -> bool {
        info!("RCFG: Checking response for configuration...");
        if body.len() < MIN_CONFIG_RESPONSE_LEN {
            info!("RCFG: Response too short, no configuration");
            return false;
        }
        if body.len() > REMOTE_CONFIG_MAX_SIZE {
            error!(
                "RCFG: Response too large: {} bytes (max: {REMOTE_CONFIG_MAX_SIZE} bytes)",
                body.len()
            );
            return false;
        }
        if !body.starts_with(b"{") && !body.starts_with(b"[") {
            info!("RCFG: Response is not JSON, no configuration");
            return false;
        }

        let payload: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                error!("RCFG: parse err: {e}");
                return false;
            }
        };
        self.commit(&payload)
    }

    /// Authenticate, merge and persist. True if anything changed.
    fn commit(&mut self, payload: &Value) -> bool {
        if !validate_device_key(payload, &self.settings.waterius_key) {
            return false;
        }
        if self.apply_config(payload) {
            info!("RCFG: saving...");
            store_settings(self.store, self.settings);
            return true;
        }
        info!("RCFG: no changes");
        false
    }

    /// Validated merge of every recognized field present in `payload`.
    /// Does not authenticate; callers go through [`Reconciler::commit`].
    pub fn apply_config(&mut self, payload: &Value) -> bool {
        let Some(obj) = payload.as_object() else {
            return false;
        };
        info!("RCFG: Applying config...");

        let mut changed = false;
        for spec in config_fields() {
            let Some(value) = field(obj, spec.name) else {
                continue;
            };
            if !(spec.enabled)(self.settings) {
                continue;
            }
            if spec.apply(self.settings, value) {
                info!("RCFG: {} updated", spec.name);
                changed = true;
            }
        }

        if self.apply_counter_kinds(obj) {
            changed = true;
        }

        info!("RCFG: changed={changed}");
        changed
    }

    fn apply_counter_kinds(&mut self, obj: &Map<String, Value>) -> bool {
        let ct0 = field(obj, "ctype0");
        let ct1 = field(obj, "ctype1");
        if ct0.is_none() && ct1.is_none() {
            return false;
        }

        let current = self.counters.current(self.data);
        let resolve = |v: Option<&Value>, known: u8| match v {
            Some(v) => v.as_i64(),
            None => Some(known as i64),
        };
        let (Some(k0), Some(k1)) = (resolve(ct0, current.0), resolve(ct1, current.1)) else {
            error!("RCFG: bad ctype");
            return false;
        };
        if !CounterKind::is_valid(k0) || !CounterKind::is_valid(k1) {
            error!("RCFG: bad ctype {k0},{k1}");
            return false;
        }

        write_counter_kinds(
            self.settings,
            self.counters,
            self.peripheral,
            (k0 as u8, k1 as u8),
            current,
        )
    }
}

/// Write both counter kinds through to the controller. Settings and the
/// session context change only if the controller accepted the pair.
pub fn write_counter_kinds(
    settings: &mut Settings,
    counters: &mut SessionCounterContext,
    peripheral: &mut dyn Peripheral,
    kinds: (u8, u8),
    current: (u8, u8),
) -> bool {
    if kinds == current {
        info!("ctype unchanged ({},{})", kinds.0, kinds.1);
        return false;
    }
    if !peripheral.set_counter_kinds(kinds.0, kinds.1) {
        error!("ctype {},{} not accepted by controller", kinds.0, kinds.1);
        return false;
    }
    counters.record(kinds);
    settings.counter0_type = kinds.0;
    settings.counter1_type = kinds.1;
    info!("ctype={},{}", kinds.0, kinds.1);
    true
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sim::{SimHttp, SimPeripheral, SimResponse, SimStore};

    const KEY: &str = "0123456789abcdef";

    struct Fixture {
        settings: Settings,
        data: AttinyData,
        counters: SessionCounterContext,
        peripheral: SimPeripheral,
        store: SimStore,
    }

    impl Fixture {
        fn new() -> Self {
            let data = AttinyData { counter_type0: 0, counter_type1: 2, ..AttinyData::default() };
            Self {
                settings: Settings { waterius_key: KEY.into(), ..Settings::default() },
                peripheral: SimPeripheral::new(data.clone()),
                data,
                counters: SessionCounterContext::new(),
                store: SimStore::default(),
            }
        }

        fn reconciler(&mut self) -> Reconciler<'_> {
            Reconciler {
                settings: &mut self.settings,
                data: &self.data,
                counters: &mut self.counters,
                peripheral: &mut self.peripheral,
                store: &mut self.store,
            }
        }

        fn respond(&mut self, payload: Value) -> bool {
            let body = payload.to_string();
            self.reconciler().apply_from_response(body.as_bytes())
        }
    }

    #[test]
    fn absent_fields_change_nothing() {
        let mut fx = Fixture::new();
        let before = fx.settings.clone();
        assert!(!fx.respond(json!({ "key": KEY })));
        assert!(!fx.respond(json!({ "key": KEY, "unknown": 5, "factor0": null })));
        assert_eq!(fx.settings, before);
        assert_eq!(fx.store.writes, 0);
    }

    #[test]
    fn wrong_or_missing_key_blocks_every_field() {
        let mut fx = Fixture::new();
        let before = fx.settings.clone();
        assert!(!fx.respond(json!({ "key": "nope", "factor0": 5, "mqtt_on": true })));
        assert!(!fx.respond(json!({ "factor0": 5, "mqtt_on": true })));
        assert!(!fx.respond(json!({ "key": 12345, "factor0": 5 })));
        assert_eq!(fx.settings, before);
        assert_eq!(fx.store.writes, 0);
    }

    #[test]
    fn empty_device_key_never_authenticates() {
        let mut fx = Fixture::new();
        fx.settings.waterius_key.clear();
        assert!(!fx.respond(json!({ "key": "", "factor0": 5 })));
        assert_eq!(fx.settings.factor0, DEFAULT_FACTOR);
    }

    #[test]
    fn factor_range_is_enforced() {
        let mut fx = Fixture::new();
        assert!(!fx.respond(json!({ "key": KEY, "factor0": 0 })));
        assert!(!fx.respond(json!({ "key": KEY, "factor0": 10001 })));
        assert_eq!(fx.settings.factor0, DEFAULT_FACTOR);
        assert!(fx.respond(json!({ "key": KEY, "factor0": 10000 })));
        assert_eq!(fx.settings.factor0, 10000);
        assert!(fx.respond(json!({ "key": KEY, "factor0": 1 })));
        assert_eq!(fx.settings.factor0, 1);
        assert_eq!(fx.store.writes, 2);
    }

    #[test]
    fn fields_are_validated_individually() {
        let mut fx = Fixture::new();
        let long_ssid = "s".repeat(WIFI_SSID_LEN);
        let changed = fx.respond(json!({
            "key": KEY,
            "channel0": 1234.5,
            "channel1": -1.0,
            "ssid": long_ssid,
            "password": "secret",
            "cname0": COUNTER_NAME_MAX + 1,
            "impulses1": 777,
            "wakeup_per_min": 15,
        }));
        assert!(changed);
        let s = &fx.settings;
        assert_eq!(s.channel0_start, 1234.5);
        assert_eq!(s.channel1_start, 0.0);
        assert_eq!(s.wifi_ssid, Settings::default().wifi_ssid);
        assert_eq!(s.wifi_password, "secret");
        assert_eq!(s.counter0_name, CounterName::WaterCold as u8);
        assert_eq!((s.impulses1_start, s.impulses1_previous), (777, 777));
        assert_eq!((s.wakeup_per_min, s.period_min_tuned), (15, 15));
    }

    #[test]
    fn gated_fields_follow_their_switch() {
        let mut fx = Fixture::new();
        assert!(!fx.respond(json!({ "key": KEY, "mqtt_host": "broker", "static_ip": "10.0.0.5" })));
        assert!(fx.settings.mqtt_host.is_empty());

        assert!(fx.respond(json!({
            "key": KEY,
            "mqtt_on": true,
            "mqtt_host": "broker",
            "mqtt_port": 70000,
            "dhcp_off": true,
            "static_ip": "10.0.0.5",
            "gateway": "not-an-ip",
        })));
        let s = &fx.settings;
        assert!(s.mqtt_on);
        assert_eq!(s.mqtt_host, "broker");
        assert_eq!(s.mqtt_port, 1883);
        assert_eq!(s.ip, net::Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(s.gateway, net::Ipv4Addr::new(0, 0, 0, 0));
    }

    #[test]
    fn single_counter_kind_resolves_other_from_controller() {
        let mut fx = Fixture::new();
        assert!(fx.respond(json!({ "key": KEY, "ctype0": 0xFF })));
        assert_eq!(fx.peripheral.counter_kind_writes, vec![(0xFF, 2)]);
        assert_eq!(fx.settings.counter_types(), (0xFF, 2));
        assert_eq!(fx.counters.current(&fx.data), (0xFF, 2));
    }

    #[test]
    fn rejected_counter_kinds_leave_settings_alone() {
        let mut fx = Fixture::new();
        fx.peripheral.accept_counter_kinds = false;
        let before = fx.settings.counter_types();
        assert!(!fx.respond(json!({ "key": KEY, "ctype0": 2 })));
        assert_eq!(fx.settings.counter_types(), before);
        assert_eq!(fx.counters.current(&fx.data), (0, 2));

        fx.peripheral.accept_counter_kinds = true;
        assert!(!fx.respond(json!({ "key": KEY, "ctype0": 2, "ctype1": 7 })));
        assert!(!fx.respond(json!({ "key": KEY, "ctype1": "2" })));
        assert_eq!(fx.peripheral.counter_kind_writes, vec![(2, 2)]);
    }

    #[test]
    fn response_shape_checks() {
        let mut fx = Fixture::new();
        let mut rc = fx.reconciler();
        assert!(!rc.apply_from_response(b"OK"));
        assert!(!rc.apply_from_response(b"<html>nope</html>"));
        assert!(!rc.apply_from_response(b"{\"key\": broken json"));
        assert!(!rc.apply_from_response(&[b'{'; REMOTE_CONFIG_MAX_SIZE + 1]));
        assert!(!rc.apply_from_response(format!("[{{\"key\":\"{KEY}\"}}]").as_bytes()));
    }

    #[test]
    fn dedicated_fetch_posts_key_to_cfg() {
        let mut fx = Fixture::new();
        let mut http = SimHttp::default();
        http.respond(SimResponse::new(200, &json!({ "key": KEY, "factor1": 100 }).to_string()));

        assert!(fx.reconciler().fetch_and_apply(&mut http, "https://cloud.example"));
        assert_eq!(fx.settings.factor1, 100);
        assert_eq!(fx.store.writes, 1);

        let req = &http.requests[0];
        assert_eq!(req.url, "https://cloud.example/cfg");
        let sent: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(sent, json!({ "key": KEY }));
    }

    #[test]
    fn dedicated_fetch_rejects_unsized_response() {
        let mut fx = Fixture::new();
        let mut http = SimHttp::default();
        let body = json!({ "key": KEY, "factor1": 100 }).to_string();
        http.respond(SimResponse::new(200, &body).with_length(None));
        assert!(!fx.reconciler().fetch_and_apply(&mut http, "https://cloud.example/"));
        assert_eq!(http.requests[0].url, "https://cloud.example/cfg");
        assert_eq!(fx.settings.factor1, DEFAULT_FACTOR);
    }

    #[test]
    fn dedicated_fetch_needs_device_key() {
        let mut fx = Fixture::new();
        fx.settings.waterius_key.clear();
        let mut http = SimHttp::default();
        assert!(!fx.reconciler().fetch_and_apply(&mut http, "https://cloud.example"));
        assert!(http.requests.is_empty());
    }
}

// EOF
