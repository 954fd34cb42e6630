// live_settings.rs - settings updates arriving over the MQTT subscription

use crate::*;

/// Topics ending with this carry a new value for the preceding path segment.
pub const SET_SUFFIX: &str = "/set";

/// Counter kinds as the controller holds them right now.
///
/// The controller snapshot is read once per session and never refreshed after
/// a write-through, so after the first write this context, not the snapshot,
/// is authoritative. Initialized lazily from the snapshot on first use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionCounterContext {
    kinds: Option<(u8, u8)>,
}

impl SessionCounterContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&mut self, data: &AttinyData) -> (u8, u8) {
        *self
            .kinds
            .get_or_insert((data.counter_type0, data.counter_type1))
    }

    pub fn record(&mut self, kinds: (u8, u8)) {
        self.kinds = Some(kinds);
    }
}

/// `waterius/123/f0/set` -> `f0`
pub fn param_from_topic(topic: &str) -> Option<&str> {
    let rest = topic.strip_suffix(SET_SUFFIX)?;
    let param = rest.rsplit('/').next()?;
    (!param.is_empty()).then_some(param)
}

pub struct LiveSettings<'a> {
    pub settings: &'a mut Settings,
    pub data: &'a AttinyData,
    pub counters: &'a mut SessionCounterContext,
    pub peripheral: &'a mut dyn Peripheral,
    pub doc: &'a mut TelemetryDocument,
}

impl LiveSettings<'_> {
    /// Apply one inbound message. Returns true if the telemetry document was
    /// patched and should be republished.
    pub fn update(&mut self, topic: &str, payload: &str) -> bool {
        let Some(param) = param_from_topic(topic) else {
            return false;
        };
        let value = payload.trim();
        info!("MQTT: param={param} value={value}");

        match param {
            "period_min" => self.period(value),
            "f0" => self.factor(0, value),
            "f1" => self.factor(1, value),
            "ch0" => self.channel(0, value),
            "ch1" => self.channel(1, value),
            "cname0" => self.counter_name(0, value),
            "cname1" => self.counter_name(1, value),
            "ctype0" => self.counter_kind(0, value),
            "ctype1" => self.counter_kind(1, value),
            _ => {
                warn!("MQTT: unknown param {param}");
                false
            }
        }
    }

    fn period(&mut self, value: &str) -> bool {
        let Some(period) = parse_int(value, 1, MAX_WAKEUP_PER_MIN as i64) else {
            return false;
        };
        let period = period as u16;
        if self.settings.wakeup_per_min == period {
            return false;
        }
        info!("MQTT: wakeup_per_min {} -> {period}", self.settings.wakeup_per_min);
        self.settings.wakeup_per_min = period;
        self.settings.reset_period_min_tuned();
        self.doc.patch("period_min", period)
    }

    fn factor(&mut self, idx: usize, value: &str) -> bool {
        let Some(factor) = parse_int(value, 1, MAX_FACTOR as i64) else {
            return false;
        };
        let factor = factor as u16;
        let target = match idx {
            0 => &mut self.settings.factor0,
            _ => &mut self.settings.factor1,
        };
        if *target == factor {
            return false;
        }
        info!("MQTT: f{idx} {target} -> {factor}");
        *target = factor;
        self.settings.setup_time = 0;
        self.doc.patch(&format!("f{idx}"), factor)
    }

    fn channel(&mut self, idx: usize, value: &str) -> bool {
        let reading = match value.parse::<f32>() {
            Ok(v) if (0.0..=MAX_CHANNEL_VALUE).contains(&v) => v,
            _ => return false,
        };
        let s = &mut *self.settings;
        let (start, impulses_start, impulses) = match idx {
            0 => (&mut s.channel0_start, &mut s.impulses0_start, self.data.impulses0),
            _ => (&mut s.channel1_start, &mut s.impulses1_start, self.data.impulses1),
        };
        info!("MQTT: ch{idx} {start} -> {reading}");
        *start = reading;
        *impulses_start = impulses;
        s.setup_time = 0;
        self.doc.patch(&format!("ch{idx}"), round_m3(reading as f64))
    }

    fn counter_name(&mut self, idx: usize, value: &str) -> bool {
        let Some(name) = parse_int(value, 0, COUNTER_NAME_MAX as i64) else {
            return false;
        };
        let name = name as u8;
        let target = match idx {
            0 => &mut self.settings.counter0_name,
            _ => &mut self.settings.counter1_name,
        };
        if *target == name {
            return false;
        }
        info!("MQTT: cname{idx} {target} -> {name}");
        *target = name;
        self.settings.setup_time = 0;
        let named = self.doc.patch(&format!("cname{idx}"), name);
        let typed = self
            .doc
            .patch(&format!("data_type{idx}"), data_kind_by_name(name) as u8);
        named || typed
    }

    fn counter_kind(&mut self, idx: usize, value: &str) -> bool {
        let kind = match value.parse::<i64>() {
            Ok(v) if CounterKind::is_valid(v) => v as u8,
            _ => {
                error!("MQTT: bad ctype{idx} {value}");
                return false;
            }
        };
        let current = self.counters.current(self.data);
        let kinds = match idx {
            0 => (kind, current.1),
            _ => (current.0, kind),
        };
        if !write_counter_kinds(self.settings, self.counters, self.peripheral, kinds, current) {
            return false;
        }
        self.settings.setup_time = 0;
        self.doc.patch(&format!("ctype{idx}"), kind)
    }
}

fn parse_int(value: &str, min: i64, max: i64) -> Option<i64> {
    value.parse::<i64>().ok().filter(|v| (min..=max).contains(v))
}


// EOF
