// settings.rs

use crc::{Crc, CRC_32_ISCSI};

use crate::*;

/// Bumped whenever the persisted layout changes; older snapshots are discarded.
pub const SETTINGS_VERSION: u8 = 1;

pub const NVS_BUF_SIZE: usize = 1024;

// Capacities are buffer sizes including the terminator, so a value fits
// when its length is strictly below the capacity.
pub const SERIAL_LEN: usize = 16;
pub const WIFI_SSID_LEN: usize = 33;
pub const WIFI_PWD_LEN: usize = 65;
pub const HOST_LEN: usize = 64;
pub const MQTT_LOGIN_LEN: usize = 32;
pub const MQTT_PASSWORD_LEN: usize = 66;
pub const MQTT_TOPIC_LEN: usize = 64;
pub const WATERIUS_KEY_LEN: usize = 34;
pub const EMAIL_LEN: usize = 40;
pub const COMPANY_LEN: usize = 32;
pub const PLACE_LEN: usize = 32;

pub const DEFAULT_WAKEUP_PER_MIN: u16 = 1440;
pub const MAX_WAKEUP_PER_MIN: u16 = 1440;
pub const DEFAULT_FACTOR: u16 = 10;
pub const MAX_FACTOR: u16 = 10000;
pub const MAX_CHANNEL_VALUE: f32 = 999_999.0;

/// Electrical interface of a counter input, as understood by the counter controller.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterKind {
    Namur = 0,
    Electronic = 2,
    Disabled = 0xFF,
}

impl TryFrom<u8> for CounterKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Namur),
            2 => Ok(Self::Electronic),
            0xFF => Ok(Self::Disabled),
            _ => Err(()),
        }
    }
}

impl CounterKind {
    pub fn is_valid(raw: i64) -> bool {
        u8::try_from(raw).ok().and_then(|v| Self::try_from(v).ok()).is_some()
    }
}

/// What a counter measures. Selected by the user, reported as `cname0/1`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterName {
    WaterCold = 0,
    WaterHot = 1,
    Electricity = 2,
    Gas = 3,
    HeatGcal = 4,
    PotableWater = 5,
    Other = 6,
    HeatKwh = 7,
}

pub const COUNTER_NAME_MAX: u8 = CounterName::HeatKwh as u8;

/// Coarse measurement category derived from the counter name (`data_type0/1`).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataKind {
    ColdWater = 0,
    HotWater = 1,
    Electricity = 2,
    Gas = 3,
    Heat = 4,
    Other = 5,
}

impl CounterName {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::WaterCold,
            1 => Self::WaterHot,
            2 => Self::Electricity,
            3 => Self::Gas,
            4 => Self::HeatGcal,
            5 => Self::PotableWater,
            6 => Self::Other,
            7 => Self::HeatKwh,
            _ => return None,
        })
    }

    pub fn data_kind(self) -> DataKind {
        match self {
            Self::WaterCold | Self::PotableWater => DataKind::ColdWater,
            Self::WaterHot => DataKind::HotWater,
            Self::Electricity => DataKind::Electricity,
            Self::Gas => DataKind::Gas,
            Self::HeatGcal | Self::HeatKwh => DataKind::Heat,
            Self::Other => DataKind::Other,
        }
    }
}

pub fn data_kind_by_name(raw: u8) -> DataKind {
    CounterName::from_raw(raw).map_or(DataKind::Other, CounterName::data_kind)
}

/// The persistent device record. Survives deep sleep via the settings store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u8,

    pub waterius_key: String,
    pub waterius_email: String,
    pub company: String,
    pub place: String,

    pub waterius_on: bool,
    pub waterius_host: String,

    pub http_on: bool,
    pub http_url: String,

    pub mqtt_on: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_login: String,
    pub mqtt_password: String,
    pub mqtt_topic: String,
    pub mqtt_auto_discovery: bool,
    pub mqtt_discovery_topic: String,

    pub wifi_ssid: String,
    pub wifi_password: String,
    pub ntp_server: String,

    pub dhcp_off: bool,
    pub ip: net::Ipv4Addr,
    pub gateway: net::Ipv4Addr,
    pub mask: net::Ipv4Addr,
    pub mdns_on: bool,

    pub channel0_start: f32,
    pub channel1_start: f32,
    pub impulses0_start: u32,
    pub impulses1_start: u32,
    pub impulses0_previous: u32,
    pub impulses1_previous: u32,
    pub factor0: u16,
    pub factor1: u16,
    pub counter0_name: u8,
    pub counter1_name: u8,
    pub counter0_type: u8,
    pub counter1_type: u8,
    pub serial0: String,
    pub serial1: String,

    pub wakeup_per_min: u16,
    pub period_min_tuned: u16,
    /// Unix seconds of the last successful time sync, 0 if never.
    pub last_ntp_sync: i64,
    pub ntp_error_counter: u16,

    pub wake_on_consumption_only: bool,
    pub wakeups_without_send: u16,
    pub config_restart_pending: bool,
    pub setup_time: u32,
    pub setup_finished_counter: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,

            waterius_key: String::new(),
            waterius_email: String::new(),
            company: String::new(),
            place: String::new(),

            waterius_on: true,
            waterius_host: "https://cloud.waterius.ru".into(),

            http_on: false,
            http_url: String::new(),

            mqtt_on: false,
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_login: String::new(),
            mqtt_password: String::new(),
            mqtt_topic: "waterius".into(),
            mqtt_auto_discovery: true,
            mqtt_discovery_topic: "homeassistant".into(),

            wifi_ssid: option_env!("WIFI_SSID").unwrap_or("").into(),
            wifi_password: option_env!("WIFI_PASS").unwrap_or("").into(),
            ntp_server: "pool.ntp.org".into(),

            dhcp_off: false,
            ip: net::Ipv4Addr::new(0, 0, 0, 0),
            gateway: net::Ipv4Addr::new(0, 0, 0, 0),
            mask: net::Ipv4Addr::new(255, 255, 255, 0),
            mdns_on: true,

            channel0_start: 0.0,
            channel1_start: 0.0,
            impulses0_start: 0,
            impulses1_start: 0,
            impulses0_previous: 0,
            impulses1_previous: 0,
            factor0: DEFAULT_FACTOR,
            factor1: DEFAULT_FACTOR,
            counter0_name: CounterName::WaterCold as u8,
            counter1_name: CounterName::WaterHot as u8,
            counter0_type: CounterKind::Namur as u8,
            counter1_type: CounterKind::Namur as u8,
            serial0: String::new(),
            serial1: String::new(),

            wakeup_per_min: DEFAULT_WAKEUP_PER_MIN,
            period_min_tuned: DEFAULT_WAKEUP_PER_MIN,
            last_ntp_sync: 0,
            ntp_error_counter: 0,

            wake_on_consumption_only: false,
            wakeups_without_send: 0,
            config_restart_pending: false,
            setup_time: 0,
            setup_finished_counter: 0,
        }
    }
}

/// Replace `target` with `value` if it fits `capacity`.
/// Returns true only when the stored value actually changed.
pub fn apply_text(target: &mut String, value: &str, capacity: usize) -> bool {
    if value.len() >= capacity || target == value {
        return false;
    }
    target.clear();
    target.push_str(value);
    true
}

/// Replace `target` with `value` if it lies within `min..=max`.
/// Out-of-range values are ignored, never clamped.
pub fn apply_range<T: PartialOrd + Copy>(target: &mut T, value: T, min: T, max: T) -> bool {
    if value < min || value > max || *target == value {
        return false;
    }
    *target = value;
    true
}

pub fn apply_value<T: PartialEq>(target: &mut T, value: T) -> bool {
    if *target == value {
        return false;
    }
    *target = value;
    true
}

impl Settings {
    pub fn reset_period_min_tuned(&mut self) {
        self.period_min_tuned = self.wakeup_per_min;
    }

    /// Cloud channel is usable: enabled and has a host.
    pub fn cloud_enabled(&self) -> bool {
        self.waterius_on && !self.waterius_host.is_empty()
    }

    pub fn http_enabled(&self) -> bool {
        self.http_on && !self.http_url.is_empty()
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_on && !self.mqtt_host.is_empty()
    }

    /// Secure transports need a valid wall clock for certificate checks.
    pub fn needs_wall_clock(&self) -> bool {
        self.mqtt_enabled()
            || (self.cloud_enabled() && is_https(&self.waterius_host))
            || (self.http_enabled() && is_https(&self.http_url))
    }

    pub fn counter_types(&self) -> (u8, u8) {
        (self.counter0_type, self.counter1_type)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let digest = crc.digest();
        match postcard::from_bytes_crc32::<Settings>(bytes, digest) {
            Ok(s) if s.version == SETTINGS_VERSION => {
                info!("Successfully parsed settings.");
                Some(s)
            }
            Ok(s) => {
                error!(
                    "Settings version mismatch (stored {v}, expected {SETTINGS_VERSION})",
                    v = s.version
                );
                None
            }
            Err(e) => {
                error!("Cannot parse settings: {e:?}");
                None
            }
        }
    }

    pub fn to_bytes<'a>(&self, buf: &'a mut [u8]) -> AppResult<&'a mut [u8]> {
        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let digest = crc.digest();
        let data = postcard::to_slice_crc32(self, buf, digest)?;
        info!("Encoded settings to {sz} bytes.", sz = data.len());
        Ok(data)
    }
}

pub fn is_https(url: &str) -> bool {
    url.get(..8).is_some_and(|p| p.eq_ignore_ascii_case("https://"))
}


// EOF
