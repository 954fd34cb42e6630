// sim.rs - in-memory collaborators for tests

use std::collections::VecDeque;

use crate::*;

pub struct SimResponse {
    status: u16,
    body: Vec<u8>,
    length: Option<u64>,
    pos: usize,
}

impl SimResponse {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.as_bytes().to_vec(),
            length: Some(body.len() as u64),
            pos: 0,
        }
    }

    pub fn with_length(mut self, length: Option<u64>) -> Self {
        self.length = length;
        self
    }

    pub fn bytes_read(&self) -> usize {
        self.pos
    }
}

impl HttpResponse for SimResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<u64> {
        self.length
    }

    fn read(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        // short reads, like a real socket
        let n = buf.len().min(self.body.len() - self.pos).min(7);
        buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[derive(Debug)]
pub struct SimRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Answers requests from a queue; an empty queue means connection refused.
#[derive(Default)]
pub struct SimHttp {
    responses: VecDeque<SimResponse>,
    pub requests: Vec<SimRequest>,
}

impl SimHttp {
    pub fn respond(&mut self, resp: SimResponse) {
        self.responses.push_back(resp);
    }
}

impl HttpClient for SimHttp {
    fn post<'a>(
        &'a mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> AppResult<Box<dyn HttpResponse + 'a>> {
        self.requests.push(SimRequest {
            url: url.to_owned(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
        });
        match self.responses.pop_front() {
            Some(resp) => Ok(Box::new(resp)),
            None => Err(AppError::Http("connection refused".into())),
        }
    }
}

pub struct SimPeripheral {
    pub mode: WakeMode,
    pub data: AttinyData,
    pub accept_counter_kinds: bool,
    /// Every write-through attempt, accepted or not.
    pub counter_kind_writes: Vec<(u8, u8)>,
    pub wake_periods: Vec<u16>,
    pub transmit_mode_set: bool,
    pub asleep: bool,
    pub broken: bool,
}

impl SimPeripheral {
    pub fn new(data: AttinyData) -> Self {
        Self {
            mode: WakeMode::AutoTransmit,
            data,
            accept_counter_kinds: true,
            counter_kind_writes: Vec::new(),
            wake_periods: Vec::new(),
            transmit_mode_set: false,
            asleep: false,
            broken: false,
        }
    }
}

impl Peripheral for SimPeripheral {
    fn get_mode(&mut self) -> AppResult<WakeMode> {
        if self.broken {
            return Err(AppError::Peripheral("no answer".into()));
        }
        Ok(self.mode)
    }

    fn get_snapshot(&mut self) -> AppResult<AttinyData> {
        if self.broken {
            return Err(AppError::Peripheral("no answer".into()));
        }
        Ok(self.data.clone())
    }

    fn set_counter_kinds(&mut self, kind0: u8, kind1: u8) -> bool {
        self.counter_kind_writes.push((kind0, kind1));
        self.accept_counter_kinds
    }

    fn set_wake_period(&mut self, minutes: u16) -> bool {
        self.wake_periods.push(minutes);
        true
    }

    fn set_transmit_mode(&mut self) {
        self.transmit_mode_set = true;
    }

    fn set_sleep(&mut self) {
        self.asleep = true;
    }
}

/// Keeps the encoded snapshot, so every load goes through the real codec.
#[derive(Default)]
pub struct SimStore {
    bytes: Option<Vec<u8>>,
    pub writes: usize,
}

impl SimStore {
    pub fn with(settings: &Settings) -> Self {
        let mut store = Self::default();
        store.store(settings).unwrap();
        store.writes = 0;
        store
    }

    pub fn settings(&self) -> Settings {
        Settings::from_bytes(self.bytes.as_deref().unwrap()).unwrap()
    }
}

impl SettingsStore for SimStore {
    fn load(&mut self) -> Option<Settings> {
        Settings::from_bytes(self.bytes.as_deref()?)
    }

    fn store(&mut self, settings: &Settings) -> AppResult<()> {
        let mut buf = [0u8; NVS_BUF_SIZE];
        self.bytes = Some(settings.to_bytes(&mut buf)?.to_vec());
        self.writes += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct SimBus {
    pub broker: String,
    pub connected: bool,
    pub connect_failures: u32,
    pub connect_attempts: u32,
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    pub published: Vec<(String, String, bool)>,
    /// Deliver our own publishes back when they match the subscription,
    /// like a real broker.
    pub echo: bool,
    queue: VecDeque<InboundMessage>,
}

impl SimBus {
    pub fn failing(connect_failures: u32) -> Self {
        Self { connect_failures, ..Self::default() }
    }

    pub fn echoing() -> Self {
        Self { echo: true, ..Self::default() }
    }

    fn subscribed_to(&self, topic: &str) -> bool {
        self.subscribed
            .iter()
            .filter(|s| !self.unsubscribed.contains(*s))
            .filter_map(|s| s.strip_suffix('#'))
            .any(|prefix| topic.starts_with(prefix))
    }

    pub fn inbound(&mut self, topic: &str, payload: &str) {
        self.queue.push_back(InboundMessage {
            topic: topic.to_owned(),
            payload: payload.as_bytes().to_vec(),
        });
    }
}

impl MessageBus for SimBus {
    fn connect(&mut self, broker: &str, _client_id: &str, _login: Option<&str>, _password: Option<&str>) -> bool {
        self.connect_attempts += 1;
        self.broker = broker.to_owned();
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return false;
        }
        self.connected = true;
        true
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        self.subscribed.push(topic.to_owned());
        true
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        self.unsubscribed.push(topic.to_owned());
        true
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool {
        if self.echo && self.subscribed_to(topic) {
            self.queue.push_back(InboundMessage {
                topic: topic.to_owned(),
                payload: payload.to_vec(),
            });
        }
        let payload = String::from_utf8_lossy(payload).into_owned();
        self.published.push((topic.to_owned(), payload, retain));
        true
    }

    fn poll(&mut self, _timeout_ms: u32) -> Option<InboundMessage> {
        self.queue.pop_front()
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

pub struct SimClock {
    pub now: DateTime<Utc>,
    pub sync_ok: bool,
    pub syncs: Vec<String>,
    pub delays: Vec<u32>,
    pub uptime: u32,
}

impl Default for SimClock {
    fn default() -> Self {
        Self::at(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl SimClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            sync_ok: true,
            syncs: Vec::new(),
            delays: Vec::new(),
            uptime: 0,
        }
    }
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn sync(&mut self, server: &str) -> bool {
        self.syncs.push(server.to_owned());
        if self.sync_ok && !is_valid_time(self.now) {
            self.now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        }
        self.sync_ok
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
        self.uptime += ms;
    }

    fn uptime_ms(&self) -> u32 {
        self.uptime
    }
}

pub struct SimNetwork {
    pub connect_ok: bool,
    pub connects: u32,
    pub shutdowns: u32,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self { connect_ok: true, connects: 0, shutdowns: 0 }
    }
}

impl Network for SimNetwork {
    fn connect(&mut self, _settings: &Settings) -> bool {
        self.connects += 1;
        self.connect_ok
    }

    fn shutdown(&mut self) {
        self.shutdowns += 1;
    }
}

/// Pretends the user typed a device key into the setup page.
#[derive(Default)]
pub struct SimPortal {
    pub runs: u32,
}

impl SetupPortal for SimPortal {
    fn run(&mut self, settings: &mut Settings, _cdata: &CalculatedData) {
        self.runs += 1;
        settings.waterius_key = "from-portal".into();
    }
}

/// A whole device: counter controller, flash, radio and clock.
pub struct SimDevice {
    pub peripheral: SimPeripheral,
    pub store: SimStore,
    pub network: SimNetwork,
    pub http: SimHttp,
    pub bus: SimBus,
    pub clock: SimClock,
    pub portal: SimPortal,
}

impl SimDevice {
    pub fn new(settings: &Settings, data: AttinyData) -> Self {
        Self {
            peripheral: SimPeripheral::new(data),
            store: SimStore::with(settings),
            network: SimNetwork::default(),
            http: SimHttp::default(),
            bus: SimBus::default(),
            clock: SimClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()),
            portal: SimPortal::default(),
        }
    }

    pub fn run(&mut self) -> SessionEnd {
        let mut hw = Hardware {
            peripheral: &mut self.peripheral,
            store: &mut self.store,
            network: &mut self.network,
            http: &mut self.http,
            bus: &mut self.bus,
            clock: &mut self.clock,
            portal: &mut self.portal,
            device_name: "waterius-00c0ffee",
        };
        run_session(&mut hw)
    }
}

// EOF
