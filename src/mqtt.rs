// mqtt.rs

use crate::*;

pub const MQTT_MAX_TRIES: u32 = 5;
pub const MQTT_CONNECT_DELAY_MS: u32 = 100;
pub const MQTT_POLL_MS: u32 = 500;
const MQTT_SUBSCRIPTION_TOPIC: &str = "/#";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub trait MessageBus {
    /// One connection attempt to `broker` (`mqtt://host:port`).
    fn connect(&mut self, broker: &str, client_id: &str, login: Option<&str>, password: Option<&str>) -> bool;
    fn is_connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str) -> bool;
    fn unsubscribe(&mut self, topic: &str) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool;
    /// Next message from the subscription, waiting at most `timeout_ms`.
    fn poll(&mut self, timeout_ms: u32) -> Option<InboundMessage>;
    fn disconnect(&mut self);
}

/// Device topic prefix without a trailing slash.
pub fn base_topic(settings: &Settings) -> &str {
    settings.mqtt_topic.trim_end_matches('/')
}

pub fn broker_url(settings: &Settings) -> String {
    format!("mqtt://{}:{}", settings.mqtt_host, settings.mqtt_port)
}

pub fn subscription_topic(settings: &Settings) -> String {
    format!("{}{MQTT_SUBSCRIPTION_TOPIC}", base_topic(settings))
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

pub fn mqtt_connect(
    bus: &mut dyn MessageBus,
    clock: &mut dyn Clock,
    settings: &Settings,
    client_id: &str,
) -> bool {
    let login = non_empty(&settings.mqtt_login);
    let pass = non_empty(&settings.mqtt_password);
    let broker = broker_url(settings);
    info!("MQTT: Connecting to {broker} ...");
    for attempt in 1..=MQTT_MAX_TRIES {
        info!("MQTT: Attempt #{attempt} from {MQTT_MAX_TRIES}");
        if bus.connect(&broker, client_id, login, pass) {
            info!("MQTT: Connected.");
            return true;
        }
        error!("MQTT: Connect failed");
        clock.delay_ms(MQTT_CONNECT_DELAY_MS);
    }
    error!("MQTT: All connection attempts failed");
    false
}

/// Connect and subscribe to every device sub-topic.
pub fn mqtt_open(
    bus: &mut dyn MessageBus,
    clock: &mut dyn Clock,
    settings: &Settings,
    client_id: &str,
) -> bool {
    if !mqtt_connect(bus, clock, settings, client_id) {
        return false;
    }
    let topic = subscription_topic(settings);
    if !bus.subscribe(&topic) {
        error!("MQTT: Failed Subscribe to {topic}");
        return false;
    }
    info!("MQTT: Subscribed to {topic}");
    true
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        v => v.to_string(),
    }
}

/// Publish every document field retained under `{base}/{field}`.
pub fn publish_document(bus: &mut dyn MessageBus, base: &str, doc: &TelemetryDocument) -> bool {
    if doc.is_empty() {
        warn!("MQTT: Nothing to publish");
        return false;
    }
    let mut ok = true;
    for (key, value) in doc.iter() {
        let topic = format!("{base}/{key}");
        let text = value_text(value);
        if !bus.publish(&topic, text.as_bytes(), true) {
            error!("MQTT: Publish failed {topic}");
            ok = false;
        }
    }
    info!("MQTT: Published {} fields", doc.len());
    ok
}

/// Drain inbound messages. A `/set` command clears its retained topic; a
/// message that patched the document triggers an immediate republish.
/// Echoes of our own telemetry arrive here too and are left alone.
pub fn process_inbound(
    bus: &mut dyn MessageBus,
    live: &mut LiveSettings<'_>,
    base: &str,
    wait_ms: u32,
) -> usize {
    let mut count = 0;
    while let Some(msg) = bus.poll(wait_ms) {
        count += 1;
        let payload = String::from_utf8_lossy(&msg.payload);
        info!("MQTT: CB topic={} len={}", msg.topic, msg.payload.len());

        if live.update(&msg.topic, &payload) {
            publish_document(bus, base, live.doc);
        }
        if !msg.payload.is_empty() && param_from_topic(&msg.topic).is_some() {
            info!("MQTT: rm retain={}", msg.topic);
            bus.publish(&msg.topic, b"", true);
        }
    }
    count
}

/// The message-bus delivery channel.
pub fn send_mqtt(
    bus: &mut dyn MessageBus,
    clock: &mut dyn Clock,
    live: &mut LiveSettings<'_>,
    client_id: &str,
) -> Delivery {
    if !live.settings.mqtt_enabled() {
        info!("MQTT: SKIP");
        return Delivery::Skipped;
    }
    let start = clock.uptime_ms();
    if !bus.is_connected() && !mqtt_connect(bus, clock, live.settings, client_id) {
        return Delivery::Failed;
    }

    let base = base_topic(live.settings).to_owned();
    let ok = publish_document(bus, &base, live.doc);
    process_inbound(bus, live, &base, MQTT_POLL_MS);

    let topic = subscription_topic(live.settings);
    if bus.unsubscribe(&topic) {
        info!("MQTT: Unsubscribed from {topic}");
    }
    bus.disconnect();

    let elapsed = clock.uptime_ms().wrapping_sub(start);
    if ok {
        info!("MQTT: Data sent. Time {elapsed} ms");
        Delivery::Sent
    } else {
        error!("MQTT: Failed send data. Time {elapsed} ms");
        Delivery::Failed
    }
}


// EOF
