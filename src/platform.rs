// platform.rs - ESP-IDF implementations of the session collaborators

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::time::Duration;

use embedded_svc::{
    http::{client::Client, Headers, Status},
    io::{Read, Write},
};
use esp_idf_hal::{delay::FreeRtos, modem::Modem};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::client::{Configuration as HttpConfiguration, EspHttpConnection},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration, QoS},
    netif::{EspNetif, NetifConfiguration},
    nvs::{self, EspDefaultNvsPartition},
    sntp,
    wifi::{BlockingWifi, ClientConfiguration, Configuration as WifiConfiguration, EspWifi},
};

use crate::*;

const SETTINGS_KEY: &str = "settings";
const NTP_WAIT_ROUNDS: u32 = 50;
const NTP_WAIT_MS: u32 = 200;
const MQTT_CONNECT_WAIT_ROUNDS: u32 = 50;
const MQTT_RX_QUEUE: usize = 16;

pub struct NvsStore {
    nvs: nvs::EspNvs<nvs::NvsDefault>,
}

impl NvsStore {
    pub fn new(partition: EspDefaultNvsPartition, namespace: &str) -> AppResult<Self> {
        let nvs = nvs::EspNvs::new(partition, namespace, true)
            .map_err(|e| AppError::Storage(format!("Could not get namespace {namespace}: {e:?}")))?;
        info!("Got namespace {namespace:?} from default partition");
        Ok(Self { nvs })
    }
}

impl SettingsStore for NvsStore {
    fn load(&mut self) -> Option<Settings> {
        let mut nvsbuf = [0u8; NVS_BUF_SIZE];
        match self.nvs.get_raw(SETTINGS_KEY, &mut nvsbuf) {
            Ok(Some(b)) => {
                info!("Got {sz} bytes from nvs. Parsing settings...", sz = b.len());
                Settings::from_bytes(b)
            }
            Ok(None) => {
                error!("Nvs key not found");
                None
            }
            Err(e) => {
                error!("Nvs read error {e:?}");
                None
            }
        }
    }

    fn store(&mut self, settings: &Settings) -> AppResult<()> {
        let mut nvsbuf = [0u8; NVS_BUF_SIZE];
        let data = settings.to_bytes(&mut nvsbuf)?;
        self.nvs
            .set_raw(SETTINGS_KEY, data)
            .map_err(|e| AppError::Storage(format!("Cannot save to nvs: {e:?}")))?;
        Ok(())
    }
}

fn http_err<E: core::fmt::Debug>(e: E) -> AppError {
    AppError::Http(format!("{e:?}"))
}

pub struct EspHttp {
    client: Client<EspHttpConnection>,
}

impl EspHttp {
    pub fn new() -> AppResult<Self> {
        let conf = HttpConfiguration {
            timeout: Some(Duration::from_millis(SERVER_TIMEOUT_MS)),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let conn = EspHttpConnection::new(&conf).map_err(http_err)?;
        Ok(Self { client: Client::wrap(conn) })
    }
}

struct EspHttpResponse<'a> {
    resp: embedded_svc::http::client::Response<&'a mut EspHttpConnection>,
}

impl HttpResponse for EspHttpResponse<'_> {
    fn status(&self) -> u16 {
        self.resp.status()
    }

    fn content_length(&self) -> Option<u64> {
        self.resp.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    fn read(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        self.resp.read(buf).map_err(http_err)
    }
}

impl HttpClient for EspHttp {
    fn post<'a>(
        &'a mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> AppResult<Box<dyn HttpResponse + 'a>> {
        let len = body.len().to_string();
        let mut all_headers = headers.to_vec();
        all_headers.push(("Content-Length", &len));

        let mut req = self.client.post(url, &all_headers).map_err(http_err)?;
        req.write_all(body).map_err(http_err)?;
        req.flush().map_err(http_err)?;
        let resp = req.submit().map_err(http_err)?;
        Ok(Box::new(EspHttpResponse { resp }))
    }
}

/// MQTT over the ESP-IDF client. Events are pumped by a reader thread into a
/// channel so the session can poll with a timeout.
#[derive(Default)]
pub struct EspMqttBus {
    client: Option<EspMqttClient<'static>>,
    rx: Option<mpsc::Receiver<InboundMessage>>,
    connected: Arc<AtomicBool>,
}

impl EspMqttBus {
    fn try_connect(
        &mut self,
        broker: &str,
        client_id: &str,
        login: Option<&str>,
        password: Option<&str>,
    ) -> AppResult<()> {
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: login,
            password,
            ..Default::default()
        };
        let (client, mut conn) = EspMqttClient::new(broker, &conf)
            .map_err(|e| AppError::Message(format!("MQTT conn failed: {e:?}")))?;

        let (tx, rx) = mpsc::sync_channel(MQTT_RX_QUEUE);
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();
        std::thread::Builder::new()
            .stack_size(6 * 1024)
            .spawn(move || {
                while let Ok(event) = conn.next() {
                    match event.payload() {
                        EventPayload::Connected(_) => flag.store(true, Ordering::Relaxed),
                        EventPayload::Disconnected => flag.store(false, Ordering::Relaxed),
                        EventPayload::Received { topic: Some(topic), data, .. } => {
                            let msg = InboundMessage { topic: topic.to_owned(), payload: data.to_vec() };
                            if tx.try_send(msg).is_err() {
                                warn!("MQTT: rx queue full, dropping message");
                            }
                        }
                        _ => {}
                    }
                }
                flag.store(false, Ordering::Relaxed);
                info!("MQTT connection closed.");
            })
            .map_err(|e| AppError::Message(format!("MQTT thread: {e}")))?;

        for _ in 0..MQTT_CONNECT_WAIT_ROUNDS {
            if connected.load(Ordering::Relaxed) {
                break;
            }
            FreeRtos::delay_ms(MQTT_CONNECT_DELAY_MS);
        }
        if !connected.load(Ordering::Relaxed) {
            return Err(AppError::Message("MQTT broker did not answer".into()));
        }
        self.client = Some(client);
        self.rx = Some(rx);
        self.connected = connected;
        Ok(())
    }
}

impl MessageBus for EspMqttBus {
    fn connect(&mut self, broker: &str, client_id: &str, login: Option<&str>, password: Option<&str>) -> bool {
        match self.try_connect(broker, client_id, login, password) {
            Ok(()) => true,
            Err(e) => {
                error!("{e}");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        self.client
            .as_mut()
            .is_some_and(|c| c.subscribe(topic, QoS::AtLeastOnce).is_ok())
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        self.client.as_mut().is_some_and(|c| c.unsubscribe(topic).is_ok())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        match client.publish(topic, QoS::AtLeastOnce, retain, payload) {
            Ok(_) => true,
            Err(e) => {
                error!("MQTT send error: {e}");
                false
            }
        }
    }

    fn poll(&mut self, timeout_ms: u32) -> Option<InboundMessage> {
        self.rx
            .as_ref()?
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
            .ok()
    }

    fn disconnect(&mut self) {
        self.rx = None;
        self.client = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct SntpClock;

impl Clock for SntpClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sync(&mut self, server: &str) -> bool {
        let mut conf = sntp::SntpConf::default();
        conf.servers[0] = server;
        let ntp = match sntp::EspSntp::new(&conf) {
            Ok(ntp) => ntp,
            Err(e) => {
                error!("NTP: start failed: {e:?}");
                return false;
            }
        };
        for _ in 0..NTP_WAIT_ROUNDS {
            if ntp.get_sync_status() == sntp::SyncStatus::Completed && is_valid_time(Utc::now()) {
                info!("NTP ok.");
                return true;
            }
            FreeRtos::delay_ms(NTP_WAIT_MS);
        }
        false
    }

    fn delay_ms(&mut self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }

    fn uptime_ms(&self) -> u32 {
        (unsafe { esp_idf_sys::esp_timer_get_time() } / 1000) as u32
    }
}

/// Station netif with a fixed address. The gateway doubles as DNS server.
fn static_netif(settings: &Settings) -> anyhow::Result<EspNetif> {
    let mask = Mask::try_from(settings.mask)
        .map_err(|_| anyhow::anyhow!("invalid subnet mask: {}", settings.mask))?;
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: settings.ip,
                subnet: Subnet { gateway: settings.gateway, mask },
                dns: Some(settings.gateway),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };
    Ok(EspNetif::new_with_conf(&conf)?)
}

pub struct WifiNetwork {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl WifiNetwork {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), Some(partition))?;
        let wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;
        Ok(Self { wifi })
    }

    /// Last three MAC bytes, hex.
    pub fn chip_id(&self) -> anyhow::Result<String> {
        let mac = self.wifi.wifi().sta_netif().get_mac()?;
        Ok(format!("{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5]))
    }

    fn try_connect(&mut self, settings: &Settings) -> anyhow::Result<()> {
        if settings.dhcp_off {
            let netif = static_netif(settings)?;
            self.wifi.wifi_mut().swap_netif_sta(netif)?;
            info!("Static IP {} gw {} mask {}", settings.ip, settings.gateway, settings.mask);
        }
        self.wifi.set_configuration(&WifiConfiguration::Client(ClientConfiguration {
            ssid: settings
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("SSID too long"))?,
            password: settings
                .wifi_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("password too long"))?,
            ..Default::default()
        }))?;
        self.wifi.start()?;
        self.wifi.connect()?;
        self.wifi.wait_netif_up()?;
        let ip_info = self.wifi.wifi().sta_netif().get_ip_info()?;
        info!("WiFi connected. IP: {}", ip_info.ip);
        Ok(())
    }
}

impl Network for WifiNetwork {
    fn connect(&mut self, settings: &Settings) -> bool {
        if settings.wifi_ssid.is_empty() {
            error!("No SSID configured");
            return false;
        }
        match self.try_connect(settings) {
            Ok(()) => true,
            Err(e) => {
                error!("WiFi connect failed: {e:?}");
                false
            }
        }
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.wifi.disconnect() {
            warn!("WiFi disconnect: {e:?}");
        }
        if let Err(e) = self.wifi.stop() {
            warn!("WiFi stop: {e:?}");
        }
    }
}

/// Setup without the web UI: seeds WiFi credentials from build-time
/// `WIFI_SSID` / `WIFI_PASS` and reports the current readings.
#[derive(Default)]
pub struct BuildTimePortal;

impl SetupPortal for BuildTimePortal {
    fn run(&mut self, settings: &mut Settings, cdata: &CalculatedData) {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            apply_text(&mut settings.wifi_ssid, ssid, WIFI_SSID_LEN);
        }
        if let Some(pass) = option_env!("WIFI_PASS") {
            apply_text(&mut settings.wifi_password, pass, WIFI_PWD_LEN);
        }
        info!(
            "Setup: ssid={:?} ch0={:.3} ch1={:.3}",
            settings.wifi_ssid, cdata.channel0, cdata.channel1
        );
    }
}

// EOF
