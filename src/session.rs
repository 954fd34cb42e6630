// session.rs - one wake cycle, from controller snapshot to sleep

use crate::*;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Radio link to the access point.
pub trait Network {
    fn connect(&mut self, settings: &Settings) -> bool;
    fn shutdown(&mut self);
}

/// Local configuration portal used in setup mode. Returns when the user is done.
pub trait SetupPortal {
    fn run(&mut self, settings: &mut Settings, cdata: &CalculatedData);
}

/// Everything a session talks to.
pub struct Hardware<'a> {
    pub peripheral: &'a mut dyn Peripheral,
    pub store: &'a mut dyn SettingsStore,
    pub network: &'a mut dyn Network,
    pub http: &'a mut dyn HttpClient,
    pub bus: &'a mut dyn MessageBus,
    pub clock: &'a mut dyn Clock,
    pub portal: &'a mut dyn SetupPortal,
    /// Also used as the MQTT client id.
    pub device_name: &'a str,
}

/// How a session hands control back to the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Reboot now. Settings are already persisted.
    Restart,
    /// Deep sleep until the controller wakes us again.
    Sleep,
}

pub fn max_wakeups_before_heartbeat(wakeup_per_min: u16) -> u16 {
    match wakeup_per_min {
        0 => 1,
        period => (MINUTES_PER_DAY / period).max(1),
    }
}

struct Session {
    mode: WakeMode,
    data: AttinyData,
    cdata: CalculatedData,
    settings: Settings,
    counters: SessionCounterContext,
    doc: TelemetryDocument,
}

pub fn run_session(hw: &mut Hardware<'_>) -> SessionEnd {
    let (mode, data) = match read_controller(hw.peripheral) {
        Ok(v) => v,
        Err(e) => {
            error!("Counter controller not answering: {e}");
            return go_to_sleep(hw);
        }
    };
    info!("Startup mode: {mode:?}, controller v{}", data.version);

    let loaded = hw.store.load();
    let settings_loaded = loaded.is_some();
    let mut settings = loaded.unwrap_or_default();
    let cdata = CalculatedData::compute(&settings, &data);

    if mode == WakeMode::Setup {
        return run_setup(hw, &mut settings, &cdata);
    }
    if !settings_loaded {
        error!("Settings not loaded, going back to sleep");
        return go_to_sleep(hw);
    }
    if settings.config_restart_pending {
        info!("Restart after config change detected - will send updated data");
    }

    let mut session = Session {
        mode,
        data,
        cdata,
        settings,
        counters: SessionCounterContext::new(),
        doc: TelemetryDocument::new(),
    };

    if session.transmission_allowed() {
        if hw.network.connect(&session.settings) {
            if let Some(end) = session.transmit(hw) {
                return end;
            }
        } else {
            error!("Network connect failed");
            hw.network.shutdown();
        }
    }

    if session.settings.config_restart_pending {
        info!("Clearing config_restart_pending flag");
        session.settings.config_restart_pending = false;
    }
    store_settings(hw.store, &session.settings);
    go_to_sleep(hw)
}

fn read_controller(peripheral: &mut dyn Peripheral) -> AppResult<(WakeMode, AttinyData)> {
    let mode = peripheral.get_mode()?;
    let data = peripheral.get_snapshot()?;
    Ok((mode, data))
}

fn go_to_sleep(hw: &mut Hardware<'_>) -> SessionEnd {
    info!("Going to sleep");
    hw.peripheral.set_sleep();
    SessionEnd::Sleep
}

fn run_setup(hw: &mut Hardware<'_>, settings: &mut Settings, cdata: &CalculatedData) -> SessionEnd {
    info!("Entering setup mode...");
    hw.portal.run(settings, cdata);
    settings.setup_time = hw.clock.uptime_ms();
    settings.setup_finished_counter = settings.setup_finished_counter.saturating_add(1);
    info!(
        "Setup finished in {} ms ({} times)",
        settings.setup_time, settings.setup_finished_counter
    );
    store_settings(hw.store, settings);
    hw.network.shutdown();
    hw.peripheral.set_transmit_mode();
    SessionEnd::Restart
}

impl Session {
    /// The wake-on-consumption gate. On a suppressed wake the baselines still
    /// advance and the without-send counter grows.
    fn transmission_allowed(&mut self) -> bool {
        let s = &mut self.settings;
        if !(s.wake_on_consumption_only && self.mode == WakeMode::AutoTransmit) {
            return true;
        }
        let has_consumption = self.cdata.has_consumption();
        let max_wakeups = max_wakeups_before_heartbeat(s.wakeup_per_min);
        let heartbeat = s.wakeups_without_send >= max_wakeups;
        info!(
            "WOC: consumption={has_consumption} wakeups_without_send={}/{max_wakeups}",
            s.wakeups_without_send
        );
        if has_consumption || heartbeat {
            return true;
        }

        update_baselines(s, &self.data);
        s.wakeups_without_send = s.wakeups_without_send.saturating_add(1);
        info!("WOC: No consumption, skipping transmission");
        false
    }

    /// Network is up. Returns Some only for a config restart.
    fn transmit(&mut self, hw: &mut Hardware<'_>) -> Option<SessionEnd> {
        let client_id = hw.device_name;

        if self.settings.mqtt_enabled() && mqtt_open(hw.bus, hw.clock, &self.settings, client_id) {
            let base = base_topic(&self.settings).to_owned();
            let mut live = LiveSettings {
                settings: &mut self.settings,
                data: &self.data,
                counters: &mut self.counters,
                peripheral: &mut *hw.peripheral,
                doc: &mut self.doc,
            };
            process_inbound(hw.bus, &mut live, &base, MQTT_POLL_MS);
        }

        if self.settings.needs_wall_clock() {
            sync_time(hw.clock, &mut self.settings, self.mode);
        }

        let now = Some(hw.clock.now()).filter(|t| is_valid_time(*t));
        let kinds = self.counters.current(&self.data);
        self.doc = TelemetryDocument::build(&self.settings, &self.data, &self.cdata, kinds, self.mode, now);

        for channel in [HttpChannel::Cloud, HttpChannel::Http] {
            let mut rc = Reconciler {
                settings: &mut self.settings,
                data: &self.data,
                counters: &mut self.counters,
                peripheral: &mut *hw.peripheral,
                store: &mut *hw.store,
            };
            if send_http(channel, hw.http, &*hw.clock, &mut rc, &self.doc) == Delivery::ConfigChanged {
                return Some(self.restart_after_config(hw));
            }
        }

        let mut live = LiveSettings {
            settings: &mut self.settings,
            data: &self.data,
            counters: &mut self.counters,
            peripheral: &mut *hw.peripheral,
            doc: &mut self.doc,
        };
        send_mqtt(hw.bus, hw.clock, &mut live, client_id);

        if self.mode == WakeMode::ManualTransmit {
            if self.settings.config_restart_pending {
                info!("RCFG: Skipping /cfg fetch (restart after config change)");
            } else if self.fetch_config(hw) {
                info!("RCFG: Config changed! Restarting to apply...");
                return Some(self.restart_after_config(hw));
            }
        }

        hw.network.shutdown();
        update_baselines(&mut self.settings, &self.data);
        if self.settings.wakeups_without_send > 0 {
            info!("WOC: Resetting counter ({} -> 0)", self.settings.wakeups_without_send);
            self.settings.wakeups_without_send = 0;
        }
        if !hw.peripheral.set_wake_period(self.settings.period_min_tuned) {
            error!("Wake period write failed");
        }
        None
    }

    /// Dedicated fetch against the cloud host, else the generic HTTP URL.
    fn fetch_config(&mut self, hw: &mut Hardware<'_>) -> bool {
        let base = [HttpChannel::Cloud, HttpChannel::Http]
            .into_iter()
            .find_map(|ch| ch.endpoint(&self.settings))
            .map(str::to_owned);
        let Some(base) = base else {
            info!("RCFG: No endpoint for config fetch");
            return false;
        };
        Reconciler {
            settings: &mut self.settings,
            data: &self.data,
            counters: &mut self.counters,
            peripheral: &mut *hw.peripheral,
            store: &mut *hw.store,
        }
        .fetch_and_apply(hw.http, &base)
    }

    fn restart_after_config(&mut self, hw: &mut Hardware<'_>) -> SessionEnd {
        self.settings.config_restart_pending = true;
        store_settings(hw.store, &self.settings);
        hw.network.shutdown();
        SessionEnd::Restart
    }
}


// EOF
