// bin/esp32waterius.rs

#[cfg(target_os = "espidf")]
use esp_idf_hal::{
    delay::FreeRtos,
    i2c::{I2cConfig, I2cDriver},
    peripherals::Peripherals,
    prelude::*,
};
#[cfg(target_os = "espidf")]
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
#[cfg(target_os = "espidf")]
use esp32waterius::platform::*;
use esp32waterius::*;

#[cfg(target_os = "espidf")]
#[allow(unreachable_code)]
fn main() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Waterius v{FW_VERSION} starting up.");

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs_default_partition = EspDefaultNvsPartition::take()?;

    let ns = env!("CARGO_BIN_NAME");
    let mut store = NvsStore::new(nvs_default_partition.clone(), ns)?;

    // I2C to the counter controller: GPIO4=SDA, GPIO5=SCL
    let i2c = I2cDriver::new(
        peripherals.i2c0,
        pins.gpio4,
        pins.gpio5,
        &I2cConfig::new().baudrate(100.kHz().into()),
    )?;
    let mut peripheral = AttinyLink::new(i2c);

    let mut network = WifiNetwork::new(peripherals.modem, sysloop, nvs_default_partition)?;
    let device_name = format!("waterius-{}", network.chip_id()?);
    info!("Device name: {device_name}");

    let mut http = EspHttp::new()?;
    let mut bus = EspMqttBus::default();
    let mut clock = SntpClock;
    let mut portal = BuildTimePortal;

    let end = run_session(&mut Hardware {
        peripheral: &mut peripheral,
        store: &mut store,
        network: &mut network,
        http: &mut http,
        bus: &mut bus,
        clock: &mut clock,
        portal: &mut portal,
        device_name: &device_name,
    });

    match end {
        SessionEnd::Restart => {
            info!("Restart ESP");
            FreeRtos::delay_ms(100);
            esp_idf_hal::reset::restart();
        }
        SessionEnd::Sleep => {
            info!("Deep sleep until the counter controller wakes us");
            unsafe { esp_idf_sys::esp_deep_sleep_start() };
        }
    }
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!("esp32waterius v{FW_VERSION} only runs on ESP-IDF targets.");
}

// EOF
