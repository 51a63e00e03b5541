// bin/esp32office.rs

#![warn(clippy::large_futures)]

#[cfg(target_os = "espidf")]
esp_idf_sys::esp_app_desc!();

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use esp32office::*;
    use esp_idf_hal::delay::{Ets, FreeRtos};
    use esp_idf_hal::gpio::{IOPin, OutputPin, PinDriver, Pull};
    use esp_idf_hal::prelude::Peripherals;
    use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs, timer::EspTaskTimerService};
    use log::*;

    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Hello.");
    info!("esp32office {FW_VERSION} starting up.");

    let config = StationConfig::default();
    info!("My config:\n{config:#?}");

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let gpio4 = PinDriver::output(pins.gpio4.downgrade_output())?;
    let gpio5 = PinDriver::output(pins.gpio5.downgrade_output())?;
    let relays = Relays::new(&config, [gpio4, gpio5]);

    info!("DHT22 on gpio{}", config.sensor_gpio);
    let mut dht_pin = PinDriver::input_output_od(pins.gpio15.downgrade())?;
    dht_pin.set_pull(Pull::Up)?;
    let sensor = SensorReader::new(Dht22::new(dht_pin, Ets)?);

    let sysloop = EspSystemEventLoop::take()?;
    let timer = EspTaskTimerService::new()?;
    let nvs_default_partition = nvs::EspDefaultNvsPartition::take()?;
    let link = EspNetwork::new(
        peripherals.modem,
        sysloop,
        timer,
        nvs_default_partition,
        &config,
    )?;

    let station = Station::new(
        &config,
        link,
        EspTransport::new(&config),
        relays,
        sensor,
        EspPower,
    );

    let res = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(Box::pin(station.run()));

    // only reached when the cycle failed before deep sleep
    match res {
        Ok(report) => warn!("Woke up without a reset? {report:?}"),
        Err(e) => error!("Cycle failed: {e:#}"),
    }
    info!("main() finished, reboot.");
    FreeRtos::delay_ms(3000);
    esp_idf_hal::reset::restart();
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("esp32office only runs on esp-idf targets, e.g. --target xtensa-esp32-espidf");
}

// EOF
