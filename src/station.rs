// station.rs

use embedded_hal::digital::OutputPin;
use log::*;

use crate::*;

/// Where the station is in its single pass from power-on to deep sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Start,
    NetworkUp,
    BrokerUp,
    WakeCycle,
    Sleep,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A reading went out to the broker.
    Published,
    /// The sensor gave no usable sample; nothing was sent.
    SensorFailed,
    /// The reading could not be encoded; nothing was sent.
    EncodeFailed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub reading: Option<Reading>,
    pub phases: Vec<Phase>,
}

/// Everything one wake cycle needs. `run` consumes it: after sleep the
/// hardware restarts and builds a fresh one.
pub struct Station<'c, L, T, P, H, W> {
    config: &'c StationConfig,
    link: L,
    transport: T,
    relays: Relays<P>,
    sensor: SensorReader<H>,
    power: W,
}

impl<'c, L, T, P, H, W> Station<'c, L, T, P, H, W>
where
    L: NetworkLink,
    T: MqttTransport,
    P: OutputPin,
    H: Hygrometer,
    W: PowerControl,
{
    pub fn new(
        config: &'c StationConfig,
        link: L,
        transport: T,
        relays: Relays<P>,
        sensor: SensorReader<H>,
        power: W,
    ) -> Self {
        Self {
            config,
            link,
            transport,
            relays,
            sensor,
            power,
        }
    }

    pub async fn run(self) -> anyhow::Result<CycleReport> {
        let Station {
            config,
            mut link,
            transport,
            relays,
            mut sensor,
            mut power,
        } = self;
        let mut phases = Vec::with_capacity(5);

        enter(&mut phases, Phase::Start);
        power.arm_wake_timer(config.sleep)?;
        info!("Setup ESP32 to sleep for every {} Seconds", config.sleep.as_secs());

        enter(&mut phases, Phase::NetworkUp);
        Box::pin(bring_up(&mut link, config)).await?;

        enter(&mut phases, Phase::BrokerUp);
        let mac = link.hardware_address()?;
        let mut broker = BrokerClient::new(config, transport, relays, &mac);
        // not connected yet, this tick is a no-op
        broker.service();

        enter(&mut phases, Phase::WakeCycle);
        let (outcome, reading) = Box::pin(wake_cycle(config, &mut broker, &mut sensor)).await?;

        enter(&mut phases, Phase::Sleep);
        info!("Going to sleep for {} seconds.", config.sleep.as_secs());
        power.deep_sleep();

        Ok(CycleReport {
            outcome,
            reading,
            phases,
        })
    }
}

fn enter(phases: &mut Vec<Phase>, next: Phase) {
    match phases.last() {
        Some(prev) => info!("Phase {prev:?} -> {next:?}"),
        None => info!("Phase {next:?}"),
    }
    phases.push(next);
}

/// Connect if needed, service the link, take one reading and publish it.
/// Failures past the broker connection end the cycle without an error.
pub async fn wake_cycle<T, P, H>(
    config: &StationConfig,
    broker: &mut BrokerClient<'_, T, P>,
    sensor: &mut SensorReader<H>,
) -> Result<(CycleOutcome, Option<Reading>), TransportError>
where
    T: MqttTransport,
    P: OutputPin,
    H: Hygrometer,
{
    if !broker.is_connected() {
        Box::pin(broker.connect_with_retry()).await?;
    }
    if !broker.service() {
        Box::pin(broker.reconnect_fallback()).await;
    }

    let reading = match sensor.read_all() {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to read from DHT sensor! {e}");
            return Ok((CycleOutcome::SensorFailed, None));
        }
    };
    info!(
        "Humidity {:.2}%, temperature {:.2}C / {:.2}F, heat index {:.2}C",
        reading.humidity, reading.temperature_c, reading.temperature_f, reading.heat_index_c
    );

    let msg = match OutboundMessage::from_reading(&reading) {
        Ok(m) => m,
        Err(e) => {
            error!("Cannot encode reading: {e}");
            return Ok((CycleOutcome::EncodeFailed, Some(reading)));
        }
    };
    info!("{}", msg.pretty());

    // fire and forget: a failed publish is only logged
    if let Err(e) = Box::pin(broker.publish(&config.mqtt_topic, msg.as_bytes(), true)).await {
        warn!("MQTT publish failed: {e}");
    }

    Ok((CycleOutcome::Published, Some(reading)))
}


// EOF
