// mqtt.rs

use embedded_hal::digital::OutputPin;
use log::*;
use thiserror::Error;
use tokio::time::sleep;

use crate::*;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("not connected")]
    NotConnected,
    #[error("gave up after {0} connection attempts")]
    RetriesExhausted(u32),
    #[error("mqtt client error: {0}")]
    Client(String),
}

#[derive(Clone, Copy, Debug)]
pub struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// A message received on a subscribed topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// The broker session underneath [`BrokerClient`]. One `connect` call is
/// one attempt.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    async fn connect(
        &mut self,
        client_id: &str,
        credentials: Option<Credentials<'_>>,
    ) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Hands over what arrived since the last call. `Err` means the link is gone.
    fn poll(&mut self) -> Result<Vec<Inbound>, TransportError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    On,
    Off,
}

impl Command {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            b"1" => Some(Command::On),
            b"0" => Some(Command::Off),
            _ => None,
        }
    }
}

struct Relay<P> {
    topic: String,
    gpio: u8,
    pin: P,
}

/// Digital outputs switched by the command topics.
pub struct Relays<P> {
    relays: Vec<Relay<P>>,
}

impl<P: OutputPin> Relays<P> {
    pub fn new(config: &StationConfig, pins: [P; 2]) -> Self {
        let relays = config
            .command_pins
            .iter()
            .zip(pins)
            .map(|(c, pin)| Relay {
                topic: c.topic.clone(),
                gpio: c.gpio,
                pin,
            })
            .collect();
        Self { relays }
    }

    /// Drives the pin bound to `topic`. Unknown topics and payloads other
    /// than `"1"`/`"0"` leave every pin untouched.
    pub fn apply(&mut self, topic: &str, payload: &[u8]) -> Option<Command> {
        let relay = self.relays.iter_mut().find(|r| r.topic == topic)?;
        let Some(cmd) = Command::parse(payload) else {
            debug!("Ignoring payload {payload:?} on {topic}");
            return None;
        };

        let gpio = relay.gpio;
        let res = match cmd {
            Command::On => relay.pin.set_high(),
            Command::Off => relay.pin.set_low(),
        };
        match res {
            Ok(()) => {
                info!("Changing GPIO {gpio} to {}", if cmd == Command::On { "On" } else { "Off" });
                Some(cmd)
            }
            Err(e) => {
                error!("Cannot drive GPIO {gpio}: {e:?}");
                None
            }
        }
    }
}

pub struct BrokerClient<'c, T, P> {
    config: &'c StationConfig,
    transport: T,
    relays: Relays<P>,
    client_id: String,
    // set after the first accepted connect, so a link that was never up
    // is not reported as lost
    was_connected: bool,
}

impl<'c, T, P> BrokerClient<'c, T, P>
where
    T: MqttTransport,
    P: OutputPin,
{
    pub fn new(config: &'c StationConfig, transport: T, relays: Relays<P>, mac: &[u8; 6]) -> Self {
        Self {
            config,
            transport,
            relays,
            client_id: config.client_id(mac),
            was_connected: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn credentials(&self) -> Credentials<'c> {
        Credentials {
            username: &self.config.mqtt_user,
            password: &self.config.mqtt_pass,
        }
    }

    /// Keeps trying until the broker accepts us, waiting the policy backoff
    /// after each refusal. Only a bounded policy can make this return `Err`.
    pub async fn connect_with_retry(&mut self) -> Result<(), TransportError> {
        let policy = self.config.broker_retry;
        let mut failures = 0;

        while !self.transport.is_connected() {
            info!(
                "The client {id} connects to the mqtt broker {url}",
                id = self.client_id,
                url = self.config.broker_url()
            );
            let creds = self.credentials();
            match self.transport.connect(&self.client_id, Some(creds)).await {
                Ok(()) => {
                    info!("MQTT broker connected.");
                    self.was_connected = true;
                    self.subscribe_commands().await;
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    error!("MQTT connection failed: {e}");
                    if policy.exhausted(failures) {
                        return Err(TransportError::RetriesExhausted(failures));
                    }
                    sleep(policy.backoff).await;
                }
            }
        }
        Ok(())
    }

    /// One attempt under the fallback identity, without credentials.
    pub async fn reconnect_fallback(&mut self) -> bool {
        let id = self.config.fallback_client_id.clone();
        info!("MQTT reconnecting as {id}");
        match self.transport.connect(&id, None).await {
            Ok(()) => {
                self.was_connected = true;
                self.subscribe_commands().await;
                true
            }
            Err(e) => {
                error!("MQTT fallback connection failed: {e}");
                false
            }
        }
    }

    async fn subscribe_commands(&mut self) {
        for topic in self.config.command_topics() {
            match self.transport.subscribe(topic).await {
                Ok(()) => debug!("Subscribed to {topic}"),
                Err(e) => warn!("Cannot subscribe to {topic}: {e}"),
            }
        }
    }

    /// Processes inbound traffic. Returns false when the link is lost.
    pub fn service(&mut self) -> bool {
        if !self.transport.is_connected() {
            if self.was_connected {
                warn!("MQTT loop reports link down: not connected");
            } else {
                debug!("MQTT not connected yet, nothing to service");
            }
            return false;
        }
        match self.transport.poll() {
            Ok(inbound) => {
                for msg in inbound {
                    self.on_message(&msg.topic, &msg.payload);
                }
                true
            }
            Err(e) => {
                warn!("MQTT loop reports link down: {e}");
                false
            }
        }
    }

    pub fn on_message(&mut self, topic: &str, payload: &[u8]) -> Option<Command> {
        info!(
            "Message arrived on topic: {topic}. Message: {}",
            String::from_utf8_lossy(payload)
        );
        self.relays.apply(topic, payload)
    }

    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError> {
        info!("MQTT sending {topic} ({} bytes, retain={retain})", payload.len());
        self.transport.publish(topic, payload, retain).await
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspTransport;

#[cfg(target_os = "espidf")]
mod esp {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    };

    use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration, QoS};
    use log::*;
    use tokio::time::{sleep, Duration, Instant};

    use super::{Credentials, Inbound, MqttTransport, TransportError};
    use crate::StationConfig;

    const KEEP_ALIVE: Duration = Duration::from_secs(25);
    const CONNECT_POLL: Duration = Duration::from_millis(50);

    fn client_err(e: impl core::fmt::Debug) -> TransportError {
        TransportError::Client(format!("{e:?}"))
    }

    /// esp-idf MQTT client. Events arrive on the client task and are handed
    /// to us through an atomic flag and a channel.
    pub struct EspTransport {
        url: String,
        timeout: Duration,
        client: Option<EspMqttClient<'static>>,
        connected: Arc<AtomicBool>,
        tx: mpsc::Sender<Inbound>,
        rx: mpsc::Receiver<Inbound>,
    }

    impl EspTransport {
        pub fn new(config: &StationConfig) -> Self {
            let (tx, rx) = mpsc::channel();
            Self {
                url: config.broker_url(),
                timeout: config.connect_timeout,
                client: None,
                connected: Arc::new(AtomicBool::new(false)),
                tx,
                rx,
            }
        }
    }

    impl MqttTransport for EspTransport {
        async fn connect(
            &mut self,
            client_id: &str,
            credentials: Option<Credentials<'_>>,
        ) -> Result<(), TransportError> {
            // a new attempt replaces whatever session we had
            self.client = None;
            self.connected.store(false, Ordering::SeqCst);

            let conf = MqttClientConfiguration {
                client_id: Some(client_id),
                username: credentials.map(|c| c.username),
                password: credentials.map(|c| c.password),
                keep_alive_interval: Some(KEEP_ALIVE),
                ..Default::default()
            };

            let connected = self.connected.clone();
            let tx = self.tx.clone();
            let client = EspMqttClient::new_cb(&self.url, &conf, move |event| {
                match event.payload() {
                    EventPayload::Connected(_) => connected.store(true, Ordering::SeqCst),
                    EventPayload::Disconnected => connected.store(false, Ordering::SeqCst),
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        ..
                    } => {
                        tx.send(Inbound {
                            topic: topic.to_string(),
                            payload: data.to_vec(),
                        })
                        .ok();
                    }
                    EventPayload::Error(e) => warn!("MQTT event error: {e:?}"),
                    _ => {}
                }
            })
            .map_err(client_err)?;

            let deadline = Instant::now() + self.timeout;
            while !self.connected.load(Ordering::SeqCst) {
                if Instant::now() >= deadline {
                    return Err(TransportError::Refused(format!(
                        "no CONNACK within {:?}",
                        self.timeout
                    )));
                }
                sleep(CONNECT_POLL).await;
            }

            self.client = Some(client);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.client.is_some() && self.connected.load(Ordering::SeqCst)
        }

        async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
            let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
            client
                .subscribe(topic, QoS::AtMostOnce)
                .map(|_| ())
                .map_err(client_err)
        }

        async fn publish(
            &mut self,
            topic: &str,
            payload: &[u8],
            retain: bool,
        ) -> Result<(), TransportError> {
            let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
            client
                .publish(topic, QoS::AtMostOnce, retain, payload)
                .map(|_| ())
                .map_err(client_err)
        }

        fn poll(&mut self) -> Result<Vec<Inbound>, TransportError> {
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            Ok(self.rx.try_iter().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::testing::{MockPin, MockTransport};

    const MAC: [u8; 6] = [0x24, 0x0a, 0xc4, 0x00, 0x00, 0x01];

    fn bounded(attempts: u32) -> StationConfig {
        StationConfig {
            broker_retry: RetryPolicy::bounded(Duration::from_secs(2), attempts),
            ..Default::default()
        }
    }

    fn relays(config: &StationConfig) -> (Relays<MockPin>, MockPin, MockPin) {
        let (p4, p5) = (MockPin::default(), MockPin::default());
        (Relays::new(config, [p4.clone(), p5.clone()]), p4, p5)
    }

    #[test]
    fn command_payloads() {
        assert_eq!(Command::parse(b"1"), Some(Command::On));
        assert_eq!(Command::parse(b"0"), Some(Command::Off));
        assert_eq!(Command::parse(b"2"), None);
        assert_eq!(Command::parse(b" 1"), None);
        assert_eq!(Command::parse(b""), None);
    }

    #[test]
    fn relay_follows_commands_on_its_topic() {
        let config = StationConfig::default();
        let (mut relays, p4, p5) = relays(&config);

        assert_eq!(relays.apply("esp32office/4", b"1"), Some(Command::On));
        assert_eq!(p4.level(), Some(true));
        assert_eq!(relays.apply("esp32office/4", b"0"), Some(Command::Off));
        assert_eq!(p4.level(), Some(false));

        // unknown payload keeps the last level
        assert_eq!(relays.apply("esp32office/4", b"2"), None);
        assert_eq!(p4.level(), Some(false));
        assert_eq!(p4.writes(), 2);

        assert_eq!(p5.level(), None);
        relays.apply("esp32office/5", b"1");
        assert_eq!(p5.level(), Some(true));
    }

    #[test]
    fn unknown_topic_is_ignored() {
        let config = StationConfig::default();
        let (mut relays, p4, p5) = relays(&config);
        assert_eq!(relays.apply("esp32office/6", b"1"), None);
        assert_eq!(relays.apply("esp32/office", b"1"), None);
        assert_eq!(p4.writes() + p5.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_returns_on_first_accept() {
        let config = StationConfig::default();
        let (r, _, _) = relays(&config);
        let transport = MockTransport::default();
        let mut client = BrokerClient::new(&config, transport.clone(), r, &MAC);

        let t0 = Instant::now();
        client.connect_with_retry().await.unwrap();
        assert_eq!(t0.elapsed(), Duration::ZERO);
        assert!(client.is_connected());

        let log = transport.log();
        assert_eq!(log.connects.len(), 1);
        assert_eq!(log.connects[0].client_id, "esp32-client-24:0A:C4:00:00:01");
        assert_eq!(
            log.connects[0].credentials,
            Some((config.mqtt_user.clone(), config.mqtt_pass.clone()))
        );
        assert_eq!(log.subscriptions, vec!["esp32office/4", "esp32office/5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_backs_off_two_seconds_per_refusal() {
        let config = StationConfig::default();
        let (r, _, _) = relays(&config);
        let transport = MockTransport::refusing(3);
        let mut client = BrokerClient::new(&config, transport.clone(), r, &MAC);

        let t0 = Instant::now();
        client.connect_with_retry().await.unwrap();
        assert!(t0.elapsed() >= Duration::from_secs(6));
        assert_eq!(transport.log().connects.len(), 4);

        let log = transport.log();
        for w in log.connect_times.windows(2) {
            assert!(w[1] - w[0] >= Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_never_returns_while_refused() {
        let config = StationConfig::default();
        let (r, _, _) = relays(&config);
        let transport = MockTransport::refusing(u32::MAX);
        let mut client = BrokerClient::new(&config, transport.clone(), r, &MAC);

        let res = tokio::time::timeout(Duration::from_secs(600), client.connect_with_retry()).await;
        assert!(res.is_err(), "connect_with_retry returned while refused");
        assert!(!transport.log().connected);
        assert!(transport.log().connects.len() >= 300);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_gives_up() {
        let config = bounded(3);
        let (r, _, _) = relays(&config);
        let transport = MockTransport::refusing(u32::MAX);
        let mut client = BrokerClient::new(&config, transport.clone(), r, &MAC);

        let t0 = Instant::now();
        assert_eq!(
            client.connect_with_retry().await,
            Err(TransportError::RetriesExhausted(3))
        );
        // no wait after the last attempt
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_secs(4) && waited < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn already_connected_skips_connect() {
        let config = StationConfig::default();
        let (r, _, _) = relays(&config);
        let transport = MockTransport::default();
        let mut client = BrokerClient::new(&config, transport.clone(), r, &MAC);
        client.connect_with_retry().await.unwrap();
        client.connect_with_retry().await.unwrap();
        assert_eq!(transport.log().connects.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn service_dispatches_inbound_commands() {
        let config = StationConfig::default();
        let (r, p4, p5) = relays(&config);
        let transport = MockTransport::default();
        let mut client = BrokerClient::new(&config, transport.clone(), r, &MAC);
        client.connect_with_retry().await.unwrap();

        transport.push_inbound("esp32office/4", b"1");
        transport.push_inbound("esp32office/5", b"2");
        assert!(client.service());
        assert_eq!(p4.level(), Some(true));
        assert_eq!(p5.level(), None);

        // drained
        assert!(client.service());
        assert_eq!(p4.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn service_reports_link_loss_and_fallback_reconnects() {
        let config = StationConfig::default();
        let (r, _, _) = relays(&config);
        let transport = MockTransport::default();
        let mut client = BrokerClient::new(&config, transport.clone(), r, &MAC);
        client.connect_with_retry().await.unwrap();

        transport.fail_next_poll();
        assert!(!client.service());
        assert!(client.reconnect_fallback().await);

        let log = transport.log();
        let last = log.connects.last().unwrap();
        assert_eq!(last.client_id, "ESPofficeClient");
        assert_eq!(last.credentials, None);
    }

    #[test]
    fn service_before_connect_does_not_poll() {
        let config = StationConfig::default();
        let (r, _, _) = relays(&config);
        let transport = MockTransport::default();
        let mut client = BrokerClient::new(&config, transport.clone(), r, &MAC);

        assert!(!client.service());
        assert_eq!(transport.log().polls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_passes_retain_flag() {
        let config = StationConfig::default();
        let (r, _, _) = relays(&config);
        let transport = MockTransport::default();
        let mut client = BrokerClient::new(&config, transport.clone(), r, &MAC);
        client.connect_with_retry().await.unwrap();

        client.publish("esp32/office", b"{}", true).await.unwrap();
        let log = transport.log();
        assert_eq!(log.published.len(), 1);
        assert_eq!(log.published[0].topic, "esp32/office");
        assert!(log.published[0].retain);
    }
}

// EOF
