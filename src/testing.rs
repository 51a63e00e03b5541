// testing.rs
//! Host-side stand-ins for the radio, the broker, GPIO, the sensor and the
//! sleep controller. Every mock is a cheap handle; clones share state, so a
//! test keeps one clone and hands the other to the code under test.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use embedded_hal::digital::{ErrorType, OutputPin};
use tokio::time::Instant;

use crate::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub client_id: String,
    pub credentials: Option<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Default)]
pub struct TransportLog {
    pub refusals_left: u32,
    pub connected: bool,
    pub publish_fails: bool,
    pub poll_failures: u32,
    pub polls: u32,
    pub connects: Vec<ConnectAttempt>,
    pub connect_times: Vec<Instant>,
    pub subscriptions: Vec<String>,
    pub published: Vec<Published>,
    pub inbound: VecDeque<Inbound>,
}

/// Broker that refuses a scripted number of connection attempts and then
/// accepts everything.
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<TransportLog>>,
}

impl MockTransport {
    pub fn refusing(attempts: u32) -> Self {
        let t = Self::default();
        t.log().refusals_left = attempts;
        t
    }

    pub fn log(&self) -> MutexGuard<'_, TransportLog> {
        lock(&self.inner)
    }

    pub fn push_inbound(&self, topic: &str, payload: &[u8]) {
        self.log().inbound.push_back(Inbound {
            topic: topic.into(),
            payload: payload.to_vec(),
        });
    }

    pub fn drop_link(&self) {
        self.log().connected = false;
    }

    /// The next poll reports the link as gone while `is_connected` still
    /// answers true, as when the broker drops us between two checks.
    pub fn fail_next_poll(&self) {
        self.log().poll_failures += 1;
    }

    pub fn fail_publishes(&self) {
        self.log().publish_fails = true;
    }
}

impl MqttTransport for MockTransport {
    async fn connect(
        &mut self,
        client_id: &str,
        credentials: Option<Credentials<'_>>,
    ) -> Result<(), TransportError> {
        let mut log = self.log();
        log.connect_times.push(Instant::now());
        log.connects.push(ConnectAttempt {
            client_id: client_id.into(),
            credentials: credentials.map(|c| (c.username.into(), c.password.into())),
        });

        if log.refusals_left > 0 {
            log.refusals_left -= 1;
            log.connected = false;
            return Err(TransportError::Refused("rc=5 not authorized".into()));
        }
        log.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.log().connected
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut log = self.log();
        if !log.connected {
            return Err(TransportError::NotConnected);
        }
        log.subscriptions.push(topic.into());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError> {
        let mut log = self.log();
        if !log.connected {
            return Err(TransportError::NotConnected);
        }
        if log.publish_fails {
            return Err(TransportError::Client("outbox full".into()));
        }
        log.published.push(Published {
            topic: topic.into(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<Inbound>, TransportError> {
        let mut log = self.log();
        log.polls += 1;
        if !log.connected {
            return Err(TransportError::NotConnected);
        }
        if log.poll_failures > 0 {
            log.poll_failures -= 1;
            return Err(TransportError::Client("connection reset".into()));
        }
        Ok(log.inbound.drain(..).collect())
    }
}

#[derive(Debug, Default)]
struct PinState {
    level: Option<bool>,
    writes: usize,
}

/// Output pin that remembers its last level. `None` until first driven.
#[derive(Clone, Debug, Default)]
pub struct MockPin {
    state: Arc<Mutex<PinState>>,
}

impl MockPin {
    pub fn level(&self) -> Option<bool> {
        lock(&self.state).level
    }

    pub fn writes(&self) -> usize {
        lock(&self.state).writes
    }

    fn drive(&self, high: bool) {
        let mut s = lock(&self.state);
        s.level = Some(high);
        s.writes += 1;
    }
}

impl ErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.drive(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.drive(true);
        Ok(())
    }
}

#[derive(Debug)]
pub struct LinkLog {
    pub started: bool,
    pub failures_left: u32,
    pub attempts: u32,
    pub ip: Ipv4Addr,
    pub mac: [u8; 6],
}

/// Radio that fails a scripted number of association attempts.
#[derive(Clone, Debug)]
pub struct MockLink {
    inner: Arc<Mutex<LinkLog>>,
}

impl MockLink {
    pub fn new(mac: [u8; 6], ip: Ipv4Addr) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LinkLog {
                started: false,
                failures_left: 0,
                attempts: 0,
                ip,
                mac,
            })),
        }
    }

    pub fn failing(self, attempts: u32) -> Self {
        self.log().failures_left = attempts;
        self
    }

    pub fn log(&self) -> MutexGuard<'_, LinkLog> {
        lock(&self.inner)
    }
}

impl NetworkLink for MockLink {
    async fn start(&mut self) -> Result<(), NetworkError> {
        self.log().started = true;
        Ok(())
    }

    async fn associate(&mut self) -> Result<Ipv4Addr, NetworkError> {
        let mut log = self.log();
        if !log.started {
            return Err(NetworkError::Driver("radio not started".into()));
        }
        log.attempts += 1;
        if log.failures_left > 0 {
            log.failures_left -= 1;
            return Err(NetworkError::NotAssociated);
        }
        Ok(log.ip)
    }

    fn hardware_address(&self) -> Result<[u8; 6], NetworkError> {
        Ok(self.log().mac)
    }
}

#[derive(Debug, Default)]
pub struct PowerLog {
    pub wake_timer: Option<Duration>,
    pub sleeps: u32,
}

/// Records the wake timer and sleep calls instead of powering down.
#[derive(Clone, Debug, Default)]
pub struct MockPower {
    inner: Arc<Mutex<PowerLog>>,
}

impl MockPower {
    pub fn log(&self) -> MutexGuard<'_, PowerLog> {
        lock(&self.inner)
    }
}

impl PowerControl for MockPower {
    fn arm_wake_timer(&mut self, after: Duration) -> Result<(), PowerError> {
        self.log().wake_timer = Some(after);
        Ok(())
    }

    fn deep_sleep(&mut self) {
        self.log().sleeps += 1;
    }
}

/// Sensor returning fixed samples; use `f32::NAN` to simulate a failed read.
#[derive(Clone, Copy, Debug)]
pub struct MockSensor {
    pub humidity: f32,
    pub celsius: f32,
    pub fahrenheit: f32,
}

impl MockSensor {
    pub fn new(humidity: f32, celsius: f32, fahrenheit: f32) -> Self {
        Self {
            humidity,
            celsius,
            fahrenheit,
        }
    }
}

impl Hygrometer for MockSensor {
    type Error = Infallible;

    fn humidity(&mut self) -> Result<f32, Infallible> {
        Ok(self.humidity)
    }

    fn temperature(&mut self, scale: TemperatureScale) -> Result<f32, Infallible> {
        Ok(match scale {
            TemperatureScale::Celsius => self.celsius,
            TemperatureScale::Fahrenheit => self.fahrenheit,
        })
    }
}

// EOF
