// dht.rs

use std::time::{Duration, Instant};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use log::*;
use thiserror::Error;

use crate::{celsius_to_fahrenheit, Hygrometer, TemperatureScale};

// the sensor refuses to be sampled more often than this
pub const MIN_INTERVAL: Duration = Duration::from_secs(2);

const START_LOW_US: u32 = 1100;
const RELEASE_US: u32 = 55;
const PULSE_TIMEOUT: u32 = 1000;
const FRAME_BITS: usize = 40;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DhtError {
    #[error("timed out waiting for {0} pulse")]
    Timeout(&'static str),
    #[error("checksum mismatch: got {got:#04x}, computed {computed:#04x}")]
    Checksum { got: u8, computed: u8 },
    #[error("pin error: {0}")]
    Pin(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frame {
    pub humidity: f32,
    pub temperature_c: f32,
}

impl Frame {
    /// Decode the 5 byte DHT22 frame: humidity x10, signed temperature x10,
    /// checksum.
    pub fn decode(bytes: [u8; 5]) -> Result<Self, DhtError> {
        let computed = bytes[..4].iter().fold(0u8, |a, b| a.wrapping_add(*b));
        if computed != bytes[4] {
            return Err(DhtError::Checksum {
                got: bytes[4],
                computed,
            });
        }

        let humidity = u16::from_be_bytes([bytes[0], bytes[1]]) as f32 / 10.0;
        let magnitude = u16::from_be_bytes([bytes[2] & 0x7f, bytes[3]]) as f32 / 10.0;
        let temperature_c = if bytes[2] & 0x80 != 0 {
            -magnitude
        } else {
            magnitude
        };

        Ok(Frame {
            humidity,
            temperature_c,
        })
    }
}

/// DHT22 / AM2302 on a single open-drain data line.
pub struct Dht22<P, D> {
    pin: P,
    delay: D,
    last_attempt: Option<Instant>,
    last_result: Result<Frame, DhtError>,
}

impl<P, D> Dht22<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    pub fn new(mut pin: P, delay: D) -> Result<Self, DhtError> {
        pin.set_high().map_err(pin_err)?;
        Ok(Self {
            pin,
            delay,
            last_attempt: None,
            last_result: Err(DhtError::Timeout("first")),
        })
    }

    /// Latest frame. Within [`MIN_INTERVAL`] of the previous attempt the
    /// previous result is returned without touching the bus.
    pub fn read(&mut self) -> Result<Frame, DhtError> {
        if let Some(t) = self.last_attempt {
            if t.elapsed() < MIN_INTERVAL {
                return self.last_result.clone();
            }
        }

        self.last_attempt = Some(Instant::now());
        self.last_result = self.read_frame();
        match &self.last_result {
            Ok(f) => debug!("DHT22 frame: {f:?}"),
            Err(e) => warn!("DHT22 read failed: {e}"),
        }
        self.last_result.clone()
    }

    fn read_frame(&mut self) -> Result<Frame, DhtError> {
        // idle high, then the host start signal
        self.pin.set_high().map_err(pin_err)?;
        self.delay.delay_ms(1);
        self.pin.set_low().map_err(pin_err)?;
        self.delay.delay_us(START_LOW_US);

        let mut cycles = [0u32; 2 * FRAME_BITS];
        interrupt_free(|| -> Result<(), DhtError> {
            self.pin.set_high().map_err(pin_err)?;
            self.delay.delay_us(RELEASE_US);

            self.expect_pulse(false, "response low")?;
            self.expect_pulse(true, "response high")?;

            for pair in cycles.chunks_exact_mut(2) {
                pair[0] = self.expect_pulse(false, "bit low")?;
                pair[1] = self.expect_pulse(true, "bit high")?;
            }
            Ok(())
        })?;

        let mut bytes = [0u8; 5];
        for (i, pair) in cycles.chunks_exact(2).enumerate() {
            bytes[i / 8] <<= 1;
            // a one holds the line high longer than the 50us low that precedes it
            if pair[1] > pair[0] {
                bytes[i / 8] |= 1;
            }
        }
        Frame::decode(bytes)
    }

    fn expect_pulse(&mut self, level: bool, what: &'static str) -> Result<u32, DhtError> {
        let mut count = 0;
        while self.pin.is_high().map_err(pin_err)? == level {
            count += 1;
            if count >= PULSE_TIMEOUT {
                return Err(DhtError::Timeout(what));
            }
            self.delay.delay_us(1);
        }
        Ok(count)
    }
}

fn pin_err<E: core::fmt::Debug>(e: E) -> DhtError {
    DhtError::Pin(format!("{e:?}"))
}

/// Runs `f` with interrupts masked on the calling core, so the radio and
/// the scheduler cannot stretch the pulse counts.
#[cfg(target_os = "espidf")]
fn interrupt_free<R>(f: impl FnOnce() -> R) -> R {
    esp_idf_hal::interrupt::free(f)
}

// host builds only need mutual exclusion
#[cfg(not(target_os = "espidf"))]
fn interrupt_free<R>(f: impl FnOnce() -> R) -> R {
    critical_section::with(|_| f())
}

impl<P, D> Hygrometer for Dht22<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    type Error = DhtError;

    fn humidity(&mut self) -> Result<f32, DhtError> {
        Ok(self.read()?.humidity)
    }

    fn temperature(&mut self, scale: TemperatureScale) -> Result<f32, DhtError> {
        let c = self.read()?.temperature_c;
        Ok(match scale {
            TemperatureScale::Celsius => c,
            TemperatureScale::Fahrenheit => celsius_to_fahrenheit(c),
        })
    }
}


// EOF
