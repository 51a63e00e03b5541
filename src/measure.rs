// measure.rs

use std::fmt;

use log::*;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemperatureScale {
    Celsius,
    Fahrenheit,
}

/// A combined humidity/temperature sensor. Each call is one sampling
/// operation; a driver may return NaN or an error on a transient failure.
pub trait Hygrometer {
    type Error: fmt::Debug;

    fn humidity(&mut self) -> Result<f32, Self::Error>;
    fn temperature(&mut self, scale: TemperatureScale) -> Result<f32, Self::Error>;
}

/// One snapshot of the office climate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub humidity: f32,
    pub temperature_c: f32,
    pub temperature_f: f32,
    pub heat_index_c: f32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("sensor returned no value for {0:?}")]
    NotANumber(Vec<&'static str>),
}

pub struct SensorReader<H> {
    sensor: H,
}

impl<H: Hygrometer> SensorReader<H> {
    pub fn new(sensor: H) -> Self {
        Self { sensor }
    }

    /// Samples humidity, Celsius and Fahrenheit temperature, then derives the
    /// heat index from the Celsius value. Any missing sample invalidates the
    /// whole reading.
    pub fn read_all(&mut self) -> Result<Reading, SensorError> {
        let humidity = sample("humidity", self.sensor.humidity());
        let temperature_c = sample(
            "temperature_c",
            self.sensor.temperature(TemperatureScale::Celsius),
        );
        let temperature_f = sample(
            "temperature_f",
            self.sensor.temperature(TemperatureScale::Fahrenheit),
        );

        let missing: Vec<&'static str> = [
            ("humidity", humidity),
            ("temperature_c", temperature_c),
            ("temperature_f", temperature_f),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_nan())
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(SensorError::NotANumber(missing));
        }

        let heat_index_c = heat_index_celsius(temperature_c, humidity);
        debug!("Heat index {heat_index_c:.2}C from {temperature_c:.2}C / {humidity:.2}%");

        Ok(Reading {
            humidity,
            temperature_c,
            temperature_f,
            heat_index_c,
        })
    }
}

fn sample<E: fmt::Debug>(what: &str, res: Result<f32, E>) -> f32 {
    match res {
        Ok(v) => v,
        Err(e) => {
            warn!("Sensor {what} read failed: {e:?}");
            f32::NAN
        }
    }
}

pub fn celsius_to_fahrenheit(c: f32) -> f32 {
    c * 1.8 + 32.0
}

pub fn fahrenheit_to_celsius(f: f32) -> f32 {
    (f - 32.0) * 0.555_55
}

/// Heat index in Celsius. Uses the simple Steadman average and switches to the
/// Rothfusz regression (with its low and high humidity adjustments) once the
/// simple result passes 79F.
pub fn heat_index_celsius(temperature_c: f32, humidity: f32) -> f32 {
    let t = celsius_to_fahrenheit(temperature_c);
    let rh = humidity;

    let mut hi = 0.5 * (t + 61.0 + ((t - 68.0) * 1.2) + (rh * 0.094));

    if hi > 79.0 {
        hi = -42.379 + 2.049_015_2 * t + 10.143_331 * rh
            - 0.224_755_4 * t * rh
            - 0.006_837_83 * t.powi(2)
            - 0.054_817_17 * rh.powi(2)
            + 0.001_228_74 * t.powi(2) * rh
            + 0.000_852_82 * t * rh.powi(2)
            - 0.000_001_99 * t.powi(2) * rh.powi(2);

        if rh < 13.0 && (80.0..=112.0).contains(&t) {
            hi -= ((13.0 - rh) * 0.25) * ((17.0 - (t - 95.0).abs()) * 0.058_82).sqrt();
        } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
            hi += ((rh - 85.0) * 0.1) * ((87.0 - t) * 0.2);
        }
    }

    fahrenheit_to_celsius(hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays fixed values and counts the samples taken.
    struct FixedSensor {
        humidity: f32,
        celsius: f32,
        fahrenheit: f32,
        samples: usize,
    }

    impl FixedSensor {
        fn new(humidity: f32, celsius: f32, fahrenheit: f32) -> Self {
            Self {
                humidity,
                celsius,
                fahrenheit,
                samples: 0,
            }
        }
    }

    impl Hygrometer for FixedSensor {
        type Error = ();

        fn humidity(&mut self) -> Result<f32, ()> {
            self.samples += 1;
            Ok(self.humidity)
        }

        fn temperature(&mut self, scale: TemperatureScale) -> Result<f32, ()> {
            self.samples += 1;
            match scale {
                TemperatureScale::Celsius => Ok(self.celsius),
                TemperatureScale::Fahrenheit => Ok(self.fahrenheit),
            }
        }
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.05
    }

    #[test]
    fn valid_reading_has_all_fields() {
        let mut reader = SensorReader::new(FixedSensor::new(50.0, 20.0, 68.0));
        let r = reader.read_all().unwrap();
        assert_eq!(r.humidity, 50.0);
        assert_eq!(r.temperature_c, 20.0);
        assert_eq!(r.temperature_f, 68.0);
        assert!(close(r.heat_index_c, 19.36), "got {}", r.heat_index_c);
        assert_eq!(reader.sensor.samples, 3);
    }

    #[test]
    fn nan_in_any_field_invalidates_reading() {
        for (h, c, f, field) in [
            (f32::NAN, 20.0, 68.0, "humidity"),
            (50.0, f32::NAN, 68.0, "temperature_c"),
            (50.0, 20.0, f32::NAN, "temperature_f"),
        ] {
            let mut reader = SensorReader::new(FixedSensor::new(h, c, f));
            assert_eq!(
                reader.read_all(),
                Err(SensorError::NotANumber(vec![field]))
            );
        }
    }

    #[test]
    fn driver_errors_count_as_missing() {
        struct Broken;
        impl Hygrometer for Broken {
            type Error = &'static str;
            fn humidity(&mut self) -> Result<f32, Self::Error> {
                Err("timeout")
            }
            fn temperature(&mut self, _: TemperatureScale) -> Result<f32, Self::Error> {
                Err("timeout")
            }
        }

        let err = SensorReader::new(Broken).read_all().unwrap_err();
        assert_eq!(
            err,
            SensorError::NotANumber(vec!["humidity", "temperature_c", "temperature_f"])
        );
    }

    #[test]
    fn heat_index_ignores_fahrenheit_sample() {
        // a bogus Fahrenheit value must not leak into the derived value
        let mut a = SensorReader::new(FixedSensor::new(50.0, 20.0, 68.0));
        let mut b = SensorReader::new(FixedSensor::new(50.0, 20.0, -40.0));
        assert_eq!(
            a.read_all().unwrap().heat_index_c,
            b.read_all().unwrap().heat_index_c
        );
        assert_eq!(a.read_all().unwrap().heat_index_c, heat_index_celsius(20.0, 50.0));
    }

    #[test]
    fn heat_index_simple_range() {
        // 20C / 50%: simple formula, 66.85F
        assert!(close(heat_index_celsius(20.0, 50.0), 19.36));
        // 22.5C / 48.3%: still below the regression threshold
        assert!(close(heat_index_celsius(22.5, 48.3), 22.07));
    }

    #[test]
    fn heat_index_regression_range() {
        // 32C / 70%: NWS tables give about 41C
        let hi = heat_index_celsius(32.0, 70.0);
        assert!((40.0..42.5).contains(&hi), "got {hi}");
        assert!(hi > 32.0);
    }

    #[test]
    fn heat_index_dry_heat_adjustment() {
        // low humidity lowers the regression result
        let dry = heat_index_celsius(35.0, 10.0);
        assert!(dry < 35.0, "got {dry}");
    }

    #[test]
    fn scale_conversions() {
        assert_eq!(celsius_to_fahrenheit(20.0), 68.0);
        assert_eq!(celsius_to_fahrenheit(-40.0), -40.0);
        assert!(close(fahrenheit_to_celsius(212.0), 100.0));
    }
}

// EOF
