// power.rs

use std::time::Duration;

use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PowerError {
    #[error("cannot arm wake timer: {0}")]
    WakeTimer(String),
}

/// Wake timer and deep sleep. On hardware `deep_sleep` does not return: the
/// timer restarts the firmware from the top.
pub trait PowerControl {
    fn arm_wake_timer(&mut self, after: Duration) -> Result<(), PowerError>;
    fn deep_sleep(&mut self);
}

#[cfg(target_os = "espidf")]
pub struct EspPower;

#[cfg(target_os = "espidf")]
impl PowerControl for EspPower {
    fn arm_wake_timer(&mut self, after: Duration) -> Result<(), PowerError> {
        let us = u64::try_from(after.as_micros())
            .map_err(|_| PowerError::WakeTimer(format!("{after:?} out of range")))?;
        esp_idf_sys::esp!(unsafe { esp_idf_sys::esp_sleep_enable_timer_wakeup(us) })
            .map_err(|e| PowerError::WakeTimer(format!("{e:?}")))
    }

    fn deep_sleep(&mut self) {
        unsafe { esp_idf_sys::esp_deep_sleep_start() }
    }
}

// EOF
