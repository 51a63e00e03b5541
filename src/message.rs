// message.rs

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Reading;

pub const MESSAGE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cannot serialize message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message needs {0} bytes, buffer holds {MESSAGE_CAPACITY}")]
    TooLarge(usize),
}

/// Field layout the hub's value templates extract from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficeDocument {
    #[serde(rename = "OfficeTemperature")]
    pub temperature: String,
    #[serde(rename = "Officehumidity")]
    pub humidity: String,
    #[serde(rename = "OfficeheatIndex")]
    pub heat_index: String,
}

impl OfficeDocument {
    pub fn new(temperature: f32, humidity: f32, heat_index: f32) -> Self {
        Self {
            temperature: decimal(temperature),
            humidity: decimal(humidity),
            heat_index: decimal(heat_index),
        }
    }
}

impl From<&Reading> for OfficeDocument {
    fn from(r: &Reading) -> Self {
        Self::new(r.temperature_c, r.humidity, r.heat_index_c)
    }
}

// fixed notation, two decimals, never an exponent
fn decimal(v: f32) -> String {
    format!("{v:.2}")
}

/// A minified JSON document that fits the fixed transmit buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    payload: heapless::String<MESSAGE_CAPACITY>,
}

impl OutboundMessage {
    pub fn encode(doc: &OfficeDocument) -> Result<Self, EncodeError> {
        let json = serde_json::to_string(doc)?;
        let mut payload = heapless::String::new();
        payload
            .push_str(&json)
            .map_err(|_| EncodeError::TooLarge(json.len()))?;
        Ok(Self { payload })
    }

    pub fn from_reading(r: &Reading) -> Result<Self, EncodeError> {
        Self::encode(&OfficeDocument::from(r))
    }

    pub fn as_str(&self) -> &str {
        self.payload.as_str()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Indented form for the diagnostic log.
    pub fn pretty(&self) -> String {
        serde_json::from_str::<serde_json::Value>(self.as_str())
            .and_then(|v| serde_json::to_string_pretty(&v))
            .unwrap_or_else(|_| self.as_str().to_string())
    }
}


// EOF
