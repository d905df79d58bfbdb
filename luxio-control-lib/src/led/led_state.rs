use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::led::led_color::Rgbw;

/// What the strip is currently showing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedState {
    pub on: bool,
    pub brightness: u8,
    /// Gradient stops, first to last pixel.
    pub colors: Vec<Rgbw>,
}

impl Default for LedState {
    fn default() -> Self {
        LedState {
            on: false,
            brightness: 0,
            colors: vec![Rgbw::default(), Rgbw::default()],
        }
    }
}

impl LedState {
    /// Checks the color list and pads it for gradient rendering.
    ///
    /// At least one stop is required. A single stop is duplicated so that
    /// consumers always see two or more.
    pub fn normalized(mut self) -> Result<Self, ValidationError> {
        self.colors = normalize_colors(self.colors)?;
        Ok(self)
    }
}

pub(crate) fn normalize_colors(mut colors: Vec<Rgbw>) -> Result<Vec<Rgbw>, ValidationError> {
    match colors.len() {
        0 => Err(ValidationError::invalid("colors", "at least one color is required")),
        1 => {
            colors.push(colors[0]);
            Ok(colors)
        }
        _ => Ok(colors),
    }
}

/// Supported addressable LED chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum LedType {
    #[serde(rename = "WS2812")]
    #[value(name = "ws2812")]
    Ws2812,
    #[serde(rename = "SK6812")]
    #[value(name = "sk6812")]
    Sk6812,
}

impl fmt::Display for LedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LedType::Ws2812 => "WS2812",
            LedType::Sk6812 => "SK6812",
        };
        write!(f, "{}", name)
    }
}

/// Strip wiring as configured on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedConfig {
    #[serde(rename = "type")]
    pub led_type: LedType,
    #[serde(rename = "count")]
    pub pixel_count: u16,
    pub pin: u8,
}

impl Default for LedConfig {
    fn default() -> Self {
        LedConfig {
            led_type: LedType::Ws2812,
            pixel_count: 0,
            pin: 0,
        }
    }
}
