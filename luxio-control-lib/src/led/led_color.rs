use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use palette::{FromColor, Hsv, Srgb};
use serde::{Deserialize, Serialize};

/// One color stop: red, green, blue and a dedicated white channel.
///
/// `w` is only meaningful on RGBW strips (SK6812); WS2812 strips ignore it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgbw {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    #[serde(default)]
    pub w: u8,
}

impl Rgbw {
    pub const fn new(r: u8, g: u8, b: u8, w: u8) -> Self {
        Rgbw { r, g, b, w }
    }

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Rgbw { r, g, b, w: 0 }
    }

    /// Builds a color from hue (degrees), saturation and value (both `0.0..=1.0`).
    pub fn from_hsv(hue: f32, saturation: f32, value: f32) -> Self {
        let hsv = Hsv::new(hue, saturation.clamp(0.0, 1.0), value.clamp(0.0, 1.0));
        let rgb: Srgb<u8> = Srgb::<f32>::from_color(hsv).into_format();
        Rgbw::rgb(rgb.red, rgb.green, rgb.blue)
    }

    /// `#rrggbb`, the white channel is not represented.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl fmt::Display for Rgbw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.w > 0 {
            write!(f, "{}+w{:02x}", self.to_hex(), self.w)
        } else {
            write!(f, "{}", self.to_hex())
        }
    }
}

impl FromStr for Rgbw {
    type Err = anyhow::Error;

    /// Accepts `#rrggbb`, `rrggbb`, `rrggbbww` or `hsv:hue,saturation,value`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hsv) = s.trim().strip_prefix("hsv:") {
            let parts = hsv
                .split(',')
                .map(|part| part.trim().parse::<f32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| anyhow!("Invalid color: {}", s))?;
            return match parts[..] {
                [hue, saturation, value] => Ok(Rgbw::from_hsv(hue, saturation, value)),
                _ => Err(anyhow!("Invalid color: {}", s)),
            };
        }
        let hex = s.trim().trim_start_matches('#');
        if !hex.is_ascii() || (hex.len() != 6 && hex.len() != 8) {
            return Err(anyhow!("Invalid color: {}", s));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| anyhow!("Invalid color: {}", s))
        };
        let w = if hex.len() == 8 { channel(6)? } else { 0 };
        Ok(Rgbw::new(channel(0)?, channel(2)?, channel(4)?, w))
    }
}

impl From<(u8, u8, u8)> for Rgbw {
    fn from(tuple: (u8, u8, u8)) -> Self {
        Rgbw::rgb(tuple.0, tuple.1, tuple.2)
    }
}

impl From<Rgbw> for (u8, u8, u8) {
    fn from(color: Rgbw) -> Self {
        (color.r, color.g, color.b)
    }
}

/// Named solid colors offered by the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PresetColor {
    Red,
    Orange,
    Yellow,
    Green,
    Cyan,
    Blue,
    Magenta,
    Pink,
    Purple,
    RgbWhite,
    RgbwWhite,
    WarmWhite,
    CoolWhite,
}

impl From<PresetColor> for Rgbw {
    fn from(color: PresetColor) -> Self {
        match color {
            PresetColor::Red => Rgbw::rgb(255, 0, 0),
            PresetColor::Orange => Rgbw::rgb(255, 165, 0),
            PresetColor::Yellow => Rgbw::rgb(255, 255, 0),
            PresetColor::Green => Rgbw::rgb(0, 255, 0),
            PresetColor::Cyan => Rgbw::rgb(0, 255, 255),
            PresetColor::Blue => Rgbw::rgb(0, 0, 255),
            PresetColor::Magenta => Rgbw::rgb(255, 0, 255),
            PresetColor::Pink => Rgbw::rgb(255, 20, 147),
            PresetColor::Purple => Rgbw::rgb(128, 0, 128),
            PresetColor::RgbWhite => Rgbw::rgb(255, 255, 255),
            PresetColor::RgbwWhite => Rgbw::new(0, 0, 0, 255),
            PresetColor::WarmWhite => Rgbw::new(255, 0, 0, 255),
            PresetColor::CoolWhite => Rgbw::new(0, 0, 255, 255),
        }
    }
}

/// Named gradients offered by the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PresetGradient {
    Luxio,
    Aurora,
    Sunset,
    Northpole,
    Grass,
    Candlelight,
    Spectrum,
}

impl PresetGradient {
    pub fn colors(&self) -> Vec<Rgbw> {
        let stops: &[(u8, u8, u8)] = match self {
            PresetGradient::Luxio => &[(79, 255, 127), (0, 210, 255)],
            PresetGradient::Aurora => &[(0, 198, 255), (0, 108, 255), (175, 255, 0), (63, 255, 160)],
            PresetGradient::Sunset => &[
                (255, 0, 0),
                (255, 170, 0),
                (255, 51, 0),
                (255, 170, 0),
                (170, 51, 0),
            ],
            PresetGradient::Northpole => &[(125, 156, 205), (255, 255, 255), (17, 115, 146)],
            PresetGradient::Grass => &[(126, 146, 44), (0, 255, 0), (163, 244, 162), (115, 133, 1)],
            PresetGradient::Candlelight => &[(44, 7, 1), (194, 55, 4), (248, 193, 17), (44, 7, 1)],
            PresetGradient::Spectrum => &[
                (255, 0, 0),
                (255, 255, 0),
                (0, 255, 0),
                (0, 255, 255),
                (0, 0, 255),
                (255, 0, 255),
            ],
        };
        stops.iter().copied().map(Rgbw::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex_pads_channels() {
        assert_eq!(Rgbw::rgb(0, 10, 255).to_hex(), "#000aff");
    }

    #[test]
    fn test_parse_hex_with_and_without_hash() {
        assert_eq!("#4fff7f".parse::<Rgbw>().unwrap(), Rgbw::rgb(79, 255, 127));
        assert_eq!("00d2ff".parse::<Rgbw>().unwrap(), Rgbw::rgb(0, 210, 255));
    }

    #[test]
    fn test_parse_hex_with_white_channel() {
        assert_eq!("ff000080".parse::<Rgbw>().unwrap(), Rgbw::new(255, 0, 0, 128));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("#12345".parse::<Rgbw>().is_err());
        assert!("zzzzzz".parse::<Rgbw>().is_err());
        assert!("ééé".parse::<Rgbw>().is_err());
    }

    #[test]
    fn test_from_hsv_primaries() {
        assert_eq!(Rgbw::from_hsv(0.0, 1.0, 1.0), Rgbw::rgb(255, 0, 0));
        assert_eq!(Rgbw::from_hsv(120.0, 1.0, 1.0), Rgbw::rgb(0, 255, 0));
        assert_eq!(Rgbw::from_hsv(240.0, 1.0, 1.0), Rgbw::rgb(0, 0, 255));
    }

    #[test]
    fn test_parse_hsv() {
        assert_eq!("hsv:120,1,1".parse::<Rgbw>().unwrap(), Rgbw::rgb(0, 255, 0));
        assert_eq!("hsv: 0, 0, 1".parse::<Rgbw>().unwrap(), Rgbw::rgb(255, 255, 255));
        assert!("hsv:120,1".parse::<Rgbw>().is_err());
        assert!("hsv:red,1,1".parse::<Rgbw>().is_err());
    }

    #[test]
    fn test_from_hsv_zero_value_is_black() {
        assert_eq!(Rgbw::from_hsv(200.0, 0.7, 0.0), Rgbw::rgb(0, 0, 0));
    }

    #[test]
    fn test_missing_white_defaults_to_zero() {
        let color: Rgbw = serde_json::from_str(r#"{"r":1,"g":2,"b":3}"#).unwrap();
        assert_eq!(color, Rgbw::rgb(1, 2, 3));
    }

    #[test]
    fn test_every_preset_gradient_has_two_stops() {
        for preset in PresetGradient::value_variants() {
            assert!(preset.colors().len() >= 2, "{:?}", preset);
        }
    }
}
