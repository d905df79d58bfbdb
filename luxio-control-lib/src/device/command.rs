use derivative::Derivative;
use serde_json::{json, Value};

use crate::led::{LedType, Rgbw};

/// A write the device understands.
#[derive(Derivative)]
#[derivative(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    SetOn(bool),
    SetBrightness(u8),
    /// Shown locally as a two stop gradient of the same color.
    SetColor(Rgbw),
    SetGradient(Vec<Rgbw>),
    SetName(String),
    SetCount(u16),
    SetType(LedType),
    Restart,
    FactoryReset,
    ScanNetworks,
    ConnectWifi {
        ssid: String,
        #[derivative(Debug = "ignore")]
        pass: String,
    },
}

/// The piece of local state a command overwrites. Writes to the same
/// property share one throttle and are sent in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Power,
    Brightness,
    Colors,
    Name,
    PixelCount,
    LedType,
}

impl DeviceCommand {
    /// Method name used on the device's execute endpoint.
    pub fn method(&self) -> &'static str {
        match self {
            DeviceCommand::SetOn(_) => "led.setOn",
            DeviceCommand::SetBrightness(_) => "led.setBrightness",
            DeviceCommand::SetColor(_) => "led.setColor",
            DeviceCommand::SetGradient(_) => "led.setGradient",
            DeviceCommand::SetName(_) => "system.setName",
            DeviceCommand::SetCount(_) => "led.setCount",
            DeviceCommand::SetType(_) => "led.setType",
            DeviceCommand::Restart => "system.restart",
            DeviceCommand::FactoryReset => "system.factoryReset",
            DeviceCommand::ScanNetworks => "wifi.scanNetworks",
            DeviceCommand::ConnectWifi { .. } => "wifi.connect",
        }
    }

    pub fn params(&self) -> Value {
        match self {
            DeviceCommand::SetOn(on) => json!({ "on": on }),
            DeviceCommand::SetBrightness(brightness) => json!({ "brightness": brightness }),
            DeviceCommand::SetColor(color) => json!(color),
            DeviceCommand::SetGradient(colors) => json!({ "colors": colors }),
            DeviceCommand::SetName(name) => json!({ "name": name }),
            DeviceCommand::SetCount(count) => json!({ "count": count }),
            DeviceCommand::SetType(led_type) => json!({ "type": led_type }),
            DeviceCommand::ConnectWifi { ssid, pass } => json!({ "ssid": ssid, "pass": pass }),
            DeviceCommand::Restart | DeviceCommand::FactoryReset | DeviceCommand::ScanNetworks => {
                json!({})
            }
        }
    }

    /// `None` for one-shot commands that carry no local state.
    pub fn property(&self) -> Option<Property> {
        match self {
            DeviceCommand::SetOn(_) => Some(Property::Power),
            DeviceCommand::SetBrightness(_) => Some(Property::Brightness),
            DeviceCommand::SetColor(_) | DeviceCommand::SetGradient(_) => Some(Property::Colors),
            DeviceCommand::SetName(_) => Some(Property::Name),
            DeviceCommand::SetCount(_) => Some(Property::PixelCount),
            DeviceCommand::SetType(_) => Some(Property::LedType),
            DeviceCommand::Restart
            | DeviceCommand::FactoryReset
            | DeviceCommand::ScanNetworks
            | DeviceCommand::ConnectWifi { .. } => None,
        }
    }
}
