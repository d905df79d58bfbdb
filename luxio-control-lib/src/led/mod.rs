pub mod led_color;
pub mod led_state;

pub use led_color::{PresetColor, PresetGradient, Rgbw};
pub use led_state::{LedConfig, LedState, LedType};
