use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use log::{error, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::device::{SystemConfig, WifiState};
use crate::error::ValidationError;
use crate::led::{LedConfig, LedState};

/// Topics a device publishes. Each topic carries exactly one payload type,
/// see [`DeviceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    LedState,
    LedConfig,
    SystemConfig,
    WifiState,
}

impl EventTopic {
    pub const ALL: [EventTopic; 4] = [
        EventTopic::LedState,
        EventTopic::LedConfig,
        EventTopic::SystemConfig,
        EventTopic::WifiState,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::LedState => "led.state",
            EventTopic::LedConfig => "led.config",
            EventTopic::SystemConfig => "system.config",
            EventTopic::WifiState => "wifi.state",
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventTopic {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventTopic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| ValidationError::invalid("topic", format!("unknown topic {}", s)))
    }
}

/// A state change published by a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", content = "data")]
pub enum DeviceEvent {
    #[serde(rename = "led.state")]
    LedState(LedState),
    #[serde(rename = "led.config")]
    LedConfig(LedConfig),
    #[serde(rename = "system.config")]
    SystemConfig(SystemConfig),
    #[serde(rename = "wifi.state")]
    WifiState(WifiState),
}

impl DeviceEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            DeviceEvent::LedState(_) => EventTopic::LedState,
            DeviceEvent::LedConfig(_) => EventTopic::LedConfig,
            DeviceEvent::SystemConfig(_) => EventTopic::SystemConfig,
            DeviceEvent::WifiState(_) => EventTopic::WifiState,
        }
    }

    /// Decodes a wire event. `led.state` payloads are normalized, so an empty
    /// color list is rejected here.
    pub fn decode(topic: &str, data: &str) -> Result<DeviceEvent, ValidationError> {
        let topic: EventTopic = topic.parse()?;
        let invalid = |e: serde_json::Error| ValidationError::invalid("payload", e.to_string());
        let event = match topic {
            EventTopic::LedState => {
                let state: LedState = serde_json::from_str(data).map_err(invalid)?;
                DeviceEvent::LedState(state.normalized()?)
            }
            EventTopic::LedConfig => DeviceEvent::LedConfig(serde_json::from_str(data).map_err(invalid)?),
            EventTopic::SystemConfig => {
                DeviceEvent::SystemConfig(serde_json::from_str(data).map_err(invalid)?)
            }
            EventTopic::WifiState => DeviceEvent::WifiState(serde_json::from_str(data).map_err(invalid)?),
        };
        Ok(event)
    }
}

/// Handle returned by [`EventListeners::add`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

type Handler = Arc<dyn Fn(&DeviceEvent) -> anyhow::Result<()> + Send + Sync>;

/// Observers of one device, keyed by topic.
#[derive(Default)]
pub struct EventListeners {
    handlers: RwLock<Vec<(ListenerId, EventTopic, Handler)>>,
}

impl EventListeners {
    pub fn add<F>(&self, topic: EventTopic, handler: F) -> ListenerId
    where
        F: Fn(&DeviceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(Uuid::new_v4());
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, topic, Arc::new(handler)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(listener, _, _)| *listener != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every handler registered for the event's topic, in registration
    /// order. A handler that errors or panics is logged and skipped.
    pub fn emit(&self, event: &DeviceEvent) {
        let topic = event.topic();
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, t, _)| *t == topic)
            .map(|(_, _, handler)| handler.clone())
            .collect();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener for {} failed: {:#}", topic, e),
                Err(_) => error!("Listener for {} panicked", topic),
            }
        }
    }
}

impl fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners").field("count", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use anyhow::anyhow;

    use crate::led::Rgbw;

    fn led_event(brightness: u8) -> DeviceEvent {
        DeviceEvent::LedState(LedState {
            on: true,
            brightness,
            colors: vec![Rgbw::rgb(1, 2, 3), Rgbw::rgb(1, 2, 3)],
        })
    }

    #[test]
    fn test_topic_round_trips_through_its_name() {
        for topic in EventTopic::ALL {
            assert_eq!(topic.as_str().parse::<EventTopic>().unwrap(), topic);
        }
        assert!("led.animation".parse::<EventTopic>().is_err());
    }

    #[test]
    fn test_decode_single_color_is_exposed_as_two() {
        let event = DeviceEvent::decode(
            "led.state",
            r#"{"on":true,"brightness":200,"colors":[{"r":9,"g":8,"b":7,"w":0}]}"#,
        )
        .unwrap();
        match event {
            DeviceEvent::LedState(state) => {
                assert_eq!(state.colors, vec![Rgbw::rgb(9, 8, 7), Rgbw::rgb(9, 8, 7)]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_empty_colors() {
        let result = DeviceEvent::decode("led.state", r#"{"on":true,"brightness":1,"colors":[]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_handlers_only_see_their_topic() {
        let listeners = EventListeners::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        listeners.add(EventTopic::LedConfig, move |event| {
            sink.lock().unwrap().push(event.topic());
            Ok(())
        });

        listeners.emit(&led_event(1));
        listeners.emit(&DeviceEvent::LedConfig(LedConfig::default()));

        assert_eq!(*seen.lock().unwrap(), vec![EventTopic::LedConfig]);
    }

    #[test]
    fn test_failing_handler_does_not_stop_delivery() {
        let listeners = EventListeners::default();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        listeners.add(EventTopic::LedState, |_| Err(anyhow!("render failed")));
        listeners.add(EventTopic::LedState, |_| panic!("listener bug"));
        let sink = delivered.clone();
        listeners.add(EventTopic::LedState, move |event| {
            if let DeviceEvent::LedState(state) = event {
                sink.lock().unwrap().push(state.brightness);
            }
            Ok(())
        });

        listeners.emit(&led_event(10));
        listeners.emit(&led_event(20));

        assert_eq!(*delivered.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let listeners = EventListeners::default();
        let calls = Arc::new(Mutex::new(0));
        let sink = calls.clone();
        let id = listeners.add(EventTopic::LedState, move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });

        listeners.emit(&led_event(1));
        assert!(listeners.remove(id));
        listeners.emit(&led_event(2));

        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(listeners.is_empty());
    }
}
