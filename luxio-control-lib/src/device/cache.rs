use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::debug;
use tokio::sync::watch;

use crate::device::command::{DeviceCommand, Property};
use crate::device::events::{DeviceEvent, EventListeners};
use crate::device::DeviceSnapshot;

/// The authoritative local copy of one device's state.
///
/// Remote updates and optimistic writes both land here. While a write for a
/// property is queued or in flight, remote updates leave that property alone,
/// so a slow poll cannot snap a slider back to a stale value.
#[derive(Debug)]
pub(crate) struct DeviceCache {
    model: watch::Sender<DeviceSnapshot>,
    listeners: EventListeners,
    /// Property -> sequence number of the latest local write.
    pending: Mutex<HashMap<Property, u64>>,
    sequence: Mutex<u64>,
}

impl DeviceCache {
    pub(crate) fn new(initial: DeviceSnapshot) -> Self {
        let (model, _) = watch::channel(initial);
        DeviceCache {
            model,
            listeners: EventListeners::default(),
            pending: Mutex::new(HashMap::new()),
            sequence: Mutex::new(0),
        }
    }

    pub(crate) fn snapshot(&self) -> DeviceSnapshot {
        self.model.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.model.subscribe()
    }

    pub(crate) fn listeners(&self) -> &EventListeners {
        &self.listeners
    }

    /// Applies a full snapshot fetched from the device, topic by topic.
    pub(crate) fn apply_snapshot(&self, snapshot: DeviceSnapshot) {
        self.model.send_modify(|model| model.system_state = snapshot.system_state.clone());
        for event in snapshot.into_events() {
            self.apply_remote(event);
        }
    }

    /// Merges an update that came from the device and notifies listeners if
    /// anything changed.
    ///
    /// Pending properties are read while the model is locked, the same lock
    /// [`Self::apply_local`] marks them under.
    pub(crate) fn apply_remote(&self, event: DeviceEvent) {
        let mut merged = None;
        self.model.send_if_modified(|model| {
            let pending: Vec<Property> = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .copied()
                .collect();
            let current = model.clone();
            let mut incoming = event.clone();
            current.preserve_pending(&mut incoming, &pending);
            model.apply(&incoming);
            if *model == current {
                false
            } else {
                merged = Some(incoming);
                true
            }
        });

        match merged {
            Some(event) => self.listeners.emit(&event),
            None => debug!("Ignoring unchanged {}", event.topic()),
        }
    }

    /// Applies a command locally before it is sent and returns the sequence
    /// number to hand to [`Self::settle`] once the write is done.
    pub(crate) fn apply_local(&self, property: Property, command: &DeviceCommand) -> u64 {
        let mut sequence = 0;
        let mut event = None;
        self.model.send_modify(|model| {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let mut last = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
            *last += 1;
            sequence = *last;
            pending.insert(property, sequence);
            event = model.apply_command(command);
        });
        if let Some(event) = event {
            self.listeners.emit(&event);
        }
        sequence
    }

    /// Marks the write with `sequence` as finished. Remote updates for the
    /// property are accepted again unless a newer write is still pending.
    pub(crate) fn settle(&self, property: Property, sequence: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.get(&property) == Some(&sequence) {
            pending.remove(&property);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::device::events::EventTopic;
    use crate::led::{LedState, Rgbw};

    fn remote_led(on: bool, brightness: u8) -> DeviceEvent {
        DeviceEvent::LedState(LedState {
            on,
            brightness,
            colors: vec![Rgbw::rgb(0, 0, 255), Rgbw::rgb(0, 255, 0)],
        })
    }

    #[test]
    fn test_remote_update_notifies_once() {
        let cache = DeviceCache::new(DeviceSnapshot::default());
        let calls = Arc::new(Mutex::new(0));
        let sink = calls.clone();
        cache.listeners().add(EventTopic::LedState, move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });

        cache.apply_remote(remote_led(true, 40));
        cache.apply_remote(remote_led(true, 40));

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(cache.snapshot().led_state.brightness, 40);
    }

    #[test]
    fn test_pending_property_survives_remote_update() {
        let cache = DeviceCache::new(DeviceSnapshot::default());
        let sequence = cache.apply_local(Property::Brightness, &DeviceCommand::SetBrightness(200));

        cache.apply_remote(remote_led(true, 10));
        let state = cache.snapshot().led_state;
        assert_eq!(state.brightness, 200);
        assert!(state.on, "other fields still follow the device");

        cache.settle(Property::Brightness, sequence);
        cache.apply_remote(remote_led(true, 10));
        assert_eq!(cache.snapshot().led_state.brightness, 10);
    }

    #[test]
    fn test_local_write_racing_remote_updates_is_kept() {
        for _ in 0..200 {
            let cache = DeviceCache::new(DeviceSnapshot::default());
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    for _ in 0..20 {
                        cache.apply_remote(remote_led(true, 10));
                        cache.apply_remote(remote_led(true, 11));
                    }
                });
                scope.spawn(|| {
                    cache.apply_local(Property::Brightness, &DeviceCommand::SetBrightness(200));
                });
            });

            assert_eq!(cache.snapshot().led_state.brightness, 200);
        }
    }

    #[test]
    fn test_older_settle_keeps_newer_write_pending() {
        let cache = DeviceCache::new(DeviceSnapshot::default());
        let first = cache.apply_local(Property::Brightness, &DeviceCommand::SetBrightness(100));
        let _second = cache.apply_local(Property::Brightness, &DeviceCommand::SetBrightness(150));

        cache.settle(Property::Brightness, first);
        cache.apply_remote(remote_led(false, 100));

        assert_eq!(cache.snapshot().led_state.brightness, 150);
    }

    #[test]
    fn test_local_write_notifies_listeners() {
        let cache = DeviceCache::new(DeviceSnapshot::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cache.listeners().add(EventTopic::LedState, move |event| {
            if let DeviceEvent::LedState(state) = event {
                sink.lock().unwrap().push(state.colors.clone());
            }
            Ok(())
        });

        cache.apply_local(Property::Colors, &DeviceCommand::SetColor(Rgbw::rgb(1, 1, 1)));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![vec![Rgbw::rgb(1, 1, 1), Rgbw::rgb(1, 1, 1)]]
        );
    }
}
