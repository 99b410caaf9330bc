//! Radio state tracking
//!
//! Every enumeration or power notification re-resolves the default adapter.
//! Resolutions run concurrently on the platform, so each carries a sequence
//! number and only the newest one is applied.

use crate::ble::transport::{AdapterCapabilities, AdapterInfo, RadioEvent, RadioPower};
use crate::ble::PlatformError;
use crate::event::Event;
use crate::types::{format_address, RadioState};

pub struct RadioMonitor {
    state: RadioState,
    /// True until the platform finishes its initial radio enumeration.
    enumerating: bool,
    issued: u64,
    applied: u64,
}

impl Default for RadioMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioMonitor {
    pub fn new() -> Self {
        Self {
            state: RadioState::Initial,
            enumerating: true,
            issued: 0,
            applied: 0,
        }
    }

    pub fn state(&self) -> RadioState {
        self.state
    }

    /// Decide whether a radio notification needs an adapter resolution,
    /// returning the sequence number to tag it with.
    pub fn on_event(&mut self, event: RadioEvent) -> Option<u64> {
        match event {
            RadioEvent::Added if self.enumerating => None,
            RadioEvent::EnumerationCompleted => {
                self.enumerating = false;
                Some(self.next_sequence())
            }
            _ => Some(self.next_sequence()),
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    /// Apply a finished resolution and return the events it produces.
    pub fn apply(
        &mut self,
        sequence: u64,
        adapter: Result<Option<AdapterInfo>, PlatformError>,
    ) -> Vec<Event> {
        if sequence <= self.applied {
            log::debug!(
                "discarding radio resolution {} (already applied {})",
                sequence,
                self.applied
            );
            return Vec::new();
        }
        self.applied = sequence;

        let (state, capabilities) = match adapter {
            Ok(Some(info)) => (Self::classify(&info), info.capabilities),
            Ok(None) => {
                log::info!("no default Bluetooth adapter");
                (RadioState::Unsupported, AdapterCapabilities::default())
            }
            Err(err) => {
                log::warn!("could not resolve default adapter: {}", err);
                (RadioState::Unsupported, AdapterCapabilities::default())
            }
        };
        log::debug!("adapter capabilities: {:?}", capabilities);

        let mut events = Vec::new();
        if state != self.state {
            log::info!("radio state {} -> {}", self.state, state);
            self.state = state;
            events.push(Event::StateChange { state });
        }
        if capabilities.address != 0 {
            events.push(Event::AddressChange {
                address: format_address(capabilities.address),
            });
        }
        events
    }

    fn classify(info: &AdapterInfo) -> RadioState {
        if !info.capabilities.central_role {
            return RadioState::Unsupported;
        }
        match info.power {
            RadioPower::On => RadioState::PoweredOn,
            RadioPower::Off | RadioPower::Disabled => RadioState::PoweredOff,
            RadioPower::Unknown => RadioState::Unknown,
        }
    }
}
