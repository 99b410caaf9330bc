//! Notification subscriptions of one connection

use std::collections::HashMap;
use std::sync::Arc;

use crate::ble::transport::{CharacteristicHandle, ListenerToken, Platform};
use crate::types::BleUuid;

/// (service, characteristic) UUID pair identifying a subscription.
pub type SubscriptionKey = (BleUuid, BleUuid);

/// A registered value-change listener. Unregistered when dropped.
pub struct Subscription {
    platform: Arc<dyn Platform>,
    characteristic: CharacteristicHandle,
    token: ListenerToken,
}

impl Subscription {
    pub fn new(
        platform: Arc<dyn Platform>,
        characteristic: CharacteristicHandle,
        token: ListenerToken,
    ) -> Self {
        Self {
            platform,
            characteristic,
            token,
        }
    }

    fn matches(&self, characteristic: CharacteristicHandle, token: ListenerToken) -> bool {
        self.characteristic == characteristic && self.token == token
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.platform.unwatch_value(self.characteristic, self.token);
    }
}

#[derive(Default)]
pub struct NotificationRegistry {
    subscriptions: HashMap<SubscriptionKey, Subscription>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions.contains_key(key)
    }

    pub fn insert(&mut self, key: SubscriptionKey, subscription: Subscription) {
        self.subscriptions.insert(key, subscription);
    }

    /// Drop a subscription, unregistering its listener.
    pub fn remove(&mut self, key: &SubscriptionKey) -> bool {
        self.subscriptions.remove(key).is_some()
    }

    /// Whether a value-change delivery comes from the live listener of
    /// `key`. Deliveries for a replaced or removed listener do not.
    pub fn delivers(
        &self,
        key: &SubscriptionKey,
        characteristic: CharacteristicHandle,
        token: ListenerToken,
    ) -> bool {
        self.subscriptions
            .get(key)
            .is_some_and(|sub| sub.matches(characteristic, token))
    }
}
