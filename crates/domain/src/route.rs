//! Delivery routing context.
//!
//! Where a reply should go: channel, provider account, peer, thread. A
//! caller-supplied route takes precedence over the session's last-known
//! route field-by-field, never all-or-nothing.

use serde::{Deserialize, Serialize};

/// Delivery target for an outbound agent message. All fields optional;
/// missing fields fall back to the session's last-known values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRoute {
    pub channel: Option<String>,
    pub provider: Option<String>,
    pub to: Option<String>,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
}

impl DeliveryRoute {
    /// Merge an explicit route over a fallback, field-by-field.
    pub fn merged_over(&self, fallback: &DeliveryRoute) -> DeliveryRoute {
        DeliveryRoute {
            channel: self.channel.clone().or_else(|| fallback.channel.clone()),
            provider: self.provider.clone().or_else(|| fallback.provider.clone()),
            to: self.to.clone().or_else(|| fallback.to.clone()),
            account_id: self
                .account_id
                .clone()
                .or_else(|| fallback.account_id.clone()),
            thread_id: self
                .thread_id
                .clone()
                .or_else(|| fallback.thread_id.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_none()
            && self.provider.is_none()
            && self.to.is_none()
            && self.account_id.is_none()
            && self.thread_id.is_none()
    }
}
