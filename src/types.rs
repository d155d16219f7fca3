//! Notification types consumed from the broker.
//!
//! Neutron publishes one JSON object per notification on the
//! `notifications.info` queue.  Only the fields needed to keep DNS in
//! step with floating IP assignments are decoded; everything else in the
//! payload is ignored.

use serde::{Deserialize, Deserializer};

/// The only event type that leads to a record operation.
pub const FLOATING_IP_UPDATE_END: &str = "floatingip.update.end";

/// One decoded notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Message {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub event_type: String,
    #[serde(default)]
    pub payload: FloatingIpPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FloatingIpPayload {
    #[serde(rename = "floatingip", default)]
    pub floating_ip: FloatingIpUpdate,
}

/// Floating IP state after the update.  An empty `fixed_ip_address`
/// means the address was detached from its port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FloatingIpUpdate {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub floating_ip_address: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub fixed_ip_address: String,
}

/// What the controller should do for an accepted notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordAction {
    /// The floating IP was attached to a port.  The owning instance still
    /// has to be resolved before a record can be created.
    Create { floating_ip: String },
    /// The floating IP was detached.  The notification carries no instance
    /// identity, so removal is keyed on the address alone.
    Remove { floating_ip: String },
}

impl Message {
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Maps a decoded message to a record action, or `None` when it is not a
    /// floating IP update or carries no floating address.
    pub fn action(&self) -> Option<RecordAction> {
        if self.event_type != FLOATING_IP_UPDATE_END {
            return None;
        }
        let update = &self.payload.floating_ip;
        if update.floating_ip_address.is_empty() {
            return None;
        }
        let floating_ip = update.floating_ip_address.clone();
        if update.fixed_ip_address.is_empty() {
            Some(RecordAction::Remove { floating_ip })
        } else {
            Some(RecordAction::Create { floating_ip })
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_event_creates() {
        let body = br#"{"event_type":"floatingip.update.end","payload":{"floatingip":{"floating_ip_address":"203.0.113.5","fixed_ip_address":"10.0.0.7"}}}"#;
        let msg = Message::decode(body).unwrap();
        assert_eq!(
            msg.action(),
            Some(RecordAction::Create {
                floating_ip: "203.0.113.5".into()
            })
        );
    }

    #[test]
    fn detach_event_with_null_fixed_ip_removes() {
        let body = br#"{"event_type":"floatingip.update.end","payload":{"floatingip":{"floating_ip_address":"203.0.113.9","fixed_ip_address":null,"port_id":null}}}"#;
        let msg = Message::decode(body).unwrap();
        assert_eq!(msg.payload.floating_ip.fixed_ip_address, "");
        assert_eq!(
            msg.action(),
            Some(RecordAction::Remove {
                floating_ip: "203.0.113.9".into()
            })
        );
    }

    #[test]
    fn other_event_types_are_ignored() {
        let body = br#"{"event_type":"compute.instance.create","payload":{"instance_id":"abc"}}"#;
        let msg = Message::decode(body).unwrap();
        assert_eq!(msg.event_type, "compute.instance.create");
        assert_eq!(msg.action(), None);
    }

    #[test]
    fn missing_floating_address_is_ignored() {
        let body = br#"{"event_type":"floatingip.update.end","payload":{}}"#;
        let msg = Message::decode(body).unwrap();
        assert_eq!(msg.action(), None);
    }

    #[test]
    fn malformed_body_fails_to_decode() {
        assert!(Message::decode(b"{not json").is_err());
        assert!(Message::decode(br#"{"event_type":"floatingip.update.end","payload":"oops"}"#).is_err());
    }
}
