//! Gateway local-control state and LAN discovery replies.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Local-control facts about one gateway.
///
/// `address` is only trusted while `reachable` is true; a failed probe clears
/// it. The local token is issued by the cloud and expires after `token_ttl`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayLocalState {
    pub gateway_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_token: Option<String>,
    /// Unix seconds after which the local token is no longer accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_ttl: Option<u64>,
    #[serde(default)]
    pub reachable: bool,
}

impl GatewayLocalState {
    pub fn new(gateway_id: u64) -> Self {
        Self {
            gateway_id,
            ..Default::default()
        }
    }

    /// True when there is no token, no expiry, or the expiry has passed.
    pub fn token_expired_at(&self, now_secs: u64) -> bool {
        match (&self.local_token, self.token_ttl) {
            (Some(_), Some(ttl)) => ttl <= now_secs,
            _ => true,
        }
    }

    /// Whether there is enough cached state to attempt a probe.
    pub fn can_probe(&self) -> bool {
        self.address.is_some() && self.local_token.is_some()
    }

    /// Eligible for local control at `now_secs`.
    pub fn supports_local_control(&self, now_secs: u64) -> bool {
        self.reachable && self.can_probe() && !self.token_expired_at(now_secs)
    }

    /// Stores a fresh grant from the cloud.
    pub fn apply_grant(&mut self, grant: &LocalTokenGrant) {
        self.address = Some(grant.address.clone());
        self.local_token = Some(grant.token.clone());
        self.token_ttl = Some(grant.ttl);
    }

    /// Forgets the address and marks the gateway unreachable.
    pub fn invalidate(&mut self) {
        self.address = None;
        self.reachable = false;
    }
}

/// Local token grant returned by the cloud service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTokenGrant {
    pub address: String,
    pub token: String,
    /// Unix seconds of expiry.
    pub ttl: u64,
}

/// Parse failure for a discovery reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed discovery reply: {0}")]
pub struct MalformedReply(pub String);

/// Answer to the LAN discovery probe: `product:mac:code:firmware[:uuid]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReply {
    pub product: String,
    pub mac: String,
    pub activation_code: String,
    pub firmware: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl DiscoveryReply {
    pub fn parse(datagram: &str) -> Result<Self, MalformedReply> {
        let text = datagram.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        // a colon-separated MAC spans six fields
        let parts: Vec<&str> = text.split(':').collect();
        let (product, mac, rest) = match parts.len() {
            n if n >= 9 => (parts[0], parts[1..7].join(":"), &parts[7..]),
            n if n >= 4 => (parts[0], parts[1].to_string(), &parts[2..]),
            _ => return Err(MalformedReply(text.to_string())),
        };
        if product.is_empty() || rest.len() < 2 {
            return Err(MalformedReply(text.to_string()));
        }
        Ok(Self {
            product: product.to_string(),
            mac,
            activation_code: rest[0].to_string(),
            firmware: rest[1].to_string(),
            uuid: rest.get(2).filter(|u| !u.is_empty()).map(|u| u.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry() {
        let mut state = GatewayLocalState::new(1);
        assert!(state.token_expired_at(0));

        state.apply_grant(&LocalTokenGrant {
            address: "192.168.1.20".into(),
            token: "tok".into(),
            ttl: 1_000,
        });
        assert!(!state.token_expired_at(999));
        assert!(state.token_expired_at(1_000));
        assert!(state.can_probe());
    }

    #[test]
    fn test_local_control_requires_reachability() {
        let mut state = GatewayLocalState::new(1);
        state.apply_grant(&LocalTokenGrant {
            address: "10.0.0.2".into(),
            token: "tok".into(),
            ttl: 100,
        });
        assert!(!state.supports_local_control(10));
        state.reachable = true;
        assert!(state.supports_local_control(10));

        state.invalidate();
        assert!(state.address.is_none());
        assert!(!state.supports_local_control(10));
    }

    #[test]
    fn test_parse_plain_reply() {
        let reply = DiscoveryReply::parse("TellStickZnet:ACCA5400AABB:XYZCODE:1.3.0:uuid-1").unwrap();
        assert_eq!(reply.product, "TellStickZnet");
        assert_eq!(reply.mac, "ACCA5400AABB");
        assert_eq!(reply.activation_code, "XYZCODE");
        assert_eq!(reply.firmware, "1.3.0");
        assert_eq!(reply.uuid.as_deref(), Some("uuid-1"));
    }

    #[test]
    fn test_parse_reply_without_uuid() {
        let reply = DiscoveryReply::parse("TellStickNet:ACCA5400AABB:CODE:17\n").unwrap();
        assert_eq!(reply.firmware, "17");
        assert!(reply.uuid.is_none());
    }

    #[test]
    fn test_parse_colon_mac() {
        let reply = DiscoveryReply::parse("Znet:AC:CA:54:00:AA:BB:CODE:2.0:u").unwrap();
        assert_eq!(reply.mac, "AC:CA:54:00:AA:BB");
        assert_eq!(reply.activation_code, "CODE");
        assert_eq!(reply.uuid.as_deref(), Some("u"));
    }

    #[test]
    fn test_parse_rejects_short_reply() {
        assert!(DiscoveryReply::parse("garbage").is_err());
        assert!(DiscoveryReply::parse("a:b:c").is_err());
    }
}
