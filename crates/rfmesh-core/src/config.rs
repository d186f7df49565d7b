//! Protocol constants and node configuration

use crate::address::NodeId;
use crate::traits::{DataRate, PowerLevel};

/// Default radio channel (1-127)
pub const DEFAULT_CHANNEL: u8 = 97;

/// Default maximum children per node
pub const MAX_CHILDREN: u8 = 4;

/// Hard cap on children per node (octal digits 1..=5)
pub const MAX_CHILDREN_CAP: u8 = 5;

/// Upper bound on master binding-table entries
pub const MAX_ADDRESSES: usize = 255;

/// How long `write` retries address lookups before giving up
pub const LOOKUP_TIMEOUT_MS: u32 = 3000;

/// Default budget for a full address renewal
pub const RENEWAL_TIMEOUT_MS: u32 = 60_000;

/// How long one discovery poll collects responses
pub const POLL_TIMEOUT_MS: u32 = 55;

/// Maximum contacts collected per discovery poll
pub const MAX_POLLS: usize = 4;

/// How long to wait for an address offer through one contact
pub const ADDR_RESPONSE_TIMEOUT_MS: u32 = 225;

/// Pause between address requests to successive contacts
pub const CONTACT_PAUSE_MS: u32 = 5;

/// Attempts to deliver the address confirmation
pub const CONFIRM_RETRIES: u8 = 6;

/// Spacing between confirmation attempts
pub const CONFIRM_RETRY_DELAY_MS: u32 = 3;

/// Wait for a peer address lookup response
pub const ADDR_LOOKUP_TIMEOUT_MS: u32 = 150;

/// Wait for a peer id lookup response
pub const ID_LOOKUP_TIMEOUT_MS: u32 = 500;

/// Spacing between connectivity pings
pub const PING_SPACING_MS: u32 = 103;

/// Connectivity ping attempts
pub const PING_ATTEMPTS: u8 = 3;

/// Initial delay (and per-attempt increment) of the lookup retry loop
pub const LOOKUP_RETRY_DELAY_MS: u32 = 50;

/// Node configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// This node's stable identifier (0 = master)
    pub node_id: NodeId,
    /// Radio channel (1-127)
    pub channel: u8,
    /// Radio data rate
    pub data_rate: DataRate,
    /// Radio transmit power
    pub power: PowerLevel,
    /// Maximum children per node, clamped to [`MAX_CHILDREN_CAP`]
    pub max_children: u8,
    /// Budget for address renewal during `begin`
    pub renewal_timeout_ms: u32,
    /// Budget for the `write` lookup retry loop
    pub lookup_timeout_ms: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::MASTER,
            channel: DEFAULT_CHANNEL,
            data_rate: DataRate::default(),
            power: PowerLevel::default(),
            max_children: MAX_CHILDREN,
            renewal_timeout_ms: RENEWAL_TIMEOUT_MS,
            lookup_timeout_ms: LOOKUP_TIMEOUT_MS,
        }
    }
}

impl MeshConfig {
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_max_children(mut self, max_children: u8) -> Self {
        self.max_children = max_children.clamp(1, MAX_CHILDREN_CAP);
        self
    }

    pub fn with_renewal_timeout(mut self, timeout_ms: u32) -> Self {
        self.renewal_timeout_ms = timeout_ms;
        self
    }

    pub fn with_lookup_timeout(mut self, timeout_ms: u32) -> Self {
        self.lookup_timeout_ms = timeout_ms;
        self
    }
}
