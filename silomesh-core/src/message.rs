//! Wire-level message model — spec.md §3 "Message", §4.6, §6 "Wire framing".

use crate::address::{ActivationAddress, GrainId, SiloAddress};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Per-silo unique correlation id assigned to an outbound request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    Request,
    Response,
    OneWay,
}

/// Rejection taxonomy from spec.md §4.6 / §7.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RejectionKind {
    /// Retryable without any special handling.
    Transient,
    /// Retryable, but only after the cache entry that produced the stale
    /// route has been invalidated.
    Unrecoverable,
    /// Retryable after a backoff; the target silo is overloaded.
    GatewayTooBusy,
    /// Side-effect only: invalidate the listed addresses, do not complete
    /// the caller's request.
    CacheInvalidation,
    /// The same correlation id was already completed; ignored.
    DuplicateRequest,
}

impl RejectionKind {
    /// Whether the router should re-address and resend this message.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RejectionKind::Transient | RejectionKind::Unrecoverable | RejectionKind::GatewayTooBusy
        )
    }
}

/// A call-chain root — all messages descending from one externally
/// initiated call share this id (spec.md §4.5 "call-chain reentrancy").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CallChainId(pub u64);

/// Ambient per-call context threaded explicitly through every invocation
/// (spec.md §9: "global mutable state ... must be made explicit").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub call_chain: Option<CallChainId>,
    pub values: HashMap<String, String>,
    pub cancelled: bool,
}

impl RequestContext {
    pub fn root(call_chain: CallChainId) -> Self {
        Self {
            call_chain: Some(call_chain),
            values: HashMap::new(),
            cancelled: false,
        }
    }

    pub fn same_call_chain(&self, other: &RequestContext) -> bool {
        self.call_chain.is_some() && self.call_chain == other.call_chain
    }
}

/// Message header fields, spec.md §3.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageHeader {
    pub sending_grain: Option<GrainId>,
    pub sending_silo: SiloAddress,
    pub target_grain: GrainId,
    pub target_silo: Option<SiloAddress>,
    pub correlation_id: CorrelationId,
    pub direction: Direction,
    pub interface_type: String,
    pub interface_version: u32,
    pub expires_at: SystemTime,
    pub retry_count: u32,
    pub cache_invalidation: Vec<ActivationAddress>,
    pub context: RequestContext,
    pub rejection: Option<RejectionKind>,
}

/// Message body: either an invokable call or a response payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MessageBody {
    Invokable { method: String, args: Vec<u8> },
    Response { payload: Vec<u8> },
    ApplicationError { message: String, stack: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.header.expires_at
    }

    pub fn is_one_way(&self) -> bool {
        self.header.direction == Direction::OneWay
    }

    /// Compute an absolute expiry at send time, spec.md §4.6 "Expiration".
    pub fn expiry_from(now: SystemTime, timeout: Duration) -> SystemTime {
        now + timeout
    }
}
