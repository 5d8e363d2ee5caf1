//! Connection Manager — spec.md §4.7, §6 "Wire framing" / "Preamble".
//!
//! Handshake/acceptance shape grounded on `knhk-sidecar::server::ServerConfig`
//! and `knhk-sidecar::tls` (bind address plus a validated identity exchange
//! before any application traffic flows). The prefix-buffer writer has no
//! direct teacher analogue; it follows the teacher's preference for explicit
//! buffer ownership over an abstracted byte-pooling crate, using
//! `bytes::BytesMut` as the sink (already a teacher workspace dependency
//! transitively via `knhk-consensus`).

pub mod prefix_writer;

use serde::{Deserialize, Serialize};
use silomesh_core::address::SiloAddress;
use silomesh_core::error::{RuntimeError, RuntimeResult};
use tracing::error;

pub use prefix_writer::PrefixBufferWriter;

/// The fixed identifying packet exchanged at connection setup (spec.md §6
/// "Preamble").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Preamble {
    pub node_identity: String,
    pub protocol_version: u32,
    pub silo_address: Option<SiloAddress>,
    pub cluster_id: String,
}

pub struct ConnectionManager {
    self_identity: String,
    cluster_id: String,
    protocol_version: u32,
}

impl ConnectionManager {
    pub fn new(self_identity: impl Into<String>, cluster_id: impl Into<String>, protocol_version: u32) -> Self {
        Self {
            self_identity: self_identity.into(),
            cluster_id: cluster_id.into(),
            protocol_version,
        }
    }

    /// The preamble this side writes on connect (spec.md §4.7 step 2).
    pub fn writer_preamble(&self, silo_address: Option<SiloAddress>) -> Preamble {
        Preamble {
            node_identity: self.self_identity.clone(),
            protocol_version: self.protocol_version,
            silo_address,
            cluster_id: self.cluster_id.clone(),
        }
    }

    /// Validate a peer's preamble read off the wire (spec.md §4.7 steps 1 and
    /// 3). Cluster id mismatch and protocol version mismatch are both fatal;
    /// logged before the caller closes the connection.
    pub fn validate_peer_preamble(&self, peer: &Preamble) -> RuntimeResult<()> {
        if peer.cluster_id != self.cluster_id {
            error!(peer = %peer.node_identity, expected = %self.cluster_id, actual = %peer.cluster_id, "transport: cluster id mismatch, closing connection");
            return Err(RuntimeError::ClusterIdMismatch {
                expected: self.cluster_id.clone(),
                actual: peer.cluster_id.clone(),
            });
        }
        if peer.protocol_version != self.protocol_version {
            error!(peer = %peer.node_identity, expected = self.protocol_version, actual = peer.protocol_version, "transport: protocol version mismatch, closing connection");
            return Err(RuntimeError::ProtocolVersionMismatch {
                expected: self.protocol_version,
                actual: peer.protocol_version,
            });
        }
        Ok(())
    }
}

/// Frame a header/body pair as `[4-byte header length][4-byte body
/// length][header bytes][body bytes]` (spec.md §6 "Wire framing").
pub fn frame(header: &[u8], body: &[u8]) -> Vec<u8> {
    let mut writer = PrefixBufferWriter::new(8, body.len());
    writer.write(header);
    writer.write(body);
    let mut prefix = [0u8; 8];
    prefix[0..4].copy_from_slice(&(header.len() as u32).to_be_bytes());
    prefix[4..8].copy_from_slice(&(body.len() as u32).to_be_bytes());
    writer.complete(&prefix)
}

/// Parse a frame produced by [`frame`], returning `(header, body)` slices.
pub fn unframe(buf: &[u8]) -> RuntimeResult<(&[u8], &[u8])> {
    if buf.len() < 8 {
        return Err(RuntimeError::Internal("frame shorter than the 8-byte length prefix".into()));
    }
    let header_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    let body_len = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
    let header_start = 8;
    let body_start = header_start + header_len;
    let body_end = body_start + body_len;
    if buf.len() < body_end {
        return Err(RuntimeError::Internal("frame truncated: declared lengths exceed buffer".into()));
    }
    Ok((&buf[header_start..body_start], &buf[body_start..body_end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_id_mismatch_is_fatal() {
        let manager = ConnectionManager::new("silo-1", "prod-cluster", 1);
        let peer = Preamble {
            node_identity: "silo-2".into(),
            protocol_version: 1,
            silo_address: None,
            cluster_id: "other-cluster".into(),
        };
        assert!(matches!(
            manager.validate_peer_preamble(&peer),
            Err(RuntimeError::ClusterIdMismatch { .. })
        ));
    }

    #[test]
    fn matching_preamble_validates() {
        let manager = ConnectionManager::new("silo-1", "prod-cluster", 1);
        let peer = manager.writer_preamble(None);
        assert!(manager.validate_peer_preamble(&peer).is_ok());
    }

    #[test]
    fn frame_round_trips_header_and_body() {
        let header = b"header-bytes";
        let body = b"body-bytes-longer-than-header";
        let framed = frame(header, body);
        let (h, b) = unframe(&framed).unwrap();
        assert_eq!(h, header);
        assert_eq!(b, body);
    }
}
