//! Cluster configuration: an ordered list of servers plus the wire encoding
//! of §6.

use crate::error::DecodeError;
use crate::error::RaftError;
use crate::quorum::majority_of;
use crate::raft_types::NodeId;
use serde::Deserialize;
use serde::Serialize;

const CONFIGURATION_VERSION: u8 = 1;

/// A single member of a [`Configuration`].
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Server {
    pub id: NodeId,
    pub address: String,
    /// Whether this server counts toward election majorities and quorum
    /// commit (§4.2, §4.3). A server may occupy any of the four roles
    /// regardless of this flag — it is purely a membership-accounting bit,
    /// not a separate role.
    pub voting: bool,
}

/// The ordered, uniquely-keyed list of servers that makes up a cluster at a
/// point in time (§3).
///
/// Exactly one `Configuration` is ever "current" on a given node; this crate
/// never represents a joint `(C_old, C_new)` pair (§4.5).
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Configuration {
    servers: Vec<Server>,
}

impl Configuration {
    pub fn empty() -> Self {
        Self { servers: Vec::new() }
    }

    /// The initial single-voter configuration a blank server bootstraps
    /// into (§3 "Lifecycle", scenario 1 of §8).
    pub fn new_initial(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            servers: vec![Server {
                id,
                address: address.into(),
                voting: true,
            }],
        }
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn get(&self, id: NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| s.voting)
    }

    pub fn voter_ids(&self) -> Vec<NodeId> {
        self.voters().map(|s| s.id).collect()
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    pub fn majority(&self) -> usize {
        majority_of(self.voter_count())
    }

    pub fn all_ids(&self) -> Vec<NodeId> {
        self.servers.iter().map(|s| s.id).collect()
    }

    /// Returns a copy of this configuration with a new non-voting server
    /// inserted (§4.5 "Add").
    pub fn with_added(&self, id: NodeId, address: impl Into<String>) -> Result<Self, RaftError> {
        if id == 0 {
            return Err(RaftError::BadId);
        }
        let address = address.into();
        if self.contains(id) {
            return Err(RaftError::DuplicateId(id));
        }
        if self.servers.iter().any(|s| s.address == address) {
            return Err(RaftError::DuplicateAddress(address));
        }
        let mut servers = self.servers.clone();
        servers.push(Server {
            id,
            address,
            voting: false,
        });
        Ok(Self { servers })
    }

    /// Returns a copy of this configuration with `id` flipped to voting
    /// (§4.5 "Promote").
    pub fn with_promoted(&self, id: NodeId) -> Result<Self, RaftError> {
        let mut servers = self.servers.clone();
        let server = servers.iter_mut().find(|s| s.id == id).ok_or(RaftError::BadId)?;
        if server.voting {
            return Err(RaftError::AlreadyVoting(id));
        }
        server.voting = true;
        Ok(Self { servers })
    }

    /// Returns a copy of this configuration with `id` removed (§4.5 "Remove").
    pub fn with_removed(&self, id: NodeId) -> Result<Self, RaftError> {
        if !self.contains(id) {
            return Err(RaftError::BadId);
        }
        let servers = self.servers.iter().filter(|s| s.id != id).cloned().collect();
        Ok(Self { servers })
    }

    /// Encodes this configuration per §6: `u8 version=1 || u64 n || per
    /// server: u64 id || null-terminated address || u8 voting`, the whole
    /// block padded to 8 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(CONFIGURATION_VERSION);
        buf.extend_from_slice(&(self.servers.len() as u64).to_le_bytes());
        for server in &self.servers {
            buf.extend_from_slice(&server.id.to_le_bytes());
            buf.extend_from_slice(server.address.as_bytes());
            buf.push(0); // null terminator
            buf.push(server.voting as u8);
        }
        pad_to_8(&mut buf);
        buf
    }

    /// Decodes the §6 configuration encoding. Rejects unsupported versions
    /// and addresses whose null terminator was truncated away, both as
    /// `DecodeError::Malformed`-equivalent failures (§8 round-trip laws).
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut pos = 0usize;
        let version = *buf.get(pos).ok_or(DecodeError::Truncated)?;
        pos += 1;
        if version != CONFIGURATION_VERSION {
            return Err(DecodeError::UnsupportedVersion);
        }
        let n = read_u64(buf, &mut pos)?;
        let mut servers = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let id = read_u64(buf, &mut pos)?;
            let start = pos;
            let nul = buf[start..].iter().position(|&b| b == 0).ok_or(DecodeError::Truncated)?;
            let address = std::str::from_utf8(&buf[start..start + nul])
                .map_err(|_| DecodeError::Truncated)?
                .to_owned();
            pos = start + nul + 1;
            let voting = *buf.get(pos).ok_or(DecodeError::Truncated)? != 0;
            pos += 1;
            servers.push(Server { id, address, voting });
        }
        Ok(Self { servers })
    }
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
    let bytes = buf.get(*pos..*pos + 8).ok_or(DecodeError::Truncated)?;
    *pos += 8;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn pad_to_8(buf: &mut Vec<u8>) {
    let rem = buf.len() % 8;
    if rem != 0 {
        buf.resize(buf.len() + (8 - rem), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut conf = Configuration::new_initial(1, "node-a");
        conf = conf.with_added(2, "node-b").unwrap();
        conf = conf.with_added(3, "node-c").unwrap();
        conf = conf.with_promoted(2).unwrap();

        let encoded = conf.encode();
        assert_eq!(encoded.len() % 8, 0);
        let decoded = Configuration::decode(&encoded).unwrap();
        assert_eq!(conf, decoded);
    }

    #[test]
    fn decode_rejects_bad_version() {
        let buf = vec![2u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(Configuration::decode(&buf), Err(DecodeError::UnsupportedVersion));
    }

    #[test]
    fn decode_rejects_truncated_address() {
        let mut buf = vec![1u8];
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(b"no-terminator");
        // deliberately omit the null terminator and voting byte
        assert_eq!(Configuration::decode(&buf), Err(DecodeError::Truncated));
    }

    #[test]
    fn duplicate_id_and_address_rejected() {
        let conf = Configuration::new_initial(1, "a");
        assert!(matches!(conf.with_added(1, "b"), Err(RaftError::DuplicateId(1))));
        assert!(matches!(conf.with_added(2, "a"), Err(RaftError::DuplicateAddress(_))));
    }
}
