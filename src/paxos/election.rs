//! Election results binding a block of instances to one membership.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use super::Epoch;
use crate::utils::{ErrorKind, VeelaError};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

/// Addressing hint for reaching an acceptor. Not part of safety logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddr {
    /// Transport flag, e.g. "tcp" or "udp".
    pub protocol: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// Mapping from acceptor ID to its address hint.
pub type AcceptorIdMapToNetworkAddr = BTreeMap<Epoch, NetworkAddr>;

/// Largest number of instances one term may span. Each instance of a term
/// is materialized in the summary, so the length must stay allocatable.
pub const MAX_TERM_LEN: u64 = i32::MAX as u64;

/// Outcome of an external election: exactly `term_len` consecutive instance
/// epochs starting at `start_from_inst_e`, served by `acceptor_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionResult {
    pub term_len: u64,
    pub start_from_inst_e: Epoch,
    pub acceptor_ids: Vec<Epoch>,
    /// Either empty or one hint per entry of `acceptor_ids`.
    pub acceptor_addr_hints: Vec<NetworkAddr>,
}

impl ElectionResult {
    /// Checks the shape of this election result.
    pub fn validate(&self) -> Result<(), VeelaError> {
        let invalid = |msg: String| Err(VeelaError::new(ErrorKind::Other, msg));
        if self.term_len == 0 {
            return invalid("election result has zero term length".into());
        }
        if self.term_len > MAX_TERM_LEN {
            return invalid(format!(
                "election result term length {} exceeds {}",
                self.term_len, MAX_TERM_LEN
            ));
        }
        if self.start_from_inst_e.is_null() {
            return invalid("election result starts at null epoch".into());
        }
        if self.start_from_inst_e.checked_add(self.term_len).is_none() {
            return Err(VeelaError::new(
                ErrorKind::Overflow,
                format!(
                    "term [{}, +{}) overflows epoch space",
                    self.start_from_inst_e, self.term_len
                ),
            ));
        }
        if self.acceptor_ids.is_empty() || self.acceptor_ids.len() > 255 {
            return invalid(format!(
                "election result has {} acceptors, expect 1..=255",
                self.acceptor_ids.len()
            ));
        }
        let mut seen = HashSet::new();
        for id in &self.acceptor_ids {
            if id.is_null() || !seen.insert(*id) {
                return invalid(format!(
                    "null or duplicate acceptor id {} in election result",
                    id
                ));
            }
        }
        if !self.acceptor_addr_hints.is_empty()
            && self.acceptor_addr_hints.len() != self.acceptor_ids.len()
        {
            return invalid(format!(
                "{} address hints for {} acceptors",
                self.acceptor_addr_hints.len(),
                self.acceptor_ids.len()
            ));
        }
        Ok(())
    }

    /// First instance epoch after this term. Panics on overflow, which
    /// `validate()` rules out.
    #[inline]
    pub fn end_inst_e(&self) -> Epoch {
        self.start_from_inst_e.add_assert(self.term_len)
    }

    /// Whether `inst` falls inside this term.
    #[inline]
    pub fn covers(&self, inst: Epoch) -> bool {
        inst >= self.start_from_inst_e && inst < self.end_inst_e()
    }

    /// Majority quorum size of the membership.
    #[inline]
    pub fn quorum_size(&self) -> u8 {
        (self.acceptor_ids.len() / 2 + 1) as u8
    }

    /// Position of an acceptor inside the membership list.
    pub fn member_pos(&self, acceptor_id: Epoch) -> Option<u8> {
        self.acceptor_ids
            .iter()
            .position(|id| *id == acceptor_id)
            .map(|p| p as u8)
    }

    /// Membership map built from the address hints, if any.
    pub fn addr_map(&self) -> AcceptorIdMapToNetworkAddr {
        self.acceptor_ids
            .iter()
            .copied()
            .zip(self.acceptor_addr_hints.iter().cloned())
            .collect()
    }

    /// Encodes into bytes suitable for embedding in an accept value.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VeelaError> {
        Ok(encode_to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VeelaError> {
        Ok(decode_from_slice(bytes)?)
    }
}

#[cfg(test)]
mod election_tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> NetworkAddr {
        NetworkAddr {
            protocol: "tcp".into(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    fn election(ids: &[u64]) -> ElectionResult {
        ElectionResult {
            term_len: 10,
            start_from_inst_e: Epoch::new(1),
            acceptor_ids: ids.iter().copied().map(Epoch::new).collect(),
            acceptor_addr_hints: ids.iter().map(|i| addr(50000 + *i as u16)).collect(),
        }
    }

    #[test]
    fn validate_shapes() {
        assert!(election(&[1, 2, 3]).validate().is_ok());
        assert!(election(&[]).validate().is_err());
        assert!(election(&[1, 1]).validate().is_err());
        assert!(election(&[0, 1]).validate().is_err());
        let mut e = election(&[1, 2, 3]);
        e.term_len = 0;
        assert!(e.validate().is_err());
        let mut e = election(&[1, 2, 3]);
        e.acceptor_addr_hints.pop();
        assert!(e.validate().is_err());
        e.acceptor_addr_hints.clear();
        assert!(e.validate().is_ok());
        let mut e = election(&[1]);
        e.start_from_inst_e = Epoch::new(u64::MAX);
        assert_eq!(e.validate().unwrap_err().kind(), ErrorKind::Overflow);
    }

    #[test]
    fn validate_term_len_cap() {
        let mut e = election(&[1, 2, 3]);
        e.term_len = MAX_TERM_LEN;
        assert!(e.validate().is_ok());
        e.term_len = MAX_TERM_LEN + 1;
        assert_eq!(e.validate().unwrap_err().kind(), ErrorKind::Other);
        e.term_len = 1 << 60;
        assert!(e.validate().is_err());
    }

    #[test]
    fn quorum_and_positions() {
        let e = election(&[4, 8, 15, 16, 23]);
        assert_eq!(e.quorum_size(), 3);
        assert_eq!(election(&[4, 8, 15, 16]).quorum_size(), 3);
        assert_eq!(e.member_pos(Epoch::new(15)), Some(2));
        assert_eq!(e.member_pos(Epoch::new(42)), None);
        assert!(e.covers(Epoch::new(10)));
        assert!(!e.covers(Epoch::new(11)));
        assert_eq!(e.addr_map().get(&Epoch::new(8)), Some(&addr(50008)));
    }

    #[test]
    fn bytes_round_trip() -> Result<(), VeelaError> {
        let e = election(&[1, 2, 3]);
        assert_eq!(ElectionResult::from_bytes(&e.to_bytes()?)?, e);
        Ok(())
    }
}
