//! Durable record layout of an acceptor's voting history.

use std::collections::BTreeMap;

use super::election::MAX_TERM_LEN;
use super::{AcceptValue, AcceptorIdMapToNetworkAddr, ElectionResult, Epoch};
use crate::utils::{ErrorKind, VeelaError};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

/// Voting state of one acceptor in one paxos instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptorInOnePaxosInstanceState {
    /// Highest ballot promised (`p_e`); never decreases.
    pub promised_epoch: Epoch,

    /// Ballot of the last accepted value (`a_v_id`); null if none.
    pub last_accepted_value_id: Epoch,

    /// Accepted values keyed by the ballot they were accepted at.
    pub accepted_values: BTreeMap<Epoch, AcceptValue>,

    /// Log idx of the summary record that first persisted each accepted
    /// value.
    pub log_index_by_value_epoch: BTreeMap<Epoch, u64>,
}

impl AcceptorInOnePaxosInstanceState {
    /// Highest-ballot accepted entry, used to let a new proposer recover
    /// prior progress.
    pub fn highest_accepted(&self) -> Option<(Epoch, AcceptValue)> {
        if self.last_accepted_value_id.is_null() {
            return None;
        }
        self.accepted_values
            .get(&self.last_accepted_value_id)
            .map(|v| (self.last_accepted_value_id, v.clone()))
    }

    fn check(&self) -> Result<(), String> {
        for e in self.log_index_by_value_epoch.keys() {
            if !self.accepted_values.contains_key(e) {
                return Err(format!("log index recorded for unknown value {}", e));
            }
        }
        if self.last_accepted_value_id.is_null() {
            if !self.accepted_values.is_empty() {
                return Err("accepted values present but a_v_id is null".into());
            }
        } else {
            match self.accepted_values.keys().next_back() {
                Some(max) if *max == self.last_accepted_value_id => {}
                _ => {
                    return Err(format!(
                        "a_v_id {} is not the max accepted ballot",
                        self.last_accepted_value_id
                    ))
                }
            }
        }
        if self.promised_epoch < self.last_accepted_value_id {
            return Err(format!(
                "p_e {} below a_v_id {}",
                self.promised_epoch, self.last_accepted_value_id
            ));
        }
        Ok(())
    }
}

/// One elected term's complete voting ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptorTermState {
    pub start_from_inst_e: Epoch,
    pub election_result: ElectionResult,
    pub acceptor_id_map_to_network_addr: AcceptorIdMapToNetworkAddr,
    pub all_chosen_flag: bool,
    /// Exactly `election_result.term_len` entries.
    pub per_instance_states: Vec<AcceptorInOnePaxosInstanceState>,
    /// Log idx of the summary record that introduced this term.
    pub log_index_of_self: u64,
}

impl AcceptorTermState {
    /// Fresh term with all instance states zeroed.
    pub fn fresh(
        start_from_inst_e: Epoch,
        election_result: ElectionResult,
        acceptor_id_map_to_network_addr: AcceptorIdMapToNetworkAddr,
        log_index_of_self: u64,
    ) -> Self {
        let per_instance_states =
            vec![Default::default(); election_result.term_len as usize];
        AcceptorTermState {
            start_from_inst_e,
            election_result,
            acceptor_id_map_to_network_addr,
            all_chosen_flag: false,
            per_instance_states,
            log_index_of_self,
        }
    }

    /// First instance epoch after this term.
    #[inline]
    pub fn end_inst_e(&self) -> Epoch {
        self.start_from_inst_e
            .add_assert(self.election_result.term_len)
    }
}

/// An acceptor's entire recoverable history, persisted as the latest record
/// of its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptorStateSummary {
    pub delete_inst_before_epoch: Epoch,
    pub terms: Vec<AcceptorTermState>,
}

impl AcceptorStateSummary {
    /// Re-verifies every structural invariant; failures are reported as
    /// `ErrorKind::CorruptState`.
    pub fn check(&self) -> Result<(), VeelaError> {
        let corrupt = |msg: String| Err(VeelaError::new(ErrorKind::CorruptState, msg));

        if self.terms.is_empty() {
            return corrupt("summary holds no term".into());
        }
        let mut next_start = Epoch::NULL;
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                if term.start_from_inst_e != next_start {
                    return corrupt(format!(
                        "term {} starts at {} but {} expected",
                        i, term.start_from_inst_e, next_start
                    ));
                }
            } else if term.start_from_inst_e.is_null() {
                return corrupt("first term starts at null epoch".into());
            }
            if term.election_result.start_from_inst_e != term.start_from_inst_e
            {
                return corrupt(format!(
                    "term {} starts at {} but its election says {}",
                    i,
                    term.start_from_inst_e,
                    term.election_result.start_from_inst_e
                ));
            }
            let term_len = term.election_result.term_len;
            if term_len == 0 {
                return corrupt(format!("term {} has zero length", i));
            }
            if term_len > MAX_TERM_LEN {
                return corrupt(format!(
                    "term {} length {} exceeds {}",
                    i, term_len, MAX_TERM_LEN
                ));
            }
            next_start = match term.start_from_inst_e.checked_add(term_len) {
                Some(e) => e,
                None => {
                    return corrupt(format!("term {} overflows epoch space", i))
                }
            };
            if term.per_instance_states.len() as u64 != term_len {
                return corrupt(format!(
                    "term {} holds {} instance states but length is {}",
                    i,
                    term.per_instance_states.len(),
                    term_len
                ));
            }
            for (j, state) in term.per_instance_states.iter().enumerate() {
                if let Err(msg) = state.check() {
                    return corrupt(format!("term {} instance {}: {}", i, j, msg));
                }
            }
        }
        Ok(())
    }

    /// First instance epoch not covered by any term.
    pub fn next_term_start(&self) -> Epoch {
        match self.terms.last() {
            Some(term) => term.end_inst_e(),
            None => Epoch::NULL,
        }
    }

    /// Locates the (term, slot) holding instance `inst`.
    pub fn locate(&self, inst: Epoch) -> Result<(usize, usize), VeelaError> {
        if inst < self.delete_inst_before_epoch {
            return Err(VeelaError::new(
                ErrorKind::InstanceOutOfRange,
                format!(
                    "instance {} below deletion watermark {}",
                    inst, self.delete_inst_before_epoch
                ),
            ));
        }
        // terms are contiguous and sorted
        let ti = self
            .terms
            .partition_point(|term| term.start_from_inst_e <= inst);
        if ti > 0 {
            let term = &self.terms[ti - 1];
            if inst < term.end_inst_e() {
                let slot = inst.to_u64() - term.start_from_inst_e.to_u64();
                return Ok((ti - 1, slot as usize));
            }
        }
        Err(VeelaError::new(
            ErrorKind::InstanceOutOfRange,
            format!("instance {} not covered by any term", inst),
        ))
    }

    /// Voting state of instance `inst`.
    pub fn instance(
        &self,
        inst: Epoch,
    ) -> Result<&AcceptorInOnePaxosInstanceState, VeelaError> {
        let (ti, si) = self.locate(inst)?;
        Ok(&self.terms[ti].per_instance_states[si])
    }

    pub fn instance_mut(
        &mut self,
        inst: Epoch,
    ) -> Result<&mut AcceptorInOnePaxosInstanceState, VeelaError> {
        let (ti, si) = self.locate(inst)?;
        Ok(&mut self.terms[ti].per_instance_states[si])
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, VeelaError> {
        Ok(encode_to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VeelaError> {
        Ok(decode_from_slice(bytes)?)
    }
}
