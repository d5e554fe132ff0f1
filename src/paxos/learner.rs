//! Learner: tallies accepted votes and records chosen values.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock, Weak};

use super::{AcceptValue, ElectionResult, Epoch, PaxosGroup};
use crate::utils::{Bitmap, ErrorKind, Logger, VeelaError};

/// Votes gathered for one (instance, ballot) pair.
#[derive(Debug)]
struct VoteTally {
    voters: Bitmap,
    value: AcceptValue,
}

/// Chosen values at or above the pruning watermark.
#[derive(Debug, Default)]
struct ChosenValues {
    /// Instances below this are compacted away and no longer tracked.
    pruned_before: Epoch,

    /// Immutable once inserted.
    values: BTreeMap<Epoch, AcceptValue>,
}

impl ChosenValues {
    /// Whether no instance of `election` above the watermark is unchosen.
    fn term_settled(&self, election: &ElectionResult) -> bool {
        let from = election.start_from_inst_e.max(self.pruned_before);
        let end = election.end_inst_e();
        from >= end
            || self.values.range(from..end).count() as u64
                == end.to_u64() - from.to_u64()
    }
}

/// Learner of one group. Readers of chosen values only take a read lock;
/// no lock is ever held across an await. When both are needed, `votes` is
/// locked before `chosen`.
pub struct Learner {
    me: Logger,

    group: Weak<PaxosGroup>,

    /// Known terms keyed by their first instance.
    terms: RwLock<BTreeMap<Epoch, ElectionResult>>,

    /// Pending tallies keyed by (instance, ballot).
    votes: Mutex<HashMap<(Epoch, Epoch), VoteTally>>,

    chosen: RwLock<ChosenValues>,
}

impl Learner {
    pub(crate) fn new(me: Logger, group: Weak<PaxosGroup>) -> Self {
        Learner {
            me,
            group,
            terms: RwLock::new(BTreeMap::new()),
            votes: Mutex::new(HashMap::new()),
            chosen: RwLock::new(ChosenValues::default()),
        }
    }

    fn pruned_before(&self) -> Epoch {
        self.chosen.read().unwrap_or_else(|e| e.into_inner()).pruned_before
    }

    /// Fails if `inst` lies below the pruning watermark.
    fn check_not_pruned(&self, inst: Epoch) -> Result<(), VeelaError> {
        let pruned_before = self.pruned_before();
        if inst < pruned_before {
            return Err(VeelaError::new(
                ErrorKind::InstanceOutOfRange,
                format!("instance {} compacted (below {})", inst, pruned_before),
            ));
        }
        Ok(())
    }

    /// Makes a term known. Installing the same election again is a no-op;
    /// a different election overlapping a known term is refused.
    pub fn install_term(
        &self,
        election_result: ElectionResult,
    ) -> Result<(), VeelaError> {
        election_result.validate()?;
        let start = election_result.start_from_inst_e;
        let end = election_result.end_inst_e();
        if end <= self.pruned_before() {
            pf_debug!(self.me; "ignoring compacted term [{}, {})", start, end);
            return Ok(());
        }

        let mut terms = self.terms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(known) = terms.get(&start) {
            if *known == election_result {
                return Ok(());
            }
            return logged_err!(self.me, ErrorKind::CorruptState;
                               "conflicting elections for term starting at {}",
                               start);
        }
        let overlaps_prev = terms
            .range(..start)
            .next_back()
            .map_or(false, |(_, prev)| prev.end_inst_e() > start);
        let overlaps_next = terms
            .range(start..)
            .next()
            .map_or(false, |(next_start, _)| *next_start < end);
        if overlaps_prev || overlaps_next {
            return Err(VeelaError::new(
                ErrorKind::NonContiguousTerm,
                format!("term [{}, {}) overlaps a known term", start, end),
            ));
        }

        terms.insert(start, election_result);
        pf_debug!(self.me; "installed term [{}, {})", start, end);
        Ok(())
    }

    /// Election of the term covering `inst`, if known.
    pub fn term_of(&self, inst: Epoch) -> Option<ElectionResult> {
        let terms = self.terms.read().unwrap_or_else(|e| e.into_inner());
        terms
            .range(..=inst)
            .next_back()
            .filter(|(_, election)| election.covers(inst))
            .map(|(_, election)| election.clone())
    }

    /// Records that `acceptor_id` accepted `value` at `ballot` for `inst`.
    /// Returns the chosen value once a majority of the term's members
    /// accepted at the same ballot.
    pub async fn observe_accepted(
        &self,
        acceptor_id: Epoch,
        inst: Epoch,
        ballot: Epoch,
        value: AcceptValue,
    ) -> Result<Option<AcceptValue>, VeelaError> {
        if let Some(chosen) = self.chosen_value(inst) {
            return Ok(Some(chosen));
        }
        self.check_not_pruned(inst)?;
        let Some(election) = self.term_of(inst) else {
            return Err(VeelaError::new(
                ErrorKind::InstanceOutOfRange,
                format!("no known term covers instance {}", inst),
            ));
        };
        let Some(pos) = election.member_pos(acceptor_id) else {
            return logged_err!(self.me; "vote from non-member {} for inst {}",
                                        acceptor_id, inst);
        };

        let reached = {
            let mut votes = self.votes.lock().unwrap_or_else(|e| e.into_inner());
            // pruning may have run since the check above
            self.check_not_pruned(inst)?;
            let tally = votes.entry((inst, ballot)).or_insert_with(|| VoteTally {
                voters: Bitmap::new(election.acceptor_ids.len() as u8),
                value: value.clone(),
            });
            if tally.value != value {
                return logged_err!(self.me; "conflicting votes for inst {} at bal {}",
                                            inst, ballot);
            }
            tally.voters.set(pos, true)?;
            tally.voters.count() >= election.quorum_size()
        };

        if reached {
            self.commit(inst, value.clone()).await?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    /// Records `value` as chosen for `inst`. Once every instance of a term
    /// is chosen, the local acceptors of that term persist the fact.
    pub async fn commit(
        &self,
        inst: Epoch,
        value: AcceptValue,
    ) -> Result<(), VeelaError> {
        let Some(election) = self.term_of(inst) else {
            return Err(VeelaError::new(
                ErrorKind::InstanceOutOfRange,
                format!("no known term covers instance {}", inst),
            ));
        };

        let term_done = {
            let mut chosen = self.chosen.write().unwrap_or_else(|e| e.into_inner());
            if inst < chosen.pruned_before {
                return Err(VeelaError::new(
                    ErrorKind::InstanceOutOfRange,
                    format!("instance {} compacted (below {})",
                            inst, chosen.pruned_before),
                ));
            }
            if let Some(existing) = chosen.values.get(&inst) {
                if *existing == value {
                    return Ok(());
                }
                return logged_err!(self.me, ErrorKind::CorruptState;
                                   "two different values chosen for inst {}: {:?} vs. {:?}",
                                   inst, existing, value);
            }
            chosen.values.insert(inst, value);
            chosen.term_settled(&election)
        };
        self.votes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _), _| *i != inst);
        pf_debug!(self.me; "chosen value for inst {}", inst);

        if term_done {
            self.mark_term_all_chosen(&election).await;
        }
        Ok(())
    }

    /// Chosen value of `inst`, if already known.
    pub fn chosen_value(&self, inst: Epoch) -> Option<AcceptValue> {
        self.chosen
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values
            .get(&inst)
            .cloned()
    }

    /// Whether every instance of the term starting at `term_start` is chosen.
    /// Compacted instances count as chosen.
    pub fn is_term_all_chosen(&self, term_start: Epoch) -> bool {
        let Some(election) = self.term_of(term_start) else {
            return false;
        };
        if election.start_from_inst_e != term_start {
            return false;
        }
        self.chosen
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .term_settled(&election)
    }

    /// Forgets chosen values, pending tallies and whole terms below
    /// `delete_inst_before_e`. Later votes or commits for those instances
    /// fail with `InstanceOutOfRange`.
    pub fn prune_below(&self, delete_inst_before_e: Epoch) {
        {
            let mut votes = self.votes.lock().unwrap_or_else(|e| e.into_inner());
            let mut chosen = self.chosen.write().unwrap_or_else(|e| e.into_inner());
            if delete_inst_before_e <= chosen.pruned_before {
                return;
            }
            chosen.pruned_before = delete_inst_before_e;
            chosen.values = chosen.values.split_off(&delete_inst_before_e);
            votes.retain(|(inst, _), _| *inst >= delete_inst_before_e);
        }
        self.terms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, election| election.end_inst_e() > delete_inst_before_e);
        pf_debug!(self.me; "pruned learner state below inst {}",
                           delete_inst_before_e);
    }

    async fn mark_term_all_chosen(&self, election: &ElectionResult) {
        let Some(group) = self.group.upgrade() else {
            return;
        };
        pf_info!(self.me; "term [{}, {}) all chosen",
                          election.start_from_inst_e, election.end_inst_e());
        for id in &election.acceptor_ids {
            let Some(handle) = group.get_acceptor(*id) else {
                continue;
            };
            let mut acceptor = handle.lock().await;
            if let Err(e) = acceptor
                .mark_all_chosen(election.start_from_inst_e)
                .await
            {
                pf_warn!(self.me; "acceptor {} failed to mark term {}: {}",
                                  id, election.start_from_inst_e, e);
            }
        }
    }
}
