//! Proposer: drives the two voting phases against a term's acceptors.

use std::sync::{Arc, Weak};

use super::{
    AcceptRequest, AcceptValue, AcceptorIdMapToNetworkAddr, AcceptorService,
    ElectionResult, Epoch, PaxosGroup, PromiseRequest, StartTermRequest,
};
use crate::utils::{ErrorKind, Logger, VeelaError};

use futures::future::join_all;

/// Number of low ballot bits holding the proposer id.
const BALLOT_ID_BITS: u32 = 16;

/// A proposer. Ballots are `round << 16 | id`, so ballots of distinct
/// proposers never collide. Timeouts and retry policy are left to the
/// caller: a rejected round returns a stale error and the next call uses a
/// higher ballot.
pub struct Proposer {
    id: u16,

    me: Logger,

    group: Weak<PaxosGroup>,

    group_name: String,

    /// Path to the acceptors, local or remote.
    service: Arc<dyn AcceptorService>,

    /// Round of the last ballot used.
    round: u64,
}

impl Proposer {
    /// Creates a proposer reaching acceptors through the group's own proxy.
    pub fn new(group: &Arc<PaxosGroup>, id: u16) -> Result<Self, VeelaError> {
        let service: Arc<dyn AcceptorService> = group.acceptor_proxy();
        Self::with_service(group, id, service)
    }

    /// Creates a proposer reaching acceptors through `service`.
    pub fn with_service(
        group: &Arc<PaxosGroup>,
        id: u16,
        service: Arc<dyn AcceptorService>,
    ) -> Result<Self, VeelaError> {
        if id == 0 {
            return Err(VeelaError::new(
                ErrorKind::Other,
                "proposer id must be non-zero",
            ));
        }
        Ok(Proposer {
            id,
            me: group.logger().child(format!("p{}", id)),
            group: Arc::downgrade(group),
            group_name: group.group_name().to_string(),
            service,
            round: 0,
        })
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Takes a fresh ballot higher than any this proposer used or saw.
    pub fn next_ballot(&mut self) -> Epoch {
        assert!(
            self.round < (u64::MAX >> BALLOT_ID_BITS),
            "proposer ballot rounds exhausted"
        );
        self.round += 1;
        Epoch::new((self.round << BALLOT_ID_BITS) | self.id as u64)
    }

    /// Moves past the round of a ballot promised to someone else.
    pub fn observe_promised(&mut self, promised: Epoch) {
        let round = promised.to_u64() >> BALLOT_ID_BITS;
        if round > self.round {
            self.round = round;
        }
    }

    fn group(&self) -> Result<Arc<PaxosGroup>, VeelaError> {
        self.group
            .upgrade()
            .ok_or_else(|| VeelaError::new(ErrorKind::Closed, "group is gone"))
    }

    /// Asks every member of `election_result` to start its term. Succeeds
    /// once a majority did.
    pub async fn install_election(
        &self,
        election_result: ElectionResult,
        membership: AcceptorIdMapToNetworkAddr,
    ) -> Result<(), VeelaError> {
        election_result.validate()?;
        let group = self.group()?;

        let replies = join_all(election_result.acceptor_ids.iter().map(|id| {
            self.service.start_term(StartTermRequest {
                group_name: self.group_name.clone(),
                acceptor_id: *id,
                election_result: election_result.clone(),
                membership: membership.clone(),
            })
        }))
        .await;

        let mut granted = 0;
        let mut last_err = None;
        for (id, reply) in election_result.acceptor_ids.iter().zip(replies) {
            match reply {
                Ok(()) => granted += 1,
                Err(e) => {
                    pf_debug!(self.me; "start_term on acceptor {} failed: {}", id, e);
                    last_err = Some(e);
                }
            }
        }

        if granted >= election_result.quorum_size() {
            group.learner().install_term(election_result.clone())?;
            pf_info!(self.me; "installed term [{}, {}) on {} acceptors",
                              election_result.start_from_inst_e,
                              election_result.end_inst_e(), granted);
            Ok(())
        } else {
            Err(last_err.unwrap_or_else(|| {
                VeelaError::new(ErrorKind::Other, "no quorum for new term")
            }))
        }
    }

    /// Runs one round of both phases for `inst`. Returns the chosen value,
    /// which is a previously accepted value rather than `value` whenever
    /// phase 1 discovers one.
    pub async fn propose(
        &mut self,
        inst: Epoch,
        value: AcceptValue,
    ) -> Result<AcceptValue, VeelaError> {
        let group = self.group()?;
        if let Some(chosen) = group.learner().chosen_value(inst) {
            return Ok(chosen);
        }
        let Some(election) = group.learner().term_of(inst) else {
            return Err(VeelaError::new(
                ErrorKind::InstanceOutOfRange,
                format!("no known term covers instance {}", inst),
            ));
        };
        let quorum = election.quorum_size();
        let ballot = self.next_ballot();
        pf_debug!(self.me; "proposing inst {} with bal {}", inst, ballot);

        // phase 1
        let replies = join_all(election.acceptor_ids.iter().map(|id| {
            self.service.promise(PromiseRequest {
                group_name: self.group_name.clone(),
                acceptor_id: *id,
                inst_e: inst,
                proposal_e: ballot,
            })
        }))
        .await;

        let mut granted = 0;
        let mut stale = false;
        let mut last_err = None;
        let mut prior: Option<(Epoch, AcceptValue)> = None;
        for reply in replies {
            match reply {
                Ok(reply)
                    if reply.accepted
                        || reply.current_promised_epoch == ballot =>
                {
                    granted += 1;
                    if let Some((bal, val)) = reply.prior_accepted_value {
                        if prior.as_ref().map_or(true, |(pb, _)| bal > *pb) {
                            prior = Some((bal, val));
                        }
                    }
                }
                Ok(reply) => {
                    stale = true;
                    self.observe_promised(reply.current_promised_epoch);
                }
                Err(e) => last_err = Some(e),
            }
        }
        if granted < quorum {
            pf_debug!(self.me; "no promise quorum for inst {} bal {}", inst, ballot);
            return Err(if stale {
                VeelaError::new(
                    ErrorKind::StalePromiseRequest,
                    format!("ballot {} outdated for inst {}", ballot, inst),
                )
            } else {
                last_err.unwrap_or_else(|| {
                    VeelaError::new(ErrorKind::Other, "no quorum of promises")
                })
            });
        }

        // phase 2, adopting the highest prior value
        let value = match prior {
            Some((bal, val)) => {
                pf_debug!(self.me; "adopting value accepted at bal {} for inst {}",
                                   bal, inst);
                val
            }
            None => value,
        };
        let replies = join_all(election.acceptor_ids.iter().map(|id| {
            self.service.accept(AcceptRequest {
                group_name: self.group_name.clone(),
                acceptor_id: *id,
                inst_e: inst,
                proposal_e: ballot,
                value: value.clone(),
            })
        }))
        .await;

        let mut accepted = 0;
        let mut stale = false;
        let mut last_err = None;
        for reply in replies {
            match reply {
                Ok(reply) if reply.accepted => accepted += 1,
                Ok(reply) => {
                    stale = true;
                    self.observe_promised(reply.current_promised_epoch);
                }
                Err(e) => last_err = Some(e),
            }
        }
        if accepted < quorum {
            pf_debug!(self.me; "no accept quorum for inst {} bal {}", inst, ballot);
            return Err(if stale {
                VeelaError::new(
                    ErrorKind::StaleAcceptRequest,
                    format!("ballot {} outdated for inst {}", ballot, inst),
                )
            } else {
                last_err.unwrap_or_else(|| {
                    VeelaError::new(ErrorKind::Other, "no quorum of accepts")
                })
            });
        }

        group.learner().commit(inst, value.clone()).await?;
        pf_debug!(self.me; "inst {} chosen at bal {}", inst, ballot);
        Ok(value)
    }
}
