//! Wire message contracts between proposers and acceptors. Carried over an
//! external transport; every message is `serde`-encodable.

use super::{AcceptValue, AcceptorIdMapToNetworkAddr, ElectionResult, Epoch};
use crate::utils::{ErrorKind, VeelaError};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

/// Phase 1 request: reserve the right to propose at `proposal_e`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseRequest {
    pub group_name: String,
    pub acceptor_id: Epoch,
    pub inst_e: Epoch,
    pub proposal_e: Epoch,
}

/// Phase 1 reply. Carries the acceptor's highest accepted entry whether or
/// not the promise was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseReply {
    pub accepted: bool,
    pub current_promised_epoch: Epoch,
    pub prior_accepted_value: Option<(Epoch, AcceptValue)>,
}

impl PromiseReply {
    /// Turns a rejection into an `ErrorKind::StalePromiseRequest` error.
    pub fn check(&self) -> Result<(), VeelaError> {
        if self.accepted {
            Ok(())
        } else {
            Err(VeelaError::new(
                ErrorKind::StalePromiseRequest,
                format!(
                    "promise rejected, already promised {}",
                    self.current_promised_epoch
                ),
            ))
        }
    }
}

/// Phase 2 request: vote for `value` at ballot `proposal_e`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub group_name: String,
    pub acceptor_id: Epoch,
    pub inst_e: Epoch,
    pub proposal_e: Epoch,
    pub value: AcceptValue,
}

/// Phase 2 reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptReply {
    pub accepted: bool,
    pub current_promised_epoch: Epoch,
}

impl AcceptReply {
    /// Turns a rejection into an `ErrorKind::StaleAcceptRequest` error.
    pub fn check(&self) -> Result<(), VeelaError> {
        if self.accepted {
            Ok(())
        } else {
            Err(VeelaError::new(
                ErrorKind::StaleAcceptRequest,
                format!(
                    "accept rejected, already promised {}",
                    self.current_promised_epoch
                ),
            ))
        }
    }
}

/// Term transition request: append a new term right after the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTermRequest {
    pub group_name: String,
    pub acceptor_id: Epoch,
    pub election_result: ElectionResult,
    pub membership: AcceptorIdMapToNetworkAddr,
}

/// Acceptor-side service reachable by proposers. `AcceptorProxy` serves the
/// acceptors registered in the local group; a network transport implements
/// the same trait for remote ones. Promise and Accept are idempotent under
/// retry with the same ballot.
#[async_trait]
pub trait AcceptorService: Send + Sync {
    async fn promise(
        &self,
        req: PromiseRequest,
    ) -> Result<PromiseReply, VeelaError>;

    async fn accept(&self, req: AcceptRequest) -> Result<AcceptReply, VeelaError>;

    async fn start_term(&self, req: StartTermRequest) -> Result<(), VeelaError>;
}
