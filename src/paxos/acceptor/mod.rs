//! Acceptor: one durable paxos voting state machine backed by a log.

mod durability;
mod recovery;
mod voting;

use std::path::Path;
use std::sync::{Arc, Weak};

use super::{
    AcceptReply, AcceptValue, AcceptorIdMapToNetworkAddr,
    AcceptorStateSummary, AcceptorTermState, ElectionResult, Epoch,
    PaxosGroup, PromiseReply,
};
use crate::logdb::{LogDb, LogDbConfig};
use crate::utils::{ErrorKind, Logger, VeelaError};

use bytes::Bytes;

/// Acceptor holding the durable voting ledger of every instance of every
/// term it has been elected for. The in-memory summary always mirrors the
/// latest summary record durably appended to its log.
pub struct Acceptor {
    /// Acceptor ID, unique inside the group.
    id: Epoch,

    /// My logging identity.
    me: Logger,

    /// Non-owning back-reference to the group this acceptor serves.
    group: Weak<PaxosGroup>,

    /// Owned log handle; `None` once closed.
    db: Option<Box<dyn LogDb>>,

    /// Latest durable state.
    state_summary: AcceptorStateSummary,

    /// Set once a durability failure or state violation is detected; the
    /// acceptor then refuses every request until recovered from its log.
    failure: Option<VeelaError>,
}

impl Acceptor {
    #[inline]
    pub fn id(&self) -> Epoch {
        self.id
    }

    #[inline]
    pub fn summary(&self) -> &AcceptorStateSummary {
        &self.state_summary
    }

    /// Group this acceptor serves, if still alive.
    pub fn group(&self) -> Option<Arc<PaxosGroup>> {
        self.group.upgrade()
    }

    #[inline]
    pub(crate) fn group_ref(&self) -> &Weak<PaxosGroup> {
        &self.group
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.db.is_none()
    }

    /// The error that stopped this acceptor from serving, if any.
    #[inline]
    pub fn failure(&self) -> Option<&VeelaError> {
        self.failure.as_ref()
    }

    /// Releases the log handle. Later operations fail with
    /// `ErrorKind::Closed`.
    pub async fn close(&mut self) -> Result<(), VeelaError> {
        match self.db.take() {
            Some(mut db) => {
                db.close().await?;
                pf_info!(self.me; "acceptor closed");
                Ok(())
            }
            None => Err(VeelaError::new(
                ErrorKind::Closed,
                format!("acceptor {} already closed", self.id),
            )),
        }
    }

    /// Marks the acceptor failed with `e` and hands `e` back for returning.
    fn poison(&mut self, e: VeelaError) -> VeelaError {
        pf_error!(self.me; "acceptor {} stops serving: {}", self.id, e);
        self.failure = Some(e.clone());
        e
    }

    /// Fails unless the acceptor may serve requests.
    fn check_serving(&self) -> Result<(), VeelaError> {
        if self.db.is_none() {
            return Err(VeelaError::new(
                ErrorKind::Closed,
                format!("acceptor {} is closed", self.id),
            ));
        }
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        Ok(())
    }
}
