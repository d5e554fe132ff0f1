//! Acceptor proxy: serves proposer requests for locally registered
//! acceptors.

use std::sync::{Arc, Weak};

use super::{
    AcceptReply, AcceptRequest, AcceptorHandle, AcceptorService, PaxosGroup,
    PromiseReply, PromiseRequest, StartTermRequest,
};
use crate::utils::{ErrorKind, Logger, VeelaError};

use async_trait::async_trait;

/// Dispatches wire requests to the acceptors of its group.
pub struct AcceptorProxy {
    me: Logger,
    group: Weak<PaxosGroup>,
}

impl AcceptorProxy {
    pub(crate) fn new(me: Logger, group: Weak<PaxosGroup>) -> Self {
        AcceptorProxy { me, group }
    }

    /// Resolves the target acceptor. The group lock is released before the
    /// returned handle is used.
    fn lookup(
        &self,
        group_name: &str,
        acceptor_id: super::Epoch,
    ) -> Result<(Arc<PaxosGroup>, AcceptorHandle), VeelaError> {
        let Some(group) = self.group.upgrade() else {
            return Err(VeelaError::new(ErrorKind::Closed, "group is gone"));
        };
        if group.group_name() != group_name {
            return Err(VeelaError::new(
                ErrorKind::NotFound,
                format!("request for group '{}' sent to '{}'",
                        group_name, group.group_name()),
            ));
        }
        match group.get_acceptor(acceptor_id) {
            Some(handle) => Ok((group, handle)),
            None => Err(VeelaError::new(
                ErrorKind::NotFound,
                format!("acceptor {} not registered", acceptor_id),
            )),
        }
    }
}

#[async_trait]
impl AcceptorService for AcceptorProxy {
    async fn promise(
        &self,
        req: PromiseRequest,
    ) -> Result<PromiseReply, VeelaError> {
        let (_, handle) = self.lookup(&req.group_name, req.acceptor_id)?;
        let mut acceptor = handle.lock().await;
        acceptor.promise(req.inst_e, req.proposal_e).await
    }

    async fn accept(&self, req: AcceptRequest) -> Result<AcceptReply, VeelaError> {
        let (group, handle) = self.lookup(&req.group_name, req.acceptor_id)?;
        let reply = {
            let mut acceptor = handle.lock().await;
            acceptor
                .accept(req.inst_e, req.proposal_e, req.value.clone())
                .await?
        };

        // the acceptor lock is released: the learner may need it
        if reply.accepted {
            if let Err(e) = group
                .learner()
                .observe_accepted(req.acceptor_id, req.inst_e, req.proposal_e, req.value)
                .await
            {
                pf_warn!(self.me; "learner rejected vote of acceptor {}: {}",
                                  req.acceptor_id, e);
            }
        }
        Ok(reply)
    }

    async fn start_term(&self, req: StartTermRequest) -> Result<(), VeelaError> {
        let (group, handle) = self.lookup(&req.group_name, req.acceptor_id)?;
        {
            let mut acceptor = handle.lock().await;
            acceptor
                .start_term(req.election_result.clone(), req.membership)
                .await?;
        }
        if let Err(e) = group.learner().install_term(req.election_result) {
            pf_warn!(self.me; "learner refused term of acceptor {}: {}",
                              req.acceptor_id, e);
        }
        Ok(())
    }
}
