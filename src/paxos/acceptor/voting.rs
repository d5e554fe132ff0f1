//! Acceptor -- Promise/Accept voting and term management.

use super::*;

// Acceptor request handling
impl Acceptor {
    /// Handler of a Promise (phase 1) request. A rejection is a normal
    /// reply with `accepted == false`; `Err` is reserved for requests the
    /// acceptor cannot serve at all.
    pub async fn promise(
        &mut self,
        inst_e: Epoch,
        proposal_e: Epoch,
    ) -> Result<PromiseReply, VeelaError> {
        self.check_serving()?;
        let inst = self.state_summary.instance(inst_e)?;
        let prior = inst.highest_accepted();

        if proposal_e <= inst.promised_epoch {
            pf_debug!(self.me; "stale Promise for inst {} bal {} (promised {})",
                               inst_e, proposal_e, inst.promised_epoch);
            return Ok(PromiseReply {
                accepted: false,
                current_promised_epoch: inst.promised_epoch,
                prior_accepted_value: prior,
            });
        }

        let mut new_summary = self.state_summary.clone();
        new_summary.instance_mut(inst_e)?.promised_epoch = proposal_e;
        self.persist_summary(new_summary, 0).await?;

        pf_trace!(self.me; "promised inst {} bal {}", inst_e, proposal_e);
        Ok(PromiseReply {
            accepted: true,
            current_promised_epoch: proposal_e,
            prior_accepted_value: prior,
        })
    }

    /// Handler of an Accept (phase 2) request. A rejected Accept leaves both
    /// the in-memory and the persisted state untouched.
    pub async fn accept(
        &mut self,
        inst_e: Epoch,
        proposal_e: Epoch,
        value: AcceptValue,
    ) -> Result<AcceptReply, VeelaError> {
        self.check_serving()?;
        let inst = self.state_summary.instance(inst_e)?;

        if proposal_e.is_null() || proposal_e < inst.promised_epoch {
            pf_debug!(self.me; "stale Accept for inst {} bal {} (promised {})",
                               inst_e, proposal_e, inst.promised_epoch);
            return Ok(AcceptReply {
                accepted: false,
                current_promised_epoch: inst.promised_epoch,
            });
        }

        match inst.accepted_values.get(&proposal_e) {
            // retry of a vote already made
            Some(v) if *v == value => {
                return Ok(AcceptReply {
                    accepted: true,
                    current_promised_epoch: inst.promised_epoch,
                });
            }
            Some(_) => {
                return logged_err!(self.me; "conflicting values for inst {} at bal {}",
                                            inst_e, proposal_e);
            }
            None => {}
        }

        let idx = self.next_log_idx()?;
        let mut new_summary = self.state_summary.clone();
        let inst = new_summary.instance_mut(inst_e)?;
        inst.promised_epoch = proposal_e;
        inst.accepted_values.insert(proposal_e, value);
        inst.last_accepted_value_id = proposal_e;
        inst.log_index_by_value_epoch.insert(proposal_e, idx);
        self.persist_summary(new_summary, 0).await?;

        pf_trace!(self.me; "accepted inst {} bal {} at idx {}",
                           inst_e, proposal_e, idx);
        Ok(AcceptReply {
            accepted: true,
            current_promised_epoch: proposal_e,
        })
    }

    /// Appends a new term right after the last one. Re-sending the election
    /// of an already-installed term succeeds without effect.
    pub async fn start_term(
        &mut self,
        election_result: ElectionResult,
        membership: AcceptorIdMapToNetworkAddr,
    ) -> Result<(), VeelaError> {
        self.check_serving()?;
        election_result.validate()?;

        let start = election_result.start_from_inst_e;
        let expected = self.state_summary.next_term_start();
        if start != expected {
            if self.state_summary.terms.iter().any(|term| {
                term.start_from_inst_e == start
                    && term.election_result == election_result
            }) {
                return Ok(());
            }
            return Err(self.poison(VeelaError::new(
                ErrorKind::NonContiguousTerm,
                format!("term starts at {} but next term must start at {}",
                        start, expected),
            )));
        }

        let idx = self.next_log_idx()?;
        let mut new_summary = self.state_summary.clone();
        new_summary.terms.push(AcceptorTermState::fresh(
            start,
            election_result,
            membership,
            idx,
        ));
        if let Err(e) = new_summary.check() {
            return Err(self.poison(e));
        }
        self.persist_summary(new_summary, 0).await?;

        pf_info!(self.me; "started term [{}, {}) at idx {}",
                          start, self.state_summary.next_term_start(), idx);
        Ok(())
    }

    /// Persists the all-chosen flag of the term starting at `term_start`.
    pub async fn mark_all_chosen(
        &mut self,
        term_start: Epoch,
    ) -> Result<(), VeelaError> {
        self.check_serving()?;
        let Some(ti) = self
            .state_summary
            .terms
            .iter()
            .position(|term| term.start_from_inst_e == term_start)
        else {
            return Err(VeelaError::new(
                ErrorKind::InstanceOutOfRange,
                format!("no live term starts at {}", term_start),
            ));
        };
        if self.state_summary.terms[ti].all_chosen_flag {
            return Ok(());
        }

        let mut new_summary = self.state_summary.clone();
        new_summary.terms[ti].all_chosen_flag = true;
        self.persist_summary(new_summary, 0).await?;

        pf_debug!(self.me; "term starting at {} all chosen", term_start);
        Ok(())
    }

    /// Raises the deletion watermark to `delete_inst_before_e`. Leading
    /// all-chosen terms lying entirely below it are dropped (the last term
    /// is always kept) and every log record older than the new summary
    /// becomes reclaimable.
    pub async fn compact(
        &mut self,
        delete_inst_before_e: Epoch,
    ) -> Result<(), VeelaError> {
        self.check_serving()?;
        if delete_inst_before_e <= self.state_summary.delete_inst_before_epoch {
            return Ok(());
        }
        if delete_inst_before_e > self.state_summary.next_term_start() {
            return Err(VeelaError::new(
                ErrorKind::InstanceOutOfRange,
                format!(
                    "watermark {} beyond last term end {}",
                    delete_inst_before_e,
                    self.state_summary.next_term_start()
                ),
            ));
        }

        let mut new_summary = self.state_summary.clone();
        new_summary.delete_inst_before_epoch = delete_inst_before_e;
        let dropped = new_summary
            .terms
            .iter()
            .take(new_summary.terms.len() - 1)
            .take_while(|term| {
                term.all_chosen_flag && term.end_inst_e() <= delete_inst_before_e
            })
            .count();
        new_summary.terms.drain(..dropped);

        let idx = self.next_log_idx()?;
        self.persist_summary(new_summary, idx).await?;

        pf_info!(self.me; "compacted below inst {}, dropped {} terms",
                          delete_inst_before_e, dropped);
        Ok(())
    }
}

#[cfg(test)]
mod voting_tests {
    use super::*;
    use crate::logdb::FileLogDb;
    use tokio::fs;

    fn election(start: u64, len: u64) -> ElectionResult {
        ElectionResult {
            term_len: len,
            start_from_inst_e: Epoch::new(start),
            acceptor_ids: vec![Epoch::new(1), Epoch::new(2), Epoch::new(3)],
            acceptor_addr_hints: vec![],
        }
    }

    fn value(id: u64, cmd: &[u8]) -> AcceptValue {
        AcceptValue::compose(Epoch::new(id), None, &[cmd]).unwrap()
    }

    async fn setup_acceptor(name: &str) -> Result<Acceptor, VeelaError> {
        let path = std::path::PathBuf::from(format!(
            "/tmp/veela-test-voting-{}",
            name
        ));
        if fs::try_exists(&path).await? {
            fs::remove_dir_all(&path).await?;
        }
        let config = LogDbConfig::default();
        Acceptor::create::<FileLogDb>(
            Logger::new("t"),
            &path,
            Epoch::new(1),
            election(1, 3),
            Default::default(),
            &config,
        )
        .await?;
        Acceptor::load::<FileLogDb>(
            Logger::new(name),
            Weak::new(),
            &path,
            Epoch::new(1),
            &config,
        )
        .await
    }

    async fn reload(
        mut acceptor: Acceptor,
        name: &str,
    ) -> Result<Acceptor, VeelaError> {
        acceptor.close().await?;
        let path = std::path::PathBuf::from(format!(
            "/tmp/veela-test-voting-{}",
            name
        ));
        Acceptor::load::<FileLogDb>(
            Logger::new(name),
            Weak::new(),
            &path,
            Epoch::new(1),
            &LogDbConfig::default(),
        )
        .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn promise_accept_reload() -> Result<(), VeelaError> {
        let mut acceptor = setup_acceptor("scenario").await?;
        let v = value(7, b"put x 1");

        let reply = acceptor.promise(Epoch::new(1), Epoch::new(5)).await?;
        reply.check()?;
        assert_eq!(reply.prior_accepted_value, None);

        acceptor
            .accept(Epoch::new(1), Epoch::new(5), v.clone())
            .await?
            .check()?;

        let reply = acceptor.promise(Epoch::new(1), Epoch::new(3)).await?;
        assert_eq!(
            reply.check().unwrap_err().kind(),
            ErrorKind::StalePromiseRequest
        );
        assert_eq!(reply.current_promised_epoch, Epoch::new(5));

        let acceptor = reload(acceptor, "scenario").await?;
        let inst = acceptor.summary().instance(Epoch::new(1))?;
        assert_eq!(inst.last_accepted_value_id, Epoch::new(5));
        assert_eq!(inst.accepted_values.get(&Epoch::new(5)), Some(&v));
        // create wrote idx 1, promise idx 2, accept idx 3
        assert_eq!(inst.log_index_by_value_epoch.get(&Epoch::new(5)), Some(&3));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn promise_returns_prior_value() -> Result<(), VeelaError> {
        let mut acceptor = setup_acceptor("prior").await?;
        let v = value(7, b"a");
        acceptor
            .accept(Epoch::new(2), Epoch::new(4), v.clone())
            .await?
            .check()?;

        let reply = acceptor.promise(Epoch::new(2), Epoch::new(9)).await?;
        reply.check()?;
        assert_eq!(reply.prior_accepted_value, Some((Epoch::new(4), v.clone())));

        // a rejected promise still carries the recovery payload
        let reply = acceptor.promise(Epoch::new(2), Epoch::new(9)).await?;
        assert!(!reply.accepted);
        assert_eq!(reply.current_promised_epoch, Epoch::new(9));
        assert_eq!(reply.prior_accepted_value, Some((Epoch::new(4), v)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_accept_untouched() -> Result<(), VeelaError> {
        let mut acceptor = setup_acceptor("stale-accept").await?;
        acceptor.promise(Epoch::new(3), Epoch::new(8)).await?.check()?;
        let before = acceptor.summary().clone();
        let range = acceptor.db.as_ref().map(|db| db.current_idx_range());

        let reply = acceptor
            .accept(Epoch::new(3), Epoch::new(6), value(1, b"late"))
            .await?;
        assert_eq!(
            reply.check().unwrap_err().kind(),
            ErrorKind::StaleAcceptRequest
        );
        assert_eq!(reply.current_promised_epoch, Epoch::new(8));
        let reply = acceptor
            .accept(Epoch::new(3), Epoch::NULL, value(1, b"null"))
            .await?;
        assert!(!reply.accepted);

        assert_eq!(acceptor.summary(), &before);
        assert_eq!(
            acceptor.db.as_ref().map(|db| db.current_idx_range()),
            range
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accept_retry_idempotent() -> Result<(), VeelaError> {
        let mut acceptor = setup_acceptor("accept-retry").await?;
        let v = value(3, b"a");
        acceptor
            .accept(Epoch::new(1), Epoch::new(5), v.clone())
            .await?
            .check()?;
        let range = acceptor.db.as_ref().map(|db| db.current_idx_range());
        acceptor
            .accept(Epoch::new(1), Epoch::new(5), v)
            .await?
            .check()?;
        assert_eq!(
            acceptor.db.as_ref().map(|db| db.current_idx_range()),
            range
        );
        assert!(acceptor
            .accept(Epoch::new(1), Epoch::new(5), value(4, b"b"))
            .await
            .is_err());

        // higher ballot overrides, keeping older entries
        acceptor
            .accept(Epoch::new(1), Epoch::new(6), value(4, b"b"))
            .await?
            .check()?;
        let inst = acceptor.summary().instance(Epoch::new(1))?;
        assert_eq!(inst.accepted_values.len(), 2);
        assert_eq!(inst.last_accepted_value_id, Epoch::new(6));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn out_of_range_instances() -> Result<(), VeelaError> {
        let mut acceptor = setup_acceptor("out-of-range").await?;
        for inst in [0, 4, 100] {
            let e = acceptor
                .promise(Epoch::new(inst), Epoch::new(1))
                .await
                .unwrap_err();
            assert_eq!(e.kind(), ErrorKind::InstanceOutOfRange);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn term_transition() -> Result<(), VeelaError> {
        let mut acceptor = setup_acceptor("term").await?;
        acceptor.start_term(election(4, 2), Default::default()).await?;
        assert_eq!(acceptor.summary().terms.len(), 2);
        assert_eq!(acceptor.summary().terms[1].log_index_of_self, 2);
        acceptor.start_term(election(4, 2), Default::default()).await?;
        assert_eq!(acceptor.summary().terms.len(), 2);
        assert!(acceptor.failure().is_none());

        acceptor
            .accept(Epoch::new(5), Epoch::new(1), value(1, b"x"))
            .await?
            .check()?;
        let acceptor = reload(acceptor, "term").await?;
        assert_eq!(acceptor.summary().next_term_start(), Epoch::new(6));
        assert_eq!(
            acceptor
                .summary()
                .instance(Epoch::new(5))?
                .last_accepted_value_id,
            Epoch::new(1)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_contiguous_term_is_fatal() -> Result<(), VeelaError> {
        let mut acceptor = setup_acceptor("term-gap").await?;
        let before = acceptor.summary().clone();
        let e = acceptor
            .start_term(election(5, 2), Default::default())
            .await
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NonContiguousTerm);
        assert!(e.is_fatal());
        assert_eq!(acceptor.failure(), Some(&e));
        assert_eq!(acceptor.summary(), &before);

        // every later call answers with the same error
        let later = acceptor
            .promise(Epoch::new(1), Epoch::new(5))
            .await
            .unwrap_err();
        assert_eq!(later, e);
        let later = acceptor
            .start_term(election(4, 2), Default::default())
            .await
            .unwrap_err();
        assert_eq!(later.kind(), ErrorKind::NonContiguousTerm);

        // nothing reached the log, so a reload serves again
        let mut acceptor = reload(acceptor, "term-gap").await?;
        assert!(acceptor.failure().is_none());
        acceptor.promise(Epoch::new(1), Epoch::new(5)).await?.check()?;

        // an overlapping term poisons as well
        let e = acceptor
            .start_term(election(3, 2), Default::default())
            .await
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NonContiguousTerm);
        assert!(acceptor.failure().is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_term_refused() -> Result<(), VeelaError> {
        let mut acceptor = setup_acceptor("term-huge").await?;
        let e = acceptor
            .start_term(election(4, 1 << 60), Default::default())
            .await
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Other);
        assert_eq!(acceptor.summary().terms.len(), 1);
        assert!(acceptor.failure().is_none());
        acceptor.start_term(election(4, 2), Default::default()).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn compact_chosen_terms() -> Result<(), VeelaError> {
        let mut acceptor = setup_acceptor("compact").await?;
        acceptor.start_term(election(4, 2), Default::default()).await?;
        acceptor.start_term(election(6, 2), Default::default()).await?;

        // unchosen terms stay even below the watermark
        acceptor.compact(Epoch::new(4)).await?;
        assert_eq!(acceptor.summary().terms.len(), 3);
        assert_eq!(
            acceptor
                .promise(Epoch::new(2), Epoch::new(1))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::InstanceOutOfRange
        );

        acceptor.mark_all_chosen(Epoch::new(1)).await?;
        acceptor.mark_all_chosen(Epoch::new(4)).await?;
        acceptor.mark_all_chosen(Epoch::new(6)).await?;
        acceptor.compact(Epoch::new(8)).await?;
        // last term is always kept
        assert_eq!(acceptor.summary().terms.len(), 1);
        assert_eq!(acceptor.summary().terms[0].start_from_inst_e, Epoch::new(6));
        assert!(acceptor.compact(Epoch::new(9)).await.is_err());

        let range = acceptor.db.as_ref().map(|db| db.current_idx_range());
        let acceptor = reload(acceptor, "compact").await?;
        assert_eq!(acceptor.summary().delete_inst_before_epoch, Epoch::new(8));
        assert_eq!(acceptor.summary().terms.len(), 1);
        let (left, next) = range.unwrap();
        assert_eq!(left + 1, next);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_acceptor() -> Result<(), VeelaError> {
        let mut acceptor = setup_acceptor("closed").await?;
        acceptor.close().await?;
        assert!(acceptor.is_closed());
        assert_eq!(
            acceptor
                .promise(Epoch::new(1), Epoch::new(1))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::Closed
        );
        assert_eq!(
            acceptor
                .accept(Epoch::new(1), Epoch::new(1), value(1, b"x"))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::Closed
        );
        assert_eq!(acceptor.close().await.unwrap_err().kind(), ErrorKind::Closed);
        Ok(())
    }
}
