//! Acceptor -- creation of a fresh log and recovery from an existing one.

use super::*;

// Acceptor lifecycle: initial log seeding and recovery
impl Acceptor {
    /// Seeds a brand-new log at `path` with a summary holding one fresh
    /// term. Returns the summary durably written as record idx 1.
    pub async fn create<D: LogDb + 'static>(
        me: Logger,
        path: &Path,
        start_from_inst_e: Epoch,
        election_result: ElectionResult,
        membership: AcceptorIdMapToNetworkAddr,
        config: &LogDbConfig,
    ) -> Result<AcceptorStateSummary, VeelaError> {
        election_result.validate()?;
        if election_result.start_from_inst_e != start_from_inst_e {
            return logged_err!(me; "election result starts at {} but log is seeded at {}",
                                   election_result.start_from_inst_e, start_from_inst_e);
        }

        let summary = AcceptorStateSummary {
            delete_inst_before_epoch: Epoch::NULL,
            terms: vec![AcceptorTermState::fresh(
                start_from_inst_e,
                election_result,
                membership,
                1,
            )],
        };
        summary.check()?;
        let summary_bytes = summary.to_bytes()?;

        let mut db = D::create(me.child("logdb"), path, config).await?;
        let res = match db.current_idx_range() {
            (1, 1) => db.append_and_sync(1, vec![Bytes::from(summary_bytes)]).await,
            (left, next) => logged_err!(me, ErrorKind::CorruptState;
                                        "fresh log has range [{}, {})", left, next),
        };
        if let Err(e) = res {
            if let Err(ce) = db.close().await {
                pf_warn!(me; "error closing log after failed seeding: {}", ce);
            }
            return Err(e);
        }
        db.close().await?;

        pf_info!(me; "seeded acceptor log '{}' with term [{}, {})",
                     path.display(), start_from_inst_e,
                     summary.next_term_start());
        Ok(summary)
    }

    /// Opens the log at `path` and recovers the acceptor from its latest
    /// summary record. The log handle is released on any failure.
    pub async fn load<D: LogDb + 'static>(
        me: Logger,
        group: Weak<PaxosGroup>,
        path: &Path,
        acceptor_id: Epoch,
        config: &LogDbConfig,
    ) -> Result<Self, VeelaError> {
        let mut db = D::open_if_exists(me.child("logdb"), path, config).await?;

        match Self::recover_summary(&me, &db).await {
            Ok(state_summary) => {
                pf_info!(me; "recovered acceptor {} from '{}': {} terms up to {}",
                             acceptor_id, path.display(),
                             state_summary.terms.len(),
                             state_summary.next_term_start());
                Ok(Acceptor {
                    id: acceptor_id,
                    me,
                    group,
                    db: Some(Box::new(db)),
                    state_summary,
                    failure: None,
                })
            }
            Err(e) => {
                if let Err(ce) = db.close().await {
                    pf_warn!(me; "error closing log after failed recovery: {}", ce);
                }
                Err(e)
            }
        }
    }

    /// Reads, decodes and validates the summary at the highest set idx.
    async fn recover_summary(
        me: &Logger,
        db: &dyn LogDb,
    ) -> Result<AcceptorStateSummary, VeelaError> {
        let (left, next) = db.current_idx_range();
        if left == next {
            return Err(VeelaError::new(
                ErrorKind::EmptyLog,
                "no valid idx in the log",
            ));
        }

        let summary_bytes = db.get_value_by_idx(next - 1).await?;
        let summary = match AcceptorStateSummary::from_bytes(&summary_bytes) {
            Ok(summary) => summary,
            Err(e) => {
                return logged_err!(me, ErrorKind::CorruptState;
                                   "undecodable summary at idx {}: {}", next - 1, e)
            }
        };
        if let Err(e) = summary.check() {
            pf_error!(me; "invalid summary at idx {}: {}", next - 1, e);
            return Err(e);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;
    use crate::logdb::FileLogDb;
    use tokio::fs;

    async fn prepare_test_dir(
        name: &str,
    ) -> Result<std::path::PathBuf, VeelaError> {
        let path =
            std::path::PathBuf::from(format!("/tmp/veela-test-acceptor-{}", name));
        if fs::try_exists(&path).await? {
            fs::remove_dir_all(&path).await?;
        }
        Ok(path)
    }

    fn election(start: u64, len: u64) -> ElectionResult {
        ElectionResult {
            term_len: len,
            start_from_inst_e: Epoch::new(start),
            acceptor_ids: vec![Epoch::new(1), Epoch::new(2), Epoch::new(3)],
            acceptor_addr_hints: vec![],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_then_load() -> Result<(), VeelaError> {
        let path = prepare_test_dir("create-load").await?;
        let config = LogDbConfig::default();
        let created = Acceptor::create::<FileLogDb>(
            Logger::new("t"),
            &path,
            Epoch::new(1),
            election(1, 3),
            Default::default(),
            &config,
        )
        .await?;
        let acceptor = Acceptor::load::<FileLogDb>(
            Logger::new("t"),
            Weak::new(),
            &path,
            Epoch::new(1),
            &config,
        )
        .await?;
        assert_eq!(acceptor.summary(), &created);
        assert_eq!(acceptor.summary().terms[0].per_instance_states.len(), 3);
        assert_eq!(acceptor.summary().terms[0].log_index_of_self, 1);
        assert!(!acceptor.summary().terms[0].all_chosen_flag);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_twice_fails() -> Result<(), VeelaError> {
        let path = prepare_test_dir("create-twice").await?;
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
        let e = Acceptor::create::<FileLogDb>(
            Logger::new("t"),
            &path,
            Epoch::new(1),
            election(1, 3),
            Default::default(),
            &config,
        )
        .await
        .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_with_bad_election() -> Result<(), VeelaError> {
        let path = prepare_test_dir("bad-election").await?;
        let config = LogDbConfig::default();
        assert!(Acceptor::create::<FileLogDb>(
            Logger::new("t"),
            &path,
            Epoch::new(2),
            election(1, 3),
            Default::default(),
            &config,
        )
        .await
        .is_err());
        // nothing was created
        assert!(!fs::try_exists(&path).await?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn load_missing_or_empty() -> Result<(), VeelaError> {
        let path = prepare_test_dir("missing").await?;
        let config = LogDbConfig::default();
        let e = Acceptor::load::<FileLogDb>(
            Logger::new("t"),
            Weak::new(),
            &path,
            Epoch::new(1),
            &config,
        )
        .await
        .err()
        .map(|e| e.kind());
        assert_eq!(e, Some(ErrorKind::NotFound));

        let mut db =
            FileLogDb::create(Logger::new("t"), &path, &config).await?;
        db.close().await?;
        let e = Acceptor::load::<FileLogDb>(
            Logger::new("t"),
            Weak::new(),
            &path,
            Epoch::new(1),
            &config,
        )
        .await
        .err()
        .map(|e| e.kind());
        assert_eq!(e, Some(ErrorKind::EmptyLog));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn load_corrupt_summary() -> Result<(), VeelaError> {
        let path = prepare_test_dir("corrupt").await?;
        let config = LogDbConfig::default();
        let mut db =
            FileLogDb::create(Logger::new("t"), &path, &config).await?;
        db.append_and_sync(1, vec![Bytes::from_static(b"garbage")])
            .await?;
        db.close().await?;
        let e = Acceptor::load::<FileLogDb>(
            Logger::new("t"),
            Weak::new(),
            &path,
            Epoch::new(1),
            &config,
        )
        .await
        .err()
        .map(|e| e.kind());
        assert_eq!(e, Some(ErrorKind::CorruptState));

        // a decodable summary that breaks term contiguity
        let mut bad = AcceptorStateSummary {
            delete_inst_before_epoch: Epoch::NULL,
            terms: vec![
                AcceptorTermState::fresh(
                    Epoch::new(1),
                    election(1, 3),
                    Default::default(),
                    1,
                ),
                AcceptorTermState::fresh(
                    Epoch::new(5),
                    election(5, 3),
                    Default::default(),
                    2,
                ),
            ],
        };
        let mut db =
            FileLogDb::open_if_exists(Logger::new("t"), &path, &config).await?;
        db.append_and_sync(2, vec![Bytes::from(bad.to_bytes()?)])
            .await?;
        db.close().await?;
        let e = Acceptor::load::<FileLogDb>(
            Logger::new("t"),
            Weak::new(),
            &path,
            Epoch::new(1),
            &config,
        )
        .await
        .err()
        .map(|e| e.kind());
        assert_eq!(e, Some(ErrorKind::CorruptState));

        // the log handle was released, so the log can be reopened and fixed
        bad.terms.pop();
        let mut db =
            FileLogDb::open_if_exists(Logger::new("t"), &path, &config).await?;
        db.append_and_sync(3, vec![Bytes::from(bad.to_bytes()?)])
            .await?;
        db.close().await?;
        let acceptor = Acceptor::load::<FileLogDb>(
            Logger::new("t"),
            Weak::new(),
            &path,
            Epoch::new(1),
            &config,
        )
        .await?;
        assert_eq!(acceptor.summary(), &bad);
        Ok(())
    }
}
