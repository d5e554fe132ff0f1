//! Paxos group: registry of the local acceptors plus the roles coordinating
//! them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use super::{
    Acceptor, AcceptorIdMapToNetworkAddr, AcceptorProxy, AcceptorStateSummary,
    ElectionResult, Epoch, Learner,
};
use crate::logdb::{LogDb, LogDbConfig};
use crate::utils::{ErrorKind, Logger, VeelaError};

use serde::Deserialize;

/// Shared handle to a registered acceptor. The tokio mutex linearizes every
/// operation on that acceptor without touching the group lock.
pub type AcceptorHandle = Arc<tokio::sync::Mutex<Acceptor>>;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupConfig {
    /// Whether to call `fsync()`/`fdatasync()` before acknowledging appends.
    pub logger_sync: bool,

    /// Simulated log latency base in nanosecs; 0 with a 0 per-byte factor
    /// disables the simulation.
    pub perf_delay_base_ns: u64,
    /// Simulated log latency per byte in nanosecs.
    pub perf_delay_per_byte_ns: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            logger_sync: true,
            perf_delay_base_ns: 0,
            perf_delay_per_byte_ns: 0,
        }
    }
}

impl GroupConfig {
    /// Log engine settings derived from this config.
    pub fn logdb_config(&self) -> LogDbConfig {
        let perf_a_b = if self.perf_delay_base_ns == 0
            && self.perf_delay_per_byte_ns == 0
        {
            None
        } else {
            Some((self.perf_delay_base_ns, self.perf_delay_per_byte_ns))
        };
        LogDbConfig {
            logger_sync: self.logger_sync,
            perf_a_b,
        }
    }
}

/// A named paxos group. Owns every local acceptor; acceptors, the proxy and
/// the learner point back at it through non-owning references.
pub struct PaxosGroup {
    group_name: String,

    me: Logger,

    config: GroupConfig,

    weak_self: Weak<PaxosGroup>,

    /// Registry of local acceptors. Guards membership only: never held
    /// across an await.
    acceptors: Mutex<HashMap<Epoch, AcceptorHandle>>,

    learner: Learner,

    acceptor_proxy: Arc<AcceptorProxy>,
}

impl PaxosGroup {
    /// Creates a new group, parsing `config_str` (TOML) over the defaults.
    pub fn new(
        me: Logger,
        group_name: impl Into<String>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, VeelaError> {
        let config = parsed_config!(config_str => GroupConfig;
                                    logger_sync, perf_delay_base_ns,
                                    perf_delay_per_byte_ns)?;
        let group_name = group_name.into();
        pf_info!(me; "group '{}' created with {:?}", group_name, config);

        Ok(Arc::new_cyclic(|weak_self| PaxosGroup {
            learner: Learner::new(me.child("learner"), weak_self.clone()),
            acceptor_proxy: Arc::new(AcceptorProxy::new(
                me.child("proxy"),
                weak_self.clone(),
            )),
            group_name,
            me,
            config,
            weak_self: weak_self.clone(),
            acceptors: Mutex::new(HashMap::new()),
        }))
    }

    #[inline]
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    #[inline]
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    #[inline]
    pub fn learner(&self) -> &Learner {
        &self.learner
    }

    /// Service serving every acceptor registered here.
    #[inline]
    pub fn acceptor_proxy(&self) -> Arc<AcceptorProxy> {
        self.acceptor_proxy.clone()
    }

    #[inline]
    pub(crate) fn logger(&self) -> &Logger {
        &self.me
    }

    /// Seeds a fresh acceptor log at `path`. The acceptor is not loaded.
    pub async fn init_acceptor_log_db<D: LogDb + 'static>(
        &self,
        path: &Path,
        start_from_inst_e: Epoch,
        election_result: ElectionResult,
        membership: AcceptorIdMapToNetworkAddr,
    ) -> Result<AcceptorStateSummary, VeelaError> {
        Acceptor::create::<D>(
            self.me.child("init"),
            path,
            start_from_inst_e,
            election_result,
            membership,
            &self.config.logdb_config(),
        )
        .await
    }

    /// Recovers acceptor `acceptor_id` from its log at `path` and registers
    /// it in this group.
    pub async fn load_acceptor_from_log_db<D: LogDb + 'static>(
        &self,
        path: &Path,
        acceptor_id: Epoch,
    ) -> Result<AcceptorHandle, VeelaError> {
        let acceptor = Acceptor::load::<D>(
            self.me.child(format!("a{}", acceptor_id)),
            self.weak_self.clone(),
            path,
            acceptor_id,
            &self.config.logdb_config(),
        )
        .await?;
        self.add_acceptor(acceptor).await
    }

    /// Registers a loaded acceptor. Fails with `DuplicateAcceptor` if its
    /// id is taken, in which case the given acceptor is closed and the
    /// existing registration is left intact.
    pub async fn add_acceptor(
        &self,
        acceptor: Acceptor,
    ) -> Result<AcceptorHandle, VeelaError> {
        let id = acceptor.id();
        if !acceptor.group_ref().ptr_eq(&self.weak_self) {
            return logged_err!(self.me; "acceptor {} belongs to another group", id);
        }
        let terms: Vec<ElectionResult> = acceptor
            .summary()
            .terms
            .iter()
            .map(|term| term.election_result.clone())
            .collect();
        let handle = Arc::new(tokio::sync::Mutex::new(acceptor));

        let duplicate = {
            let mut acceptors =
                self.acceptors.lock().unwrap_or_else(|e| e.into_inner());
            if acceptors.contains_key(&id) {
                true
            } else {
                acceptors.insert(id, handle.clone());
                false
            }
        };

        if duplicate {
            pf_warn!(self.me; "acceptor {} already registered", id);
            if let Err(e) = handle.lock().await.close().await {
                pf_warn!(self.me; "error closing duplicate acceptor {}: {}", id, e);
            }
            return Err(VeelaError::new(
                ErrorKind::DuplicateAcceptor,
                format!("acceptor {} already registered in group '{}'",
                        id, self.group_name),
            ));
        }

        for election in terms {
            if let Err(e) = self.learner.install_term(election) {
                pf_warn!(self.me; "learner refused a term of acceptor {}: {}",
                                  id, e);
            }
        }
        pf_info!(self.me; "registered acceptor {}", id);
        Ok(handle)
    }

    /// Handle of a registered acceptor.
    pub fn get_acceptor(&self, acceptor_id: Epoch) -> Option<AcceptorHandle> {
        self.acceptors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&acceptor_id)
            .cloned()
    }

    /// Ids of every registered acceptor, sorted.
    pub fn acceptor_ids(&self) -> Vec<Epoch> {
        let mut ids: Vec<Epoch> = self
            .acceptors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    fn handles(&self) -> Vec<AcceptorHandle> {
        self.acceptors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Raises the deletion watermark of every serving local acceptor to
    /// `delete_inst_before_e`, then lets the learner forget the instances
    /// below it. Closed or failed acceptors are skipped.
    pub async fn compact(
        &self,
        delete_inst_before_e: Epoch,
    ) -> Result<(), VeelaError> {
        for handle in self.handles() {
            let mut acceptor = handle.lock().await;
            if acceptor.is_closed() || acceptor.failure().is_some() {
                pf_debug!(self.me; "skip compacting acceptor {}", acceptor.id());
                continue;
            }
            acceptor.compact(delete_inst_before_e).await?;
        }
        self.learner.prune_below(delete_inst_before_e);
        pf_info!(self.me; "compacted below inst {}", delete_inst_before_e);
        Ok(())
    }

    /// Closes every registered acceptor that is still open. Registrations
    /// stay, so ids are never reused.
    pub async fn close_all(&self) -> Result<(), VeelaError> {
        for handle in self.handles() {
            let mut acceptor = handle.lock().await;
            if !acceptor.is_closed() {
                acceptor.close().await?;
            }
        }
        pf_info!(self.me; "closed all acceptors");
        Ok(())
    }
}

#[cfg(test)]
mod group_tests {
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

    async fn prepare_test_dir(
        name: &str,
    ) -> Result<std::path::PathBuf, VeelaError> {
        let path =
            std::path::PathBuf::from(format!("/tmp/veela-test-group-{}", name));
        if fs::try_exists(&path).await? {
            fs::remove_dir_all(&path).await?;
        }
        Ok(path)
    }

    #[test]
    fn parse_config() -> Result<(), VeelaError> {
        let group = PaxosGroup::new(
            Logger::new("g"),
            "g",
            Some("logger_sync = false\nperf_delay_base_ns = 1000"),
        )?;
        assert!(!group.config().logger_sync);
        assert_eq!(group.config().logdb_config().perf_a_b, Some((1000, 0)));
        assert_eq!(
            PaxosGroup::new(Logger::new("g"), "g", None)?
                .config()
                .logdb_config(),
            LogDbConfig::default()
        );
        assert_eq!(
            PaxosGroup::new(Logger::new("g"), "g", Some("sync = true"))
                .err()
                .map(|e| e.kind()),
            Some(ErrorKind::Config)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_acceptor() -> Result<(), VeelaError> {
        let group = PaxosGroup::new(Logger::new("g"), "g", None)?;
        let path_a = prepare_test_dir("dup-a").await?;
        let path_b = prepare_test_dir("dup-b").await?;
        for path in [&path_a, &path_b] {
            group
                .init_acceptor_log_db::<FileLogDb>(
                    path,
                    Epoch::new(1),
                    election(1, 3),
                    Default::default(),
                )
                .await?;
        }

        let first = group
            .load_acceptor_from_log_db::<FileLogDb>(&path_a, Epoch::new(1))
            .await?;
        let e = group
            .load_acceptor_from_log_db::<FileLogDb>(&path_b, Epoch::new(1))
            .await
            .err()
            .map(|e| e.kind());
        assert_eq!(e, Some(ErrorKind::DuplicateAcceptor));

        assert_eq!(group.acceptor_ids(), vec![Epoch::new(1)]);
        let registered = group.get_acceptor(Epoch::new(1)).unwrap();
        assert!(Arc::ptr_eq(&first, &registered));
        assert!(!registered.lock().await.is_closed());
        assert!(group.learner().term_of(Epoch::new(2)).is_some());

        // the rejected acceptor's log was released and can be loaded again
        group
            .load_acceptor_from_log_db::<FileLogDb>(&path_b, Epoch::new(2))
            .await?;
        assert_eq!(group.acceptor_ids(), vec![Epoch::new(1), Epoch::new(2)]);
        group.close_all().await?;
        assert!(registered.lock().await.is_closed());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn foreign_or_missing_acceptor() -> Result<(), VeelaError> {
        let group = PaxosGroup::new(Logger::new("g"), "g", None)?;
        let other = PaxosGroup::new(Logger::new("o"), "o", None)?;
        let path = prepare_test_dir("foreign").await?;
        let e = group
            .load_acceptor_from_log_db::<FileLogDb>(&path, Epoch::new(1))
            .await
            .err()
            .map(|e| e.kind());
        assert_eq!(e, Some(ErrorKind::NotFound));

        group
            .init_acceptor_log_db::<FileLogDb>(
                &path,
                Epoch::new(1),
                election(1, 3),
                Default::default(),
            )
            .await?;
        let acceptor = Acceptor::load::<FileLogDb>(
            Logger::new("a"),
            Arc::downgrade(&other),
            &path,
            Epoch::new(1),
            &LogDbConfig::default(),
        )
        .await?;
        assert!(group.add_acceptor(acceptor).await.is_err());
        assert!(group.acceptor_ids().is_empty());
        Ok(())
    }
}
