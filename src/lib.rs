//! Veela: durable Paxos acceptors with term-based membership.
//!
//! Each acceptor persists its whole voting ledger as the latest record of
//! an append-only log. A `PaxosGroup` owns the local acceptors and pairs
//! them with a proposer-facing `AcceptorProxy` and a `Learner`.

#[macro_use]
mod utils;

mod logdb;
mod paxos;

pub use utils::{logger_init, Bitmap, ErrorKind, Logger, VeelaError};

pub use logdb::{FileLogDb, LogDb, LogDbConfig};

pub use paxos::{
    AcceptReply, AcceptRequest, AcceptValue, Acceptor, AcceptorHandle,
    AcceptorIdMapToNetworkAddr, AcceptorInOnePaxosInstanceState,
    AcceptorProxy, AcceptorService, AcceptorStateSummary, AcceptorTermState,
    ElectionResult, Epoch, GroupConfig, Learner, MemberIdx, NetworkAddr,
    PaxosGroup, PromiseReply, PromiseRequest, Proposer, StartTermRequest,
    MAX_TERM_LEN,
};
