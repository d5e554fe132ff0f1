//! Paxos acceptor core.
//!
//! Every acceptor keeps the full voting history of the terms it was elected
//! for as a summary record appended to its own durable log; it recovers
//! from the latest record. References:
//!   - <https://lamport.azurewebsites.net/pubs/paxos-simple.pdf>
//!   - <https://www.microsoft.com/en-us/research/publication/vertical-paxos-and-primary-backup-replication/>

mod acceptor;
mod election;
mod epoch;
mod group;
mod learner;
mod messages;
mod proposer;
mod proxy;
mod summary;
mod value;

pub use acceptor::Acceptor;
pub use election::{
    AcceptorIdMapToNetworkAddr, ElectionResult, NetworkAddr, MAX_TERM_LEN,
};
pub use epoch::Epoch;
pub use group::{AcceptorHandle, GroupConfig, PaxosGroup};
pub use learner::Learner;
pub use messages::{
    AcceptReply, AcceptRequest, AcceptorService, PromiseReply, PromiseRequest,
    StartTermRequest,
};
pub use proposer::Proposer;
pub use proxy::AcceptorProxy;
pub use summary::{
    AcceptorInOnePaxosInstanceState, AcceptorStateSummary, AcceptorTermState,
};
pub use value::{AcceptValue, MemberIdx};
