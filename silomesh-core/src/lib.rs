//! Shared data model, error taxonomy, and external-interface traits for
//! the silomesh distributed virtual-actor runtime.

pub mod address;
pub mod directory;
pub mod error;
pub mod interfaces;
pub mod membership;
pub mod message;
pub mod ring;
pub mod txn;

pub use address::{ActivationAddress, ActivationId, GrainId, PrimaryKey, SiloAddress};
pub use directory::DirectoryEntry;
pub use error::{classify, is_retryable, ErrorClass, RuntimeError, RuntimeResult};
pub use membership::{MembershipEntry, MembershipTable, SiloStatus, Suspicion, TableVersion};
pub use message::{
    CallChainId, CorrelationId, Direction, Message, MessageBody, MessageHeader, RejectionKind,
    RequestContext,
};
pub use txn::{CommitRole, PriorityTimestamp, TransactionRecord, TxId};
