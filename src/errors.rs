use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("unknown block: {0}")]
    UnknownBlock(String),
    #[error("there are no blocks to pop")]
    PopEmptyChain,
    #[error("block validation failed: {0}")]
    BlockValidate(String),
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("transaction is not unique: {0}")]
    DuplicateTransaction(String),
    #[error("transaction declares authority it has no signatures for: {0}")]
    MissingSigs(String),
    #[error("transaction bears irrelevant signatures: {0}")]
    IrrelevantSig(String),
    #[error("action declares irrelevant authority: {0}")]
    IrrelevantAuth(String),
    #[error("account not found: {0}")]
    UnknownAccount(String),
    #[error("block does not match checkpoint: {0}")]
    CheckpointMismatch(String),
    #[error("branches have no common ancestor: {0}")]
    NoCommonAncestor(String),
    #[error("block log corrupted: {0}")]
    CorruptLog(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;
