use thiserror::Error;

/// Malformed or unreadable class-file input, and output that cannot be encoded.
#[derive(Debug, Error)]
pub enum ClassError {
    #[error("binary layout error: {0}")]
    Binary(#[from] binrw::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("constant pool index {index} is out of range (pool holds {size} entries)")]
    PoolIndex { index: u16, size: usize },
    #[error("constant pool entry {index} is not a {expected}")]
    PoolTag { index: u16, expected: &'static str },
    #[error("constant pool is full")]
    PoolOverflow,
    #[error("malformed {attribute} attribute")]
    Attribute { attribute: &'static str },
    #[error("invalid descriptor `{0}`")]
    Descriptor(String),
    #[error("invalid modified UTF-8 at byte {0}")]
    ModifiedUtf8(usize),
    #[error("branch offset {offset} does not fit the instruction at {address}")]
    BranchOverflow { address: u32, offset: i64 },
    #[error("label {0} is referenced but never placed")]
    UnboundLabel(usize),
    #[error("no instruction starts at code offset {0}")]
    BadCodeOffset(u32),
    #[error("{0}")]
    Malformed(String),
}

/// Failures of the dataflow framework. Callers of the delegation analysis treat
/// every variant as "boundary unknown".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalyzerError {
    #[error("operand stack underflow at instruction {0}")]
    StackUnderflow(usize),
    #[error("operand stack heights differ when merging into instruction {index} ({left} vs {right})")]
    StackMismatch {
        index: usize,
        left: usize,
        right: usize,
    },
    #[error("local variable {slot} outside of max_locals at instruction {index}")]
    LocalOutOfRange { index: usize, slot: usize },
    #[error("subroutines (jsr/ret) are not supported")]
    Subroutine,
    #[error("no fixpoint after {0} iterations")]
    NonConvergence(usize),
    #[error("execution falls off the end of the code")]
    FallOff,
    #[error("unresolvable constant pool reference {0}")]
    Reference(u16),
    #[error("receiver consumed before the delegation call at instruction {0}")]
    ReceiverConsumed(usize),
    #[error("branch at instruction {0} uses a byte offset instead of a label")]
    UnlabeledBranch(usize),
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error(transparent)]
    Class(#[from] ClassError),
    #[error("{name} cannot be instrumented: {reason}")]
    UnsupportedUnit { name: String, reason: &'static str },
}
