use std::{
    error::Error as StdError,
    fmt::{self, Display},
};

/// The top-level result type for fallible operations. Conflicts and
/// visibility failures are ordinary status returns that the caller is
/// expected to retry under a fresh snapshot; the engine never retries
/// on the caller's behalf. Violations of internal invariants are not
/// represented here, they abort the process.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating the ways an operation on a [`Store`](crate::Store)
/// can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An insert hit a key that already has a visible, not-deleted
    /// version.
    AlreadyExists,
    /// An update or remove targeted a key with no visible record, or a
    /// read found nothing for the key.
    NotFound,
    /// The operation was blocked by a version that is not visible to
    /// the caller's snapshot, such as a write from an uncommitted or
    /// future transaction.
    NotInSnapshot,
    /// A concurrent writer won the race to extend the version chain.
    Conflict,
    /// The page arena is exhausted.
    OutOfMemory,
    /// The payload is incompatible with the table schema.
    SchemaMismatch,
    /// The addressed table was never created.
    TableDoesNotExist,
    /// The key is one of the sentinel values reserved by the hash
    /// table ([`EMPTY_KEY`](crate::EMPTY_KEY) or [`TOMBSTONE_KEY`](crate::TOMBSTONE_KEY)).
    ReservedKey,
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            AlreadyExists => write!(f, "key already exists"),
            NotFound => write!(f, "no visible record for key"),
            NotInSnapshot => write!(f, "blocked by a version outside the snapshot"),
            Conflict => write!(f, "lost a race against a concurrent writer"),
            OutOfMemory => write!(f, "page arena exhausted"),
            SchemaMismatch => write!(f, "payload incompatible with table schema"),
            TableDoesNotExist => write!(f, "table does not exist"),
            ReservedKey => write!(f, "key is reserved by the hash table"),
        }
    }
}
