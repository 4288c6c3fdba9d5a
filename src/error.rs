use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by slab archive I/O.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SlabError {
    /// `begin`/`close` timed out before every expected writer appeared.
    #[error("writer cohort incomplete: found {actual} of {expected}")]
    CohortIncomplete {
        /// Writers observed before the timeout.
        actual: usize,
        /// Writers declared via `num_procs`.
        expected: usize,
    },
    /// The begin-token never appeared within the open timeout.
    #[error("no begin token at {0} within the open timeout")]
    NoBeginToken(PathBuf),
    /// The published config never appeared within the open timeout.
    #[error("no config published under {0} within the open timeout")]
    NoConfig(PathBuf),
    /// A writer never produced its finish marker within the close timeout.
    #[error("writer {0} never signalled finish within the close timeout")]
    FinishTimeout(String),
    /// Two writers produced a tile at the same path.
    #[error("tile collision at {0}")]
    TileCollision(PathBuf),
    /// Tile columns disagree on the number of stacked tiles.
    #[error("stack length mismatch: {0} != {1}")]
    StackLengthMismatch(u64, u64),
    /// A declared dimension length does not match the observed extent.
    #[error("dimension '{name}' declared length {declared}, observed {observed}")]
    DimCheckFailed {
        /// Dimension name.
        name: String,
        /// Length given at `define_dim` time.
        declared: u64,
        /// Extent reconciled from the written tiles.
        observed: u64,
    },
    /// Tile offsets along a dimension are not the cumulative tile extents.
    #[error("inconsistent tile offsets: expected {expected}, found {found}")]
    StartIndexError {
        /// Offset the cumulative extent demanded.
        expected: u64,
        /// Offset actually present on disk.
        found: u64,
    },
    /// A tile's shape differs from the variable's declared tile shape.
    #[error("tile shape {actual:?} does not match declared {expected:?}")]
    ShapeMismatch {
        /// Declared tile shape.
        expected: Vec<u64>,
        /// Shape of the offered tile.
        actual: Vec<u64>,
    },
    /// A tile already exists for this `(stack level, origin)`.
    #[error("duplicate tile at {0}")]
    DuplicateTile(PathBuf),
    /// The origin has more axes than the tile itself.
    #[error("origin {origin:?} exceeds tile rank {rank}")]
    InvalidOrigin {
        /// Offered origin.
        origin: Vec<u64>,
        /// Rank of the tile being written.
        rank: usize,
    },
    /// Open mode is not one of `r`/`w`.
    #[error("unknown open mode: {0:?}")]
    UnknownMode(String),
    /// Write mode requires `num_procs`.
    #[error("'num_procs' must be set to open in write mode")]
    MissingNumProcs,
    /// An index key cannot be applied to the variable.
    #[error("invalid slice: {0}")]
    InvalidSlice(String),
    /// Negative steps are only supported on the stack axis.
    #[error("negative step on an inner axis")]
    NegativeStep,
    /// Tiles stacked in one column carry different codec tags.
    #[error("mixed codecs in one stack column: {0} != {1}")]
    CodecMismatchInColumn(String, String),
    /// `stack`/`concat` operands carry different codec tags.
    #[error("codec mismatch: cannot combine {0} with {1}")]
    UnsupportedCodec(&'static str, &'static str),
    /// No registered codec accepts the value or encoded payload.
    #[error("unsupported payload: {0}")]
    UnsupportedType(String),
    /// The archive has no such variable.
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    /// The config has no such dimension.
    #[error("unknown dimension: {0}")]
    UnknownDimension(String),
    /// An archive member does not fit the slab tree layout.
    #[error("malformed archive entry: {0}")]
    InvalidEntry(String),
    /// Underlying filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Metadata (de)serialization failure.
    #[error("metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Convenience alias for all fallible slab operations.
pub type SlabResult<T> = Result<T, SlabError>;
