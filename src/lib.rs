#![doc = include_str!("../README.md")]

mod cache;
mod codec;
mod config;
mod error;
mod reader;
mod shape;
mod slab;
mod tower;

#[cfg(feature = "write")]
mod coordinate;
#[cfg(feature = "write")]
mod merge;
#[cfg(feature = "write")]
mod pack;
#[cfg(feature = "write")]
mod store;
#[cfg(feature = "write")]
mod writer;

use std::path::Path;

/// Re-export of crate exposed in our API to simplify dependency management
pub use ndarray;
/// Re-export of crate exposed in our API to simplify dependency management
pub use serde_json;

pub use codec::Codec;
pub use config::{Config, Dim, DimConfig, DimLength, FORMAT_VERSION, Mode, StackDim, VarConfig};
pub use error::{SlabError, SlabResult};
pub use reader::{ArchiveInfo, InfoMode, SlabReader, SlabStats, VarReader};
pub use shape::{AxisKey, Origin, SliceSpec, TileSel};
pub use slab::Slab;
#[cfg(feature = "write")]
pub use store::VarWriter;
#[cfg(feature = "write")]
pub use writer::{
    DimSpec, MasterWriter, PeerWriter, VarSpec, WriteOptions, master_open, parallel_open,
};

/// Open the archive at `path` for reading.
pub fn open(path: impl AsRef<Path>) -> SlabResult<SlabReader> {
    SlabReader::open(path)
}
