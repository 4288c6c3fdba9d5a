use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{SlabError, SlabResult};

/// Version of the archive metadata layout.
pub const FORMAT_VERSION: u32 = 1;

/// Archive member and work-directory name of the config descriptor.
pub(crate) const CONFIG_FILE: &str = "__config__";

/// Open mode of a slab archive. Appears in the begin-token so peers can
/// verify what the master is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read an existing archive.
    Read,
    /// Write a new archive.
    Write,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Read => "r",
            Mode::Write => "w",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = SlabError;

    fn from_str(s: &str) -> SlabResult<Mode> {
        match s {
            "r" => Ok(Mode::Read),
            "w" => Ok(Mode::Write),
            other => Err(SlabError::UnknownMode(other.to_string())),
        }
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Mode, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Declared length of a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimLength {
    /// Concrete extent that must match what the writers produce.
    Fixed(u64),
    /// Extent finalized on close from the observed tiles.
    Unlimited,
}

impl Serialize for DimLength {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DimLength::Fixed(n) => serializer.serialize_u64(*n),
            DimLength::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for DimLength {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<DimLength, D::Error> {
        struct LengthVisitor;

        impl Visitor<'_> for LengthVisitor {
            type Value = DimLength;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a nonnegative integer or the string \"unlimited\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<DimLength, E> {
                Ok(DimLength::Fixed(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<DimLength, E> {
                u64::try_from(v)
                    .map(DimLength::Fixed)
                    .map_err(|_| E::custom("negative dimension length"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<DimLength, E> {
                if v == "unlimited" {
                    Ok(DimLength::Unlimited)
                } else {
                    Err(E::custom(format!("unknown dimension length {v:?}")))
                }
            }
        }

        deserializer.deserialize_any(LengthVisitor)
    }
}

/// Declared properties of one dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimConfig {
    /// Dimension name, the key under `Config::dims`.
    pub name: String,
    /// Declared or reconciled length; `None` means undeclared.
    pub length: Option<DimLength>,
    /// Coordinate origin as `(value, unit label)`.
    pub origin: (Value, String),
    /// Coordinate unit as `(scale, label)`; the scale is `None` when
    /// explicit points are given.
    pub unit: (Option<f64>, String),
    /// Explicit coordinate points, one per index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Value>>,
    /// Free-form description.
    pub desc: String,
    /// User attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
}

/// Declared properties of one variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarConfig {
    /// Shape every tile of this variable must have. `None` disables the
    /// per-write check (legacy unchecked variables).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_shape: Option<Vec<u64>>,
    /// Dimension names of the assembled array, stack dimension first.
    pub dims: Vec<String>,
    /// Advance the stack level automatically after each defaulted write.
    pub stack_auto: bool,
    /// User attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
    /// Assembled shape, stack extent first. Populated only by finalize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<u64>>,
}

/// The archive metadata descriptor: the single `__config__` member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Metadata layout version.
    pub version: u32,
    /// Declared dimensions by name.
    pub dims: BTreeMap<String, DimConfig>,
    /// Declared variables by name.
    pub vars: BTreeMap<String, VarConfig>,
    /// Archive-level user attributes.
    pub attrs: BTreeMap<String, Value>,
    /// Write-time coordination state; stripped before packing.
    #[serde(
        default,
        rename = "_control_",
        skip_serializing_if = "Option::is_none"
    )]
    pub(crate) control: Option<Control>,
}

impl Config {
    pub(crate) fn empty() -> Self {
        Config {
            version: FORMAT_VERSION,
            dims: BTreeMap::new(),
            vars: BTreeMap::new(),
            attrs: BTreeMap::new(),
            control: None,
        }
    }
}

/// Coordination fields that exist only while a write is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Control {
    pub num_procs: usize,
    pub begin_path: PathBuf,
    pub slab_path: PathBuf,
}

/// The begin-token payload advertising the work directory to peers.
#[cfg(feature = "write")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BeginToken {
    pub work_path: PathBuf,
    pub slab_path: PathBuf,
    pub mode: Mode,
}

/// One recorded tile write: origin and runtime shape.
#[cfg(feature = "write")]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WriteEntry {
    pub origin: Vec<u64>,
    pub shape: Vec<u64>,
}

/// Per-writer tile log, keyed `stack level -> origin path -> entry`.
#[cfg(feature = "write")]
pub(crate) type WriteLog = BTreeMap<String, BTreeMap<String, WriteEntry>>;

/// The per-process `__varcfg__` payload: declared shape plus the transient
/// write log. Never part of the finalized config.
#[cfg(feature = "write")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct VarLog {
    pub tile_shape: Option<Vec<u64>>,
    pub dims: Vec<String>,
    pub writes: WriteLog,
}

/// Handle to a declared dimension, used to bind variables to dimensions and
/// to check reconciled extents.
#[derive(Debug, Clone)]
pub struct Dim {
    pub(crate) name: String,
    pub(crate) length: Option<DimLength>,
}

impl Dim {
    /// The dimension name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `extent` satisfies the declared length.
    #[must_use]
    pub fn check(&self, extent: u64) -> bool {
        match self.length {
            None | Some(DimLength::Unlimited) => true,
            Some(DimLength::Fixed(n)) => n == extent,
        }
    }
}

/// Handle to the stack dimension of a variable.
#[derive(Debug, Clone)]
pub struct StackDim(pub(crate) Dim);

impl StackDim {
    /// The dimension name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.name()
    }
}
