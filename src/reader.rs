use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use bytes::Bytes;
use log::debug;
use tar::EntryType;

use crate::cache::TileCache;
use crate::codec::Codec;
use crate::config::{CONFIG_FILE, Config, DimLength};
use crate::shape::{AxisKey, InnerSel, TileSel, resolve_inner, resolve_stack};
use crate::tower::{LeafEntry, Tower, TowerNode};
use crate::{Slab, SlabError, SlabResult};

/// Introspection request for [`SlabReader::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoMode {
    /// Version, dimension lengths, variable shapes and archive size.
    Summary,
    /// Variable names.
    List,
    /// Shape, rank and stack length of one variable.
    Var(String),
    /// Per-variable tile counts and byte sizes.
    Slabs,
}

/// Introspection result of [`SlabReader::info`].
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveInfo {
    /// Archive-level summary.
    Summary {
        /// Metadata layout version.
        version: u32,
        /// Dimension names with their finalized lengths.
        dims: Vec<(String, Option<DimLength>)>,
        /// Variable names with their assembled shapes.
        vars: Vec<(String, Option<Vec<u64>>)>,
        /// Archive size in bytes.
        size: u64,
    },
    /// Variable names, in tower order.
    List(Vec<String>),
    /// Shape of one variable.
    Var {
        /// Variable name.
        name: String,
        /// Assembled shape, stack extent first.
        shape: Vec<u64>,
        /// Number of axes.
        ndim: usize,
        /// Stack extent.
        len: u64,
    },
    /// Tile statistics per variable.
    Slabs(BTreeMap<String, SlabStats>),
}

/// Tile statistics of one variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabStats {
    /// Number of stored tiles.
    pub count: u64,
    /// Total encoded bytes.
    pub total_size: u64,
    /// Largest tile in bytes.
    pub max_size: u64,
    /// Smallest tile in bytes.
    pub min_size: u64,
}

/// Read handle over a packed slab archive.
///
/// Opening indexes every member into the per-variable towers; tile payloads
/// are read lazily as byte ranges of the archive file and decoded through a
/// bounded LRU cache. Read errors for one variable leave the handle usable
/// for others.
pub struct SlabReader {
    file: Mutex<File>,
    archive_len: u64,
    config: Config,
    tower: Tower,
    cache: Mutex<TileCache>,
}

impl SlabReader {
    /// Open and index the archive at `path`.
    pub fn open(path: impl AsRef<Path>) -> SlabResult<SlabReader> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let archive_len = file.metadata()?.len();

        let mut tower = Tower::new();
        let mut config: Option<Config> = None;

        let mut archive = tar::Archive::new(&file);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type() != EntryType::Regular {
                continue;
            }
            let member = entry.path()?.to_string_lossy().into_owned();
            let member = member.strip_prefix("./").unwrap_or(&member).to_string();

            if member == CONFIG_FILE {
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes)?;
                config = Some(serde_json::from_slice(&bytes)?);
            } else {
                tower.insert(&member, entry.raw_file_position(), entry.size())?;
            }
        }
        drop(archive);
        tower.sort_columns();

        let config = config.ok_or_else(|| {
            SlabError::InvalidEntry(format!("{} has no {CONFIG_FILE} member", path.display()))
        })?;
        debug!("opened {} ({archive_len} bytes)", path.display());
        Ok(SlabReader {
            file: Mutex::new(file),
            archive_len,
            config,
            tower,
            cache: Mutex::new(TileCache::new()),
        })
    }

    /// The archive's metadata descriptor.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get an indexable reader over one variable.
    ///
    /// With `unstackable` set and a stack extent of 1, keys address the
    /// inner axes directly and the stack axis is squeezed away.
    pub fn get_reader(&self, name: &str, unstackable: bool) -> SlabResult<VarReader<'_>> {
        let tower = self
            .tower
            .get(name)
            .ok_or_else(|| SlabError::UnknownVariable(name.to_string()))?;
        let var_cfg = self
            .config
            .vars
            .get(name)
            .ok_or_else(|| SlabError::UnknownVariable(name.to_string()))?;
        let shape = var_cfg.shape.clone().ok_or_else(|| {
            SlabError::InvalidEntry(format!("variable '{name}' has no finalized shape"))
        })?;
        let codec = tower.first_codec().unwrap_or(Codec::Object);
        Ok(VarReader {
            reader: self,
            tower,
            shape,
            codec,
            unstackable,
        })
    }

    /// Assemble the full array of one variable. With `squeeze` set, a stack
    /// extent of 1 drops the leading axis.
    pub fn get_array(&self, name: &str, squeeze: bool) -> SlabResult<Slab> {
        self.get_reader(name, false)?.get_array(squeeze)
    }

    /// Introspect the archive.
    pub fn info(&self, mode: &InfoMode) -> SlabResult<ArchiveInfo> {
        match mode {
            InfoMode::Summary => Ok(ArchiveInfo::Summary {
                version: self.config.version,
                dims: self
                    .config
                    .dims
                    .iter()
                    .map(|(name, d)| (name.clone(), d.length))
                    .collect(),
                vars: self
                    .config
                    .vars
                    .iter()
                    .map(|(name, v)| (name.clone(), v.shape.clone()))
                    .collect(),
                size: self.archive_len,
            }),
            InfoMode::List => Ok(ArchiveInfo::List(
                self.tower.var_names().map(str::to_string).collect(),
            )),
            InfoMode::Var(name) => {
                let var = self.get_reader(name, false)?;
                Ok(ArchiveInfo::Var {
                    name: name.clone(),
                    shape: var.shape().to_vec(),
                    ndim: var.ndim(),
                    len: var.len(),
                })
            }
            InfoMode::Slabs => {
                let mut stats = BTreeMap::new();
                for name in self.tower.var_names() {
                    let mut leaves = Vec::new();
                    if let Some(node) = self.tower.get(name) {
                        node.collect_leaves(&mut leaves);
                    }
                    let sizes: Vec<u64> = leaves.iter().map(|l| l.size).collect();
                    stats.insert(
                        name.to_string(),
                        SlabStats {
                            count: sizes.len() as u64,
                            total_size: sizes.iter().sum(),
                            max_size: sizes.iter().copied().max().unwrap_or(0),
                            min_size: sizes.iter().copied().min().unwrap_or(0),
                        },
                    );
                }
                Ok(ArchiveInfo::Slabs(stats))
            }
        }
    }

    fn read_range(&self, offset: u64, size: u64) -> SlabResult<Bytes> {
        // Panic if the lock is poisoned is not something the user can handle
        #[expect(clippy::unwrap_used)]
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0_u8; size as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn load_tile(&self, leaf: &LeafEntry) -> SlabResult<Slab> {
        // Panic if the lock is poisoned is not something the user can handle
        #[expect(clippy::unwrap_used)]
        let mut cache = self.cache.lock().unwrap();
        cache.get_or_load(&leaf.path, || {
            let bytes = self.read_range(leaf.offset, leaf.size)?;
            leaf.codec.decode(bytes)
        })
    }
}

/// Indexable view over one variable of an archive.
pub struct VarReader<'a> {
    reader: &'a SlabReader,
    tower: &'a TowerNode,
    shape: Vec<u64>,
    codec: Codec,
    unstackable: bool,
}

impl std::fmt::Debug for VarReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VarReader")
            .field("shape", &self.shape)
            .field("codec", &self.codec)
            .field("unstackable", &self.unstackable)
            .finish_non_exhaustive()
    }
}

impl VarReader<'_> {
    /// The assembled shape, stack extent first.
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Number of axes.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// The stack extent.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Whether the stack holds no tiles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve an N-D key against the variable and assemble the selection
    /// from the overlapping tiles.
    ///
    /// Missing trailing axes take their full range; integer selectors
    /// squeeze their axis the way scalar indexing does.
    pub fn get(&self, key: &[AxisKey]) -> SlabResult<Slab> {
        self.get_key(key, self.unstackable)
    }

    /// Assemble the full array. With `squeeze` set, a stack extent of 1
    /// drops the leading axis.
    pub fn get_array(&self, squeeze: bool) -> SlabResult<Slab> {
        let slab = self.get_key(&[], false)?;
        if squeeze && self.shape.first() == Some(&1) {
            Ok(slab.squeeze_axis0())
        } else {
            Ok(slab)
        }
    }

    fn get_key(&self, key: &[AxisKey], unstackable: bool) -> SlabResult<Slab> {
        let mut key = key.to_vec();
        if unstackable && self.shape.first() == Some(&1) {
            key.insert(0, AxisKey::Index(0));
        }
        if key.len() > self.shape.len() {
            return Err(SlabError::InvalidSlice(format!(
                "key has {} axes but the variable has {}",
                key.len(),
                self.shape.len()
            )));
        }
        key.resize(self.shape.len(), AxisKey::full());

        let (stack_positions, stack_was_int) = resolve_stack(&key[0], self.shape[0])?;
        let inner = key[1..]
            .iter()
            .zip(&self.shape[1..])
            .map(|(k, &len)| resolve_inner(k, len))
            .collect::<SlabResult<Vec<InnerSel>>>()?;

        let assembled = self.assemble(
            self.tower,
            &self.shape[1..],
            &inner,
            &stack_positions,
            &mut Vec::new(),
        )?;
        let mut slab = match assembled {
            Some(slab) => slab,
            None => Slab::blank(self.codec),
        };
        if stack_was_int {
            slab = slab.squeeze_axis0();
        }
        Ok(slab)
    }

    /// Recursive descent over the inner dimensions; the stack axis is
    /// gathered last, at the leaf columns. Returns `None` for an empty
    /// selection.
    fn assemble(
        &self,
        node: &TowerNode,
        shape: &[u64],
        inner: &[InnerSel],
        stack: &[u64],
        acc: &mut Vec<TileSel>,
    ) -> SlabResult<Option<Slab>> {
        let Some(sel) = inner.first() else {
            return self.gather_column(node, stack, acc);
        };
        let TowerNode::Dirs(children) = node else {
            return Err(SlabError::InvalidEntry(
                "tile tree is shallower than the variable rank".into(),
            ));
        };

        // Concatenation axis: the stack axis plus every kept (non-integer)
        // axis accumulated so far.
        let axis = 1 + acc
            .iter()
            .filter(|s| matches!(s, TileSel::Slice { .. }))
            .count();

        let offsets: Vec<u64> = children.keys().copied().collect();
        let mut result: Option<Slab> = None;
        for (i, &lo) in offsets.iter().enumerate() {
            let hi = offsets.get(i + 1).copied().unwrap_or(shape[0]);
            if hi <= sel.start {
                continue;
            }
            if lo >= sel.stop {
                break;
            }

            // First selected index inside this tile, phase-aligned to the
            // stride even when whole tiles fall between selected indices.
            let first = if sel.start >= lo {
                sel.start
            } else {
                sel.start + (lo - sel.start).div_ceil(sel.step) * sel.step
            };
            let upper = sel.stop.min(hi);
            if first >= upper {
                continue;
            }

            let piece = if sel.was_int {
                TileSel::Index(first - lo)
            } else {
                TileSel::Slice {
                    start: first - lo,
                    stop: upper - lo,
                    step: sel.step,
                }
            };
            acc.push(piece);
            let panel = self.assemble(&children[&lo], &shape[1..], &inner[1..], stack, acc)?;
            acc.pop();

            result = match (result, panel) {
                (None, panel) => panel,
                (result, None) => result,
                (Some(result), Some(panel)) => Some(result.concat(panel, axis)?),
            };
        }
        Ok(result)
    }

    /// Decode and stack the selected tiles of one origin column, slicing
    /// each with the accumulated inner key.
    fn gather_column(
        &self,
        node: &TowerNode,
        stack: &[u64],
        acc: &[TileSel],
    ) -> SlabResult<Option<Slab>> {
        let TowerNode::Column(leaves) = node else {
            return Err(SlabError::InvalidEntry(
                "tile tree is deeper than the variable rank".into(),
            ));
        };

        let mut column_codec: Option<Codec> = None;
        let mut stacked: Option<Slab> = None;
        for &pos in stack {
            let leaf = leaves.get(pos as usize).ok_or_else(|| {
                SlabError::InvalidSlice(format!("stack position {pos} beyond the column"))
            })?;
            match column_codec {
                None => column_codec = Some(leaf.codec),
                Some(codec) if codec != leaf.codec => {
                    return Err(SlabError::CodecMismatchInColumn(
                        codec.tag().to_string(),
                        leaf.codec.tag().to_string(),
                    ));
                }
                Some(_) => {}
            }
            let tile = self.reader.load_tile(leaf)?;
            stacked = Some(Slab::stack(stacked, tile.slice(acc)?)?);
        }
        Ok(stacked)
    }
}
