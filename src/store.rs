use std::collections::btree_map::Entry;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::codec::Codec;
use crate::config::{WriteEntry, WriteLog};
use crate::shape::Origin;
use crate::{Slab, SlabError, SlabResult};

/// Writes one variable's tiles into this process's private subtree.
///
/// Obtained from [`MasterWriter::get_writer`](crate::MasterWriter::get_writer)
/// or [`PeerWriter::get_writer`](crate::PeerWriter::get_writer). Every write
/// lands as one file under
/// `<var>/<o_1>/…/<o_{n-1}>/<stack_level>.<codec>.<ext>` and is recorded in
/// the per-variable write log that ships with the process's `__varcfg__`.
pub struct VarWriter {
    root: PathBuf,
    tile_shape: Option<Vec<u64>>,
    autostack: bool,
    level: u64,
    log: Arc<Mutex<WriteLog>>,
}

impl VarWriter {
    pub(crate) fn new(
        root: PathBuf,
        tile_shape: Option<Vec<u64>>,
        autostack: bool,
        log: Arc<Mutex<WriteLog>>,
    ) -> Self {
        VarWriter {
            root,
            tile_shape,
            autostack,
            level: 0,
            log,
        }
    }

    /// Override the auto-stacking behavior declared for this variable.
    #[must_use]
    pub fn autostack(mut self, enabled: bool) -> Self {
        self.autostack = enabled;
        self
    }

    /// The stack level the next defaulted write will use.
    #[must_use]
    pub fn level(&self) -> u64 {
        self.level
    }

    /// Advance the current stack level by `levels`.
    pub fn stacking(&mut self, levels: u64) {
        self.level += levels;
    }

    /// Write one tile at `origin` on the current stack level.
    ///
    /// The origin converts from `()` (all zeros), a scalar (first inner
    /// dimension, rest zero) or a slice/array zero-padded on the right. With
    /// auto-stacking enabled the level advances after the write.
    pub fn write(&mut self, slab: &Slab, origin: impl Into<Origin>) -> SlabResult<()> {
        let level = self.level;
        self.write_tile(slab, &origin.into(), level)?;
        if self.autostack {
            self.level += 1;
        }
        Ok(())
    }

    /// Write one tile at `origin` on an explicit stack level, leaving the
    /// current level untouched.
    pub fn write_at(&mut self, slab: &Slab, origin: impl Into<Origin>, level: u64) -> SlabResult<()> {
        self.write_tile(slab, &origin.into(), level)
    }

    fn write_tile(&self, slab: &Slab, origin: &Origin, level: u64) -> SlabResult<()> {
        let shape = slab.shape();
        if let Some(expected) = &self.tile_shape {
            if *expected != shape {
                return Err(SlabError::ShapeMismatch {
                    expected: expected.clone(),
                    actual: shape,
                });
            }
        }

        let origin = origin.normalize(shape.len())?;
        let components: Vec<String> = origin.iter().map(u64::to_string).collect();
        let origin_path = components.join("/");

        let codec = Codec::detect(slab);
        let dir = components.iter().fold(self.root.clone(), |p, c| p.join(c));
        let file_name = format!("{level}.{}.{}", codec.tag(), codec.extension());
        let tile_path = dir.join(&file_name);

        {
            // Panic if the lock is poisoned is not something the user can handle
            #[expect(clippy::unwrap_used)]
            let mut log = self.log.lock().unwrap();
            match log.entry(level.to_string()).or_default().entry(origin_path) {
                Entry::Occupied(_) => return Err(SlabError::DuplicateTile(tile_path)),
                Entry::Vacant(slot) => {
                    slot.insert(WriteEntry { origin, shape });
                }
            }
        }

        fs::create_dir_all(&dir)?;
        if tile_path.exists() {
            return Err(SlabError::DuplicateTile(tile_path));
        }

        // write-then-rename; the temp name never parses as a tile
        let tmp_path = dir.join(format!(".{file_name}.tmp"));
        let payload = codec.encode(slab)?;
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &tile_path)?;
        debug!("tile {} ({} bytes)", tile_path.display(), payload.len());
        Ok(())
    }
}
