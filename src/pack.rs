use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use log::info;
use tar::Builder;

use crate::config::{CONFIG_FILE, Config};
use crate::coordinate::dump_json;
use crate::{SlabError, SlabResult};

/// Write the finalized config into the work tree, pack the whole tree into
/// the archive at `slab_path`, then remove the work tree.
///
/// Members keep their work-tree names and are added in sorted order, so the
/// packed bytes are deterministic with respect to the config and tiles.
pub(crate) fn pack_archive(work_path: &Path, slab_path: &Path, config: &Config) -> SlabResult<()> {
    dump_json(&work_path.join(CONFIG_FILE), config)?;

    let file = File::create(slab_path)?;
    let mut builder = Builder::new(BufWriter::new(file));
    append_sorted(&mut builder, work_path, Path::new(""))?;
    let writer = builder.into_inner()?;
    writer
        .into_inner()
        .map_err(|e| SlabError::Io(e.into_error()))?
        .sync_all()?;

    fs::remove_dir_all(work_path)?;
    info!("packed {}", slab_path.display());
    Ok(())
}

fn append_sorted<W: Write>(builder: &mut Builder<W>, dir: &Path, rel: &Path) -> SlabResult<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        let rel_path = rel.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            builder.append_dir(&rel_path, entry.path())?;
            append_sorted(builder, &entry.path(), &rel_path)?;
        } else {
            builder.append_path_with_name(entry.path(), &rel_path)?;
        }
    }
    Ok(())
}
