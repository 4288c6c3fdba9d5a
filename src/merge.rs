//! Post-barrier merge of per-process subtrees into the final variable tree,
//! plus shape reconciliation against the declared dimensions.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::config::{Config, DimLength, VarLog};
use crate::coordinate::{VARCFG_FILE, load_json};
use crate::{SlabError, SlabResult};

/// Tile placement observed while moving one variable's directories, mirroring
/// the on-disk origin tree. Interior levels key by integer offset; a leaf
/// directory only counts its tiles.
#[derive(Debug, Default)]
struct StartNode {
    children: BTreeMap<u64, StartNode>,
    tiles: u64,
}

#[derive(Debug, Default)]
struct VarMerge {
    logs: Vec<VarLog>,
    start: StartNode,
}

/// Move every finished process subtree into `work_path`, then reconcile each
/// variable's assembled shape into `config`.
pub(crate) fn merge_procs(
    work_path: &Path,
    procs: &[PathBuf],
    config: &mut Config,
) -> SlabResult<()> {
    let mut vars: BTreeMap<String, VarMerge> = BTreeMap::new();

    for proc in procs {
        debug!("merging {}", proc.display());
        move_proc(proc, work_path, &mut vars)?;
        fs::remove_dir_all(proc)?;
    }

    for (name, merged) in &vars {
        let var_cfg = config
            .vars
            .get_mut(name)
            .ok_or_else(|| SlabError::UnknownVariable(name.clone()))?;
        if merged.start.children.is_empty() && merged.start.tiles == 0 {
            // declared but never written; no shape to reconcile
            continue;
        }
        let tile_shape = tile_shape_of(name, merged)?;

        // The scan derives [inner..., stack]; published shape puts stack first.
        let mut shape = scan(0, &merged.start, &tile_shape)?;
        shape.rotate_right(1);

        for (dim_name, &observed) in var_cfg.dims.iter().zip(&shape) {
            let dim_cfg = config
                .dims
                .get_mut(dim_name)
                .ok_or_else(|| SlabError::UnknownDimension(dim_name.clone()))?;
            match dim_cfg.length {
                None | Some(DimLength::Unlimited) => {
                    dim_cfg.length = Some(DimLength::Fixed(observed));
                }
                Some(DimLength::Fixed(declared)) if declared != observed => {
                    return Err(SlabError::DimCheckFailed {
                        name: dim_name.clone(),
                        declared,
                        observed,
                    });
                }
                Some(DimLength::Fixed(_)) => {}
            }
        }

        var_cfg.shape = Some(shape);
    }

    Ok(())
}

/// The tile shape used to derive extents: the declared one if any, otherwise
/// the shape recorded with the first logged write.
fn tile_shape_of(name: &str, merged: &VarMerge) -> SlabResult<Vec<u64>> {
    for log in &merged.logs {
        if let Some(shape) = &log.tile_shape {
            return Ok(shape.clone());
        }
    }
    merged
        .logs
        .iter()
        .flat_map(|log| log.writes.values())
        .flat_map(BTreeMap::values)
        .map(|entry| entry.shape.clone())
        .next()
        .ok_or_else(|| SlabError::InvalidEntry(format!("variable '{name}' has no recorded tiles")))
}

/// Derive `[inner extents..., stack extent]` from the merged start tree.
///
/// Offsets along each dimension must be exactly the cumulative tile extents
/// starting at zero, sibling subtrees must agree, and every column must hold
/// the same number of stacked tiles.
fn scan(depth: usize, node: &StartNode, tile_shape: &[u64]) -> SlabResult<Vec<u64>> {
    if node.children.is_empty() {
        return Ok(vec![node.tiles]);
    }
    if node.tiles > 0 {
        return Err(SlabError::InvalidEntry(
            "tiles and offset directories mixed at one level".into(),
        ));
    }

    let per_tile = *tile_shape.get(depth).ok_or_else(|| {
        SlabError::InvalidEntry("origin tree is deeper than the tile rank".into())
    })?;

    let mut inner: Option<Vec<u64>> = None;
    let mut expected = 0_u64;
    for (&offset, child) in &node.children {
        if offset != expected {
            return Err(SlabError::StartIndexError {
                expected,
                found: offset,
            });
        }
        let child_shape = scan(depth + 1, child, tile_shape)?;
        match &inner {
            None => inner = Some(child_shape),
            Some(first) if *first != child_shape => {
                let (a, b) = (first.last().copied(), child_shape.last().copied());
                if a != b {
                    return Err(SlabError::StackLengthMismatch(
                        a.unwrap_or(0),
                        b.unwrap_or(0),
                    ));
                }
                let (exp, found) = first
                    .iter()
                    .zip(&child_shape)
                    .find(|(x, y)| x != y)
                    .map_or((0, 0), |(x, y)| (*x, *y));
                return Err(SlabError::StartIndexError {
                    expected: exp,
                    found,
                });
            }
            Some(_) => {}
        }
        expected += per_tile;
    }

    let mut shape = vec![expected];
    if let Some(inner) = inner {
        shape.extend(inner);
    }
    Ok(shape)
}

/// Move one process subtree into the merged tree, collecting var logs and
/// placements on the way.
fn move_proc(
    proc: &Path,
    work_path: &Path,
    vars: &mut BTreeMap<String, VarMerge>,
) -> SlabResult<()> {
    for entry in fs::read_dir(proc)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(SlabError::InvalidEntry(format!("{:?}", entry.file_name())));
        };

        let src_var = entry.path();
        let dst_var = work_path.join(name);
        let merged = vars.entry(name.to_string()).or_default();

        let cfg_path = src_var.join(VARCFG_FILE);
        let log: VarLog = load_json(&cfg_path)?;
        merged.logs.push(log);
        fs::remove_file(&cfg_path)?;

        fs::create_dir_all(&dst_var)?;
        move_dim(&src_var, &dst_var, &mut merged.start)?;
    }
    Ok(())
}

fn move_dim(src: &Path, dst: &Path, node: &mut StartNode) -> SlabResult<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(SlabError::InvalidEntry(format!("{:?}", entry.file_name())));
        };
        let src_path = entry.path();
        let dst_path = dst.join(name);

        if entry.file_type()?.is_dir() {
            let offset: u64 = name.parse().map_err(|_| {
                SlabError::InvalidEntry(format!("non-integer offset directory {name:?}"))
            })?;
            if !dst_path.is_dir() {
                if dst_path.exists() {
                    return Err(SlabError::TileCollision(dst_path));
                }
                fs::create_dir(&dst_path)?;
            }
            move_dim(&src_path, &dst_path, node.children.entry(offset).or_default())?;
        } else {
            if dst_path.exists() {
                return Err(SlabError::TileCollision(dst_path));
            }
            fs::rename(&src_path, &dst_path)?;
            node.tiles += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;

    use super::merge_procs;
    use crate::config::{Config, DimConfig, DimLength, VarConfig, VarLog};
    use crate::coordinate::dump_json;
    use crate::{SlabError, SlabResult};

    fn config_with_var(name: &str, tile_shape: &[u64], dims: &[&str]) -> Config {
        let mut config = Config::empty();
        for dim in dims {
            config.dims.insert(
                (*dim).to_string(),
                DimConfig {
                    name: (*dim).to_string(),
                    length: Some(DimLength::Unlimited),
                    origin: (serde_json::json!(0), "O".into()),
                    unit: (Some(1.0), String::new()),
                    points: None,
                    desc: "N/A".into(),
                    attrs: BTreeMap::new(),
                },
            );
        }
        config.vars.insert(
            name.to_string(),
            VarConfig {
                tile_shape: Some(tile_shape.to_vec()),
                dims: dims.iter().map(ToString::to_string).collect(),
                stack_auto: false,
                attrs: BTreeMap::new(),
                shape: None,
            },
        );
        config
    }

    /// Lay out one process subtree: tiles at `(level, origin)` plus a varcfg.
    fn fake_proc(
        work: &Path,
        proc_name: &str,
        var: &str,
        tile_shape: &[u64],
        tiles: &[(u64, &[u64])],
    ) -> SlabResult<std::path::PathBuf> {
        let proc = work.join(proc_name);
        let var_dir = proc.join(var);
        fs::create_dir_all(&var_dir)?;
        dump_json(
            &var_dir.join("__varcfg__"),
            &VarLog {
                tile_shape: Some(tile_shape.to_vec()),
                dims: vec![],
                writes: BTreeMap::new(),
            },
        )?;
        for (level, origin) in tiles {
            let dir = origin.iter().fold(var_dir.clone(), |p, o| p.join(o.to_string()));
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(format!("{level}.object.json")), b"[0]")?;
        }
        Ok(proc)
    }

    #[test]
    fn merges_disjoint_columns_and_reconciles_shape() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();
        let p1 = fake_proc(work, &"a".repeat(32), "t", &[10, 2], &[(0, &[0, 0]), (1, &[0, 0])])
            .unwrap();
        let p2 = fake_proc(work, &"b".repeat(32), "t", &[10, 2], &[(0, &[10, 0]), (1, &[10, 0])])
            .unwrap();

        let mut config = config_with_var("t", &[10, 2], &["stack", "x", "y"]);
        merge_procs(work, &[p1, p2], &mut config).unwrap();

        assert_eq!(config.vars["t"].shape, Some(vec![2, 20, 2]));
        assert_eq!(config.dims["stack"].length, Some(DimLength::Fixed(2)));
        assert_eq!(config.dims["x"].length, Some(DimLength::Fixed(20)));
        assert!(work.join("t/0/0/0.object.json").is_file());
        assert!(work.join("t/10/0/1.object.json").is_file());
        assert!(!work.join("a".repeat(32)).exists());
    }

    #[test]
    fn same_tile_from_two_procs_collides() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();
        let p1 = fake_proc(work, &"a".repeat(32), "t", &[4], &[(0, &[0])]).unwrap();
        let p2 = fake_proc(work, &"b".repeat(32), "t", &[4], &[(0, &[0])]).unwrap();

        let mut config = config_with_var("t", &[4], &["stack", "x"]);
        let err = merge_procs(work, &[p1, p2], &mut config).unwrap_err();
        assert!(matches!(err, SlabError::TileCollision(_)));
    }

    #[test]
    fn gap_in_offsets_is_a_start_index_error() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();
        let p1 = fake_proc(work, &"a".repeat(32), "t", &[4], &[(0, &[0]), (0, &[8])]).unwrap();

        let mut config = config_with_var("t", &[4], &["stack", "x"]);
        let err = merge_procs(work, &[p1], &mut config).unwrap_err();
        assert!(
            matches!(err, SlabError::StartIndexError { expected: 4, found: 8 }),
            "{err:?}"
        );
    }

    #[test]
    fn uneven_columns_are_a_stack_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();
        let p1 = fake_proc(
            work,
            &"a".repeat(32),
            "t",
            &[4],
            &[(0, &[0]), (1, &[0]), (0, &[4])],
        )
        .unwrap();

        let mut config = config_with_var("t", &[4], &["stack", "x"]);
        let err = merge_procs(work, &[p1], &mut config).unwrap_err();
        assert!(matches!(err, SlabError::StackLengthMismatch(2, 1)), "{err:?}");
    }

    #[test]
    fn fixed_dim_that_disagrees_fails_the_check() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();
        let p1 = fake_proc(work, &"a".repeat(32), "t", &[3], &[(0, &[0]), (0, &[3])]).unwrap();

        let mut config = config_with_var("t", &[3], &["stack", "x"]);
        config.dims.get_mut("x").unwrap().length = Some(DimLength::Fixed(4));
        let err = merge_procs(work, &[p1], &mut config).unwrap_err();
        assert!(
            matches!(
                err,
                SlabError::DimCheckFailed { declared: 4, observed: 6, .. }
            ),
            "{err:?}"
        );
    }
}
