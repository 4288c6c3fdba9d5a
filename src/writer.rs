use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{
    BeginToken, CONFIG_FILE, Config, Control, Dim, DimConfig, DimLength, Mode, StackDim,
    VarConfig, VarLog, WriteLog,
};
use crate::coordinate::{
    DEFAULT_CLOSE_TIMEOUT, DEFAULT_OPEN_TIMEOUT, DEFAULT_POLL_INTERVAL, FINISH_FILE,
    FINISH_PAYLOAD, Poller, VARCFG_FILE, clean_dir, dump_json, load_json, scan_proc_dirs,
    write_paths,
};
use crate::store::VarWriter;
use crate::{SlabError, SlabResult, merge, pack};

/// Options for opening the write side of a slab archive.
///
/// The defaults match the wire contract: a 10 s open timeout, a 100 s close
/// timeout and a 100 ms poll interval. Tests shrink them to simulate missing
/// or slow peers without waiting out real deadlines.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    num_procs: Option<usize>,
    workdir: Option<PathBuf>,
    open_timeout: Duration,
    close_timeout: Duration,
    poll_interval: Duration,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            num_procs: None,
            workdir: None,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WriteOptions {
    /// Options with all defaults. `num_procs` must still be set before
    /// [`master_open`](Self::master_open).
    #[must_use]
    pub fn new() -> Self {
        WriteOptions::default()
    }

    /// Total number of cooperating writer processes, the master included.
    #[must_use]
    pub fn num_procs(mut self, num_procs: usize) -> Self {
        self.num_procs = Some(num_procs);
        self
    }

    /// Use an explicit work directory instead of `<base>.__slabwork__`.
    #[must_use]
    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Deadline for `begin` and for peers waiting on the token and config.
    #[must_use]
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Deadline for `close` waiting on the cohort's finish markers.
    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Interval between filesystem probes in every wait loop.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Open the archive for writing as the cohort master.
    ///
    /// Creates the work directory and the begin-token. Launch the peers after
    /// this returns and call [`MasterWriter::begin`] once they are running.
    pub fn master_open(self, slab_path: impl AsRef<Path>) -> SlabResult<MasterWriter> {
        let num_procs = self.num_procs.ok_or(SlabError::MissingNumProcs)?;
        let (slab_path, begin_path, work_path) =
            write_paths(slab_path.as_ref(), self.workdir.clone());

        fs::create_dir_all(&work_path)?;
        clean_dir(&work_path)?;
        dump_json(
            &begin_path,
            &BeginToken {
                work_path: work_path.clone(),
                slab_path: slab_path.clone(),
                mode: Mode::Write,
            },
        )?;

        let mut config = Config::empty();
        config.control = Some(Control {
            num_procs,
            begin_path: begin_path.clone(),
            slab_path: slab_path.clone(),
        });

        let core = ProcessCore::new(work_path, config)?;
        debug!("master {} opened {}", core.proc_id, slab_path.display());
        Ok(MasterWriter {
            core,
            options: self,
            num_procs,
            begin_path,
            slab_path,
        })
    }

    /// Join an in-flight write as a peer.
    ///
    /// Blocks until the master's begin-token and published config appear,
    /// bounded by the open timeout.
    pub fn parallel_open(self, slab_path: impl AsRef<Path>) -> SlabResult<PeerWriter> {
        let (_, begin_path, _) = write_paths(slab_path.as_ref(), None);
        let poller = Poller::new(self.open_timeout, self.poll_interval);

        let token: BeginToken = poller
            .wait(|| {
                if begin_path.is_file() {
                    load_json(&begin_path).map(Some)
                } else {
                    Ok(None)
                }
            })?
            .ok_or_else(|| SlabError::NoBeginToken(begin_path.clone()))?;
        if token.mode != Mode::Write {
            return Err(SlabError::UnknownMode(token.mode.to_string()));
        }

        let cfg_path = token.work_path.join(CONFIG_FILE);
        let config: Config = poller
            .wait(|| {
                if cfg_path.is_file() {
                    load_json(&cfg_path).map(Some)
                } else {
                    Ok(None)
                }
            })?
            .ok_or_else(|| SlabError::NoConfig(token.work_path.clone()))?;

        let core = ProcessCore::new(token.work_path, config)?;
        debug!("peer {} joined", core.proc_id);
        Ok(PeerWriter { core })
    }
}

/// Open `slab_path` for writing as the cohort master with default options.
pub fn master_open(slab_path: impl AsRef<Path>, num_procs: usize) -> SlabResult<MasterWriter> {
    WriteOptions::new().num_procs(num_procs).master_open(slab_path)
}

/// Join an in-flight write as a peer with default options.
pub fn parallel_open(slab_path: impl AsRef<Path>) -> SlabResult<PeerWriter> {
    WriteOptions::new().parallel_open(slab_path)
}

/// State shared by master and peer writers: the process's private subtree
/// and the per-variable write logs.
struct ProcessCore {
    work_path: PathBuf,
    proc_id: String,
    proc_path: PathBuf,
    config: Config,
    logs: BTreeMap<String, Arc<Mutex<WriteLog>>>,
}

impl ProcessCore {
    fn new(work_path: PathBuf, config: Config) -> SlabResult<Self> {
        let proc_id = Uuid::new_v4().simple().to_string();
        let proc_path = work_path.join(&proc_id);
        fs::create_dir(&proc_path)?;
        Ok(ProcessCore {
            work_path,
            proc_id,
            proc_path,
            config,
            logs: BTreeMap::new(),
        })
    }

    fn var_writer(&mut self, name: &str) -> SlabResult<VarWriter> {
        let var_cfg = self
            .config
            .vars
            .get(name)
            .ok_or_else(|| SlabError::UnknownVariable(name.to_string()))?;
        let log = self.logs.entry(name.to_string()).or_default().clone();
        Ok(VarWriter::new(
            self.proc_path.join(name),
            var_cfg.tile_shape.clone(),
            var_cfg.stack_auto,
            log,
        ))
    }

    fn dim(&self, name: &str) -> SlabResult<Dim> {
        let dim_cfg = self
            .config
            .dims
            .get(name)
            .ok_or_else(|| SlabError::UnknownDimension(name.to_string()))?;
        Ok(Dim {
            name: dim_cfg.name.clone(),
            length: dim_cfg.length,
        })
    }

    /// Dump every variable's log and raise the finish marker.
    fn finish(&self) -> SlabResult<()> {
        for (name, var_cfg) in &self.config.vars {
            let var_dir = self.proc_path.join(name);
            fs::create_dir_all(&var_dir)?;
            // Panic if the lock is poisoned is not something the user can handle
            #[expect(clippy::unwrap_used)]
            let writes = self
                .logs
                .get(name)
                .map(|log| log.lock().unwrap().clone())
                .unwrap_or_default();
            dump_json(
                &var_dir.join(VARCFG_FILE),
                &VarLog {
                    tile_shape: var_cfg.tile_shape.clone(),
                    dims: var_cfg.dims.clone(),
                    writes,
                },
            )?;
        }

        let mut marker = fs::File::create(self.proc_path.join(FINISH_FILE))?;
        marker.write_all(FINISH_PAYLOAD)?;
        marker.sync_all()?;
        debug!("writer {} finished", self.proc_id);
        Ok(())
    }
}

/// Declaration of one dimension, consumed by [`MasterWriter::define_dim`]
/// and [`MasterWriter::define_stack`].
#[derive(Debug, Clone)]
pub struct DimSpec {
    name: String,
    length: Option<DimLength>,
    origin: (Value, String),
    unit: Option<(Option<f64>, String)>,
    points: Option<Vec<Value>>,
    desc: String,
    attrs: BTreeMap<String, Value>,
}

impl DimSpec {
    /// A dimension with no declared length; its extent is reconciled on
    /// close.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        DimSpec {
            name: name.into(),
            length: None,
            origin: (Value::from(0), "O".to_string()),
            unit: None,
            points: None,
            desc: "N/A".to_string(),
            attrs: BTreeMap::new(),
        }
    }

    /// Declare a fixed length checked against the observed extent on close.
    #[must_use]
    pub fn length(mut self, length: u64) -> Self {
        self.length = Some(DimLength::Fixed(length));
        self
    }

    /// Declare an unlimited length, finalized from the observed extent.
    #[must_use]
    pub fn unlimited(mut self) -> Self {
        self.length = Some(DimLength::Unlimited);
        self
    }

    /// Coordinate origin value and unit label.
    #[must_use]
    pub fn origin(mut self, value: impl Into<Value>, label: impl Into<String>) -> Self {
        self.origin = (value.into(), label.into());
        self
    }

    /// Coordinate unit scale and label.
    #[must_use]
    pub fn unit(mut self, scale: f64, label: impl Into<String>) -> Self {
        self.unit = Some((Some(scale), label.into()));
        self
    }

    /// Explicit coordinate points, one per index along the dimension.
    #[must_use]
    pub fn points(mut self, points: Vec<Value>) -> Self {
        self.points = Some(points);
        self
    }

    /// Free-form description.
    #[must_use]
    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    /// Attach a user attribute.
    #[must_use]
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    fn into_config(self, default_unit_label: &str) -> SlabResult<DimConfig> {
        let mut origin = self.origin;
        let mut unit = self
            .unit
            .unwrap_or((Some(1.0), default_unit_label.to_string()));
        if let Some(points) = &self.points {
            let observed = points.len() as u64;
            if let Some(DimLength::Fixed(declared)) = self.length {
                if declared != observed {
                    return Err(SlabError::DimCheckFailed {
                        name: self.name,
                        declared,
                        observed,
                    });
                }
            }
            // explicit points define the coordinates outright
            origin = (points[0].clone(), origin.1);
            unit = (None, unit.1);
        }
        Ok(DimConfig {
            name: self.name,
            length: self.length,
            origin,
            unit,
            points: self.points,
            desc: self.desc,
            attrs: self.attrs,
        })
    }
}

/// Declaration of one variable, consumed by [`MasterWriter::get_writer`].
#[derive(Debug, Clone)]
pub struct VarSpec {
    name: String,
    tile_shape: Option<Vec<u64>>,
    bound: BTreeMap<usize, Dim>,
    stack: StackChoice,
    autostack: bool,
    attrs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
enum StackChoice {
    Unlimited,
    Length(u64),
    Dim(StackDim),
}

impl VarSpec {
    /// A variable whose tiles must all have `tile_shape`. The stack length
    /// defaults to unlimited.
    #[must_use]
    pub fn new(name: impl Into<String>, tile_shape: &[u64]) -> Self {
        VarSpec {
            name: name.into(),
            tile_shape: Some(tile_shape.to_vec()),
            bound: BTreeMap::new(),
            stack: StackChoice::Unlimited,
            autostack: false,
            attrs: BTreeMap::new(),
        }
    }

    /// A variable with no declared tile shape and no per-write check.
    #[must_use]
    pub fn unchecked(name: impl Into<String>) -> Self {
        VarSpec {
            name: name.into(),
            tile_shape: None,
            bound: BTreeMap::new(),
            stack: StackChoice::Unlimited,
            autostack: false,
            attrs: BTreeMap::new(),
        }
    }

    /// Fix the stack extent, checked on close.
    #[must_use]
    pub fn stack_len(mut self, length: u64) -> Self {
        self.stack = StackChoice::Length(length);
        self
    }

    /// Use an explicitly defined stack dimension.
    #[must_use]
    pub fn stack(mut self, stack: &StackDim) -> Self {
        self.stack = StackChoice::Dim(stack.clone());
        self
    }

    /// Bind inner axis `axis` (0-based, stack excluded) to a defined
    /// dimension. Unbound axes get anonymous dimensions `dim1`, `dim2`, …
    #[must_use]
    pub fn dim(mut self, axis: usize, dim: &Dim) -> Self {
        self.bound.insert(axis, dim.clone());
        self
    }

    /// Advance the stack level automatically after each defaulted write.
    #[must_use]
    pub fn autostack(mut self, autostack: bool) -> Self {
        self.autostack = autostack;
        self
    }

    /// Attach a user attribute.
    #[must_use]
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// The cohort master: declares dimensions and variables, runs the begin
/// barrier, and on close merges the cohort's work into the final archive.
pub struct MasterWriter {
    core: ProcessCore,
    options: WriteOptions,
    num_procs: usize,
    begin_path: PathBuf,
    slab_path: PathBuf,
}

impl std::fmt::Debug for MasterWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterWriter")
            .field("options", &self.options)
            .field("num_procs", &self.num_procs)
            .field("begin_path", &self.begin_path)
            .field("slab_path", &self.slab_path)
            .finish_non_exhaustive()
    }
}

impl MasterWriter {
    /// Declare a dimension.
    pub fn define_dim(&mut self, spec: DimSpec) -> SlabResult<Dim> {
        let dim_cfg = spec.into_config("")?;
        let dim = Dim {
            name: dim_cfg.name.clone(),
            length: dim_cfg.length,
        };
        self.core.config.dims.insert(dim_cfg.name.clone(), dim_cfg);
        Ok(dim)
    }

    /// Declare a stack dimension (unit label defaults to `slab`).
    pub fn define_stack(&mut self, spec: DimSpec) -> SlabResult<StackDim> {
        let dim_cfg = spec.into_config("slab")?;
        let dim = Dim {
            name: dim_cfg.name.clone(),
            length: dim_cfg.length,
        };
        self.core.config.dims.insert(dim_cfg.name.clone(), dim_cfg);
        Ok(StackDim(dim))
    }

    /// Declare a variable and get its writer for this process.
    ///
    /// Must be called before [`begin`](Self::begin) so peers see the
    /// variable in the published config.
    pub fn get_writer(&mut self, spec: VarSpec) -> SlabResult<VarWriter> {
        let stack = match spec.stack {
            StackChoice::Dim(stack) => stack,
            StackChoice::Length(n) => self.define_stack(DimSpec::new("stack").length(n))?,
            StackChoice::Unlimited => self.define_stack(DimSpec::new("stack").unlimited())?,
        };

        let mut dims = vec![stack.name().to_string()];
        if let Some(tile_shape) = &spec.tile_shape {
            for axis in 0..tile_shape.len() {
                let dim = match spec.bound.get(&axis) {
                    Some(dim) => dim.clone(),
                    None => self.define_dim(DimSpec::new(format!("dim{}", axis + 1)))?,
                };
                dims.push(dim.name().to_string());
            }
        }

        self.core.config.vars.insert(
            spec.name.clone(),
            VarConfig {
                tile_shape: spec.tile_shape,
                dims,
                stack_auto: spec.autostack,
                attrs: spec.attrs,
                shape: None,
            },
        );
        self.core.var_writer(&spec.name)
    }

    /// Declare an unchecked, auto-stacking variable: the minimal surface
    /// for "just write my values in order".
    pub fn define_var(&mut self, name: &str) -> SlabResult<VarWriter> {
        self.get_writer(VarSpec::unchecked(name).autostack(true))
    }

    /// Set an archive-level attribute.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.core.config.attrs.insert(key.into(), value.into());
    }

    /// Publish the config and block until the whole cohort has joined.
    ///
    /// Call after the peers have been launched; a missing peer surfaces as
    /// [`SlabError::CohortIncomplete`] once the open timeout passes.
    pub fn begin(&mut self) -> SlabResult<()> {
        dump_json(&self.core.work_path.join(CONFIG_FILE), &self.core.config)?;

        let expected = self.num_procs;
        let poller = Poller::new(self.options.open_timeout, self.options.poll_interval);
        let mut actual = 0;
        let joined = poller.wait(|| {
            let procs = scan_proc_dirs(&self.core.work_path)?;
            actual = procs.len();
            Ok((actual == expected).then_some(()))
        })?;
        if joined.is_none() {
            return Err(SlabError::CohortIncomplete { actual, expected });
        }
        info!("cohort of {expected} joined");
        Ok(())
    }

    /// Finish this process, wait for every peer's finish marker, merge the
    /// per-process trees, reconcile shapes, and pack the archive.
    ///
    /// On error the work directory is left in place for inspection.
    pub fn close(mut self) -> SlabResult<()> {
        self.core.finish()?;

        if self.begin_path.is_file() {
            fs::remove_file(&self.begin_path)?;
        }

        let expected = self.num_procs;
        let poller = Poller::new(self.options.close_timeout, self.options.poll_interval);

        let mut actual = 0;
        let procs = poller
            .wait(|| {
                let procs = scan_proc_dirs(&self.core.work_path)?;
                actual = procs.len();
                Ok((actual == expected).then_some(procs))
            })?
            .ok_or(SlabError::CohortIncomplete { actual, expected })?;

        for proc in &procs {
            let marker = proc.join(FINISH_FILE);
            let seen = poller.wait(|| Ok(marker.is_file().then_some(())))?;
            if seen.is_none() {
                let name = proc
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return Err(SlabError::FinishTimeout(name));
            }
            fs::remove_file(&marker)?;
        }

        merge::merge_procs(&self.core.work_path, &procs, &mut self.core.config)?;
        self.core.config.control = None;
        pack::pack_archive(&self.core.work_path, &self.slab_path, &self.core.config)?;
        info!("finalized {}", self.slab_path.display());
        Ok(())
    }
}

/// A non-master member of the write cohort.
pub struct PeerWriter {
    core: ProcessCore,
}

impl PeerWriter {
    /// Get the writer for a variable the master declared.
    pub fn get_writer(&mut self, name: &str) -> SlabResult<VarWriter> {
        self.core.var_writer(name)
    }

    /// Look up a dimension the master declared.
    pub fn get_dim(&self, name: &str) -> SlabResult<Dim> {
        self.core.dim(name)
    }

    /// Look up a stack dimension the master declared.
    pub fn get_stack(&self, name: &str) -> SlabResult<StackDim> {
        self.core.dim(name).map(StackDim)
    }

    /// This writer's 32-char hex process id.
    #[must_use]
    pub fn proc_id(&self) -> &str {
        &self.core.proc_id
    }

    /// Peers are already joined once [`parallel_open`] returns; kept for
    /// call symmetry with [`MasterWriter::begin`].
    pub fn begin(&self) {}

    /// Record this writer's logs and raise its finish marker.
    pub fn close(self) -> SlabResult<()> {
        self.core.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DimSpec, VarSpec, WriteOptions, master_open};
    use crate::SlabError;

    #[test]
    fn write_mode_requires_num_procs() {
        let dir = tempfile::tempdir().unwrap();
        let err = WriteOptions::new()
            .master_open(dir.path().join("x.slab"))
            .unwrap_err();
        assert!(matches!(err, SlabError::MissingNumProcs));
    }

    #[test]
    fn master_open_leaves_token_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.slab");
        let _writer = master_open(&path, 1).unwrap();
        assert!(dir.path().join("t.__slabbegin__").is_file());
        assert!(dir.path().join("t.__slabwork__").is_dir());
    }

    #[test]
    fn declaring_a_var_defines_its_dims() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = master_open(dir.path().join("t.slab"), 1).unwrap();
        let x = writer.define_dim(DimSpec::new("x").length(30)).unwrap();
        writer
            .get_writer(VarSpec::new("test", &[10, 2]).stack_len(5).dim(0, &x))
            .unwrap();

        let config = &writer.core.config;
        assert_eq!(config.vars["test"].dims, ["stack", "x", "dim2"]);
        assert!(config.dims.contains_key("dim2"));
        assert_eq!(
            config.dims["stack"].length,
            Some(crate::DimLength::Fixed(5))
        );
    }

    #[test]
    fn points_length_mismatch_fails_early() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = master_open(dir.path().join("t.slab"), 1).unwrap();
        let err = writer
            .define_dim(
                DimSpec::new("x")
                    .length(3)
                    .points(vec![1.into(), 2.into()]),
            )
            .unwrap_err();
        assert!(matches!(err, SlabError::DimCheckFailed { .. }));
    }

    #[test]
    fn begin_times_out_without_peers() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WriteOptions::new()
            .num_procs(3)
            .open_timeout(Duration::from_millis(50))
            .poll_interval(Duration::from_millis(5))
            .master_open(dir.path().join("t.slab"))
            .unwrap();
        writer.get_writer(VarSpec::new("v", &[4])).unwrap();
        let err = writer.begin().unwrap_err();
        assert!(
            matches!(err, SlabError::CohortIncomplete { actual: 1, expected: 3 }),
            "{err:?}"
        );
    }
}
