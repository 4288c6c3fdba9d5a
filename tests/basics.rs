//! End-to-end write/read cycles: serial cohorts, multi-writer cohorts on
//! threads, and the coordination failure modes.

use std::thread;
use std::time::Duration;

use parslab::{
    ArchiveInfo, AxisKey, DimSpec, InfoMode, Slab, SlabError, VarSpec, WriteOptions, master_open,
    open, parallel_open,
};
use serde_json::{Value, json};

const NPROCS: usize = 3;
const NSIZE: u64 = 10;
const NITER: u64 = 5;

/// `NSIZE` rows of `(id, level)`.
fn list_tile(id: u64, level: u64) -> Slab {
    Slab::Object(Value::Array(vec![json!([id, level]); NSIZE as usize]))
}

#[test]
fn serial_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("serial.slab");

    let mut slabs = master_open(&path, 1).unwrap();
    let mut var = slabs.get_writer(VarSpec::new("test", &[NSIZE, 2])).unwrap();
    slabs.begin().unwrap();
    for level in 0..NITER {
        var.write(&list_tile(0, level), ()).unwrap();
        var.stacking(1);
    }
    slabs.close().unwrap();
    assert!(path.is_file());

    let slabs = open(&path).unwrap();
    let var = slabs.get_reader("test", false).unwrap();
    assert_eq!(var.shape(), [NITER, NSIZE, 2]);
    assert_eq!(var.ndim(), 3);
    assert_eq!(var.len(), NITER);

    let Slab::Object(data) = slabs.get_array("test", false).unwrap() else {
        panic!("expected an object value");
    };
    assert_eq!(data[1][3], json!([0, 1]));
    assert_eq!(data[4][9], json!([0, 4]));

    let level1 = var.get(&[AxisKey::Index(1)]).unwrap();
    assert_eq!(level1, Slab::Object(Value::Array(vec![json!([0, 1]); 10])));
}

#[test]
fn pickleable_fallback_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fallback.slab");

    let mut slabs = master_open(&path, 1).unwrap();
    let mut var = slabs.define_var("x").unwrap();
    slabs.begin().unwrap();
    var.write(&Slab::Object(json!([1, 2, 3])), ()).unwrap();
    var.write(&Slab::Object(json!([4, 5, 6])), ()).unwrap();
    slabs.close().unwrap();

    let slabs = open(&path).unwrap();
    assert_eq!(
        slabs.get_array("x", false).unwrap(),
        Slab::Object(json!([[1, 2, 3], [4, 5, 6]]))
    );
}

#[test]
fn single_tile_squeezes_back_to_the_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("one.slab");

    let mut slabs = master_open(&path, 1).unwrap();
    let mut var = slabs.define_var("v").unwrap();
    slabs.begin().unwrap();
    var.write(&Slab::Object(json!([7, 8, 9])), ()).unwrap();
    slabs.close().unwrap();

    let slabs = open(&path).unwrap();
    assert_eq!(
        slabs.get_array("v", true).unwrap(),
        Slab::Object(json!([7, 8, 9]))
    );
    // without squeeze the unit stack axis stays
    assert_eq!(
        slabs.get_array("v", false).unwrap(),
        Slab::Object(json!([[7, 8, 9]]))
    );
}

fn peer_list_writer(path: std::path::PathBuf, id: u64) {
    let mut slabs = parallel_open(&path).unwrap();
    let mut var = slabs.get_writer("test").unwrap();
    for level in 0..NITER {
        var.write_at(&list_tile(id, level), id * NSIZE, level).unwrap();
    }
    slabs.close().unwrap();
}

#[test]
fn three_writer_cohort_assembles_one_variable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("multi.slab");

    let mut master = master_open(&path, NPROCS).unwrap();
    let mut var = master
        .get_writer(VarSpec::new("test", &[NSIZE, 2]))
        .unwrap();

    let peers: Vec<_> = (1..NPROCS as u64)
        .map(|id| {
            let path = path.clone();
            thread::spawn(move || peer_list_writer(path, id))
        })
        .collect();

    // must run after the peers have been launched
    master.begin().unwrap();

    for level in 0..NITER {
        var.write_at(&list_tile(0, level), 0_u64, level).unwrap();
    }
    for peer in peers {
        peer.join().unwrap();
    }
    master.close().unwrap();

    let slabs = open(&path).unwrap();
    let var = slabs.get_reader("test", false).unwrap();
    assert_eq!(var.shape(), [5, 30, 2]);

    let Slab::Object(data) = slabs.get_array("test", false).unwrap() else {
        panic!("expected an object value");
    };
    assert_eq!(data[4][29], json!([2, 4]));
    assert_eq!(data[1][15], json!([1, 1]));
    assert_eq!(data[1][0], json!([0, 1]));

    // the work tree and token are gone after a successful close
    assert!(!dir.path().join("multi.__slabwork__").exists());
    assert!(!dir.path().join("multi.__slabbegin__").exists());
}

#[test]
fn disjoint_dense_tiling_covers_the_axis() {
    const T: u64 = 4;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dense.slab");

    fn dense_tile(value: f64) -> Slab {
        Slab::Dense(ndarray::ArrayD::from_elem(ndarray::IxDyn(&[T as usize]), value))
    }

    let mut master = master_open(&path, NPROCS).unwrap();
    let mut var = master.get_writer(VarSpec::new("field", &[T])).unwrap();

    let peers: Vec<_> = (1..NPROCS as u64)
        .map(|id| {
            let path = path.clone();
            thread::spawn(move || {
                let mut slabs = parallel_open(&path).unwrap();
                let mut var = slabs.get_writer("field").unwrap();
                var.write(&dense_tile(id as f64), id * T).unwrap();
                slabs.close().unwrap();
            })
        })
        .collect();

    master.begin().unwrap();
    var.write(&dense_tile(0.0), 0_u64).unwrap();
    for peer in peers {
        peer.join().unwrap();
    }
    master.close().unwrap();

    let slabs = open(&path).unwrap();
    let Slab::Dense(data) = slabs.get_array("field", true).unwrap() else {
        panic!("expected a dense value");
    };
    assert_eq!(data.shape(), [NPROCS as usize * T as usize]);
    for (i, &x) in data.iter().enumerate() {
        assert_eq!(x, (i as u64 / T) as f64, "element {i}");
    }
}

#[test]
fn cohort_timeout_reports_the_missing_peers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.slab");

    let mut master = WriteOptions::new()
        .num_procs(3)
        .open_timeout(Duration::from_millis(800))
        .poll_interval(Duration::from_millis(10))
        .master_open(&path)
        .unwrap();
    master.get_writer(VarSpec::new("v", &[2])).unwrap();

    // only one of the two expected peers shows up
    let peer = {
        let path = path.clone();
        thread::spawn(move || {
            let slabs = WriteOptions::new()
                .poll_interval(Duration::from_millis(10))
                .parallel_open(&path)
                .unwrap();
            slabs.close().unwrap();
        })
    };

    let err = master.begin().unwrap_err();
    assert!(
        matches!(err, SlabError::CohortIncomplete { actual: 2, expected: 3 }),
        "{err:?}"
    );
    // the work directory is preserved for inspection
    assert!(dir.path().join("late.__slabwork__").is_dir());
    peer.join().unwrap();
}

#[test]
fn declared_dim_length_is_checked_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dim.slab");

    let mut slabs = master_open(&path, 1).unwrap();
    let x = slabs.define_dim(DimSpec::new("x").length(4)).unwrap();
    let mut var = slabs
        .get_writer(VarSpec::new("v", &[3]).dim(0, &x))
        .unwrap();
    slabs.begin().unwrap();
    var.write_at(&Slab::Object(json!([1, 1, 1])), 0_u64, 0).unwrap();
    var.write_at(&Slab::Object(json!([2, 2, 2])), 3_u64, 0).unwrap();

    let err = slabs.close().unwrap_err();
    assert!(
        matches!(
            err,
            SlabError::DimCheckFailed { declared: 4, observed: 6, .. }
        ),
        "{err:?}"
    );
}

#[test]
fn unlimited_dims_take_the_observed_extent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unl.slab");

    let mut slabs = master_open(&path, 1).unwrap();
    let x = slabs.define_dim(DimSpec::new("x").unlimited()).unwrap();
    let mut var = slabs
        .get_writer(VarSpec::new("v", &[3]).dim(0, &x).stack_len(1))
        .unwrap();
    slabs.begin().unwrap();
    var.write_at(&Slab::Object(json!([1, 1, 1])), 0_u64, 0).unwrap();
    var.write_at(&Slab::Object(json!([2, 2, 2])), 3_u64, 0).unwrap();
    slabs.close().unwrap();

    let slabs = open(&path).unwrap();
    assert_eq!(slabs.get_reader("v", false).unwrap().shape(), [1, 6]);
}

#[test]
fn mixed_codecs_in_one_column_fail_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.slab");

    let mut slabs = master_open(&path, 1).unwrap();
    let mut var = slabs.define_var("v").unwrap();
    slabs.begin().unwrap();
    var.write(&Slab::Object(json!([1, 2])), ()).unwrap();
    let dense = ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&[2]), vec![3.0, 4.0]).unwrap();
    var.write(&Slab::Dense(dense), ()).unwrap();
    slabs.close().unwrap();

    let slabs = open(&path).unwrap();
    let err = slabs.get_array("v", false).unwrap_err();
    assert!(matches!(err, SlabError::CodecMismatchInColumn(_, _)), "{err:?}");
}

#[test]
fn info_modes_describe_the_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("info.slab");

    let mut slabs = master_open(&path, 1).unwrap();
    let mut var = slabs.get_writer(VarSpec::new("test", &[4])).unwrap();
    slabs.begin().unwrap();
    var.write(&Slab::Object(json!([1, 2, 3, 4])), ()).unwrap();
    slabs.close().unwrap();

    let slabs = open(&path).unwrap();

    match slabs.info(&InfoMode::List).unwrap() {
        ArchiveInfo::List(names) => assert_eq!(names, ["test"]),
        other => panic!("unexpected info: {other:?}"),
    }

    match slabs.info(&InfoMode::Var("test".into())).unwrap() {
        ArchiveInfo::Var { shape, ndim, len, .. } => {
            assert_eq!(shape, [1, 4]);
            assert_eq!(ndim, 2);
            assert_eq!(len, 1);
        }
        other => panic!("unexpected info: {other:?}"),
    }

    match slabs.info(&InfoMode::Summary).unwrap() {
        ArchiveInfo::Summary { version, vars, size, .. } => {
            assert_eq!(version, parslab::FORMAT_VERSION);
            assert_eq!(vars.len(), 1);
            assert_eq!(vars[0].1, Some(vec![1, 4]));
            assert!(size > 0);
        }
        other => panic!("unexpected info: {other:?}"),
    }

    match slabs.info(&InfoMode::Slabs).unwrap() {
        ArchiveInfo::Slabs(stats) => {
            let s = &stats["test"];
            assert_eq!(s.count, 1);
            assert!(s.total_size > 0);
            assert_eq!(s.max_size, s.min_size);
        }
        other => panic!("unexpected info: {other:?}"),
    }

    let err = slabs.get_reader("nope", false).unwrap_err();
    assert!(matches!(err, SlabError::UnknownVariable(_)));
}
