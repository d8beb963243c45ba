//! End-to-end runs over synthetic TIFF-folder acquisitions.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tiff::encoder::{colortype::Gray16, TiffEncoder};

use celltrace_rs::arr::ArrReader;
use celltrace_rs::config::{ChannelSelection, RunConfig};
use celltrace_rs::manifest::{self, FovStatus, Manifest, MANIFEST_FILE};
use celltrace_rs::pipeline;
use celltrace_rs::progress::{CancelToken, LogSink, ProgressMsg, ProgressSink};
use celltrace_rs::source::TimeUnits;

const H: usize = 64;
const W: usize = 64;

fn write_tiff(dir: &Path, c: usize, p: usize, t: usize, data: &[u16]) {
    let name = format!("img_channel{c:03}_position{p:03}_time{t:09}_z000.tif");
    let file = fs::File::create(dir.join(name)).unwrap();
    let mut writer = BufWriter::new(file);
    let mut encoder = TiffEncoder::new(&mut writer).unwrap();
    encoder
        .write_image::<Gray16>(W as u32, H as u32, data)
        .unwrap();
}

fn in_disk(y: usize, x: usize, cy: f64, cx: f64, r: f64) -> bool {
    let dy = y as f64 - cy;
    let dx = x as f64 - cx;
    (dy * dy + dx * dx).sqrt() <= r
}

/// One acquisition, identical stationary disks in every FOV and frame.
/// Channel 0 is phase contrast, channel 1 fluorescence with a gradient
/// background.
fn build_acquisition(root: &Path, n_fovs: usize, n_frames: usize, disks: &[(f64, f64, f64)]) {
    for p in 0..n_fovs {
        let dir = root.join(format!("Pos{p}"));
        fs::create_dir_all(&dir).unwrap();
        let mut pc = vec![100u16; H * W];
        let mut fl = vec![0u16; H * W];
        for y in 0..H {
            for x in 0..W {
                let fg = disks.iter().any(|&(cy, cx, r)| in_disk(y, x, cy, cx, r));
                if fg {
                    pc[y * W + x] = 3000;
                }
                fl[y * W + x] = 200 + (x / 2) as u16 + if fg { 1800 } else { 0 };
            }
        }
        for t in 0..n_frames {
            write_tiff(&dir, 0, p, t, &pc);
            write_tiff(&dir, 1, p, t, &fl);
        }
    }
}

fn base_config(src: &Path, out: &Path) -> RunConfig {
    let mut config = RunConfig::new(
        src.to_path_buf(),
        out.to_path_buf(),
        ChannelSelection { pc: 0, fl: vec![1] },
    );
    config.n_workers = 1;
    config.batch_size = 2;
    config.params.track.min_trace_length = 10;
    config
}

fn read_rows(csv_path: &Path) -> Vec<Vec<String>> {
    let mut rdr = csv::Reader::from_path(csv_path).unwrap();
    rdr.records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect()
}

#[test]
fn single_fov_disk_end_to_end() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    build_acquisition(src.path(), 1, 30, &[(32.0, 32.0, 8.0)]);

    let config = base_config(src.path(), out.path());
    let all_done = pipeline::run(&config, Box::new(LogSink), &CancelToken::new()).unwrap();
    assert!(all_done);

    let manifest = Manifest::load(&out.path().join(MANIFEST_FILE)).unwrap();
    assert_eq!(manifest.n_fov, 1);
    assert_eq!(manifest.channels, ChannelSelection { pc: 0, fl: vec![1] });
    assert_eq!(manifest.time_units, TimeUnits::Frames);
    let entry = &manifest.fov_data[&0];
    assert_eq!(entry.status, FovStatus::Done);
    for p in [
        entry.pc.as_ref().unwrap(),
        entry.seg.as_ref().unwrap(),
        entry.seg_labeled.as_ref().unwrap(),
        &entry.fl[0].1,
        &entry.fl_corrected[0].1,
        &entry.traces[0].1,
    ] {
        assert!(p.is_file(), "missing artifact {}", p.display());
    }

    // one cell, present in all 30 frames
    let rows = read_rows(&entry.traces[0].1);
    assert_eq!(rows.len(), 30);
    for (t, row) in rows.iter().enumerate() {
        assert_eq!(row[0], "0");
        assert_eq!(row[1], "1");
        assert_eq!(row[2], t.to_string());
        assert_eq!(row[3], format!("{:.6}", t as f64));
        assert_eq!(row[4], "True");
    }
    // stationary disk: stable area inside a sane band, strong signal
    let areas: Vec<usize> = rows.iter().map(|r| r[7].parse().unwrap()).collect();
    assert!(areas.iter().all(|&a| a == areas[0]), "area drifts: {areas:?}");
    assert!(areas[0] > 120 && areas[0] < 350, "area {}", areas[0]);
    let intensity: f64 = rows[0][8].parse().unwrap();
    assert!(intensity > 50_000.0, "intensity {intensity}");

    // labeled mask is nonzero exactly on the segmentation mask
    let seg = ArrReader::open(entry.seg.as_ref().unwrap()).unwrap();
    let labeled = ArrReader::open(entry.seg_labeled.as_ref().unwrap()).unwrap();
    assert_eq!(seg.shape(), (30, H, W));
    for t in [0usize, 15, 29] {
        let mask = seg.read_frame_bool(t).unwrap();
        let labels = labeled.read_frame_u16(t).unwrap();
        for i in 0..H * W {
            assert_eq!(mask[i], labels[i] != 0, "frame {t}, pixel {i}");
        }
    }
    // measured area matches the labeled mask
    let labels0 = labeled.read_frame_u16(0).unwrap();
    assert_eq!(labels0.iter().filter(|&&v| v == 1).count(), areas[0]);

    // corrected fluorescence is f32 with the full shape
    let corrected = ArrReader::open(&entry.fl_corrected[0].1).unwrap();
    assert_eq!(corrected.shape(), (30, H, W));
    let frame = corrected.read_frame_f32(0).unwrap();
    assert!(frame.iter().all(|v| v.is_finite()));
    // background (far corner) is close to zero after correction
    assert!(frame[0].abs() < 30.0, "corner residual {}", frame[0]);
}

#[test]
fn two_runs_are_bit_identical() {
    let src = tempfile::tempdir().unwrap();
    build_acquisition(src.path(), 1, 30, &[(24.0, 40.0, 7.0)]);

    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    for out in [&out_a, &out_b] {
        let config = base_config(src.path(), out.path());
        assert!(pipeline::run(&config, Box::new(LogSink), &CancelToken::new()).unwrap());
    }
    let manifest = Manifest::load(&out_a.path().join(MANIFEST_FILE)).unwrap();
    let entry = &manifest.fov_data[&0];
    for path in [
        entry.seg.as_ref().unwrap().clone(),
        entry.seg_labeled.as_ref().unwrap().clone(),
        entry.fl_corrected[0].1.clone(),
        entry.traces[0].1.clone(),
    ] {
        let name = path.file_name().unwrap();
        let twin: PathBuf = manifest::fov_dir(out_b.path(), 0).join(name);
        assert_eq!(
            fs::read(&path).unwrap(),
            fs::read(&twin).unwrap(),
            "{} differs between runs",
            name.to_string_lossy()
        );
    }
}

#[test]
fn resume_recomputes_only_the_missing_stage() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    build_acquisition(src.path(), 1, 30, &[(32.0, 32.0, 8.0)]);

    let config = base_config(src.path(), out.path());
    assert!(pipeline::run(&config, Box::new(LogSink), &CancelToken::new()).unwrap());

    let manifest = Manifest::load(&out.path().join(MANIFEST_FILE)).unwrap();
    let entry = manifest.fov_data[&0].clone();
    let csv_path = entry.traces[0].1.clone();
    let csv_before = fs::read_to_string(&csv_path).unwrap();
    let watched: Vec<PathBuf> = vec![
        entry.pc.clone().unwrap(),
        entry.seg.clone().unwrap(),
        entry.seg_labeled.clone().unwrap(),
        entry.fl_corrected[0].1.clone(),
    ];
    let mtimes: Vec<_> = watched
        .iter()
        .map(|p| fs::metadata(p).unwrap().modified().unwrap())
        .collect();

    fs::remove_file(&csv_path).unwrap();
    assert!(pipeline::run(&config, Box::new(LogSink), &CancelToken::new()).unwrap());

    for (path, before) in watched.iter().zip(&mtimes) {
        let after = fs::metadata(path).unwrap().modified().unwrap();
        assert_eq!(&after, before, "{} was recomputed", path.display());
    }
    assert_eq!(fs::read_to_string(&csv_path).unwrap(), csv_before);
}

#[test]
fn manifest_reanchors_after_the_tree_moves() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    build_acquisition(src.path(), 1, 30, &[(32.0, 32.0, 8.0)]);

    let config = base_config(src.path(), out.path());
    assert!(pipeline::run(&config, Box::new(LogSink), &CancelToken::new()).unwrap());

    // copy the whole output tree somewhere else
    let moved = tempfile::tempdir().unwrap();
    copy_tree(out.path(), moved.path());
    drop(out);

    let mut manifest = Manifest::load(&moved.path().join(MANIFEST_FILE)).unwrap();
    manifest.reanchor_to(moved.path());
    let entry = &manifest.fov_data[&0];
    for p in [
        entry.pc.as_ref().unwrap(),
        entry.seg.as_ref().unwrap(),
        entry.seg_labeled.as_ref().unwrap(),
        &entry.fl[0].1,
        &entry.fl_corrected[0].1,
        &entry.traces[0].1,
    ] {
        assert!(p.starts_with(moved.path()), "{} not re-anchored", p.display());
        assert!(p.is_file());
    }
}

fn copy_tree(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

/// Sink that trips the cancel token once segmentation of FOV 0 passes the
/// halfway mark.
struct CancelAtHalf {
    token: CancelToken,
}

impl ProgressSink for CancelAtHalf {
    fn emit(&mut self, msg: &ProgressMsg) {
        if msg.stage == "segment" && msg.fov == 0 && msg.frame * 2 >= msg.frame_total {
            self.token.cancel();
        }
    }
}

#[test]
fn cancellation_stops_scheduling_and_is_recorded() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    build_acquisition(
        src.path(),
        2,
        60,
        &[(20.0, 20.0, 6.0), (44.0, 44.0, 6.0)],
    );

    let mut config = base_config(src.path(), out.path());
    config.batch_size = 1;
    let cancel = CancelToken::new();
    let sink = CancelAtHalf {
        token: cancel.clone(),
    };
    let all_done = pipeline::run(&config, Box::new(sink), &cancel).unwrap();
    assert!(!all_done);

    let manifest = Manifest::load(&out.path().join(MANIFEST_FILE)).unwrap();
    let status0 = &manifest.fov_data[&0].status;
    assert!(
        matches!(status0, FovStatus::Cancelled | FovStatus::Done),
        "fov 0: {status0:?}"
    );
    assert_eq!(manifest.fov_data[&1].status, FovStatus::Cancelled);
}
