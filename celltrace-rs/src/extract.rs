//! Stage 1: materialize the selected channels of one FOV as `.arr` files.
//!
//! Runs in the coordinator process because acquisition readers are not
//! assumed process-safe. Idempotent: a complete file with the right header
//! is reused, anything else is rewritten.

use std::fs;
use std::path::Path;

use crate::arr::{self, ArrWriter, DType};
use crate::config::ChannelSelection;
use crate::error::{PipelineError, Result};
use crate::manifest::{fl_path, fov_dir, pc_path, FovEntry, FovStatus};
use crate::progress::{CancelToken, ProgressOut, StageCtx};
use crate::source::{AcquisitionMetadata, Source};

pub fn extract_fov(
    source: &mut Source,
    meta: &AcquisitionMetadata,
    selection: &ChannelSelection,
    fov: usize,
    out_dir: &Path,
    out: &ProgressOut,
    cancel: &CancelToken,
) -> Result<FovEntry> {
    let dir = fov_dir(out_dir, fov);
    fs::create_dir_all(&dir)?;
    let ctx = StageCtx {
        out,
        cancel,
        stage: "extract",
        fov,
        frame_total: meta.n_frames * (1 + selection.fl.len()),
    };

    let mut entry = FovEntry::default();

    let target = pc_path(out_dir, &meta.base_name, fov);
    copy_channel(source, meta, fov, selection.pc, &target, 0, &ctx)?;
    entry.pc = Some(target);

    for (i, &channel) in selection.fl.iter().enumerate() {
        let target = fl_path(out_dir, &meta.base_name, fov, channel);
        copy_channel(source, meta, fov, channel, &target, (i + 1) * meta.n_frames, &ctx)?;
        FovEntry::set_channel_path(&mut entry.fl, channel, target);
    }

    entry.status = FovStatus::Extracted;
    Ok(entry)
}

fn copy_channel(
    source: &mut Source,
    meta: &AcquisitionMetadata,
    fov: usize,
    channel: usize,
    target: &Path,
    frame_offset: usize,
    ctx: &StageCtx,
) -> Result<()> {
    let shape = (meta.n_frames, meta.height, meta.width);
    if arr::open_expecting(target, shape, DType::U16).is_some() {
        tracing::debug!(fov, channel, path = %target.display(), "reusing extracted channel");
        return Ok(());
    }
    let mut writer = ArrWriter::create(target, shape, DType::U16)?;
    for t in 0..meta.n_frames {
        let frame = source.read_frame(fov, t, channel)?;
        if frame.len() != meta.height * meta.width {
            return Err(PipelineError::Read {
                fov,
                channel,
                frame: t,
                message: format!(
                    "source frame has {} pixels, expected {}",
                    frame.len(),
                    meta.height * meta.width
                ),
            });
        }
        writer.write_frame_u16(t, &frame)?;
        ctx.tick(frame_offset + t)?;
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arr::ArrReader;
    use std::io::BufWriter;
    use tiff::encoder::{colortype::Gray16, TiffEncoder};

    fn synthetic_source(root: &Path, n_frames: usize, n_channels: usize) -> Source {
        let dir = root.join("Pos0");
        fs::create_dir_all(&dir).unwrap();
        for t in 0..n_frames {
            for c in 0..n_channels {
                let data: Vec<u16> = (0..64).map(|i| (t * 100 + c * 10 + i) as u16).collect();
                let name = format!("img_channel{c:03}_position000_time{t:09}_z000.tif");
                let file = fs::File::create(dir.join(name)).unwrap();
                let mut writer = BufWriter::new(file);
                let mut encoder = TiffEncoder::new(&mut writer).unwrap();
                encoder.write_image::<Gray16>(8, 8, &data).unwrap();
            }
        }
        Source::open(root).unwrap()
    }

    #[test]
    fn extracts_selected_channels() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let mut source = synthetic_source(src_dir.path(), 3, 2);
        let meta = source.metadata().unwrap();
        let selection = ChannelSelection { pc: 0, fl: vec![1] };
        let (tx, _rx) = crossbeam_channel::unbounded();
        let out = ProgressOut::Channel(tx);
        let cancel = CancelToken::new();
        let entry =
            extract_fov(&mut source, &meta, &selection, 0, out_dir.path(), &out, &cancel).unwrap();
        assert_eq!(entry.status, FovStatus::Extracted);

        let pc = ArrReader::open(entry.pc.as_ref().unwrap()).unwrap();
        assert_eq!(pc.shape(), (3, 8, 8));
        assert_eq!(pc.read_frame_u16(2).unwrap()[0], 200);
        let fl = ArrReader::open(&entry.fl[0].1).unwrap();
        assert_eq!(fl.read_frame_u16(1).unwrap()[0], 110);
    }

    #[test]
    fn reuses_complete_artifacts() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let mut source = synthetic_source(src_dir.path(), 2, 1);
        let meta = source.metadata().unwrap();
        let selection = ChannelSelection { pc: 0, fl: vec![] };
        let (tx, _rx) = crossbeam_channel::unbounded();
        let out = ProgressOut::Channel(tx);
        let cancel = CancelToken::new();
        extract_fov(&mut source, &meta, &selection, 0, out_dir.path(), &out, &cancel).unwrap();
        let target = pc_path(out_dir.path(), &meta.base_name, 0);
        let before = fs::metadata(&target).unwrap().modified().unwrap();
        extract_fov(&mut source, &meta, &selection, 0, out_dir.path(), &out, &cancel).unwrap();
        let after = fs::metadata(&target).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn incomplete_artifact_is_rewritten() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let mut source = synthetic_source(src_dir.path(), 2, 1);
        let meta = source.metadata().unwrap();
        let selection = ChannelSelection { pc: 0, fl: vec![] };
        let target = pc_path(out_dir.path(), &meta.base_name, 0);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        // interrupted write: never finished
        let w = ArrWriter::create(&target, (2, 8, 8), DType::U16).unwrap();
        drop(w);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let out = ProgressOut::Channel(tx);
        let cancel = CancelToken::new();
        extract_fov(&mut source, &meta, &selection, 0, out_dir.path(), &out, &cancel).unwrap();
        let r = ArrReader::open(&target).unwrap();
        assert!(r.is_complete());
        assert_eq!(r.read_frame_u16(1).unwrap()[0], 100);
    }

    #[test]
    fn cancellation_stops_extraction() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let mut source = synthetic_source(src_dir.path(), 2, 1);
        let meta = source.metadata().unwrap();
        let selection = ChannelSelection { pc: 0, fl: vec![] };
        let (tx, _rx) = crossbeam_channel::unbounded();
        let out = ProgressOut::Channel(tx);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = extract_fov(&mut source, &meta, &selection, 0, out_dir.path(), &out, &cancel);
        assert!(matches!(err, Err(PipelineError::Cancelled)));
    }
}
