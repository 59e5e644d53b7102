//! Combining multiple datasets into one container.
//!
//! Each input is normalized to a flat raw stream, rescaled per its
//! scale/bias pair, combined voxel-by-voxel, and the combined stream runs
//! through the shared RAW stage. Inputs must agree in sample type,
//! component count and domain size; a differing aspect ratio only warns.

use crate::dispatch_kind;
use crate::error::{ConvertError, Result};
use crate::numeric::Sample;
use crate::pipeline::ConversionPipeline;
use crate::rawconv::{
    self, copy_normalized, read_up_to, remove_best_effort, unique_temp_path,
};
use crate::registry::{BrickingOptions, ElementSemantic, RawVolume};

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Voxel-wise combination rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Keep the larger of the rescaled values.
    Max,
    /// Sum the rescaled values, clamped to the sample type's range.
    Add,
}

/// One merge source with its rescale transform `v * scale + bias`.
#[derive(Debug, Clone)]
pub struct MergeInput {
    pub path: PathBuf,
    pub scale: f64,
    pub bias: f64,
}

impl MergeInput {
    pub fn plain(path: PathBuf) -> Self {
        MergeInput { path, scale: 1.0, bias: 0.0 }
    }
}

impl ConversionPipeline {
    /// Merge two or more datasets into one container at `target`. All
    /// intermediate files land in `temp_dir` and are removed before
    /// returning, success or not.
    pub fn merge_datasets(
        &self,
        inputs: &[MergeInput],
        mode: MergeMode,
        target: &Path,
        temp_dir: &Path,
        no_interaction: bool,
        max_brick: u64,
        overlap: u64,
        quantize_to_8bit: bool,
    ) -> Result<()> {
        if inputs.is_empty() {
            return Err(ConvertError::Incompatible("no datasets to merge".into()));
        }
        log::info!("Request to merge {} datasets into {}", inputs.len(), target.display());

        // Stage 1: every input becomes a flat raw stream of its own kind.
        let mut staged: Vec<RawVolume> = Vec::with_capacity(inputs.len());
        for input in inputs {
            match self.stage_input(&input.path, temp_dir, no_interaction) {
                Ok(raw) => staged.push(raw),
                Err(e) => {
                    release_staged(&staged);
                    return Err(e);
                }
            }
        }

        let result = self.merge_staged(&staged, inputs, mode, target, temp_dir, &BrickingOptions {
            max_brick,
            overlap,
            quantize_to_8bit,
            no_interaction,
        });
        release_staged(&staged);
        result
    }

    /// Normalized stream for one merge input: header stripped, byte order
    /// fixed. The returned volume owns its file iff it is a temp.
    fn stage_input(&self, path: &Path, temp_dir: &Path, no_interaction: bool) -> Result<RawVolume> {
        let mut raw = self.source_to_raw(path, temp_dir, no_interaction)?;
        if raw.header_skip == 0 && !raw.endian_mismatch {
            return Ok(raw);
        }
        let flat = unique_temp_path(temp_dir, "merge_input", "raw");
        let len =
            raw.domain.iter().product::<u64>() * raw.components * raw.kind.byte_width() as u64;
        let copied = copy_normalized(
            &raw.path,
            &flat,
            raw.header_skip,
            len,
            raw.kind,
            raw.endian_mismatch,
        );
        if raw.owns_temp {
            remove_best_effort(&raw.path);
        }
        if let Err(e) = copied {
            remove_best_effort(&flat);
            return Err(e);
        }
        raw.path = flat;
        raw.header_skip = 0;
        raw.endian_mismatch = false;
        raw.owns_temp = true;
        Ok(raw)
    }

    fn merge_staged(
        &self,
        staged: &[RawVolume],
        inputs: &[MergeInput],
        mode: MergeMode,
        target: &Path,
        temp_dir: &Path,
        opts: &BrickingOptions,
    ) -> Result<()> {
        let first = &staged[0];
        for other in &staged[1..] {
            if other.kind != first.kind {
                return Err(ConvertError::Incompatible(format!(
                    "cannot merge {} data with {} data",
                    other.kind, first.kind
                )));
            }
            if other.components != first.components {
                return Err(ConvertError::Incompatible(
                    "component counts of the merge inputs differ".into(),
                ));
            }
            if other.domain != first.domain {
                return Err(ConvertError::Incompatible(format!(
                    "domain sizes of the merge inputs differ ({:?} vs {:?})",
                    other.domain, first.domain
                )));
            }
            if other.aspect != first.aspect {
                log::warn!("aspect ratios of the merge inputs differ, using the first");
            }
        }

        // Stage 2: voxel-wise combination into one raw stream.
        let merged_path = unique_temp_path(temp_dir, "merged", "raw");
        let combined = dispatch_kind!(first.kind, T => {
            combine_streams::<T>(staged, inputs, mode, &merged_path)
        })
        .and_then(|r| r);
        if let Err(e) = combined {
            remove_best_effort(&merged_path);
            return Err(e);
        }

        // Stage 3: the combined stream becomes the target container.
        let merged = RawVolume {
            path: merged_path.clone(),
            header_skip: 0,
            kind: first.kind,
            components: first.components,
            endian_mismatch: false,
            domain: first.domain,
            aspect: first.aspect,
            title: "merged volume".into(),
            semantic: ElementSemantic::Undefined,
            owns_temp: true,
        };
        let result = rawconv::convert_raw_dataset(&merged, target, temp_dir, opts);
        remove_best_effort(&merged_path);
        result
    }
}

fn release_staged(staged: &[RawVolume]) {
    for raw in staged {
        if raw.owns_temp {
            remove_best_effort(&raw.path);
        }
    }
}

/// Lock-step chunked read over all inputs, combining rescaled values in
/// f64 and clamping back into `T` on write.
fn combine_streams<T: Sample>(
    staged: &[RawVolume],
    inputs: &[MergeInput],
    mode: MergeMode,
    out_path: &Path,
) -> Result<()> {
    const CHUNK: usize = 1 << 20;
    let width = size_of::<T>();
    let chunk_len = CHUNK - CHUNK % width;

    let mut files = Vec::with_capacity(staged.len());
    for raw in staged {
        files.push(File::open(&raw.path)?);
    }
    let mut out = File::create(out_path)?;

    let mut head = vec![0u8; chunk_len];
    let mut tail = vec![0u8; chunk_len];
    loop {
        let n = read_up_to(&mut files[0], &mut head)?;
        if n == 0 {
            break;
        }
        let n = n - n % width;
        let mut acc: Vec<f64> = bytemuck::cast_slice::<u8, T>(&head[..n])
            .iter()
            .map(|v| v.to_f64() * inputs[0].scale + inputs[0].bias)
            .collect();

        for (file, input) in files[1..].iter_mut().zip(&inputs[1..]) {
            let m = read_up_to(file, &mut tail[..n])?;
            if m != n {
                return Err(ConvertError::Incompatible(
                    "merge input ended early; stream lengths differ".into(),
                ));
            }
            for (a, v) in acc.iter_mut().zip(bytemuck::cast_slice::<u8, T>(&tail[..n])) {
                let v = v.to_f64() * input.scale + input.bias;
                match mode {
                    MergeMode::Max => *a = a.max(v),
                    MergeMode::Add => *a += v,
                }
            }
        }

        let samples: Vec<T> = acc.into_iter().map(T::from_f64).collect();
        out.write_all(bytemuck::cast_slice(&samples))?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::VolumeDataset;
    use crate::rawconv::write_raw_samples;

    fn write_bov(dir: &Path, stem: &str, format: &str, raw_bytes: &[u8], domain: [u64; 3]) -> PathBuf {
        let raw = dir.join(format!("{stem}.raw"));
        write_raw_samples(&raw, raw_bytes).unwrap();
        let bov = dir.join(format!("{stem}.bov"));
        std::fs::write(
            &bov,
            format!(
                "DATA_FILE: {stem}.raw\nDATA_SIZE: {} {} {}\nDATA_FORMAT: {format}\n\
                 DATA_ENDIAN: LITTLE\nASPECT: 1 1 1\nCOMPONENTS: 1\n",
                domain[0], domain[1], domain[2]
            ),
        )
        .unwrap();
        bov
    }

    #[test]
    fn max_mode_keeps_larger_rescaled_value() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let a: Vec<u8> = (0..64).collect();
        let b: Vec<u8> = (0..64).rev().collect();
        let bov_a = write_bov(dir.path(), "a", "BYTE", &a, [4, 4, 4]);
        let bov_b = write_bov(dir.path(), "b", "BYTE", &b, [4, 4, 4]);

        let target = dir.path().join("merged.bvf");
        pipeline
            .merge_datasets(
                &[
                    MergeInput::plain(bov_a),
                    MergeInput { path: bov_b, scale: 1.0, bias: 10.0 },
                ],
                MergeMode::Max,
                &target,
                dir.path(),
                true,
                64,
                2,
                false,
            )
            .unwrap();

        let mut ds = VolumeDataset::open(&target).unwrap();
        let brick = ds.read_brick::<u8>(0, 0).unwrap();
        for (i, &v) in brick.iter().enumerate() {
            let expect = (i as f64).max((63 - i) as f64 + 10.0) as u8;
            assert_eq!(v, expect, "voxel {i}");
        }
    }

    #[test]
    fn add_mode_clamps_to_sample_range() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let a = vec![200u8; 8];
        let b = vec![100u8; 8];
        let bov_a = write_bov(dir.path(), "a", "BYTE", &a, [2, 2, 2]);
        let bov_b = write_bov(dir.path(), "b", "BYTE", &b, [2, 2, 2]);

        let target = dir.path().join("merged.bvf");
        pipeline
            .merge_datasets(
                &[MergeInput::plain(bov_a), MergeInput::plain(bov_b)],
                MergeMode::Add,
                &target,
                dir.path(),
                true,
                64,
                2,
                false,
            )
            .unwrap();

        let mut ds = VolumeDataset::open(&target).unwrap();
        let brick = ds.read_brick::<u8>(0, 0).unwrap();
        assert!(brick.iter().all(|&v| v == 255));
    }

    #[test]
    fn identity_merge_reproduces_the_input() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let data: Vec<u8> = (0..64).map(|i| (i * 2) as u8).collect();
        let bov = write_bov(dir.path(), "a", "BYTE", &data, [4, 4, 4]);

        let target = dir.path().join("merged.bvf");
        pipeline
            .merge_datasets(
                &[MergeInput::plain(bov)],
                MergeMode::Add,
                &target,
                dir.path(),
                true,
                64,
                2,
                false,
            )
            .unwrap();

        let mut ds = VolumeDataset::open(&target).unwrap();
        assert_eq!(ds.read_brick::<u8>(0, 0).unwrap(), data);
    }

    #[test]
    fn max_mode_is_order_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let bov_a = write_bov(dir.path(), "a", "BYTE", &[10u8; 64], [4, 4, 4]);
        let bov_b = write_bov(dir.path(), "b", "BYTE", &[20u8; 64], [4, 4, 4]);

        let ab = dir.path().join("ab.bvf");
        let ba = dir.path().join("ba.bvf");
        for (first, second, target) in
            [(&bov_a, &bov_b, &ab), (&bov_b, &bov_a, &ba)]
        {
            pipeline
                .merge_datasets(
                    &[MergeInput::plain(first.clone()), MergeInput::plain(second.clone())],
                    MergeMode::Max,
                    target,
                    dir.path(),
                    true,
                    64,
                    2,
                    false,
                )
                .unwrap();
        }

        let mut ds = VolumeDataset::open(&ab).unwrap();
        assert_eq!(ds.domain_size(0), [4, 4, 4]);
        assert_eq!(ds.kind(), crate::numeric::NumericKind::U8);
        assert!(ds.read_brick::<u8>(0, 0).unwrap().iter().all(|&v| v == 20));
        assert_eq!(
            std::fs::read(&ab).unwrap(),
            std::fs::read(&ba).unwrap(),
            "merge output depends on input order"
        );
    }

    #[test]
    fn mismatched_types_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let bov_a = write_bov(dir.path(), "a", "BYTE", &[0u8; 8], [2, 2, 2]);
        let b: Vec<u8> = vec![0u8; 16];
        let bov_b = write_bov(dir.path(), "b", "USHORT", &b, [2, 2, 2]);

        let err = pipeline
            .merge_datasets(
                &[MergeInput::plain(bov_a), MergeInput::plain(bov_b)],
                MergeMode::Max,
                &dir.path().join("merged.bvf"),
                dir.path(),
                true,
                64,
                2,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, ConvertError::Incompatible(_)));
    }

    #[test]
    fn mismatched_domains_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let bov_a = write_bov(dir.path(), "a", "BYTE", &[0u8; 8], [2, 2, 2]);
        let bov_b = write_bov(dir.path(), "b", "BYTE", &[0u8; 16], [4, 2, 2]);

        let target = dir.path().join("merged.bvf");
        assert!(
            pipeline
                .merge_datasets(
                    &[MergeInput::plain(bov_a), MergeInput::plain(bov_b)],
                    MergeMode::Max,
                    &target,
                    dir.path(),
                    true,
                    64,
                    2,
                    false,
                )
                .is_err()
        );
        assert!(!target.exists(), "failed merge left a target artifact");
    }

    #[test]
    fn temp_dir_is_clean_after_merge() {
        let dir = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let bov_a = write_bov(dir.path(), "a", "BYTE", &[1u8; 8], [2, 2, 2]);
        let bov_b = write_bov(dir.path(), "b", "BYTE", &[2u8; 8], [2, 2, 2]);

        pipeline
            .merge_datasets(
                &[MergeInput::plain(bov_a), MergeInput::plain(bov_b)],
                MergeMode::Add,
                &dir.path().join("merged.bvf"),
                temp.path(),
                true,
                64,
                2,
                false,
            )
            .unwrap();
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
