//! Full pipeline runs over real files on disk.

use brickvol::container::BlockType;
use brickvol::{
    ContainerFile, ConversionPipeline, ExpressionEvaluator, MergeInput, MergeMode, VolumeDataset,
};

use std::path::{Path, PathBuf};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_bov(dir: &Path, stem: &str, data: &[u8], domain: [u64; 3]) -> PathBuf {
    std::fs::write(dir.join(format!("{stem}.raw")), data).unwrap();
    let bov = dir.join(format!("{stem}.bov"));
    std::fs::write(
        &bov,
        format!(
            "DATA_FILE: {stem}.raw\nDATA_SIZE: {} {} {}\nDATA_FORMAT: BYTE\n\
             DATA_ENDIAN: LITTLE\nASPECT: 1 1 1\nCOMPONENTS: 1\n",
            domain[0], domain[1], domain[2]
        ),
    )
    .unwrap();
    bov
}

fn gradient_volume(side: usize) -> Vec<u8> {
    (0..side * side * side).map(|i| (i % 256) as u8).collect()
}

#[test]
fn convert_round_trip_preserves_every_voxel() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let pipeline = ConversionPipeline::with_builtin_formats();

    let data = gradient_volume(16);
    let bov = write_bov(dir.path(), "vol", &data, [16, 16, 16]);
    let container = dir.path().join("vol.bvf");
    pipeline.convert_file(&bov, &container, temp.path(), true, 36, 4, false).unwrap();

    let back = dir.path().join("back.bov");
    pipeline.convert_file(&container, &back, temp.path(), true, 36, 4, false).unwrap();
    assert_eq!(std::fs::read(dir.path().join("back.raw")).unwrap(), data);

    // staging files must not outlive the conversions
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn produced_containers_carry_acceleration_blocks() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ConversionPipeline::with_builtin_formats();

    let bov = write_bov(dir.path(), "vol", &gradient_volume(8), [8, 8, 8]);
    let container = dir.path().join("vol.bvf");
    pipeline.convert_file(&bov, &container, dir.path(), true, 32, 2, false).unwrap();

    let file = ContainerFile::open(&container).unwrap();
    for block in [
        BlockType::Raster,
        BlockType::MaxMin,
        BlockType::Histogram1d,
        BlockType::Histogram2d,
    ] {
        assert!(file.first_block(block).is_some(), "missing {block:?} block");
    }
}

#[test]
fn merge_expression_isosurface_chain() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ConversionPipeline::with_builtin_formats();

    // two 8^3 half-volumes: one bright in low z, one bright in high z
    let mut lower = vec![0u8; 512];
    let mut upper = vec![0u8; 512];
    lower[..256].fill(180);
    upper[256..].fill(180);
    let bov_a = write_bov(dir.path(), "lower", &lower, [8, 8, 8]);
    let bov_b = write_bov(dir.path(), "upper", &upper, [8, 8, 8]);

    let merged = dir.path().join("merged.bvf");
    pipeline
        .merge_datasets(
            &[MergeInput::plain(bov_a.clone()), MergeInput::plain(bov_b.clone())],
            MergeMode::Max,
            &merged,
            dir.path(),
            true,
            32,
            2,
            false,
        )
        .unwrap();
    let mut ds = VolumeDataset::open(&merged).unwrap();
    assert_eq!(ds.compute_range().unwrap(), (180.0, 180.0));
    drop(ds);

    // halve the merged volume against itself
    let vol_a = dir.path().join("a.bvf");
    let vol_b = dir.path().join("b.bvf");
    pipeline.convert_file(&bov_a, &vol_a, dir.path(), true, 32, 2, false).unwrap();
    pipeline.convert_file(&bov_b, &vol_b, dir.path(), true, 32, 2, false).unwrap();
    let summed = dir.path().join("summed.bvf");
    ExpressionEvaluator::new("A / 2 + B / 2")
        .unwrap()
        .evaluate(&[vol_a, vol_b], &summed, dir.path())
        .unwrap();
    let mut ds = VolumeDataset::open(&summed).unwrap();
    assert_eq!(ds.compute_range().unwrap(), (90.0, 90.0));
    drop(ds);

    // a constant 90 field has no crossing at 200
    let obj = dir.path().join("surface.obj");
    assert!(
        pipeline
            .extract_isosurface(&summed, 0, 200.0, [1.0; 4], &obj, dir.path())
            .is_err()
    );
    assert!(!obj.exists());
}

#[test]
fn analyze_and_export_agree_on_statistics() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ConversionPipeline::with_builtin_formats();

    let data: Vec<u8> = (0..64 * 64 * 64).map(|i| (i % 200) as u8).collect();
    let bov = write_bov(dir.path(), "vol", &data, [64, 64, 64]);
    let info_foreign = pipeline.analyze(&bov, dir.path()).unwrap();

    // core size 32 forces two bricks per axis and a two-level pyramid
    let container = dir.path().join("vol.bvf");
    pipeline.convert_file(&bov, &container, dir.path(), true, 36, 4, false).unwrap();
    let info_container = pipeline.analyze(&container, dir.path()).unwrap();

    assert_eq!(info_foreign.range, info_container.range);
    assert_eq!(info_foreign.domain, info_container.domain);

    // exporting a coarser LOD yields a shrunken domain
    let lod1 = dir.path().join("half.bov");
    pipeline.export_dataset(&container, 1, &lod1, dir.path()).unwrap();
    let half = pipeline.analyze(&lod1, dir.path()).unwrap();
    assert_eq!(half.domain, [32, 32, 32]);
}

#[test]
fn failed_conversion_leaves_no_target_behind() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ConversionPipeline::with_builtin_formats();

    // header promises more voxels than the raw file holds
    std::fs::write(dir.path().join("short.raw"), vec![0u8; 10]).unwrap();
    let bov = dir.path().join("short.bov");
    std::fs::write(
        &bov,
        "DATA_FILE: short.raw\nDATA_SIZE: 8 8 8\nDATA_FORMAT: BYTE\n\
         DATA_ENDIAN: LITTLE\nASPECT: 1 1 1\nCOMPONENTS: 1\n",
    )
    .unwrap();

    let target = dir.path().join("broken.bvf");
    assert!(pipeline.convert_file(&bov, &target, dir.path(), true, 32, 2, false).is_err());
    assert!(!target.exists());
}
