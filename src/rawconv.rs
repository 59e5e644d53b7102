//! RAW-to-container conversion: the shared back half of every staged
//! conversion. Takes a described raw sample stream and produces a bricked,
//! multi-resolution container with acceleration blocks attached.

use crate::container::{self, RasterMetadata};
use crate::dispatch_kind;
use crate::error::{ConvertError, Result};
use crate::numeric::{NumericKind, Sample, swap_endian_in_place};
use crate::registry::{BrickingOptions, RawVolume};

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const COPY_CHUNK: usize = 1 << 20;

/// Delete a file, downgrading failure to a warning. Missing files are fine.
pub fn remove_best_effort(path: &Path) {
    if std::fs::remove_file(path).is_err() && path.exists() {
        log::warn!("Unable to remove temp file {}", path.display());
    }
}

/// A uniquely named scratch file inside the caller-supplied temp directory.
pub fn unique_temp_path(temp_dir: &Path, stem: &str, ext: &str) -> PathBuf {
    temp_dir.join(format!("{stem}.{:08x}.{ext}", rand::random::<u32>()))
}

/// Convert a described raw stream into a bricked container at `dst`.
///
/// Stages: normalize the stream (skip header, fix endianness, optionally
/// quantize to 8 bit), derive the LOD pyramid by factor-2 reduction, write
/// the raster block brick by brick, then attach min/max and histogram
/// acceleration blocks. All intermediates live in `temp_dir` and are
/// removed on every exit path; a failed conversion also sweeps the partial
/// target.
pub fn convert_raw_dataset(
    raw: &RawVolume,
    dst: &Path,
    temp_dir: &Path,
    opts: &BrickingOptions,
) -> Result<()> {
    log::info!(
        "Converting raw stream {} ({} {}x{}x{}, {} component(s)) to {}",
        raw.path.display(),
        raw.kind,
        raw.domain[0],
        raw.domain[1],
        raw.domain[2],
        raw.components,
        dst.display()
    );

    let mut temps: Vec<PathBuf> = Vec::new();
    let result = convert_raw_inner(raw, dst, temp_dir, opts, &mut temps);
    for temp in &temps {
        remove_best_effort(temp);
    }
    if result.is_err() {
        remove_best_effort(dst);
    }
    result
}

fn convert_raw_inner(
    raw: &RawVolume,
    dst: &Path,
    temp_dir: &Path,
    opts: &BrickingOptions,
    temps: &mut Vec<PathBuf>,
) -> Result<()> {
    let voxels = raw.domain.iter().product::<u64>();
    let expected = voxels * raw.components * raw.kind.byte_width() as u64;
    let actual = std::fs::metadata(&raw.path)?.len();
    if actual < raw.header_skip + expected {
        return Err(ConvertError::Incompatible(format!(
            "raw stream {} holds {} bytes, header+samples need {}",
            raw.path.display(),
            actual,
            raw.header_skip + expected
        )));
    }

    // Stage 1: normalize into a contiguous native-endian stream.
    let needs_copy = raw.header_skip != 0 || raw.endian_mismatch;
    let mut kind = raw.kind;
    let mut level0 = raw.path.clone();
    if needs_copy {
        let normalized = unique_temp_path(temp_dir, "normalized", "raw");
        copy_normalized(
            &raw.path,
            &normalized,
            raw.header_skip,
            expected,
            raw.kind,
            raw.endian_mismatch,
        )?;
        temps.push(normalized.clone());
        level0 = normalized;
    }
    if opts.quantize_to_8bit && kind.bit_width() > 8 {
        let quantized = unique_temp_path(temp_dir, "quantized", "raw");
        quantize_to_u8(&level0, &quantized, kind)?;
        temps.push(quantized.clone());
        level0 = quantized;
        kind = NumericKind::U8;
    }

    let meta = RasterMetadata::new(
        kind,
        raw.components,
        raw.domain,
        raw.aspect,
        opts.max_brick,
        opts.overlap,
    )?;

    // Stage 2: build one raw file per LOD level.
    let mut lod_paths = vec![level0];
    for level in 1..meta.lods.len() {
        let down = unique_temp_path(temp_dir, "lod", "raw");
        downsample_by_two(
            &lod_paths[level - 1],
            &down,
            meta.lods[level - 1].domain,
            meta.lods[level].domain,
            meta.voxel_bytes(),
        )?;
        temps.push(down.clone());
        lod_paths.push(down);
    }

    // Stage 3: brick every level into the container.
    let mut lod_files = Vec::with_capacity(lod_paths.len());
    for path in &lod_paths {
        lod_files.push(File::open(path)?);
    }
    let meta_ref = &meta;
    container::write_raster_container(dst, &meta, |lod, linear| {
        read_brick_from_raw(
            &mut lod_files[lod as usize],
            meta_ref,
            lod,
            meta_ref.brick_index_3d(lod, linear),
        )
    })?;

    // Stage 4: acceleration structures.
    crate::accel::attach_acceleration(dst, crate::accel::DEFAULT_HISTOGRAM_BUCKETS)?;

    log::info!("Created container {}", dst.display());
    Ok(())
}

/// Extract one brick (stored extent, row by row) out of a flat raw level.
pub(crate) fn read_brick_from_raw(
    file: &mut File,
    meta: &RasterMetadata,
    lod: u64,
    index: [u64; 3],
) -> Result<Vec<u8>> {
    let geo = meta.brick_geometry(lod, index);
    let domain = meta.lods[lod as usize].domain;
    let voxel = meta.voxel_bytes();
    let row_len = (geo.stored[0] * voxel) as usize;
    let mut brick = vec![0u8; (geo.stored_voxels() * voxel) as usize];
    let mut written = 0;
    for z in 0..geo.stored[2] {
        for y in 0..geo.stored[1] {
            let src = ((geo.offset[2] + z) * domain[1] * domain[0]
                + (geo.offset[1] + y) * domain[0]
                + geo.offset[0])
                * voxel;
            file.seek(SeekFrom::Start(src))?;
            file.read_exact(&mut brick[written..written + row_len])?;
            written += row_len;
        }
    }
    Ok(brick)
}

/// Copy `len` payload bytes, skipping the header and swapping sample byte
/// order when the source endianness differs from the host's.
pub(crate) fn copy_normalized(
    src: &Path,
    dst: &Path,
    header_skip: u64,
    len: u64,
    kind: NumericKind,
    swap: bool,
) -> Result<()> {
    let mut input = File::open(src)?;
    input.seek(SeekFrom::Start(header_skip))?;
    let mut output = File::create(dst)?;
    let width = kind.byte_width();
    let chunk_len = COPY_CHUNK - COPY_CHUNK % width;
    let mut remaining = len as usize;
    let mut buf = vec![0u8; chunk_len];
    while remaining > 0 {
        let take = remaining.min(chunk_len);
        input.read_exact(&mut buf[..take])?;
        if swap {
            swap_endian_in_place(&mut buf[..take], width);
        }
        output.write_all(&buf[..take])?;
        remaining -= take;
    }
    output.flush()?;
    Ok(())
}

/// Requantize any wider kind into the full u8 range using a min/max scan.
pub(crate) fn quantize_to_u8(src: &Path, dst: &Path, kind: NumericKind) -> Result<()> {
    let (lo, hi) = scan_range(src, kind)?;
    log::info!("Quantizing to 8 bit, source range [{lo}, {hi}]");
    let scale = if hi > lo { 255.0 / (hi - lo) } else { 0.0 };

    let mut input = File::open(src)?;
    let mut output = File::create(dst)?;
    let width = kind.byte_width();
    let chunk_len = COPY_CHUNK - COPY_CHUNK % width;
    let mut buf = vec![0u8; chunk_len];
    loop {
        let n = read_up_to(&mut input, &mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n - n % width];
        let out: Vec<u8> = dispatch_kind!(kind, T => {
            bytemuck::cast_slice::<u8, T>(chunk)
                .iter()
                .map(|v| ((v.to_f64() - lo) * scale).round().clamp(0.0, 255.0) as u8)
                .collect()
        })?;
        output.write_all(&out)?;
    }
    output.flush()?;
    Ok(())
}

/// Min/max scan over a flat raw file of the given kind.
pub(crate) fn scan_range(path: &Path, kind: NumericKind) -> Result<(f64, f64)> {
    let mut input = File::open(path)?;
    let width = kind.byte_width();
    let chunk_len = COPY_CHUNK - COPY_CHUNK % width;
    let mut buf = vec![0u8; chunk_len];
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    loop {
        let n = read_up_to(&mut input, &mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n - n % width];
        dispatch_kind!(kind, T => {
            for v in bytemuck::cast_slice::<u8, T>(chunk) {
                let v = v.to_f64();
                lo = lo.min(v);
                hi = hi.max(v);
            }
        })?;
    }
    Ok((lo, hi))
}

/// Point-sampled factor-2 reduction of a flat raw level, streamed row by
/// row so the level never has to fit in memory.
fn downsample_by_two(
    src: &Path,
    dst: &Path,
    src_domain: [u64; 3],
    dst_domain: [u64; 3],
    voxel: u64,
) -> Result<()> {
    let mut input = File::open(src)?;
    let mut output = File::create(dst)?;
    let src_row_len = (src_domain[0] * voxel) as usize;
    let mut src_row = vec![0u8; src_row_len];
    let mut dst_row = vec![0u8; (dst_domain[0] * voxel) as usize];
    for z in 0..dst_domain[2] {
        for y in 0..dst_domain[1] {
            let src_off = ((2 * z).min(src_domain[2] - 1) * src_domain[1] * src_domain[0]
                + (2 * y).min(src_domain[1] - 1) * src_domain[0])
                * voxel;
            input.seek(SeekFrom::Start(src_off))?;
            input.read_exact(&mut src_row)?;
            for x in 0..dst_domain[0] as usize {
                let sx = (2 * x).min(src_domain[0] as usize - 1) * voxel as usize;
                dst_row[x * voxel as usize..(x + 1) * voxel as usize]
                    .copy_from_slice(&src_row[sx..sx + voxel as usize]);
            }
            output.write_all(&dst_row)?;
        }
    }
    output.flush()?;
    Ok(())
}

pub(crate) fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Write a raw file of samples of one kind rescaled/copied from a typed
/// slice; shared by tests and the reference converters.
pub(crate) fn write_raw_samples<T: Sample>(path: &Path, samples: &[T]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytemuck::cast_slice(samples))?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::VolumeDataset;
    use crate::registry::ElementSemantic;

    fn raw_volume(path: PathBuf, kind: NumericKind, domain: [u64; 3]) -> RawVolume {
        RawVolume {
            path,
            header_skip: 0,
            kind,
            components: 1,
            endian_mismatch: false,
            domain,
            aspect: [1.0; 3],
            title: "test".into(),
            semantic: ElementSemantic::Undefined,
            owns_temp: false,
        }
    }

    #[test]
    fn converts_u8_cube_and_round_trips_voxels() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = dir.path().join("cube.raw");
        let data: Vec<u8> = (0..64).collect();
        write_raw_samples(&raw_path, &data).unwrap();

        let dst = dir.path().join("cube.bvf");
        let raw = raw_volume(raw_path, NumericKind::U8, [4, 4, 4]);
        convert_raw_dataset(&raw, &dst, dir.path(), &BrickingOptions::default()).unwrap();

        let mut ds = VolumeDataset::open(&dst).unwrap();
        let exported = dir.path().join("back.raw");
        ds.export_lod(0, &exported).unwrap();
        assert_eq!(std::fs::read(&exported).unwrap(), data);
    }

    #[test]
    fn header_skip_and_endian_swap_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = dir.path().join("skewed.raw");
        let mut bytes = vec![0xAAu8; 7]; // 7-byte header
        for v in [1u16, 256, 513, 770, 4, 5, 6, 7] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        std::fs::write(&raw_path, &bytes).unwrap();

        let mut raw = raw_volume(raw_path, NumericKind::U16, [2, 2, 2]);
        raw.header_skip = 7;
        raw.endian_mismatch = true;
        let dst = dir.path().join("skewed.bvf");
        convert_raw_dataset(&raw, &dst, dir.path(), &BrickingOptions::default()).unwrap();

        let mut ds = VolumeDataset::open(&dst).unwrap();
        let brick = ds.read_brick::<u16>(0, 0).unwrap();
        assert_eq!(brick, [1, 256, 513, 770, 4, 5, 6, 7]);
    }

    #[test]
    fn quantize_maps_full_range_to_u8() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = dir.path().join("wide.raw");
        let data: Vec<u16> = (0..8).map(|i| i * 1000).collect();
        write_raw_samples(&raw_path, &data).unwrap();

        let raw = raw_volume(raw_path, NumericKind::U16, [2, 2, 2]);
        let dst = dir.path().join("wide.bvf");
        let opts = BrickingOptions { quantize_to_8bit: true, ..BrickingOptions::default() };
        convert_raw_dataset(&raw, &dst, dir.path(), &opts).unwrap();

        let mut ds = VolumeDataset::open(&dst).unwrap();
        assert_eq!(ds.kind(), NumericKind::U8);
        let brick = ds.read_brick::<u8>(0, 0).unwrap();
        assert_eq!(brick[0], 0);
        assert_eq!(*brick.last().unwrap(), 255);
    }

    #[test]
    fn short_stream_fails_and_leaves_no_target() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = dir.path().join("short.raw");
        std::fs::write(&raw_path, [0u8; 10]).unwrap();

        let raw = raw_volume(raw_path, NumericKind::U8, [4, 4, 4]);
        let dst = dir.path().join("short.bvf");
        assert!(convert_raw_dataset(&raw, &dst, dir.path(), &BrickingOptions::default()).is_err());
        assert!(!dst.exists());
    }

    #[test]
    fn no_stray_temp_files_after_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let temp_dir = dir.path().join("scratch");
        std::fs::create_dir(&temp_dir).unwrap();

        let raw_path = dir.path().join("vol.raw");
        let data: Vec<u16> = (0..27u16).collect();
        write_raw_samples(&raw_path, &data).unwrap();
        let mut raw = raw_volume(raw_path, NumericKind::U16, [3, 3, 3]);
        raw.endian_mismatch = true; // forces a normalization temp

        let dst = dir.path().join("vol.bvf");
        convert_raw_dataset(&raw, &dst, &temp_dir, &BrickingOptions::default()).unwrap();
        assert!(dst.exists());
        assert_eq!(std::fs::read_dir(&temp_dir).unwrap().count(), 0);
    }
}
