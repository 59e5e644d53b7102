//! Acceleration structures attached to freshly built containers: a
//! hierarchical per-brick min/max block and 1D/2D histograms.

use crate::container::{self, BlockType, VolumeDataset, get_f64, get_u64, put_u64};
use crate::dispatch_kind;
use crate::error::Result;
use crate::numeric::Sample;

use ndarray::Array2;
use std::path::Path;

pub const DEFAULT_HISTOGRAM_BUCKETS: usize = 256;
const GRADIENT_BUCKETS: usize = 256;

/// Min/max of one brick's values and gradients. Gradient slots are left at
/// unbounded sentinels; gradient min/max is not computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrickMinMax {
    pub min: f64,
    pub max: f64,
    pub grad_min: f64,
    pub grad_max: f64,
}

impl BrickMinMax {
    /// Entry emitted for numeric kinds the pass cannot handle.
    fn sentinel() -> Self {
        BrickMinMax {
            min: -f64::MAX,
            max: f64::MAX,
            grad_min: -f64::MAX,
            grad_max: f64::MAX,
        }
    }
}

/// Walk every valid (LOD, brick) pair in ascending order and compute each
/// brick's min/max in its native kind. Returns the per-brick entries plus
/// the running maximum of all maxima (the 2D histogram's ceiling).
///
/// The walk asks the structural brick-index validator: bricks count up from
/// 0 until the index is rejected, LOD levels count up from 0 until the
/// level is rejected. 64-bit integer kinds are a hard error and produce
/// sentinel entries.
pub fn compute_minmax(ds: &mut VolumeDataset) -> Result<(Vec<BrickMinMax>, f64)> {
    let kind = ds.kind();
    let wide_int = !kind.is_float() && kind.bit_width() == 64;
    let mut entries = Vec::new();
    let mut max_value = f64::NEG_INFINITY;

    let mut lod = 0;
    while ds.metadata().valid_lod(lod) {
        let mut linear = 0;
        while {
            let index = ds.metadata().brick_index_3d(lod, linear);
            ds.metadata().valid_brick_index(lod, index)
        } {
            if wide_int {
                log::error!("{kind} min/max is unsupported");
                entries.push(BrickMinMax::sentinel());
                max_value = f64::MAX;
            } else {
                let bytes = ds.read_brick_bytes(lod, linear)?;
                let (min, max) = dispatch_kind!(kind, T => {
                    typed_minmax::<T>(&bytes)
                })?;
                max_value = max_value.max(max);
                entries.push(BrickMinMax {
                    min,
                    max,
                    grad_min: -f64::MAX,
                    grad_max: f64::MAX,
                });
            }
            linear += 1;
        }
        lod += 1;
    }
    Ok((entries, max_value))
}

fn typed_minmax<T: Sample>(bytes: &[u8]) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for v in bytemuck::cast_slice::<u8, T>(bytes) {
        let v = v.to_f64();
        lo = lo.min(v);
        hi = hi.max(v);
    }
    (lo, hi)
}

/// One streaming pass over level 0 filling a 1D value histogram.
pub fn compute_histogram_1d(ds: &mut VolumeDataset, buckets: usize) -> Result<Vec<u64>> {
    let (lo, hi) = ds.compute_range()?;
    let span = if hi > lo { hi - lo } else { 1.0 };
    let kind = ds.kind();
    let mut hist = vec![0u64; buckets];
    for linear in 0..ds.metadata().brick_count_linear(0) {
        let bytes = ds.read_brick_bytes(0, linear)?;
        dispatch_kind!(kind, T => {
            for v in bytemuck::cast_slice::<u8, T>(&bytes) {
                let t = (v.to_f64() - lo) / span;
                let bucket = ((t * (buckets - 1) as f64).round() as usize).min(buckets - 1);
                hist[bucket] += 1;
            }
        })?;
    }
    Ok(hist)
}

/// Second pass: 2D histogram of (value, gradient magnitude), `buckets`
/// value rows and a fixed gradient column count. `max_value` — the running
/// maximum from the min/max pass — is the value normalization ceiling.
pub fn compute_histogram_2d(
    ds: &mut VolumeDataset,
    buckets: usize,
    max_value: f64,
) -> Result<Array2<u64>> {
    let (lo, hi) = ds.compute_range()?;
    let ceiling = if max_value > lo { max_value - lo } else { 1.0 };
    let grad_span = if hi > lo { hi - lo } else { 1.0 };
    let kind = ds.kind();
    let mut hist = Array2::<u64>::zeros((buckets, GRADIENT_BUCKETS));

    let meta = ds.metadata().clone();
    for linear in 0..meta.brick_count_linear(0) {
        let index = meta.brick_index_3d(0, linear);
        let geo = meta.brick_geometry(0, index);
        let bytes = ds.read_brick_bytes(0, linear)?;
        let values: Vec<f64> = dispatch_kind!(kind, T => {
            bytemuck::cast_slice::<u8, T>(&bytes).iter().map(|v| v.to_f64()).collect()
        })?;

        let [sx, sy, sz] = geo.stored.map(|v| v as usize);
        let at = |x: usize, y: usize, z: usize| values[(z * sy + y) * sx + x];
        for z in 0..sz {
            for y in 0..sy {
                for x in 0..sx {
                    let v = at(x, y, z);
                    // central differences, clamped at the brick boundary
                    let dx = at((x + 1).min(sx - 1), y, z) - at(x.saturating_sub(1), y, z);
                    let dy = at(x, (y + 1).min(sy - 1), z) - at(x, y.saturating_sub(1), z);
                    let dz = at(x, y, (z + 1).min(sz - 1)) - at(x, y, z.saturating_sub(1));
                    let grad = (dx * dx + dy * dy + dz * dz).sqrt();

                    let row = (((v - lo) / ceiling * (buckets - 1) as f64).round() as usize)
                        .min(buckets - 1);
                    let col = ((grad / grad_span * (GRADIENT_BUCKETS - 1) as f64).round()
                        as usize)
                        .min(GRADIENT_BUCKETS - 1);
                    hist[[row, col]] += 1;
                }
            }
        }
    }
    Ok(hist)
}

/// Compute all acceleration structures for the container at `path` and
/// append them as blocks.
pub fn attach_acceleration(path: &Path, buckets: usize) -> Result<()> {
    let mut ds = VolumeDataset::open(path)?;
    let (minmax, max_value) = compute_minmax(&mut ds)?;
    log::info!("found {} brick min/maxes", minmax.len());
    let hist1d = compute_histogram_1d(&mut ds, buckets)?;
    let hist2d = compute_histogram_2d(&mut ds, hist1d.len(), max_value)?;
    drop(ds);

    container::append_blocks(
        path,
        &[
            (BlockType::MaxMin, encode_minmax(&minmax)),
            (BlockType::Histogram1d, encode_histogram_1d(&hist1d)),
            (BlockType::Histogram2d, encode_histogram_2d(&hist2d)),
        ],
    )
}

pub fn encode_minmax(entries: &[BrickMinMax]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + entries.len() * 32);
    put_u64(&mut buf, entries.len() as u64);
    for e in entries {
        for v in [e.min, e.max, e.grad_min, e.grad_max] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    buf
}

pub fn decode_minmax(mut payload: &[u8]) -> Result<Vec<BrickMinMax>> {
    let input = &mut payload;
    let count = get_u64(input)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(BrickMinMax {
            min: get_f64(input)?,
            max: get_f64(input)?,
            grad_min: get_f64(input)?,
            grad_max: get_f64(input)?,
        });
    }
    Ok(entries)
}

pub fn encode_histogram_1d(hist: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + hist.len() * 8);
    put_u64(&mut buf, hist.len() as u64);
    for &v in hist {
        put_u64(&mut buf, v);
    }
    buf
}

pub fn decode_histogram_1d(mut payload: &[u8]) -> Result<Vec<u64>> {
    let input = &mut payload;
    let count = get_u64(input)?;
    (0..count).map(|_| get_u64(input)).collect()
}

pub fn encode_histogram_2d(hist: &Array2<u64>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + hist.len() * 8);
    put_u64(&mut buf, hist.nrows() as u64);
    put_u64(&mut buf, hist.ncols() as u64);
    for &v in hist.iter() {
        put_u64(&mut buf, v);
    }
    buf
}

pub fn decode_histogram_2d(mut payload: &[u8]) -> Result<Array2<u64>> {
    let input = &mut payload;
    let rows = get_u64(input)? as usize;
    let cols = get_u64(input)? as usize;
    let mut hist = Array2::<u64>::zeros((rows, cols));
    for v in hist.iter_mut() {
        *v = get_u64(input)?;
    }
    Ok(hist)
}
