//! Isosurface extraction from a container dataset.
//!
//! Bricks of the requested LOD are streamed through marching cubes one at
//! a time, so the full volume is never resident. Vertices are deduplicated
//! across cells and bricks by their global edge, which keeps the surface
//! watertight across brick seams (the high-side overlap supplies the seam
//! cells' far corners).

use crate::container::{BrickGeometry, VolumeDataset};
use crate::dispatch_kind;
use crate::error::{ConvertError, Result};
use crate::mc_tables::{CORNER_OFFSETS, EDGE_CORNERS, EDGE_TABLE, TRI_TABLE};
use crate::mesh::Mesh;
use crate::numeric::Sample;
use crate::pipeline::ConversionPipeline;
use crate::rawconv::{remove_best_effort, unique_temp_path};
use crate::registry::{GeometryConverter, file_ext};

use std::collections::HashMap;
use std::path::Path;

impl ConversionPipeline {
    /// Extract the isosurface at `isovalue` from one LOD level of a
    /// container dataset and write it through the geometry converter
    /// matching the target's extension. `tint` becomes the uniform vertex
    /// color of the mesh.
    pub fn extract_isosurface(
        &self,
        src: &Path,
        lod: u64,
        isovalue: f64,
        tint: [f32; 4],
        target: &Path,
        temp_dir: &Path,
    ) -> Result<()> {
        log::info!(
            "Extracting isosurface at {isovalue} from {} into {}",
            src.display(),
            target.display()
        );
        // resolve the writer before streaming a single brick
        let ext = file_ext(target);
        let Some(geo_converter) = self.registry().geo_converter_for_ext(&ext, true) else {
            return Err(ConvertError::NoConverter(format!("unknown mesh format {ext}")));
        };

        let mut ds = VolumeDataset::open(src)?;
        if ds.components() != 1 {
            return Err(ConvertError::Incompatible(
                "isosurface extraction requires scalar data".into(),
            ));
        }
        let meta = ds.metadata();
        if !meta.valid_lod(lod) {
            return Err(ConvertError::Container(format!("invalid LOD level {lod}")));
        }
        if meta.brick_count_linear(lod) > 1 && meta.overlap == 0 {
            return Err(ConvertError::Incompatible(
                "bricked dataset without overlap cannot be stitched".into(),
            ));
        }
        let kind = ds.kind();

        let mut extractor = BrickMarcher::new(isovalue, meta.aspect);
        let staging = unique_temp_path(temp_dir, "iso", "raw");
        let streamed = ds.export_bricks(lod, &staging, &mut |bytes, geo| {
            let values: Vec<f64> = dispatch_kind!(kind, T => {
                bytemuck::cast_slice::<u8, T>(bytes).iter().map(|v| v.to_f64()).collect()
            })?;
            extractor.march_brick(&values, geo);
            Ok(())
        });
        remove_best_effort(&staging);
        streamed?;

        let mut mesh = extractor.into_mesh();
        if mesh.is_empty() {
            return Err(ConvertError::Incompatible(format!(
                "no surface crosses isovalue {isovalue}"
            )));
        }
        mesh.recompute_normals();
        mesh.colors = vec![tint; mesh.vertices.len()];
        let stem = src.file_stem().and_then(|s| s.to_str()).unwrap_or("volume");
        mesh.name = format!("isosurface {isovalue} of {stem}");
        log::info!("Isosurface has {} triangles", mesh.triangle_count());

        let written = geo_converter.convert_to_native(&mesh, target);
        if written.is_err() {
            remove_best_effort(target);
        }
        written
    }
}

/// Marching-cubes accumulator shared across all bricks of one extraction.
struct BrickMarcher {
    isovalue: f64,
    aspect: [f32; 3],
    mesh: Mesh,
    /// Global edge (min corner, axis) to vertex index.
    edge_vertices: HashMap<([u64; 3], u8), u32>,
}

impl BrickMarcher {
    fn new(isovalue: f64, aspect: [f32; 3]) -> Self {
        BrickMarcher { isovalue, aspect, mesh: Mesh::default(), edge_vertices: HashMap::new() }
    }

    fn into_mesh(self) -> Mesh {
        self.mesh
    }

    /// March every cell this brick owns. A brick owns the cells whose low
    /// corner lies in its core; their far corners come from the high-side
    /// overlap, except at the domain end where the core itself ends the
    /// cell grid.
    fn march_brick(&mut self, values: &[f64], geo: BrickGeometry) {
        let limit = [0, 1, 2].map(|d| geo.core[d].min(geo.stored[d] - 1));
        let sample = |x: u64, y: u64, z: u64| {
            values[((z * geo.stored[1] + y) * geo.stored[0] + x) as usize]
        };

        for z in 0..limit[2] {
            for y in 0..limit[1] {
                for x in 0..limit[0] {
                    let corner_values: [f64; 8] = CORNER_OFFSETS
                        .map(|[dx, dy, dz]| sample(x + dx, y + dy, z + dz));
                    let mut config = 0usize;
                    for (i, &v) in corner_values.iter().enumerate() {
                        if v < self.isovalue {
                            config |= 1 << i;
                        }
                    }
                    if EDGE_TABLE[config] == 0 {
                        continue;
                    }

                    let cell = [geo.offset[0] + x, geo.offset[1] + y, geo.offset[2] + z];
                    let mut edge_index = [0u32; 12];
                    for e in 0..12 {
                        if EDGE_TABLE[config] & (1 << e) != 0 {
                            edge_index[e] = self.edge_vertex(cell, e, &corner_values);
                        }
                    }
                    for tri in TRI_TABLE[config].chunks_exact(3) {
                        if tri[0] < 0 {
                            break;
                        }
                        for &e in tri {
                            self.mesh.indices.push(edge_index[e as usize]);
                        }
                    }
                }
            }
        }
    }

    /// Vertex on one cut cell edge, deduplicated by its global identity.
    fn edge_vertex(&mut self, cell: [u64; 3], edge: usize, corner_values: &[f64; 8]) -> u32 {
        let [c1, c2] = EDGE_CORNERS[edge];
        let g1 = [0, 1, 2].map(|d| cell[d] + CORNER_OFFSETS[c1][d]);
        let g2 = [0, 1, 2].map(|d| cell[d] + CORNER_OFFSETS[c2][d]);
        let low = [0, 1, 2].map(|d| g1[d].min(g2[d]));
        let axis = (0..3).find(|&d| g1[d] != g2[d]).unwrap_or(0) as u8;

        if let Some(&index) = self.edge_vertices.get(&(low, axis)) {
            return index;
        }

        let v1 = corner_values[c1];
        let v2 = corner_values[c2];
        let t = if (v2 - v1).abs() < f64::EPSILON {
            0.5
        } else {
            ((self.isovalue - v1) / (v2 - v1)).clamp(0.0, 1.0)
        };
        let position = [0, 1, 2].map(|d| {
            let base = g1[d] as f64 + t * (g2[d] as f64 - g1[d] as f64);
            base as f32 * self.aspect[d]
        });

        let index = self.mesh.vertices.len() as u32;
        self.mesh.vertices.push(position);
        self.edge_vertices.insert((low, axis), index);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::numeric::NumericKind;
    use crate::rawconv::convert_raw_dataset;
    use crate::registry::{BrickingOptions, ElementSemantic, RawVolume};

    fn boxed_field_container(
        dir: &Path,
        aspect: [f32; 3],
        max_brick: u64,
        overlap: u64,
    ) -> PathBuf {
        // 8^3 field, a 4^3 block of 200 centered in zeros
        let mut data = vec![0u8; 512];
        for z in 2..6 {
            for y in 2..6 {
                for x in 2..6 {
                    data[z * 64 + y * 8 + x] = 200;
                }
            }
        }
        let raw = dir.join("field.raw");
        std::fs::write(&raw, &data).unwrap();

        let container = dir.join("field.bvf");
        convert_raw_dataset(
            &RawVolume {
                path: raw,
                header_skip: 0,
                kind: NumericKind::U8,
                components: 1,
                endian_mismatch: false,
                domain: [8, 8, 8],
                aspect,
                title: "field".into(),
                semantic: ElementSemantic::Undefined,
                owns_temp: false,
            },
            &container,
            dir,
            &BrickingOptions { max_brick, overlap, quantize_to_8bit: false, no_interaction: true },
        )
        .unwrap();
        container
    }

    #[test]
    fn surface_of_embedded_box_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        // bricks of core 4 split the domain, so seams are exercised
        let container = boxed_field_container(dir.path(), [1.0; 3], 6, 2);
        let pipeline = ConversionPipeline::with_builtin_formats();

        let target = dir.path().join("surface.obj");
        pipeline
            .extract_isosurface(&container, 0, 100.0, [1.0; 4], &target, dir.path())
            .unwrap();

        let mesh = pipeline.load_mesh(&target).unwrap();
        assert!(!mesh.is_empty());

        // a closed manifold surface uses every undirected edge exactly twice
        let mut edge_uses: HashMap<(u32, u32), u32> = HashMap::new();
        for tri in mesh.indices.chunks_exact(3) {
            for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
                *edge_uses.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            }
        }
        assert!(edge_uses.values().all(|&n| n == 2), "surface has open edges");
    }

    #[test]
    fn vertices_are_scaled_by_aspect() {
        let dir = tempfile::tempdir().unwrap();
        let container = boxed_field_container(dir.path(), [2.0, 1.0, 1.0], 64, 2);
        let pipeline = ConversionPipeline::with_builtin_formats();

        let target = dir.path().join("surface.obj");
        pipeline
            .extract_isosurface(&container, 0, 100.0, [1.0; 4], &target, dir.path())
            .unwrap();
        let mesh = pipeline.load_mesh(&target).unwrap();
        // the box spans voxels 2..=5; x is stretched by the 2.0 aspect
        for v in &mesh.vertices {
            assert!(v[0] > 2.0 && v[0] < 12.0, "x out of range: {v:?}");
            for d in 1..3 {
                assert!(v[d] > 1.0 && v[d] < 6.0, "vertex out of range: {v:?}");
            }
        }
    }

    #[test]
    fn isovalue_outside_range_yields_no_surface() {
        let dir = tempfile::tempdir().unwrap();
        let container = boxed_field_container(dir.path(), [1.0; 3], 64, 2);
        let pipeline = ConversionPipeline::with_builtin_formats();

        let err = pipeline
            .extract_isosurface(
                &container,
                0,
                1000.0,
                [1.0; 4],
                &dir.path().join("none.obj"),
                dir.path(),
            )
            .unwrap_err();
        assert!(matches!(err, ConvertError::Incompatible(_)));
        assert!(!dir.path().join("none.obj").exists());
    }

    #[test]
    fn out_of_range_lod_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let container = boxed_field_container(dir.path(), [1.0; 3], 64, 2);
        let pipeline = ConversionPipeline::with_builtin_formats();

        // the 8^3 volume fits one brick, so only LOD 0 exists
        let err = pipeline
            .extract_isosurface(
                &container,
                5,
                100.0,
                [1.0; 4],
                &dir.path().join("surface.obj"),
                dir.path(),
            )
            .unwrap_err();
        assert!(matches!(err, ConvertError::Container(_)));
    }

    #[test]
    fn unknown_target_format_fails_before_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let err = pipeline
            .extract_isosurface(
                &dir.path().join("absent.bvf"),
                0,
                1.0,
                [1.0; 4],
                &dir.path().join("surface.xyz"),
                dir.path(),
            )
            .unwrap_err();
        // the missing converter is reported, not the missing dataset
        assert!(matches!(err, ConvertError::NoConverter(_)));
    }
}
