//! Reference format capabilities shipped in-tree: a "brick of values" text
//! header format for volumes and Wavefront OBJ for meshes. Real deployments
//! register additional converters; these two keep the registry, the staged
//! pipeline and the geometry path exercisable end to end.

use crate::error::{ConvertError, Result};
use crate::mesh::Mesh;
use crate::numeric::NumericKind;
use crate::registry::{
    ElementSemantic, GeometryConverter, RangeInfo, RawVolume, VolumeConverter, file_ext,
};

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// BOV-style volumes: a small text header naming a sidecar raw payload.
///
/// ```text
/// DATA_FILE: cube.raw
/// DATA_SIZE: 64 64 32
/// DATA_FORMAT: USHORT
/// DATA_ENDIAN: LITTLE
/// ASPECT: 1 1 2
/// COMPONENTS: 1
/// ```
pub struct BovConverter;

struct BovHeader {
    data_file: String,
    domain: [u64; 3],
    kind: NumericKind,
    big_endian: bool,
    aspect: [f32; 3],
    components: u64,
}

fn format_token(kind: NumericKind) -> &'static str {
    match (kind.is_float(), kind.is_signed(), kind.bit_width()) {
        (true, _, 32) => "FLOAT",
        (true, _, 64) => "DOUBLE",
        (false, true, 8) => "CHAR",
        (false, false, 8) => "BYTE",
        (false, true, 16) => "SHORT",
        (false, false, 16) => "USHORT",
        (false, true, 32) => "INT",
        (false, false, 32) => "UINT",
        (false, true, 64) => "LONG",
        _ => "ULONG",
    }
}

fn parse_format_token(token: &str) -> Result<NumericKind> {
    Ok(match token.to_ascii_uppercase().as_str() {
        "BYTE" => NumericKind::U8,
        "CHAR" => NumericKind::I8,
        "SHORT" => NumericKind::I16,
        "USHORT" => NumericKind::U16,
        "INT" => NumericKind::I32,
        "UINT" => NumericKind::U32,
        "LONG" => NumericKind::I64,
        "ULONG" => NumericKind::U64,
        "FLOAT" => NumericKind::F32,
        "DOUBLE" => NumericKind::F64,
        other => {
            return Err(ConvertError::Incompatible(format!("unknown BOV format '{other}'")));
        }
    })
}

fn parse_bov_header(path: &Path) -> Result<BovHeader> {
    let file = File::open(path).map_err(|_| ConvertError::OpenFailed(path.display().to_string()))?;
    let mut data_file = None;
    let mut domain = None;
    let mut kind = None;
    let mut big_endian = false;
    let mut aspect = [1.0f32; 3];
    let mut components = 1u64;

    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match key.trim().to_ascii_uppercase().as_str() {
            "DATA_FILE" => data_file = Some(value.to_string()),
            "DATA_SIZE" => {
                let dims: Vec<u64> =
                    value.split_whitespace().filter_map(|t| t.parse().ok()).collect();
                let [x, y, z] = dims[..] else {
                    return Err(ConvertError::Incompatible(format!(
                        "bad DATA_SIZE '{value}'"
                    )));
                };
                domain = Some([x, y, z]);
            }
            "DATA_FORMAT" => kind = Some(parse_format_token(value)?),
            "DATA_ENDIAN" => big_endian = value.eq_ignore_ascii_case("BIG"),
            "ASPECT" => {
                let a: Vec<f32> =
                    value.split_whitespace().filter_map(|t| t.parse().ok()).collect();
                if let [x, y, z] = a[..] {
                    aspect = [x, y, z];
                }
            }
            "COMPONENTS" => {
                components = value.parse().map_err(|_| {
                    ConvertError::Incompatible(format!("bad COMPONENTS '{value}'"))
                })?;
            }
            _ => {}
        }
    }

    Ok(BovHeader {
        data_file: data_file
            .ok_or_else(|| ConvertError::Incompatible("BOV header without DATA_FILE".into()))?,
        domain: domain
            .ok_or_else(|| ConvertError::Incompatible("BOV header without DATA_SIZE".into()))?,
        kind: kind
            .ok_or_else(|| ConvertError::Incompatible("BOV header without DATA_FORMAT".into()))?,
        big_endian,
        aspect,
        components,
    })
}

impl VolumeConverter for BovConverter {
    fn description(&self) -> &str {
        "Brick of values"
    }

    fn supported_ext(&self) -> &[&str] {
        &["BOV"]
    }

    fn can_export(&self) -> bool {
        true
    }

    fn can_read(&self, path: &Path, first_block: &[u8]) -> bool {
        file_ext(path) == "BOV"
            || first_block.windows(b"DATA_FILE".len()).any(|w| w == b"DATA_FILE")
    }

    fn convert_to_raw(
        &self,
        src: &Path,
        _temp_dir: &Path,
        _no_interaction: bool,
    ) -> Result<RawVolume> {
        let header = parse_bov_header(src)?;
        let data_path = src.parent().unwrap_or(Path::new(".")).join(&header.data_file);
        if !data_path.exists() {
            return Err(ConvertError::OpenFailed(data_path.display().to_string()));
        }
        Ok(RawVolume {
            path: data_path,
            header_skip: 0,
            kind: header.kind,
            components: header.components,
            endian_mismatch: header.big_endian != cfg!(target_endian = "big"),
            domain: header.domain,
            aspect: header.aspect,
            title: src
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            semantic: ElementSemantic::Undefined,
            owns_temp: false,
        })
    }

    fn convert_to_native(
        &self,
        raw: &RawVolume,
        dst: &Path,
        _no_interaction: bool,
        quantize_to_8bit: bool,
    ) -> Result<()> {
        let parent = dst.parent().unwrap_or(Path::new("."));
        let data_name = format!(
            "{}.raw",
            dst.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
        );
        let data_path = parent.join(&data_name);

        let payload_len = raw.domain.iter().product::<u64>()
            * raw.components
            * raw.kind.byte_width() as u64;
        // normalize the payload into the sidecar (header skip + endianness)
        if let Err(e) = crate::rawconv::copy_normalized(
            &raw.path,
            &data_path,
            raw.header_skip,
            payload_len,
            raw.kind,
            raw.endian_mismatch,
        ) {
            crate::rawconv::remove_best_effort(&data_path);
            return Err(e);
        }

        let mut kind = raw.kind;
        if quantize_to_8bit && kind.bit_width() > 8 {
            let quantized = parent.join(format!("{data_name}.q8"));
            let result = crate::rawconv::quantize_to_u8(&data_path, &quantized, kind);
            match result {
                Ok(()) => {
                    std::fs::rename(&quantized, &data_path)?;
                    kind = NumericKind::U8;
                }
                Err(e) => {
                    crate::rawconv::remove_best_effort(&quantized);
                    crate::rawconv::remove_best_effort(&data_path);
                    return Err(e);
                }
            }
        }

        let mut out = BufWriter::new(File::create(dst)?);
        writeln!(out, "# {}", raw.title)?;
        writeln!(out, "DATA_FILE: {data_name}")?;
        writeln!(out, "DATA_SIZE: {} {} {}", raw.domain[0], raw.domain[1], raw.domain[2])?;
        writeln!(out, "DATA_FORMAT: {}", format_token(kind))?;
        writeln!(out, "DATA_ENDIAN: {}", if cfg!(target_endian = "big") { "BIG" } else { "LITTLE" })?;
        writeln!(out, "ASPECT: {} {} {}", raw.aspect[0], raw.aspect[1], raw.aspect[2])?;
        writeln!(out, "COMPONENTS: {}", raw.components)?;
        out.flush()?;
        Ok(())
    }

    fn analyze(&self, path: &Path, temp_dir: &Path, no_interaction: bool) -> Result<RangeInfo> {
        let raw = self.convert_to_raw(path, temp_dir, no_interaction)?;
        let range = if raw.endian_mismatch {
            let swapped = crate::rawconv::unique_temp_path(temp_dir, "analyze", "raw");
            let len = raw.domain.iter().product::<u64>()
                * raw.components
                * raw.kind.byte_width() as u64;
            crate::rawconv::copy_normalized(&raw.path, &swapped, raw.header_skip, len, raw.kind, true)?;
            let range = crate::rawconv::scan_range(&swapped, raw.kind);
            crate::rawconv::remove_best_effort(&swapped);
            range?
        } else {
            crate::rawconv::scan_range(&raw.path, raw.kind)?
        };
        Ok(RangeInfo { range, kind: raw.kind, domain: raw.domain, aspect: raw.aspect })
    }
}

/// Wavefront OBJ meshes. Reads the `v`/`vn`/`f` subset, writes indexed
/// triangles with normals.
pub struct ObjGeoConverter;

impl GeometryConverter for ObjGeoConverter {
    fn description(&self) -> &str {
        "Wavefront object"
    }

    fn supported_ext(&self) -> &[&str] {
        &["OBJ"]
    }

    fn can_export(&self) -> bool {
        true
    }

    fn convert_to_mesh(&self, path: &Path) -> Result<Mesh> {
        let file =
            File::open(path).map_err(|_| ConvertError::OpenFailed(path.display().to_string()))?;
        let mut mesh = Mesh {
            name: path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
            ..Mesh::default()
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("v") => {
                    let coords: Vec<f32> = tokens.filter_map(|t| t.parse().ok()).collect();
                    if coords.len() < 3 {
                        return Err(ConvertError::OpenFailed(format!(
                            "{}: malformed vertex line",
                            path.display()
                        )));
                    }
                    mesh.vertices.push([coords[0], coords[1], coords[2]]);
                }
                Some("vn") => {
                    let coords: Vec<f32> = tokens.filter_map(|t| t.parse().ok()).collect();
                    if coords.len() == 3 {
                        mesh.normals.push([coords[0], coords[1], coords[2]]);
                    }
                }
                Some("f") => {
                    // triangulate as a fan; indices are 1-based, the part
                    // before the first slash is the vertex index
                    let idx: Vec<u32> = tokens
                        .filter_map(|t| t.split('/').next())
                        .filter_map(|t| t.parse::<u32>().ok())
                        .map(|i| i - 1)
                        .collect();
                    for tri in 1..idx.len().saturating_sub(1) {
                        mesh.indices.extend_from_slice(&[idx[0], idx[tri], idx[tri + 1]]);
                    }
                }
                _ => {}
            }
        }
        Ok(mesh)
    }

    fn convert_to_native(&self, mesh: &Mesh, dst: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(dst)?);
        writeln!(out, "# {} vertices, {} triangles", mesh.vertices.len(), mesh.triangle_count())?;
        let has_normals = mesh.normals.len() == mesh.vertices.len();
        for v in &mesh.vertices {
            writeln!(out, "v {} {} {}", v[0], v[1], v[2])?;
        }
        if has_normals {
            for n in &mesh.normals {
                writeln!(out, "vn {} {} {}", n[0], n[1], n[2])?;
            }
        }
        for tri in mesh.indices.chunks_exact(3) {
            if has_normals {
                writeln!(
                    out,
                    "f {0}//{0} {1}//{1} {2}//{2}",
                    tri[0] + 1,
                    tri[1] + 1,
                    tri[2] + 1
                )?;
            } else {
                writeln!(out, "f {} {} {}", tri[0] + 1, tri[1] + 1, tri[2] + 1)?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawconv::write_raw_samples;

    fn write_bov(dir: &Path, stem: &str, samples: &[u16], domain: [u64; 3]) -> std::path::PathBuf {
        let raw = dir.join(format!("{stem}.raw"));
        write_raw_samples(&raw, samples).unwrap();
        let bov = dir.join(format!("{stem}.bov"));
        std::fs::write(
            &bov,
            format!(
                "DATA_FILE: {stem}.raw\nDATA_SIZE: {} {} {}\nDATA_FORMAT: USHORT\n\
                 DATA_ENDIAN: LITTLE\nASPECT: 1 1 1\nCOMPONENTS: 1\n",
                domain[0], domain[1], domain[2]
            ),
        )
        .unwrap();
        bov
    }

    #[test]
    fn bov_header_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let samples: Vec<u16> = (0..8).collect();
        let bov = write_bov(dir.path(), "cube", &samples, [2, 2, 2]);

        let raw = BovConverter.convert_to_raw(&bov, dir.path(), true).unwrap();
        assert_eq!(raw.kind, NumericKind::U16);
        assert_eq!(raw.domain, [2, 2, 2]);
        assert!(!raw.endian_mismatch);
        assert!(!raw.owns_temp);
    }

    #[test]
    fn bov_analyze_reports_range_without_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let samples: Vec<u16> = vec![5, 10, 300, 7, 8, 9, 10, 11];
        let bov = write_bov(dir.path(), "cube", &samples, [2, 2, 2]);

        let info = BovConverter.analyze(&bov, dir.path(), true).unwrap();
        assert_eq!(info.range, (5.0, 300.0));
        assert_eq!(info.domain, [2, 2, 2]);
    }

    #[test]
    fn bov_sniffs_by_content_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        let bov = write_bov(dir.path(), "cube", &[0; 8], [2, 2, 2]);
        let block = std::fs::read(&bov).unwrap();
        assert!(BovConverter.can_read(&bov, &block[..block.len().min(512)]));
        assert!(BovConverter.can_read(Path::new("anything.bov"), &[]));
        assert!(!BovConverter.can_read(Path::new("other.xyz"), b"garbage"));
    }

    #[test]
    fn failed_export_sweeps_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        // source holds fewer bytes than the domain promises
        let short = dir.path().join("short.raw");
        std::fs::write(&short, [0u8; 4]).unwrap();
        let raw = RawVolume {
            path: short,
            header_skip: 0,
            kind: NumericKind::U8,
            components: 1,
            endian_mismatch: false,
            domain: [4, 4, 4],
            aspect: [1.0; 3],
            title: "short".into(),
            semantic: ElementSemantic::Undefined,
            owns_temp: false,
        };

        let dst = dir.path().join("out.bov");
        assert!(BovConverter.convert_to_native(&raw, &dst, true, false).is_err());
        assert!(!dir.path().join("out.raw").exists(), "partial sidecar left behind");
        assert!(!dst.exists());
    }

    #[test]
    fn obj_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut mesh = Mesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2],
            name: "tri".into(),
            ..Mesh::default()
        };
        mesh.recompute_normals();

        let path = dir.path().join("tri.obj");
        ObjGeoConverter.convert_to_native(&mesh, &path).unwrap();
        let read_back = ObjGeoConverter.convert_to_mesh(&path).unwrap();
        assert_eq!(read_back.vertices, mesh.vertices);
        assert_eq!(read_back.indices, mesh.indices);
    }
}
