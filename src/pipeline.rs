//! Staged conversion orchestration: stack→container, file(s)→any target,
//! dataset export, analysis and rebricking. Owns the format registry and
//! the default brick parameterization.

use crate::container::{self, CONTAINER_EXT, VolumeDataset};
use crate::dispatch_kind;
use crate::error::{ConvertError, Result};
use crate::mesh::Mesh;
use crate::numeric::{NumericKind, Sample, swap_endian_in_place};
use crate::rawconv::{self, remove_best_effort, unique_temp_path};
use crate::registry::{
    BrickingOptions, ElementSemantic, FormatRegistry, GeometryConverter, RangeInfo, RawVolume,
    VolumeConverter, file_ext,
};

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One 2D element of an image stack: where its payload lives on disk.
#[derive(Debug, Clone)]
pub struct StackElement {
    pub path: PathBuf,
    pub data_offset: u64,
    pub data_len: u64,
}

/// An ordered sequence of 2D images forming one logical 3D dataset, as
/// produced by a directory-discovery collaborator. Consumed once by
/// [`ConversionPipeline::convert_stack`].
#[derive(Debug, Clone)]
pub struct StackDescriptor {
    /// Discovery tag, e.g. `"DICOM"` or `"IMAGE"`.
    pub format_tag: String,
    pub elements: Vec<StackElement>,
    /// In-plane size of every element.
    pub slice_size: [u64; 2],
    pub aspect: [f32; 3],
    pub kind: NumericKind,
    pub big_endian: bool,
    pub components: u64,
    /// Set when element payloads are JPEG streams; decoding them is the
    /// discovery collaborator's job, so such stacks are rejected here.
    pub jpeg_encoded: bool,
    pub description: String,
}

/// The conversion/merge/analysis engine's front door: format registry plus
/// default brick parameters.
pub struct ConversionPipeline {
    registry: FormatRegistry,
    max_brick: u64,
    overlap: u64,
}

impl ConversionPipeline {
    pub fn new(registry: FormatRegistry) -> Self {
        ConversionPipeline {
            registry,
            max_brick: container::DEFAULT_BRICK_SIZE,
            overlap: container::DEFAULT_BRICK_OVERLAP,
        }
    }

    pub fn with_builtin_formats() -> Self {
        ConversionPipeline::new(FormatRegistry::with_builtin_formats())
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut FormatRegistry {
        &mut self.registry
    }

    pub fn max_brick_size(&self) -> u64 {
        self.max_brick
    }

    pub fn brick_overlap(&self) -> u64 {
        self.overlap
    }

    /// Returns false (and changes nothing) when the size would not exceed
    /// the current overlap.
    pub fn set_max_brick_size(&mut self, max_brick: u64) -> bool {
        if max_brick > self.overlap {
            self.max_brick = max_brick;
            true
        } else {
            false
        }
    }

    /// Returns false (and changes nothing) when the overlap would not stay
    /// below the current brick size.
    pub fn set_brick_overlap(&mut self, overlap: u64) -> bool {
        if self.max_brick > overlap {
            self.overlap = overlap;
            true
        } else {
            false
        }
    }

    fn options(&self, max_brick: u64, overlap: u64, quantize_to_8bit: bool, no_interaction: bool) -> BrickingOptions {
        BrickingOptions { max_brick, overlap, quantize_to_8bit, no_interaction }
    }

    /// Convert an image stack into the native container. Element payloads
    /// are concatenated into one intermediate raw stream (endianness fixed
    /// per element, 3-component data promoted to 4 with an opaque alpha),
    /// which then runs through the shared RAW stage. The intermediate is
    /// removed unconditionally.
    pub fn convert_stack(
        &self,
        stack: &StackDescriptor,
        target: &Path,
        temp_dir: &Path,
        max_brick: u64,
        overlap: u64,
        quantize_to_8bit: bool,
    ) -> Result<()> {
        log::info!(
            "Request to convert stack of {} files ({}) to {}",
            stack.elements.len(),
            stack.format_tag,
            target.display()
        );
        if stack.elements.is_empty() {
            return Err(ConvertError::Incompatible("empty stack".into()));
        }
        if stack.jpeg_encoded {
            return Err(ConvertError::Incompatible(
                "JPEG-encoded stacks must be decoded by the discovery collaborator".into(),
            ));
        }

        let intermediate = unique_temp_path(temp_dir, "stack", "raw");
        log::info!("Creating intermediate file {}", intermediate.display());
        let result = self.build_stack_intermediate(stack, &intermediate).and_then(
            |(components, kind)| {
                let raw = RawVolume {
                    path: intermediate.clone(),
                    header_skip: 0,
                    kind,
                    components,
                    endian_mismatch: false,
                    domain: [
                        stack.slice_size[0],
                        stack.slice_size[1],
                        stack.elements.len() as u64,
                    ],
                    aspect: stack.aspect,
                    title: format!("{} stack", stack.format_tag),
                    semantic: ElementSemantic::Undefined,
                    owns_temp: true,
                };
                rawconv::convert_raw_dataset(
                    &raw,
                    target,
                    temp_dir,
                    &self.options(max_brick, overlap, quantize_to_8bit, true),
                )
            },
        );
        remove_best_effort(&intermediate);
        result
    }

    fn build_stack_intermediate(
        &self,
        stack: &StackDescriptor,
        intermediate: &Path,
    ) -> Result<(u64, NumericKind)> {
        let mut out = File::create(intermediate)?;
        let width = stack.kind.byte_width();
        let mut components = stack.components;
        for (i, element) in stack.elements.iter().enumerate() {
            let mut data = vec![0u8; element.data_len as usize];
            let mut file = File::open(&element.path)
                .map_err(|_| ConvertError::OpenFailed(element.path.display().to_string()))?;
            file.seek(SeekFrom::Start(element.data_offset))?;
            file.read_exact(&mut data)?;

            if stack.big_endian != cfg!(target_endian = "big") {
                swap_endian_in_place(&mut data, width);
            }

            if stack.components == 3 {
                // treat 3-component data as 4-component to simplify the
                // brick layout; alpha is fully opaque
                components = 4;
                data = promote_rgb_to_rgba(&data, stack.kind)?;
            }
            out.write_all(&data)?;
            log::info!("Stack element {}/{} staged", i + 1, stack.elements.len());
        }
        out.flush()?;
        Ok((components, stack.kind))
    }

    /// Convert a single source file to any target format.
    pub fn convert_file(
        &self,
        src: &Path,
        target: &Path,
        temp_dir: &Path,
        no_interaction: bool,
        max_brick: u64,
        overlap: u64,
        quantize_to_8bit: bool,
    ) -> Result<()> {
        self.convert_files(
            std::slice::from_ref(&src.to_path_buf()),
            target,
            temp_dir,
            no_interaction,
            max_brick,
            overlap,
            quantize_to_8bit,
        )
    }

    /// Convert source file(s) to any target format. Multi-file input is
    /// only legal when the target is the native container.
    pub fn convert_files(
        &self,
        files: &[PathBuf],
        target: &Path,
        temp_dir: &Path,
        no_interaction: bool,
        max_brick: u64,
        overlap: u64,
        quantize_to_8bit: bool,
    ) -> Result<()> {
        let Some(first) = files.first() else {
            return Err(ConvertError::Incompatible("no files to convert".into()));
        };
        log::info!(
            "Request to convert {} file(s) starting at {} to {}",
            files.len(),
            first.display(),
            target.display()
        );
        // valid only when comparing performance across brick sizes; in
        // actual use this catches a forgotten argument
        assert!(max_brick >= 32, "incredibly small bricks -- are you sure?");

        let opts = self.options(max_brick, overlap, quantize_to_8bit, no_interaction);
        let target_ext = file_ext(target);

        if target_ext.eq_ignore_ascii_case(CONTAINER_EXT) {
            for converter in self.registry.identify_converters(first)? {
                match converter.convert_to_container(files, target, temp_dir, &opts) {
                    Ok(()) => return Ok(()),
                    Err(e) => log::warn!(
                        "Converter {} can read files, but conversion failed: {e}",
                        converter.description()
                    ),
                }
            }
            log::info!("No suitable automatic converter found");
            if let Some(fallback) = self.registry.fallback() {
                log::info!("Attempting fallback converter");
                return fallback.convert_to_container(files, target, temp_dir, &opts);
            }
            return Err(ConvertError::NoConverter(first.display().to_string()));
        }

        if files.len() > 1 {
            return Err(ConvertError::Incompatible(
                "cannot convert multiple files to anything but the native container".into(),
            ));
        }

        // Foreign target: stage through a raw stream.
        let raw = self.source_to_raw(first, temp_dir, no_interaction)?;
        let result = self.raw_to_foreign(&raw, &target_ext, target, no_interaction, quantize_to_8bit);
        if raw.owns_temp {
            remove_best_effort(&raw.path);
        }
        if result.is_err() {
            remove_best_effort(target);
        }
        result
    }

    /// Normalize any supported source into a described raw stream; the
    /// container source exports its highest-resolution LOD.
    pub(crate) fn source_to_raw(
        &self,
        src: &Path,
        temp_dir: &Path,
        no_interaction: bool,
    ) -> Result<RawVolume> {
        if file_ext(src).eq_ignore_ascii_case(CONTAINER_EXT) {
            let mut ds = VolumeDataset::open(src)?;
            let raw_path = unique_temp_path(temp_dir, "export", "raw");
            if let Err(e) = ds.export_lod(0, &raw_path) {
                remove_best_effort(&raw_path);
                return Err(e);
            }
            let meta = ds.metadata();
            return Ok(RawVolume {
                path: raw_path,
                header_skip: 0,
                kind: meta.kind,
                components: meta.components,
                endian_mismatch: false,
                domain: meta.domain(),
                aspect: meta.aspect,
                title: "container data".into(),
                semantic: ElementSemantic::Undefined,
                owns_temp: true,
            });
        }

        for converter in self.registry.identify_converters(src)? {
            match converter.convert_to_raw(src, temp_dir, no_interaction) {
                Ok(raw) => return Ok(raw),
                Err(e) => log::warn!(
                    "Converter {} claimed {} but failed: {e}",
                    converter.description(),
                    src.display()
                ),
            }
        }
        if let Some(fallback) = self.registry.fallback() {
            log::info!("No converter can read the data, trying fallback converter");
            return fallback.convert_to_raw(src, temp_dir, no_interaction);
        }
        Err(ConvertError::NoConverter(src.display().to_string()))
    }

    fn raw_to_foreign(
        &self,
        raw: &RawVolume,
        target_ext: &str,
        target: &Path,
        no_interaction: bool,
        quantize_to_8bit: bool,
    ) -> Result<()> {
        let mut last_err = None;
        for converter in self
            .registry
            .converters()
            .filter(|c| c.supported_ext().iter().any(|e| e.eq_ignore_ascii_case(target_ext)))
        {
            match converter.convert_to_native(raw, target, no_interaction, quantize_to_8bit) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "{} said it could convert to native, but failed: {e}",
                        converter.description()
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ConvertError::NoConverter(format!("*.{target_ext}"))))
    }

    /// Export one LOD level of a container dataset to a foreign format.
    pub fn export_dataset(
        &self,
        src: &Path,
        lod: u64,
        target: &Path,
        temp_dir: &Path,
    ) -> Result<()> {
        let target_ext = file_ext(target);
        if self.registry.converter_for_ext(&target_ext, false).is_none() {
            return Err(ConvertError::NoConverter(format!("unknown extension {target_ext}")));
        }

        let mut ds = VolumeDataset::open(src)?;
        let staging = unique_temp_path(temp_dir, "export", "raw");
        let result = ds.export_lod(lod, &staging).and_then(|()| {
            let meta = ds.metadata();
            let raw = RawVolume {
                path: staging.clone(),
                header_skip: 0,
                kind: meta.kind,
                components: meta.components,
                endian_mismatch: false,
                domain: ds.domain_size(lod),
                aspect: meta.aspect,
                title: "container data".into(),
                semantic: ElementSemantic::Undefined,
                owns_temp: true,
            };
            log::info!("Writing target dataset {}", target.display());
            self.raw_to_foreign(&raw, &target_ext, target, true, false)
        });
        remove_best_effort(&staging);
        if result.is_err() {
            remove_best_effort(target);
        }
        result
    }

    /// Dataset statistics without a full conversion. Container files are
    /// answered directly; foreign files are delegated to the converter
    /// declaring their extension, then to the fallback.
    pub fn analyze(&self, path: &Path, temp_dir: &Path) -> Result<RangeInfo> {
        if file_ext(path).eq_ignore_ascii_case(CONTAINER_EXT) {
            let mut ds = VolumeDataset::open(path)?;
            if ds.components() != 1 {
                return Err(ConvertError::Incompatible(
                    "analysis supports single-component data only".into(),
                ));
            }
            let range = ds.compute_range()?;
            let meta = ds.metadata();
            return Ok(RangeInfo {
                range,
                kind: meta.kind,
                domain: meta.domain(),
                aspect: meta.aspect,
            });
        }

        let ext = file_ext(path);
        let mut last_err = None;
        for converter in self
            .registry
            .converters()
            .filter(|c| c.supported_ext().iter().any(|e| e.eq_ignore_ascii_case(&ext)))
        {
            match converter.analyze(path, temp_dir, true) {
                Ok(info) => return Ok(info),
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(fallback) = self.registry.fallback() {
            return fallback.analyze(path, temp_dir, true);
        }
        Err(last_err.unwrap_or_else(|| ConvertError::NoConverter(path.display().to_string())))
    }

    /// Re-brick a container with new brick parameters by round-tripping
    /// through the first export-capable registered format.
    pub fn rebrick(
        &self,
        src: &Path,
        target: &Path,
        temp_dir: &Path,
        max_brick: u64,
        overlap: u64,
        quantize_to_8bit: bool,
    ) -> Result<()> {
        let Some(intermediate_ext) = self
            .registry
            .converters()
            .filter(|c| c.can_export())
            .flat_map(|c| c.supported_ext().iter())
            .next()
        else {
            return Err(ConvertError::NoConverter("no export-capable converter".into()));
        };
        let intermediate =
            unique_temp_path(temp_dir, "rebrick", &intermediate_ext.to_ascii_lowercase());

        log::info!("Rebricking (phase 1/2)");
        self.export_dataset(src, 0, &intermediate, temp_dir)?;

        log::info!("Rebricking (phase 2/2)");
        let result = self.convert_file(
            &intermediate,
            target,
            temp_dir,
            true,
            max_brick,
            overlap,
            quantize_to_8bit,
        );
        remove_best_effort(&intermediate);
        // the BOV intermediate carries a raw sidecar; sweep it too
        remove_best_effort(&intermediate.with_extension("raw"));
        result
    }

    /// Try every geometry converter that claims the file, in registration
    /// order.
    pub fn load_mesh(&self, path: &Path) -> Result<Mesh> {
        log::info!("Opening mesh file {}", path.display());
        for converter in self.registry.geo_converters() {
            log::info!("Attempting converter '{}'", converter.description());
            if converter.can_read(path) {
                return converter.convert_to_mesh(path);
            }
        }
        Err(ConvertError::NoConverter(path.display().to_string()))
    }

    /// Write a mesh through the geometry converter matching the target's
    /// extension.
    pub fn export_mesh(&self, mesh: &Mesh, target: &Path) -> Result<()> {
        let ext = file_ext(target);
        let Some(converter) = self.registry.geo_converter_for_ext(&ext, true) else {
            return Err(ConvertError::NoConverter(format!("unknown mesh format {ext}")));
        };
        converter.convert_to_native(mesh, target)
    }

    /// Copy a container and attach a mesh file as a geometry block.
    pub fn add_mesh(&self, container_src: &Path, mesh_file: &Path, out: &Path) -> Result<()> {
        let mut mesh = self.load_mesh(mesh_file)?;
        if mesh.normals.is_empty() {
            mesh.recompute_normals();
        }
        std::fs::copy(container_src, out)?;
        let result = container::append_blocks(
            out,
            &[(container::BlockType::Geometry, container::encode_geometry(&mesh))],
        );
        if result.is_err() {
            remove_best_effort(out);
        }
        result
    }
}

/// Expand interleaved 3-component voxels to 4 components, appending a
/// fully opaque alpha sample of the stack's kind.
fn promote_rgb_to_rgba(data: &[u8], kind: NumericKind) -> Result<Vec<u8>> {
    let width = kind.byte_width();
    let alpha: Vec<u8> = dispatch_kind!(kind, T => {
        let max = if kind.is_float() { T::from_f64(1.0) } else { T::from_f64(T::MAX_F64) };
        bytemuck::bytes_of(&max).to_vec()
    })?;
    let voxel = 3 * width;
    let mut out = Vec::with_capacity(data.len() / 3 * 4);
    for rgb in data.chunks_exact(voxel) {
        out.extend_from_slice(rgb);
        out.extend_from_slice(&alpha);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawconv::write_raw_samples;
    use crate::registry::VolumeConverter;

    fn write_bov(dir: &Path, stem: &str, samples: &[u8], domain: [u64; 3]) -> PathBuf {
        let raw = dir.join(format!("{stem}.raw"));
        write_raw_samples(&raw, samples).unwrap();
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

    #[test]
    fn foreign_to_container_round_trip_preserves_voxels() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let data: Vec<u8> = (0..64).map(|i| (i * 3) as u8).collect();
        let bov = write_bov(dir.path(), "cube", &data, [4, 4, 4]);

        let container = dir.path().join("cube.bvf");
        pipeline
            .convert_file(&bov, &container, dir.path(), true, 64, 2, false)
            .unwrap();

        // and back out again
        let back = dir.path().join("back.bov");
        pipeline
            .convert_file(&container, &back, dir.path(), true, 64, 2, false)
            .unwrap();

        let info = parse_back(&back);
        assert_eq!(info.0, [4, 4, 4]);
        assert_eq!(std::fs::read(dir.path().join("back.raw")).unwrap(), data);
    }

    fn parse_back(bov: &Path) -> ([u64; 3], NumericKind) {
        let raw = crate::formats::BovConverter
            .convert_to_raw(bov, bov.parent().unwrap(), true)
            .unwrap();
        (raw.domain, raw.kind)
    }

    #[test]
    fn multi_file_to_foreign_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let a = write_bov(dir.path(), "a", &[0; 8], [2, 2, 2]);
        let b = write_bov(dir.path(), "b", &[0; 8], [2, 2, 2]);

        let err = pipeline
            .convert_files(
                &[a, b],
                &dir.path().join("out.bov"),
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
    fn stack_conversion_promotes_rgb_and_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();

        // two 2x2 RGB slices
        let mut elements = Vec::new();
        for slice in 0..2u8 {
            let path = dir.path().join(format!("slice{slice}.bin"));
            let pixels: Vec<u8> = (0..4).flat_map(|p| [slice, p as u8, 100]).collect();
            std::fs::write(&path, &pixels).unwrap();
            elements.push(StackElement { path, data_offset: 0, data_len: 12 });
        }
        let stack = StackDescriptor {
            format_tag: "IMAGE".into(),
            elements,
            slice_size: [2, 2],
            aspect: [1.0; 3],
            kind: NumericKind::U8,
            big_endian: false,
            components: 3,
            jpeg_encoded: false,
            description: "test stack".into(),
        };

        let target = dir.path().join("stack.bvf");
        pipeline.convert_stack(&stack, &target, dir.path(), 64, 2, false).unwrap();

        let mut ds = VolumeDataset::open(&target).unwrap();
        assert_eq!(ds.components(), 4);
        assert_eq!(ds.domain_size(0), [2, 2, 2]);
        let brick = ds.read_brick::<u8>(0, 0).unwrap();
        // first voxel of first slice: rgb (0,0,100) + opaque alpha
        assert_eq!(&brick[0..4], &[0, 0, 100, 255]);
        assert_eq!(brick.len(), 2 * 2 * 2 * 4);
    }

    #[test]
    fn jpeg_stacks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let stack = StackDescriptor {
            format_tag: "DICOM".into(),
            elements: vec![StackElement {
                path: dir.path().join("x.dcm"),
                data_offset: 0,
                data_len: 0,
            }],
            slice_size: [2, 2],
            aspect: [1.0; 3],
            kind: NumericKind::U8,
            big_endian: false,
            components: 1,
            jpeg_encoded: true,
            description: String::new(),
        };
        assert!(
            pipeline
                .convert_stack(&stack, &dir.path().join("x.bvf"), dir.path(), 64, 2, false)
                .is_err()
        );
    }

    #[test]
    fn analyze_answers_for_foreign_and_container() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let data: Vec<u8> = (10..74).collect();
        let bov = write_bov(dir.path(), "cube", &data, [4, 4, 4]);

        let info = pipeline.analyze(&bov, dir.path()).unwrap();
        assert_eq!(info.range, (10.0, 73.0));

        let container = dir.path().join("cube.bvf");
        pipeline.convert_file(&bov, &container, dir.path(), true, 64, 2, false).unwrap();
        let info = pipeline.analyze(&container, dir.path()).unwrap();
        assert_eq!(info.range, (10.0, 73.0));
        assert_eq!(info.domain, [4, 4, 4]);
    }

    #[test]
    fn rebrick_changes_brick_layout() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::with_builtin_formats();
        let data: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        let bov = write_bov(dir.path(), "vol", &data, [8, 8, 8]);

        let container = dir.path().join("vol.bvf");
        pipeline.convert_file(&bov, &container, dir.path(), true, 256, 4, false).unwrap();

        let rebricked = dir.path().join("vol_rebricked.bvf");
        pipeline.rebrick(&container, &rebricked, dir.path(), 36, 4, false).unwrap();

        let mut ds = VolumeDataset::open(&rebricked).unwrap();
        assert_eq!(ds.metadata().max_brick, 36);
        let exported = dir.path().join("check.raw");
        ds.export_lod(0, &exported).unwrap();
        assert_eq!(std::fs::read(&exported).unwrap(), data);
    }

    #[test]
    fn brick_parameter_setters_validate() {
        let mut pipeline = ConversionPipeline::with_builtin_formats();
        assert!(pipeline.set_brick_overlap(8));
        assert!(!pipeline.set_max_brick_size(8));
        assert!(pipeline.set_max_brick_size(128));
        assert!(!pipeline.set_brick_overlap(128));
    }
}
