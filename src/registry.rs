//! Converter capabilities and the ordered format registry.
//!
//! A [`VolumeConverter`] wraps one third-party volume format; a
//! [`GeometryConverter`] wraps one mesh format. The registry holds them in
//! registration order, which defines the trial priority everywhere a file
//! could be claimed by more than one format.

use crate::error::{ConvertError, Result};
use crate::mesh::Mesh;
use crate::numeric::NumericKind;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Meaning of the stored element, carried through conversion untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementSemantic {
    #[default]
    Undefined,
    Scalar,
    Color,
}

/// Description of a raw (headerless or header-skipped) volume stream, as
/// produced by [`VolumeConverter::convert_to_raw`] and consumed by the
/// RAW-to-container stage.
#[derive(Debug, Clone)]
pub struct RawVolume {
    pub path: PathBuf,
    /// Bytes to skip before sample data starts.
    pub header_skip: u64,
    pub kind: NumericKind,
    pub components: u64,
    /// True when the stream's byte order differs from the host's.
    pub endian_mismatch: bool,
    pub domain: [u64; 3],
    pub aspect: [f32; 3],
    pub title: String,
    pub semantic: ElementSemantic,
    /// True when `path` is a temp file the consumer must delete.
    pub owns_temp: bool,
}

/// Dataset statistics obtained without materializing the whole volume.
#[derive(Debug, Clone)]
pub struct RangeInfo {
    pub range: (f64, f64),
    pub kind: NumericKind,
    pub domain: [u64; 3],
    pub aspect: [f32; 3],
}

/// Brick-size/overlap parameterization for container-producing conversions.
#[derive(Debug, Clone, Copy)]
pub struct BrickingOptions {
    pub max_brick: u64,
    pub overlap: u64,
    pub quantize_to_8bit: bool,
    pub no_interaction: bool,
}

impl Default for BrickingOptions {
    fn default() -> Self {
        BrickingOptions {
            max_brick: crate::container::DEFAULT_BRICK_SIZE,
            overlap: crate::container::DEFAULT_BRICK_OVERLAP,
            quantize_to_8bit: false,
            no_interaction: true,
        }
    }
}

/// Capability interface over one registered volume format.
pub trait VolumeConverter {
    fn description(&self) -> &str;

    /// Upper-case extensions this converter claims, without the dot.
    fn supported_ext(&self) -> &[&str];

    fn can_export(&self) -> bool {
        false
    }

    /// Sniff readability. `first_block` holds up to the first 512 bytes of
    /// the file, read once by the registry.
    fn can_read(&self, path: &Path, first_block: &[u8]) -> bool;

    /// Extract the payload into a raw stream in `temp_dir` (or point at the
    /// payload inside the source file via `header_skip`).
    fn convert_to_raw(&self, src: &Path, temp_dir: &Path, no_interaction: bool)
    -> Result<RawVolume>;

    /// Write a raw stream out in this converter's native format.
    fn convert_to_native(
        &self,
        raw: &RawVolume,
        dst: &Path,
        no_interaction: bool,
        quantize_to_8bit: bool,
    ) -> Result<()>;

    /// Convert source file(s) directly into the native container. The
    /// default goes through `convert_to_raw` and the shared RAW stage and
    /// handles a single source file; converters for multi-file formats
    /// override this.
    fn convert_to_container(
        &self,
        files: &[PathBuf],
        dst: &Path,
        temp_dir: &Path,
        opts: &BrickingOptions,
    ) -> Result<()> {
        let [src] = files else {
            return Err(ConvertError::Incompatible(format!(
                "{} converts one file at a time, got {}",
                self.description(),
                files.len()
            )));
        };
        let raw = self.convert_to_raw(src, temp_dir, opts.no_interaction)?;
        let result = crate::rawconv::convert_raw_dataset(&raw, dst, temp_dir, opts);
        if raw.owns_temp {
            crate::rawconv::remove_best_effort(&raw.path);
        }
        result
    }

    /// Compute dataset statistics without a full conversion.
    fn analyze(&self, path: &Path, temp_dir: &Path, no_interaction: bool) -> Result<RangeInfo>;
}

/// Capability interface over one registered mesh format.
pub trait GeometryConverter {
    fn description(&self) -> &str;

    /// Upper-case extensions this converter claims, without the dot.
    fn supported_ext(&self) -> &[&str];

    fn can_export(&self) -> bool {
        false
    }

    fn can_read(&self, path: &Path) -> bool {
        let ext = file_ext(path);
        self.supported_ext().iter().any(|e| e.eq_ignore_ascii_case(&ext))
    }

    fn convert_to_mesh(&self, path: &Path) -> Result<Mesh>;

    fn convert_to_native(&self, mesh: &Mesh, dst: &Path) -> Result<()>;
}

/// Upper-case extension of a path, empty string when there is none.
pub(crate) fn file_ext(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Ordered collection of converter capabilities plus one optional fallback
/// converter that is only consulted when no specific converter claims a
/// file.
#[derive(Default)]
pub struct FormatRegistry {
    converters: Vec<Box<dyn VolumeConverter>>,
    geo_converters: Vec<Box<dyn GeometryConverter>>,
    fallback: Option<Box<dyn VolumeConverter>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        FormatRegistry::default()
    }

    /// A registry preloaded with the reference formats shipped in-tree.
    pub fn with_builtin_formats() -> Self {
        let mut registry = FormatRegistry::new();
        registry.register_converter(Box::new(crate::formats::BovConverter));
        registry.register_geo_converter(Box::new(crate::formats::ObjGeoConverter));
        registry
    }

    pub fn register_converter(&mut self, converter: Box<dyn VolumeConverter>) {
        self.converters.push(converter);
    }

    pub fn register_geo_converter(&mut self, converter: Box<dyn GeometryConverter>) {
        self.geo_converters.push(converter);
    }

    pub fn register_fallback(&mut self, converter: Box<dyn VolumeConverter>) {
        self.fallback = Some(converter);
    }

    pub fn fallback(&self) -> Option<&dyn VolumeConverter> {
        self.fallback.as_deref()
    }

    pub fn converters(&self) -> impl Iterator<Item = &dyn VolumeConverter> {
        self.converters.iter().map(Box::as_ref)
    }

    pub fn geo_converters(&self) -> impl Iterator<Item = &dyn GeometryConverter> {
        self.geo_converters.iter().map(Box::as_ref)
    }

    /// Ask every converter whether it can read `path`, based on one read of
    /// the file's first 512 bytes. Multiple positives are legal; the result
    /// preserves registration order and the caller arbitrates (first
    /// success wins downstream). An empty result means the caller must fall
    /// back to [`FormatRegistry::fallback`] or fail.
    pub fn identify_converters(&self, path: &Path) -> Result<Vec<&dyn VolumeConverter>> {
        let first_block = read_first_block(path)?;
        let mut claimers = Vec::new();
        for converter in self.converters() {
            log::info!("Attempting converter '{}'", converter.description());
            if converter.can_read(path, &first_block) {
                log::info!(
                    "Converter '{}' can read '{}'",
                    converter.description(),
                    path.display()
                );
                claimers.push(converter);
            }
        }
        Ok(claimers)
    }

    /// First registration-order converter declaring `ext`, optionally
    /// restricted to converters that can export.
    pub fn converter_for_ext(&self, ext: &str, must_export: bool) -> Option<&dyn VolumeConverter> {
        self.converters()
            .filter(|c| !must_export || c.can_export())
            .find(|c| c.supported_ext().iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    /// First registration-order geometry converter declaring `ext`,
    /// optionally restricted to converters that can export.
    pub fn geo_converter_for_ext(
        &self,
        ext: &str,
        must_export: bool,
    ) -> Option<&dyn GeometryConverter> {
        self.geo_converters()
            .filter(|c| !must_export || c.can_export())
            .find(|c| c.supported_ext().iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    /// `(extension, description)` pairs for every readable format,
    /// container first.
    pub fn import_format_list(&self) -> Vec<(String, String)> {
        let mut list = vec![(
            crate::container::CONTAINER_EXT.to_string(),
            "Bricked volume container".to_string(),
        )];
        for converter in self.converters() {
            for ext in converter.supported_ext() {
                list.push((ext.to_ascii_lowercase(), converter.description().to_string()));
            }
        }
        list
    }

    /// `(extension, description)` pairs for every writable format,
    /// container first.
    pub fn export_format_list(&self) -> Vec<(String, String)> {
        let mut list = vec![(
            crate::container::CONTAINER_EXT.to_string(),
            "Bricked volume container".to_string(),
        )];
        for converter in self.converters().filter(|c| c.can_export()) {
            for ext in converter.supported_ext() {
                list.push((ext.to_ascii_lowercase(), converter.description().to_string()));
            }
        }
        list
    }
}

/// Read up to the first 512 bytes of a file, once.
fn read_first_block(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut block = vec![0u8; 512];
    let mut filled = 0;
    while filled < block.len() {
        let n = file.read(&mut block[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    block.truncate(filled);
    Ok(block)
}
