//! # brickvol
//!
//! Conversion, merge and analysis engine for large volumetric datasets.
//!
//! Any registered source format is converted into a bricked, multi-LOD
//! container file that viewers can stream one brick at a time, and back
//! out into any registered target format. The engine never materializes a
//! whole volume in memory; every stage works through flat raw streams on
//! disk and fixed-size brick reads.
//!
//! On top of the conversion path the crate provides:
//!  - merging of datasets with per-input rescale transforms
//!    ([`MergeInput`], [`MergeMode`])
//!  - per-voxel arithmetic over whole datasets ([`ExpressionEvaluator`])
//!  - isosurface extraction to any registered mesh format
//!  - brick-level min/max and histogram acceleration blocks, attached to
//!    every produced container
//!
//! Formats are pluggable: implement [`VolumeConverter`] or
//! [`GeometryConverter`] and register it with the [`FormatRegistry`]. The
//! reference formats shipped in-tree are BOV ("brick of values", a text
//! header next to a raw file) and Wavefront OBJ for meshes.
//!
//! # Examples
//!
//! ## Converting a dataset and pulling an isosurface out of it
//!
//! ```no_run
//! # use brickvol::ConversionPipeline;
//! # use std::path::Path;
//! let pipeline = ConversionPipeline::with_builtin_formats();
//! pipeline
//!     .convert_file(
//!         Path::new("scan.bov"),
//!         Path::new("scan.bvf"),
//!         Path::new("/tmp"),
//!         true,
//!         256,
//!         4,
//!         false,
//!     )
//!     .expect("conversion should succeed");
//! pipeline
//!     .extract_isosurface(
//!         Path::new("scan.bvf"),
//!         0,
//!         1000.0,
//!         [1.0, 1.0, 1.0, 1.0],
//!         Path::new("bone.obj"),
//!         Path::new("/tmp"),
//!     )
//!     .expect("extraction should succeed");
//! ```
//!
//! ## Combining two aligned datasets
//!
//! ```no_run
//! # use brickvol::ExpressionEvaluator;
//! # use std::path::{Path, PathBuf};
//! let difference = ExpressionEvaluator::new("A - B").unwrap();
//! difference
//!     .evaluate(
//!         &[PathBuf::from("before.bvf"), PathBuf::from("after.bvf")],
//!         Path::new("change.bvf"),
//!         Path::new("/tmp"),
//!     )
//!     .expect("evaluation should succeed");
//! ```

pub mod accel;
pub mod container;
pub mod error;
pub mod expression;
pub mod formats;
mod isosurface;
pub mod mc_tables;
mod merge;
pub mod mesh;
pub mod numeric;
pub mod pipeline;
pub mod rawconv;
pub mod registry;

pub use container::{ContainerFile, RasterMetadata, VolumeDataset};
pub use error::{ConvertError, Result};
pub use expression::ExpressionEvaluator;
pub use merge::{MergeInput, MergeMode};
pub use mesh::Mesh;
pub use numeric::NumericKind;
pub use pipeline::{ConversionPipeline, StackDescriptor, StackElement};
pub use registry::{
    BrickingOptions, FormatRegistry, GeometryConverter, RangeInfo, RawVolume, VolumeConverter,
};
