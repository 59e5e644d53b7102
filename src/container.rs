//! The native container format: a block-structured, self-describing file
//! holding one brick/LOD-addressed raster block plus optional accelerator
//! and geometry blocks.
//!
//! All scalars are stored little-endian; the global header records the
//! endianness and the checksum algorithm tag. Bricks are laid out in
//! ascending (LOD, z-major linear index) order, each brick covering its
//! core region plus `overlap` voxels on the high side, clamped at the
//! domain edge.

use crate::dispatch_kind;
use crate::error::{ConvertError, Result};
use crate::mesh::Mesh;
use crate::numeric::{NumericKind, Sample};

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const CONTAINER_EXT: &str = "bvf";
pub const DEFAULT_BRICK_SIZE: u64 = 256;
pub const DEFAULT_BRICK_OVERLAP: u64 = 4;

const MAGIC: &[u8; 4] = b"BVF1";
const ENDIAN_LITTLE: u8 = 0;
const CHECKSUM_NONE: u8 = 0;
/// magic + endianness flag + checksum tag; the u32 block count follows.
const BLOCK_COUNT_OFFSET: u64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Raster,
    MaxMin,
    Histogram1d,
    Histogram2d,
    Geometry,
}

impl BlockType {
    fn to_byte(self) -> u8 {
        match self {
            BlockType::Raster => 1,
            BlockType::MaxMin => 2,
            BlockType::Histogram1d => 3,
            BlockType::Histogram2d => 4,
            BlockType::Geometry => 5,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            1 => BlockType::Raster,
            2 => BlockType::MaxMin,
            3 => BlockType::Histogram1d,
            4 => BlockType::Histogram2d,
            5 => BlockType::Geometry,
            other => {
                return Err(ConvertError::Container(format!("unknown block type {other}")));
            }
        })
    }
}

/// One level of the resolution pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LodLevel {
    pub domain: [u64; 3],
    pub brick_count: [u64; 3],
}

/// Placement of one brick inside its LOD level, in voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrickGeometry {
    /// Position of the brick's first voxel in the level's domain.
    pub offset: [u64; 3],
    /// Extent owned exclusively by this brick.
    pub core: [u64; 3],
    /// Extent actually stored (core plus clamped high-side overlap).
    pub stored: [u64; 3],
}

impl BrickGeometry {
    pub fn stored_voxels(&self) -> u64 {
        self.stored[0] * self.stored[1] * self.stored[2]
    }
}

/// Structural description of a raster block; everything needed to address
/// bricks without touching payload data.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterMetadata {
    pub kind: NumericKind,
    pub components: u64,
    pub timesteps: u64,
    pub aspect: [f32; 3],
    pub max_brick: u64,
    pub overlap: u64,
    pub lods: Vec<LodLevel>,
}

impl RasterMetadata {
    /// Build the metadata for a level-0 domain, deriving the LOD pyramid by
    /// factor-2 reduction until a level fits in a single brick.
    pub fn new(
        kind: NumericKind,
        components: u64,
        domain: [u64; 3],
        aspect: [f32; 3],
        max_brick: u64,
        overlap: u64,
    ) -> Result<Self> {
        if max_brick <= overlap {
            return Err(ConvertError::Incompatible(format!(
                "brick size {max_brick} must exceed overlap {overlap}"
            )));
        }
        if domain.iter().any(|&d| d == 0) || components == 0 {
            return Err(ConvertError::Incompatible("empty volume domain".into()));
        }
        let core = max_brick - overlap;
        let mut lods = Vec::new();
        let mut level_domain = domain;
        loop {
            let brick_count = level_domain.map(|d| d.div_ceil(core));
            let single = brick_count.iter().all(|&c| c == 1);
            lods.push(LodLevel { domain: level_domain, brick_count });
            if single {
                break;
            }
            level_domain = level_domain.map(|d| (d / 2).max(1));
        }
        Ok(RasterMetadata { kind, components, timesteps: 1, aspect, max_brick, overlap, lods })
    }

    pub fn domain(&self) -> [u64; 3] {
        self.lods[0].domain
    }

    pub fn lod_count(&self) -> u64 {
        self.lods.len() as u64
    }

    pub fn valid_lod(&self, lod: u64) -> bool {
        lod < self.lod_count()
    }

    /// Bytes per voxel across all components.
    pub fn voxel_bytes(&self) -> u64 {
        self.components * self.kind.byte_width() as u64
    }

    pub fn brick_count_linear(&self, lod: u64) -> u64 {
        let c = self.lods[lod as usize].brick_count;
        c[0] * c[1] * c[2]
    }

    /// Decompose a flattened z-major brick index (x fastest) into 3D.
    pub fn brick_index_3d(&self, lod: u64, linear: u64) -> [u64; 3] {
        let c = self.lods[lod as usize].brick_count;
        let z = linear / (c[0] * c[1]);
        let rest = linear % (c[0] * c[1]);
        [rest % c[0], rest / c[0], z]
    }

    /// Structural validity query for a 3D brick index; never touches data.
    pub fn valid_brick_index(&self, lod: u64, index: [u64; 3]) -> bool {
        self.valid_lod(lod)
            && index
                .iter()
                .zip(self.lods[lod as usize].brick_count.iter())
                .all(|(i, c)| i < c)
    }

    pub fn brick_geometry(&self, lod: u64, index: [u64; 3]) -> BrickGeometry {
        let core = self.max_brick - self.overlap;
        let domain = self.lods[lod as usize].domain;
        let offset = index.map(|i| i * core);
        let mut geo = BrickGeometry { offset, core: [0; 3], stored: [0; 3] };
        for d in 0..3 {
            let remaining = domain[d] - offset[d];
            geo.core[d] = core.min(remaining);
            geo.stored[d] = (geo.core[d] + self.overlap).min(remaining);
        }
        geo
    }

    pub fn brick_byte_len(&self, lod: u64, index: [u64; 3]) -> u64 {
        self.brick_geometry(lod, index).stored_voxels() * self.voxel_bytes()
    }

    /// Offset of a brick's payload relative to the start of the brick data
    /// area, derived from the deterministic layout.
    pub fn brick_data_offset(&self, lod: u64, linear: u64) -> u64 {
        let mut offset = 0;
        for l in 0..lod {
            for b in 0..self.brick_count_linear(l) {
                offset += self.brick_byte_len(l, self.brick_index_3d(l, b));
            }
        }
        for b in 0..linear {
            offset += self.brick_byte_len(lod, self.brick_index_3d(lod, b));
        }
        offset
    }

    pub fn total_brick_bytes(&self) -> u64 {
        let lods = self.lod_count();
        self.brick_data_offset(lods - 1, self.brick_count_linear(lods - 1))
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.kind.bit_width());
        buf.push(self.kind.is_signed() as u8);
        buf.push(self.kind.is_float() as u8);
        put_u64(&mut buf, self.components);
        put_u64(&mut buf, self.timesteps);
        for a in self.aspect {
            buf.extend_from_slice(&a.to_le_bytes());
        }
        put_u64(&mut buf, self.max_brick);
        put_u64(&mut buf, self.overlap);
        put_u64(&mut buf, self.lod_count());
        for lod in &self.lods {
            for v in lod.domain {
                put_u64(&mut buf, v);
            }
            for v in lod.brick_count {
                put_u64(&mut buf, v);
            }
        }
        buf
    }

    fn decode(input: &mut &[u8]) -> Result<Self> {
        let kind = NumericKind::new(get_u8(input)?, get_u8(input)? != 0, get_u8(input)? != 0)?;
        let components = get_u64(input)?;
        let timesteps = get_u64(input)?;
        let aspect = [get_f32(input)?, get_f32(input)?, get_f32(input)?];
        let max_brick = get_u64(input)?;
        let overlap = get_u64(input)?;
        let lod_count = get_u64(input)?;
        let mut lods = Vec::with_capacity(lod_count as usize);
        for _ in 0..lod_count {
            let domain = [get_u64(input)?, get_u64(input)?, get_u64(input)?];
            let brick_count = [get_u64(input)?, get_u64(input)?, get_u64(input)?];
            lods.push(LodLevel { domain, brick_count });
        }
        if lods.is_empty() {
            return Err(ConvertError::Container("raster block without LOD levels".into()));
        }
        Ok(RasterMetadata { kind, components, timesteps, aspect, max_brick, overlap, lods })
    }
}

/// Directory entry of one block inside a container file.
#[derive(Debug, Clone, Copy)]
pub struct BlockEntry {
    pub block_type: BlockType,
    /// Absolute file offset of the payload.
    pub payload_offset: u64,
    pub payload_len: u64,
}

/// A parsed container file: the global header plus the block directory.
pub struct ContainerFile {
    pub path: PathBuf,
    pub blocks: Vec<BlockEntry>,
}

impl ContainerFile {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|_| ConvertError::OpenFailed(path.display().to_string()))?;
        let mut header = [0u8; 10];
        file.read_exact(&mut header)
            .map_err(|_| ConvertError::Container("truncated header".into()))?;
        if &header[0..4] != MAGIC {
            return Err(ConvertError::Container("bad magic".into()));
        }
        if header[4] != ENDIAN_LITTLE {
            return Err(ConvertError::Container("big-endian containers are not supported".into()));
        }
        // header[5] is the checksum algorithm tag; nothing to verify for None.
        let block_count = u32::from_le_bytes(header[6..10].try_into().unwrap());

        let mut blocks = Vec::with_capacity(block_count as usize);
        let mut offset = header.len() as u64;
        for _ in 0..block_count {
            file.seek(SeekFrom::Start(offset))?;
            let mut block_header = [0u8; 9];
            file.read_exact(&mut block_header)
                .map_err(|_| ConvertError::Container("truncated block header".into()))?;
            let block_type = BlockType::from_byte(block_header[0])?;
            let payload_len = u64::from_le_bytes(block_header[1..9].try_into().unwrap());
            blocks.push(BlockEntry {
                block_type,
                payload_offset: offset + block_header.len() as u64,
                payload_len,
            });
            offset += block_header.len() as u64 + payload_len;
        }
        Ok(ContainerFile { path: path.to_path_buf(), blocks })
    }

    pub fn first_block(&self, block_type: BlockType) -> Option<&BlockEntry> {
        self.blocks.iter().find(|b| b.block_type == block_type)
    }

    pub fn read_payload(&self, entry: &BlockEntry) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.payload_offset))?;
        let mut payload = vec![0u8; entry.payload_len as usize];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }
}

/// Create a container at `path` holding a single raster block. Brick
/// payloads are pulled from `brick_source` in layout order so the data
/// never has to fit in memory at once.
pub fn write_raster_container(
    path: &Path,
    meta: &RasterMetadata,
    mut brick_source: impl FnMut(u64, u64) -> Result<Vec<u8>>,
) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&[ENDIAN_LITTLE, CHECKSUM_NONE])?;
    file.write_all(&1u32.to_le_bytes())?;

    let header = meta.encode();
    let payload_len = header.len() as u64 + meta.total_brick_bytes();
    file.write_all(&[BlockType::Raster.to_byte()])?;
    file.write_all(&payload_len.to_le_bytes())?;
    file.write_all(&header)?;

    for lod in 0..meta.lod_count() {
        for linear in 0..meta.brick_count_linear(lod) {
            let expected = meta.brick_byte_len(lod, meta.brick_index_3d(lod, linear));
            let bytes = brick_source(lod, linear)?;
            if bytes.len() as u64 != expected {
                return Err(ConvertError::Container(format!(
                    "brick ({lod},{linear}) produced {} bytes, layout expects {expected}",
                    bytes.len()
                )));
            }
            file.write_all(&bytes)?;
        }
    }
    file.flush()?;
    Ok(())
}

/// Append blocks to an existing container and patch the block count.
pub fn append_blocks(path: &Path, blocks: &[(BlockType, Vec<u8>)]) -> Result<()> {
    let existing = ContainerFile::open(path)?;
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::End(0))?;
    for (block_type, payload) in blocks {
        file.write_all(&[block_type.to_byte()])?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(payload)?;
    }
    let count = (existing.blocks.len() + blocks.len()) as u32;
    file.seek(SeekFrom::Start(BLOCK_COUNT_OFFSET))?;
    file.write_all(&count.to_le_bytes())?;
    file.flush()?;
    Ok(())
}

/// An opened container dataset: brick reads, range computation and LOD
/// export over the file's raster block.
pub struct VolumeDataset {
    path: PathBuf,
    file: File,
    meta: RasterMetadata,
    brick_data_start: u64,
    range: Option<(f64, f64)>,
}

impl VolumeDataset {
    pub fn open(path: &Path) -> Result<Self> {
        let container = ContainerFile::open(path)?;
        let raster = container
            .first_block(BlockType::Raster)
            .ok_or_else(|| ConvertError::Container("no raster block".into()))?;
        let payload = {
            let mut file = File::open(path)?;
            file.seek(SeekFrom::Start(raster.payload_offset))?;
            // the metadata header is small; bricks are read on demand
            let mut head = vec![0u8; (raster.payload_len as usize).min(64 * 1024)];
            let mut filled = 0;
            while filled < head.len() {
                let n = file.read(&mut head[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            head.truncate(filled);
            head
        };
        let mut cursor = payload.as_slice();
        let meta = RasterMetadata::decode(&mut cursor)?;
        let header_len = payload.len() - cursor.len();
        let file = File::open(path)?;
        Ok(VolumeDataset {
            path: path.to_path_buf(),
            file,
            meta,
            brick_data_start: raster.payload_offset + header_len as u64,
            range: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &RasterMetadata {
        &self.meta
    }

    pub fn kind(&self) -> NumericKind {
        self.meta.kind
    }

    pub fn components(&self) -> u64 {
        self.meta.components
    }

    pub fn domain_size(&self, lod: u64) -> [u64; 3] {
        self.meta.lods[lod as usize].domain
    }

    pub fn read_brick_bytes(&mut self, lod: u64, linear: u64) -> Result<Vec<u8>> {
        let index = self.meta.brick_index_3d(lod, linear);
        if !self.meta.valid_brick_index(lod, index) {
            return Err(ConvertError::Container(format!("invalid brick index ({lod},{linear})")));
        }
        let offset = self.brick_data_start + self.meta.brick_data_offset(lod, linear);
        let len = self.meta.brick_byte_len(lod, index) as usize;
        let mut bytes = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Read a brick verbatim in its native sample type.
    pub fn read_brick<T: Sample>(&mut self, lod: u64, linear: u64) -> Result<Vec<T>> {
        if T::KIND != self.meta.kind {
            return Err(ConvertError::Incompatible(format!(
                "dataset stores {}, requested {}",
                self.meta.kind,
                T::KIND
            )));
        }
        let bytes = self.read_brick_bytes(lod, linear)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// Scan level 0 and cache the scalar value range.
    pub fn compute_range(&mut self) -> Result<(f64, f64)> {
        if let Some(range) = self.range {
            return Ok(range);
        }
        let kind = self.meta.kind;
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for linear in 0..self.meta.brick_count_linear(0) {
            let bytes = self.read_brick_bytes(0, linear)?;
            dispatch_kind!(kind, T => {
                for &v in bytemuck::cast_slice::<u8, T>(&bytes) {
                    let v = v.to_f64();
                    lo = lo.min(v);
                    hi = hi.max(v);
                }
            })?;
        }
        let range = (lo, hi);
        self.range = Some(range);
        Ok(range)
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        self.range
    }

    /// Write one LOD level to a headerless raw file, reconstructing the
    /// grid from brick core regions (the stored overlap is dropped).
    pub fn export_lod(&mut self, lod: u64, raw_path: &Path) -> Result<()> {
        self.export_lod_inner(lod, raw_path, &mut |_, _| Ok(()))
    }

    /// Brick-streaming export: identical to [`Self::export_lod`], but every
    /// brick's stored payload is also handed to `per_brick` before the core
    /// is written out. `staging` is the exporter's temporary raw file; the
    /// caller is responsible for removing it afterward.
    pub fn export_bricks(
        &mut self,
        lod: u64,
        staging: &Path,
        per_brick: &mut dyn FnMut(&[u8], BrickGeometry) -> Result<()>,
    ) -> Result<()> {
        self.export_lod_inner(lod, staging, per_brick)
    }

    fn export_lod_inner(
        &mut self,
        lod: u64,
        raw_path: &Path,
        per_brick: &mut dyn FnMut(&[u8], BrickGeometry) -> Result<()>,
    ) -> Result<()> {
        if !self.meta.valid_lod(lod) {
            return Err(ConvertError::Container(format!("invalid LOD level {lod}")));
        }
        let domain = self.meta.lods[lod as usize].domain;
        let voxel = self.meta.voxel_bytes();
        let mut out = File::create(raw_path)?;
        out.set_len(domain[0] * domain[1] * domain[2] * voxel)?;

        for linear in 0..self.meta.brick_count_linear(lod) {
            let index = self.meta.brick_index_3d(lod, linear);
            let geo = self.meta.brick_geometry(lod, index);
            let bytes = self.read_brick_bytes(lod, linear)?;
            per_brick(&bytes, geo)?;

            let row_bytes = (geo.core[0] * voxel) as usize;
            let stored_row = (geo.stored[0] * voxel) as usize;
            for z in 0..geo.core[2] {
                for y in 0..geo.core[1] {
                    let src = ((z * geo.stored[1] + y) * geo.stored[0] * voxel) as usize;
                    let dst = ((geo.offset[2] + z) * domain[1] * domain[0]
                        + (geo.offset[1] + y) * domain[0]
                        + geo.offset[0])
                        * voxel;
                    out.seek(SeekFrom::Start(dst))?;
                    out.write_all(&bytes[src..src + row_bytes.min(stored_row)])?;
                }
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// A raster block under incremental construction, backed by a temporary
/// raw file. Used by the expression engine to write output bricks before
/// the final container is assembled. The backing file is removed when the
/// value is dropped, on every exit path.
pub struct RasterOutputBlock {
    meta: RasterMetadata,
    temp_path: PathBuf,
    file: File,
}

impl RasterOutputBlock {
    pub fn create(meta: RasterMetadata, temp_path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.set_len(meta.total_brick_bytes())?;
        Ok(RasterOutputBlock { meta, temp_path, file })
    }

    pub fn metadata(&self) -> &RasterMetadata {
        &self.meta
    }

    pub fn write_brick(&mut self, lod: u64, linear: u64, bytes: &[u8]) -> Result<()> {
        let index = self.meta.brick_index_3d(lod, linear);
        let expected = self.meta.brick_byte_len(lod, index);
        if bytes.len() as u64 != expected {
            return Err(ConvertError::Container(format!(
                "brick ({lod},{linear}): got {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        self.file
            .seek(SeekFrom::Start(self.meta.brick_data_offset(lod, linear)))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Assemble a raster-only container at `dst` from the written bricks.
    /// Accelerator blocks are attached by the caller afterward.
    pub fn write_container(&mut self, dst: &Path) -> Result<()> {
        let meta = self.meta.clone();
        let file = &mut self.file;
        write_raster_container(dst, &meta, |lod, linear| {
            let index = meta.brick_index_3d(lod, linear);
            let len = meta.brick_byte_len(lod, index) as usize;
            let mut bytes = vec![0u8; len];
            file.seek(SeekFrom::Start(meta.brick_data_offset(lod, linear)))?;
            file.read_exact(&mut bytes)?;
            Ok(bytes)
        })
    }
}

impl Drop for RasterOutputBlock {
    fn drop(&mut self) {
        if std::fs::remove_file(&self.temp_path).is_err() && self.temp_path.exists() {
            log::warn!("Unable to remove temp file {}", self.temp_path.display());
        }
    }
}

/// Serialize a mesh into a geometry block payload.
pub fn encode_geometry(mesh: &Mesh) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u64(&mut buf, mesh.name.len() as u64);
    buf.extend_from_slice(mesh.name.as_bytes());
    put_u64(&mut buf, mesh.vertices.len() as u64);
    for v in &mesh.vertices {
        for c in v {
            buf.extend_from_slice(&c.to_le_bytes());
        }
    }
    put_u64(&mut buf, mesh.normals.len() as u64);
    for n in &mesh.normals {
        for c in n {
            buf.extend_from_slice(&c.to_le_bytes());
        }
    }
    put_u64(&mut buf, mesh.colors.len() as u64);
    for c in &mesh.colors {
        for v in c {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    put_u64(&mut buf, mesh.indices.len() as u64);
    for i in &mesh.indices {
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

/// Parse a geometry block payload back into a mesh.
pub fn decode_geometry(mut input: &[u8]) -> Result<Mesh> {
    let input = &mut input;
    let name_len = get_u64(input)? as usize;
    if input.len() < name_len {
        return Err(ConvertError::Container("truncated geometry block".into()));
    }
    let name = String::from_utf8_lossy(&input[..name_len]).into_owned();
    *input = &input[name_len..];

    let mut mesh = Mesh { name, ..Mesh::default() };
    for _ in 0..get_u64(input)? {
        mesh.vertices.push([get_f32(input)?, get_f32(input)?, get_f32(input)?]);
    }
    for _ in 0..get_u64(input)? {
        mesh.normals.push([get_f32(input)?, get_f32(input)?, get_f32(input)?]);
    }
    for _ in 0..get_u64(input)? {
        mesh.colors.push([get_f32(input)?, get_f32(input)?, get_f32(input)?, get_f32(input)?]);
    }
    for _ in 0..get_u64(input)? {
        mesh.indices.push(get_u32(input)?);
    }
    Ok(mesh)
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn get_u8(input: &mut &[u8]) -> Result<u8> {
    let (&first, rest) = input
        .split_first()
        .ok_or_else(|| ConvertError::Container("unexpected end of block".into()))?;
    *input = rest;
    Ok(first)
}

pub(crate) fn get_u32(input: &mut &[u8]) -> Result<u32> {
    let bytes = take(input, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

pub(crate) fn get_u64(input: &mut &[u8]) -> Result<u64> {
    let bytes = take(input, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

pub(crate) fn get_f32(input: &mut &[u8]) -> Result<f32> {
    let bytes = take(input, 4)?;
    Ok(f32::from_le_bytes(bytes.try_into().unwrap()))
}

pub(crate) fn get_f64(input: &mut &[u8]) -> Result<f64> {
    let bytes = take(input, 8)?;
    Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(ConvertError::Container("unexpected end of block".into()));
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}
