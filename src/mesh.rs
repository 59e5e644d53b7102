//! Triangle mesh produced by isosurface extraction and carried through the
//! geometry-converter capability.

/// Indexed triangle mesh in world coordinates. Normals and colors are
/// optional; when present they are per-vertex and parallel to `vertices`.
#[derive(Debug, Default, Clone)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub colors: Vec<[f32; 4]>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Replace the normals with area-weighted per-vertex normals derived
    /// from the triangle faces.
    pub fn recompute_normals(&mut self) {
        self.normals = vec![[0.0; 3]; self.vertices.len()];
        for tri in self.indices.chunks_exact(3) {
            let [a, b, c] = [
                self.vertices[tri[0] as usize],
                self.vertices[tri[1] as usize],
                self.vertices[tri[2] as usize],
            ];
            let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
            let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
            // cross product, unnormalized so larger faces weigh more
            let n = [
                u[1] * v[2] - u[2] * v[1],
                u[2] * v[0] - u[0] * v[2],
                u[0] * v[1] - u[1] * v[0],
            ];
            for &i in tri {
                let dst = &mut self.normals[i as usize];
                dst[0] += n[0];
                dst[1] += n[1];
                dst[2] += n[2];
            }
        }
        for n in &mut self.normals {
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            if len > 0.0 {
                n[0] /= len;
                n[1] /= len;
                n[2] /= len;
            }
        }
    }
}
