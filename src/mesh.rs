use crate::geometry::{Aabb, Point3D, Triangle, Vector3D};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("Failed to load mesh: {0}")]
    Load(String),

    #[error("Empty mesh")]
    EmptyMesh,
}

/// Triangle soup with a cached bounding box. The voxelizer is its only
/// real consumer: it needs the triangles, the bounds, and a translation
/// into the grid's positive octant.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub triangles: Vec<Triangle>,
    bounds: Aabb,
}

impl Mesh {
    pub fn new(triangles: Vec<Triangle>) -> Result<Self, MeshError> {
        if triangles.is_empty() {
            return Err(MeshError::EmptyMesh);
        }

        let mut bounds = Aabb::empty();
        for tri in &triangles {
            bounds.merge(&tri.bbox());
        }

        Ok(Self { triangles, bounds })
    }

    /// Load a triangle soup from an STL file
    pub fn from_stl<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        let mut file = std::fs::File::open(path).map_err(|e| MeshError::Load(e.to_string()))?;
        let stl = stl_io::read_stl(&mut file).map_err(|e| MeshError::Load(e.to_string()))?;

        let point = |vi: usize| {
            let v = &stl.vertices[vi];
            Point3D::new(v[0] as f64, v[1] as f64, v[2] as f64)
        };

        let triangles = stl
            .faces
            .iter()
            .map(|face| {
                let [a, b, c] = face.vertices;
                Triangle::new(point(a), point(b), point(c))
            })
            .collect();

        Self::new(triangles)
    }

    pub fn bbox(&self) -> Aabb {
        self.bounds
    }

    /// Move the soup, typically so its bbox min lands on the origin
    /// before voxelization
    pub fn translate(&mut self, offset: Vector3D) {
        for tri in &mut self.triangles {
            tri.v0 += offset;
            tri.v1 += offset;
            tri.v2 += offset;
        }
        self.bounds.min += offset;
        self.bounds.max += offset;
    }

    pub fn dimensions(&self) -> Vector3D {
        self.bounds.sizes()
    }

    /// Enclosed volume by the divergence theorem. Meaningful for closed
    /// soups, which is what the synthetic shapes and datasets provide.
    pub fn volume(&self) -> f64 {
        self.triangles
            .iter()
            .map(|tri| tri.v0.coords.dot(&tri.v1.coords.cross(&tri.v2.coords)) / 6.0)
            .sum::<f64>()
            .abs()
    }

    pub fn num_triangles(&self) -> usize {
        self.triangles.len()
    }
}

/// Axis-aligned box meshes used by synthetic test shapes and demos.
pub fn box_mesh(min: Point3D, max: Point3D) -> Mesh {
    let p = |x: f64, y: f64, z: f64| Point3D::new(x, y, z);
    let (a, b) = (min, max);
    let corners = [
        p(a.x, a.y, a.z), p(b.x, a.y, a.z), p(b.x, b.y, a.z), p(a.x, b.y, a.z),
        p(a.x, a.y, b.z), p(b.x, a.y, b.z), p(b.x, b.y, b.z), p(a.x, b.y, b.z),
    ];
    // Two triangles per face, outward winding
    let faces: [[usize; 4]; 6] = [
        [0, 3, 2, 1], // bottom
        [4, 5, 6, 7], // top
        [0, 1, 5, 4], // front
        [2, 3, 7, 6], // back
        [1, 2, 6, 5], // right
        [3, 0, 4, 7], // left
    ];

    let mut triangles = Vec::with_capacity(12);
    for f in faces {
        triangles.push(Triangle::new(corners[f[0]], corners[f[1]], corners[f[2]]));
        triangles.push(Triangle::new(corners[f[0]], corners[f[2]], corners[f[3]]));
    }

    Mesh::new(triangles).expect("box mesh is non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel_grid::{VoxelGrid, VoxelizationConfig};

    #[test]
    fn test_empty_soup_is_rejected() {
        assert!(matches!(Mesh::new(Vec::new()), Err(MeshError::EmptyMesh)));
    }

    #[test]
    fn test_box_mesh_is_closed_and_outward() {
        let mesh = box_mesh(Point3D::new(1.0, 2.0, 3.0), Point3D::new(3.0, 5.0, 4.0));
        assert_eq!(mesh.num_triangles(), 12);
        assert!((mesh.volume() - 6.0).abs() < 1e-9, "volume {}", mesh.volume());

        // Outward winding: every face normal points away from the center
        let center = mesh.bbox().center();
        for tri in &mesh.triangles {
            let outward = tri.centroid() - center;
            assert!(tri.normal().dot(&outward) > 0.0, "inward face at {:?}", tri.centroid());
        }
    }

    #[test]
    fn test_translate_into_grid_frame() {
        // The voxelizer moves the soup so its bbox min sits at the origin
        let mut mesh = box_mesh(Point3D::new(-2.0, 4.0, 1.0), Point3D::new(0.0, 6.0, 2.0));
        let volume = mesh.volume();

        let corner = mesh.bbox().min;
        mesh.translate(Point3D::origin() - corner);

        assert!((mesh.bbox().min - Point3D::origin()).norm() < 1e-12);
        assert!((mesh.dimensions() - Vector3D::new(2.0, 2.0, 1.0)).norm() < 1e-12);
        assert!((mesh.volume() - volume).abs() < 1e-9, "translation must not change volume");
    }

    #[test]
    fn test_box_mesh_voxelizes_solid() {
        let mesh = box_mesh(Point3D::origin(), Point3D::new(1.0, 1.0, 1.0));
        let grid = VoxelGrid::compute(
            &mesh,
            &VoxelizationConfig {
                gridsize: 8,
                solid: true,
                manifold_repair: false,
            },
        );

        // Occupied cells roughly fill the enclosed volume
        let filled = grid.data.len() as f64 * grid.unitlength.powi(3);
        assert!(
            filled > 0.5 * mesh.volume(),
            "filled {} vs volume {}",
            filled,
            mesh.volume()
        );
    }
}
