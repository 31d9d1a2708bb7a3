// Solid voxelization of a triangle mesh
//
// Surface voxelization uses the Schwarz-Seidel triangle/box overlap test
// (plane-through-box test plus three 2D projection tests). An optional
// solid pass flood-fills the exterior from the grid walls and keeps the
// complement, and a manifold-repair pass carves cells where only diagonal
// paths connect a surface voxel to its empty corner neighbours.

use crate::geometry::{Aabb, Point3D, Vector3D};
use crate::mesh::Mesh;
use crate::morton::{morton_decode, morton_encode};
use nalgebra::Vector2;
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    Empty,
    Filled,
}

/// One occupied voxel cell
#[derive(Debug, Clone, Copy)]
pub struct VoxelData {
    pub morton: u64,
    /// True for cells on the object surface (vs. interior fill)
    pub is_outer: bool,
    pub normal: Vector3D,
}

/// Options for `VoxelGrid::compute`
#[derive(Debug, Clone)]
pub struct VoxelizationConfig {
    /// Cells along the longest axis of the cubic grid
    pub gridsize: usize,

    /// Flood-fill the interior after surface voxelization
    pub solid: bool,

    /// Carve diagonal leaks so the voxel boundary is manifold
    pub manifold_repair: bool,
}

impl Default for VoxelizationConfig {
    fn default() -> Self {
        Self {
            gridsize: 64,
            solid: true,
            manifold_repair: true,
        }
    }
}

/// Sparse cubic voxel grid produced from a triangle mesh
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    pub gridsize: usize,
    pub unitlength: f64,
    /// World offset of the grid origin (mesh bbox min)
    pub translation: Vector3D,
    /// Occupied cells, sorted by Morton code
    pub data: Vec<VoxelData>,
    /// Dense occupancy lookup indexed by Morton code
    occupied: Vec<bool>,
}

impl VoxelGrid {
    pub fn compute(mesh: &Mesh, config: &VoxelizationConfig) -> VoxelGrid {
        let gridsize = config.gridsize.max(2);

        // Move mesh so its bbox min is at the origin, then extend the
        // shorter axes into a cube
        let corner = mesh.bbox().min;
        let mut moved = mesh.clone();
        moved.translate(Point3D::origin() - corner);

        let cube = cube_bbox(&moved.bbox());
        let unitlength = (cube.max.x - cube.min.x) / gridsize as f64;

        log::info!(
            "Voxelizing: grid={}^3, unit={:.5}, {} triangles",
            gridsize,
            unitlength,
            moved.num_triangles()
        );

        let side = dense_side(gridsize);
        let mut cells = vec![Cell::Empty; side * side * side];
        let mut surface = BTreeSet::new();

        voxelize_schwarz(&moved, gridsize, unitlength, &mut cells, &mut surface);
        log::info!("  Surface voxels: {}", surface.len());

        let mut data = Vec::new();

        if config.solid {
            let exterior = flood_fill_exterior(&cells, gridsize);

            // Object = everything the outside flood never reached
            let mut object = vec![false; cells.len()];
            for x in 0..gridsize as u32 {
                for y in 0..gridsize as u32 {
                    for z in 0..gridsize as u32 {
                        let m = morton_encode(x, y, z) as usize;
                        object[m] = !exterior[m];
                    }
                }
            }

            if config.manifold_repair {
                repair_manifold(&mut object, &mut surface, gridsize);
            }

            for (m, _) in object.iter().enumerate().filter(|(_, &o)| o) {
                let m = m as u64;
                data.push(VoxelData {
                    morton: m,
                    is_outer: surface.contains(&m),
                    normal: Vector3D::zeros(),
                });
            }
        } else {
            for &m in &surface {
                data.push(VoxelData {
                    morton: m,
                    is_outer: true,
                    normal: Vector3D::zeros(),
                });
            }
        }

        data.sort_by_key(|v| v.morton);

        let mut occupied = vec![false; cells.len()];
        for v in &data {
            occupied[v.morton as usize] = true;
        }

        log::info!("  Occupied cells: {}", data.len());

        VoxelGrid {
            gridsize,
            unitlength,
            translation: corner.coords,
            data,
            occupied,
        }
    }

    /// World-space center of a voxel cell
    pub fn voxel_pos(&self, morton: u64) -> Point3D {
        let (x, y, z) = morton_decode(morton);
        let half = 0.5 * self.unitlength;
        Point3D::new(
            x as f64 * self.unitlength + half,
            y as f64 * self.unitlength + half,
            z as f64 * self.unitlength + half,
        ) + self.translation
    }

    pub fn is_occupied(&self, morton: u64) -> bool {
        self.occupied.get(morton as usize).copied().unwrap_or(false)
    }

    pub fn in_bounds(&self, x: i64, y: i64, z: i64) -> bool {
        let g = self.gridsize as i64;
        x >= 0 && y >= 0 && z >= 0 && x < g && y < g && z < g
    }

    /// Morton codes of the 6-connected occupied neighbours of a cell
    pub fn neighbours6(&self, morton: u64) -> Vec<u64> {
        let (x, y, z) = morton_decode(morton);
        let mut result = Vec::with_capacity(6);
        for (dx, dy, dz) in AXIS_STEPS {
            let (nx, ny, nz) = (x as i64 + dx, y as i64 + dy, z as i64 + dz);
            if !self.in_bounds(nx, ny, nz) {
                continue;
            }
            let m = morton_encode(nx as u32, ny as u32, nz as u32);
            if self.is_occupied(m) {
                result.push(m);
            }
        }
        result
    }
}

const AXIS_STEPS: [(i64, i64, i64); 6] = [
    (1, 0, 0),
    (-1, 0, 0),
    (0, 1, 0),
    (0, -1, 0),
    (0, 0, 1),
    (0, 0, -1),
];

// Morton codes are interleaved bits, so the dense lookup must span the
// next power of two per axis
fn dense_side(gridsize: usize) -> usize {
    gridsize.next_power_of_two()
}

/// Extend the shorter axes of a bbox so all three have the longest length
fn cube_bbox(bbox: &Aabb) -> Aabb {
    let lengths = bbox.sizes();
    let longest = lengths.x.max(lengths.y).max(lengths.z);

    let mut cube = *bbox;
    for i in 0..3 {
        let delta = longest - lengths[i];
        if delta != 0.0 {
            cube.min[i] -= delta / 2.0;
            cube.max[i] += delta / 2.0;
        }
    }
    cube
}

/// Schwarz-Seidel surface voxelization. Marks overlapped cells in `cells`
/// and records their Morton codes in `surface`.
fn voxelize_schwarz(
    mesh: &Mesh,
    gridsize: usize,
    unitlength: f64,
    cells: &mut [Cell],
    surface: &mut BTreeSet<u64>,
) {
    let unit_div = 1.0 / unitlength;
    let grid_max = gridsize as i64 - 1;

    for tri in &mesh.triangles {
        let t_bbox = tri.bbox();

        let clamp = |v: f64| -> i64 { ((v * unit_div) as i64).clamp(0, grid_max) };
        let lo = [clamp(t_bbox.min.x), clamp(t_bbox.min.y), clamp(t_bbox.min.z)];
        let hi = [clamp(t_bbox.max.x), clamp(t_bbox.max.y), clamp(t_bbox.max.z)];

        // Triangle edges and normal
        let e0 = tri.v1 - tri.v0;
        let e1 = tri.v2 - tri.v1;
        let e2 = tri.v0 - tri.v2;
        let n = tri.normal();

        // Plane test: critical point of a cell w.r.t. the triangle plane
        let mut c = Vector3D::zeros();
        for i in 0..3 {
            if n[i] > 0.0 {
                c[i] = unitlength;
            }
        }
        let delta_p = Vector3D::new(unitlength, unitlength, unitlength);
        let d1 = n.dot(&(c - tri.v0.coords));
        let d2 = n.dot(&((delta_p - c) - tri.v0.coords));

        // 2D projection tests on the XY, YZ and ZX planes
        let xy = projection_setup(&[e0, e1, e2], tri, 0, 1, n.z, unitlength);
        let yz = projection_setup(&[e0, e1, e2], tri, 1, 2, n.x, unitlength);
        let zx = projection_setup(&[e0, e1, e2], tri, 2, 0, n.y, unitlength);

        for x in lo[0]..=hi[0] {
            for y in lo[1]..=hi[1] {
                for z in lo[2]..=hi[2] {
                    let index = morton_encode(x as u32, y as u32, z as u32);
                    if cells[index as usize] == Cell::Filled {
                        continue;
                    }

                    let p = Vector3D::new(
                        x as f64 * unitlength,
                        y as f64 * unitlength,
                        z as f64 * unitlength,
                    );

                    // Plane through box
                    let n_dot_p = n.dot(&p);
                    if (n_dot_p + d1) * (n_dot_p + d2) > 0.0 {
                        continue;
                    }

                    if !projection_passes(&xy, Vector2::new(p.x, p.y))
                        || !projection_passes(&yz, Vector2::new(p.y, p.z))
                        || !projection_passes(&zx, Vector2::new(p.z, p.x))
                    {
                        continue;
                    }

                    cells[index as usize] = Cell::Filled;
                    surface.insert(index);
                }
            }
        }
    }
}

struct ProjectionTest {
    normals: [Vector2<f64>; 3],
    offsets: [f64; 3],
}

fn projection_setup(
    edges: &[Vector3D; 3],
    tri: &crate::geometry::Triangle,
    u: usize,
    v: usize,
    flip_sign: f64,
    unitlength: f64,
) -> ProjectionTest {
    let verts = [tri.v0, tri.v1, tri.v2];
    let mut normals = [Vector2::zeros(); 3];
    let mut offsets = [0.0; 3];

    for i in 0..3 {
        let mut ne = Vector2::new(-edges[i][v], edges[i][u]);
        if flip_sign < 0.0 {
            ne = -ne;
        }
        let vert = Vector2::new(verts[i][u], verts[i][v]);
        offsets[i] = -ne.dot(&vert)
            + (unitlength * ne.x).max(0.0)
            + (unitlength * ne.y).max(0.0);
        normals[i] = ne;
    }

    ProjectionTest { normals, offsets }
}

fn projection_passes(test: &ProjectionTest, p: Vector2<f64>) -> bool {
    (0..3).all(|i| test.normals[i].dot(&p) + test.offsets[i] >= 0.0)
}

/// Flood fill from every wall cell of the grid through empty cells.
/// Returns a dense exterior mask indexed by Morton code.
fn flood_fill_exterior(cells: &[Cell], gridsize: usize) -> Vec<bool> {
    let mut exterior = vec![false; cells.len()];
    let mut queue = VecDeque::new();

    let g = gridsize as u32;
    for u in 0..g {
        for v in 0..g {
            for m in [
                morton_encode(u, v, 0),
                morton_encode(u, v, g - 1),
                morton_encode(0, u, v),
                morton_encode(g - 1, u, v),
                morton_encode(v, 0, u),
                morton_encode(v, g - 1, u),
            ] {
                queue.push_back(m);
            }
        }
    }

    while let Some(m) = queue.pop_front() {
        let idx = m as usize;
        if exterior[idx] || cells[idx] == Cell::Filled {
            continue;
        }
        exterior[idx] = true;

        let (x, y, z) = morton_decode(m);
        for (dx, dy, dz) in AXIS_STEPS {
            let (nx, ny, nz) = (x as i64 + dx, y as i64 + dy, z as i64 + dz);
            if nx < 0 || ny < 0 || nz < 0 {
                continue;
            }
            if nx >= gridsize as i64 || ny >= gridsize as i64 || nz >= gridsize as i64 {
                continue;
            }
            queue.push_back(morton_encode(nx as u32, ny as u32, nz as u32));
        }
    }

    exterior
}

/// All shortest step-paths from a voxel to one of its 26 corner/edge
/// neighbours, expressed as the Morton codes of the intermediate cells.
/// Paths that leave the grid are dropped.
fn voxel_paths(center: (u32, u32, u32), corner: (i64, i64, i64), gridsize: usize) -> Vec<Vec<u64>> {
    let (cx, cy, cz) = (center.0 as i64, center.1 as i64, center.2 as i64);
    let (x, y, z) = corner;
    let sx = if x > cx { -1 } else { 1 };
    let sy = if y > cy { -1 } else { 1 };
    let sz = if z > cz { -1 } else { 1 };

    let mut paths: Vec<Vec<(i64, i64, i64)>> = Vec::new();

    if z == cz && x != cx && y != cy {
        // Face-diagonal in the XY plane
        paths.push(vec![(x + sx, y, z)]);
        paths.push(vec![(x, y + sy, z)]);
    } else if x == cx && y != cy && z != cz {
        paths.push(vec![(x, y + sy, z)]);
        paths.push(vec![(x, y, z + sz)]);
    } else if y == cy && x != cx && z != cz {
        paths.push(vec![(x + sx, y, z)]);
        paths.push(vec![(x, y, z + sz)]);
    } else if x != cx && y != cy && z != cz {
        // Full corner: six two-step routes
        paths.push(vec![(x, y + sy, z), (x, y + sy, z + sz)]);
        paths.push(vec![(x + sx, y, z), (x + sx, y, z + sz)]);
        paths.push(vec![(x, y, z + sz), (x, y + sy, z + sz)]);
        paths.push(vec![(x, y, z + sz), (x + sx, y, z + sz)]);
        paths.push(vec![(x, y + sy, z), (x + sx, y + sy, z)]);
        paths.push(vec![(x + sx, y, z), (x + sx, y + sy, z)]);
    }

    let g = gridsize as i64;
    paths
        .into_iter()
        .filter(|path| {
            path.iter()
                .all(|&(px, py, pz)| px >= 0 && py >= 0 && pz >= 0 && px < g && py < g && pz < g)
        })
        .map(|path| {
            path.into_iter()
                .map(|(px, py, pz)| morton_encode(px as u32, py as u32, pz as u32))
                .collect()
        })
        .collect()
}

/// Carve diagonal leaks: whenever no axis-aligned step path between a
/// surface voxel and an empty corner neighbour stays inside the object,
/// the intermediate steps are pulled into the object (as surface cells).
fn repair_manifold(object: &mut [bool], surface: &mut BTreeSet<u64>, gridsize: usize) {
    let g = gridsize as i64;
    let mut fixing = true;

    while fixing {
        fixing = false;

        for s in surface.clone() {
            let (x, y, z) = morton_decode(s);

            for du in -1i64..=1 {
                for dv in -1i64..=1 {
                    for dw in -1i64..=1 {
                        if du == 0 && dv == 0 && dw == 0 {
                            continue;
                        }
                        let (cx, cy, cz) = (x as i64 + du, y as i64 + dv, z as i64 + dw);
                        if cx < 0 || cy < 0 || cz < 0 || cx >= g || cy >= g || cz >= g {
                            continue;
                        }
                        let corner = morton_encode(cx as u32, cy as u32, cz as u32);
                        if !object[corner as usize] {
                            continue;
                        }

                        let paths = voxel_paths((x, y, z), (cx, cy, cz), gridsize);
                        if paths.is_empty() {
                            continue;
                        }

                        let clear = paths
                            .iter()
                            .filter(|path| path.iter().all(|&m| object[m as usize]))
                            .count();

                        if clear == 0 {
                            for path in &paths {
                                for &m in path {
                                    fixing = true;
                                    object[m as usize] = true;
                                    surface.insert(m);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::box_mesh;

    #[test]
    fn test_surface_voxelization_marks_cells() {
        let mesh = box_mesh(Point3D::origin(), Point3D::new(1.0, 1.0, 1.0));
        let grid = VoxelGrid::compute(
            &mesh,
            &VoxelizationConfig {
                gridsize: 8,
                solid: false,
                manifold_repair: false,
            },
        );

        assert!(!grid.data.is_empty());
        for v in &grid.data {
            assert!(v.is_outer);
            let (x, y, z) = morton_decode(v.morton);
            assert!(x < 8 && y < 8 && z < 8);
        }
    }

    #[test]
    fn test_solid_fill_includes_interior() {
        let mesh = box_mesh(Point3D::origin(), Point3D::new(1.0, 1.0, 1.0));

        let surface_only = VoxelGrid::compute(
            &mesh,
            &VoxelizationConfig {
                gridsize: 10,
                solid: false,
                manifold_repair: false,
            },
        );
        let solid = VoxelGrid::compute(
            &mesh,
            &VoxelizationConfig {
                gridsize: 10,
                solid: true,
                manifold_repair: false,
            },
        );

        assert!(solid.data.len() > surface_only.data.len());
        assert!(solid.data.iter().any(|v| !v.is_outer), "expected interior cells");
    }

    #[test]
    fn test_voxel_positions_inside_world_bbox() {
        let mesh = box_mesh(Point3D::new(5.0, 5.0, 5.0), Point3D::new(7.0, 6.0, 8.0));
        let grid = VoxelGrid::compute(&mesh, &VoxelizationConfig::default());

        let slack = grid.unitlength;
        for v in &grid.data {
            let p = grid.voxel_pos(v.morton);
            assert!(p.x > 5.0 - slack && p.x < 7.0 + slack);
            assert!(p.z > 5.0 - slack && p.z < 8.0 + slack);
        }
    }

    #[test]
    fn test_voxel_paths_corner_count() {
        // Interior corner has six two-step routes
        let paths = voxel_paths((5, 5, 5), (6, 6, 6), 16);
        assert_eq!(paths.len(), 6);
        for p in &paths {
            assert_eq!(p.len(), 2);
        }

        // Face diagonal has two one-step routes
        let paths = voxel_paths((5, 5, 5), (6, 6, 5), 16);
        assert_eq!(paths.len(), 2);
    }
}
