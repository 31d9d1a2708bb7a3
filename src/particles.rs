// Particle mesh: one particle per occupied voxel cell
//
// Particles carry the per-cell descriptors the segmentation engine needs
// (flatness, local diameter, normalized distance to floor) and the
// adjacency graph used for Dijkstra fields and component splitting.

use crate::geometry::{centroid, covariance_spectrum, Aabb, Point3D, Vector3D};
use crate::mesh::Mesh;
use crate::morton::{morton_decode, morton_encode};
use crate::segment_graph::{BoundaryMeta, SegmentGraph};
use crate::voxel_grid::{VoxelGrid, VoxelizationConfig};
use crate::geometry::Plane;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticleFlag {
    None,
    Floor,
    Processed,
    Unprocessed,
}

#[derive(Debug, Clone)]
pub struct Particle {
    pub id: usize,
    pub morton: u64,
    pub pos: Point3D,
    pub direction: Vector3D,
    /// Position mapped into unit coordinates of the shape bbox
    pub relative_pos: Vector3D,
    pub flag: ParticleFlag,
    pub segment: usize,
    /// Normalized distance to floor, in [0, 1]
    pub measure: f64,
    /// Local diameter estimate (world units)
    pub avg_diameter: f64,
    /// Flatness descriptor in [0, 1]
    pub flat: f64,
}

/// Edge weight modes for the particle adjacency graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphWeight {
    /// Squared Euclidean distance between particle centers
    Distance,
    /// Inverse of the sum of normalized local-diameter estimates
    Diameter,
}

#[derive(Debug, Clone)]
pub struct ParticleMesh {
    pub grid: VoxelGrid,
    pub particles: Vec<Particle>,
    morton_to_particle: HashMap<u64, usize>,
    /// Particle ids along a shortest path from the floor to the tip
    pub path_from_floor: Vec<usize>,
}

impl ParticleMesh {
    pub fn new(mesh: &Mesh, config: &VoxelizationConfig) -> ParticleMesh {
        let grid = VoxelGrid::compute(mesh, config);

        let mut particles = Vec::with_capacity(grid.data.len());
        let mut morton_to_particle = HashMap::with_capacity(grid.data.len());

        for voxel in &grid.data {
            let id = particles.len();
            morton_to_particle.insert(voxel.morton, id);
            particles.push(Particle {
                id,
                morton: voxel.morton,
                pos: grid.voxel_pos(voxel.morton),
                direction: Vector3D::new(0.0, 0.0, 1.0),
                relative_pos: Vector3D::zeros(),
                flag: ParticleFlag::None,
                segment: 0,
                measure: 0.0,
                avg_diameter: 0.0,
                flat: 0.0,
            });
        }

        let mut pm = ParticleMesh {
            grid,
            particles,
            morton_to_particle,
            path_from_floor: Vec::new(),
        };

        pm.compute_relative_positions();
        pm.compute_descriptors();
        pm.compute_distance_to_floor();

        log::info!("Particle mesh: {} particles", pm.particles.len());
        pm
    }

    pub fn bbox(&self) -> Aabb {
        Aabb::from_points(self.particles.iter().map(|p| &p.pos))
    }

    pub fn particle_by_morton(&self, morton: u64) -> Option<&Particle> {
        self.morton_to_particle.get(&morton).map(|&id| &self.particles[id])
    }

    fn compute_relative_positions(&mut self) {
        let bbox = self.bbox();
        for p in &mut self.particles {
            p.relative_pos = bbox.relative(&p.pos);
        }
    }

    /// Flatness and local-diameter descriptors from the covariance
    /// spectrum of the step-2 neighbourhood
    fn compute_descriptors(&mut self) {
        let unitlength = self.grid.unitlength;

        let descriptors: Vec<(f64, f64)> = (0..self.particles.len())
            .into_par_iter()
            .map(|pi| {
                let neigh = self.neighbourhood(pi, 2);
                let mut points: Vec<Point3D> = neigh.iter().map(|&n| self.particles[n].pos).collect();
                points.push(self.particles[pi].pos);

                let spectrum = covariance_spectrum(&points);
                let l1 = spectrum[0].max(1e-12);

                // Planar neighbourhoods score high, tubes and blobs low
                let flat = ((spectrum[1] - spectrum[2]) / l1).clamp(0.0, 1.0);

                // Local thickness from the weakest spread direction
                let n = points.len() as f64;
                let diameter = 2.0 * (spectrum[2] / n).sqrt() + unitlength;

                (flat, diameter)
            })
            .collect();

        for (p, (flat, diameter)) in self.particles.iter_mut().zip(descriptors) {
            p.flat = flat;
            p.avg_diameter = diameter;
        }
    }

    /// Normalized Dijkstra distance from the floor cells (grid z <= 1).
    /// Also keeps a shortest path from the floor to the farthest tip.
    fn compute_distance_to_floor(&mut self) {
        let mut sources = Vec::new();
        for p in &mut self.particles {
            let (_, _, z) = morton_decode(p.morton);
            if z > 1 {
                continue;
            }
            p.flag = ParticleFlag::Floor;
            sources.push(p.id as u32);
        }

        if sources.is_empty() {
            return;
        }

        let graph = self.to_graph(GraphWeight::Distance);
        let sp = graph.dijkstra_many(sources);

        let finite: Vec<f64> = sp.distance.values().copied().filter(|d| d.is_finite()).collect();
        let min_val = finite.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_val = finite.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let range = (max_val - min_val).max(1e-12);

        for p in &mut self.particles {
            let d = sp.distance_to(p.id as u32);
            p.measure = if d.is_finite() { (d - min_val) / range } else { 1.0 };
        }

        if let Some((tip, _)) = sp.farthest() {
            self.path_from_floor = sp.path_to(tip).into_iter().map(|v| v as usize).collect();
        }
    }

    /// Build the adjacency graph: each particle connects to its occupied
    /// Morton 6-neighbours.
    pub fn to_graph(&self, weight: GraphWeight) -> SegmentGraph {
        let mut graph = SegmentGraph::new();
        let mut eidx = 0usize;

        // Diameter weights are normalized over the whole shape
        let (min_d, range_d) = match weight {
            GraphWeight::Diameter => {
                let min = self.particles.iter().map(|p| p.avg_diameter).fold(f64::INFINITY, f64::min);
                let max = self
                    .particles
                    .iter()
                    .map(|p| p.avg_diameter)
                    .fold(f64::NEG_INFINITY, f64::max);
                (min, (max - min).max(1e-12))
            }
            GraphWeight::Distance => (0.0, 1.0),
        };

        for p in &self.particles {
            graph.add_vertex(p.id as u32);
            for m in self.grid.neighbours6(p.morton) {
                let other = self.morton_to_particle[&m];
                let edge_weight = match weight {
                    GraphWeight::Distance => (p.pos - self.particles[other].pos).norm_squared(),
                    GraphWeight::Diameter => {
                        let w1 = (p.avg_diameter - min_d) / range_d;
                        let w2 = (self.particles[other].avg_diameter - min_d) / range_d;
                        1.0 / (w1 + w2).max(1e-9)
                    }
                };
                graph.add_edge(p.id as u32, other as u32, edge_weight, eidx);
                eidx += 1;
            }
        }

        graph
    }

    /// Average geodesic distance per particle, normalized to [0, 1].
    /// Runs one Dijkstra per start point, in parallel.
    pub fn agd(&self, num_start_points: usize) -> Vec<f64> {
        let graph = self.to_graph(GraphWeight::Distance);

        let starts: Vec<u32> = if num_start_points == 0 || num_start_points >= self.particles.len() {
            (0..self.particles.len() as u32).collect()
        } else {
            // Deterministic spread: every k-th particle in Morton order
            let step = self.particles.len() / num_start_points;
            (0..num_start_points).map(|i| (i * step) as u32).collect()
        };

        let sums: Vec<f64> = starts
            .par_iter()
            .map(|&s| graph.dijkstra(s))
            .reduce_with(|a, b| {
                let mut merged = a;
                for (v, d) in b.distance {
                    *merged.distance.entry(v).or_insert(0.0) += d;
                }
                merged
            })
            .map(|acc| {
                (0..self.particles.len())
                    .map(|i| acc.distance_to(i as u32))
                    .collect()
            })
            .unwrap_or_else(|| vec![0.0; self.particles.len()]);

        let avg: Vec<f64> = sums.iter().map(|s| s / self.particles.len() as f64).collect();
        let min = avg.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = avg.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let range = (max - min).max(1e-12);

        avg.into_iter().map(|v| (v - min) / range).collect()
    }

    /// Particle ids within `step` grid cells (Euclidean), found by BFS
    /// through the 26-neighbourhood.
    pub fn neighbourhood(&self, particle: usize, step: i64) -> Vec<usize> {
        let p = &self.particles[particle];
        let (x0, y0, z0) = morton_decode(p.morton);
        let origin = (x0 as i64, y0 as i64, z0 as i64);

        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        visited.insert(particle);
        queue.push_back(particle);

        while let Some(current) = queue.pop_front() {
            let (x, y, z) = morton_decode(self.particles[current].morton);

            for du in -1i64..=1 {
                for dv in -1i64..=1 {
                    for dw in -1i64..=1 {
                        if du == 0 && dv == 0 && dw == 0 {
                            continue;
                        }
                        let (cx, cy, cz) = (x as i64 + du, y as i64 + dv, z as i64 + dw);
                        if !self.grid.in_bounds(cx, cy, cz) {
                            continue;
                        }

                        let m = morton_encode(cx as u32, cy as u32, cz as u32);
                        if !self.grid.is_occupied(m) {
                            continue;
                        }

                        let pid = self.morton_to_particle[&m];
                        let dx = cx - origin.0;
                        let dy = cy - origin.1;
                        let dz = cz - origin.2;
                        let dist = ((dx * dx + dy * dy + dz * dz) as f64).sqrt();

                        if dist <= step as f64 && visited.insert(pid) {
                            result.push(pid);
                            queue.push_back(pid);
                        }
                    }
                }
            }
        }

        result
    }

    /// Particles within `threshold` of a world point, closest first
    pub fn closest_particles(&self, point: &Point3D, threshold: f64) -> Vec<(f64, usize)> {
        let mut result: Vec<(f64, usize)> = self
            .particles
            .iter()
            .filter_map(|p| {
                let dist = (p.pos - point).norm();
                (dist <= threshold).then_some((dist, p.id))
            })
            .collect();
        result.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        result
    }

    pub fn positions(&self, vertices: impl IntoIterator<Item = u32>) -> Vec<Point3D> {
        vertices
            .into_iter()
            .map(|v| self.particles[v as usize].pos)
            .collect()
    }

    /// The eight voxel corners of every listed particle. Convex hulls of
    /// segments are built over corners so a single voxel has volume.
    pub fn corners(&self, vertices: impl IntoIterator<Item = u32>) -> Vec<Point3D> {
        let half = self.grid.unitlength / 2.0;
        let mut result = Vec::new();
        for v in vertices {
            let c = self.particles[v as usize].pos;
            for sx in [-1.0, 1.0] {
                for sy in [-1.0, 1.0] {
                    for sz in [-1.0, 1.0] {
                        result.push(Point3D::new(c.x + sx * half, c.y + sy * half, c.z + sz * half));
                    }
                }
            }
        }
        result
    }

    /// Partition the adjacency graph into connected components by cutting
    /// every edge whose endpoints carry different segment tags. Returns
    /// the components and the component-neighbourhood graph whose edges
    /// hold a fitted boundary plane when at least four particle edges
    /// cross the boundary.
    pub fn segment_to_components(&self, graph: &SegmentGraph) -> (Vec<SegmentGraph>, SegmentGraph) {
        let mut nei_graph = SegmentGraph::new();
        if graph.is_empty() {
            return (Vec::new(), nei_graph);
        }

        let mut cut = graph.clone();
        let mut cut_edges = Vec::new();

        for e in graph.edges() {
            let s1 = self.particles[e.a as usize].segment;
            let s2 = self.particles[e.b as usize].segment;
            if s1 != s2 {
                cut.remove_edge(e.a, e.b);
                cut_edges.push(e);
            }
        }

        let mut parts = cut.to_connected_parts();

        // Which component owns each particle, and which segment it came from
        let mut owner: HashMap<u32, usize> = HashMap::new();
        for (ci, part) in parts.iter().enumerate() {
            for v in part.vertices() {
                owner.insert(v, ci);
            }
        }
        for part in parts.iter_mut() {
            let first_v = part.vertices().next();
            if let Some(v) = first_v {
                part.sid = self.particles[v as usize].segment;
            }
        }

        // Group boundary edges by component pair (ordered so the
        // neighbour graph is built deterministically)
        let mut boundary: std::collections::BTreeMap<(usize, usize), Vec<(Point3D, Vector3D)>> =
            std::collections::BTreeMap::new();
        for e in &cut_edges {
            let ca = owner[&e.a];
            let cb = owner[&e.b];
            let key = (ca.min(cb), ca.max(cb));
            let pa = self.particles[e.a as usize].pos;
            let pb = self.particles[e.b as usize].pos;
            let center = Point3D::from((pa.coords + pb.coords) / 2.0);
            let direction = (pa - pb).normalize();
            boundary.entry(key).or_default().push((center, direction));
        }

        for (&(ca, cb), crossings) in &boundary {
            nei_graph.add_edge(ca as u32, cb as u32, crossings.len() as f64, 0);

            // First crossing as a fallback estimate
            let (mut center, mut normal) = crossings[0];

            if crossings.len() > 3 {
                let midpoints: Vec<Point3D> = crossings.iter().map(|&(c, _)| c).collect();
                if let Some(plane) = Plane::fit(&midpoints) {
                    center = plane.point;
                    normal = plane.normal;
                }
            }

            nei_graph.set_edge_meta(
                ca as u32,
                cb as u32,
                BoundaryMeta {
                    normal,
                    center,
                    crossing_count: crossings.len(),
                },
            );
        }

        (parts, nei_graph)
    }

    /// Majority-vote relabeling: every particle adopts the most common
    /// segment among its neighbours. Smooths ragged segment boundaries.
    pub fn shrink_smaller_clusters(&mut self) {
        let new_segments: Vec<usize> = (0..self.particles.len())
            .into_par_iter()
            .map(|pi| {
                let mut histogram: HashMap<usize, usize> = HashMap::new();
                *histogram.entry(self.particles[pi].segment).or_insert(0) += 1;
                for pj in self.neighbourhood(pi, 1) {
                    *histogram.entry(self.particles[pj].segment).or_insert(0) += 1;
                }

                histogram
                    .into_iter()
                    .max_by_key(|&(seg, count)| (count, std::cmp::Reverse(seg)))
                    .map(|(seg, _)| seg)
                    .unwrap_or(self.particles[pi].segment)
            })
            .collect();

        for (p, seg) in self.particles.iter_mut().zip(new_segments) {
            p.segment = seg;
        }
    }

    /// Centroid of a segment's particles
    pub fn segment_center(&self, segment: usize) -> Point3D {
        let points: Vec<Point3D> = self
            .particles
            .iter()
            .filter(|p| p.segment == segment)
            .map(|p| p.pos)
            .collect();
        centroid(&points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point3D;
    use crate::mesh::box_mesh;

    fn small_particle_mesh() -> ParticleMesh {
        let mesh = box_mesh(Point3D::origin(), Point3D::new(1.0, 1.0, 1.0));
        ParticleMesh::new(
            &mesh,
            &VoxelizationConfig {
                gridsize: 8,
                solid: true,
                manifold_repair: false,
            },
        )
    }

    #[test]
    fn test_morton_to_particle_is_injective() {
        let pm = small_particle_mesh();
        let mut seen = HashSet::new();
        for p in &pm.particles {
            assert!(seen.insert(p.morton), "duplicate morton code {}", p.morton);
            assert_eq!(pm.particle_by_morton(p.morton).unwrap().id, p.id);
        }
    }

    #[test]
    fn test_floor_particles_flagged() {
        let pm = small_particle_mesh();
        let floor_count = pm.particles.iter().filter(|p| p.flag == ParticleFlag::Floor).count();
        assert!(floor_count > 0);

        // Floor particles are the closest to the floor
        for p in &pm.particles {
            if p.flag == ParticleFlag::Floor {
                assert!(p.measure < 0.5, "floor particle with measure {}", p.measure);
            }
        }
    }

    #[test]
    fn test_graph_connects_neighbours() {
        let pm = small_particle_mesh();
        let graph = pm.to_graph(GraphWeight::Distance);

        assert_eq!(graph.vertex_count(), pm.particles.len());
        assert!(!graph.edges().is_empty());

        // Edge weights are squared unit length
        let expected = pm.grid.unitlength * pm.grid.unitlength;
        for e in graph.edges() {
            assert!((e.weight - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_segment_to_components_split() {
        let mut pm = small_particle_mesh();

        // Tag the top half as a second segment
        let mid = pm.bbox().center().z;
        for p in &mut pm.particles {
            p.segment = if p.pos.z > mid { 1 } else { 0 };
        }

        let graph = pm.to_graph(GraphWeight::Distance);
        let (parts, nei) = pm.segment_to_components(&graph);

        assert_eq!(parts.len(), 2);
        let sids: HashSet<usize> = parts.iter().map(|p| p.sid).collect();
        assert_eq!(sids, HashSet::from([0, 1]));

        // One boundary with a near-vertical normal
        assert_eq!(nei.edges().len(), 1);
        let e = nei.edges()[0];
        let meta = nei.edge_meta(e.a, e.b).unwrap();
        assert!(meta.crossing_count >= 4);
        assert!(meta.normal.z.abs() > 0.9, "boundary normal {:?}", meta.normal);
    }

    #[test]
    fn test_agd_normalized() {
        let pm = small_particle_mesh();
        let agd = pm.agd(8);

        assert_eq!(agd.len(), pm.particles.len());
        let min = agd.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = agd.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(min.abs() < 1e-12);
        assert!((max - 1.0).abs() < 1e-12);

        // Central particles sit closer to everything than corner ones
        let center = pm.bbox().center();
        let central = pm.closest_particles(&center, pm.grid.unitlength * 2.0)[0].1;
        assert!(agd[central] < 0.5, "central agd {}", agd[central]);
    }

    #[test]
    fn test_neighbourhood_radius() {
        let pm = small_particle_mesh();
        let center = pm
            .particles
            .iter()
            .min_by(|a, b| {
                let ca = (a.pos - pm.bbox().center()).norm();
                let cb = (b.pos - pm.bbox().center()).norm();
                ca.partial_cmp(&cb).unwrap()
            })
            .unwrap()
            .id;

        let n1 = pm.neighbourhood(center, 1).len();
        let n2 = pm.neighbourhood(center, 2).len();
        assert!(n1 > 0);
        assert!(n2 > n1);
    }
}
