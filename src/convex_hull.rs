// Incremental 3D convex hull
//
// Used by the segmentation engine: segment solidity is voxel-summed volume
// over hull volume, and merge candidates are scored on the hull of the
// union. Input points are voxel corners, eight per particle, so even a
// single-particle segment has a well-defined hull.

use crate::geometry::{centroid, Point3D, Vector3D};

#[derive(Debug, Clone, Copy)]
struct Face {
    verts: [usize; 3],
    normal: Vector3D,
    offset: f64,
}

impl Face {
    fn new(points: &[Point3D], verts: [usize; 3], interior: &Point3D) -> Face {
        let (a, b, c) = (points[verts[0]], points[verts[1]], points[verts[2]]);
        let mut normal = (b - a).cross(&(c - a));
        let norm = normal.norm();
        if norm > 1e-20 {
            normal /= norm;
        }

        let mut face = Face {
            verts,
            normal,
            offset: normal.dot(&a.coords),
        };

        // Orient outward relative to a known interior point
        if face.normal.dot(&interior.coords) - face.offset > 0.0 {
            face.verts.swap(1, 2);
            face.normal = -face.normal;
            face.offset = -face.offset;
        }
        face
    }

    fn sees(&self, p: &Point3D, eps: f64) -> bool {
        self.normal.dot(&p.coords) - self.offset > eps
    }
}

#[derive(Debug, Clone)]
pub struct ConvexHull3 {
    /// Hull facets as index triples into `points`, outward winding
    pub faces: Vec<[usize; 3]>,
    pub points: Vec<Point3D>,
    pub center: Point3D,
    pub volume: f64,
    pub area: f64,
    /// Number of voxels the input corners came from
    pub in_points_count: usize,
}

impl ConvexHull3 {
    /// Hull of a voxel-corner cloud (eight corners per voxel).
    /// Degenerate input yields an empty hull with zero volume.
    pub fn from_points(input: &[Point3D]) -> ConvexHull3 {
        let in_points_count = input.len() / 8;
        match build_hull(input) {
            Some((points, faces)) => {
                let (volume, area) = measure(&points, &faces);
                let hull_vertices: Vec<Point3D> = {
                    let mut used: Vec<usize> = faces.iter().flatten().copied().collect();
                    used.sort_unstable();
                    used.dedup();
                    used.into_iter().map(|i| points[i]).collect()
                };

                ConvexHull3 {
                    center: centroid(&hull_vertices),
                    faces,
                    points,
                    volume,
                    area,
                    in_points_count,
                }
            }
            None => {
                log::debug!("degenerate convex hull input ({} points)", input.len());
                ConvexHull3 {
                    faces: Vec::new(),
                    points: input.to_vec(),
                    center: centroid(input),
                    volume: 0.0,
                    area: 0.0,
                    in_points_count,
                }
            }
        }
    }

    /// Voxel-summed volume over hull volume. Zero for degenerate hulls.
    pub fn solidity(&self, voxel_size: f64) -> f64 {
        if self.volume < 1e-20 {
            return 0.0;
        }
        let in_volume = voxel_size.powi(3) * self.in_points_count as f64;
        in_volume / self.volume
    }

    /// Hull of this hull's vertices together with another's.
    /// Voxel counts accumulate so solidity stays meaningful.
    pub fn merged(&self, other: &ConvexHull3) -> ConvexHull3 {
        let mut both: Vec<Point3D> = Vec::new();
        for &[a, b, c] in &self.faces {
            both.extend([self.points[a], self.points[b], self.points[c]]);
        }
        for &[a, b, c] in &other.faces {
            both.extend([other.points[a], other.points[b], other.points[c]]);
        }
        if both.is_empty() {
            both.extend_from_slice(&self.points);
            both.extend_from_slice(&other.points);
        }

        let mut combined = ConvexHull3::from_points(&both);
        combined.in_points_count = self.in_points_count + other.in_points_count;
        combined
    }
}

fn measure(points: &[Point3D], faces: &[[usize; 3]]) -> (f64, f64) {
    let mut volume = 0.0;
    let mut area = 0.0;
    for &[a, b, c] in faces {
        let (v0, v1, v2) = (points[a].coords, points[b].coords, points[c].coords);
        volume += v0.dot(&v1.cross(&v2)) / 6.0;
        area += (points[b] - points[a]).cross(&(points[c] - points[a])).norm() / 2.0;
    }
    (volume.abs(), area)
}

/// Incremental hull. Returns None when the input is degenerate
/// (fewer than four points or all coplanar).
fn build_hull(input: &[Point3D]) -> Option<(Vec<Point3D>, Vec<[usize; 3]>)> {
    if input.len() < 4 {
        return None;
    }

    let points: Vec<Point3D> = input.to_vec();
    let diag = crate::geometry::Aabb::from_points(&points).diagonal();
    let eps = (diag * 1e-9).max(1e-12);

    let simplex = initial_simplex(&points, eps)?;
    let interior = Point3D::from(
        (points[simplex[0]].coords
            + points[simplex[1]].coords
            + points[simplex[2]].coords
            + points[simplex[3]].coords)
            / 4.0,
    );

    let [s0, s1, s2, s3] = simplex;
    let mut faces = vec![
        Face::new(&points, [s0, s1, s2], &interior),
        Face::new(&points, [s0, s1, s3], &interior),
        Face::new(&points, [s0, s2, s3], &interior),
        Face::new(&points, [s1, s2, s3], &interior),
    ];

    for pi in 0..points.len() {
        if simplex.contains(&pi) {
            continue;
        }
        let p = points[pi];

        let visible: Vec<usize> = (0..faces.len()).filter(|&fi| faces[fi].sees(&p, eps)).collect();
        if visible.is_empty() {
            continue;
        }

        // Horizon: edges of visible faces used exactly once
        let mut edge_count: std::collections::HashMap<(usize, usize), (usize, usize)> =
            std::collections::HashMap::new();
        for &fi in &visible {
            let v = faces[fi].verts;
            for (a, b) in [(v[0], v[1]), (v[1], v[2]), (v[2], v[0])] {
                let key = (a.min(b), a.max(b));
                let entry = edge_count.entry(key).or_insert((0, a));
                entry.0 += 1;
                entry.1 = a; // keep winding of the last visible face
            }
        }

        let mut retained: Vec<Face> = faces
            .iter()
            .enumerate()
            .filter(|(fi, _)| !visible.contains(fi))
            .map(|(_, f)| *f)
            .collect();

        for (&(a, b), &(count, first)) in &edge_count {
            if count != 1 {
                continue;
            }
            // Preserve the visible face's winding so the new face points out
            let (ea, eb) = if first == a { (a, b) } else { (b, a) };
            retained.push(Face::new(&points, [ea, eb, pi], &interior));
        }

        faces = retained;
    }

    if faces.len() < 4 {
        return None;
    }

    Some((points, faces.into_iter().map(|f| f.verts).collect()))
}

/// Four affinely independent points: extreme pair, farthest from their
/// line, farthest from their plane.
fn initial_simplex(points: &[Point3D], eps: f64) -> Option<[usize; 4]> {
    let i0 = points
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.x.partial_cmp(&b.1.x).unwrap())
        .map(|(i, _)| i)?;

    let i1 = (0..points.len())
        .max_by(|&a, &b| {
            let da = (points[a] - points[i0]).norm();
            let db = (points[b] - points[i0]).norm();
            da.partial_cmp(&db).unwrap()
        })
        .filter(|&i| (points[i] - points[i0]).norm() > eps)?;

    let dir = (points[i1] - points[i0]).normalize();
    let line_dist = |i: usize| {
        let d = points[i] - points[i0];
        (d - dir * d.dot(&dir)).norm()
    };
    let i2 = (0..points.len())
        .max_by(|&a, &b| line_dist(a).partial_cmp(&line_dist(b)).unwrap())
        .filter(|&i| line_dist(i) > eps)?;

    let normal = (points[i1] - points[i0])
        .cross(&(points[i2] - points[i0]))
        .normalize();
    let plane_dist = |i: usize| (points[i] - points[i0]).dot(&normal).abs();
    let i3 = (0..points.len())
        .max_by(|&a, &b| plane_dist(a).partial_cmp(&plane_dist(b)).unwrap())
        .filter(|&i| plane_dist(i) > eps)?;

    Some([i0, i1, i2, i3])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_corners(min: Point3D, side: f64) -> Vec<Point3D> {
        let mut corners = Vec::new();
        for sx in [0.0, side] {
            for sy in [0.0, side] {
                for sz in [0.0, side] {
                    corners.push(Point3D::new(min.x + sx, min.y + sy, min.z + sz));
                }
            }
        }
        corners
    }

    #[test]
    fn test_unit_cube_hull() {
        let hull = ConvexHull3::from_points(&cube_corners(Point3D::origin(), 1.0));

        assert!((hull.volume - 1.0).abs() < 1e-9, "volume {}", hull.volume);
        assert!((hull.area - 6.0).abs() < 1e-9, "area {}", hull.area);
    }

    #[test]
    fn test_interior_points_ignored() {
        let mut points = cube_corners(Point3D::origin(), 2.0);
        points.push(Point3D::new(1.0, 1.0, 1.0));
        points.push(Point3D::new(0.5, 0.5, 0.5));

        let hull = ConvexHull3::from_points(&points);
        assert!((hull.volume - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_solidity_of_full_cube() {
        // One voxel of size 1: corners of a unit cube
        let hull = ConvexHull3::from_points(&cube_corners(Point3D::origin(), 1.0));
        assert_eq!(hull.in_points_count, 1);
        assert!((hull.solidity(1.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_input() {
        let flat = vec![
            Point3D::new(0.0, 0.0, 0.0),
            Point3D::new(1.0, 0.0, 0.0),
            Point3D::new(0.0, 1.0, 0.0),
            Point3D::new(1.0, 1.0, 0.0),
        ];
        let hull = ConvexHull3::from_points(&flat);
        assert_eq!(hull.volume, 0.0);
        assert_eq!(hull.solidity(1.0), 0.0);
    }

    #[test]
    fn test_merged_hull_spans_both() {
        let a = ConvexHull3::from_points(&cube_corners(Point3D::origin(), 1.0));
        let b = ConvexHull3::from_points(&cube_corners(Point3D::new(2.0, 0.0, 0.0), 1.0));

        let merged = a.merged(&b);
        assert_eq!(merged.in_points_count, 2);
        // Merged hull is the prism spanning both cubes
        assert!((merged.volume - 3.0).abs() < 1e-9, "volume {}", merged.volume);
    }
}
