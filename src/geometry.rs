use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// 3D point type
pub type Point3D = Point3<f64>;

/// 3D vector type
pub type Vector3D = Vector3<f64>;

/// Triangle of a surface soup fed to the voxelizer
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Triangle {
    pub v0: Point3D,
    pub v1: Point3D,
    pub v2: Point3D,
}

impl Triangle {
    pub fn new(v0: Point3D, v1: Point3D, v2: Point3D) -> Self {
        Self { v0, v1, v2 }
    }

    /// Cross product of the two edges at v0. Zero for slivers; half its
    /// norm is the triangle area.
    fn edge_cross(&self) -> Vector3D {
        (self.v1 - self.v0).cross(&(self.v2 - self.v0))
    }

    /// Unit normal. Slivers fall back to Z-up so the voxelizer's plane
    /// test always has a direction to offset against.
    pub fn normal(&self) -> Vector3D {
        let cross = self.edge_cross();
        let norm = cross.norm();
        if !norm.is_finite() || norm < 1e-10 {
            return Vector3D::z();
        }
        cross / norm
    }

    pub fn area(&self) -> f64 {
        self.edge_cross().norm() / 2.0
    }

    pub fn centroid(&self) -> Point3D {
        centroid(&[self.v0, self.v1, self.v2])
    }

    /// Grid-aligned bounds, the candidate cell range of the overlap test
    pub fn bbox(&self) -> Aabb {
        Aabb::from_points([&self.v0, &self.v1, &self.v2])
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Point3D,
    pub max: Point3D,
}

impl Aabb {
    /// An inverted box that extends to nothing
    pub fn empty() -> Self {
        Self {
            min: Point3D::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            max: Point3D::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    pub fn from_points<'a, I: IntoIterator<Item = &'a Point3D>>(points: I) -> Self {
        let mut aabb = Self::empty();
        for p in points {
            aabb.extend(p);
        }
        aabb
    }

    pub fn extend(&mut self, p: &Point3D) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    pub fn merge(&mut self, other: &Aabb) {
        self.extend(&other.min);
        self.extend(&other.max);
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    pub fn center(&self) -> Point3D {
        Point3D::from((self.min.coords + self.max.coords) / 2.0)
    }

    pub fn sizes(&self) -> Vector3D {
        self.max - self.min
    }

    pub fn diagonal(&self) -> f64 {
        self.sizes().norm()
    }

    /// Map a world point into unit coordinates of this box.
    /// Degenerate axes map to 0.5.
    pub fn relative(&self, p: &Point3D) -> Vector3D {
        let sizes = self.sizes();
        let mut rel = p - self.min;
        for i in 0..3 {
            if sizes[i] > 1e-12 {
                rel[i] /= sizes[i];
            } else {
                rel[i] = 0.5;
            }
        }
        rel
    }

    pub fn contains(&self, p: &Point3D) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }
}

/// Oriented plane: the fitted boundary between adjacent segments, or the
/// mirror of a reflective symmetry group
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Plane {
    pub point: Point3D,
    pub normal: Vector3D,
}

impl Plane {
    /// The normal is stored unit length; a degenerate input falls back
    /// to Z-up rather than poisoning every later distance with NaN.
    pub fn new(point: Point3D, normal: Vector3D) -> Self {
        let len = normal.norm();
        let normal = if len > 1e-12 { normal / len } else { Vector3D::z() };
        Self { point, normal }
    }

    /// Signed offset of a point along the normal
    pub fn signed_distance(&self, point: &Point3D) -> f64 {
        (point - self.point).dot(&self.normal)
    }

    /// Mirror a point across the plane
    pub fn reflect(&self, point: &Point3D) -> Point3D {
        point - 2.0 * self.signed_distance(point) * self.normal
    }

    /// Fit a plane to a set of points: center is the centroid, normal is
    /// the direction of least variance (smallest eigenvector of the
    /// centered covariance). Needs at least 3 points.
    pub fn fit(points: &[Point3D]) -> Option<Plane> {
        if points.len() < 3 {
            return None;
        }

        let centroid = centroid(points);
        let cov = covariance(points, &centroid);
        let eig = cov.symmetric_eigen();

        // Column with the smallest eigenvalue
        let mut smallest = 0;
        for i in 1..3 {
            if eig.eigenvalues[i] < eig.eigenvalues[smallest] {
                smallest = i;
            }
        }
        let normal: Vector3D = eig.eigenvectors.column(smallest).into_owned();
        if normal.norm() < 1e-12 {
            return None;
        }

        Some(Plane::new(centroid, normal))
    }
}

/// Centroid of a point set. Origin for an empty set.
pub fn centroid(points: &[Point3D]) -> Point3D {
    if points.is_empty() {
        return Point3D::origin();
    }
    let sum: Vector3D = points.iter().map(|p| p.coords).sum();
    Point3D::from(sum / points.len() as f64)
}

/// Centered 3x3 covariance of a point set.
pub fn covariance(points: &[Point3D], center: &Point3D) -> Matrix3<f64> {
    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p - center;
        cov += d * d.transpose();
    }
    cov
}

/// Principal axes of a point set, strongest first, each unit length.
/// Falls back to the world axes for degenerate inputs.
pub fn principal_axes(points: &[Point3D]) -> [Vector3D; 3] {
    let fallback = [Vector3D::x(), Vector3D::y(), Vector3D::z()];
    if points.len() < 2 {
        return fallback;
    }

    let center = centroid(points);
    let eig = covariance(points, &center).symmetric_eigen();

    // Sort columns by descending eigenvalue
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].partial_cmp(&eig.eigenvalues[a]).unwrap());

    let mut axes = fallback;
    for (k, &i) in order.iter().enumerate() {
        let axis: Vector3D = eig.eigenvectors.column(i).into_owned();
        if axis.norm() > 1e-12 {
            axes[k] = axis.normalize();
        }
    }
    axes
}

/// Eigenvalues of the centered covariance, descending. Used by the
/// particle flatness descriptor.
pub fn covariance_spectrum(points: &[Point3D]) -> [f64; 3] {
    if points.len() < 2 {
        return [0.0; 3];
    }
    let center = centroid(points);
    let eig = covariance(points, &center).symmetric_eigen();
    let mut vals = [eig.eigenvalues[0], eig.eigenvalues[1], eig.eigenvalues[2]];
    vals.sort_by(|a, b| b.partial_cmp(a).unwrap());
    vals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_distance_splits_mirrored_pair() {
        // A reflective symmetry plane sees its two members at opposite
        // signed offsets
        let mirror = Plane::new(Point3D::new(0.5, 0.0, 0.0), Vector3D::x());
        let left = Point3D::new(-1.0, 0.3, 0.7);
        let right = mirror.reflect(&left);

        let dl = mirror.signed_distance(&left);
        let dr = mirror.signed_distance(&right);
        assert!((dl + dr).abs() < 1e-12, "offsets {} and {}", dl, dr);
        assert!((dr - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_normal_falls_back() {
        let plane = Plane::new(Point3D::origin(), Vector3D::zeros());
        assert!((plane.normal.norm() - 1.0).abs() < 1e-12);
        assert!(plane.signed_distance(&Point3D::origin()).is_finite());
    }

    #[test]
    fn test_boundary_plane_separates_segments() {
        // Crossing midpoints of a segment boundary, like the ones
        // segment_to_components fits a plane through
        let mut midpoints = Vec::new();
        for x in 0..4 {
            for y in 0..4 {
                midpoints.push(Point3D::new(x as f64, y as f64, 1.5));
            }
        }

        let boundary = Plane::fit(&midpoints).unwrap();
        let below = Point3D::new(1.0, 1.0, 1.0);
        let above = Point3D::new(1.0, 1.0, 2.0);
        let db = boundary.signed_distance(&below);
        let da = boundary.signed_distance(&above);

        assert!(db * da < 0.0, "boundary must separate the two sides");
        assert!((db.abs() - 0.5).abs() < 1e-9);
        assert!((da.abs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_sliver_triangle_falls_back() {
        let sliver = Triangle::new(
            Point3D::new(0.0, 0.0, 0.0),
            Point3D::new(1.0, 1.0, 0.0),
            Point3D::new(2.0, 2.0, 0.0),
        );

        assert!(sliver.area() < 1e-12);
        assert!((sliver.normal() - Vector3D::z()).norm() < 1e-12);
    }

    #[test]
    fn test_triangle_area_and_bbox() {
        let tri = Triangle::new(
            Point3D::new(0.0, 0.0, 2.0),
            Point3D::new(3.0, 0.0, 2.0),
            Point3D::new(0.0, 4.0, 2.0),
        );

        assert!((tri.area() - 6.0).abs() < 1e-12);
        assert!((tri.normal().z.abs() - 1.0).abs() < 1e-12);
        assert!((tri.centroid() - Point3D::new(1.0, 4.0 / 3.0, 2.0)).norm() < 1e-12);

        let bbox = tri.bbox();
        assert!((bbox.sizes() - Vector3D::new(3.0, 4.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_plane_reflect() {
        let plane = Plane::new(Point3D::origin(), Vector3D::new(1.0, 0.0, 0.0));
        let p = Point3D::new(2.0, 1.0, -1.0);
        let r = plane.reflect(&p);

        assert!((r.x + 2.0).abs() < 1e-10);
        assert!((r.y - 1.0).abs() < 1e-10);
        assert!((r.z + 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_plane_fit_recovers_z_plane() {
        let mut points = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                points.push(Point3D::new(i as f64, j as f64, 2.0));
            }
        }

        let plane = Plane::fit(&points).unwrap();
        assert!(plane.normal.z.abs() > 0.999);
        assert!((plane.point.z - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_principal_axes_of_elongated_cloud() {
        let mut points = Vec::new();
        for i in 0..20 {
            points.push(Point3D::new(i as f64, 0.1 * (i % 2) as f64, 0.0));
        }

        let axes = principal_axes(&points);
        assert!(axes[0].x.abs() > 0.99, "dominant axis should be X, got {:?}", axes[0]);
    }

    #[test]
    fn test_aabb_relative() {
        let aabb = Aabb::from_points(&[Point3D::new(0.0, 0.0, 0.0), Point3D::new(2.0, 4.0, 8.0)]);
        let rel = aabb.relative(&Point3D::new(1.0, 1.0, 2.0));

        assert!((rel.x - 0.5).abs() < 1e-10);
        assert!((rel.y - 0.25).abs() < 1e-10);
        assert!((rel.z - 0.25).abs() < 1e-10);
    }
}
