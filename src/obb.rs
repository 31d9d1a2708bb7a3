// Best-fit oriented bounding boxes
//
// Initial orientation comes from the best-fit plane of the point cloud;
// a brute-force sweep of in-plane rotations (10 degree steps) keeps the
// orientation with the smallest volume.

use crate::geometry::{Plane, Point3D, Vector3D};
use nalgebra::{Rotation3, Unit};

#[derive(Debug, Clone, Copy)]
pub struct Obb {
    pub center: Point3D,
    /// Orthonormal box axes
    pub axes: [Vector3D; 3],
    pub half_sizes: Vector3D,
}

impl Obb {
    /// Fit an oriented box to a point cloud. Falls back to the axis
    /// aligned box for degenerate inputs.
    pub fn best_fit(points: &[Point3D]) -> Obb {
        let axis_aligned = [Vector3D::x(), Vector3D::y(), Vector3D::z()];
        if points.len() < 3 {
            return fit_with_axes(points, &axis_aligned);
        }

        let base_axes = match Plane::fit(points) {
            Some(plane) => {
                let z = plane.normal;
                let x = orthogonal_to(&z);
                let y = z.cross(&x).normalize();
                [x, y, z]
            }
            None => axis_aligned,
        };

        let mut best = fit_with_axes(points, &base_axes);
        let mut best_volume = best.volume();

        // Sweep in-plane rotations about the fitted normal
        for step in 1..18 {
            let angle = (step * 10) as f64 * std::f64::consts::PI / 180.0;
            let rot = Rotation3::from_axis_angle(&Unit::new_normalize(base_axes[2]), angle);
            let axes = [rot * base_axes[0], rot * base_axes[1], base_axes[2]];

            let candidate = fit_with_axes(points, &axes);
            let volume = candidate.volume();
            if volume < best_volume {
                best_volume = volume;
                best = candidate;
            }
        }

        best
    }

    pub fn sizes(&self) -> Vector3D {
        2.0 * self.half_sizes
    }

    pub fn volume(&self) -> f64 {
        let s = self.sizes();
        s.x * s.y * s.z
    }

    /// Length of the box diagonal
    pub fn diagonal(&self) -> f64 {
        self.sizes().norm()
    }
}

/// Extents of a point cloud along the given frame
fn fit_with_axes(points: &[Point3D], axes: &[Vector3D; 3]) -> Obb {
    let mut lo = Vector3D::new(f64::INFINITY, f64::INFINITY, f64::INFINITY);
    let mut hi = -lo;

    for p in points {
        for i in 0..3 {
            let t = p.coords.dot(&axes[i]);
            lo[i] = lo[i].min(t);
            hi[i] = hi[i].max(t);
        }
    }

    if points.is_empty() {
        lo = Vector3D::zeros();
        hi = Vector3D::zeros();
    }

    let mid = (lo + hi) / 2.0;
    let center = Point3D::from(axes[0] * mid.x + axes[1] * mid.y + axes[2] * mid.z);

    Obb {
        center,
        axes: *axes,
        half_sizes: (hi - lo) / 2.0,
    }
}

/// Any unit vector perpendicular to `n`
fn orthogonal_to(n: &Vector3D) -> Vector3D {
    let candidate = if n.x.abs() < 0.9 { Vector3D::x() } else { Vector3D::y() };
    n.cross(&candidate).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_aligned_box() {
        let mut points = Vec::new();
        for x in [0.0, 4.0] {
            for y in [0.0, 2.0] {
                for z in [0.0, 1.0] {
                    points.push(Point3D::new(x, y, z));
                }
            }
        }

        let obb = Obb::best_fit(&points);
        assert!((obb.volume() - 8.0).abs() < 1e-6, "volume {}", obb.volume());
    }

    #[test]
    fn test_rotated_box_recovers_tight_volume() {
        // A 4x1x1 box rotated 30 degrees about Z
        let rot = Rotation3::from_axis_angle(&Unit::new_normalize(Vector3D::z()), 0.5236);
        let mut points = Vec::new();
        for i in 0..=8 {
            for y in [-0.5, 0.5] {
                for z in [-0.5, 0.5] {
                    let p = Point3D::new(i as f64 * 0.5 - 2.0, y, z);
                    points.push(Point3D::from(rot * p.coords));
                }
            }
        }

        let obb = Obb::best_fit(&points);
        // AABB volume of the rotated box would be well above 4; the OBB
        // sweep should get close to the tight volume
        assert!(obb.volume() < 5.5, "volume {}", obb.volume());
    }

    #[test]
    fn test_degenerate_inputs() {
        let one = vec![Point3D::new(1.0, 2.0, 3.0)];
        let obb = Obb::best_fit(&one);
        assert_eq!(obb.volume(), 0.0);
        assert!((obb.center - one[0]).norm() < 1e-12);
    }
}
