// Parts: the typed nodes of a structure graph
//
// A part is a curve (1D control polygon) or a sheet (2D control lattice).
// Both evaluate piecewise-linearly over a uniform parameterization, which
// is all the correspondence pipeline needs from the underlying surface
// math: positions at parametric coordinates, projection of world points
// into the parametric domain, and sampled spokes for the evaluator.

use crate::geometry::{centroid, Aabb, Point3D, Vector3D};
use serde::{Deserialize, Serialize};

/// Parametric attachment coordinate. Curves use coord[0]; sheets use
/// coord[0..2]. The remaining lanes are carried for file compatibility.
pub type Coord4 = [f64; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartKind {
    Curve,
    Sheet,
}

#[derive(Debug, Clone)]
pub enum PartGeometry {
    Curve {
        ctrl: Vec<Point3D>,
    },
    Sheet {
        /// Row-major lattice, rows x cols
        ctrl: Vec<Point3D>,
        rows: usize,
        cols: usize,
    },
}

/// A sampled ray from the part skeleton to one of its surface samples.
/// The initial length is the distortion yardstick: the evaluator compares
/// the current length at the same coordinate against it.
#[derive(Debug, Clone, Copy)]
pub struct Spoke {
    pub coord: Coord4,
    pub initial_length: f64,
}

#[derive(Debug, Clone)]
pub struct Part {
    pub id: String,
    pub geometry: PartGeometry,
    pub label: String,
    pub mesh_path: Option<String>,
    pub spokes: Vec<Spoke>,
    pub assigned_null: bool,
    pub merged: bool,
}

impl Part {
    pub fn curve(id: impl Into<String>, ctrl: Vec<Point3D>) -> Part {
        assert!(ctrl.len() >= 2, "a curve needs at least two control points");
        Part {
            id: id.into(),
            geometry: PartGeometry::Curve { ctrl },
            label: String::new(),
            mesh_path: None,
            spokes: Vec::new(),
            assigned_null: false,
            merged: false,
        }
    }

    pub fn sheet(id: impl Into<String>, ctrl: Vec<Point3D>, rows: usize, cols: usize) -> Part {
        assert!(rows >= 2 && cols >= 2, "a sheet needs a 2x2 lattice at least");
        assert_eq!(ctrl.len(), rows * cols);
        Part {
            id: id.into(),
            geometry: PartGeometry::Sheet { ctrl, rows, cols },
            label: String::new(),
            mesh_path: None,
            spokes: Vec::new(),
            assigned_null: false,
            merged: false,
        }
    }

    pub fn kind(&self) -> PartKind {
        match self.geometry {
            PartGeometry::Curve { .. } => PartKind::Curve,
            PartGeometry::Sheet { .. } => PartKind::Sheet,
        }
    }

    pub fn is_curve(&self) -> bool {
        self.kind() == PartKind::Curve
    }

    pub fn is_sheet(&self) -> bool {
        self.kind() == PartKind::Sheet
    }

    pub fn control_points(&self) -> &[Point3D] {
        match &self.geometry {
            PartGeometry::Curve { ctrl } => ctrl,
            PartGeometry::Sheet { ctrl, .. } => ctrl,
        }
    }

    pub fn control_points_mut(&mut self) -> &mut [Point3D] {
        match &mut self.geometry {
            PartGeometry::Curve { ctrl } => ctrl,
            PartGeometry::Sheet { ctrl, .. } => ctrl,
        }
    }

    pub fn centroid(&self) -> Point3D {
        centroid(self.control_points())
    }

    pub fn bbox(&self) -> Aabb {
        Aabb::from_points(self.control_points())
    }

    /// Evaluate the part at a parametric coordinate. Curves interpolate
    /// their control polygon at coord[0]; sheets interpolate the lattice
    /// bilinearly at (coord[0], coord[1]). Coordinates clamp to [0, 1].
    pub fn position_at(&self, coord: &Coord4) -> Point3D {
        match &self.geometry {
            PartGeometry::Curve { ctrl } => eval_polyline(ctrl, coord[0]),
            PartGeometry::Sheet { ctrl, rows, cols } => {
                let u = coord[0].clamp(0.0, 1.0);
                let v = coord[1].clamp(0.0, 1.0);

                // Interpolate along rows first, then across
                let row_f = u * (*rows as f64 - 1.0);
                let r0 = (row_f.floor() as usize).min(rows - 2);
                let fr = row_f - r0 as f64;

                let col_f = v * (*cols as f64 - 1.0);
                let c0 = (col_f.floor() as usize).min(cols - 2);
                let fc = col_f - c0 as f64;

                let at = |r: usize, c: usize| ctrl[r * cols + c].coords;
                let p00 = at(r0, c0);
                let p01 = at(r0, c0 + 1);
                let p10 = at(r0 + 1, c0);
                let p11 = at(r0 + 1, c0 + 1);

                let lo = p00 * (1.0 - fc) + p01 * fc;
                let hi = p10 * (1.0 - fc) + p11 * fc;
                Point3D::from(lo * (1.0 - fr) + hi * fr)
            }
        }
    }

    /// Closest parametric coordinate to a world point
    pub fn project(&self, point: &Point3D) -> Coord4 {
        self.closest_point(point).0
    }

    /// Closest point on the part to a world point, with its parametric
    /// coordinate. Exact per polyline segment; sheets split each lattice
    /// cell into two triangles.
    pub fn closest_point(&self, point: &Point3D) -> (Coord4, Point3D) {
        let mut best_coord = [0.0; 4];
        let mut best_point = self.control_points()[0];
        let mut best_dist = f64::INFINITY;

        match &self.geometry {
            PartGeometry::Curve { ctrl } => {
                let segs = ctrl.len() - 1;
                for i in 0..segs {
                    let (a, b) = (ctrl[i], ctrl[i + 1]);
                    let ab = b - a;
                    let len2 = ab.norm_squared();
                    let t = if len2 < 1e-20 {
                        0.0
                    } else {
                        ((point - a).dot(&ab) / len2).clamp(0.0, 1.0)
                    };
                    let candidate = a + ab * t;
                    let d = (candidate - point).norm();
                    if d < best_dist {
                        best_dist = d;
                        best_point = candidate;
                        best_coord = [(i as f64 + t) / segs as f64, 0.0, 0.0, 0.0];
                    }
                }
            }
            PartGeometry::Sheet { ctrl, rows, cols } => {
                let at = |r: usize, c: usize| ctrl[r * cols + c];
                let uv = |r: usize, c: usize| {
                    (
                        r as f64 / (*rows as f64 - 1.0),
                        c as f64 / (*cols as f64 - 1.0),
                    )
                };

                for r in 0..rows - 1 {
                    for c in 0..cols - 1 {
                        let corners = [(r, c), (r, c + 1), (r + 1, c + 1), (r + 1, c)];
                        for tri in [[0, 1, 2], [0, 2, 3]] {
                            let pts = [
                                at(corners[tri[0]].0, corners[tri[0]].1),
                                at(corners[tri[1]].0, corners[tri[1]].1),
                                at(corners[tri[2]].0, corners[tri[2]].1),
                            ];
                            let (bary, candidate) = closest_on_triangle(&pts, point);
                            let d = (candidate - point).norm();
                            if d < best_dist {
                                best_dist = d;
                                best_point = candidate;
                                let mut u = 0.0;
                                let mut v = 0.0;
                                for k in 0..3 {
                                    let (cu, cv) = uv(corners[tri[k]].0, corners[tri[k]].1);
                                    u += bary[k] * cu;
                                    v += bary[k] * cv;
                                }
                                best_coord = [u, v, 0.0, 0.0];
                            }
                        }
                    }
                }
            }
        }

        (best_coord, best_point)
    }

    /// Sample coordinates at the evaluator resolution: r points along a
    /// curve, r x r over a sheet.
    pub fn sample_coords(&self, resolution: usize) -> Vec<Coord4> {
        let r = resolution.max(2);
        let mut coords = Vec::new();
        match self.kind() {
            PartKind::Curve => {
                for i in 0..r {
                    coords.push([i as f64 / (r - 1) as f64, 0.0, 0.0, 0.0]);
                }
            }
            PartKind::Sheet => {
                for i in 0..r {
                    for j in 0..r {
                        coords.push([
                            i as f64 / (r - 1) as f64,
                            j as f64 / (r - 1) as f64,
                            0.0,
                            0.0,
                        ]);
                    }
                }
            }
        }
        coords
    }

    /// Current spoke length at a coordinate: distance from the part
    /// centroid to the surface sample. Translation and rotation leave
    /// it unchanged; stretch and collapse do not.
    pub fn spoke_length(&self, coord: &Coord4) -> f64 {
        (self.position_at(coord) - self.centroid()).norm()
    }

    /// Refresh the spoke set: resample at the given resolution and store
    /// current lengths as the reference.
    pub fn sample_spokes(&mut self, resolution: usize) {
        self.spokes = self
            .sample_coords(resolution)
            .into_iter()
            .map(|coord| Spoke {
                coord,
                initial_length: self.spoke_length(&coord),
            })
            .collect();
    }

    /// Collapse every control point to the centroid (null assignment)
    pub fn collapse_to_centroid(&mut self) {
        let c = self.centroid();
        for p in self.control_points_mut() {
            *p = c;
        }
    }

    pub fn translate(&mut self, offset: Vector3D) {
        for p in self.control_points_mut() {
            *p += offset;
        }
    }

    /// Reverse the curve's control polygon. No-op on sheets.
    pub fn reverse_curve(&mut self) {
        if let PartGeometry::Curve { ctrl } = &mut self.geometry {
            ctrl.reverse();
        }
    }

    /// Flip the sheet lattice along its row axis. No-op on curves.
    pub fn flip_rows(&mut self) {
        if let PartGeometry::Sheet { ctrl, rows, cols } = &mut self.geometry {
            for r in 0..*rows / 2 {
                for c in 0..*cols {
                    ctrl.swap(r * *cols + c, (*rows - 1 - r) * *cols + c);
                }
            }
        }
    }

    /// Flip the sheet lattice along its column axis. No-op on curves.
    pub fn flip_cols(&mut self) {
        if let PartGeometry::Sheet { ctrl, rows, cols } = &mut self.geometry {
            for r in 0..*rows {
                for c in 0..*cols / 2 {
                    ctrl.swap(r * *cols + c, r * *cols + (*cols - 1 - c));
                }
            }
        }
    }

    /// Resample a curve's control polygon to a new point count with
    /// uniform spacing. No-op on sheets and on matching counts.
    pub fn resample_curve(&mut self, count: usize) {
        if let PartGeometry::Curve { ctrl } = &mut self.geometry {
            if ctrl.len() == count || count < 2 {
                return;
            }
            let resampled: Vec<Point3D> = (0..count)
                .map(|i| eval_polyline(ctrl, i as f64 / (count - 1) as f64))
                .collect();
            *ctrl = resampled;
        }
    }
}

/// Closest point on a triangle, returned with barycentric coordinates
fn closest_on_triangle(tri: &[Point3D; 3], p: &Point3D) -> ([f64; 3], Point3D) {
    let (a, b, c) = (tri[0], tri[1], tri[2]);
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return ([1.0, 0.0, 0.0], a);
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return ([0.0, 1.0, 0.0], b);
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let t = d1 / (d1 - d3);
        return ([1.0 - t, t, 0.0], a + ab * t);
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return ([0.0, 0.0, 1.0], c);
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let t = d2 / (d2 - d6);
        return ([1.0 - t, 0.0, t], a + ac * t);
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let t = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return ([0.0, 1.0 - t, t], b + (c - b) * t);
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    ([1.0 - v - w, v, w], a + ab * v + ac * w)
}

/// Piecewise-linear evaluation of a control polygon at t in [0, 1]
fn eval_polyline(ctrl: &[Point3D], t: f64) -> Point3D {
    let t = t.clamp(0.0, 1.0);
    let segs = ctrl.len() - 1;
    let pos = t * segs as f64;
    let i = (pos.floor() as usize).min(segs - 1);
    let f = pos - i as f64;
    Point3D::from(ctrl[i].coords * (1.0 - f) + ctrl[i + 1].coords * f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_curve() -> Part {
        Part::curve(
            "c",
            vec![
                Point3D::new(0.0, 0.0, 0.0),
                Point3D::new(1.0, 0.0, 0.0),
                Point3D::new(2.0, 0.0, 0.0),
            ],
        )
    }

    fn flat_sheet() -> Part {
        // 2x3 lattice over [0,2]x[0,1] in the XY plane
        Part::sheet(
            "s",
            vec![
                Point3D::new(0.0, 0.0, 0.0),
                Point3D::new(1.0, 0.0, 0.0),
                Point3D::new(2.0, 0.0, 0.0),
                Point3D::new(0.0, 1.0, 0.0),
                Point3D::new(1.0, 1.0, 0.0),
                Point3D::new(2.0, 1.0, 0.0),
            ],
            2,
            3,
        )
    }

    #[test]
    fn test_curve_evaluation() {
        let c = unit_curve();
        assert!((c.position_at(&[0.0, 0.0, 0.0, 0.0]).x - 0.0).abs() < 1e-12);
        assert!((c.position_at(&[0.5, 0.0, 0.0, 0.0]).x - 1.0).abs() < 1e-12);
        assert!((c.position_at(&[1.0, 0.0, 0.0, 0.0]).x - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_sheet_evaluation() {
        let s = flat_sheet();
        let p = s.position_at(&[0.5, 0.5, 0.0, 0.0]);
        assert!((p.x - 1.0).abs() < 1e-12);
        assert!((p.y - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_projection_round_trip() {
        let s = flat_sheet();
        let target = s.position_at(&[0.25, 0.75, 0.0, 0.0]);
        let coord = s.project(&target);
        let back = s.position_at(&coord);
        assert!((back - target).norm() < 1e-9, "projection error {}", (back - target).norm());
    }

    #[test]
    fn test_closest_point_off_surface() {
        let s = flat_sheet();
        let (coord, on_surface) = s.closest_point(&Point3D::new(1.0, 0.5, 2.0));

        // Straight above the sheet: footprint is directly below
        assert!((on_surface - Point3D::new(1.0, 0.5, 0.0)).norm() < 1e-9);
        assert!((s.position_at(&coord) - on_surface).norm() < 1e-9);
    }

    #[test]
    fn test_spokes_survive_translation() {
        let mut c = unit_curve();
        c.sample_spokes(4);
        let before: Vec<f64> = c.spokes.iter().map(|s| s.initial_length).collect();

        c.translate(Vector3D::new(5.0, -3.0, 1.0));
        let after: Vec<f64> = c.spokes.iter().map(|s| c.spoke_length(&s.coord)).collect();

        for (b, a) in before.iter().zip(&after) {
            assert!((b - a).abs() < 1e-12);
        }
    }

    #[test]
    fn test_collapse_zeroes_spokes() {
        let mut c = unit_curve();
        c.sample_spokes(4);
        c.collapse_to_centroid();

        for s in &c.spokes {
            assert!(c.spoke_length(&s.coord) < 1e-12);
        }
    }

    #[test]
    fn test_resample_preserves_shape() {
        let mut c = unit_curve();
        c.resample_curve(5);
        assert_eq!(c.control_points().len(), 5);
        // Still a straight segment from 0 to 2
        assert!((c.position_at(&[0.5, 0.0, 0.0, 0.0]).x - 1.0).abs() < 1e-9);
    }
}
