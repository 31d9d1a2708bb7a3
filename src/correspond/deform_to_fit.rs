// Deform-to-fit: register a source part onto a target part
//
// Registration is rigid (principal-axis alignment followed by a few
// ICP sweeps with a Kabsch solve), then the non-rigid morph pulls every
// source control point onto its closest point on the target. The source
// keeps its control-point count.
//
// A degenerate fit is a recoverable condition: the caller gets an Err
// and abandons the one trial pairing, never the whole expansion.

use crate::correspond::part::Part;
use crate::geometry::{centroid, principal_axes, Point3D};
use nalgebra::{Matrix3, Rotation3, Vector3};

const ICP_ITERATIONS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("degenerate fit: {0}")]
    Degenerate(String),
}

/// Rigid + non-rigid fit of `src` onto `tgt`, in place.
pub fn register_and_deform(src: &mut Part, tgt: &Part) -> Result<(), FitError> {
    if src.control_points().is_empty() {
        return Err(FitError::Degenerate("source has no control points".into()));
    }
    if tgt.bbox().diagonal() < 1e-12 {
        return Err(FitError::Degenerate(format!(
            "target '{}' collapsed to a point",
            tgt.id
        )));
    }

    let src_samples: Vec<Point3D> = src
        .sample_coords(4)
        .iter()
        .map(|c| src.position_at(c))
        .collect();

    // Principal-axis initialization
    let mut transform = principal_alignment(&src_samples, tgt);

    // ICP refinement on the sampled positions
    for _ in 0..ICP_ITERATIONS {
        let moved: Vec<Point3D> = src_samples.iter().map(|p| transform.apply(p)).collect();
        let paired: Vec<Point3D> = moved.iter().map(|p| tgt.closest_point(p).1).collect();

        match kabsch(&src_samples, &paired) {
            Some(better) => transform = better,
            None => break,
        }
    }

    // Non-rigid morph: every control point lands on the target
    let morphed: Vec<Point3D> = src
        .control_points()
        .iter()
        .map(|p| tgt.closest_point(&transform.apply(p)).1)
        .collect();

    for (p, m) in src.control_points_mut().iter_mut().zip(morphed) {
        *p = m;
    }

    Ok(())
}

/// Rigid transform as rotation about the origin plus translation
#[derive(Debug, Clone, Copy)]
struct RigidTransform {
    rotation: Rotation3<f64>,
    translation: Vector3<f64>,
}

impl RigidTransform {
    fn apply(&self, p: &Point3D) -> Point3D {
        Point3D::from(self.rotation * p.coords + self.translation)
    }
}

/// Align source principal axes to target principal axes, testing the
/// four proper-rotation sign choices and keeping the best.
fn principal_alignment(src_samples: &[Point3D], tgt: &Part) -> RigidTransform {
    let tgt_samples: Vec<Point3D> = tgt
        .sample_coords(4)
        .iter()
        .map(|c| tgt.position_at(c))
        .collect();

    let src_center = centroid(src_samples);
    let tgt_center = centroid(&tgt_samples);
    let src_axes = principal_axes(src_samples);
    let tgt_axes = principal_axes(&tgt_samples);

    let mut best = RigidTransform {
        rotation: Rotation3::identity(),
        translation: tgt_center - src_center,
    };
    let mut best_err = alignment_error(&best, src_samples, tgt);

    // Flip pairs of axes so the determinant stays +1
    for flips in [[1.0, 1.0, 1.0], [-1.0, -1.0, 1.0], [-1.0, 1.0, -1.0], [1.0, -1.0, -1.0]] {
        let mut basis_src = Matrix3::zeros();
        let mut basis_tgt = Matrix3::zeros();
        for i in 0..3 {
            basis_src.set_column(i, &src_axes[i]);
            basis_tgt.set_column(i, &(tgt_axes[i] * flips[i]));
        }

        let rot_mat = basis_tgt * basis_src.transpose();
        let rotation = Rotation3::from_matrix(&rot_mat);

        let candidate = RigidTransform {
            rotation,
            translation: tgt_center.coords - rotation * src_center.coords,
        };
        let err = alignment_error(&candidate, src_samples, tgt);
        if err < best_err {
            best_err = err;
            best = candidate;
        }
    }

    best
}

fn alignment_error(transform: &RigidTransform, src_samples: &[Point3D], tgt: &Part) -> f64 {
    src_samples
        .iter()
        .map(|p| {
            let moved = transform.apply(p);
            (tgt.closest_point(&moved).1 - moved).norm()
        })
        .sum()
}

/// Best rigid transform mapping `from` onto `to` in the least-squares
/// sense. None when the SVD degenerates.
fn kabsch(from: &[Point3D], to: &[Point3D]) -> Option<RigidTransform> {
    if from.len() != to.len() || from.is_empty() {
        return None;
    }

    let cf = centroid(from);
    let ct = centroid(to);

    let mut h = Matrix3::zeros();
    for (p, q) in from.iter().zip(to) {
        h += (p - cf) * (q - ct).transpose();
    }

    let svd = h.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);

    let mut d = Matrix3::identity();
    d[(2, 2)] = (v_t.transpose() * u.transpose()).determinant().signum();

    let rot_mat = v_t.transpose() * d * u.transpose();
    let rotation = Rotation3::from_matrix(&rot_mat);

    Some(RigidTransform {
        rotation,
        translation: ct.coords - rotation * cf.coords,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vector3D;

    fn segment(id: &str, from: Point3D, to: Point3D) -> Part {
        Part::curve(id, vec![from, Point3D::from((from.coords + to.coords) / 2.0), to])
    }

    #[test]
    fn test_identity_fit_is_exact() {
        let tgt = segment("t", Point3D::origin(), Point3D::new(0.0, 0.0, 2.0));
        let mut src = tgt.clone();

        register_and_deform(&mut src, &tgt).unwrap();

        for (p, q) in src.control_points().iter().zip(tgt.control_points()) {
            assert!((p - q).norm() < 1e-9, "moved by {}", (p - q).norm());
        }
    }

    #[test]
    fn test_translated_fit_lands_on_target() {
        let tgt = segment("t", Point3D::new(5.0, 1.0, 0.0), Point3D::new(5.0, 1.0, 2.0));
        let mut src = segment("s", Point3D::origin(), Point3D::new(0.0, 0.0, 2.0));

        register_and_deform(&mut src, &tgt).unwrap();

        // Every fitted control point sits on the target curve
        for p in src.control_points() {
            let gap = (tgt.closest_point(p).1 - p).norm();
            assert!(gap < 1e-6, "control point off target by {}", gap);
        }
    }

    #[test]
    fn test_control_point_count_preserved() {
        let tgt = Part::curve(
            "t",
            vec![Point3D::origin(), Point3D::new(1.0, 0.0, 0.0)],
        );
        let mut src = segment("s", Point3D::origin(), Point3D::new(0.0, 2.0, 0.0));
        let count = src.control_points().len();

        register_and_deform(&mut src, &tgt).unwrap();
        assert_eq!(src.control_points().len(), count);
    }

    #[test]
    fn test_collapsed_target_is_recoverable_error() {
        let mut collapsed = segment("t", Point3D::origin(), Point3D::new(0.0, 0.0, 2.0));
        collapsed.collapse_to_centroid();

        let mut src = segment("s", Point3D::origin(), Point3D::new(1.0, 0.0, 0.0));
        let result = register_and_deform(&mut src, &collapsed);
        assert!(result.is_err());

        // Source untouched after the failed fit
        assert!((src.control_points()[2] - Point3D::new(1.0, 0.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_rotated_curve_fit() {
        // Target is the source rotated 90 degrees about Z
        let mut src = segment("s", Point3D::new(-1.0, 0.0, 0.0), Point3D::new(1.0, 0.0, 0.0));
        let tgt = segment("t", Point3D::new(0.0, -1.0, 0.0), Point3D::new(0.0, 1.0, 0.0));

        register_and_deform(&mut src, &tgt).unwrap();

        let spread: Vector3D = src.control_points()[2] - src.control_points()[0];
        assert!(spread.y.abs() > 1.9, "fit should span the target, got {:?}", spread);
    }
}
