// Structural propagation: rebalance non-fixed parts after a fit
//
// Symmetry propagation copies the pose of a group's fixed representative
// onto its non-fixed members through the relation's geometric operator.
// Proximity propagation pulls the free endpoint of every link back onto
// the fixed endpoint's surface with a damped linearized update (a small
// sparse normal-equation solve per part, relaxed by Gauss-Seidel sweeps).
//
// The full deformation step interleaves the two:
//   deform -> symmetry -> proximity -> symmetry -> proximity

use crate::correspond::deform_to_fit::{register_and_deform, FitError};
use crate::correspond::part::{Coord4, Part, PartGeometry};
use crate::correspond::structure_graph::{RelationKind, StructureGraph};
use crate::geometry::Point3D;
use sprs::{CsMat, TriMat};
use std::collections::HashSet;

/// Damping factor of the linearized proximity update
const DAMPING: f64 = 0.5;

/// Bounded number of proximity sweeps per pass
const SWEEPS: usize = 12;

/// Tikhonov regularization of the per-part solve
const REGULARIZATION: f64 = 1e-6;

/// Attachment coordinates that were never stored are recovered by
/// projecting the closest approach of the two parts.
pub fn prepare_for_proximity(graph: &mut StructureGraph) {
    for li in 0..graph.links.len() {
        let link = &graph.links[li];
        if !link.coord_a.is_empty() && !link.coord_b.is_empty() {
            continue;
        }

        let (Some(pa), Some(pb)) = (graph.part(&link.a), graph.part(&link.b)) else {
            continue;
        };

        // Closest approach, seeded from centroids
        let (_, on_b) = pb.closest_point(&pa.centroid());
        let (ca, on_a) = pa.closest_point(&on_b);
        let (cb, _) = pb.closest_point(&on_a);

        let link = &mut graph.links[li];
        if link.coord_a.is_empty() {
            link.coord_a.push(ca);
        }
        if link.coord_b.is_empty() {
            link.coord_b.push(cb);
        }
    }
}

/// The two world positions a link currently attaches to
pub fn spokes_from_link(graph: &StructureGraph, link_index: usize) -> Option<(Point3D, Point3D)> {
    let link = graph.links.get(link_index)?;
    let pa = graph.part(&link.a)?;
    let pb = graph.part(&link.b)?;
    let ca = link.coord_a.first()?;
    let cb = link.coord_b.first()?;
    Some((pa.position_at(ca), pb.position_at(cb)))
}

/// Copy each symmetry group's fixed representative onto its non-fixed
/// members. Applying it twice with the same fixed set is a no-op the
/// second time: members are recomputed from the same representative.
pub fn propagate_symmetry(fixed: &HashSet<String>, graph: &mut StructureGraph) {
    for ri in 0..graph.relations.len() {
        let relation = graph.relations[ri].clone();
        if relation.kind == RelationKind::Proximity || relation.parts.len() < 2 {
            continue;
        }

        let Some(rep_idx) = relation.parts.iter().position(|p| fixed.contains(p)) else {
            continue;
        };

        let rep_ctrl: Vec<Point3D> = match graph.part(&relation.parts[rep_idx]) {
            Some(p) => p.control_points().to_vec(),
            None => continue,
        };

        for (mi, member_id) in relation.parts.iter().enumerate() {
            if mi == rep_idx || fixed.contains(member_id) {
                continue;
            }
            let Some(member) = graph.part_mut(member_id) else {
                continue;
            };
            if member.control_points().len() != rep_ctrl.len() {
                log::warn!(
                    "symmetry group member '{}' has a different control count; skipped",
                    member_id
                );
                continue;
            }

            for (dst, src) in member.control_points_mut().iter_mut().zip(&rep_ctrl) {
                *dst = relation.map_point(rep_idx, mi, src);
            }
        }
    }
}

/// Pull non-fixed link endpoints back onto their fixed counterparts.
/// Parts pulled in earlier rounds anchor their own neighbours, so the
/// correction spreads outward from the fixed set.
pub fn propagate_proximity(fixed: &HashSet<String>, graph: &mut StructureGraph) {
    for _ in 0..SWEEPS {
        // The frontier is rebuilt every sweep so the damped correction
        // keeps contracting the residual
        let mut anchored: HashSet<String> = fixed.clone();
        let mut moved_any = false;

        for li in 0..graph.links.len() {
            let link = graph.links[li].clone();
            let (Some(pa), Some(pb)) = (graph.part(&link.a), graph.part(&link.b)) else {
                continue;
            };
            if pa.assigned_null || pb.assigned_null {
                continue;
            }

            let a_anchor = anchored.contains(&link.a);
            let b_anchor = anchored.contains(&link.b);
            if a_anchor == b_anchor {
                continue; // both fixed, or waiting for an anchor to reach us
            }

            let (free_id, free_coords, anchor_pos) = if a_anchor {
                let ca = link.coord_a.first().copied().unwrap_or([0.0; 4]);
                (link.b.clone(), link.coord_b.clone(), pa.position_at(&ca))
            } else {
                let cb = link.coord_b.first().copied().unwrap_or([0.0; 4]);
                (link.a.clone(), link.coord_a.clone(), pb.position_at(&cb))
            };
            if fixed.contains(&free_id) {
                continue;
            }

            let coord = free_coords.first().copied().unwrap_or([0.0; 4]);
            if let Some(part) = graph.part_mut(&free_id) {
                pull_part(part, &coord, &anchor_pos);
            }
            anchored.insert(free_id);
            moved_any = true;
        }

        if !moved_any {
            break;
        }
    }
}

/// Damped linearized update of one part: displace its control points so
/// the attachment coordinate lands on the anchor position. Solves the
/// regularized normal equations over the few control points that carry
/// weight at the coordinate, then applies half of the correction.
fn pull_part(part: &mut Part, coord: &Coord4, anchor: &Point3D) {
    let weights = eval_weights(part, coord);
    let n = part.control_points().len();

    let current = part.position_at(coord);
    let error = anchor - current;
    if error.norm() < 1e-12 {
        return;
    }

    // A = w w^T + lambda I over the active control points
    let mut triplets = TriMat::new((n, n));
    for i in 0..n {
        triplets.add_triplet(i, i, REGULARIZATION);
    }
    for &(i, wi) in &weights {
        for &(j, wj) in &weights {
            triplets.add_triplet(i, j, wi * wj);
        }
    }
    let matrix: CsMat<f64> = triplets.to_csr();

    // One right-hand side per axis
    for axis in 0..3 {
        let mut rhs = vec![0.0; n];
        for &(i, wi) in &weights {
            rhs[i] = wi * error[axis];
        }

        let displacement = gauss_seidel(&matrix, &rhs, 20);
        let ctrl = part.control_points_mut();
        for (i, d) in displacement.iter().enumerate() {
            ctrl[i][axis] += DAMPING * d;
        }
    }
}

/// Evaluation weights of a parametric coordinate over the control
/// points: two for a curve segment, four for a sheet cell
fn eval_weights(part: &Part, coord: &Coord4) -> Vec<(usize, f64)> {
    match &part.geometry {
        PartGeometry::Curve { ctrl } => {
            let segs = ctrl.len() - 1;
            let pos = coord[0].clamp(0.0, 1.0) * segs as f64;
            let i = (pos.floor() as usize).min(segs - 1);
            let f = pos - i as f64;
            vec![(i, 1.0 - f), (i + 1, f)]
        }
        PartGeometry::Sheet { rows, cols, .. } => {
            let row_f = coord[0].clamp(0.0, 1.0) * (*rows as f64 - 1.0);
            let r0 = (row_f.floor() as usize).min(rows - 2);
            let fr = row_f - r0 as f64;

            let col_f = coord[1].clamp(0.0, 1.0) * (*cols as f64 - 1.0);
            let c0 = (col_f.floor() as usize).min(cols - 2);
            let fc = col_f - c0 as f64;

            vec![
                (r0 * cols + c0, (1.0 - fr) * (1.0 - fc)),
                (r0 * cols + c0 + 1, (1.0 - fr) * fc),
                ((r0 + 1) * cols + c0, fr * (1.0 - fc)),
                ((r0 + 1) * cols + c0 + 1, fr * fc),
            ]
        }
    }
}

/// Plain Gauss-Seidel relaxation, enough for the tiny SPD systems the
/// proximity update produces
fn gauss_seidel(matrix: &CsMat<f64>, rhs: &[f64], max_iter: usize) -> Vec<f64> {
    let n = rhs.len();
    let mut x = vec![0.0; n];

    for _ in 0..max_iter {
        for i in 0..n {
            let mut sum = rhs[i];
            let mut diag = 0.0;
            if let Some(row) = matrix.outer_view(i) {
                for (j, &v) in row.iter() {
                    if j == i {
                        diag = v;
                    } else {
                        sum -= v * x[j];
                    }
                }
            }
            if diag.abs() > 1e-20 {
                x[i] = sum / diag;
            }
        }
    }

    x
}

/// Apply one assignment's deformation cascade to `shape_a`:
/// fit each source part onto its target, propagating symmetry after
/// each fit, then run the interleaved proximity/symmetry passes.
pub fn apply_deformation(
    shape_a: &mut StructureGraph,
    shape_b: &StructureGraph,
    source_parts: &[String],
    target_parts: &[String],
    fixed: &HashSet<String>,
) -> Result<(), FitError> {
    for (sid, tid) in source_parts.iter().zip(target_parts) {
        let same_sheet = shape_a.part(sid).map(|p| p.is_sheet()).unwrap_or(false)
            && shape_b.part(tid).map(|p| p.is_sheet()).unwrap_or(false);
        if same_sheet {
            shape_a.correspond_two_nodes(sid, shape_b, tid);
        }

        let Some(tgt) = shape_b.part(tid) else {
            continue;
        };
        let tgt = tgt.clone();
        if let Some(src) = shape_a.part_mut(sid) {
            register_and_deform(src, &tgt)?;
        }
        shape_a.save_keyframe();
        propagate_symmetry(fixed, shape_a);
        shape_a.save_keyframe();
    }

    propagate_proximity(fixed, shape_a);
    shape_a.save_keyframe();
    propagate_symmetry(fixed, shape_a);
    shape_a.save_keyframe();
    propagate_proximity(fixed, shape_a);
    shape_a.save_keyframe();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspond::analysis::analyze;
    use crate::correspond::structure_graph::{MemberOp, Relation};
    use crate::geometry::{Plane, Vector3D};

    fn mirrored_pair() -> StructureGraph {
        let mut g = StructureGraph::new("pair");
        g.add_part(Part::curve(
            "left",
            vec![Point3D::new(-1.0, 0.0, 0.0), Point3D::new(-1.0, 0.0, 1.0)],
        ));
        g.add_part(Part::curve(
            "right",
            vec![Point3D::new(1.0, 0.0, 0.0), Point3D::new(1.0, 0.0, 1.0)],
        ));
        g.relations.push(Relation {
            kind: RelationKind::Reflective,
            parts: vec!["left".into(), "right".into()],
            ops: vec![
                MemberOp::Identity,
                MemberOp::Reflect(Plane::new(Point3D::origin(), Vector3D::x())),
            ],
        });
        g
    }

    #[test]
    fn test_symmetry_follows_representative() {
        let mut g = mirrored_pair();
        g.part_mut("left").unwrap().translate(Vector3D::new(-1.0, 0.0, 0.0));

        let fixed: HashSet<String> = ["left".to_string()].into();
        propagate_symmetry(&fixed, &mut g);

        // Right member mirrors the moved representative
        let p = g.part("right").unwrap().control_points()[0];
        assert!((p - Point3D::new(2.0, 0.0, 0.0)).norm() < 1e-9, "right at {:?}", p);
    }

    #[test]
    fn test_symmetry_is_idempotent() {
        let mut g = mirrored_pair();
        g.part_mut("left").unwrap().translate(Vector3D::new(0.0, 0.5, 0.0));

        let fixed: HashSet<String> = ["left".to_string()].into();
        propagate_symmetry(&fixed, &mut g);
        let once: Vec<Point3D> = g.part("right").unwrap().control_points().to_vec();

        propagate_symmetry(&fixed, &mut g);
        let twice: Vec<Point3D> = g.part("right").unwrap().control_points().to_vec();

        for (a, b) in once.iter().zip(&twice) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn test_proximity_restores_attachment() {
        let mut g = StructureGraph::new("joint");
        g.add_part(Part::curve(
            "post",
            vec![Point3D::new(0.0, 0.0, 0.0), Point3D::new(0.0, 0.0, 2.0)],
        ));
        g.add_part(Part::curve(
            "arm",
            vec![Point3D::new(0.0, 0.0, 2.0), Point3D::new(1.0, 0.0, 2.0)],
        ));
        g.add_link(
            "post",
            "arm",
            vec![[1.0, 0.0, 0.0, 0.0]],
            vec![[0.0, 0.0, 0.0, 0.0]],
        );

        // Move the post; the arm's attachment is now dangling
        g.part_mut("post").unwrap().translate(Vector3D::new(0.5, 0.5, 0.0));
        let gap_before = g.link_gap(&g.links[0]);
        assert!(gap_before > 0.5);

        let fixed: HashSet<String> = ["post".to_string()].into();
        propagate_proximity(&fixed, &mut g);

        let gap_after = g.link_gap(&g.links[0]);
        let tolerance = 0.01 * g.bbox().diagonal();
        assert!(
            gap_after < tolerance,
            "gap {} not within tolerance {}",
            gap_after,
            tolerance
        );

        // The two spoke endpoints of the link coincide again
        let (on_post, on_arm) = spokes_from_link(&g, 0).unwrap();
        assert!((on_post - on_arm).norm() < tolerance);

        // The fixed part never moves
        let post = g.part("post").unwrap().control_points()[0];
        assert!((post - Point3D::new(0.5, 0.5, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_proximity_spreads_through_chain() {
        let mut g = StructureGraph::new("chain");
        g.add_part(Part::curve(
            "a",
            vec![Point3D::new(0.0, 0.0, 0.0), Point3D::new(1.0, 0.0, 0.0)],
        ));
        g.add_part(Part::curve(
            "b",
            vec![Point3D::new(1.0, 0.0, 0.0), Point3D::new(2.0, 0.0, 0.0)],
        ));
        g.add_part(Part::curve(
            "c",
            vec![Point3D::new(2.0, 0.0, 0.0), Point3D::new(3.0, 0.0, 0.0)],
        ));
        g.add_link("a", "b", vec![[1.0, 0.0, 0.0, 0.0]], vec![[0.0, 0.0, 0.0, 0.0]]);
        g.add_link("b", "c", vec![[1.0, 0.0, 0.0, 0.0]], vec![[0.0, 0.0, 0.0, 0.0]]);

        g.part_mut("a").unwrap().translate(Vector3D::new(0.0, 1.0, 0.0));

        let fixed: HashSet<String> = ["a".to_string()].into();
        propagate_proximity(&fixed, &mut g);

        let tolerance = 0.05 * g.bbox().diagonal();
        assert!(g.link_gap(&g.links[0]) < tolerance);
        assert!(g.link_gap(&g.links[1]) < tolerance);
    }

    #[test]
    fn test_prepare_recovers_missing_coords() {
        let mut g = StructureGraph::new("bare");
        g.add_part(Part::curve(
            "post",
            vec![Point3D::new(0.0, 0.0, 0.0), Point3D::new(0.0, 0.0, 2.0)],
        ));
        g.add_part(Part::curve(
            "arm",
            vec![Point3D::new(0.0, 0.0, 2.0), Point3D::new(1.0, 0.0, 2.0)],
        ));
        g.add_link("post", "arm", vec![], vec![]);

        prepare_for_proximity(&mut g);

        assert!(!g.links[0].coord_a.is_empty());
        assert!(!g.links[0].coord_b.is_empty());
        assert!(g.link_gap(&g.links[0]) < 1e-9);
    }

    #[test]
    fn test_full_deformation_step_on_identity() {
        let mut a = StructureGraph::new("a");
        a.add_part(Part::curve(
            "p",
            vec![Point3D::new(0.0, 0.0, 0.0), Point3D::new(0.0, 0.0, 1.0)],
        ));
        analyze(&mut a);
        let b = a.clone();

        let before = a.part("p").unwrap().control_points().to_vec();
        let fixed: HashSet<String> = ["p".to_string()].into();
        apply_deformation(&mut a, &b, &["p".to_string()], &["p".to_string()], &fixed).unwrap();

        for (p, q) in a.part("p").unwrap().control_points().iter().zip(&before) {
            assert!((p - q).norm() < 1e-9);
        }
        assert!(a.keyframe_count() >= 5);
    }
}
