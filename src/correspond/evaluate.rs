// Correspondence evaluator: spoke-length distortion
//
// `prepare` samples every part's spokes once at the start of the search;
// the stored lengths are the reference. After each deformation step,
// `evaluate` resamples the same coordinates and averages the relative
// length change over parts. Zero means no structural distortion.

use crate::correspond::structure_graph::StructureGraph;

/// Samples per parametric direction
pub const SPOKE_RESOLUTION: usize = 4;

/// Fixed cost contribution of a part assigned to null
pub const NULL_PENALTY: f64 = 1.0;

/// Sample the initial spoke set of every part. Call once on the working
/// source shape before the search starts.
pub fn prepare(graph: &mut StructureGraph) {
    for part in &mut graph.parts {
        part.sample_spokes(SPOKE_RESOLUTION);
    }
}

/// Refresh the spoke reference of a single part, used after a
/// topological operation replaces its geometry.
pub fn resample_part(graph: &mut StructureGraph, id: &str) {
    if let Some(part) = graph.part_mut(id) {
        part.sample_spokes(SPOKE_RESOLUTION);
    }
}

/// Mean relative spoke-length change over all parts. Parts assigned to
/// null contribute the fixed penalty instead of a measurement.
pub fn evaluate(graph: &StructureGraph) -> f64 {
    if graph.parts.is_empty() {
        return 0.0;
    }

    let mut total = 0.0;
    let mut counted = 0usize;

    for part in &graph.parts {
        if part.assigned_null {
            total += NULL_PENALTY;
            counted += 1;
            continue;
        }
        if part.spokes.is_empty() {
            continue;
        }

        let mut part_sum = 0.0;
        for spoke in &part.spokes {
            let current = part.spoke_length(&spoke.coord);
            part_sum += (current - spoke.initial_length).abs() / spoke.initial_length.max(1e-9);
        }
        total += part_sum / part.spokes.len() as f64;
        counted += 1;
    }

    if counted == 0 {
        0.0
    } else {
        total / counted as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspond::part::Part;
    use crate::geometry::{Point3D, Vector3D};

    fn one_curve_graph() -> StructureGraph {
        let mut g = StructureGraph::new("g");
        g.add_part(Part::curve(
            "c",
            vec![
                Point3D::new(0.0, 0.0, 0.0),
                Point3D::new(1.0, 0.0, 0.0),
                Point3D::new(2.0, 0.0, 0.0),
            ],
        ));
        g
    }

    #[test]
    fn test_undeformed_shape_costs_nothing() {
        let mut g = one_curve_graph();
        prepare(&mut g);
        assert!(evaluate(&g) < 1e-12);
    }

    #[test]
    fn test_rigid_motion_costs_nothing() {
        let mut g = one_curve_graph();
        prepare(&mut g);

        g.part_mut("c").unwrap().translate(Vector3D::new(3.0, -1.0, 2.0));
        assert!(evaluate(&g) < 1e-12);
    }

    #[test]
    fn test_stretch_is_charged() {
        let mut g = one_curve_graph();
        prepare(&mut g);

        // Double the curve length
        for p in g.part_mut("c").unwrap().control_points_mut() {
            p.x *= 2.0;
        }

        let cost = evaluate(&g);
        assert!(cost > 0.5, "doubling spoke lengths should cost ~1, got {}", cost);
    }

    #[test]
    fn test_null_parts_pay_fixed_penalty() {
        let mut g = one_curve_graph();
        prepare(&mut g);

        {
            let part = g.part_mut("c").unwrap();
            part.collapse_to_centroid();
            part.assigned_null = true;
        }

        let cost = evaluate(&g);
        assert!((cost - NULL_PENALTY).abs() < 1e-12);
        assert!(cost.is_finite());
    }

    #[test]
    fn test_cost_averages_over_parts() {
        let mut g = one_curve_graph();
        g.add_part(Part::curve(
            "d",
            vec![Point3D::new(0.0, 5.0, 0.0), Point3D::new(2.0, 5.0, 0.0)],
        ));
        prepare(&mut g);

        // Only one of two parts is nulled: cost is half the penalty
        {
            let part = g.part_mut("c").unwrap();
            part.collapse_to_centroid();
            part.assigned_null = true;
        }

        let cost = evaluate(&g);
        assert!((cost - NULL_PENALTY / 2.0).abs() < 1e-12, "cost {}", cost);
    }
}
