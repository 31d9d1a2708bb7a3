// Structural analysis: symmetry groups and proximity relations
//
// Rebuilds the relation list of a structure graph from scratch, so the
// pass is idempotent. Detection order: translational groups, reflective
// pairs about the shape's center planes, rotational arrangements around
// the vertical axis, then singleton proximity relations for everything
// left over. The resulting relations partition the parts.

use crate::correspond::part::Part;
use crate::correspond::structure_graph::{
    MemberOp, Relation, RelationKind, StructureGraph,
};
use crate::geometry::{Plane, Point3D, Vector3D};

/// Relative tolerance for geometric matches, scaled by the shape diagonal
const MATCH_TOLERANCE: f64 = 0.08;

/// Detect symmetry and proximity relations and write them back onto the
/// graph. Running it twice produces the same relation list.
pub fn analyze(graph: &mut StructureGraph) {
    graph.relations.clear();

    let diag = graph.bbox().diagonal();
    if diag < 1e-12 {
        for part in &graph.parts {
            graph.relations.push(Relation::singleton(&part.id));
        }
        return;
    }
    let tol = MATCH_TOLERANCE * diag;

    let n = graph.parts.len();
    let mut grouped = vec![false; n];
    let mut relations = Vec::new();

    detect_translational(graph, tol, &mut grouped, &mut relations);
    detect_rotational(graph, tol, &mut grouped, &mut relations);
    detect_reflective(graph, tol, &mut grouped, &mut relations);

    // Everything ungrouped becomes its own proximity cluster
    for (i, part) in graph.parts.iter().enumerate() {
        if !grouped[i] {
            relations.push(Relation::singleton(&part.id));
        }
    }

    log::debug!(
        "analysis of '{}': {} parts, {} relations",
        graph.name,
        n,
        relations.len()
    );
    graph.relations = relations;
}

/// Sampled positions of a part under an optional parameter flip
fn samples(part: &Part, flip0: bool, flip1: bool) -> Vec<Point3D> {
    part.sample_coords(4)
        .iter()
        .map(|c| {
            let mut coord = *c;
            if flip0 {
                coord[0] = 1.0 - coord[0];
            }
            if flip1 {
                coord[1] = 1.0 - coord[1];
            }
            part.position_at(&coord)
        })
        .collect()
}

/// Mean distance between a transformed copy of `a` and `b`, minimized
/// over the four parameter orientations of `a`
fn match_error<F: Fn(&Point3D) -> Point3D>(a: &Part, b: &Part, transform: F) -> f64 {
    if a.kind() != b.kind() {
        return f64::INFINITY;
    }

    let b_samples = samples(b, false, false);
    let mut best = f64::INFINITY;

    for flip0 in [false, true] {
        for flip1 in [false, true] {
            if flip1 && a.is_curve() {
                continue;
            }
            let a_samples = samples(a, flip0, flip1);
            let err = a_samples
                .iter()
                .zip(&b_samples)
                .map(|(p, q)| (transform(p) - q).norm())
                .sum::<f64>()
                / a_samples.len() as f64;
            best = best.min(err);
        }
    }

    best
}

/// Union parts related by a pure translation into groups; member ops are
/// centroid deltas from the group's first part.
fn detect_translational(
    graph: &StructureGraph,
    tol: f64,
    grouped: &mut [bool],
    relations: &mut Vec<Relation>,
) {
    let n = graph.parts.len();

    for i in 0..n {
        if grouped[i] {
            continue;
        }

        let mut members = vec![i];
        for j in (i + 1)..n {
            if grouped[j] {
                continue;
            }
            let (a, b) = (&graph.parts[i], &graph.parts[j]);
            let delta = b.centroid() - a.centroid();
            if delta.norm() < tol {
                continue; // coincident parts are not a translation pair
            }
            if match_error(a, b, |p| p + delta) < tol {
                members.push(j);
            }
        }

        if members.len() < 2 {
            continue;
        }

        let base = graph.parts[members[0]].centroid();
        let mut relation = Relation {
            kind: RelationKind::Translational,
            parts: Vec::new(),
            ops: Vec::new(),
        };
        for &m in &members {
            grouped[m] = true;
            relation.parts.push(graph.parts[m].id.clone());
            let delta = graph.parts[m].centroid() - base;
            relation.ops.push(if delta.norm() < 1e-12 {
                MemberOp::Identity
            } else {
                MemberOp::Translate(delta)
            });
        }
        relations.push(relation);
    }
}

/// Pairs mirrored about the shape's center planes (x and y)
fn detect_reflective(
    graph: &StructureGraph,
    tol: f64,
    grouped: &mut [bool],
    relations: &mut Vec<Relation>,
) {
    let center = graph.bbox().center();
    let planes = [
        Plane::new(center, Vector3D::x()),
        Plane::new(center, Vector3D::y()),
    ];

    let n = graph.parts.len();
    for i in 0..n {
        if grouped[i] {
            continue;
        }
        'search: for j in (i + 1)..n {
            if grouped[j] {
                continue;
            }
            for plane in &planes {
                let (a, b) = (&graph.parts[i], &graph.parts[j]);
                if match_error(a, b, |p| plane.reflect(p)) < tol {
                    grouped[i] = true;
                    grouped[j] = true;
                    relations.push(Relation {
                        kind: RelationKind::Reflective,
                        parts: vec![a.id.clone(), b.id.clone()],
                        ops: vec![MemberOp::Identity, MemberOp::Reflect(*plane)],
                    });
                    break 'search;
                }
            }
        }
    }
}

/// Three or more parts arranged around the vertical axis through the
/// shape center at a common radius
fn detect_rotational(
    graph: &StructureGraph,
    tol: f64,
    grouped: &mut [bool],
    relations: &mut Vec<Relation>,
) {
    let center = graph.bbox().center();
    let n = graph.parts.len();

    for i in 0..n {
        if grouped[i] {
            continue;
        }
        let base = &graph.parts[i];
        let base_offset = base.centroid() - center;
        let base_radius = Vector3D::new(base_offset.x, base_offset.y, 0.0).norm();
        if base_radius < tol {
            continue;
        }
        let base_angle = base_offset.y.atan2(base_offset.x);

        let mut members = vec![(i, 0.0f64)];
        for j in 0..n {
            if j == i || grouped[j] {
                continue;
            }
            let other = &graph.parts[j];
            let offset = other.centroid() - center;
            let radius = Vector3D::new(offset.x, offset.y, 0.0).norm();
            if (radius - base_radius).abs() > tol {
                continue;
            }

            let angle = offset.y.atan2(offset.x) - base_angle;
            let rotate = |p: &Point3D| {
                let rot = nalgebra::Rotation3::from_axis_angle(
                    &nalgebra::Unit::new_normalize(Vector3D::z()),
                    angle,
                );
                center + rot * (p - center)
            };
            if match_error(base, other, rotate) < tol {
                members.push((j, angle));
            }
        }

        if members.len() < 3 {
            continue;
        }

        let mut relation = Relation {
            kind: RelationKind::Rotational,
            parts: Vec::new(),
            ops: Vec::new(),
        };
        for &(m, angle) in &members {
            grouped[m] = true;
            relation.parts.push(graph.parts[m].id.clone());
            relation.ops.push(if angle.abs() < 1e-12 {
                MemberOp::Identity
            } else {
                MemberOp::Rotate {
                    center,
                    axis: Vector3D::z(),
                    angle,
                }
            });
        }
        relations.push(relation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspond::part::Part;

    fn vertical_leg(id: &str, x: f64, y: f64) -> Part {
        Part::curve(
            id,
            vec![Point3D::new(x, y, 0.0), Point3D::new(x, y, 1.0)],
        )
    }

    /// A seat sheet with four legs at the corners
    fn chair() -> StructureGraph {
        let mut g = StructureGraph::new("chair");
        g.add_part(Part::sheet(
            "seat",
            vec![
                Point3D::new(-1.0, -1.0, 1.0),
                Point3D::new(1.0, -1.0, 1.0),
                Point3D::new(-1.0, 1.0, 1.0),
                Point3D::new(1.0, 1.0, 1.0),
            ],
            2,
            2,
        ));
        for (id, x, y) in [
            ("leg0", -1.0, -1.0),
            ("leg1", 1.0, -1.0),
            ("leg2", 1.0, 1.0),
            ("leg3", -1.0, 1.0),
        ] {
            g.add_part(vertical_leg(id, x, y));
            g.add_link(id, "seat", vec![[1.0, 0.0, 0.0, 0.0]], vec![[0.5, 0.5, 0.0, 0.0]]);
        }
        g
    }

    #[test]
    fn test_relations_partition_parts() {
        let mut g = chair();
        analyze(&mut g);

        let mut seen = std::collections::HashSet::new();
        for rel in &g.relations {
            for id in &rel.parts {
                assert!(seen.insert(id.clone()), "part {} in two relations", id);
            }
        }
        assert_eq!(seen.len(), g.parts.len());
    }

    #[test]
    fn test_legs_group_together() {
        let mut g = chair();
        analyze(&mut g);

        let legs_relation = g
            .relations
            .iter()
            .find(|r| r.contains("leg0"))
            .expect("leg0 should be in a relation");
        assert_eq!(legs_relation.parts.len(), 4, "all four legs in one group");
        assert_ne!(legs_relation.kind, RelationKind::Proximity);

        // The seat stands alone
        let seat_relation = g.relations.iter().find(|r| r.contains("seat")).unwrap();
        assert_eq!(seat_relation.parts.len(), 1);
    }

    #[test]
    fn test_analysis_is_idempotent() {
        let mut g = chair();
        analyze(&mut g);
        let first: Vec<Vec<String>> = g.relations.iter().map(|r| r.parts.clone()).collect();

        analyze(&mut g);
        let second: Vec<Vec<String>> = g.relations.iter().map(|r| r.parts.clone()).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_translational_pair() {
        let mut g = StructureGraph::new("rails");
        g.add_part(vertical_leg("a", 0.0, 0.0));
        g.add_part(vertical_leg("b", 1.0, 0.0));
        // A far-away, differently sized part breaks any grouping with it
        g.add_part(Part::curve(
            "long",
            vec![Point3D::new(5.0, 5.0, 0.0), Point3D::new(5.0, 5.0, 4.0)],
        ));

        analyze(&mut g);

        let rel = g.relations.iter().find(|r| r.contains("a")).unwrap();
        assert!(rel.contains("b"));
        assert_eq!(rel.parts.len(), 2);

        // Mapping a through the relation lands on b
        let idx_a = rel.parts.iter().position(|p| p == "a").unwrap();
        let idx_b = rel.parts.iter().position(|p| p == "b").unwrap();
        let tip = Point3D::new(0.0, 0.0, 1.0);
        let mapped = rel.map_point(idx_a, idx_b, &tip);
        assert!((mapped - Point3D::new(1.0, 0.0, 1.0)).norm() < 1e-9);
    }
}
