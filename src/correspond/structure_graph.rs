// Structure graph: the abstract part graph the search operates on
//
// Nodes are curve/sheet parts, edges record inter-part attachments as
// parametric coordinates on both endpoints, and relations group parts by
// detected symmetry or proximity. Endpoints are referenced by part id,
// never by pointer, so a graph deep-copies with a plain Clone.

use crate::geometry::{Aabb, Plane, Point3D, Vector3D};
use crate::correspond::part::{Coord4, Part, PartKind};
use nalgebra::{Rotation3, Unit};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Failed to read graph file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed graph file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown part id: {0}")]
    UnknownPart(String),
}

/// Edge between two parts. Each endpoint stores a list of parametric
/// attachment coordinates on its own part.
#[derive(Debug, Clone)]
pub struct Link {
    pub a: String,
    pub b: String,
    pub coord_a: Vec<Coord4>,
    pub coord_b: Vec<Coord4>,
}

impl Link {
    pub fn other(&self, id: &str) -> &str {
        if self.a == id {
            &self.b
        } else {
            &self.a
        }
    }

    pub fn touches(&self, id: &str) -> bool {
        self.a == id || self.b == id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Translational,
    Rotational,
    Reflective,
    Proximity,
}

/// Per-member transform relative to the relation's canonical member
#[derive(Debug, Clone, Copy)]
pub enum MemberOp {
    Identity,
    Reflect(Plane),
    Translate(Vector3D),
    Rotate {
        center: Point3D,
        axis: Vector3D,
        angle: f64,
    },
}

impl MemberOp {
    fn apply(&self, p: &Point3D) -> Point3D {
        match self {
            MemberOp::Identity => *p,
            MemberOp::Reflect(plane) => plane.reflect(p),
            MemberOp::Translate(delta) => p + delta,
            MemberOp::Rotate { center, axis, angle } => {
                let rot = Rotation3::from_axis_angle(&Unit::new_normalize(*axis), *angle);
                center + rot * (p - center)
            }
        }
    }

    fn inverse(&self) -> MemberOp {
        match self {
            MemberOp::Identity => MemberOp::Identity,
            MemberOp::Reflect(plane) => MemberOp::Reflect(*plane),
            MemberOp::Translate(delta) => MemberOp::Translate(-delta),
            MemberOp::Rotate { center, axis, angle } => MemberOp::Rotate {
                center: *center,
                axis: *axis,
                angle: -angle,
            },
        }
    }
}

/// A set of parts sharing a symmetry or proximity property. Symmetry
/// relations store, per member, the transform from the canonical member
/// (parts[0]) onto that member.
#[derive(Debug, Clone)]
pub struct Relation {
    pub kind: RelationKind,
    pub parts: Vec<String>,
    pub ops: Vec<MemberOp>,
}

impl Relation {
    pub fn singleton(id: impl Into<String>) -> Relation {
        Relation {
            kind: RelationKind::Proximity,
            parts: vec![id.into()],
            ops: vec![MemberOp::Identity],
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parts.iter().any(|p| p == id)
    }

    /// Map a point from member `from` onto member `to`, through the
    /// canonical member.
    pub fn map_point(&self, from: usize, to: usize, p: &Point3D) -> Point3D {
        let canonical = self.ops[from].inverse().apply(p);
        self.ops[to].apply(&canonical)
    }
}

#[derive(Debug, Clone)]
struct Keyframe {
    ctrl: Vec<(String, Vec<Point3D>)>,
    link_coords: Vec<(Vec<Coord4>, Vec<Coord4>)>,
}

#[derive(Debug, Clone, Default)]
pub struct StructureGraph {
    pub name: String,
    pub parts: Vec<Part>,
    pub links: Vec<Link>,
    pub relations: Vec<Relation>,
    keyframes: Vec<Keyframe>,
}

impl StructureGraph {
    pub fn new(name: impl Into<String>) -> StructureGraph {
        StructureGraph {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn part(&self, id: &str) -> Option<&Part> {
        self.parts.iter().find(|p| p.id == id)
    }

    pub fn part_mut(&mut self, id: &str) -> Option<&mut Part> {
        self.parts.iter_mut().find(|p| p.id == id)
    }

    pub fn part_index(&self, id: &str) -> Option<usize> {
        self.parts.iter().position(|p| p.id == id)
    }

    pub fn add_part(&mut self, part: Part) {
        debug_assert!(self.part(&part.id).is_none(), "duplicate part id {}", part.id);
        self.parts.push(part);
    }

    /// Remove a part together with its links; relations drop the member.
    pub fn remove_part(&mut self, id: &str) {
        self.parts.retain(|p| p.id != id);
        self.links.retain(|l| !l.touches(id));
        self.remove_from_relations(id);
    }

    /// Drop a part from every relation, pruning emptied relations
    pub fn remove_from_relations(&mut self, id: &str) {
        for rel in &mut self.relations {
            while let Some(pos) = rel.parts.iter().position(|p| p == id) {
                rel.parts.remove(pos);
                rel.ops.remove(pos);
            }
        }
        self.relations.retain(|r| !r.parts.is_empty());
    }

    pub fn add_link(&mut self, a: &str, b: &str, coord_a: Vec<Coord4>, coord_b: Vec<Coord4>) {
        self.links.push(Link {
            a: a.to_string(),
            b: b.to_string(),
            coord_a,
            coord_b,
        });
    }

    pub fn links_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.iter().filter(move |l| l.touches(id))
    }

    /// Ids of parts sharing a link with `id`
    pub fn adjacent_parts(&self, id: &str) -> Vec<String> {
        let mut result: Vec<String> = self
            .links_of(id)
            .map(|l| l.other(id).to_string())
            .collect();
        result.sort();
        result.dedup();
        result
    }

    /// Indices of relations containing a part
    pub fn groups_of(&self, id: &str) -> Vec<usize> {
        self.relations
            .iter()
            .enumerate()
            .filter(|(_, r)| r.contains(id))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn bbox(&self) -> Aabb {
        let mut aabb = Aabb::empty();
        for p in &self.parts {
            aabb.merge(&p.bbox());
        }
        aabb
    }

    pub fn relation_bbox(&self, relation: &Relation) -> Aabb {
        let mut aabb = Aabb::empty();
        for id in &relation.parts {
            if let Some(p) = self.part(id) {
                aabb.merge(&p.bbox());
            }
        }
        aabb
    }

    /// Center of a relation's bbox in unit coordinates of the whole graph
    pub fn relation_relative_center(&self, relation: &Relation) -> Vector3D {
        self.bbox().relative(&self.relation_bbox(relation).center())
    }

    /// World gap between the two attachment points of a link
    pub fn link_gap(&self, link: &Link) -> f64 {
        match (self.part(&link.a), self.part(&link.b)) {
            (Some(pa), Some(pb)) => {
                let ca = link.coord_a.first().copied().unwrap_or([0.0; 4]);
                let cb = link.coord_b.first().copied().unwrap_or([0.0; 4]);
                (pa.position_at(&ca) - pb.position_at(&cb)).norm()
            }
            _ => f64::INFINITY,
        }
    }

    /// Average link gap over the whole graph
    pub fn avg_link_gap(&self) -> f64 {
        if self.links.is_empty() {
            return 0.0;
        }
        self.links.iter().map(|l| self.link_gap(l)).sum::<f64>() / self.links.len() as f64
    }

    /// Deep-copy current control points and edge coordinates onto the
    /// keyframe stack
    pub fn save_keyframe(&mut self) {
        let ctrl = self
            .parts
            .iter()
            .map(|p| (p.id.clone(), p.control_points().to_vec()))
            .collect();
        let link_coords = self
            .links
            .iter()
            .map(|l| (l.coord_a.clone(), l.coord_b.clone()))
            .collect();
        self.keyframes.push(Keyframe { ctrl, link_coords });
    }

    pub fn keyframe_count(&self) -> usize {
        self.keyframes.len()
    }

    /// Reverse a curve part and remap every stored coordinate on it
    /// (t -> 1 - t) so attachments stay put.
    pub fn reverse_curve_part(&mut self, id: &str) {
        if let Some(part) = self.part_mut(id) {
            if !part.is_curve() {
                return;
            }
            part.reverse_curve();
        }
        for link in &mut self.links {
            if link.a == id {
                for c in &mut link.coord_a {
                    c[0] = 1.0 - c[0];
                }
            }
            if link.b == id {
                for c in &mut link.coord_b {
                    c[0] = 1.0 - c[0];
                }
            }
        }
    }

    /// Align the parameterization of a source part to a target part of
    /// the same type, so a control-point morph between them is
    /// well-defined: curves may reverse, sheets may flip either lattice
    /// axis. Stored edge coordinates are remapped along with the part.
    pub fn correspond_two_nodes(&mut self, src_id: &str, target: &StructureGraph, tgt_id: &str) {
        let (Some(src), Some(tgt)) = (self.part(src_id), target.part(tgt_id)) else {
            return;
        };
        if src.kind() != tgt.kind() {
            return;
        }

        match src.kind() {
            PartKind::Curve => {
                if alignment_cost(src, tgt, false, false) > alignment_cost(src, tgt, true, false) {
                    self.reverse_curve_part(src_id);
                }
            }
            PartKind::Sheet => {
                let flip_r = alignment_cost(src, tgt, true, false) < alignment_cost(src, tgt, false, false);
                if flip_r {
                    self.flip_sheet_part(src_id, true);
                }
                let (Some(src), Some(tgt)) = (self.part(src_id), target.part(tgt_id)) else {
                    return;
                };
                let flip_c = alignment_cost(src, tgt, false, true) < alignment_cost(src, tgt, false, false);
                if flip_c {
                    self.flip_sheet_part(src_id, false);
                }
            }
        }
    }

    fn flip_sheet_part(&mut self, id: &str, rows: bool) {
        if let Some(part) = self.part_mut(id) {
            if rows {
                part.flip_rows();
            } else {
                part.flip_cols();
            }
        }
        let lane = if rows { 0 } else { 1 };
        for link in &mut self.links {
            if link.a == id {
                for c in &mut link.coord_a {
                    c[lane] = 1.0 - c[lane];
                }
            }
            if link.b == id {
                for c in &mut link.coord_b {
                    c[lane] = 1.0 - c[lane];
                }
            }
        }
    }

    /// Merge two or more curves into a single sheet whose isolines
    /// approximate the input curves. Curves are ordered across their
    /// common transverse direction and resampled to a shared count.
    pub fn convert_curves_to_sheet(&self, curve_ids: &[String], sides: usize) -> Option<Part> {
        if curve_ids.len() < 2 {
            return None;
        }
        let curves: Vec<&Part> = curve_ids
            .iter()
            .filter_map(|id| self.part(id))
            .filter(|p| p.is_curve())
            .collect();
        if curves.len() < 2 {
            return None;
        }

        // Order across the direction of largest centroid spread
        let centroids: Vec<Point3D> = curves.iter().map(|c| c.centroid()).collect();
        let axis = crate::geometry::principal_axes(&centroids)[0];
        let mut order: Vec<usize> = (0..curves.len()).collect();
        order.sort_by(|&i, &j| {
            let ti = centroids[i].coords.dot(&axis);
            let tj = centroids[j].coords.dot(&axis);
            ti.partial_cmp(&tj).unwrap()
        });

        let cols = sides.max(2);
        let mut ctrl = Vec::with_capacity(curves.len() * cols);
        for &i in &order {
            for k in 0..cols {
                let t = k as f64 / (cols - 1) as f64;
                ctrl.push(curves[i].position_at(&[t, 0.0, 0.0, 0.0]));
            }
        }

        let id = curve_ids.join("+");
        Some(Part::sheet(id, ctrl, curves.len(), cols))
    }

    /// Extract a curve along an iso-parametric line of a sheet:
    /// `start` fixes the first parametric lane, samples vary the second.
    pub fn convert_to_curve(&self, sheet_id: &str, start: f64, samples: usize) -> Option<Part> {
        let sheet = self.part(sheet_id)?;
        if !sheet.is_sheet() {
            return None;
        }

        let n = samples.max(2);
        let ctrl: Vec<Point3D> = (0..n)
            .map(|k| {
                let v = k as f64 / (n - 1) as f64;
                sheet.position_at(&[start.clamp(0.0, 1.0), v, 0.0, 0.0])
            })
            .collect();

        Some(Part::curve(format!("{},{:.3}", sheet_id, start), ctrl))
    }
}

/// Sum of distances between sampled positions of two parts, optionally
/// flipping the source parameterization
fn alignment_cost(src: &Part, tgt: &Part, flip_first: bool, flip_second: bool) -> f64 {
    let coords = src.sample_coords(4);
    coords
        .iter()
        .map(|c| {
            let mut flipped = *c;
            if flip_first {
                flipped[0] = 1.0 - flipped[0];
            }
            if flip_second {
                flipped[1] = 1.0 - flipped[1];
            }
            (src.position_at(&flipped) - tgt.position_at(c)).norm()
        })
        .sum()
}

// ============================================================================
// Structure-graph file loading
// ============================================================================

#[derive(Debug, Deserialize)]
struct NodeFile {
    id: String,
    #[serde(rename = "type")]
    kind: PartKind,
    ctrl: Vec<[f64; 3]>,
    #[serde(default)]
    rows: Option<usize>,
    #[serde(default)]
    cols: Option<usize>,
    #[serde(default)]
    meta: MetaFile,
}

#[derive(Debug, Default, Deserialize)]
struct MetaFile {
    #[serde(default)]
    label: String,
    #[serde(default)]
    mesh: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EdgeFile {
    a: String,
    b: String,
    #[serde(default)]
    coord_a: Vec<Coord4>,
    #[serde(default)]
    coord_b: Vec<Coord4>,
}

#[derive(Debug, Deserialize)]
struct GraphFile {
    #[serde(default)]
    name: String,
    nodes: Vec<NodeFile>,
    #[serde(default)]
    edges: Vec<EdgeFile>,
}

impl StructureGraph {
    /// Load a structure graph from its JSON file. Consumed read-only;
    /// relations are detected afterwards by the structural analysis.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<StructureGraph, GraphError> {
        let text = std::fs::read_to_string(&path)?;
        let file: GraphFile = serde_json::from_str(&text)?;

        let mut graph = StructureGraph::new(if file.name.is_empty() {
            path.as_ref().to_string_lossy().to_string()
        } else {
            file.name
        });

        for node in file.nodes {
            let ctrl: Vec<Point3D> = node
                .ctrl
                .iter()
                .map(|c| Point3D::new(c[0], c[1], c[2]))
                .collect();

            let mut part = match node.kind {
                PartKind::Curve => Part::curve(node.id, ctrl),
                PartKind::Sheet => {
                    let rows = node.rows.unwrap_or(2);
                    let cols = node.cols.unwrap_or_else(|| ctrl.len() / rows.max(1));
                    Part::sheet(node.id, ctrl, rows, cols)
                }
            };
            part.label = node.meta.label;
            part.mesh_path = node.meta.mesh;
            graph.add_part(part);
        }

        for edge in file.edges {
            for id in [&edge.a, &edge.b] {
                if graph.part(id).is_none() {
                    return Err(GraphError::UnknownPart(id.clone()));
                }
            }
            graph.add_link(&edge.a, &edge.b, edge.coord_a, edge.coord_b);
        }

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_part_graph() -> StructureGraph {
        let mut g = StructureGraph::new("test");
        g.add_part(Part::curve(
            "leg",
            vec![Point3D::new(0.0, 0.0, 0.0), Point3D::new(0.0, 0.0, 1.0)],
        ));
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
        g.add_link(
            "leg",
            "seat",
            vec![[1.0, 0.0, 0.0, 0.0]],
            vec![[0.5, 0.5, 0.0, 0.0]],
        );
        g
    }

    #[test]
    fn test_clone_is_deep() {
        let mut a = two_part_graph();
        let b = a.clone();

        a.part_mut("leg").unwrap().translate(Vector3D::new(5.0, 0.0, 0.0));

        let moved = a.part("leg").unwrap().control_points()[0];
        let kept = b.part("leg").unwrap().control_points()[0];
        assert!((moved.x - kept.x).abs() > 4.9);
    }

    #[test]
    fn test_link_gap_of_touching_parts() {
        let g = two_part_graph();
        let gap = g.link_gap(&g.links[0]);
        assert!(gap < 1e-9, "leg tip should touch seat center, gap {}", gap);
        assert!(g.avg_link_gap() < 1e-9);
    }

    #[test]
    fn test_reverse_curve_remaps_coords() {
        let mut g = two_part_graph();
        g.reverse_curve_part("leg");

        // The attachment used to be at t=1 (leg tip); after the flip it
        // sits at t=0 and still touches the seat
        assert!((g.links[0].coord_a[0][0] - 0.0).abs() < 1e-12);
        assert!(g.link_gap(&g.links[0]) < 1e-9);
    }

    #[test]
    fn test_remove_part_prunes_links_and_relations(){
        let mut g = two_part_graph();
        g.relations.push(Relation {
            kind: RelationKind::Proximity,
            parts: vec!["leg".into(), "seat".into()],
            ops: vec![MemberOp::Identity, MemberOp::Identity],
        });

        g.remove_part("leg");
        assert!(g.links.is_empty());
        assert_eq!(g.relations.len(), 1);
        assert_eq!(g.relations[0].parts, vec!["seat".to_string()]);
    }

    #[test]
    fn test_curves_to_sheet_isolines() {
        let mut g = StructureGraph::new("rails");
        g.add_part(Part::curve(
            "r0",
            vec![Point3D::new(0.0, 0.0, 0.0), Point3D::new(1.0, 0.0, 0.0)],
        ));
        g.add_part(Part::curve(
            "r1",
            vec![Point3D::new(0.0, 1.0, 0.0), Point3D::new(1.0, 1.0, 0.0)],
        ));

        let sheet = g
            .convert_curves_to_sheet(&["r0".to_string(), "r1".to_string()], 4)
            .unwrap();
        assert!(sheet.is_sheet());

        // First-row isoline stays on r0, last-row on r1
        let p0 = sheet.position_at(&[0.0, 0.5, 0.0, 0.0]);
        let p1 = sheet.position_at(&[1.0, 0.5, 0.0, 0.0]);
        assert!(p0.y.abs() < 1e-9);
        assert!((p1.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sheet_to_curve_extraction() {
        let g = two_part_graph();
        let curve = g.convert_to_curve("seat", 0.5, 4).unwrap();
        assert!(curve.is_curve());

        // Midline of the seat runs at y from -1 to 1 at x interpolated
        let mid = curve.position_at(&[0.5, 0.0, 0.0, 0.0]);
        assert!((mid.z - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_relation_map_point_reflection() {
        let plane = Plane::new(Point3D::origin(), Vector3D::x());
        let rel = Relation {
            kind: RelationKind::Reflective,
            parts: vec!["l".into(), "r".into()],
            ops: vec![MemberOp::Identity, MemberOp::Reflect(plane)],
        };

        let p = Point3D::new(2.0, 1.0, 0.0);
        let mapped = rel.map_point(0, 1, &p);
        assert!((mapped.x + 2.0).abs() < 1e-12);

        // Mapping back recovers the original
        let back = rel.map_point(1, 0, &mapped);
        assert!((back - p).norm() < 1e-12);
    }

    #[test]
    fn test_keyframes_cloned_with_graph() {
        let mut g = two_part_graph();
        g.save_keyframe();
        g.save_keyframe();

        let copy = g.clone();
        assert_eq!(copy.keyframe_count(), 2);
    }
}
