// Segmentation engine: particles to part labels
//
// Pipeline: recursive plane-cut splitting, similarity merging along
// principal directions, convex-hull-solidity merging, majority-vote
// smoothing, then dissolution of small segments. The splitter over-cuts
// on purpose; the merge passes reassemble convex pieces.

use crate::convex_hull::ConvexHull3;
use crate::geometry::{centroid, principal_axes, Point3D};
use crate::particles::{GraphWeight, ParticleMesh};
use crate::segment_graph::SegmentGraph;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct SegmentationConfig {
    /// Run the merge passes after splitting
    pub merge: bool,

    /// |cos| of principal directions above which neighbours merge
    pub similarity_threshold: f64,

    /// Minimum solidity of a merged hull for a convex merge
    pub solidity_threshold: f64,

    /// Minimum descriptor similarity (1 - |flat_i - flat_j|) for a merge
    pub descriptor_threshold: f64,

    /// Segments below this hull solidity are ignored by the similarity pass
    pub min_solidity_for_similar: f64,

    /// Segments with fewer than ceil(factor * gridsize) particles dissolve
    pub small_segment_factor: f64,

    /// Clusters stop splitting at size <= factor * gridsize
    pub split_size_factor: f64,

    /// Candidate cut planes tested along the dominant axis
    pub split_candidates: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            merge: true,
            similarity_threshold: 0.92,
            solidity_threshold: 0.6,
            descriptor_threshold: 0.4,
            min_solidity_for_similar: 0.35,
            small_segment_factor: 0.15,
            split_size_factor: 3.0,
            split_candidates: 8,
        }
    }
}

/// Segment the particle mesh in place. Returns the number of segments.
pub fn segment(pm: &mut ParticleMesh, config: &SegmentationConfig) -> usize {
    for p in &mut pm.particles {
        p.segment = 0;
    }

    split(pm, config);
    log::info!("Split produced {} clusters", count_segments(pm));

    if config.merge {
        merge_similar(pm, config);
        relabel_by_components(pm);
        log::info!("After similarity merge: {} clusters", count_segments(pm));

        merge_convex(pm, config);
        relabel_by_components(pm);
        log::info!("After solidity merge: {} clusters", count_segments(pm));

        pm.shrink_smaller_clusters();
        reassign_small_segments(pm, config);
    }

    let count = relabel_compact(pm);
    log::info!("Segmentation done: {} segments", count);
    count
}

fn count_segments(pm: &ParticleMesh) -> usize {
    let mut segs: Vec<usize> = pm.particles.iter().map(|p| p.segment).collect();
    segs.sort_unstable();
    segs.dedup();
    segs.len()
}

/// Make every connected component its own segment. Disconnected pieces
/// that ended up sharing a label get distinct ids again.
fn relabel_by_components(pm: &mut ParticleMesh) {
    let graph = pm.to_graph(GraphWeight::Distance);
    let (parts, _) = pm.segment_to_components(&graph);
    for (ci, part) in parts.iter().enumerate() {
        for v in part.vertices() {
            pm.particles[v as usize].segment = ci;
        }
    }
}

/// Renumber segments to 0..k in order of first appearance
fn relabel_compact(pm: &mut ParticleMesh) -> usize {
    let mut mapping = BTreeMap::new();
    for p in &mut pm.particles {
        let next = mapping.len();
        let new = *mapping.entry(p.segment).or_insert(next);
        p.segment = new;
    }
    mapping.len()
}

// ============================================================================
// Recursive plane-cut splitting
// ============================================================================

fn split(pm: &mut ParticleMesh, config: &SegmentationConfig) {
    let graph = pm.to_graph(GraphWeight::Distance);
    let size_threshold =
        ((config.split_size_factor * pm.grid.gridsize as f64).ceil() as usize).max(2);

    let mut stack: Vec<SegmentGraph> = graph.to_connected_parts();
    let mut next_segment = 0usize;

    while let Some(cluster) = stack.pop() {
        if cluster.vertex_count() <= size_threshold {
            finalize_cluster(pm, &cluster, &mut next_segment);
            continue;
        }

        match best_plane_cut(pm, &cluster, config) {
            Some((half_a, half_b)) => {
                for half in [half_a, half_b] {
                    // A half can fall apart into several components
                    stack.extend(half.to_connected_parts());
                }
            }
            None => finalize_cluster(pm, &cluster, &mut next_segment),
        }
    }
}

fn finalize_cluster(pm: &mut ParticleMesh, cluster: &SegmentGraph, next_segment: &mut usize) {
    for v in cluster.vertices() {
        pm.particles[v as usize].segment = *next_segment;
    }
    *next_segment += 1;
}

/// Try evenly spaced cut planes perpendicular to the dominant principal
/// axis; keep the cut with the lowest cost (compactness of the halves
/// plus alignment of their separation with the axis). None when every
/// candidate leaves one half empty.
fn best_plane_cut(
    pm: &ParticleMesh,
    cluster: &SegmentGraph,
    config: &SegmentationConfig,
) -> Option<(SegmentGraph, SegmentGraph)> {
    let vertices: Vec<u32> = cluster.vertices().collect();
    let positions = pm.positions(vertices.iter().copied());

    let axis = principal_axes(&positions)[0];
    let params: Vec<f64> = positions.iter().map(|p| p.coords.dot(&axis)).collect();
    let t_min = params.iter().cloned().fold(f64::INFINITY, f64::min);
    let t_max = params.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if t_max - t_min < 1e-9 {
        return None;
    }

    let total_sse = sse(&positions);
    let mut best: Option<(f64, f64)> = None; // (cost, cut)

    for k in 1..=config.split_candidates {
        let cut = t_min + (t_max - t_min) * k as f64 / (config.split_candidates + 1) as f64;

        let (mut pts_a, mut pts_b) = (Vec::new(), Vec::new());
        for (p, &t) in positions.iter().zip(&params) {
            if t < cut {
                pts_a.push(*p);
            } else {
                pts_b.push(*p);
            }
        }
        if pts_a.is_empty() || pts_b.is_empty() {
            continue;
        }

        let compactness = (sse(&pts_a) + sse(&pts_b)) / total_sse.max(1e-12);
        let separation = (centroid(&pts_b) - centroid(&pts_a)).normalize();
        let alignment = separation.dot(&axis).abs();
        let cost = compactness + 0.5 * (1.0 - alignment);

        if best.map_or(true, |(c, _)| cost < c) {
            best = Some((cost, cut));
        }
    }

    let (_, cut) = best?;

    let mut half_a = SegmentGraph::new();
    let mut half_b = SegmentGraph::new();
    for (&v, &t) in vertices.iter().zip(&params) {
        if t < cut {
            half_a.add_vertex(v);
        } else {
            half_b.add_vertex(v);
        }
    }
    for e in cluster.edges() {
        let ta = params[vertices.iter().position(|&v| v == e.a).unwrap()];
        let tb = params[vertices.iter().position(|&v| v == e.b).unwrap()];
        if ta < cut && tb < cut {
            half_a.add_edge(e.a, e.b, e.weight, e.index);
        } else if ta >= cut && tb >= cut {
            half_b.add_edge(e.a, e.b, e.weight, e.index);
        }
    }

    Some((half_a, half_b))
}

/// Sum of squared distances to the centroid
fn sse(points: &[Point3D]) -> f64 {
    let c = centroid(points);
    points.iter().map(|p| (p - c).norm_squared()).sum()
}

// ============================================================================
// Similarity merge
// ============================================================================

/// Merge adjacent segments whose principal directions are nearly
/// parallel, via union-find over the component-neighbourhood graph
fn merge_similar(pm: &mut ParticleMesh, config: &SegmentationConfig) {
    let graph = pm.to_graph(GraphWeight::Distance);
    let (candidates, nei_graph) = pm.segment_to_components(&graph);
    if candidates.is_empty() {
        return;
    }

    let directions: Vec<_> = candidates
        .iter()
        .map(|seg| {
            let positions = pm.positions(seg.vertices());
            principal_axes(&positions)[0]
        })
        .collect();

    let mut disjoint = DisjointSet::new(candidates.len());

    for (ci, seg) in candidates.iter().enumerate() {
        let hull = ConvexHull3::from_points(&pm.corners(seg.vertices()));
        if hull.solidity(pm.grid.unitlength) < config.min_solidity_for_similar {
            continue;
        }

        for ni in nei_graph.neighbours(ci as u32) {
            let similarity = directions[ci].dot(&directions[ni as usize]).abs();
            if similarity > config.similarity_threshold {
                disjoint.union(ci, ni as usize);
            }
        }
    }

    for (ci, seg) in candidates.iter().enumerate() {
        let root = disjoint.find(ci);
        for v in seg.vertices() {
            pm.particles[v as usize].segment = root;
        }
    }
}

// ============================================================================
// Convex-hull-solidity merge
// ============================================================================

/// In size order, offer each segment to its neighbours and accept the
/// merge with the best solidity, subject to the descriptor-similarity
/// veto. Repeats until no merge fires.
fn merge_convex(pm: &mut ParticleMesh, config: &SegmentationConfig) {
    let unitlength = pm.grid.unitlength;
    let mut done = false;

    while !done {
        done = true;

        let graph = pm.to_graph(GraphWeight::Distance);
        let (candidates, nei_graph) = pm.segment_to_components(&graph);

        let mut hulls: Vec<ConvexHull3> = candidates
            .iter()
            .map(|seg| ConvexHull3::from_points(&pm.corners(seg.vertices())))
            .collect();
        let mut live: Vec<bool> = vec![true; candidates.len()];

        let mut merging = true;
        while merging {
            merging = false;

            // Smallest segments first
            let mut order: Vec<usize> = (0..candidates.len()).filter(|&i| live[i]).collect();
            order.sort_by_key(|&i| candidates[i].vertex_count());

            for &ci in &order {
                let mut best_j = ci;
                let mut best_score = config.solidity_threshold;
                let mut best_hull = None;

                for nj in nei_graph.neighbours(ci as u32) {
                    let nj = nj as usize;
                    if !live[nj] || nj == ci {
                        continue;
                    }
                    let merged = hulls[ci].merged(&hulls[nj]);
                    let solidity = merged.solidity(unitlength);
                    if solidity > best_score {
                        best_score = solidity;
                        best_j = nj;
                        best_hull = Some(merged);
                    }
                }

                if best_j == ci {
                    continue; // no merge is good
                }

                // Descriptor veto: compare flatness at the hull centers
                let fi = flat_at(pm, &hulls[ci].center);
                let fj = flat_at(pm, &hulls[best_j].center);
                let similarity = 1.0 - (fi - fj).abs();
                if similarity < config.descriptor_threshold {
                    continue;
                }

                // Migrate the smaller side into the bigger
                let (big, small) = if candidates[ci].vertex_count() >= candidates[best_j].vertex_count()
                {
                    (ci, best_j)
                } else {
                    (best_j, ci)
                };

                let label = candidates[big].sid;
                for v in candidates[small].vertices() {
                    pm.particles[v as usize].segment = label;
                }
                for v in candidates[big].vertices() {
                    pm.particles[v as usize].segment = label;
                }

                hulls[big] = best_hull.expect("merge accepted with a hull");
                live[small] = false;

                merging = true;
                done = false;
                break;
            }
        }
    }
}

/// Flatness descriptor of the particle closest to a world point
fn flat_at(pm: &ParticleMesh, point: &Point3D) -> f64 {
    let reach = pm.bbox().diagonal();
    pm.closest_particles(point, reach)
        .first()
        .map(|&(_, id)| pm.particles[id].flat)
        .unwrap_or(0.0)
}

// ============================================================================
// Small-segment reassignment
// ============================================================================

/// Dissolve segments with fewer than ceil(factor * gridsize) particles:
/// their particles move to the nearest large neighbouring segment's
/// centroid. Iterates to a fixed point.
fn reassign_small_segments(pm: &mut ParticleMesh, config: &SegmentationConfig) {
    let threshold = (config.small_segment_factor * pm.grid.gridsize as f64).ceil() as usize;

    let mut done = false;
    while !done {
        done = true;

        let graph = pm.to_graph(GraphWeight::Distance);
        let (candidates, nei_graph) = pm.segment_to_components(&graph);

        let centers: Vec<Point3D> = candidates
            .iter()
            .map(|seg| centroid(&pm.positions(seg.vertices())))
            .collect();

        for (ci, small) in candidates.iter().enumerate() {
            if small.vertex_count() >= threshold {
                continue;
            }

            // Large neighbours only
            let mut choices: Vec<(usize, Point3D)> = nei_graph
                .neighbours(ci as u32)
                .map(|n| n as usize)
                .filter(|&n| candidates[n].vertex_count() >= threshold)
                .map(|n| (candidates[n].sid, centers[n]))
                .collect();
            choices.sort_by_key(|&(sid, _)| sid);

            if choices.is_empty() {
                continue;
            }

            let small_center = centers[ci];
            let (best_sid, _) = choices
                .iter()
                .min_by(|a, b| {
                    let da = (a.1 - small_center).norm();
                    let db = (b.1 - small_center).norm();
                    da.partial_cmp(&db).unwrap()
                })
                .copied()
                .unwrap();

            for v in small.vertices() {
                pm.particles[v as usize].segment = best_sid;
            }
            done = false;
        }
    }
}

// ============================================================================
// Disjoint set
// ============================================================================

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        DisjointSet {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller root wins, keeps labels deterministic
            let (lo, hi) = (ra.min(rb), ra.max(rb));
            self.parent[hi] = lo;
        }
    }
}
