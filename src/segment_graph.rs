// Undirected weighted graph over particle ids
//
// Backs both the particle adjacency graph (Dijkstra fields, component
// splitting) and the coarser segment-neighbourhood graph whose edges carry
// a fitted boundary plane (normal + center).

use crate::geometry::{Point3D, Vector3D};
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

fn fresh_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Edge key with the endpoints in canonical order
fn edge_key(a: u32, b: u32) -> (u32, u32) {
    (a.min(b), a.max(b))
}

#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub a: u32,
    pub b: u32,
    pub weight: f64,
    pub index: usize,
}

/// Metadata attached to a segment-neighbourhood edge: the boundary plane
/// between two components and how many particle edges cross it
#[derive(Debug, Clone, Copy)]
pub struct BoundaryMeta {
    pub normal: Vector3D,
    pub center: Point3D,
    pub crossing_count: usize,
}

/// Result of a Dijkstra run
#[derive(Debug, Clone, Default)]
pub struct ShortestPaths {
    pub distance: HashMap<u32, f64>,
    previous: HashMap<u32, u32>,
}

impl ShortestPaths {
    pub fn distance_to(&self, v: u32) -> f64 {
        self.distance.get(&v).copied().unwrap_or(f64::INFINITY)
    }

    /// Path from a source to `target`, source first. Empty when unreachable.
    pub fn path_to(&self, target: u32) -> Vec<u32> {
        if !self.distance.contains_key(&target) {
            return Vec::new();
        }
        let mut path = vec![target];
        let mut cur = target;
        while let Some(&prev) = self.previous.get(&cur) {
            path.push(prev);
            cur = prev;
        }
        path.reverse();
        path
    }

    /// Vertex with the largest finite distance
    pub fn farthest(&self) -> Option<(u32, f64)> {
        self.distance
            .iter()
            .filter(|(_, d)| d.is_finite())
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(&v, &d)| (v, d))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SegmentGraph {
    pub uid: u64,
    /// Segment id this component came from (set by component extraction)
    pub sid: usize,
    adj: BTreeMap<u32, Vec<(u32, f64)>>,
    edge_index: HashMap<(u32, u32), usize>,
    edge_meta: HashMap<(u32, u32), BoundaryMeta>,
}

impl SegmentGraph {
    pub fn new() -> Self {
        SegmentGraph {
            uid: fresh_uid(),
            sid: 0,
            adj: BTreeMap::new(),
            edge_index: HashMap::new(),
            edge_meta: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.adj.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.adj.len()
    }

    pub fn has_vertex(&self, v: u32) -> bool {
        self.adj.contains_key(&v)
    }

    pub fn vertices(&self) -> impl Iterator<Item = u32> + '_ {
        self.adj.keys().copied()
    }

    pub fn add_vertex(&mut self, v: u32) {
        self.adj.entry(v).or_default();
    }

    /// Add a symmetric edge. Re-adding an existing edge is a no-op.
    pub fn add_edge(&mut self, a: u32, b: u32, weight: f64, index: usize) {
        if a == b {
            return;
        }
        let key = edge_key(a, b);
        if self.edge_index.contains_key(&key) {
            return;
        }
        self.edge_index.insert(key, index);
        self.adj.entry(a).or_default().push((b, weight));
        self.adj.entry(b).or_default().push((a, weight));
    }

    pub fn remove_edge(&mut self, a: u32, b: u32) {
        if self.edge_index.remove(&edge_key(a, b)).is_none() {
            return;
        }
        if let Some(n) = self.adj.get_mut(&a) {
            n.retain(|&(t, _)| t != b);
        }
        if let Some(n) = self.adj.get_mut(&b) {
            n.retain(|&(t, _)| t != a);
        }
    }

    pub fn has_edge(&self, a: u32, b: u32) -> bool {
        self.edge_index.contains_key(&edge_key(a, b))
    }

    pub fn edges(&self) -> Vec<Edge> {
        let mut result: Vec<Edge> = self
            .edge_index
            .iter()
            .map(|(&(a, b), &index)| {
                let weight = self
                    .adj
                    .get(&a)
                    .and_then(|n| n.iter().find(|&&(t, _)| t == b))
                    .map(|&(_, w)| w)
                    .unwrap_or(0.0);
                Edge { a, b, weight, index }
            })
            .collect();
        result.sort_by_key(|e| e.index);
        result
    }

    pub fn neighbours(&self, v: u32) -> impl Iterator<Item = u32> + '_ {
        self.adj.get(&v).into_iter().flatten().map(|&(t, _)| t)
    }

    pub fn set_edge_meta(&mut self, a: u32, b: u32, meta: BoundaryMeta) {
        self.edge_meta.insert(edge_key(a, b), meta);
    }

    pub fn edge_meta(&self, a: u32, b: u32) -> Option<&BoundaryMeta> {
        self.edge_meta.get(&edge_key(a, b))
    }

    /// Single-source shortest paths
    pub fn dijkstra(&self, source: u32) -> ShortestPaths {
        self.dijkstra_many(std::iter::once(source))
    }

    /// Multi-source shortest paths: every source starts at distance 0.
    /// Ties in the queue break by insertion order.
    pub fn dijkstra_many<I: IntoIterator<Item = u32>>(&self, sources: I) -> ShortestPaths {
        let mut result = ShortestPaths::default();
        let mut heap: BinaryHeap<Reverse<(OrderedFloat<f64>, usize, u32)>> = BinaryHeap::new();
        let mut seq = 0usize;

        for s in sources {
            if !self.has_vertex(s) {
                continue;
            }
            result.distance.insert(s, 0.0);
            heap.push(Reverse((OrderedFloat(0.0), seq, s)));
            seq += 1;
        }

        while let Some(Reverse((OrderedFloat(dist), _, v))) = heap.pop() {
            if dist > result.distance_to(v) {
                continue; // stale entry
            }

            for &(next, weight) in self.adj.get(&v).into_iter().flatten() {
                let new_dist = dist + weight;
                if new_dist < result.distance_to(next) {
                    result.distance.insert(next, new_dist);
                    result.previous.insert(next, v);
                    heap.push(Reverse((OrderedFloat(new_dist), seq, next)));
                    seq += 1;
                }
            }
        }

        result
    }

    /// Split into connected components. Each component gets a fresh uid
    /// and inherits this graph's sid.
    pub fn to_connected_parts(&self) -> Vec<SegmentGraph> {
        let mut visited: BTreeMap<u32, bool> = self.adj.keys().map(|&v| (v, false)).collect();
        let mut parts = Vec::new();

        for &start in self.adj.keys() {
            if visited[&start] {
                continue;
            }

            let mut part = SegmentGraph::new();
            part.sid = self.sid;
            part.add_vertex(start);

            let mut stack = vec![start];
            visited.insert(start, true);

            while let Some(v) = stack.pop() {
                for &(next, weight) in self.adj.get(&v).into_iter().flatten() {
                    let index = self.edge_index[&edge_key(v, next)];
                    part.add_edge(v, next, weight, index);
                    if !visited[&next] {
                        visited.insert(next, true);
                        stack.push(next);
                    }
                }
            }

            parts.push(part);
        }

        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Line graph 0-1-2-3 with unit weights
    fn line_graph() -> SegmentGraph {
        let mut g = SegmentGraph::new();
        g.add_edge(0, 1, 1.0, 0);
        g.add_edge(1, 2, 1.0, 1);
        g.add_edge(2, 3, 1.0, 2);
        g
    }

    #[test]
    fn test_edges_are_symmetric() {
        let g = line_graph();
        assert!(g.neighbours(1).any(|v| v == 0));
        assert!(g.neighbours(0).any(|v| v == 1));
        assert_eq!(g.edges().len(), 3);
    }

    #[test]
    fn test_dijkstra_distances() {
        let g = line_graph();
        let sp = g.dijkstra(0);

        assert_eq!(sp.distance_to(0), 0.0);
        assert_eq!(sp.distance_to(3), 3.0);
        assert_eq!(sp.path_to(3), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_dijkstra_many_sources() {
        let g = line_graph();
        let sp = g.dijkstra_many([0, 3]);

        assert_eq!(sp.distance_to(1), 1.0);
        assert_eq!(sp.distance_to(2), 1.0);
    }

    #[test]
    fn test_connected_parts_after_cut() {
        let mut g = line_graph();
        g.remove_edge(1, 2);

        let parts = g.to_connected_parts();
        assert_eq!(parts.len(), 2);

        let mut sizes: Vec<usize> = parts.iter().map(|p| p.vertex_count()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![2, 2]);

        // Fresh uids per component
        assert_ne!(parts[0].uid, parts[1].uid);
    }

    #[test]
    fn test_dijkstra_unreachable() {
        let mut g = line_graph();
        g.add_vertex(10);

        let sp = g.dijkstra(0);
        assert!(sp.distance_to(10).is_infinite());
        assert!(sp.path_to(10).is_empty());
    }
}
