// Guided-deformation search
//
// Explores partial correspondence assignments over an explicit LIFO
// stack of arena-allocated search nodes. Each node owns working copies
// of both structure graphs; applying its pending assignments runs the
// topological op and the deformation cascade, and the residual spoke
// distortion becomes the node cost. Candidate pairings for the next
// assignment are trial-applied on clones, in parallel, and survivors
// become children carrying fresh copies of the parent's graphs.

use crate::correspond::analysis::analyze;
use crate::correspond::compress::{CompressionTables, NULL_PART};
use crate::correspond::evaluate;
use crate::correspond::propagation::{apply_deformation, prepare_for_proximity};
use crate::correspond::structure_graph::{Relation, StructureGraph};
use crate::correspond::topology::apply_topological_op;
use crate::munkres;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How the many-to-many relation pairing is resolved. Greedy reproduces
/// the reference behavior; Munkres is the optimal substitution behind
/// the same seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Greedy,
    Munkres,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Maximum distance between relation centers (unit bbox coordinates)
    pub candidate_threshold: f64,

    /// Maximum cost change for an accepted pairing
    pub cost_threshold: f64,

    pub matcher: MatcherKind,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidate_threshold: 0.3,
            cost_threshold: 0.3,
            matcher: MatcherKind::Greedy,
        }
    }
}

/// A seed correspondence asserted as true before the search begins
#[derive(Debug, Clone)]
pub struct Landmark {
    pub sources: Vec<String>,
    pub targets: Vec<String>,
}

impl Landmark {
    pub fn new(source: &str, target: &str) -> Landmark {
        Landmark {
            sources: vec![source.to_string()],
            targets: vec![target.to_string()],
        }
    }
}

/// Cooperative cancellation, checked between node expansions
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// One node of the search forest. Part sets are stored compressed.
#[derive(Debug)]
pub struct SearchPath {
    pub shape_a: Option<Box<StructureGraph>>,
    pub shape_b: Option<Box<StructureGraph>>,
    pub fixed: BTreeSet<u32>,
    pub current: BTreeSet<u32>,
    pub assignments: Vec<(Vec<u32>, Vec<u32>)>,
    pub unassigned: BTreeSet<u32>,
    pub mapping: Vec<(u32, u32)>,
    pub cost: f64,
    pub children: Vec<usize>,
    is_root: bool,
    /// Set when applying the node's own assignments failed; a dead node
    /// is never a leaf
    dead: bool,
}

impl SearchPath {
    pub fn is_leaf(&self) -> bool {
        !self.dead && self.unassigned.is_empty()
    }
}

pub struct Search {
    pub nodes: Vec<SearchPath>,
    roots: Vec<usize>,
    tables: Arc<CompressionTables>,
    null_index: u32,
    config: SearchConfig,
}

impl Search {
    /// Set up the working copies, run the structural analysis on both
    /// shapes, and build the root from the landmark assignments.
    pub fn new(
        shape_a: &StructureGraph,
        shape_b: &StructureGraph,
        landmarks: &[Landmark],
        config: SearchConfig,
    ) -> Search {
        let mut a = shape_a.clone();
        let mut b = shape_b.clone();

        analyze(&mut a);
        analyze(&mut b);
        prepare_for_proximity(&mut a);
        evaluate::prepare(&mut a);
        a.save_keyframe();

        let tables = Arc::new(CompressionTables::for_graphs(&a, &b));
        let null_index = tables.target.intern(NULL_PART);

        let combined = combine_landmarks(&a, landmarks);

        let mut current = BTreeSet::new();
        let mut assignments = Vec::new();
        for lm in &combined {
            let la = tables.source.compress(&lm.sources);
            let lb = tables.target.compress(&lm.targets);
            current.extend(la.iter().copied());
            assignments.push((la, lb));
        }

        let unassigned: BTreeSet<u32> = a
            .parts
            .iter()
            .map(|p| tables.source.intern(&p.id))
            .filter(|i| !current.contains(i))
            .collect();

        let root = SearchPath {
            shape_a: Some(Box::new(a)),
            shape_b: Some(Box::new(b)),
            fixed: BTreeSet::new(),
            current,
            assignments,
            unassigned,
            mapping: Vec::new(),
            cost: 0.0,
            children: Vec::new(),
            is_root: true,
            dead: false,
        };

        Search {
            nodes: vec![root],
            roots: vec![0],
            tables,
            null_index,
            config,
        }
    }

    /// Run the search to exhaustion (or cancellation). The stack is
    /// explicit: trees get 20-30 deep and the memory-saving rule needs
    /// expansion to finish before a node's shapes are dropped.
    pub fn explore(&mut self, cancel: &CancelToken) {
        let mut stack: Vec<usize> = self.roots.clone();
        stack.reverse();

        while let Some(index) = stack.pop() {
            if cancel.is_cancelled() {
                log::info!("search cancelled; dropping pending nodes");
                for pending in stack {
                    if !self.nodes[pending].is_root {
                        self.nodes[pending].shape_a = None;
                        self.nodes[pending].shape_b = None;
                    }
                }
                return;
            }

            let children = self.expand(index);

            // LIFO over the accepted children, stored in acceptance order
            for &c in children.iter().rev() {
                stack.push(c);
            }
        }
    }

    /// Every leaf, cheapest first
    pub fn solutions(&self) -> Vec<&SearchPath> {
        let mut leaves: Vec<&SearchPath> = self.nodes.iter().filter(|n| n.is_leaf()).collect();
        leaves.sort_by(|a, b| a.cost.partial_cmp(&b.cost).unwrap());
        leaves
    }

    /// Mapping of the cheapest leaf, decompressed, null pairs filtered
    pub fn best_mapping(&self) -> Option<(Vec<(String, String)>, f64)> {
        let leaf = self.solutions().into_iter().next()?;
        Some((self.decompress_mapping(leaf), leaf.cost))
    }

    pub fn decompress_mapping(&self, leaf: &SearchPath) -> Vec<(String, String)> {
        leaf.mapping
            .iter()
            .filter(|&&(_, t)| t != self.null_index)
            .map(|&(s, t)| (self.tables.source.resolve(s), self.tables.target.resolve(t)))
            .collect()
    }

    /// Apply a node's pending assignments, evaluate its cost, form and
    /// trial the candidate pairings, and emit the accepted children.
    /// Returns the child indices.
    fn expand(&mut self, index: usize) -> Vec<usize> {
        let node = &mut self.nodes[index];
        let (Some(mut a), Some(mut b)) = (node.shape_a.take(), node.shape_b.take()) else {
            return Vec::new();
        };

        let assignments = node.assignments.clone();
        let fixed_union: BTreeSet<u32> = node.fixed.union(&node.current).copied().collect();
        let fixed_names: HashSet<String> = fixed_union
            .iter()
            .map(|&i| self.tables.source.resolve(i))
            .collect();

        // 1. Apply pending assignments
        let mut new_mapping = Vec::new();
        for (la_c, lb_c) in &assignments {
            let mut la = self.tables.source.decompress(la_c);
            let mut lb = self.tables.target.decompress(lb_c);

            if let Err(e) = apply_topological_op(&mut a, &mut b, &mut la, &mut lb, &self.tables) {
                log::warn!("assignment abandoned: {}", e);
                self.nodes[index].dead = true;
                return Vec::new();
            }

            let is_null = lb.iter().all(|t| t == NULL_PART);
            if !is_null {
                if let Err(e) = apply_deformation(&mut a, &b, &la, &lb, &fixed_names) {
                    log::warn!("assignment abandoned: {}", e);
                    self.nodes[index].dead = true;
                    return Vec::new();
                }
            }

            for (s, t) in la.iter().zip(&lb) {
                // Synthetic sub-curve ids truncate at the comma
                let t = t.split(',').next().unwrap_or(t);
                new_mapping.push((self.tables.source.intern(s), self.tables.target.intern(t)));
            }
        }

        // 2. Evaluate cost
        let cost = evaluate::evaluate(&a);

        let node = &mut self.nodes[index];
        node.mapping.extend(new_mapping);
        node.cost = cost;

        let current_names: Vec<String> = node
            .current
            .iter()
            .map(|&i| self.tables.source.resolve(i))
            .collect();
        let unassigned = node.unassigned.clone();
        let mapping = node.mapping.clone();
        let parent_cost = node.cost;

        // 3. Candidate source relations
        let candidates = self.candidate_relations(&a, &current_names, &fixed_union, &unassigned);

        // 4-6. Form pairings
        let allow_null = !fixed_union.is_empty();
        let pairings = self.form_pairings(&a, &b, &candidates, &unassigned, allow_null);

        // 7. Trial-apply every pairing on its own clones, in parallel
        let accepted: Vec<(Vec<u32>, Vec<u32>)> = pairings
            .par_iter()
            .filter_map(|(la, lb)| {
                let trial_cost = self.trial_cost(&a, &b, la, lb, &fixed_names)?;
                let is_null = lb.iter().all(|&t| t == self.null_index);
                if is_null || (trial_cost - parent_cost).abs() < self.config.cost_threshold {
                    Some((la.clone(), lb.clone()))
                } else {
                    None
                }
            })
            .collect();

        // 8. Emit children carrying fresh clones of the parent copies
        let mut child_indices = Vec::with_capacity(accepted.len());
        for (la, lb) in accepted {
            let mut child_fixed = fixed_union.clone();
            let child_current: BTreeSet<u32> = la.iter().copied().collect();
            child_fixed.retain(|i| !child_current.contains(i));

            let child_unassigned: BTreeSet<u32> = unassigned
                .iter()
                .copied()
                .filter(|i| !child_current.contains(i))
                .collect();

            let child = SearchPath {
                shape_a: Some(Box::new((*a).clone())),
                shape_b: Some(Box::new((*b).clone())),
                fixed: child_fixed,
                current: child_current,
                assignments: vec![(la, lb)],
                unassigned: child_unassigned,
                mapping: mapping.clone(),
                cost: parent_cost,
                children: Vec::new(),
                is_root: false,
                dead: false,
            };

            let child_index = self.nodes.len();
            self.nodes.push(child);
            self.nodes[index].children.push(child_index);
            child_indices.push(child_index);
        }

        // 10. Memory-saving rule: non-roots drop their shapes once the
        // children hold independent copies
        if self.nodes[index].is_root {
            self.nodes[index].shape_a = Some(a);
            self.nodes[index].shape_b = Some(b);
        }

        child_indices
    }

    /// Relations of A containing a part adjacent to the current set and
    /// not already fixed. Falls back to the first unassigned part's
    /// relation when empty.
    fn candidate_relations(
        &self,
        a: &StructureGraph,
        current_names: &[String],
        fixed_union: &BTreeSet<u32>,
        unassigned: &BTreeSet<u32>,
    ) -> Vec<Relation> {
        let mut adjacent: HashSet<String> = HashSet::new();
        for id in current_names {
            adjacent.extend(a.adjacent_parts(id));
        }

        let mut result: Vec<Relation> = Vec::new();
        for relation in &a.relations {
            let hit = relation.parts.iter().any(|p| {
                adjacent.contains(p)
                    && self
                        .tables
                        .source
                        .get(p)
                        .map(|i| !fixed_union.contains(&i) && unassigned.contains(&i))
                        .unwrap_or(false)
            });
            if hit {
                result.push(relation.clone());
            }
        }

        if result.is_empty() {
            if let Some(&first) = unassigned.iter().next() {
                let id = self.tables.source.resolve(first);
                if let Some(relation) = a.relations.iter().find(|r| r.contains(&id)) {
                    result.push(relation.clone());
                }
            }
        }

        result
    }

    /// Pair each candidate source relation against every target relation
    /// (plus the null relation), pruning by relative center distance and
    /// resolving many-to-many memberships.
    fn form_pairings(
        &self,
        a: &StructureGraph,
        b: &StructureGraph,
        candidates: &[Relation],
        unassigned: &BTreeSet<u32>,
        allow_null: bool,
    ) -> Vec<(Vec<u32>, Vec<u32>)> {
        let mut pairings = Vec::new();

        for r_a in candidates {
            // Only the still-unassigned members take part
            let la_names: Vec<String> = r_a
                .parts
                .iter()
                .filter(|p| {
                    self.tables
                        .source
                        .get(p)
                        .map(|i| unassigned.contains(&i))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if la_names.is_empty() {
                continue;
            }
            let center_a = a.relation_relative_center(r_a);

            for r_b in &b.relations {
                let center_b = b.relation_relative_center(r_b);
                if (center_a - center_b).norm() > self.config.candidate_threshold {
                    continue;
                }

                let lb_names = if la_names.len() > 1 && r_b.parts.len() > 1 {
                    self.match_many_to_many(a, b, r_a, &la_names, r_b)
                } else {
                    r_b.parts.clone()
                };

                pairings.push((
                    self.tables.source.compress(&la_names),
                    self.tables.target.compress(&lb_names),
                ));
            }

            if allow_null {
                let la = self.tables.source.compress(&la_names);
                let lb = vec![self.null_index; la.len()];
                pairings.push((la, lb));
            }
        }

        pairings
    }

    /// Match each source part to a target part by relative position
    /// within the relation bboxes. Greedy keeps the reference behavior
    /// (nearest center, independently per part); Munkres solves the
    /// assignment optimally through the same seam.
    fn match_many_to_many(
        &self,
        a: &StructureGraph,
        b: &StructureGraph,
        r_a: &Relation,
        la_names: &[String],
        r_b: &Relation,
    ) -> Vec<String> {
        let bbox_a = a.relation_bbox(r_a);
        let bbox_b = b.relation_bbox(r_b);

        let source_pos: Vec<_> = la_names
            .iter()
            .filter_map(|id| a.part(id))
            .map(|p| bbox_a.relative(&p.centroid()))
            .collect();
        let target_pos: Vec<_> = r_b
            .parts
            .iter()
            .filter_map(|id| b.part(id))
            .map(|p| bbox_b.relative(&p.centroid()))
            .collect();

        match self.config.matcher {
            MatcherKind::Greedy => source_pos
                .iter()
                .map(|sp| {
                    let nearest = target_pos
                        .iter()
                        .enumerate()
                        .min_by(|(_, x), (_, y)| {
                            (sp - *x).norm().partial_cmp(&(sp - *y).norm()).unwrap()
                        })
                        .map(|(j, _)| j)
                        .unwrap_or(0);
                    r_b.parts[nearest].clone()
                })
                .collect(),
            MatcherKind::Munkres => {
                let cost: Vec<Vec<f64>> = source_pos
                    .iter()
                    .map(|sp| target_pos.iter().map(|tp| (sp - tp).norm()).collect())
                    .collect();
                munkres::solve(&cost)
                    .into_iter()
                    .enumerate()
                    .map(|(i, j)| r_b.parts[j.unwrap_or(i % r_b.parts.len())].clone())
                    .collect()
            }
        }
    }

    /// Deep-copy the shapes, apply the op and the deformation, and
    /// measure the trial cost. None when the fit degenerates: the
    /// pairing is abandoned, the expansion continues.
    fn trial_cost(
        &self,
        a: &StructureGraph,
        b: &StructureGraph,
        la_c: &[u32],
        lb_c: &[u32],
        fixed_names: &HashSet<String>,
    ) -> Option<f64> {
        let mut ta = a.clone();
        let mut tb = b.clone();
        let mut la = self.tables.source.decompress(la_c);
        let mut lb = self.tables.target.decompress(lb_c);

        let mut fixed = fixed_names.clone();
        fixed.extend(la.iter().cloned());

        apply_topological_op(&mut ta, &mut tb, &mut la, &mut lb, &self.tables).ok()?;

        let is_null = lb.iter().all(|t| t == NULL_PART);
        if !is_null {
            apply_deformation(&mut ta, &tb, &la, &lb, &fixed).ok()?;
        }

        Some(evaluate::evaluate(&ta))
    }
}

/// Landmarks whose source parts share a relation group are combined into
/// one landmark, balancing list lengths by repeating the singleton side.
fn combine_landmarks(a: &StructureGraph, landmarks: &[Landmark]) -> Vec<Landmark> {
    if landmarks.is_empty() {
        return Vec::new();
    }

    let n = landmarks.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut Vec<usize>, x: usize) -> usize {
        if parent[x] != x {
            let root = find(parent, parent[x]);
            parent[x] = root;
        }
        parent[x]
    }

    for i in 0..n {
        for j in (i + 1)..n {
            let gi = landmarks[i]
                .sources
                .first()
                .map(|s| a.groups_of(s))
                .unwrap_or_default();
            let gj = landmarks[j]
                .sources
                .first()
                .map(|s| a.groups_of(s))
                .unwrap_or_default();
            if !gi.is_empty() && gi == gj {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj.max(ri)] = rj.min(ri);
                }
            }
        }
    }

    let mut combined: Vec<Landmark> = Vec::new();
    let mut root_slot: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();

    for i in 0..n {
        let mut sources = landmarks[i].sources.clone();
        let mut targets = landmarks[i].targets.clone();
        balance_in_number(&mut sources, &mut targets);

        let root = find(&mut parent, i);
        match root_slot.get(&root) {
            Some(&slot) => {
                combined[slot].sources.extend(sources);
                combined[slot].targets.extend(targets);
            }
            None => {
                root_slot.insert(root, combined.len());
                combined.push(Landmark { sources, targets });
            }
        }
    }

    combined
}

/// Repeat the singleton side until both lists have the same length
fn balance_in_number(a: &mut Vec<String>, b: &mut Vec<String>) {
    if a.len() == b.len() {
        return;
    }
    debug_assert!(a.len() == 1 || b.len() == 1);
    if a.len() == 1 {
        while a.len() < b.len() {
            a.push(a[0].clone());
        }
    } else {
        while b.len() < a.len() {
            b.push(b[0].clone());
        }
    }
}
