// Ground-truth scoring of correspondence results
//
// The labels file carries a flat taxonomy plus acceptable cross-label
// equivalences. The oracle groups labels with their cross-labeled
// siblings, elects a representative per group, builds the expected
// ground truth for a shape pair, and scores a produced matching with
// precision/recall. Also hosts the greedy OBB baseline the batch driver
// falls back to when the search yields no solution.

use crate::correspond::structure_graph::StructureGraph;
use crate::obb::Obb;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Missing input: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// Files
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct LabelEntry {
    pub title: String,
    #[serde(default)]
    pub parent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossLabel {
    pub first: String,
    pub second: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelsFile {
    pub labels: Vec<LabelEntry>,
    #[serde(rename = "cross-labels", default)]
    pub cross_labels: Vec<CrossLabel>,
}

impl LabelsFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<LabelsFile, EvalError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// One record of the correspondence result file, one per ordered shape
/// pair. An empty correspondence means the compute crashed on that pair
/// and consumers must skip it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrespondenceRecord {
    pub i: usize,
    pub j: usize,
    pub source: String,
    pub target: String,
    pub cost: f64,
    pub correspondence: Vec<(String, String)>,
}

pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<CorrespondenceRecord>, EvalError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

pub fn save_records<P: AsRef<Path>>(
    path: P,
    records: &[CorrespondenceRecord],
) -> Result<(), EvalError> {
    let text = serde_json::to_string_pretty(records)?;
    std::fs::write(path, text)?;
    Ok(())
}

// ============================================================================
// Oracle
// ============================================================================

/// A matching to score: the part labels on each side of one
/// correspondence pair. Broken records with one empty side take the
/// other side's label.
#[derive(Debug, Clone)]
pub struct MatchingRecord {
    pub source_label: String,
    pub target_label: String,
}

impl MatchingRecord {
    pub fn new(source_label: &str, target_label: &str) -> MatchingRecord {
        let (mut s, mut t) = (source_label.trim().to_string(), target_label.trim().to_string());
        if t.is_empty() {
            t = s.clone();
        }
        if s.is_empty() {
            s = t.clone();
        }
        MatchingRecord {
            source_label: s,
            target_label: t,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrecisionRecall {
    pub precision: f64,
    pub recall: f64,
    /// Ground-truth count
    pub g: usize,
    /// Returned matches
    pub m: usize,
    /// Correct matches
    pub r: usize,
}

#[derive(Debug, Default)]
pub struct LabelOracle {
    groups: BTreeMap<String, BTreeSet<String>>,
}

impl LabelOracle {
    pub fn from_labels(file: &LabelsFile) -> LabelOracle {
        let mut oracle = LabelOracle::default();
        for l in &file.labels {
            oracle.push(&l.title, &l.title);
        }
        for cl in &file.cross_labels {
            oracle.push(&cl.first, &cl.second);
        }
        oracle
    }

    /// Record an acceptable equivalence between two labels
    pub fn push(&mut self, first: &str, second: &str) {
        self.groups
            .entry(first.to_string())
            .or_default()
            .extend([first.to_string(), second.to_string()]);
        self.groups
            .entry(second.to_string())
            .or_default()
            .insert(second.to_string());
    }

    /// Lexicographically first member of a label's equivalence group
    pub fn representative(&self, label: &str) -> String {
        self.groups
            .get(label)
            .and_then(|g| g.iter().next().cloned())
            .unwrap_or_else(|| label.to_string())
    }

    /// Expected ground truth for a shape pair: drop labels with no
    /// equivalent on the other side, then count each representative at
    /// the maximum of its two appearance counts. None when nothing
    /// survives the filtering (precision/recall undefined).
    pub fn ground_truth(&self, source: &[String], target: &[String]) -> Option<GroundTruth> {
        let relevant = |me: &[String], other: &[String]| -> Vec<String> {
            me.iter()
                .filter(|label| {
                    other
                        .iter()
                        .any(|t| self.representative(t) == self.representative(label))
                })
                .cloned()
                .collect()
        };

        let source = relevant(source, target);
        let target = relevant(target, &source);

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut source_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut target_counts: BTreeMap<String, usize> = BTreeMap::new();
        for l in &source {
            *source_counts.entry(self.representative(l)).or_insert(0) += 1;
        }
        for l in &target {
            *target_counts.entry(self.representative(l)).or_insert(0) += 1;
        }
        for (label, &c) in source_counts.iter().chain(target_counts.iter()) {
            let s = source_counts.get(label).copied().unwrap_or(0);
            let t = target_counts.get(label).copied().unwrap_or(0);
            counts.insert(label.clone(), s.max(t).max(c));
        }

        if counts.values().sum::<usize>() == 0 {
            return None;
        }

        Some(GroundTruth {
            truth: counts,
        })
    }

    /// Score a matching against the pair's ground truth. None when the
    /// matching is empty or the ground truth is undefined.
    pub fn score(
        &self,
        truth: &GroundTruth,
        records: &[MatchingRecord],
    ) -> Option<PrecisionRecall> {
        let g: usize = truth.truth.values().sum();
        let m = records.len();
        if g == 0 || m == 0 {
            return None;
        }

        let mut r = 0usize;
        for record in records {
            let s = &record.source_label;
            let t = &record.target_label;

            let exact = s == t;

            // Only when one side is already coarse do we go up a level
            let source_is_coarse = self.representative(s) == *s;
            let target_is_coarse = self.representative(t) == *t;
            let acceptable = !exact
                && (source_is_coarse || target_is_coarse)
                && (self.representative(s) == *t || self.representative(t) == *s);

            if exact || acceptable {
                r += 1;
            }
        }

        Some(PrecisionRecall {
            precision: r as f64 / m as f64,
            recall: r as f64 / g as f64,
            g,
            m,
            r,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GroundTruth {
    pub truth: BTreeMap<String, usize>,
}

// ============================================================================
// Greedy OBB baseline
// ============================================================================

/// Match every source part to the target part with the most similar
/// oriented bounding box (relative center plus normalized size), each
/// target used at most once. The fallback matcher when the search
/// reports no solution.
pub fn greedy_obb_baseline(a: &StructureGraph, b: &StructureGraph) -> Vec<(String, String)> {
    let bbox_a = a.bbox();
    let bbox_b = b.bbox();
    let scale_a = bbox_a.diagonal().max(1e-12);
    let scale_b = bbox_b.diagonal().max(1e-12);

    let descriptor = |part: &crate::correspond::part::Part, bbox: &crate::geometry::Aabb, scale: f64| {
        let obb = Obb::best_fit(part.control_points());
        let rel = bbox.relative(&obb.center);
        (rel, obb.diagonal() / scale)
    };

    let targets: Vec<_> = b
        .parts
        .iter()
        .map(|p| (p.id.clone(), descriptor(p, &bbox_b, scale_b)))
        .collect();

    let mut used: BTreeSet<usize> = BTreeSet::new();
    let mut result = Vec::new();

    for part in &a.parts {
        let (rel, size) = descriptor(part, &bbox_a, scale_a);

        let best = targets
            .iter()
            .enumerate()
            .filter(|(ti, _)| !used.contains(ti))
            .min_by(|(_, (_, x)), (_, (_, y))| {
                let dx = (rel - x.0).norm() + (size - x.1).abs();
                let dy = (rel - y.0).norm() + (size - y.1).abs();
                dx.partial_cmp(&dy).unwrap()
            })
            .map(|(ti, (tid, _))| (ti, tid.clone()));

        if let Some((ti, tid)) = best {
            used.insert(ti);
            result.push((part.id.clone(), tid));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspond::part::Part;
    use crate::geometry::Point3D;

    fn oracle() -> LabelOracle {
        let file = LabelsFile {
            labels: vec![
                LabelEntry { title: "seat".into(), parent: "chair".into() },
                LabelEntry { title: "back".into(), parent: "chair".into() },
                LabelEntry { title: "leg-front".into(), parent: "chair".into() },
                LabelEntry { title: "leg-back".into(), parent: "chair".into() },
            ],
            cross_labels: vec![CrossLabel {
                first: "leg-front".into(),
                second: "leg-back".into(),
            }],
        };
        LabelOracle::from_labels(&file)
    }

    #[test]
    fn test_exact_matches_score_full_precision() {
        let oracle = oracle();
        let labels: Vec<String> = vec!["seat".into(), "back".into()];
        let truth = oracle.ground_truth(&labels, &labels).unwrap();

        let records = vec![
            MatchingRecord::new("seat", "seat"),
            MatchingRecord::new("back", "back"),
        ];

        let pr = oracle.score(&truth, &records).unwrap();
        assert_eq!(pr.r, 2);
        assert!((pr.precision - 1.0).abs() < 1e-12);
        assert!((pr.recall - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cross_labels_are_acceptable() {
        let oracle = oracle();
        // leg-back and leg-front share a group; its representative is
        // leg-back (lexicographic), so a coarse match is acceptable
        let rep = oracle.representative("leg-front");
        assert_eq!(rep, "leg-back");

        let labels: Vec<String> = vec!["leg-front".into()];
        let other: Vec<String> = vec!["leg-back".into()];
        let truth = oracle.ground_truth(&labels, &other).unwrap();

        let records = vec![MatchingRecord::new("leg-front", "leg-back")];
        let pr = oracle.score(&truth, &records).unwrap();
        assert_eq!(pr.r, 1, "cross-labeled match should count");
    }

    #[test]
    fn test_mismatch_hurts_precision() {
        let oracle = oracle();
        let labels: Vec<String> = vec!["seat".into(), "back".into()];
        let truth = oracle.ground_truth(&labels, &labels).unwrap();

        let records = vec![
            MatchingRecord::new("seat", "back"),
            MatchingRecord::new("back", "back"),
        ];

        let pr = oracle.score(&truth, &records).unwrap();
        assert_eq!(pr.r, 1);
        assert!((pr.precision - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_empty_ground_truth_is_undefined() {
        let oracle = oracle();
        let source: Vec<String> = vec!["seat".into()];
        let target: Vec<String> = vec!["back".into()];

        // No label has an equivalent on the other side
        assert!(oracle.ground_truth(&source, &target).is_none());
    }

    #[test]
    fn test_broken_record_takes_other_side() {
        let record = MatchingRecord::new("seat", "");
        assert_eq!(record.target_label, "seat");
    }

    #[test]
    fn test_record_round_trip() {
        let records = vec![CorrespondenceRecord {
            i: 0,
            j: 1,
            source: "a/graph.json".into(),
            target: "b/graph.json".into(),
            cost: 0.125,
            correspondence: vec![("seat".into(), "seat".into())],
        }];

        let dir = std::env::temp_dir().join("geotopo_records_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("corr.json");

        save_records(&path, &records).unwrap();
        let loaded = load_records(&path).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].correspondence[0].0, "seat");
        assert!((loaded[0].cost - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_obb_baseline_matches_identity() {
        let mut a = StructureGraph::new("a");
        a.add_part(Part::curve(
            "left",
            vec![Point3D::new(0.0, 0.0, 0.0), Point3D::new(0.0, 0.0, 1.0)],
        ));
        a.add_part(Part::curve(
            "right",
            vec![Point3D::new(2.0, 0.0, 0.0), Point3D::new(2.0, 0.0, 1.0)],
        ));
        let b = a.clone();

        let matching = greedy_obb_baseline(&a, &b);
        assert_eq!(matching.len(), 2);
        for (s, t) in matching {
            assert_eq!(s, t);
        }
    }
}
