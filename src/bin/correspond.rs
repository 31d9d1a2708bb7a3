// Batch correspondence driver
//
// Runs the guided-deformation search over every ordered pair of shapes
// in a dataset directory (one subdirectory per shape, each holding a
// graph.json), writes the correspondence result file, and optionally
// scores it against the labeled ground truth.
//
// Per-pair failures are logged and recorded with an empty
// correspondence; only configuration errors abort the batch.

use clap::Parser;
use geotopo::correspond::{CancelToken, Search, SearchConfig, MatcherKind, StructureGraph};
use geotopo::evaluation::{
    self, greedy_obb_baseline, CorrespondenceRecord, LabelOracle, LabelsFile, MatchingRecord,
};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "correspond", about = "Part-graph shape correspondence")]
struct Args {
    /// Dataset directory: one subdirectory per shape with a graph.json
    dataset: PathBuf,

    /// Output file; defaults to <dataset>/<dirname>_corr.json
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Score results against <dataset>/labels.json afterwards
    #[arg(short, long)]
    evaluate: bool,

    /// Use the optimal assignment solver for many-to-many pairings
    /// instead of the greedy nearest-center heuristic
    #[arg(long)]
    optimal_matching: bool,

    /// Fall back to the greedy OBB baseline when the search finds no
    /// solution for a pair
    #[arg(long)]
    baseline_fallback: bool,
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();

    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> geotopo::Result<()> {
    let shapes = shapes_in_dataset(&args.dataset)?;
    if shapes.len() < 2 {
        log::error!("dataset needs at least two shapes, found {}", shapes.len());
        return Ok(());
    }
    log::info!("Dataset: {} shapes", shapes.len());

    let dirname = args
        .dataset
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "dataset".into());
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.dataset.join(format!("{}_corr.json", dirname)));

    let config = SearchConfig {
        matcher: if args.optimal_matching {
            MatcherKind::Munkres
        } else {
            MatcherKind::Greedy
        },
        ..SearchConfig::default()
    };

    let mut records = Vec::new();

    for (i, source_path) in shapes.iter().enumerate() {
        for (j, target_path) in shapes.iter().enumerate() {
            if i == j {
                continue;
            }
            log::info!(
                "Pair {} -> {}: {} vs {}",
                i,
                j,
                source_path.display(),
                target_path.display()
            );
            records.push(correspond_pair(i, j, source_path, target_path, &config, args));
        }
    }

    evaluation::save_records(&output, &records)?;
    log::info!("Wrote {} records to {}", records.len(), output.display());

    if args.evaluate {
        score_records(&args.dataset, &records);
    }

    Ok(())
}

/// Shape subdirectories holding a graph.json, sorted by name
fn shapes_in_dataset(dataset: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut shapes = Vec::new();
    for entry in std::fs::read_dir(dataset)? {
        let path = entry?.path();
        if path.is_dir() && path.join("graph.json").is_file() {
            shapes.push(path.join("graph.json"));
        }
    }
    shapes.sort();
    Ok(shapes)
}

/// One ordered pair. Failures yield a record with an empty
/// correspondence so downstream consumers can skip it.
fn correspond_pair(
    i: usize,
    j: usize,
    source_path: &Path,
    target_path: &Path,
    config: &SearchConfig,
    args: &Args,
) -> CorrespondenceRecord {
    let mut record = CorrespondenceRecord {
        i,
        j,
        source: source_path.to_string_lossy().to_string(),
        target: target_path.to_string_lossy().to_string(),
        cost: 0.0,
        correspondence: Vec::new(),
    };

    // A shape against itself is a no-op: the identity mapping
    if source_path == target_path {
        if let Ok(graph) = StructureGraph::from_json_file(source_path) {
            record.correspondence = graph.parts.iter().map(|p| (p.id.clone(), p.id.clone())).collect();
        }
        return record;
    }

    let source = match StructureGraph::from_json_file(source_path) {
        Ok(g) => g,
        Err(e) => {
            log::error!("skipping pair ({}, {}): {}", i, j, e);
            return record;
        }
    };
    let target = match StructureGraph::from_json_file(target_path) {
        Ok(g) => g,
        Err(e) => {
            log::error!("skipping pair ({}, {}): {}", i, j, e);
            return record;
        }
    };

    let mut search = Search::new(&source, &target, &[], config.clone());
    search.explore(&CancelToken::new());

    match search.best_mapping() {
        Some((mapping, cost)) => {
            record.cost = cost;
            record.correspondence = mapping;
        }
        None => {
            log::warn!("no solution for pair ({}, {})", i, j);
            if args.baseline_fallback {
                log::info!("  falling back to the greedy OBB baseline");
                record.cost = -1.0;
                record.correspondence = greedy_obb_baseline(&source, &target);
            }
        }
    }

    record
}

/// Average precision/recall over all scorable records, written to the
/// dataset's log.txt
fn score_records(dataset: &Path, records: &[CorrespondenceRecord]) {
    let labels_path = dataset.join("labels.json");
    let labels = match LabelsFile::load(&labels_path) {
        Ok(l) => l,
        Err(e) => {
            log::error!("cannot evaluate, {}: {}", labels_path.display(), e);
            return;
        }
    };
    let oracle = LabelOracle::from_labels(&labels);

    let mut results = Vec::new();

    for record in records {
        // Crashed pairs and self-pairs are skipped
        if record.correspondence.is_empty() || record.source == record.target {
            continue;
        }

        let (Ok(source), Ok(target)) = (
            StructureGraph::from_json_file(&record.source),
            StructureGraph::from_json_file(&record.target),
        ) else {
            log::warn!("skipping record ({}, {}): graphs unavailable", record.i, record.j);
            continue;
        };

        let source_labels: Vec<String> = source.parts.iter().map(|p| p.label.clone()).collect();
        let target_labels: Vec<String> = target.parts.iter().map(|p| p.label.clone()).collect();

        let Some(truth) = oracle.ground_truth(&source_labels, &target_labels) else {
            log::warn!(
                "skipping record ({}, {}): empty ground truth",
                record.i,
                record.j
            );
            continue;
        };

        let matchings: Vec<MatchingRecord> = record
            .correspondence
            .iter()
            .filter_map(|(sid, tid)| {
                let sl = source.part(sid).map(|p| p.label.as_str())?;
                let tl = target.part(tid).map(|p| p.label.as_str())?;
                Some(MatchingRecord::new(sl, tl))
            })
            .collect();

        if let Some(pr) = oracle.score(&truth, &matchings) {
            log::info!(
                "  pair ({}, {}): P={:.3} R={:.3}",
                record.i,
                record.j,
                pr.precision,
                pr.recall
            );
            results.push((record.i, record.j, pr));
        }
    }

    if results.is_empty() {
        log::warn!("nothing to evaluate");
        return;
    }

    let n = results.len() as f64;
    let avg_p: f64 = results.iter().map(|(_, _, pr)| pr.precision).sum::<f64>() / n;
    let avg_r: f64 = results.iter().map(|(_, _, pr)| pr.recall).sum::<f64>() / n;
    let (g, m, r) = results.iter().fold((0, 0, 0), |(g, m, r), (_, _, pr)| {
        (g + pr.g, m + pr.m, r + pr.r)
    });

    let mut report = format!(
        "Avg. P = {:.4}, R = {:.4}\nG_count {} / M_count {} / R_count {}\n",
        avg_p, avg_r, g, m, r
    );
    for (i, j, pr) in &results {
        report.push_str(&format!(
            "i={}, j={}, precision={:.4}, recall={:.4}\n",
            i, j, pr.precision, pr.recall
        ));
    }

    log::info!("Avg. P = {:.4}, R = {:.4}", avg_p, avg_r);

    let log_path = dataset.join("log.txt");
    if let Err(e) = std::fs::write(&log_path, report) {
        log::error!("cannot write {}: {}", log_path.display(), e);
    }
}
