// Topological operations
//
// Before a source part list can be deformed onto a target part list, the
// two sides must agree in type and cardinality. These edits rewrite the
// working graphs to make that so: null collapse, curve-to-sheet
// promotion, synthetic sheet construction for many-to-one cases, and
// same-type merges. Synthetic ids are registered with the compression
// tables as they appear.

use crate::correspond::compress::{CompressionTables, NULL_PART};
use crate::correspond::deform_to_fit::FitError;
use crate::correspond::evaluate;
use crate::correspond::part::{Part, PartKind};
use crate::correspond::structure_graph::StructureGraph;
use crate::geometry::Point3D;

/// Rows of the degenerate sheet a promoted curve becomes
const PROMOTION_ROWS: usize = 4;

/// Iso-parameter spread below which a curves-to-sheet conversion is
/// reported as low-confidence
const CONFIDENCE_SPAN: f64 = 0.15;

/// Make `la -> lb` deformable: dispatch on the types and cardinalities
/// of the two sides and edit the graphs accordingly. Both lists may be
/// rewritten (null replication, synthetic target ids).
pub fn apply_topological_op(
    shape_a: &mut StructureGraph,
    shape_b: &mut StructureGraph,
    la: &mut Vec<String>,
    lb: &mut Vec<String>,
    tables: &CompressionTables,
) -> Result<(), FitError> {
    if la.is_empty() {
        return Ok(());
    }

    // Null assignment: collapse and flag, no target modification
    if lb.iter().all(|id| id == NULL_PART) {
        lb.resize(la.len(), NULL_PART.to_string());
        for id in la.iter() {
            if let Some(part) = shape_a.part_mut(id) {
                part.collapse_to_centroid();
                part.assigned_null = true;
            }
        }
        return Ok(());
    }

    let kind_a = side_kind(shape_a, la);
    let kind_b = side_kind(shape_b, lb);

    // A target list repeating one id (landmark balancing does this)
    // counts as a single target
    let mut unique_lb = lb.clone();
    unique_lb.dedup();

    match (kind_a, la.len(), kind_b, unique_lb.len()) {
        // One curve onto one sheet: promote the curve in place
        (Some(PartKind::Curve), 1, Some(PartKind::Sheet), 1) => {
            promote_curve_to_sheet(shape_a, &la[0])?;
        }

        // Many curves onto one sheet: equivalent curves are generated on
        // the target sheet at the projected iso-parameters
        (Some(PartKind::Curve), n, Some(PartKind::Sheet), 1) if n > 1 => {
            let new_targets = curves_onto_sheet(shape_a, shape_b, la, &unique_lb[0])?;
            for id in &new_targets {
                tables.target.intern(id);
            }
            *lb = new_targets;
        }

        // One sheet onto curves: collapse the target side to a synthetic
        // sheet built from the curves
        (Some(PartKind::Sheet), 1, Some(PartKind::Curve), _) => {
            let sheet_id = synthetic_target_sheet(shape_b, lb)?;
            tables.target.intern(&sheet_id);
            *lb = vec![sheet_id];
        }

        // Many onto one of the same type: extras merge away
        (Some(a), n, Some(b), 1) if n > 1 && a == b => {
            for extra in la.iter().skip(1) {
                if let Some(part) = shape_a.part_mut(extra) {
                    part.merged = true;
                }
                shape_a.remove_from_relations(extra);
            }
            *lb = vec![unique_lb[0].clone(); la.len()];
        }

        // One source against several targets: repeat the source
        (_, 1, _, m) if m > 1 => {
            *la = vec![la[0].clone(); lb.len()];
        }

        _ => {}
    }

    Ok(())
}

/// Kind shared by all parts of a list, if they agree
fn side_kind(graph: &StructureGraph, ids: &[String]) -> Option<PartKind> {
    let mut kinds = ids.iter().filter_map(|id| graph.part(id).map(|p| p.kind()));
    let first = kinds.next()?;
    kinds.all(|k| k == first).then_some(first)
}

/// Replace a curve with a degenerate sheet built from copies of its
/// control polygon. Incident edges are rewired by projecting their old
/// attachment positions onto the new parametric domain. The part keeps
/// its id, so the recorded mapping still names the original curve.
fn promote_curve_to_sheet(graph: &mut StructureGraph, id: &str) -> Result<(), FitError> {
    let part = graph
        .part(id)
        .ok_or_else(|| FitError::Degenerate(format!("unknown part '{}'", id)))?;
    if !part.is_curve() {
        return Ok(());
    }

    let ctrl = part.control_points().to_vec();
    let label = part.label.clone();
    let mesh_path = part.mesh_path.clone();

    // Old world positions of every stored attachment on this part
    let mut old_attachments: Vec<(usize, bool, Vec<Point3D>)> = Vec::new();
    for (li, link) in graph.links.iter().enumerate() {
        if link.a == id {
            let ps = link.coord_a.iter().map(|c| part.position_at(c)).collect();
            old_attachments.push((li, true, ps));
        }
        if link.b == id {
            let ps = link.coord_b.iter().map(|c| part.position_at(c)).collect();
            old_attachments.push((li, false, ps));
        }
    }

    let cols = ctrl.len().max(2);
    let mut lattice = Vec::with_capacity(PROMOTION_ROWS * cols);
    for _ in 0..PROMOTION_ROWS {
        lattice.extend(ctrl.iter().copied());
    }

    let mut sheet = Part::sheet(id, lattice, PROMOTION_ROWS, cols);
    sheet.label = label;
    sheet.mesh_path = mesh_path;

    let slot = graph.part_index(id).expect("part exists");
    graph.parts[slot] = sheet;

    // Rewire attachments into the sheet's domain
    for (li, is_a, positions) in old_attachments {
        let coords: Vec<_> = positions
            .iter()
            .map(|p| graph.parts[slot].project(p))
            .collect();
        let link = &mut graph.links[li];
        if is_a {
            link.coord_a = coords;
        } else {
            link.coord_b = coords;
        }
    }

    // The replacement geometry becomes the part's new spoke reference
    evaluate::resample_part(graph, id);

    Ok(())
}

/// Build a synthetic sheet over the source curves, read off each curve's
/// iso-parameter, and generate an equivalent curve on the target sheet
/// per source curve. Returns the synthetic target ids, one per curve.
fn curves_onto_sheet(
    shape_a: &StructureGraph,
    shape_b: &mut StructureGraph,
    la: &[String],
    target_sheet: &str,
) -> Result<Vec<String>, FitError> {
    let synth = shape_a
        .convert_curves_to_sheet(la, 4)
        .ok_or_else(|| FitError::Degenerate("cannot build sheet from source curves".into()))?;

    // Each curve's row parameter on the synthetic sheet
    let mut params: Vec<f64> = Vec::with_capacity(la.len());
    for id in la {
        let curve = shape_a
            .part(id)
            .ok_or_else(|| FitError::Degenerate(format!("unknown part '{}'", id)))?;
        let mid = curve.position_at(&[0.5, 0.0, 0.0, 0.0]);
        params.push(synth.project(&mid)[0]);
    }

    let span = params.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
        - params.iter().cloned().fold(f64::INFINITY, f64::min);
    if span < CONFIDENCE_SPAN {
        log::warn!(
            "curves-to-sheet conversion is low-confidence: iso-parameters span only {:.3}",
            span
        );
    }

    let sheet = shape_b
        .part(target_sheet)
        .ok_or_else(|| FitError::Degenerate(format!("unknown sheet '{}'", target_sheet)))?;
    if !sheet.is_sheet() {
        return Err(FitError::Degenerate(format!(
            "'{}' is not a sheet",
            target_sheet
        )));
    }
    let samples = sheet.control_points().len().min(8).max(2);

    let mut new_ids = Vec::with_capacity(la.len());
    for (curve_id, &u) in la.iter().zip(&params) {
        let mut iso = shape_b
            .convert_to_curve(target_sheet, u, samples)
            .ok_or_else(|| FitError::Degenerate("iso-curve extraction failed".into()))?;
        let synthetic_id = format!("{},{}", target_sheet, curve_id);
        iso.id = synthetic_id.clone();

        if shape_b.part(&synthetic_id).is_none() {
            shape_b.add_part(iso);
        }
        new_ids.push(synthetic_id);
    }

    Ok(new_ids)
}

/// Collapse several target curves (or a single one) into one synthetic
/// sheet added to the target graph
fn synthetic_target_sheet(shape_b: &mut StructureGraph, lb: &[String]) -> Result<String, FitError> {
    if lb.len() >= 2 {
        let sheet = shape_b
            .convert_curves_to_sheet(lb, 4)
            .ok_or_else(|| FitError::Degenerate("cannot build sheet from target curves".into()))?;
        let id = sheet.id.clone();
        if shape_b.part(&id).is_none() {
            shape_b.add_part(sheet);
        }
        return Ok(id);
    }

    // A single curve degenerates the same way a promotion does
    let curve = shape_b
        .part(&lb[0])
        .ok_or_else(|| FitError::Degenerate(format!("unknown part '{}'", lb[0])))?;
    let ctrl = curve.control_points().to_vec();
    let cols = ctrl.len().max(2);
    let mut lattice = Vec::with_capacity(PROMOTION_ROWS * cols);
    for _ in 0..PROMOTION_ROWS {
        lattice.extend(ctrl.iter().copied());
    }

    let id = format!("{}+", lb[0]);
    if shape_b.part(&id).is_none() {
        shape_b.add_part(Part::sheet(id.clone(), lattice, PROMOTION_ROWS, cols));
    }
    Ok(id)
}
