//! Output summaries for finished evaluations.

use serde::Serialize;
use terrace_core::nodes::{HeightMap, NormalMap, PointSet, ScalarMap};
use terrace_core::{EvalId, FlowError, NodeGuid, PortKind, Session};

/// What one output port produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputSummary {
    /// A per-cell field (heights or slopes).
    Field {
        cells: usize,
        min: f32,
        max: f32,
        mean: f32,
    },
    /// Normals, with the mean of their up component.
    Normals { cells: usize, mean_up: f32 },
    Points { count: usize },
    /// No finished data on this port.
    Missing,
}

/// One line of a run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortReport {
    pub node: NodeGuid,
    pub label: String,
    pub port: String,
    pub summary: OutputSummary,
}

/// Summaries of every output of `node` in evaluation `id`.
pub fn summarize_node(
    session: &Session,
    id: EvalId,
    node: NodeGuid,
    label: &str,
) -> Result<Vec<PortReport>, FlowError> {
    let ports = session
        .graph()
        .node(node)
        .ok_or(FlowError::NodeNotFound(node))?
        .outputs();

    let mut reports = Vec::with_capacity(ports.len());
    for spec in ports {
        let summary = match spec.kind {
            PortKind::Height => match session.try_get_output_data::<HeightMap>(id, node, spec.name) {
                Some(map) => field(&map.interior()?),
                None => OutputSummary::Missing,
            },
            PortKind::Scalar => match session.try_get_output_data::<ScalarMap>(id, node, spec.name) {
                Some(map) => field(&map.values.to_vec()?),
                None => OutputSummary::Missing,
            },
            PortKind::Normal => match session.try_get_output_data::<NormalMap>(id, node, spec.name) {
                Some(map) => normals(&map.values.to_vec()?),
                None => OutputSummary::Missing,
            },
            PortKind::Points => match session.try_get_output_data::<PointSet>(id, node, spec.name) {
                Some(set) => OutputSummary::Points {
                    count: set.points.len(),
                },
                None => OutputSummary::Missing,
            },
            PortKind::Any => OutputSummary::Missing,
        };
        reports.push(PortReport {
            node,
            label: label.to_string(),
            port: spec.name.to_string(),
            summary,
        });
    }
    Ok(reports)
}

/// Min, max and mean of a field.
#[must_use]
pub fn field(values: &[f32]) -> OutputSummary {
    if values.is_empty() {
        return OutputSummary::Missing;
    }
    let (min, max, sum) = values.iter().fold(
        (f32::INFINITY, f32::NEG_INFINITY, 0.0_f64),
        |(min, max, sum), v| (min.min(*v), max.max(*v), sum + f64::from(*v)),
    );
    OutputSummary::Field {
        cells: values.len(),
        min,
        max,
        mean: (sum / values.len() as f64) as f32,
    }
}

fn normals(values: &[[f32; 3]]) -> OutputSummary {
    if values.is_empty() {
        return OutputSummary::Missing;
    }
    let up: f64 = values.iter().map(|n| f64::from(n[1])).sum();
    OutputSummary::Normals {
        cells: values.len(),
        mean_up: (up / values.len() as f64) as f32,
    }
}

impl std::fmt::Display for OutputSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSummary::Field {
                cells,
                min,
                max,
                mean,
            } => write!(f, "{cells} cells, min {min:.3}, max {max:.3}, mean {mean:.3}"),
            OutputSummary::Normals { cells, mean_up } => {
                write!(f, "{cells} normals, mean up {mean_up:.3}")
            }
            OutputSummary::Points { count } => write!(f, "{count} points"),
            OutputSummary::Missing => f.write_str("no data"),
        }
    }
}
