//! Config loading and end-to-end runs of configured graphs.

use std::io::Write;
use terrace::config::{MAX_CONFIG_FILE_SIZE, TerraceConfig};
use terrace::report::{OutputSummary, summarize_node};
use terrace_core::{FlowError, NodeRegistry, Session};

const TERRAIN: &str = r#"
[session]
worker_threads = 0

[settings]
resolution = 16
seed = 3

[frame]
tick_ms = 1
max_ticks = 50

[[graph.nodes]]
id = "ground"
kind = "height_noise"
params = { amplitude = 12.0, frequency = 0.1, octaves = 3 }

[[graph.nodes]]
id = "slope"
kind = "slope_from_normal"
root = true

[[graph.nodes]]
id = "trees"
kind = "scatter_points"
params = { density = 0.5, rows_per_tick = 4 }
root = true

[[graph.edges]]
from = "ground.height"
to = "slope.normal"

[[graph.edges]]
from = "ground.height"
to = "trees.height"

[[graph.edges]]
from = "slope.slope"
to = "trees.slope"
"#;

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(text.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file() {
    let file = write_config(TERRAIN);
    let config = TerraceConfig::load(file.path()).expect("load");

    assert_eq!(config.session.worker_threads, 0);
    assert_eq!(config.settings.resolution, 16);
    assert_eq!(config.frame.max_ticks, 50);
    assert_eq!(config.graph.nodes.len(), 3);
    assert_eq!(config.graph.nodes[0].params.get("octaves"), Some(3.0));
}

#[test]
fn built_graph_keeps_ids_and_roots() {
    let config = TerraceConfig::from_toml_str(TERRAIN).expect("config");
    let built = config
        .build_graph(&NodeRegistry::with_builtins())
        .expect("build");

    assert_eq!(built.graph.node_count(), 3);
    assert_eq!(built.graph.edge_count(), 3);
    assert_eq!(built.graph.roots().len(), 2);

    let ground = built.ids["ground"];
    assert_eq!(built.label(ground), Some("ground"));
}

#[test]
fn configured_graph_runs_to_completion() {
    let config = TerraceConfig::from_toml_str(TERRAIN).expect("config");
    let built = config
        .build_graph(&NodeRegistry::with_builtins())
        .expect("build");
    let roots = built.graph.roots();
    let slope = built.ids["slope"];
    let trees = built.ids["trees"];

    let mut session = Session::with_graph(config.session.clone(), built.graph).expect("session");
    let id = session
        .evaluate(&roots, config.settings.clone())
        .expect("evaluate");

    let mut ticks = 0;
    while !session.poll(id).expect("poll").is_terminal() {
        ticks += 1;
        assert!(ticks < config.frame.max_ticks, "evaluation did not settle");
    }
    assert!(session.status(id).expect("status").is_complete());

    let slope_report = summarize_node(&session, id, slope, "slope").expect("summary");
    let OutputSummary::Field { cells, min, max, .. } = slope_report[0].summary else {
        unreachable!("slope should be a finished field: {:?}", slope_report[0].summary);
    };
    assert_eq!(cells, 256);
    assert!(min >= 0.0 && max <= 90.0);

    let tree_report = summarize_node(&session, id, trees, "trees").expect("summary");
    assert!(matches!(tree_report[0].summary, OutputSummary::Points { .. }));

    let stats = session.shutdown();
    assert_eq!(stats.misuse, 0);
}

#[test]
fn rejects_duplicate_ids() {
    let text = r#"
[[graph.nodes]]
id = "a"
kind = "height_noise"

[[graph.nodes]]
id = "a"
kind = "height_noise"
"#;
    assert!(matches!(
        TerraceConfig::from_toml_str(text),
        Err(FlowError::InvalidConfig(_))
    ));
}

#[test]
fn rejects_edges_to_unknown_nodes() {
    let text = r#"
[[graph.nodes]]
id = "a"
kind = "height_noise"

[[graph.edges]]
from = "a.height"
to = "missing.a"
"#;
    let err = TerraceConfig::from_toml_str(text).expect_err("unknown endpoint");
    assert!(err.to_string().contains("missing"));
}

#[test]
fn rejects_unknown_fields() {
    let text = r#"
[frame]
tick_ms = 5
speed = 2
"#;
    assert!(TerraceConfig::from_toml_str(text).is_err());
}

#[test]
fn rejects_zero_tick() {
    let text = "[frame]\ntick_ms = 0\n";
    assert!(matches!(
        TerraceConfig::from_toml_str(text),
        Err(FlowError::InvalidConfig(_))
    ));
}

#[test]
fn unknown_kind_fails_at_build() {
    let text = r#"
[[graph.nodes]]
id = "a"
kind = "erosion"
"#;
    let config = TerraceConfig::from_toml_str(text).expect("config");
    assert!(matches!(
        config.build_graph(&NodeRegistry::with_builtins()),
        Err(FlowError::UnknownNodeKind(kind)) if kind == "erosion"
    ));
}

#[test]
fn mismatched_ports_fail_at_build() {
    let text = r#"
[[graph.nodes]]
id = "trees"
kind = "scatter_points"

[[graph.nodes]]
id = "blend"
kind = "blend_heights"

[[graph.edges]]
from = "trees.points"
to = "blend.a"
"#;
    let config = TerraceConfig::from_toml_str(text).expect("config");
    assert!(matches!(
        config.build_graph(&NodeRegistry::with_builtins()),
        Err(FlowError::PortKindMismatch { .. })
    ));
}

#[test]
fn oversized_config_is_rejected() {
    let padding = "#".repeat(MAX_CONFIG_FILE_SIZE as usize + 1);
    let file = write_config(&padding);
    assert!(matches!(
        TerraceConfig::load(file.path()),
        Err(FlowError::InvalidConfig(_))
    ));
}

#[test]
fn sample_config_builds_and_amplifies() {
    let config = TerraceConfig::from_toml_str(include_str!("../terrain.toml")).expect("sample");
    let mut built = config
        .build_graph(&NodeRegistry::with_builtins())
        .expect("build");

    let inserted = built
        .graph
        .amplify(config.session.max_amplify_passes)
        .expect("amplify");

    assert_eq!(inserted, 1);
    assert_eq!(built.graph.node_count(), 6);
    assert_eq!(built.graph.roots().len(), 3);
}
