use std::collections::BTreeMap;

use stagehand::error::SpecError;
use stagehand::graph::DependencyGraph;
use stagehand::spec::{PipelineSpec, StageSpec, StepSpec};

fn stage(name: &str, needs: &[&str]) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        required: true,
        needs: needs.iter().map(|dep| dep.to_string()).collect(),
        hard_needs: Vec::new(),
        toolchains: Vec::new(),
        steps: vec![StepSpec {
            run: "true".to_string(),
            cwd: None,
            env: BTreeMap::new(),
            outputs: Vec::new(),
        }],
        timeout_secs: None,
    }
}

fn pipeline(stages: Vec<StageSpec>) -> PipelineSpec {
    PipelineSpec {
        version: 1,
        pipeline: "graph-test".to_string(),
        triggers: None,
        stages,
        artifact: None,
    }
}

#[test]
fn order_respects_every_dependency_edge() {
    let spec = pipeline(vec![
        stage("publish", &["build"]),
        stage("package", &["build"]),
        stage("build", &["provision"]),
        stage("provision", &[]),
    ]);
    let graph = DependencyGraph::new(&spec).unwrap();
    let order = graph.topological_order().unwrap();

    let position = |name: &str| order.iter().position(|entry| entry == name).unwrap();
    assert!(position("provision") < position("build"));
    assert!(position("build") < position("publish"));
    assert!(position("build") < position("package"));
}

#[test]
fn order_is_stable_across_calls() {
    let spec = pipeline(vec![
        stage("lint", &[]),
        stage("build", &[]),
        stage("test", &["build"]),
        stage("package", &["build", "test"]),
    ]);
    let graph = DependencyGraph::new(&spec).unwrap();
    let first = graph.topological_order().unwrap();
    let second = graph.topological_order().unwrap();
    assert_eq!(first, second);
    // Declaration order breaks ties between independent stages.
    assert_eq!(first, vec!["lint", "build", "test", "package"]);
}

#[test]
fn two_stage_cycle_is_reported() {
    let spec = pipeline(vec![stage("a", &["b"]), stage("b", &["a"])]);
    let graph = DependencyGraph::new(&spec).unwrap();
    match graph.topological_order() {
        Err(SpecError::CycleDetected(cycle)) => {
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
}

#[test]
fn unknown_dependency_is_rejected_at_graph_construction() {
    let spec = pipeline(vec![stage("build", &["nonexistent"])]);
    match DependencyGraph::new(&spec) {
        Err(SpecError::UnknownDependency { stage, missing }) => {
            assert_eq!(stage, "build");
            assert_eq!(missing, "nonexistent");
        }
        other => panic!("expected UnknownDependency, got {other:?}"),
    }
}

#[test]
fn ancestry_is_transitive() {
    let spec = pipeline(vec![
        stage("provision", &[]),
        stage("build", &["provision"]),
        stage("package", &["build"]),
        stage("unrelated", &[]),
    ]);
    let graph = DependencyGraph::new(&spec).unwrap();
    let closure = graph.ancestry("package").unwrap();
    assert!(closure.contains("package"));
    assert!(closure.contains("build"));
    assert!(closure.contains("provision"));
    assert!(!closure.contains("unrelated"));
}
