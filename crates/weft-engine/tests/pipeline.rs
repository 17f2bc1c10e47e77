mod common;

use serde_json::json;
use tempfile::tempdir;
use weft_core::{Metric, TaskState};
use weft_engine::{Engine, EngineError, HotspotSort};

use common::build_core_repo;

fn analyzed_core_repo(engine: &Engine, source: &std::path::Path) -> String {
    build_core_repo(source);
    let repo = engine.create_repository(source, "core-suite").expect("register");

    let config = engine
        .upsert_configuration(
            &repo.repo_id,
            "seed",
            &json!({
                "min_revisions": 5,
                "max_changeset_size": 10,
                "min_cooccurrence": 5
            }),
        )
        .expect("config");

    let task_id = engine
        .enqueue_analysis(&repo.repo_id, Some(&config.config_id))
        .expect("enqueue");
    engine.wait_for_task(&task_id).expect("wait");

    let task = engine.get_task(&repo.repo_id, &task_id).expect("task");
    assert_eq!(task.state, TaskState::Completed, "error: {:?}", task.error);
    repo.repo_id
}

#[test]
fn core_repo_produces_the_expected_coupling() {
    let source = tempdir().expect("source");
    let data = tempdir().expect("data");
    let engine = Engine::open(data.path()).expect("engine");
    let repo_id = analyzed_core_repo(&engine, source.path());

    let tasks = engine.list_tasks(&repo_id).expect("tasks");
    let task = &tasks[0];
    assert_eq!(task.entity_count, 9);
    assert_eq!(task.relationship_count, 4);

    let neighbors = engine
        .get_coupling(&repo_id, "core/engine", Metric::Jaccard, 0.0, 10)
        .expect("coupling");
    assert_eq!(neighbors.len(), 2);

    let utils = neighbors
        .iter()
        .find(|neighbor| neighbor.entity.qualified_name == "core/utils")
        .expect("utils neighbor");
    assert!((utils.properties.jaccard - 10.0 / 30.0).abs() < 1e-9);
    assert!((utils.properties.jaccard_weighted - 10.0 / 30.0).abs() < 1e-9);
    assert_eq!(utils.properties.pair_count, 10.0);

    let routes = engine
        .get_coupling(&repo_id, "api/routes", Metric::Jaccard, 0.0, 10)
        .expect("routes coupling");
    assert_eq!(routes.len(), 1);
    assert!((routes[0].properties.jaccard - 1.0).abs() < 1e-9);

    for solo in ["config", "README"] {
        let coupling = engine
            .get_coupling(&repo_id, solo, Metric::Jaccard, 0.0, 10)
            .expect("solo coupling");
        assert!(coupling.is_empty(), "{solo} should have no neighbors");
    }
}

#[test]
fn rerunning_with_no_new_commits_is_idempotent() {
    let source = tempdir().expect("source");
    let data = tempdir().expect("data");
    let engine = Engine::open(data.path()).expect("engine");
    let repo_id = analyzed_core_repo(&engine, source.path());

    let first_hotspots = engine
        .get_hotspots(&repo_id, HotspotSort::Risk, 0.5, 50)
        .expect("hotspots");
    let first_graph = engine
        .get_coupling_graph(&repo_id, "core/engine", Metric::Jaccard, 0.0, 10)
        .expect("graph");

    let task_id = engine.enqueue_analysis(&repo_id, None).expect("re-enqueue");
    engine.wait_for_task(&task_id).expect("wait");
    let task = engine.get_task(&repo_id, &task_id).expect("task");
    assert_eq!(task.state, TaskState::Completed);

    let second_hotspots = engine
        .get_hotspots(&repo_id, HotspotSort::Risk, 0.5, 50)
        .expect("hotspots again");
    let second_graph = engine
        .get_coupling_graph(&repo_id, "core/engine", Metric::Jaccard, 0.0, 10)
        .expect("graph again");

    assert_eq!(first_hotspots, second_hotspots);
    assert_eq!(first_graph, second_graph);
}

#[test]
fn clustering_on_the_core_repo_is_deterministic() {
    let source = tempdir().expect("source");
    let data = tempdir().expect("data");
    let engine = Engine::open(data.path()).expect("engine");
    let repo_id = analyzed_core_repo(&engine, source.path());

    // edges at jaccard >= 0.5 keep engine-test, utils-test and the api pair
    let (run, result) = engine
        .run_clustering(&repo_id, "connected_components", &json!({"min_weight": 0.5}))
        .expect("components");
    assert_eq!(run.cluster_count, 6);
    let clusters = result.clusters();
    let pair_clusters = clusters
        .values()
        .filter(|members| members.len() == 2)
        .count();
    let singletons = clusters
        .values()
        .filter(|members| members.len() == 1)
        .count();
    assert_eq!(pair_clusters, 3);
    assert_eq!(singletons, 3);

    let (_, first) = engine
        .run_clustering(&repo_id, "louvain", &json!({"random_seed": 42}))
        .expect("louvain");
    let (_, second) = engine
        .run_clustering(&repo_id, "louvain", &json!({"random_seed": 42}))
        .expect("louvain again");
    assert_eq!(first.assignments, second.assignments);

    let err = engine
        .run_clustering(&repo_id, "does-not-exist", &json!({}))
        .unwrap_err();
    assert!(matches!(err, EngineError::Cluster(_)));
}

#[test]
fn hotspots_and_components_are_exposed() {
    let source = tempdir().expect("source");
    let data = tempdir().expect("data");
    let engine = Engine::open(data.path()).expect("engine");
    let repo_id = analyzed_core_repo(&engine, source.path());

    let hotspots = engine
        .get_hotspots(&repo_id, HotspotSort::Commits, 0.5, 50)
        .expect("hotspots");
    assert_eq!(hotspots.len(), 9);
    // engine and utils lead with 20 commits each
    assert!(hotspots[0].entity.qualified_name.starts_with("core/"));
    assert_eq!(hotspots[0].entity.metadata.total_commits, 20);
    assert!(hotspots.iter().all(|spot| spot.risk_score <= 100.0));
    assert!(hotspots.iter().all(|spot| spot.churn > 0));

    let components = engine
        .get_component_coupling(&repo_id, 2, 5)
        .expect("components");
    assert!(
        components
            .iter()
            .any(|edge| edge.src_component == "core" && edge.dst_component == "tests")
    );
    assert!(
        !components
            .iter()
            .any(|edge| edge.src_component == edge.dst_component)
    );
}

#[test]
fn progress_stream_terminates_with_the_task() {
    let source = tempdir().expect("source");
    let data = tempdir().expect("data");
    let engine = Engine::open(data.path()).expect("engine");

    build_core_repo(source.path());
    let repo = engine.create_repository(source.path(), "progress-check").expect("register");
    let task_id = engine.enqueue_analysis(&repo.repo_id, None).expect("enqueue");

    let progress = engine.subscribe_progress(&task_id).expect("subscribe");
    engine.wait_for_task(&task_id).expect("wait");

    let snapshot = progress.borrow().clone();
    assert_eq!(snapshot.task_id, task_id);
    assert_eq!(snapshot.state, TaskState::Completed);
    assert_eq!(snapshot.percent, 100.0);
    assert!(snapshot.entity_count > 0);
}

#[test]
fn concurrent_analyses_of_one_repository_are_refused() {
    let source = tempdir().expect("source");
    let data = tempdir().expect("data");
    let engine = Engine::open(data.path()).expect("engine");

    build_core_repo(source.path());
    let repo = engine.create_repository(source.path(), "busy-check").expect("register");

    let task_id = engine.enqueue_analysis(&repo.repo_id, None).expect("enqueue");
    let second = engine.enqueue_analysis(&repo.repo_id, None);
    assert!(matches!(
        second,
        Err(EngineError::RepositoryBusy(_)) | Ok(_)
    ));
    engine.wait_for_task(&task_id).expect("wait");
    if let Ok(second_id) = second {
        engine.wait_for_task(&second_id).expect("wait second");
    }
}
