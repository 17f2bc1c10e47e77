use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::watch;
use weft_analysis::{AnalysisError, CancelFlag};
use weft_cluster::{ClusterEdge, ClusterError, ClusterInput, ClusterRegistry, ClusterResult};
use weft_core::{
    AnalysisConfig, CO_CHANGED, ClusterRunRecord, EntityKind, Metric, ProgressSnapshot, SOURCE_GIT,
    TaskRecord, TaskState, repo_id_for,
};
use weft_git::GitError;
use weft_store::{ConfigurationRecord, Registry, RepositoryRecord, Store, StoreError};

mod pipeline;

pub use pipeline::ANALYZER_GIT_COUPLING;
pub use weft_analysis::{
    ComponentEdge, CouplingGraph, CouplingNeighbor, Hotspot, HotspotSort, aggregate_components,
    coupling_for_file, coupling_graph, hotspots,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("config error: {0}")]
    Config(#[from] weft_core::CoreError),
    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("clustering error: {0}")]
    Cluster(#[from] ClusterError),
    #[error("{path} is not a git repository")]
    NotARepository { path: PathBuf },
    #[error("unknown repository '{0}'")]
    UnknownRepository(String),
    #[error("unknown configuration '{0}'")]
    UnknownConfiguration(String),
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("an analysis is already running for repository '{0}'")]
    RepositoryBusy(String),
}

struct TaskHandle {
    repo_id: String,
    cancel: CancelFlag,
    progress: watch::Receiver<ProgressSnapshot>,
    worker: Option<JoinHandle<()>>,
}

struct EngineInner {
    data_dir: PathBuf,
    registry: Mutex<Registry>,
    algorithms: ClusterRegistry,
    tasks: Mutex<HashMap<String, TaskHandle>>,
    running_repos: Mutex<HashSet<String>>,
}

/// Owns the repository registry, the clustering algorithm table, and the
/// per-task background workers. One analysis runs per repository at a time;
/// tasks for distinct repositories run in parallel.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let registry = Registry::open(&data_dir)?;

        Ok(Self {
            inner: Arc::new(EngineInner {
                data_dir,
                registry: Mutex::new(registry),
                algorithms: ClusterRegistry::with_builtin(),
                tasks: Mutex::new(HashMap::new()),
                running_repos: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn algorithm_names(&self) -> Vec<&'static str> {
        self.inner.algorithms.names()
    }

    fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.inner.data_dir.join("repos").join(repo_id)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.registry.lock().expect("registry lock")
    }

    fn require_repository(&self, repo_id: &str) -> Result<RepositoryRecord, EngineError> {
        self.registry()
            .get_repository(repo_id)?
            .ok_or_else(|| EngineError::UnknownRepository(repo_id.to_owned()))
    }

    pub fn create_repository(
        &self,
        source_path: impl AsRef<Path>,
        name: &str,
    ) -> Result<RepositoryRecord, EngineError> {
        let source_path = source_path.as_ref();
        if !weft_git::is_repository(source_path) {
            return Err(EngineError::NotARepository {
                path: source_path.to_path_buf(),
            });
        }

        let repo_id = repo_id_for(name);
        let record = RepositoryRecord {
            repo_id: repo_id.clone(),
            name: name.to_owned(),
            source_path: source_path.to_string_lossy().into_owned(),
            created_at: now_seconds(),
            last_analyzed_at: None,
        };
        self.registry().insert_repository(&record)?;

        // seed the store and the default active configuration
        let mut store = Store::open(self.repo_dir(&repo_id))?;
        let document = AnalysisConfig::default().to_document()?;
        let config_id = configuration_id("default");
        store.upsert_configuration(&config_id, "default", &document, now_seconds())?;
        if store.active_configuration()?.is_none() {
            store.set_active_configuration(&config_id)?;
        }

        tracing::info!(repo_id = %record.repo_id, source = %record.source_path, "repository registered");
        Ok(record)
    }

    pub fn list_repositories(&self) -> Result<Vec<RepositoryRecord>, EngineError> {
        Ok(self.registry().list_repositories()?)
    }

    pub fn delete_repository(&self, repo_id: &str) -> Result<(), EngineError> {
        self.require_repository(repo_id)?;
        if self.inner.running_repos.lock().expect("running lock").contains(repo_id) {
            return Err(EngineError::RepositoryBusy(repo_id.to_owned()));
        }

        self.registry().delete_repository(repo_id)?;
        let repo_dir = self.repo_dir(repo_id);
        if repo_dir.exists() {
            std::fs::remove_dir_all(repo_dir)?;
        }
        Ok(())
    }

    pub fn upsert_configuration(
        &self,
        repo_id: &str,
        name: &str,
        document: &serde_json::Value,
    ) -> Result<ConfigurationRecord, EngineError> {
        self.require_repository(repo_id)?;
        // reject unknown keys and malformed values before anything is stored
        AnalysisConfig::from_document(document)?;

        let store = Store::open(self.repo_dir(repo_id))?;
        let record =
            store.upsert_configuration(&configuration_id(name), name, document, now_seconds())?;
        Ok(record)
    }

    pub fn activate_configuration(&self, repo_id: &str, config_id: &str) -> Result<(), EngineError> {
        self.require_repository(repo_id)?;
        let mut store = Store::open(self.repo_dir(repo_id))?;
        store.set_active_configuration(config_id).map_err(|err| match err {
            StoreError::UnknownConfiguration(id) => EngineError::UnknownConfiguration(id),
            other => EngineError::Store(other),
        })
    }

    pub fn list_configurations(&self, repo_id: &str) -> Result<Vec<ConfigurationRecord>, EngineError> {
        self.require_repository(repo_id)?;
        let store = Store::open(self.repo_dir(repo_id))?;
        Ok(store.list_configurations()?)
    }

    pub fn enqueue_analysis(
        &self,
        repo_id: &str,
        config_id: Option<&str>,
    ) -> Result<String, EngineError> {
        let repository = self.require_repository(repo_id)?;
        let repo_dir = self.repo_dir(repo_id);

        let store = Store::open(&repo_dir)?;
        let document = match config_id {
            Some(config_id) => {
                store
                    .get_configuration(config_id)?
                    .ok_or_else(|| EngineError::UnknownConfiguration(config_id.to_owned()))?
                    .document
            }
            None => store
                .active_configuration()?
                .map(|config| config.document)
                .unwrap_or_else(weft_core::default_analysis_config_json),
        };
        let config = AnalysisConfig::from_document(&document)?;

        {
            let mut running = self.inner.running_repos.lock().expect("running lock");
            if !running.insert(repo_id.to_owned()) {
                return Err(EngineError::RepositoryBusy(repo_id.to_owned()));
            }
        }

        let task_id = fresh_id("task");
        let task = TaskRecord {
            task_id: task_id.clone(),
            analyzer_kind: ANALYZER_GIT_COUPLING.to_owned(),
            state: TaskState::Pending,
            config: document,
            started_at: None,
            finished_at: None,
            entity_count: 0,
            relationship_count: 0,
            metrics: serde_json::json!({}),
            error: None,
            progress: serde_json::json!({}),
            created_at: now_seconds(),
        };
        if let Err(err) = store.insert_task(&task) {
            self.release_repo(repo_id);
            return Err(err.into());
        }
        drop(store);

        let (progress_tx, progress_rx) = watch::channel(ProgressSnapshot::initial(&task_id));
        let cancel = CancelFlag::new();

        let worker = {
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            let task_id = task_id.clone();
            let repo_id = repo_id.to_owned();
            let source_path = PathBuf::from(repository.source_path.clone());
            std::thread::spawn(move || {
                pipeline::run_analysis(
                    &inner.data_dir,
                    &repo_dir,
                    &repo_id,
                    &source_path,
                    &task_id,
                    &config,
                    &cancel,
                    &progress_tx,
                );
                inner
                    .running_repos
                    .lock()
                    .expect("running lock")
                    .remove(&repo_id);
            })
        };

        self.inner.tasks.lock().expect("tasks lock").insert(
            task_id.clone(),
            TaskHandle {
                repo_id: repo_id.to_owned(),
                cancel,
                progress: progress_rx,
                worker: Some(worker),
            },
        );

        Ok(task_id)
    }

    fn release_repo(&self, repo_id: &str) {
        self.inner
            .running_repos
            .lock()
            .expect("running lock")
            .remove(repo_id);
    }

    pub fn cancel_analysis(&self, task_id: &str) -> Result<(), EngineError> {
        let tasks = self.inner.tasks.lock().expect("tasks lock");
        let handle = tasks
            .get(task_id)
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_owned()))?;
        handle.cancel.cancel();
        Ok(())
    }

    /// Latest-snapshot progress channel; slow subscribers only ever observe
    /// the most recent value. The stream is over once the state is terminal.
    pub fn subscribe_progress(
        &self,
        task_id: &str,
    ) -> Result<watch::Receiver<ProgressSnapshot>, EngineError> {
        let tasks = self.inner.tasks.lock().expect("tasks lock");
        let handle = tasks
            .get(task_id)
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_owned()))?;
        Ok(handle.progress.clone())
    }

    /// Blocks until the worker thread for `task_id` has exited.
    pub fn wait_for_task(&self, task_id: &str) -> Result<(), EngineError> {
        let worker = {
            let mut tasks = self.inner.tasks.lock().expect("tasks lock");
            let handle = tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::UnknownTask(task_id.to_owned()))?;
            handle.worker.take()
        };
        if let Some(worker) = worker {
            let _ = worker.join();
        }
        Ok(())
    }

    pub fn get_task(&self, repo_id: &str, task_id: &str) -> Result<TaskRecord, EngineError> {
        self.require_repository(repo_id)?;
        let store = Store::open(self.repo_dir(repo_id))?;
        store
            .get_task(task_id)?
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_owned()))
    }

    pub fn find_task(&self, task_id: &str) -> Result<TaskRecord, EngineError> {
        let repo_id = {
            let tasks = self.inner.tasks.lock().expect("tasks lock");
            tasks.get(task_id).map(|handle| handle.repo_id.clone())
        };
        match repo_id {
            Some(repo_id) => self.get_task(&repo_id, task_id),
            None => {
                for repository in self.list_repositories()? {
                    let store = Store::open(self.repo_dir(&repository.repo_id))?;
                    if let Some(task) = store.get_task(task_id)? {
                        return Ok(task);
                    }
                }
                Err(EngineError::UnknownTask(task_id.to_owned()))
            }
        }
    }

    pub fn list_tasks(&self, repo_id: &str) -> Result<Vec<TaskRecord>, EngineError> {
        self.require_repository(repo_id)?;
        let store = Store::open(self.repo_dir(repo_id))?;
        Ok(store.list_tasks()?)
    }

    pub fn run_clustering(
        &self,
        repo_id: &str,
        algorithm: &str,
        params: &serde_json::Value,
    ) -> Result<(ClusterRunRecord, ClusterResult), EngineError> {
        self.require_repository(repo_id)?;
        let mut store = Store::open(self.repo_dir(repo_id))?;

        let entities = store
            .list_entities(EntityKind::File)?
            .into_iter()
            .filter(|entity| entity.exists_at_head)
            .map(|entity| entity.entity_id)
            .collect::<Vec<_>>();
        let edges = store
            .list_relationships(SOURCE_GIT, CO_CHANGED)?
            .into_iter()
            .map(|edge| ClusterEdge {
                src: edge.src,
                dst: edge.dst,
                weight: edge.weight,
            })
            .collect::<Vec<_>>();

        let input = ClusterInput { entities, edges };
        let result = self.inner.algorithms.run(algorithm, &input, params)?;

        let run = ClusterRunRecord {
            run_id: fresh_id("run"),
            algorithm: result.algorithm.clone(),
            parameters: result.parameters.clone(),
            created_at: now_seconds(),
            cluster_count: result.cluster_count,
            metrics: result.metrics.clone(),
        };
        let members = result
            .assignments
            .iter()
            .map(|(entity_id, cluster_id)| (*cluster_id, *entity_id))
            .collect::<Vec<_>>();
        store.insert_cluster_run(&run, &members)?;

        tracing::info!(
            repo_id,
            algorithm,
            clusters = run.cluster_count,
            "clustering snapshot persisted"
        );
        Ok((run, result))
    }

    pub fn get_coupling(
        &self,
        repo_id: &str,
        path: &str,
        metric: Metric,
        min_weight: f64,
        limit: usize,
    ) -> Result<Vec<CouplingNeighbor>, EngineError> {
        self.require_repository(repo_id)?;
        let store = Store::open(self.repo_dir(repo_id))?;
        Ok(coupling_for_file(&store, path, metric, min_weight, limit)?)
    }

    pub fn get_coupling_graph(
        &self,
        repo_id: &str,
        path: &str,
        metric: Metric,
        min_weight: f64,
        limit: usize,
    ) -> Result<CouplingGraph, EngineError> {
        self.require_repository(repo_id)?;
        let store = Store::open(self.repo_dir(repo_id))?;
        Ok(coupling_graph(&store, path, metric, min_weight, limit)?)
    }

    pub fn get_hotspots(
        &self,
        repo_id: &str,
        sort_by: HotspotSort,
        strong_edge_threshold: f64,
        limit: usize,
    ) -> Result<Vec<Hotspot>, EngineError> {
        self.require_repository(repo_id)?;
        let store = Store::open(self.repo_dir(repo_id))?;
        Ok(hotspots(&store, sort_by, strong_edge_threshold, limit)?)
    }

    pub fn get_component_coupling(
        &self,
        repo_id: &str,
        depth: u32,
        min_component_cooccurrence: u32,
    ) -> Result<Vec<ComponentEdge>, EngineError> {
        self.require_repository(repo_id)?;
        let store = Store::open(self.repo_dir(repo_id))?;
        Ok(aggregate_components(&store, depth, min_component_cooccurrence)?)
    }
}

pub(crate) fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs() as i64)
        .unwrap_or(0)
}

fn configuration_id(name: &str) -> String {
    let digest = blake3::hash(name.as_bytes()).to_hex();
    format!("cfg-{}", &digest.as_str()[..8])
}

fn fresh_id(prefix: &str) -> String {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let serial = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_nanos())
        .unwrap_or(0);
    let digest = blake3::hash(format!("{prefix}-{nanos}-{serial}").as_bytes()).to_hex();
    format!("{prefix}-{}", &digest.as_str()[..12])
}
