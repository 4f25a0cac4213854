//! Training job runner
//!
//! Runs model training in the background, one job per model id per node.
//!
//! ```text
//! execute(job) ── running? ──▶ ConcurrencyConflict
//!      │
//!      ├─ reserve data claim + model claim ──▶ CapacityExceeded
//!      ├─ registry: TRAINING
//!      └─ spawn on knn-train pool
//!            read batches (cancel checked per batch)
//!              ├─ ivf:        stage in native memory ─▶ train_index ─▶ centroids
//!              └─ sq8/binary: quantizer.train ─▶ serialized state
//!            release claims
//!            completion (once): CREATED + blob | FAILED + error
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use knn_core::{
    ByteScalarQuantizer, OneBitQuantizer, QuantizationParams, QuantizationState, Quantizer,
    SpaceType,
};
use knn_native::{NativeLibrary, TrainParams};

use crate::budget::{NativeMemoryBudget, Reservation};
use crate::config::EngineConfig;
use crate::error::{KnnError, Result};
use crate::handle::NativeHandle;
use crate::model::{ModelMetadata, ModelRegistry, ModelState, TrainingMethod};

const IVF_MAX_ITERATIONS: usize = 25;

/// Read access to the corpus a model is trained on.
pub trait TrainingDataSource: Send + Sync {
    fn dimension(&self) -> usize;

    /// Number of vectors available.
    fn total(&self) -> usize;

    /// Up to `limit` vectors starting at `offset`.
    fn read(&self, offset: usize, limit: usize) -> Result<Vec<Vec<f32>>>;
}

/// Training data held in memory.
pub struct InMemoryTrainingData {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl InMemoryTrainingData {
    pub fn new(dimension: usize, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(KnnError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }
        Ok(Self { dimension, vectors })
    }
}

impl TrainingDataSource for InMemoryTrainingData {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn total(&self) -> usize {
        self.vectors.len()
    }

    fn read(&self, offset: usize, limit: usize) -> Result<Vec<Vec<f32>>> {
        let start = offset.min(self.vectors.len());
        let end = offset.saturating_add(limit).min(self.vectors.len());
        Ok(self.vectors[start..end].to_vec())
    }
}

pub struct TrainingJob {
    pub model_id: String,
    pub method: TrainingMethod,
    pub space_type: SpaceType,
    pub dimension: usize,
    /// Cap on vectors read from `data`.
    pub max_vectors: usize,
    pub description: String,
    pub data: Arc<dyn TrainingDataSource>,
}

impl TrainingJob {
    fn vector_count(&self) -> usize {
        self.max_vectors.min(self.data.total())
    }

    /// Native memory for the staged training vectors.
    pub fn training_data_claim(&self) -> u64 {
        (self.vector_count() * self.dimension * std::mem::size_of::<f32>()) as u64
    }

    /// Native memory for building the model itself.
    pub fn model_claim(&self) -> u64 {
        self.method.estimate_overhead_bytes(self.dimension)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingOutcome {
    pub model_id: String,
    pub state: ModelState,
    pub error: Option<String>,
}

pub type CompletionListener = Box<dyn FnOnce(&TrainingOutcome) + Send>;

/// Terminal transition of one training attempt. Only the first call to
/// [`complete`](Self::complete) has any effect.
pub struct JobCompletion {
    model_id: String,
    registry: Arc<ModelRegistry>,
    fired: AtomicBool,
    listener: Mutex<Option<CompletionListener>>,
    notify: Sender<TrainingOutcome>,
}

impl JobCompletion {
    fn new(
        model_id: String,
        registry: Arc<ModelRegistry>,
        listener: Option<CompletionListener>,
        notify: Sender<TrainingOutcome>,
    ) -> Self {
        Self {
            model_id,
            registry,
            fired: AtomicBool::new(false),
            listener: Mutex::new(listener),
            notify,
        }
    }

    /// Records the result in the registry and notifies listeners. Returns
    /// false if this attempt was already completed.
    pub fn complete(&self, result: Result<Vec<u8>>) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        let id = self.model_id.as_str();
        let failure = match result {
            Ok(blob) => match self.registry.complete_training(id, blob) {
                Ok(_) => None,
                Err(err) => Some(err.to_string()),
            },
            Err(err) => Some(err.to_string()),
        };
        if let Some(error) = &failure {
            self.registry.fail_training(id, error);
        }

        let outcome = TrainingOutcome {
            model_id: self.model_id.clone(),
            state: self
                .registry
                .get(id)
                .map(|m| m.state)
                .unwrap_or(ModelState::Failed),
            error: failure,
        };
        if let Some(listener) = self.listener.lock().take() {
            listener(&outcome);
        }
        let _ = self.notify.send(outcome);
        true
    }
}

/// Handle returned for an accepted job.
pub struct TrainingTicket {
    model_id: String,
    outcome: Receiver<TrainingOutcome>,
}

impl TrainingTicket {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Blocks until the job reaches a terminal state.
    pub fn wait(self) -> Result<TrainingOutcome> {
        self.outcome
            .recv()
            .map_err(|_| KnnError::Io(format!("training job {} vanished", self.model_id)))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TrainingOutcome> {
        self.outcome.recv_timeout(timeout).ok()
    }
}

#[derive(Default)]
struct JobControl {
    cancelled: AtomicBool,
}

impl JobControl {
    fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(KnnError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingStats {
    pub training_requests: u64,
    pub training_errors: u64,
    pub running_jobs: usize,
}

pub struct TrainingJobRunner {
    pool: rayon::ThreadPool,
    budget: Arc<NativeMemoryBudget>,
    registry: Arc<ModelRegistry>,
    library: Arc<dyn NativeLibrary>,
    running: Mutex<HashMap<String, Arc<JobControl>>>,
    batch_bytes: u64,
    sample_size: usize,
    seed: u64,
    node_id: String,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl TrainingJobRunner {
    pub fn new(
        config: &EngineConfig,
        budget: Arc<NativeMemoryBudget>,
        registry: Arc<ModelRegistry>,
        library: Arc<dyn NativeLibrary>,
    ) -> Result<Arc<Self>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.training_threads.max(1))
            .thread_name(|idx| format!("knn-train-{idx}"))
            .build()
            .map_err(|e| KnnError::Io(format!("building training pool: {e}")))?;

        Ok(Arc::new(Self {
            pool,
            budget,
            registry,
            library,
            running: Mutex::new(HashMap::new()),
            batch_bytes: config.training_batch_bytes,
            sample_size: config.quantization_sample_size,
            seed: config.sampler_seed,
            node_id: config.node_id.clone(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }))
    }

    /// Accepts `job` and starts it in the background.
    ///
    /// Fails immediately with `ConcurrencyConflict` when the model is already
    /// training, or `CapacityExceeded` when its memory claims do not fit.
    pub fn execute(
        self: &Arc<Self>,
        job: TrainingJob,
        listener: Option<CompletionListener>,
    ) -> Result<TrainingTicket> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let (control, claims) = self.accept(&job).inspect_err(|err| {
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!(model_id = %job.model_id, "training request rejected: {err}");
        })?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        let completion = JobCompletion::new(
            job.model_id.clone(),
            Arc::clone(&self.registry),
            listener,
            tx,
        );
        let ticket = TrainingTicket {
            model_id: job.model_id.clone(),
            outcome: rx,
        };

        let runner = Arc::clone(self);
        self.pool.spawn(move || {
            info!(
                model_id = %job.model_id,
                method = ?job.method,
                vectors = job.vector_count(),
                "training started"
            );
            let result = runner.run(&job, &control);
            match &result {
                Ok(blob) => info!(model_id = %job.model_id, bytes = blob.len(), "training finished"),
                Err(err) => {
                    runner.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(model_id = %job.model_id, "training failed: {err}");
                }
            }
            drop(claims);
            runner.running.lock().remove(&job.model_id);
            completion.complete(result);
        });

        Ok(ticket)
    }

    fn accept(&self, job: &TrainingJob) -> Result<(Arc<JobControl>, [Reservation; 2])> {
        let mut running = self.running.lock();
        if running.contains_key(&job.model_id) {
            return Err(KnnError::ConcurrencyConflict(format!(
                "model {} is already training on this node",
                job.model_id
            )));
        }
        if job.dimension == 0 {
            return Err(KnnError::InvalidArgument("dimension must be positive".into()));
        }
        if job.data.dimension() != job.dimension {
            return Err(KnnError::DimensionMismatch {
                expected: job.dimension,
                actual: job.data.dimension(),
            });
        }
        if let TrainingMethod::Ivf { nlist: 0, .. } = job.method {
            return Err(KnnError::InvalidArgument("nlist must be positive".into()));
        }

        let claims = [
            self.budget.try_reserve(job.training_data_claim())?,
            self.budget.try_reserve(job.model_claim())?,
        ];
        self.registry.begin_training(
            &job.model_id,
            ModelMetadata::training(
                job.space_type,
                job.dimension,
                job.method,
                job.description.clone(),
                self.node_id.clone(),
            ),
        )?;

        let control = Arc::new(JobControl::default());
        running.insert(job.model_id.clone(), Arc::clone(&control));
        Ok((control, claims))
    }

    /// Requests cancellation of the job training `model_id` on this node.
    pub fn cancel(&self, model_id: &str) -> bool {
        match self.running.lock().get(model_id) {
            Some(control) => {
                control.cancelled.store(true, Ordering::Release);
                info!(model_id, "training cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, model_id: &str) -> bool {
        self.running.lock().contains_key(model_id)
    }

    pub fn stats(&self) -> TrainingStats {
        TrainingStats {
            training_requests: self.requests.load(Ordering::Relaxed),
            training_errors: self.errors.load(Ordering::Relaxed),
            running_jobs: self.running.lock().len(),
        }
    }

    fn run(&self, job: &TrainingJob, control: &JobControl) -> Result<Vec<u8>> {
        match job.method {
            TrainingMethod::Ivf { nlist, .. } => {
                let mut staged: Option<NativeHandle> = None;
                self.read_batches(job, control, |batch| {
                    let address = self
                        .library
                        .store_vector_data(staged.as_ref().map(NativeHandle::address), &batch)?;
                    if staged.is_none() {
                        staged = Some(NativeHandle::new(
                            Arc::clone(&self.library),
                            address,
                            job.training_data_claim() as usize,
                        ));
                    }
                    Ok(())
                })?;
                control.check()?;

                let staged = staged.ok_or_else(|| {
                    KnnError::InvalidArgument(format!("no training vectors for {}", job.model_id))
                })?;
                let params = TrainParams {
                    nlist,
                    max_iterations: IVF_MAX_ITERATIONS,
                    seed: self.seed,
                };
                let centroids = self
                    .library
                    .train_index(&params, job.dimension, staged.address())?;
                let state = QuantizationState::new(
                    job.dimension,
                    QuantizationParams::Codebook { bytes: centroids },
                );
                Ok(state.to_bytes())
            }
            TrainingMethod::Sq8 | TrainingMethod::Binary => {
                let mut vectors = Vec::with_capacity(job.vector_count());
                self.read_batches(job, control, |batch| {
                    vectors.extend(batch);
                    Ok(())
                })?;
                control.check()?;
                if vectors.is_empty() {
                    return Err(KnnError::InvalidArgument(format!(
                        "no training vectors for {}",
                        job.model_id
                    )));
                }

                let state = if job.method == TrainingMethod::Sq8 {
                    ByteScalarQuantizer::new(self.sample_size, self.seed).train(&vectors)?
                } else {
                    OneBitQuantizer::new(self.sample_size, self.seed).train(&vectors)?
                };
                Ok(state.to_bytes())
            }
        }
    }

    /// Feeds the job's vectors to `sink` in batches that fit the byte budget,
    /// checking for cancellation before each batch.
    fn read_batches<F>(&self, job: &TrainingJob, control: &JobControl, mut sink: F) -> Result<()>
    where
        F: FnMut(Vec<Vec<f32>>) -> Result<()>,
    {
        let limit = job.vector_count();
        let vector_bytes = (job.dimension * std::mem::size_of::<f32>()) as u64;
        let batch_size = (self.batch_bytes / vector_bytes).max(1) as usize;

        let mut offset = 0;
        while offset < limit {
            control.check()?;
            let batch = job.data.read(offset, batch_size.min(limit - offset))?;
            if batch.is_empty() {
                break;
            }
            if let Some(bad) = batch.iter().find(|v| v.len() != job.dimension) {
                return Err(KnnError::DimensionMismatch {
                    expected: job.dimension,
                    actual: bad.len(),
                });
            }
            offset += batch.len();
            debug!(model_id = %job.model_id, read = offset, of = limit, "training batch");
            sink(batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knn_native::ArenaLibrary;

    fn runner(capacity: u64, batch_bytes: u64) -> (Arc<TrainingJobRunner>, Arc<ModelRegistry>) {
        let config = EngineConfig {
            training_batch_bytes: batch_bytes,
            ..EngineConfig::default()
        };
        let registry = Arc::new(ModelRegistry::in_memory());
        let runner = TrainingJobRunner::new(
            &config,
            NativeMemoryBudget::new(capacity),
            Arc::clone(&registry),
            Arc::new(ArenaLibrary::new()),
        )
        .unwrap();
        (runner, registry)
    }

    fn job(model_id: &str, method: TrainingMethod, n: usize) -> TrainingJob {
        let vectors = (0..n).map(|i| vec![i as f32, (n - i) as f32]).collect();
        TrainingJob {
            model_id: model_id.to_string(),
            method,
            space_type: SpaceType::L2,
            dimension: 2,
            max_vectors: 1000,
            description: String::new(),
            data: Arc::new(InMemoryTrainingData::new(2, vectors).unwrap()),
        }
    }

    #[test]
    fn sq8_job_creates_model() {
        let (runner, registry) = runner(1 << 20, 64);
        let outcome = runner
            .execute(job("sq", TrainingMethod::Sq8, 100), None)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(outcome.state, ModelState::Created);
        assert_eq!(registry.quantization_state("sq").unwrap().dimension(), 2);
        assert_eq!(runner.budget.committed(), 0);
        assert_eq!(runner.stats().training_requests, 1);
    }

    #[test]
    fn ivf_job_trains_centroids_in_batches() {
        let (runner, registry) = runner(1 << 20, 16);
        let method = TrainingMethod::Ivf { nlist: 3, nprobe: 1 };
        let outcome = runner.execute(job("ivf", method, 50), None).unwrap().wait().unwrap();
        assert_eq!(outcome.state, ModelState::Created);
        assert_eq!(registry.build_template("ivf").unwrap().len(), 3 * 2 * 4);
    }

    #[test]
    fn claims_over_budget_fail_fast() {
        let (runner, registry) = runner(100, 64);
        let err = runner
            .execute(job("big", TrainingMethod::Sq8, 100), None)
            .err()
            .unwrap();
        assert!(matches!(err, KnnError::CapacityExceeded { .. }));
        assert!(registry.get("big").is_none());
        assert_eq!(runner.budget.committed(), 0);
        assert_eq!(runner.stats().training_errors, 1);
    }

    #[test]
    fn empty_corpus_fails_model() {
        let (runner, registry) = runner(1 << 20, 64);
        let outcome = runner
            .execute(job("empty", TrainingMethod::Binary, 0), None)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(outcome.state, ModelState::Failed);
        assert!(registry.get("empty").unwrap().error.is_some());
    }

    #[test]
    fn completion_fires_once() {
        let registry = Arc::new(ModelRegistry::in_memory());
        registry
            .begin_training(
                "m",
                ModelMetadata::training(SpaceType::L2, 2, TrainingMethod::Sq8, "", "n"),
            )
            .unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let calls = Arc::new(AtomicU64::new(0));
        let counted = Arc::clone(&calls);
        let completion = JobCompletion::new(
            "m".into(),
            Arc::clone(&registry),
            Some(Box::new(move |_: &TrainingOutcome| {
                counted.fetch_add(1, Ordering::SeqCst);
            })),
            tx,
        );

        assert!(completion.complete(Err(KnnError::Cancelled)));
        assert!(!completion.complete(Ok(vec![1, 2, 3])));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_iter().count(), 1);
        let m = registry.get("m").unwrap();
        assert_eq!(m.state, ModelState::Failed);
        assert_eq!(m.error.as_deref(), Some("training cancelled"));
    }
}
