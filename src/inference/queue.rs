//! Asynchronous inference queue
//!
//! A fixed pool of worker threads, each owning a clone of the model, pulls
//! jobs from a bounded channel. Every finished job invokes the registered
//! completion callback with the result and the job's user data.
//! [`InferQueue::wait_all`] blocks until nothing is in flight and reports the
//! first error raised by inference or by a callback.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use burn::tensor::backend::Backend;
use tracing::{debug, error};

use super::compiled::CompiledModel;
use super::result::InferenceResult;
use crate::utils::error::{AnomalyError, Result};

/// Something that can run one preprocessed image
pub trait InferenceEngine: Clone + Send + 'static {
    fn infer(&self, input: &[f32]) -> Result<InferenceResult>;
}

impl<B: Backend> InferenceEngine for CompiledModel<B> {
    fn infer(&self, input: &[f32]) -> Result<InferenceResult> {
        CompiledModel::infer(self, input)
    }
}

/// Completion callback: result plus the user data passed to `start_async`
pub type Callback<T> = Arc<dyn Fn(&InferenceResult, &T) -> Result<()> + Send + Sync>;

struct Job<T> {
    input: Vec<f32>,
    data: T,
}

#[derive(Default)]
struct Pending {
    in_flight: usize,
    completed: usize,
    first_error: Option<AnomalyError>,
}

#[derive(Default)]
struct QueueState {
    pending: Mutex<Pending>,
    idle: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QueueState {
    fn finish(&self, outcome: Result<()>) {
        let mut pending = lock(&self.pending);
        pending.in_flight = pending.in_flight.saturating_sub(1);
        pending.completed += 1;
        if let Err(e) = outcome {
            error!("Inference job failed: {}", e);
            pending.first_error.get_or_insert(e);
        }
        if pending.in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

/// Pool of inference workers fed through a bounded channel
pub struct InferQueue<T: Send + 'static> {
    sender: Option<SyncSender<Job<T>>>,
    workers: Vec<JoinHandle<()>>,
    state: Arc<QueueState>,
    callback: Arc<RwLock<Callback<T>>>,
}

impl<T: Send + 'static> InferQueue<T> {
    /// Spawn `num_workers` workers with `depth_per_worker` queued jobs each
    pub fn new<E: InferenceEngine>(engine: E, num_workers: usize, depth_per_worker: usize) -> Result<Self> {
        let num_workers = num_workers.max(1);
        let capacity = num_workers * depth_per_worker.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Job<T>>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let state = Arc::new(QueueState::default());
        let noop: Callback<T> = Arc::new(|_: &InferenceResult, _: &T| -> Result<()> { Ok(()) });
        let callback = Arc::new(RwLock::new(noop));

        let workers = (0..num_workers)
            .map(|id| {
                let engine = engine.clone();
                let receiver = Arc::clone(&receiver);
                let state = Arc::clone(&state);
                let callback = Arc::clone(&callback);
                thread::Builder::new()
                    .name(format!("infer-worker-{id}"))
                    .spawn(move || worker_loop(id, engine, receiver, state, callback))
                    .map_err(|e| AnomalyError::Queue(format!("Failed to spawn worker {id}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Inference queue: {} workers, capacity {}", num_workers, capacity);

        Ok(Self {
            sender: Some(sender),
            workers,
            state,
            callback,
        })
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Replace the completion callback for jobs started afterwards
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&InferenceResult, &T) -> Result<()> + Send + Sync + 'static,
    {
        let mut slot = self
            .callback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Arc::new(callback);
    }

    /// Queue one CHW image; blocks while the channel is full
    pub fn start_async(&self, input: Vec<f32>, data: T) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| AnomalyError::Queue("Queue is closed".to_string()))?;

        lock(&self.state.pending).in_flight += 1;
        if sender.send(Job { input, data }).is_err() {
            let mut pending = lock(&self.state.pending);
            pending.in_flight = pending.in_flight.saturating_sub(1);
            return Err(AnomalyError::Queue("All workers have stopped".to_string()));
        }
        Ok(())
    }

    /// Block until every started job has completed.
    ///
    /// Returns the first error raised since the previous call.
    pub fn wait_all(&self) -> Result<()> {
        let mut pending = lock(&self.state.pending);
        while pending.in_flight > 0 {
            pending = self
                .state
                .idle
                .wait(pending)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match pending.first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Jobs completed since the queue was created
    pub fn completed(&self) -> usize {
        lock(&self.state.pending).completed
    }
}

impl<T: Send + 'static> Drop for InferQueue<T> {
    fn drop(&mut self) {
        // closing the channel ends every worker loop
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Inference worker panicked");
            }
        }
    }
}

fn worker_loop<E: InferenceEngine, T>(
    id: usize,
    engine: E,
    receiver: Arc<Mutex<Receiver<Job<T>>>>,
    state: Arc<QueueState>,
    callback: Arc<RwLock<Callback<T>>>,
) {
    loop {
        let job = lock(&receiver).recv();
        let Ok(job) = job else {
            debug!("Worker {} shutting down", id);
            break;
        };

        let callback = callback
            .read()
            .map(|cb| (*cb).clone())
            .unwrap_or_else(|poisoned| (*poisoned.into_inner()).clone());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            engine
                .infer(&job.input)
                .and_then(|result| callback(&result, &job.data))
        }))
        .unwrap_or_else(|payload| {
            Err(AnomalyError::Queue(format!(
                "Worker {id} panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
        state.finish(outcome);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Label;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scores an image by its mean value
    #[derive(Clone)]
    struct MeanEngine;

    impl InferenceEngine for MeanEngine {
        fn infer(&self, input: &[f32]) -> Result<InferenceResult> {
            if input.is_empty() {
                return Err(AnomalyError::Inference("empty input".to_string()));
            }
            let score = input.iter().sum::<f32>() / input.len() as f32;
            Ok(InferenceResult {
                pred_score: score,
                pred_label: Label::from_anomalous(score >= 0.5),
                anomaly_map: input.to_vec(),
                pred_mask: input.iter().map(|&v| v >= 0.5).collect(),
                width: input.len(),
                height: 1,
            })
        }
    }

    #[test]
    fn test_all_jobs_complete() {
        let queue = InferQueue::<usize>::new(MeanEngine, 3, 2).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(Mutex::new(0usize));

        let (seen_cb, sum_cb) = (Arc::clone(&seen), Arc::clone(&sum));
        queue.set_callback(move |_, id: &usize| {
            seen_cb.fetch_add(1, Ordering::SeqCst);
            *sum_cb.lock().unwrap() += *id;
            Ok(())
        });

        for id in 0..50 {
            queue.start_async(vec![0.25; 4], id).unwrap();
        }
        queue.wait_all().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 50);
        assert_eq!(*sum.lock().unwrap(), (0..50).sum::<usize>());
        assert_eq!(queue.completed(), 50);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_callback_error_surfaces_in_wait_all() {
        let queue = InferQueue::<usize>::new(MeanEngine, 2, 1).unwrap();
        queue.set_callback(|_, id: &usize| {
            if *id == 3 {
                Err(AnomalyError::Image("write failed".to_string()))
            } else {
                Ok(())
            }
        });

        for id in 0..8 {
            queue.start_async(vec![1.0], id).unwrap();
        }
        let err = queue.wait_all().unwrap_err();
        assert!(matches!(err, AnomalyError::Image(_)));

        // error is reported once
        queue.start_async(vec![1.0], 0).unwrap();
        assert!(queue.wait_all().is_ok());
    }

    #[test]
    fn test_inference_error_surfaces() {
        let queue = InferQueue::<()>::new(MeanEngine, 1, 1).unwrap();
        queue.start_async(Vec::new(), ()).unwrap();
        assert!(matches!(queue.wait_all(), Err(AnomalyError::Inference(_))));
    }

    #[test]
    fn test_panicking_callback_fails_instead_of_hanging() {
        let queue = InferQueue::<usize>::new(MeanEngine, 1, 1).unwrap();
        queue.set_callback(|_, id: &usize| {
            if *id == 1 {
                panic!("callback exploded");
            }
            Ok(())
        });

        for id in 0..3 {
            queue.start_async(vec![0.5], id).unwrap();
        }
        match queue.wait_all() {
            Err(AnomalyError::Queue(msg)) => assert!(msg.contains("callback exploded")),
            other => panic!("expected queue error, got {:?}", other),
        }

        // the worker survives and keeps serving jobs
        queue.start_async(vec![0.5], 5).unwrap();
        assert!(queue.wait_all().is_ok());
        assert_eq!(queue.completed(), 4);
    }

    #[test]
    fn test_wait_all_without_jobs() {
        let queue = InferQueue::<()>::new(MeanEngine, 2, 2).unwrap();
        assert!(queue.wait_all().is_ok());
        drop(queue);
    }
}
