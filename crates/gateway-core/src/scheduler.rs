//! Continuous-batching scheduler: a cooperative loop that advances many
//! generation sequences one token per tick, refilling freed slots mid-stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use gateway_common::config::GatewayConfig;
use gateway_common::{GatewayError, Result};
use gateway_obs::Telemetry;

use crate::capacity::KvPressureTracker;

pub struct InferenceJob {
    pub request_id: String,
    pub tenant_id: String,
    pub adapter_id: String,
    pub prompt: String,
    pub prompt_tokens: u32,
    pub max_new_tokens: u32,
    pub estimated_total_tokens: u32,
    pub admitted_at: Instant,
    pub enqueued_at: Instant,
    pub result_tx: oneshot::Sender<Result<GenerationResult>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub request_id: String,
    pub tenant_id: String,
    pub adapter_id: String,
    pub output: String,
    pub completion_tokens: u32,
    pub queue_time_seconds: f64,
    pub ttft_seconds: f64,
    pub avg_tpot_seconds: f64,
    pub total_time_seconds: f64,
}

struct ActiveSequence {
    job: InferenceJob,
    started_at: Option<Instant>,
    first_token_at: Option<Instant>,
    last_token_at: Option<Instant>,
    output_chunks: Vec<String>,
    generated_tokens: u32,
    tpot_deltas: Vec<f64>,
    done: bool,
}

impl ActiveSequence {
    fn new(job: InferenceJob) -> Self {
        Self {
            job,
            started_at: None,
            first_token_at: None,
            last_token_at: None,
            output_chunks: Vec::new(),
            generated_tokens: 0,
            tpot_deltas: Vec::new(),
            done: false,
        }
    }
}

/// A bounded FIFO of pending jobs, shared between the admission path
/// (`try_push`, non-blocking) and the decode loop (`pop`).
struct JobQueue {
    capacity: usize,
    jobs: Mutex<VecDeque<InferenceJob>>,
}

impl JobQueue {
    fn new(capacity: usize) -> Self {
        Self { capacity, jobs: Mutex::new(VecDeque::new()) }
    }

    fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn try_push(&self, job: InferenceJob) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.len() >= self.capacity {
            return false;
        }
        jobs.push_back(job);
        true
    }

    fn pop(&self) -> Option<InferenceJob> {
        self.jobs.lock().unwrap().pop_front()
    }
}

/// Cooperative continuous-batching scheduler. A single background task owns
/// the active set exclusively; `enqueue` is the only other mutator and only
/// ever touches the shared job queue.
pub struct Scheduler {
    queue: Arc<JobQueue>,
    kv_tracker: Arc<Mutex<KvPressureTracker>>,
    telemetry: Arc<dyn Telemetry>,
    max_active_sequences: usize,
    decode_step: Duration,
    idle_sleep: Duration,
    active_count: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: &GatewayConfig, kv_tracker: Arc<Mutex<KvPressureTracker>>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            queue: Arc::new(JobQueue::new(config.scheduler_queue_capacity)),
            kv_tracker,
            telemetry,
            max_active_sequences: config.scheduler_max_active_sequences,
            decode_step: Duration::from_secs_f64(config.scheduler_decode_step_seconds),
            idle_sleep: Duration::from_secs_f64(config.scheduler_idle_sleep_seconds),
            active_count: Arc::new(AtomicUsize::new(0)),
            stopping: Arc::new(AtomicBool::new(false)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Idempotent; spawns the decode loop if not already running.
    pub async fn start(&self) {
        let mut guard = self.task.lock().await;
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.stopping.store(false, Ordering::Relaxed);
        let queue = self.queue.clone();
        let kv_tracker = self.kv_tracker.clone();
        let telemetry = self.telemetry.clone();
        let active_count = self.active_count.clone();
        let stopping = self.stopping.clone();
        let max_active = self.max_active_sequences;
        let decode_step = self.decode_step;
        let idle_sleep = self.idle_sleep;
        tracing::info!(target: "scheduler", "starting continuous-batching decode loop");
        *guard = Some(tokio::spawn(run_loop(
            queue, kv_tracker, telemetry, active_count, stopping, max_active, decode_step, idle_sleep,
        )));
    }

    /// Signals stop, awaits the loop, then every queued and active job has
    /// been released and failed by the time this returns.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            tracing::info!(target: "scheduler", "stopping decode loop and draining outstanding jobs");
            let _ = handle.await;
        }
    }

    /// Non-blocking fast path: if the queue is full, returns `false` without
    /// mutating anything.
    pub fn enqueue(&self, job: InferenceJob) -> bool {
        let accepted = self.queue.try_push(job);
        if accepted {
            self.telemetry.tick_scheduler(self.queue_depth() as i64, self.active_count() as i64);
        }
        accepted
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    queue: Arc<JobQueue>,
    kv_tracker: Arc<Mutex<KvPressureTracker>>,
    telemetry: Arc<dyn Telemetry>,
    active_count: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    max_active: usize,
    decode_step: Duration,
    idle_sleep: Duration,
) {
    let mut active: Vec<ActiveSequence> = Vec::new();

    loop {
        if stopping.load(Ordering::Relaxed) {
            break;
        }

        refill_slots(&queue, &mut active, max_active);
        active_count.store(active.len(), Ordering::Relaxed);

        if active.is_empty() {
            telemetry.tick_scheduler(queue.len() as i64, active.len() as i64);
            tokio::time::sleep(idle_sleep).await;
            continue;
        }

        tokio::time::sleep(decode_step).await;
        let now = Instant::now();

        for sequence in active.iter_mut() {
            decode_one_step(sequence, now, telemetry.as_ref());
        }

        finalize_completed(&mut active, &kv_tracker, telemetry.as_ref(), now);
        refill_slots(&queue, &mut active, max_active);
        active_count.store(active.len(), Ordering::Relaxed);
        telemetry.tick_scheduler(queue.len() as i64, active.len() as i64);
        telemetry.set_kv_utilization(kv_tracker.lock().unwrap().utilization_ratio());
    }

    while let Some(job) = queue.pop() {
        kv_tracker.lock().unwrap().release(&job.request_id);
        let _ = job
            .result_tx
            .send(Err(GatewayError::SchedulerStopped("stopped before execution".into())));
    }
    for sequence in active.drain(..) {
        kv_tracker.lock().unwrap().release(&sequence.job.request_id);
        let _ = sequence
            .job
            .result_tx
            .send(Err(GatewayError::SchedulerStopped("stopped during execution".into())));
    }
    active_count.store(0, Ordering::Relaxed);
    telemetry.tick_scheduler(queue.len() as i64, 0);
    telemetry.set_kv_utilization(kv_tracker.lock().unwrap().utilization_ratio());
}

fn refill_slots(queue: &JobQueue, active: &mut Vec<ActiveSequence>, max_active: usize) {
    while active.len() < max_active {
        match queue.pop() {
            Some(job) => active.push(ActiveSequence::new(job)),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_common::config::GatewayConfig;
    use gateway_obs::NoopTelemetry;

    fn job(request_id: &str, max_new_tokens: u32) -> (InferenceJob, oneshot::Receiver<Result<GenerationResult>>) {
        let (result_tx, result_rx) = oneshot::channel();
        let now = Instant::now();
        let job = InferenceJob {
            request_id: request_id.to_string(),
            tenant_id: "tenant-x".to_string(),
            adapter_id: "adapter-default".to_string(),
            prompt: "hi".to_string(),
            prompt_tokens: 1,
            max_new_tokens,
            estimated_total_tokens: max_new_tokens + 1,
            admitted_at: now,
            enqueued_at: now,
            result_tx,
        };
        (job, result_rx)
    }

    fn scheduler(max_active_sequences: usize) -> Scheduler {
        let mut config = GatewayConfig::default();
        config.scheduler_max_active_sequences = max_active_sequences;
        config.scheduler_decode_step_seconds = 0.001;
        config.scheduler_idle_sleep_seconds = 0.001;
        let kv_tracker = Arc::new(Mutex::new(KvPressureTracker::new(config.kv_budget_bytes)));
        Scheduler::new(&config, kv_tracker, Arc::new(NoopTelemetry))
    }

    #[tokio::test]
    async fn a_freed_slot_is_backfilled_without_waiting_for_other_active_sequences() {
        let scheduler = scheduler(2);
        scheduler.start().await;

        let (short_job, short_rx) = job("short", 1);
        let (long_job, long_rx) = job("long", 200);
        let (waiting_job, waiting_rx) = job("waiting", 1);

        assert!(scheduler.enqueue(short_job));
        assert!(scheduler.enqueue(long_job));
        assert!(scheduler.enqueue(waiting_job));

        // "waiting" sat in the queue behind two max_active=2 slots; once
        // "short" finishes it should take the freed slot and complete well
        // before the much longer "long" sequence does, instead of starving
        // behind FIFO queue order.
        let waiting_result = waiting_rx.await.unwrap().unwrap();
        assert_eq!(waiting_result.request_id, "waiting");

        let _short_result = short_rx.await.unwrap().unwrap();
        let long_result = long_rx.await.unwrap().unwrap();
        assert_eq!(long_result.request_id, "long");

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_queued_and_active_jobs_with_scheduler_stopped_error() {
        let scheduler = scheduler(1);
        scheduler.start().await;

        let (active_job, active_rx) = job("active", 10_000);
        let (queued_job, queued_rx) = job("queued", 1);
        assert!(scheduler.enqueue(active_job));
        assert!(scheduler.enqueue(queued_job));

        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler.stop().await;

        assert!(matches!(active_rx.await.unwrap(), Err(GatewayError::SchedulerStopped(_))));
        assert!(matches!(queued_rx.await.unwrap(), Err(GatewayError::SchedulerStopped(_))));
        assert_eq!(scheduler.active_count(), 0);
    }
}

fn decode_one_step(sequence: &mut ActiveSequence, now: Instant, telemetry: &dyn Telemetry) {
    if sequence.done {
        return;
    }

    if sequence.started_at.is_none() {
        sequence.started_at = Some(now);
        let queue_wait = now.duration_since(sequence.job.enqueued_at).as_secs_f64();
        telemetry.observe_queue_wait(&sequence.job.tenant_id, queue_wait);
    }

    if sequence.generated_tokens == 0 {
        sequence.first_token_at = Some(now);
        let ttft = now.duration_since(sequence.job.admitted_at).as_secs_f64();
        telemetry.observe_ttft(&sequence.job.tenant_id, ttft);
    } else if let Some(last_token_at) = sequence.last_token_at {
        let delta = now.duration_since(last_token_at).as_secs_f64();
        sequence.tpot_deltas.push(delta);
        telemetry.observe_tpot(&sequence.job.tenant_id, delta);
    }

    let next_index = sequence.generated_tokens + 1;
    sequence.output_chunks.push(format!("tok{next_index}"));
    sequence.generated_tokens = next_index;
    sequence.last_token_at = Some(now);

    if sequence.generated_tokens >= sequence.job.max_new_tokens {
        sequence.done = true;
    }
}

fn finalize_completed(
    active: &mut Vec<ActiveSequence>,
    kv_tracker: &Mutex<KvPressureTracker>,
    telemetry: &dyn Telemetry,
    now: Instant,
) {
    let mut remaining = Vec::with_capacity(active.len());
    for sequence in active.drain(..) {
        if !sequence.done {
            remaining.push(sequence);
            continue;
        }

        kv_tracker.lock().unwrap().release(&sequence.job.request_id);
        telemetry.set_kv_utilization(kv_tracker.lock().unwrap().utilization_ratio());
        telemetry.add_generated_tokens(&sequence.job.tenant_id, sequence.generated_tokens as u64);

        let ttft_seconds = sequence
            .first_token_at
            .map(|t| t.duration_since(sequence.job.admitted_at).as_secs_f64())
            .unwrap_or(0.0);
        let avg_tpot_seconds = if sequence.tpot_deltas.is_empty() {
            0.0
        } else {
            sequence.tpot_deltas.iter().sum::<f64>() / sequence.tpot_deltas.len() as f64
        };
        let queue_time_seconds = sequence
            .started_at
            .unwrap_or(now)
            .duration_since(sequence.job.enqueued_at)
            .as_secs_f64();
        let total_time_seconds = now.duration_since(sequence.job.admitted_at).as_secs_f64();

        let result = GenerationResult {
            request_id: sequence.job.request_id.clone(),
            tenant_id: sequence.job.tenant_id.clone(),
            adapter_id: sequence.job.adapter_id.clone(),
            output: sequence.output_chunks.join(" "),
            completion_tokens: sequence.generated_tokens,
            queue_time_seconds,
            ttft_seconds,
            avg_tpot_seconds,
            total_time_seconds,
        };
        let _ = sequence.job.result_tx.send(Ok(result));
    }
    *active = remaining;
}
