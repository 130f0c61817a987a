use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct ScheduledCycle {
    pub funnel_id: String,
    pub queued_at: DateTime<Utc>,
}

impl ScheduledCycle {
    pub fn now(funnel_id: &str) -> Self {
        Self {
            funnel_id: funnel_id.to_string(),
            queued_at: Utc::now(),
        }
    }
}

type ExecutorFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub type Executor = Arc<dyn Fn(String) -> ExecutorFuture + Send + Sync>;

/// FIFO queue of funnel cycles. Runs up to `global_limit` cycles at once and
/// never two for the same funnel; a funnel already queued is not queued twice.
#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<Mutex<VecDeque<ScheduledCycle>>>,
    running_global: Arc<Mutex<usize>>,
    running_funnel: Arc<Mutex<HashMap<String, usize>>>,
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<Executor>>>,
    global_limit: usize,
    max_queue_size: usize,
}

impl Scheduler {
    pub fn new(global_limit: usize, max_queue_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            running_global: Arc::new(Mutex::new(0)),
            running_funnel: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            global_limit: global_limit.max(1),
            max_queue_size,
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        match self.executor.write() {
            Ok(mut writer) => *writer = Some(executor),
            Err(poisoned) => *poisoned.into_inner() = Some(executor),
        }
    }

    pub async fn enqueue(&self, cycle: ScheduledCycle) -> Result<(), String> {
        {
            let mut queue = self.queue.lock().await;
            if queue.iter().any(|queued| queued.funnel_id == cycle.funnel_id) {
                return Ok(());
            }
            if queue.len() >= self.max_queue_size {
                return Err(format!(
                    "Queue capacity exceeded (max {}).",
                    self.max_queue_size
                ));
            }
            queue.push_back(cycle);
        }
        self.notify.notify_one();
        Ok(())
    }

    #[cfg(test)]
    async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn start(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
    }

    /// Enqueues every funnel on each tick of `interval`, starting immediately.
    pub fn start_interval(&self, funnel_ids: Vec<String>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for funnel_id in &funnel_ids {
                    if let Err(error) = scheduler.enqueue(ScheduledCycle::now(funnel_id)).await {
                        tracing::warn!(funnel_id = %funnel_id, error = %error, "could not queue cycle");
                    }
                }
            }
        })
    }

    async fn run_loop(self) {
        loop {
            self.notify.notified().await;
            let mut blocked_attempts = 0usize;
            loop {
                let Some(cycle) = self.pick_next().await else {
                    break;
                };

                if !self.try_reserve_slot(&cycle.funnel_id).await {
                    let mut queue = self.queue.lock().await;
                    queue.push_back(cycle);
                    blocked_attempts += 1;
                    if blocked_attempts >= queue.len() {
                        break;
                    }
                    continue;
                }
                blocked_attempts = 0;
                tracing::debug!(
                    funnel_id = %cycle.funnel_id,
                    waited_ms = (Utc::now() - cycle.queued_at).num_milliseconds().max(0),
                    "scheduled cycle starting"
                );

                let scheduler = self.clone();
                tokio::spawn(async move {
                    let failed = scheduler.execute(cycle.funnel_id.clone()).await;
                    scheduler.release_slot(&cycle.funnel_id).await;
                    if failed {
                        tracing::warn!(funnel_id = %cycle.funnel_id, "scheduled cycle did not complete");
                    }
                    scheduler.notify.notify_one();
                });
            }
        }
    }

    async fn execute(&self, funnel_id: String) -> bool {
        let executor = match self.executor.read() {
            Ok(reader) => reader.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match executor {
            Some(executor) => executor(funnel_id).await,
            None => true,
        }
    }

    async fn pick_next(&self) -> Option<ScheduledCycle> {
        self.queue.lock().await.pop_front()
    }

    async fn try_reserve_slot(&self, funnel_id: &str) -> bool {
        let mut global = self.running_global.lock().await;
        if *global >= self.global_limit {
            return false;
        }

        let mut funnel_map = self.running_funnel.lock().await;
        let entry = funnel_map.entry(funnel_id.to_string()).or_insert(0);
        if *entry >= 1 {
            return false;
        }

        *global += 1;
        *entry += 1;
        true
    }

    async fn release_slot(&self, funnel_id: &str) {
        let mut global = self.running_global.lock().await;
        if *global > 0 {
            *global -= 1;
        }

        let mut funnel_map = self.running_funnel.lock().await;
        if let Some(entry) = funnel_map.get_mut(funnel_id) {
            if *entry > 0 {
                *entry -= 1;
            }
        }
    }
}
