use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::job::Job;

/// Hard cap on retained jobs regardless of policy.
const MAX_BACKLOG: usize = 12;

/// What happens to older jobs when a new chain tip arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Bitcoin family: stale work is worthless, drop everything.
    ClearOnNewTip,
    /// Ethereum family: tolerate submissions against the last N heights.
    HeightWindow(u64),
}

/// jobId → Job map for one pool, guarded by the job lock in the manager.
pub struct JobRegistry {
    policy: RetentionPolicy,
    jobs: HashMap<String, Arc<Job>>,
    order: VecDeque<String>,
}

impl JobRegistry {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            jobs: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, job: Arc<Job>, is_new_tip: bool) {
        if is_new_tip {
            match self.policy {
                RetentionPolicy::ClearOnNewTip => {
                    self.jobs.clear();
                    self.order.clear();
                }
                RetentionPolicy::HeightWindow(heights) => {
                    let min_height = job.height().saturating_sub(heights.saturating_sub(1));
                    self.jobs.retain(|_, j| j.height() >= min_height);
                    let jobs = &self.jobs;
                    self.order.retain(|id| jobs.contains_key(id));
                }
            }
        }

        self.order.push_back(job.id().to_string());
        self.jobs.insert(job.id().to_string(), job);

        while self.order.len() > MAX_BACKLOG {
            if let Some(oldest) = self.order.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
