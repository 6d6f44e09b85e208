//! Metric label sets derived from a job and its worker's static attributes.

use metrics::Label;

use crate::jobs::{Job, WorkerAttributes};

/// Store name used when a worker does not route to a dedicated Redis store.
pub const MAIN_STORE: &str = "main";

/// Final status of a job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusLabel {
    Done,
    Fail,
}

impl JobStatusLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Fail => "fail",
        }
    }
}

/// Ordered, immutable label pairs attached to every job metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<(&'static str, String)>,
}

impl LabelSet {
    /// Labels for the enqueue side. Urgency is empty when the worker declares none.
    pub fn for_client(attrs: &WorkerAttributes, job: &Job) -> Self {
        let urgency = attrs
            .urgency
            .map(|u| u.as_str().to_string())
            .unwrap_or_default();
        Self::derive(attrs, job, urgency)
    }

    /// Labels for the execution side. Urgency falls back to the default.
    pub fn for_server(attrs: &WorkerAttributes, job: &Job) -> Self {
        Self::derive(attrs, job, attrs.urgency().as_str().to_string())
    }

    fn derive(attrs: &WorkerAttributes, job: &Job, urgency: String) -> Self {
        let external_dependencies = if attrs.external_dependencies { "yes" } else { "no" };
        Self {
            labels: vec![
                ("queue", job.queue.clone()),
                ("worker", job.worker.clone()),
                ("urgency", urgency),
                ("external_dependencies", external_dependencies.to_string()),
                (
                    "feature_category",
                    attrs.feature_category.clone().unwrap_or_default(),
                ),
                ("boundary", attrs.resource_boundary.label().to_string()),
                (
                    "destination_shard_redis",
                    attrs
                        .store
                        .clone()
                        .unwrap_or_else(|| MAIN_STORE.to_string()),
                ),
            ],
        }
    }

    /// A copy with the final `job_status` appended.
    pub fn with_status(&self, status: JobStatusLabel) -> Self {
        let mut labels = self.labels.clone();
        labels.push(("job_status", status.as_str().to_string()));
        Self { labels }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.labels.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels in the form the `metrics` macros accept.
    pub fn to_labels(&self) -> Vec<Label> {
        self.labels
            .iter()
            .map(|(k, v)| Label::new(*k, v.clone()))
            .collect()
    }
}
