use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::config::TrackDef;
use crate::features::{Feature, FeatureStatus};

/// One dequeued unit of work for a track loop.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub feature_id: u64,
    pub is_retry: bool,
    pub is_resume: bool,
    pub extra_context: String,
    pub previous_session_id: Option<String>,
}

impl QueueItem {
    fn fresh(feature_id: u64) -> Self {
        Self {
            feature_id,
            is_retry: false,
            is_resume: false,
            extra_context: String::new(),
            previous_session_id: None,
        }
    }
}

#[derive(Debug, Default)]
struct TrackQueues {
    resume: VecDeque<QueueItem>,
    retry: VecDeque<QueueItem>,
    main: VecDeque<QueueItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub main: usize,
    pub retry: usize,
    pub resume: usize,
}

/// Per-track priority queues and category routing. Pop order is resume,
/// then retry, then main, FIFO within each.
pub struct QueueManager {
    tracks: Vec<TrackDef>,
    queues: Mutex<HashMap<String, TrackQueues>>,
}

impl QueueManager {
    pub fn new(tracks: Vec<TrackDef>) -> Self {
        let queues = tracks
            .iter()
            .map(|t| (t.name.clone(), TrackQueues::default()))
            .collect();
        Self {
            tracks,
            queues: Mutex::new(queues),
        }
    }

    /// Route a feature to its track: first track listing the feature's
    /// category, else the default track, else the first track.
    pub fn track_for(&self, feature: &Feature) -> Option<&str> {
        self.tracks
            .iter()
            .find(|t| t.categories.contains(&feature.category))
            .or_else(|| self.tracks.iter().find(|t| t.is_default))
            .or_else(|| self.tracks.first())
            .map(|t| t.name.as_str())
    }

    /// Clear everything and seed the main queues with all open features in
    /// ascending id order.
    pub fn initialize_queues(&self, features: &[Feature]) {
        let mut queues = self.lock();
        for track_queues in queues.values_mut() {
            track_queues.resume.clear();
            track_queues.retry.clear();
            track_queues.main.clear();
        }

        let mut open: Vec<&Feature> = features
            .iter()
            .filter(|f| f.status == FeatureStatus::Open)
            .collect();
        open.sort_by_key(|f| f.id);

        for feature in open {
            let Some(track) = self.track_for(feature).map(str::to_string) else {
                continue;
            };
            if let Some(track_queues) = queues.get_mut(&track) {
                track_queues.main.push_back(QueueItem::fresh(feature.id));
            }
        }
    }

    pub fn dequeue(&self, track: &str) -> Option<QueueItem> {
        let mut queues = self.lock();
        let track_queues = queues.get_mut(track)?;
        track_queues
            .resume
            .pop_front()
            .or_else(|| track_queues.retry.pop_front())
            .or_else(|| track_queues.main.pop_front())
    }

    pub fn enqueue_retry(
        &self,
        feature_id: u64,
        track: &str,
        extra_context: &str,
        previous_session_id: Option<String>,
    ) {
        let mut queues = self.lock();
        if let Some(track_queues) = queues.get_mut(track) {
            track_queues.retry.push_back(QueueItem {
                feature_id,
                is_retry: true,
                is_resume: false,
                extra_context: extra_context.into(),
                previous_session_id,
            });
        }
    }

    pub fn enqueue_resume(
        &self,
        feature_id: u64,
        track: &str,
        extra_context: &str,
        previous_session_id: Option<String>,
    ) {
        let mut queues = self.lock();
        if let Some(track_queues) = queues.get_mut(track) {
            track_queues.resume.push_back(QueueItem {
                feature_id,
                is_retry: false,
                is_resume: true,
                extra_context: extra_context.into(),
                previous_session_id,
            });
        }
    }

    pub fn queue_status(&self, track: &str) -> QueueStatus {
        let queues = self.lock();
        match queues.get(track) {
            Some(q) => QueueStatus {
                main: q.main.len(),
                retry: q.retry.len(),
                resume: q.resume.len(),
            },
            None => QueueStatus {
                main: 0,
                retry: 0,
                resume: 0,
            },
        }
    }

    /// Total queued work across all of a track's queues.
    pub fn queued_count(&self, track: &str) -> usize {
        let status = self.queue_status(track);
        status.main + status.retry + status.resume
    }

    pub fn track_names(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.name.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TrackQueues>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}
