//! Immutable source -> worker routing snapshot.
//!
//! Rebuilt from scratch on every lifecycle change and published through
//! `ArcSwap`, so dispatch reads it without locking.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::pipeline::types::InboundMessage;
use crate::worker::stats::TaskStatistics;

/// Everything dispatch needs to hand an event to one worker.
#[derive(Debug)]
pub struct Route {
    pub task_id: i64,
    pub tx: mpsc::Sender<InboundMessage>,
    pub stats: Arc<TaskStatistics>,
    pub sources: Vec<i64>,
}

#[derive(Debug, Default)]
pub struct RoutingIndex {
    by_source: HashMap<i64, Vec<Arc<Route>>>,
    tasks: HashMap<i64, Arc<Route>>,
}

impl RoutingIndex {
    pub fn build(routes: impl IntoIterator<Item = Arc<Route>>) -> Self {
        let mut index = Self::default();
        for route in routes {
            for source in &route.sources {
                let slot = index.by_source.entry(*source).or_default();
                // A task listing a source twice still gets one copy.
                if !slot.iter().any(|r| r.task_id == route.task_id) {
                    slot.push(route.clone());
                }
            }
            index.tasks.insert(route.task_id, route);
        }
        for routes in index.by_source.values_mut() {
            routes.sort_by_key(|r| r.task_id);
        }
        index
    }

    /// Routes subscribed to a source, ordered by task id.
    pub fn routes_for(&self, source_id: i64) -> &[Arc<Route>] {
        self.by_source
            .get(&source_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn route(&self, task_id: i64) -> Option<&Arc<Route>> {
        self.tasks.get(&task_id)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.tasks.values()
    }

    pub fn task_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.tasks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
