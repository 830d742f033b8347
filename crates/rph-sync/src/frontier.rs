//! Work frontier: which items remain, and per-resource pagination progress.

use std::collections::{BTreeMap, HashSet, VecDeque};

use rph_core::{ProgressState, ResourcePhase, WorkItem};
use rph_storage::ProgressStore;
use tracing::{debug, info, warn};

use crate::config::ResourceSeed;

#[derive(Debug, Clone)]
struct ResourceCursor {
    source_id: String,
    seed: ResourceSeed,
    stopped: bool,
}

/// Single-owner state machine; callers serialize access.
///
/// Page `n + 1` of a resource is only queued once page `n` has been recorded
/// through [`Frontier::page_sunk`], so pages are requested in order.
#[derive(Debug)]
pub struct Frontier {
    queue: VecDeque<WorkItem>,
    issued: HashSet<String>,
    resources: BTreeMap<String, ResourceCursor>,
    progress: ProgressStore,
}

impl Frontier {
    pub fn new(progress: ProgressStore) -> Self {
        Self {
            queue: VecDeque::new(),
            issued: HashSet::new(),
            resources: BTreeMap::new(),
            progress,
        }
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Register a paginated resource and queue its first outstanding page.
    /// Returns the page queued, if any.
    pub fn add_resource(&mut self, source_id: &str, seed: ResourceSeed) -> Option<u32> {
        let key = seed.resource_key.clone();
        let state = self
            .progress
            .get(&key)
            .cloned()
            .unwrap_or_else(|| ProgressState::new(key.clone()));

        let first_page = match (state.phase(), state.total_pages) {
            (ResourcePhase::Completed, _) => {
                debug!(resource_key = %key, "resource already completed");
                None
            }
            (ResourcePhase::NotStarted, _) => Some(1),
            (ResourcePhase::InProgress { page }, Some(total)) => next_page(page, total),
            // Total unknown: page 1 is needed again to discover it.
            (ResourcePhase::InProgress { .. }, None) => Some(1),
        };

        self.resources.insert(
            key.clone(),
            ResourceCursor {
                source_id: source_id.to_string(),
                seed,
                stopped: first_page.is_none(),
            },
        );

        if let Some(page) = first_page {
            info!(
                resource_key = %key,
                page,
                last_completed = state.last_completed_page,
                "queueing resource"
            );
            self.enqueue_page(&key, page);
        }
        first_page
    }

    /// Queue flat items. Items already issued this run are ignored.
    pub fn add_items(&mut self, items: impl IntoIterator<Item = WorkItem>) -> usize {
        let mut added = 0;
        for item in items {
            if self.issue(item) {
                added += 1;
            }
        }
        added
    }

    pub fn next_item(&mut self) -> Option<WorkItem> {
        self.queue.pop_front()
    }

    /// Record that `item`'s page is durably sunk and queue the following page.
    /// Returns the updated progress for the caller to persist.
    pub fn page_sunk(
        &mut self,
        item: &WorkItem,
        total_pages: Option<u32>,
    ) -> Option<ProgressState> {
        let page = item.page_index?;
        let key = item.resource_key.as_str();
        let mut state = self
            .progress
            .get(key)
            .cloned()
            .unwrap_or_else(|| ProgressState::new(key));

        let reported_total = if page == 1 {
            Some(total_pages.unwrap_or(1))
        } else {
            total_pages
        };
        // Progress saved without a total resumes at page 1 to learn it; the
        // refetch must not rewind `last_completed_page`.
        let learned = match reported_total {
            Some(total) if page < state.last_completed_page && state.total_pages.is_none() => {
                state.learn_total(total);
                true
            }
            _ => state.advance(page, reported_total),
        };
        if !learned || !self.progress.update(state.clone()) {
            warn!(resource_key = %key, page, "stale page result ignored");
            return None;
        }

        if state.is_completed {
            info!(resource_key = %key, pages = state.last_completed_page, "resource completed");
        } else if let Some(next) = state
            .total_pages
            .and_then(|t| next_page(state.last_completed_page, t))
        {
            let stopped = self.resources.get(key).is_some_and(|c| c.stopped);
            if !stopped {
                self.enqueue_page(key, next);
            }
        }
        Some(state)
    }

    /// A page could not be fetched. The resource stops for this run and keeps
    /// its persisted progress, so the next run resumes at the same page.
    pub fn page_failed(&mut self, item: &WorkItem) {
        if let Some(cursor) = self.resources.get_mut(&item.resource_key) {
            cursor.stopped = true;
        }
        warn!(
            resource_key = %item.resource_key,
            page = item.page_index.unwrap_or(0),
            "page failed, stopping resource for this run"
        );
    }

    fn enqueue_page(&mut self, resource_key: &str, page: u32) {
        let Some(cursor) = self.resources.get(resource_key) else {
            return;
        };
        let item = cursor.seed.page_item(&cursor.source_id, page);
        self.issue(item);
    }

    fn issue(&mut self, item: WorkItem) -> bool {
        if !self.issued.insert(item.dedup_key()) {
            return false;
        }
        self.queue.push_back(item);
        true
    }
}

fn next_page(last_completed: u32, total: u32) -> Option<u32> {
    let next = (last_completed + 1).max(2);
    (next <= total).then_some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed() -> ResourceSeed {
        ResourceSeed {
            resource_key: "site-a-bangalore".into(),
            url_template: "https://site-a.example/bangalore/projects?page={page}".into(),
            form: None,
        }
    }

    async fn empty_frontier(dir: &std::path::Path) -> Frontier {
        Frontier::new(ProgressStore::load(dir.join("progress.json")).await.expect("progress"))
    }

    #[tokio::test]
    async fn pages_are_issued_one_after_another() {
        let dir = tempdir().expect("tempdir");
        let mut frontier = empty_frontier(dir.path()).await;

        assert_eq!(frontier.add_resource("site-a", seed()), Some(1));
        let first = frontier.next_item().expect("page 1");
        assert_eq!(first.page_index, Some(1));
        assert!(frontier.next_item().is_none());

        let state = frontier.page_sunk(&first, Some(3)).expect("progress");
        assert_eq!(state.last_completed_page, 1);
        assert_eq!(state.total_pages, Some(3));

        let second = frontier.next_item().expect("page 2");
        assert_eq!(second.url, "https://site-a.example/bangalore/projects?page=2");
        frontier.page_sunk(&second, None);
        let third = frontier.next_item().expect("page 3");
        let state = frontier.page_sunk(&third, None).expect("progress");
        assert!(state.is_completed);
        assert!(frontier.next_item().is_none());
    }

    #[tokio::test]
    async fn missing_total_means_one_page() {
        let dir = tempdir().expect("tempdir");
        let mut frontier = empty_frontier(dir.path()).await;
        frontier.add_resource("site-a", seed());
        let first = frontier.next_item().expect("page 1");
        let state = frontier.page_sunk(&first, None).expect("progress");
        assert!(state.is_completed);
        assert!(frontier.next_item().is_none());
    }

    #[tokio::test]
    async fn resume_skips_to_first_incomplete_page() {
        let dir = tempdir().expect("tempdir");
        let mut progress = ProgressStore::load(dir.path().join("progress.json"))
            .await
            .expect("progress");
        let mut state = ProgressState::new("site-a-bangalore");
        state.advance(1, Some(5));
        state.advance(2, None);
        progress.update(state);

        let mut frontier = Frontier::new(progress);
        assert_eq!(frontier.add_resource("site-a", seed()), Some(3));

        let mut done = ProgressState::new("site-a-bangalore");
        done.advance(5, Some(5));
        let mut progress = ProgressStore::load(dir.path().join("other.json"))
            .await
            .expect("progress");
        progress.update(done);
        let mut frontier = Frontier::new(progress);
        assert_eq!(frontier.add_resource("site-a", seed()), None);
        assert!(frontier.next_item().is_none());
    }

    #[tokio::test]
    async fn progress_without_total_learns_it_from_page_one() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("progress.json");
        std::fs::write(
            &path,
            r#"{"site-a-bangalore": {"lastCompletedPage": 2, "isCompleted": false}}"#,
        )
        .expect("write progress");
        let progress = ProgressStore::load(&path).await.expect("progress");
        let mut frontier = Frontier::new(progress);

        assert_eq!(frontier.add_resource("site-a", seed()), Some(1));
        let first = frontier.next_item().expect("page 1");
        let state = frontier.page_sunk(&first, Some(4)).expect("progress");
        assert_eq!(state.last_completed_page, 2);
        assert_eq!(state.total_pages, Some(4));
        assert!(!state.is_completed);

        let next = frontier.next_item().expect("page 3");
        assert_eq!(next.page_index, Some(3));
        assert!(frontier.next_item().is_none());

        frontier.progress().save().await.expect("save");
        let reloaded = ProgressStore::load(&path).await.expect("reload");
        let mut frontier = Frontier::new(reloaded);
        assert_eq!(frontier.add_resource("site-a", seed()), Some(3));
    }

    #[tokio::test]
    async fn failed_page_stops_resource() {
        let dir = tempdir().expect("tempdir");
        let mut frontier = empty_frontier(dir.path()).await;
        frontier.add_resource("site-a", seed());
        let first = frontier.next_item().expect("page 1");
        frontier.page_sunk(&first, Some(4));
        let second = frontier.next_item().expect("page 2");

        frontier.page_failed(&second);
        assert!(frontier.next_item().is_none());
        assert_eq!(
            frontier.progress().get("site-a-bangalore").map(|s| s.last_completed_page),
            Some(1)
        );
    }

    #[tokio::test]
    async fn flat_items_are_issued_at_most_once() {
        let dir = tempdir().expect("tempdir");
        let mut frontier = empty_frontier(dir.path()).await;
        let items = vec![
            WorkItem::single("https://site-a.example/p/1", "site-a"),
            WorkItem::single("https://site-a.example/p/2", "site-a"),
            WorkItem::single("https://site-a.example/p/1", "site-a"),
        ];
        assert_eq!(frontier.add_items(items), 2);
        frontier.next_item();
        assert_eq!(
            frontier.add_items(vec![WorkItem::single("https://site-a.example/p/1", "site-a")]),
            0
        );
        assert_eq!(frontier.queued(), 1);
    }
}
