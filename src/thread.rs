use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::data::{PostSource, SourceError, ViewHistory};
use crate::mastodon::Status;

/// A post placed in its thread, with the state the reader cares about.
#[derive(Debug, Clone, Serialize)]
pub struct PostNode {
    #[serde(flatten)]
    pub status: Status,
    /// Direct replies, in the order the source returned them.
    pub replies: Vec<PostNode>,
    /// Root-first chain above this post. Only set on the node a tree was
    /// materialized from.
    pub ancestors: Vec<Status>,
    pub viewed: bool,
}

impl PostNode {
    pub fn id(&self) -> &str {
        &self.status.id
    }

    /// Depth-first, pre-order walk over this node and everything below it.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    pub fn post_count(&self) -> usize {
        self.walk().count()
    }

    pub fn unviewed_count(&self) -> usize {
        self.walk().filter(|node| !node.viewed).count()
    }

    #[cfg(test)]
    pub(crate) fn find(&self, id: &str) -> Option<&PostNode> {
        self.walk().find(|node| node.id() == id)
    }
}

pub struct Walk<'a> {
    stack: Vec<&'a PostNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a PostNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.replies.iter().rev());
        Some(node)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaterializeOptions {
    /// Record every post in the tree as seen now. Turn off when the tree is
    /// only built to find out which thread a post belongs to.
    pub mark_viewed: bool,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        Self { mark_viewed: true }
    }
}

/// `viewed` iff the reader saw the post at or after its latest revision.
pub fn is_viewed(status: &Status, last_viewed: Option<DateTime<Utc>>) -> bool {
    last_viewed.is_some_and(|at| at >= status.last_modified())
}

pub struct Reconstructor<'a> {
    source: &'a dyn PostSource,
    history: &'a dyn ViewHistory,
}

impl<'a> Reconstructor<'a> {
    pub fn new(source: &'a dyn PostSource, history: &'a dyn ViewHistory) -> Self {
        Self { source, history }
    }

    /// Finds a post from a link to it, or from a bare id on this instance.
    pub fn fetch_by_url(&self, url: &str) -> Result<Status> {
        let url = url.trim();
        if !url.contains("://") {
            return self.source.fetch_status(url);
        }
        self.source
            .search_status(url)?
            .ok_or_else(|| SourceError::NotFound(url.to_string()).into())
    }

    pub fn resolve_root(&self, status: &Status) -> Result<Status> {
        if status.in_reply_to_id.is_none() {
            return Ok(status.clone());
        }

        let context = self
            .source
            .fetch_context(&status.id)
            .with_context(|| format!("resolve root of {}", status.id))?;
        match context.ancestors.into_iter().next() {
            Some(root) => Ok(root),
            None => {
                debug!(id = %status.id, "no ancestors returned, treating post as root");
                Ok(status.clone())
            }
        }
    }

    pub fn materialize(&self, root: Status, options: MaterializeOptions) -> Result<PostNode> {
        let instance = self.source.instance();
        let root_id = root.id.clone();
        let fetch_context = root.replies_count > 0;

        let mut index = PostIndex::default();
        index.insert(root);

        let mut ancestors = Vec::new();
        if fetch_context {
            let context = self
                .source
                .fetch_context(&root_id)
                .with_context(|| format!("materialize thread {root_id}"))?;
            ancestors = context.ancestors;
            for status in context.descendants {
                if !index.insert(status) {
                    debug!(thread = %root_id, "duplicate descendant ignored");
                }
            }
        }

        // Link. The root is never attached, so every other post has exactly
        // one parent and nothing reachable from the root can loop.
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); index.posts.len()];
        let mut dropped = 0usize;
        for (idx, status) in index.posts.iter().enumerate().skip(1) {
            let Some(parent_id) = status.in_reply_to_id.as_deref() else {
                continue;
            };
            match index.position(parent_id) {
                Some(parent) => children[parent].push(idx),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            debug!(thread = %root_id, dropped, "descendants with unknown parents left out");
        }

        let mut viewed = Vec::with_capacity(index.posts.len());
        for status in &index.posts {
            let last_viewed = self.history.get(instance, &status.id)?;
            viewed.push(is_viewed(status, last_viewed));
        }

        let mut order = Vec::with_capacity(index.posts.len());
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            stack.extend(children[idx].iter().rev());
        }

        if options.mark_viewed {
            let now = Utc::now();
            let views: HashMap<String, DateTime<Utc>> = order
                .iter()
                .map(|&idx| (index.posts[idx].id.clone(), now))
                .collect();
            self.history
                .put_batch(instance, &views)
                .with_context(|| format!("record views of thread {root_id}"))?;
        }

        // Children always come after their parent in `order`, so building in
        // reverse finishes every subtree before the node that owns it.
        let mut slots: Vec<Option<Status>> = index.posts.into_iter().map(Some).collect();
        let mut built: Vec<Option<PostNode>> = vec![None; slots.len()];
        for &idx in order.iter().rev() {
            let replies = children[idx]
                .iter()
                .filter_map(|&child| built[child].take())
                .collect();
            if let Some(status) = slots[idx].take() {
                built[idx] = Some(PostNode {
                    status,
                    replies,
                    ancestors: Vec::new(),
                    viewed: viewed[idx],
                });
            }
        }

        let mut tree = built[0]
            .take()
            .with_context(|| format!("thread {root_id} lost its root"))?;
        tree.ancestors = ancestors;
        debug!(thread = %root_id, posts = order.len(), "materialized thread");
        Ok(tree)
    }

    /// Opens the thread a link points into: finds the post, climbs to its root
    /// and builds the tree, recording it as seen.
    pub fn fetch_thread(&self, url: &str, options: MaterializeOptions) -> Result<PostNode> {
        let status = self.fetch_by_url(url)?;
        let root = self.resolve_root(&status)?;
        self.materialize(root, options)
    }
}

/// Posts keyed by id, remembering the order they were first seen in.
#[derive(Default)]
struct PostIndex {
    posts: Vec<Status>,
    positions: HashMap<String, usize>,
}

impl PostIndex {
    fn insert(&mut self, status: Status) -> bool {
        if self.positions.contains_key(&status.id) {
            return false;
        }
        self.positions.insert(status.id.clone(), self.posts.len());
        self.posts.push(status);
        true
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::MemoryViewHistory;
    use crate::mastodon::StatusContext;
    use anyhow::bail;
    use chrono::{Duration, TimeZone};
    use parking_lot::Mutex;

    pub(crate) fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap()
    }

    pub(crate) fn post(id: &str, parent: Option<&str>) -> Status {
        Status {
            id: id.into(),
            in_reply_to_id: parent.map(String::from),
            replies_count: 0,
            created_at: at(0),
            edited_at: None,
            reblog: None,
            url: None,
            content: String::new(),
            spoiler_text: String::new(),
            visibility: Default::default(),
            account: Default::default(),
            favourites_count: 0,
            reblogs_count: 0,
        }
    }

    /// Serves fixed contexts and counts how often each one is asked for.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub contexts: HashMap<String, StatusContext>,
        pub statuses: HashMap<String, Status>,
        pub context_calls: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub fn with_context(mut self, id: &str, ancestors: Vec<Status>, descendants: Vec<Status>) -> Self {
            self.contexts.insert(
                id.to_string(),
                StatusContext {
                    ancestors,
                    descendants,
                },
            );
            self
        }

        pub fn calls_for(&self, id: &str) -> usize {
            self.context_calls.lock().iter().filter(|c| c.as_str() == id).count()
        }
    }

    impl PostSource for FakeSource {
        fn instance(&self) -> &str {
            "social.example"
        }

        fn fetch_status(&self, id: &str) -> Result<Status> {
            match self.statuses.get(id) {
                Some(status) => Ok(status.clone()),
                None => Err(SourceError::NotFound(id.to_string()).into()),
            }
        }

        fn fetch_context(&self, id: &str) -> Result<StatusContext> {
            self.context_calls.lock().push(id.to_string());
            match self.contexts.get(id) {
                Some(context) => Ok(context.clone()),
                None => Err(SourceError::NotFound(id.to_string()).into()),
            }
        }

        fn fetch_page(&self, _: &str, _: Option<&str>, _: u32) -> Result<Vec<Status>> {
            bail!("no timeline here")
        }

        fn search_status(&self, query: &str) -> Result<Option<Status>> {
            Ok(self.statuses.values().find(|s| s.url.as_deref() == Some(query)).cloned())
        }
    }

    fn with_replies(mut status: Status, count: u64) -> Status {
        status.replies_count = count;
        status
    }

    fn reply_ids(node: &PostNode) -> Vec<&str> {
        node.replies.iter().map(|r| r.id()).collect()
    }

    #[test]
    fn root_post_resolves_without_fetching() {
        let source = FakeSource::default();
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let root = rec.resolve_root(&post("1", None)).unwrap();
        assert_eq!(root.id, "1");
        assert!(source.context_calls.lock().is_empty());
    }

    #[test]
    fn reply_resolves_to_first_ancestor() {
        let source = FakeSource::default().with_context(
            "3",
            vec![post("1", None), post("2", Some("1"))],
            vec![],
        );
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let root = rec.resolve_root(&post("3", Some("2"))).unwrap();
        assert_eq!(root.id, "1");
    }

    #[test]
    fn reply_without_ancestors_is_its_own_root() {
        let source = FakeSource::default().with_context("3", vec![], vec![]);
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let root = rec.resolve_root(&post("3", Some("gone"))).unwrap();
        assert_eq!(root.id, "3");
    }

    #[test]
    fn unknown_post_is_not_found() {
        let source = FakeSource::default();
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let err = rec.resolve_root(&post("9", Some("8"))).unwrap_err();
        assert!(crate::data::is_not_found(&err));
        let err = rec.fetch_by_url("https://elsewhere.example/@a/1").unwrap_err();
        assert!(crate::data::is_not_found(&err));
    }

    #[test]
    fn fetch_by_url_uses_search_for_links_and_lookup_for_ids() {
        let mut linked = post("5", None);
        linked.url = Some("https://elsewhere.example/@a/77".into());
        let mut source = FakeSource::default();
        source.statuses.insert("5".into(), linked);
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        assert_eq!(rec.fetch_by_url("https://elsewhere.example/@a/77").unwrap().id, "5");
        assert_eq!(rec.fetch_by_url(" 5 ").unwrap().id, "5");
    }

    #[test]
    fn links_in_any_order() {
        let orders = [
            vec![post("1", Some("0")), post("2", Some("1"))],
            vec![post("2", Some("1")), post("1", Some("0"))],
        ];
        for descendants in orders {
            let source = FakeSource::default().with_context("0", vec![], descendants);
            let history = MemoryViewHistory::new();
            let rec = Reconstructor::new(&source, &history);

            let tree = rec
                .materialize(with_replies(post("0", None), 1), MaterializeOptions::default())
                .unwrap();
            assert_eq!(reply_ids(&tree), vec!["1"]);
            assert_eq!(reply_ids(&tree.replies[0]), vec!["2"]);
            assert!(tree.replies[0].replies[0].replies.is_empty());
        }
    }

    #[test]
    fn replies_keep_discovery_order() {
        let source = FakeSource::default().with_context(
            "0",
            vec![],
            vec![post("b", Some("0")), post("a", Some("0")), post("c", Some("0"))],
        );
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let tree = rec
            .materialize(with_replies(post("0", None), 3), MaterializeOptions::default())
            .unwrap();
        assert_eq!(reply_ids(&tree), vec!["b", "a", "c"]);
        let walked: Vec<&str> = tree.walk().map(|n| n.id()).collect();
        assert_eq!(walked, vec!["0", "b", "a", "c"]);
    }

    #[test]
    fn dangling_descendants_are_dropped() {
        let source = FakeSource::default().with_context(
            "0",
            vec![],
            vec![post("1", Some("0")), post("x", Some("missing")), post("y", Some("x"))],
        );
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let tree = rec
            .materialize(with_replies(post("0", None), 2), MaterializeOptions::default())
            .unwrap();
        assert_eq!(tree.post_count(), 2);
        assert!(tree.find("x").is_none());
        assert!(tree.find("y").is_none());
        assert_eq!(history.len("social.example"), 2);
    }

    #[test]
    fn self_reference_and_loops_stay_out_of_the_tree() {
        let source = FakeSource::default().with_context(
            "0",
            vec![],
            vec![
                post("1", Some("0")),
                post("s", Some("s")),
                post("p", Some("q")),
                post("q", Some("p")),
                post("0", Some("1")),
            ],
        );
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let tree = rec
            .materialize(with_replies(post("0", None), 1), MaterializeOptions::default())
            .unwrap();
        let walked: Vec<&str> = tree.walk().map(|n| n.id()).collect();
        assert_eq!(walked, vec!["0", "1"]);
    }

    #[test]
    fn zero_replies_skips_context() {
        let source = FakeSource::default();
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let tree = rec
            .materialize(post("0", None), MaterializeOptions::default())
            .unwrap();
        assert!(tree.replies.is_empty());
        assert!(tree.ancestors.is_empty());
        assert_eq!(source.calls_for("0"), 0);
    }

    #[test]
    fn ancestors_come_from_context() {
        let source = FakeSource::default().with_context(
            "2",
            vec![post("0", None), post("1", Some("0"))],
            vec![post("3", Some("2"))],
        );
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let tree = rec
            .materialize(with_replies(post("2", Some("1")), 1), MaterializeOptions::default())
            .unwrap();
        let ancestors: Vec<&str> = tree.ancestors.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ancestors, vec!["0", "1"]);
        assert_eq!(reply_ids(&tree), vec!["3"]);
    }

    #[test]
    fn context_failure_propagates() {
        let source = FakeSource::default();
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let err = rec
            .materialize(with_replies(post("0", None), 4), MaterializeOptions::default())
            .unwrap_err();
        assert!(crate::data::is_not_found(&err));
        assert!(history.is_empty());
    }

    #[test]
    fn viewed_tracks_edits() {
        let mut edited = post("1", Some("0"));
        edited.edited_at = Some(at(30));
        let source = FakeSource::default().with_context(
            "0",
            vec![],
            vec![edited, post("2", Some("0"))],
        );
        let history = MemoryViewHistory::new();
        let mut seen = HashMap::new();
        seen.insert("0".to_string(), at(0));
        seen.insert("1".to_string(), at(10));
        history.put_batch("social.example", &seen).unwrap();
        let rec = Reconstructor::new(&source, &history);

        let tree = rec
            .materialize(with_replies(post("0", None), 2), MaterializeOptions::default())
            .unwrap();
        assert!(tree.viewed, "seen exactly at creation counts");
        assert!(!tree.find("1").unwrap().viewed, "edited after last view");
        assert!(!tree.find("2").unwrap().viewed, "never seen");
        assert_eq!(tree.unviewed_count(), 2);

        let again = rec
            .materialize(with_replies(post("0", None), 2), MaterializeOptions::default())
            .unwrap();
        assert_eq!(again.unviewed_count(), 0);
    }

    #[test]
    fn is_viewed_compares_latest_revision() {
        let mut status = post("1", None);
        assert!(!is_viewed(&status, None));
        assert!(is_viewed(&status, Some(at(0))));
        assert!(!is_viewed(&status, Some(at(0) - Duration::seconds(1))));
        status.edited_at = Some(at(5));
        assert!(!is_viewed(&status, Some(at(1))));
        assert!(is_viewed(&status, Some(at(5))));
    }

    #[test]
    fn mark_viewed_false_leaves_history_alone() {
        let source = FakeSource::default().with_context("0", vec![], vec![post("1", Some("0"))]);
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let tree = rec
            .materialize(
                with_replies(post("0", None), 1),
                MaterializeOptions { mark_viewed: false },
            )
            .unwrap();
        assert_eq!(tree.post_count(), 2);
        assert!(history.is_empty());
    }

    #[test]
    fn mark_viewed_records_every_post_in_tree() {
        let source = FakeSource::default().with_context(
            "0",
            vec![],
            vec![post("1", Some("0")), post("2", Some("1"))],
        );
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let before = Utc::now();
        rec.materialize(with_replies(post("0", None), 1), MaterializeOptions::default())
            .unwrap();
        assert_eq!(history.len("social.example"), 3);
        for id in ["0", "1", "2"] {
            let stamp = history.get("social.example", id).unwrap().unwrap();
            assert!(stamp >= before);
        }
    }

    #[test]
    fn fetch_thread_climbs_to_root() {
        let mut leaf = post("2", Some("1"));
        leaf.url = Some("https://social.example/@a/2".into());
        let mut source = FakeSource::default()
            .with_context("2", vec![post("0", None), post("1", Some("0"))], vec![])
            .with_context("0", vec![], vec![post("1", Some("0")), leaf.clone()]);
        source.statuses.insert("2".into(), leaf);
        source.contexts.get_mut("2").unwrap().ancestors[0].replies_count = 1;
        let history = MemoryViewHistory::new();
        let rec = Reconstructor::new(&source, &history);

        let tree = rec
            .fetch_thread("https://social.example/@a/2", MaterializeOptions::default())
            .unwrap();
        assert_eq!(tree.id(), "0");
        assert_eq!(tree.post_count(), 3);
    }
}
