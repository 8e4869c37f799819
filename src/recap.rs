use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::mastodon::Status;
use crate::thread::{MaterializeOptions, PostNode, Reconstructor};

/// How a timeline item relates to the thread it landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionKind {
    /// The thread's root post itself.
    Root,
    /// A post somewhere below the root.
    Reply,
    /// A reblog of the root.
    Reblog,
    /// A reblog of a post below the root.
    ReplyReblog,
}

impl InteractionKind {
    pub fn classify(item: &Status, root_id: &str) -> Self {
        let is_root = item.subject().id == root_id;
        match (item.is_reblog(), is_root) {
            (true, true) => InteractionKind::Reblog,
            (true, false) => InteractionKind::ReplyReblog,
            (false, true) => InteractionKind::Root,
            (false, false) => InteractionKind::Reply,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Root => "root",
            InteractionKind::Reply => "reply",
            InteractionKind::Reblog => "reblog",
            InteractionKind::ReplyReblog => "replyReblog",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Interaction {
    pub kind: InteractionKind,
    /// The timeline item as it was scanned, reblog wrapper included.
    pub status: Status,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadRecap {
    pub thread: PostNode,
    pub interactions: Vec<Interaction>,
}

impl ThreadRecap {
    pub fn root_id(&self) -> &str {
        self.thread.id()
    }

    pub fn kinds(&self) -> Vec<InteractionKind> {
        self.interactions.iter().map(|i| i.kind).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Recap {
    /// Threads in the order the timeline first touched them.
    pub threads: Vec<ThreadRecap>,
    /// Every scanned item, unfiltered and in scan order.
    pub timeline: Vec<Status>,
}

impl Recap {
    #[cfg(test)]
    pub(crate) fn thread(&self, root_id: &str) -> Option<&ThreadRecap> {
        self.threads.iter().find(|t| t.root_id() == root_id)
    }
}

/// Groups timeline items by the thread they belong to.
///
/// Each thread is fetched once: after a tree is built, every post in it is
/// remembered, so later items from the same thread are classified without
/// going back to the source. Trees are built without touching the view
/// history. The first error aborts the whole scan.
pub fn recap<I>(reconstructor: &Reconstructor<'_>, timeline: I) -> Result<Recap>
where
    I: IntoIterator<Item = Result<Status>>,
{
    let mut recap = Recap::default();
    // root id -> position in `recap.threads`
    let mut slots: HashMap<String, usize> = HashMap::new();
    // any post id seen in a built tree -> root id
    let mut owners: HashMap<String, String> = HashMap::new();

    for item in timeline {
        let item = item?;
        let subject_id = item.subject().id.clone();

        let known = owners
            .get(&subject_id)
            .and_then(|root_id| slots.get(root_id).copied());
        let slot = match known {
            Some(slot) => slot,
            None => {
                let root = reconstructor.resolve_root(item.subject())?;
                let slot = match slots.get(&root.id) {
                    // Resolved into a thread already built, but the post was
                    // not part of that tree.
                    Some(&slot) => slot,
                    None => {
                        let thread = reconstructor
                            .materialize(root, MaterializeOptions { mark_viewed: false })?;
                        let root_id = thread.id().to_string();
                        for node in thread.walk() {
                            owners.insert(node.id().to_string(), root_id.clone());
                        }
                        debug!(thread = %root_id, posts = thread.post_count(), "new thread in recap");
                        slots.insert(root_id, recap.threads.len());
                        recap.threads.push(ThreadRecap {
                            thread,
                            interactions: Vec::new(),
                        });
                        recap.threads.len() - 1
                    }
                };
                owners.insert(subject_id, recap.threads[slot].root_id().to_string());
                slot
            }
        };

        let entry = &mut recap.threads[slot];
        let kind = InteractionKind::classify(&item, entry.thread.id());
        entry.interactions.push(Interaction {
            kind,
            status: item.clone(),
        });
        recap.timeline.push(item);
    }

    info!(
        items = recap.timeline.len(),
        threads = recap.threads.len(),
        "timeline recap finished"
    );
    Ok(recap)
}
