//! Ordered queue directory.
//!
//! Queues are kept in descending layer order. Enumeration that must drop the
//! directory lock between steps parks a bookmark node in the list; other
//! nodes may be inserted or removed around it without disturbing the walk.

use std::sync::Arc;

use crate::queue::{IoQueue, QueueId};

/// Handle of a bookmark parked in a [`QueueList`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bookmark(u64);

#[derive(Debug)]
enum QueueNode {
    Queue(Arc<IoQueue>),
    Bookmark(Bookmark),
}

impl QueueNode {
    fn queue(&self) -> Option<&Arc<IoQueue>> {
        match self {
            QueueNode::Queue(queue) => Some(queue),
            QueueNode::Bookmark(_) => None,
        }
    }
}

/// Directory list; callers hold the directory lock around every call
#[derive(Debug, Default)]
pub struct QueueList {
    nodes: Vec<QueueNode>,
    next_bookmark: u64,
}

impl QueueList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered queues (bookmarks excluded)
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|node| node.queue().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: QueueId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: QueueId) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.queue().map_or(false, |queue| queue.id() == id))
    }

    fn bookmark_position(&self, bookmark: Bookmark) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| matches!(node, QueueNode::Bookmark(b) if *b == bookmark))
    }

    /// Insert by layer, scanning from the tail
    ///
    /// The queue lands after the last queue whose layer is at least its own,
    /// or at the head when every queue has a lower layer.
    pub fn insert_ordered(&mut self, queue: Arc<IoQueue>) {
        let layer = queue.layer();
        let at = self
            .nodes
            .iter()
            .rposition(|node| node.queue().map_or(false, |q| q.layer() >= layer))
            .map_or(0, |pos| pos + 1);

        self.nodes.insert(at, QueueNode::Queue(queue));
    }

    /// Unlink a queue
    pub fn remove(&mut self, id: QueueId) -> Option<Arc<IoQueue>> {
        let pos = self.position(id)?;
        match self.nodes.remove(pos) {
            QueueNode::Queue(queue) => Some(queue),
            QueueNode::Bookmark(_) => None,
        }
    }

    /// Park a new bookmark at the head and advance it to the first queue
    pub fn first_queue(&mut self) -> (Bookmark, Option<Arc<IoQueue>>) {
        let bookmark = Bookmark(self.next_bookmark);
        self.next_bookmark = self.next_bookmark.wrapping_add(1);
        self.nodes.insert(0, QueueNode::Bookmark(bookmark));

        let queue = self.next_queue(bookmark);
        (bookmark, queue)
    }

    /// Move the bookmark past the next queue and return that queue
    ///
    /// The bookmark leaves the list once the walk reaches the tail.
    pub fn next_queue(&mut self, bookmark: Bookmark) -> Option<Arc<IoQueue>> {
        let start = self.bookmark_position(bookmark)?;
        self.nodes.remove(start);

        let offset = self.nodes[start..]
            .iter()
            .position(|node| node.queue().is_some())?;
        let pos = start + offset;
        let queue = self.nodes[pos].queue().cloned();
        self.nodes.insert(pos + 1, QueueNode::Bookmark(bookmark));
        queue
    }

    /// Drop a bookmark from an abandoned walk
    pub fn remove_bookmark(&mut self, bookmark: Bookmark) {
        if let Some(pos) = self.bookmark_position(bookmark) {
            self.nodes.remove(pos);
        }
    }

    /// Bookmarks currently parked
    pub fn bookmarks(&self) -> usize {
        self.nodes.len() - self.len()
    }

    /// Queues in directory order
    pub fn snapshot(&self) -> Vec<Arc<IoQueue>> {
        self.nodes.iter().filter_map(QueueNode::queue).cloned().collect()
    }
}
