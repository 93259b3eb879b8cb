//! Generic depth-first tree flattening with cycle detection.
//!
//! [`TreeSearch`] walks a root node and its transitive neighbors (children
//! ahead of remaining siblings) into a linear sequence. With `dedupe`
//! enabled, a recurring node is removed from its earlier position and
//! re-appended, so every node lands after all paths through it. Reversing the
//! deduplicated sequence then gives an order where a node's neighbors always
//! precede it, which is how the executor turns a dependency walk into an
//! execution plan.
//!
//! Cycle detection is path-based: a node already on the current DFS stack is
//! a cycle, reported with the offending edge. Diamonds and convergent paths
//! (the same node reachable through different edges) are not cycles and
//! resolve cleanly.
//!
//! The walk yields to the scheduler once per visited node, so flattening a
//! very large graph never starves other work on the runtime.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use tokio::task::yield_now;

/// Error from a depth-first walk.
#[derive(Debug)]
pub enum SearchError<T, E> {
    /// The walk crossed back into a node on the current path.
    Cycle { from: T, to: T },

    /// The adjacency function failed for some node.
    Adjacency(E),
}

impl<T, E> fmt::Display for SearchError<T, E>
where
    T: fmt::Display,
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::Cycle { from, to } => {
                write!(f, "cyclic dependency detected at {from} -> {to}")
            }
            SearchError::Adjacency(inner) => inner.fmt(f),
        }
    }
}

impl<T, E> std::error::Error for SearchError<T, E>
where
    T: fmt::Debug + fmt::Display,
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SearchError::Cycle { .. } => None,
            SearchError::Adjacency(inner) => Some(inner),
        }
    }
}

/// Tree search instructions: a root, an adjacency function, and the dedupe
/// policy.
///
/// Example (`->` reads "expands to"):
///
/// ```text
///    __a__
///   |     |
///   b   __c__
///      |     |
///      b     d
/// ```
///
/// `depth_first` returns `a, b, c, b, d`, or `a, c, b, d` with dedupe.
pub struct TreeSearch<T, F> {
    root: T,
    adjacent: F,
    dedupe: bool,
}

impl<T, F, E> TreeSearch<T, F>
where
    T: Clone + Eq + Hash,
    F: FnMut(&T) -> Result<Vec<T>, E>,
{
    pub fn new(root: T, adjacent: F) -> Self {
        Self {
            root,
            adjacent,
            dedupe: false,
        }
    }

    /// Enable de-duplication: recurring nodes keep only their latest
    /// occurrence.
    pub fn dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = dedupe;
        self
    }

    /// Flatten the tree depth-first. The root is always first in the result.
    ///
    /// When a deduplicated node recurs, its children are expanded again so
    /// they move later along with it; otherwise a reversed result could list
    /// a node ahead of something it reaches. Worst case this revisits shared
    /// subtrees once per path, which is acceptable for dependency graphs.
    pub async fn depth_first(mut self) -> Result<Vec<T>, SearchError<T, E>> {
        enum Frame<T> {
            Enter { node: T, parent: Option<T> },
            Exit(T),
        }

        let mut stack = vec![Frame::Enter {
            node: self.root.clone(),
            parent: None,
        }];
        let mut on_path: HashSet<T> = HashSet::new();
        let mut acc: Vec<T> = Vec::new();

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Exit(node) => {
                    on_path.remove(&node);
                }
                Frame::Enter { node, parent } => {
                    if on_path.contains(&node) {
                        let from = parent.unwrap_or_else(|| node.clone());
                        return Err(SearchError::Cycle { from, to: node });
                    }

                    let children = (self.adjacent)(&node).map_err(SearchError::Adjacency)?;

                    if self.dedupe
                        && let Some(earlier) = acc.iter().position(|seen| seen == &node)
                    {
                        acc.remove(earlier);
                    }
                    acc.push(node.clone());

                    on_path.insert(node.clone());
                    stack.push(Frame::Exit(node.clone()));
                    // Reverse so the first child is expanded first.
                    for child in children.into_iter().rev() {
                        stack.push(Frame::Enter {
                            node: child,
                            parent: Some(node.clone()),
                        });
                    }

                    yield_now().await;
                }
            }
        }

        Ok(acc)
    }
}
