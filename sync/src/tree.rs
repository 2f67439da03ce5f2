//! Ordered child lists derived from `state_children` and `state_list` pushes.

use crate::client::{BindOptions, SyncClient};
use crate::error::Error;
use crate::manager::Manager;
use events::{Identity, Key, StateNode};
use log::*;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Flat store of state nodes keyed by id. Parent links are plain ids, so the
/// tree is never an object graph.
///
/// A node whose parent is unknown is treated as a root. A node whose parent
/// chain leads back to itself is cut loose and treated as a root as well.
#[derive(Debug, Clone, Default)]
pub struct StateTree {
    nodes: BTreeMap<i64, StateNode>,
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tree from a `state_list` payload.
    pub fn from_payload(payload: &Value) -> Self {
        StateNode::list_from(payload).into_iter().collect()
    }

    pub fn insert(&mut self, node: StateNode) -> Option<StateNode> {
        self.nodes.insert(node.id, node)
    }

    pub fn remove(&mut self, id: i64) -> Option<StateNode> {
        self.nodes.remove(&id)
    }

    pub fn get(&self, id: i64) -> Option<&StateNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The parent a node is attached to once unknown parents and cycles are
    /// accounted for.
    pub fn parent_of(&self, id: i64) -> Option<i64> {
        let parent = self.nodes.get(&id)?.parent_id?;
        if !self.nodes.contains_key(&parent) {
            return None;
        }

        let mut seen = HashSet::new();
        let mut cursor = Some(parent);
        while let Some(current) = cursor {
            if current == id {
                debug!("State {id} is part of a parent cycle, treating it as a root");
                return None;
            }
            if !seen.insert(current) {
                break;
            }
            cursor = self
                .nodes
                .get(&current)
                .and_then(|node| node.parent_id)
                .filter(|next| self.nodes.contains_key(next));
        }
        Some(parent)
    }

    /// Immediate children of `parent`, or the roots for `None`, in id order.
    pub fn children(&self, parent: Option<i64>) -> Vec<&StateNode> {
        self.nodes
            .values()
            .filter(|node| self.parent_of(node.id) == parent)
            .collect()
    }

    /// Slash-separated names from the root down to `id`, e.g. `/ground/kitchen/light`.
    /// Nodes without a name contribute their id.
    pub fn path(&self, id: i64) -> Option<String> {
        let mut segments = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.nodes.get(&current)?;
            segments.push(if node.name.is_empty() {
                node.id.to_string()
            } else {
                node.name.clone()
            });
            cursor = self.parent_of(current);
        }
        segments.reverse();
        Some(format!("/{}", segments.join("/")))
    }
}

impl FromIterator<StateNode> for StateTree {
    fn from_iter<I: IntoIterator<Item = StateNode>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().map(|node| (node.id, node)).collect(),
        }
    }
}

/// Where a projector reads its child list from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// `state_children` for a parent key; the empty key is the root.
    Children(Key),
    /// The full `state_list`, filtered by parent id (`None` for the roots).
    List { parent: Option<i64> },
}

impl Source {
    pub fn identity(&self) -> Identity {
        match self {
            Source::Children(parent) => Identity::state_children(parent.clone()),
            Source::List { .. } => Identity::state_list(),
        }
    }
}

pub type Comparator = Box<dyn Fn(&StateNode, &StateNode) -> Ordering + Send + Sync>;

/// Ascending numeric id.
pub fn by_id() -> Comparator {
    Box::new(|a, b| a.id.cmp(&b.id))
}

/// Name, then id.
pub fn by_name() -> Comparator {
    Box::new(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)))
}

/// Derives the ordered child list for `source` from one payload.
pub fn derive_children(source: &Source, payload: &Value, comparator: &Comparator) -> Vec<StateNode> {
    let mut children = match source {
        Source::Children(_) => StateNode::list_from(payload),
        Source::List { parent } => StateTree::from_payload(payload)
            .children(*parent)
            .into_iter()
            .cloned()
            .collect(),
    };
    children.sort_by(|a, b| comparator(a, b));
    children
}

/// Keeps a `(state, id)` client mounted for every child of one parent.
///
/// The projector owns a single binding on its source. Each payload on that
/// binding re-derives the child list; added children get a nested client,
/// removed children are unbound right away.
pub struct TreeProjector {
    manager: Manager,
    source: Source,
    comparator: Comparator,
    binding: SyncClient,
    children: Vec<StateNode>,
    mounted: BTreeMap<i64, SyncClient>,
}

impl TreeProjector {
    pub async fn mount(
        manager: Manager,
        source: Source,
        comparator: Comparator,
    ) -> Result<TreeProjector, Error> {
        let binding = manager
            .bind(source.identity(), BindOptions::default())
            .await?;
        let mut projector = TreeProjector {
            manager,
            source,
            comparator,
            binding,
            children: Vec::new(),
            mounted: BTreeMap::new(),
        };

        if let Some(payload) = projector.binding.value().cloned() {
            projector.reconcile(&payload).await?;
        }
        Ok(projector)
    }

    /// Waits for the next payload on the source and returns the new child list.
    pub async fn next(&mut self) -> Result<&[StateNode], Error> {
        let payload = self.binding.changed().await?.clone();
        self.reconcile(&payload).await?;
        Ok(&self.children)
    }

    /// Binds every new child before touching any state, so a failed bind
    /// leaves the previous children and mounts in place.
    async fn reconcile(&mut self, payload: &Value) -> Result<(), Error> {
        let children = derive_children(&self.source, payload, &self.comparator);
        let wanted: BTreeSet<i64> = children.iter().map(|node| node.id).collect();

        let mut fresh = Vec::new();
        for &id in &wanted {
            if self.mounted.contains_key(&id) {
                continue;
            }
            let client = self
                .manager
                .bind(Identity::state(id), BindOptions::default())
                .await?;
            fresh.push((id, client));
        }

        let before = self.mounted.len();
        self.mounted.retain(|id, _| wanted.contains(id));
        let removed = before - self.mounted.len();
        let added = fresh.len();
        self.mounted.extend(fresh);
        self.children = children;

        if added > 0 || removed > 0 {
            debug!(
                "{}: mounted {added}, unmounted {removed}, {} children",
                self.binding.identity(),
                self.children.len()
            );
        }
        Ok(())
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Children in comparator order.
    pub fn children(&self) -> &[StateNode] {
        &self.children
    }

    /// The nested client for child `id`, if it is mounted.
    pub fn child(&mut self, id: i64) -> Option<&mut SyncClient> {
        self.mounted.get_mut(&id)
    }

    pub fn mounted_len(&self) -> usize {
        self.mounted.len()
    }
}
