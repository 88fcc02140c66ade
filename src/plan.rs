//! Plan tree
//!
//! A plan is an arena of nodes addressed by index. Containers reference their
//! children by arena id, which makes shared sub-trees explicit: two parents
//! holding the same id alias one node. The editing surface refuses mutation
//! while a run holds the plan.

use crate::error::PlanError;
use crate::item::{Action, Condition, EntityMeta, ItemStatus, TargetInfo, Trigger};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

/// Arena index of a node within its plan.
pub type NodeId = usize;

/// An ordered sequence of children plus the conditions and triggers that
/// govern its loop.
pub struct ContainerNode {
    pub children: Vec<NodeId>,
    pub conditions: Vec<Box<dyn Condition>>,
    pub triggers: Vec<Box<dyn Trigger>>,
}

impl ContainerNode {
    fn empty() -> Self {
        Self {
            children: Vec::new(),
            conditions: Vec::new(),
            triggers: Vec::new(),
        }
    }
}

impl Clone for ContainerNode {
    fn clone(&self) -> Self {
        Self {
            children: self.children.clone(),
            conditions: self.conditions.iter().map(|c| c.clone_boxed()).collect(),
            triggers: self.triggers.iter().map(|t| t.clone_boxed()).collect(),
        }
    }
}

pub enum NodeKind {
    Action(Box<dyn Action>),
    Container(ContainerNode),
}

impl Clone for NodeKind {
    fn clone(&self) -> Self {
        match self {
            NodeKind::Action(a) => NodeKind::Action(a.clone_boxed()),
            NodeKind::Container(c) => NodeKind::Container(c.clone()),
        }
    }
}

pub struct Node {
    pub meta: EntityMeta,
    pub kind: NodeKind,
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl Node {
    pub fn is_container(&self) -> bool {
        matches!(self.kind, NodeKind::Container(_))
    }
}

/// The root container plus global metadata; the unit of persistence.
pub struct Plan {
    pub name: String,
    pub target: Option<TargetInfo>,
    pub created: DateTime<Utc>,
    pub(crate) nodes: Vec<Option<Node>>,
    pub(crate) root: NodeId,
    pub(crate) running: bool,
}

impl Plan {
    /// New plan with an empty root container.
    pub fn new(name: impl Into<String>) -> Self {
        let root = Node {
            meta: EntityMeta::new("Root"),
            kind: NodeKind::Container(ContainerNode::empty()),
        };
        Self {
            name: name.into(),
            target: None,
            created: Utc::now(),
            nodes: vec![Some(root)],
            root: 0,
            running: false,
        }
    }

    pub(crate) fn from_parts(
        name: String,
        target: Option<TargetInfo>,
        created: DateTime<Utc>,
        nodes: Vec<Option<Node>>,
        root: NodeId,
    ) -> Self {
        Self {
            name,
            target,
            created,
            nodes,
            root,
            running: false,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id).and_then(|n| n.as_mut())
    }

    /// Number of live nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    fn guard_editable(&self) -> Result<(), PlanError> {
        if self.running {
            Err(PlanError::Running)
        } else {
            Ok(())
        }
    }

    fn container_mut(&mut self, id: NodeId) -> Result<&mut ContainerNode, PlanError> {
        match self.node_mut(id) {
            Some(Node {
                kind: NodeKind::Container(c),
                ..
            }) => Ok(c),
            Some(_) => Err(PlanError::NotAContainer(id)),
            None => Err(PlanError::UnknownNode(id)),
        }
    }

    fn insert(&mut self, node: Node) -> NodeId {
        // Reuse a freed slot if one exists so ids stay dense-ish.
        if let Some(free) = self.nodes.iter().position(|n| n.is_none()) {
            self.nodes[free] = Some(node);
            free
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    /// Append a new action leaf under `parent`.
    pub fn add_action(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        action: Box<dyn Action>,
    ) -> Result<NodeId, PlanError> {
        self.guard_editable()?;
        self.container_mut(parent)?;
        let id = self.insert(Node {
            meta: EntityMeta::new(name),
            kind: NodeKind::Action(action),
        });
        self.container_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Append a new empty container under `parent`.
    pub fn add_container(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
    ) -> Result<NodeId, PlanError> {
        self.guard_editable()?;
        self.container_mut(parent)?;
        let id = self.insert(Node {
            meta: EntityMeta::new(name),
            kind: NodeKind::Container(ContainerNode::empty()),
        });
        self.container_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Alias an existing node under another parent (shared sub-tree).
    /// Rejected if it would introduce a cycle.
    pub fn attach_shared(&mut self, parent: NodeId, existing: NodeId) -> Result<(), PlanError> {
        self.guard_editable()?;
        if self.node(existing).is_none() {
            return Err(PlanError::UnknownNode(existing));
        }
        if existing == parent || self.reachable_from(existing).contains(&parent) {
            return Err(PlanError::Cycle(existing));
        }
        self.container_mut(parent)?.children.push(existing);
        Ok(())
    }

    /// Remove the child at `index` from `parent`. Nodes that become
    /// unreachable from the root are destroyed.
    pub fn remove_child(&mut self, parent: NodeId, index: usize) -> Result<(), PlanError> {
        self.guard_editable()?;
        let container = self.container_mut(parent)?;
        if index >= container.children.len() {
            return Err(PlanError::UnknownNode(index));
        }
        container.children.remove(index);
        self.collect_garbage();
        Ok(())
    }

    pub fn add_condition(
        &mut self,
        container: NodeId,
        condition: Box<dyn Condition>,
    ) -> Result<(), PlanError> {
        self.guard_editable()?;
        self.container_mut(container)?.conditions.push(condition);
        Ok(())
    }

    pub fn add_trigger(
        &mut self,
        container: NodeId,
        trigger: Box<dyn Trigger>,
    ) -> Result<(), PlanError> {
        self.guard_editable()?;
        self.container_mut(container)?.triggers.push(trigger);
        Ok(())
    }

    /// Live node ids reachable from the root, preorder, shared nodes once.
    pub fn reachable(&self) -> Vec<NodeId> {
        self.reachable_from(self.root)
    }

    fn reachable_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            if let Some(Node {
                kind: NodeKind::Container(c),
                ..
            }) = self.node(id)
            {
                // Reverse so the preorder pops children left to right.
                for &child in c.children.iter().rev() {
                    stack.push(child);
                }
            }
        }
        order
    }

    fn collect_garbage(&mut self) {
        let live: HashSet<NodeId> = self.reachable().into_iter().collect();
        for (id, slot) in self.nodes.iter_mut().enumerate() {
            if slot.is_some() && !live.contains(&id) {
                *slot = None;
            }
        }
    }

    /// Reset every node status and condition counter so the plan can run again.
    pub fn reset_progress(&mut self) {
        for id in self.reachable() {
            self.reset_node_progress(id);
        }
    }

    pub(crate) fn reset_node_progress(&mut self, id: NodeId) {
        if let Some(node) = self.node_mut(id) {
            node.meta.status = ItemStatus::Created;
            if let NodeKind::Container(c) = &mut node.kind {
                for condition in &mut c.conditions {
                    condition.reset_progress();
                }
            }
        }
    }

    /// Reset statuses and condition counters of a container's descendants,
    /// used between loop passes. Trigger state deliberately survives.
    pub(crate) fn restart_children(&mut self, container: NodeId) {
        let children = match self.node(container) {
            Some(Node {
                kind: NodeKind::Container(c),
                ..
            }) => c.children.clone(),
            _ => return,
        };
        for child in children {
            self.reset_node_progress(child);
            if self.node(child).map(|n| n.is_container()).unwrap_or(false) {
                self.restart_children(child);
            }
        }
    }

    /// Structurally identical, independently mutable copy with fresh identity.
    /// Aliasing of shared sub-trees is preserved; uuids are regenerated so the
    /// clone is a distinct entity tree (templates stay untouched when the
    /// clone is edited).
    pub fn deep_clone(&self) -> Plan {
        let mut nodes: Vec<Option<Node>> = self.nodes.clone();
        for slot in nodes.iter_mut().flatten() {
            slot.meta.id = Uuid::new_v4();
            slot.meta.status = ItemStatus::Created;
        }
        Plan {
            name: self.name.clone(),
            target: self.target.clone(),
            created: Utc::now(),
            nodes,
            root: self.root,
            running: false,
        }
    }
}
