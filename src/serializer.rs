//! Plan persistence
//!
//! Plans are saved as a versioned JSON document: global metadata plus a flat
//! node table addressed by id. Containers reference children by id, so shared
//! sub-trees serialize once and load back aliased.
//!
//! Loading is tolerant of plans written by a newer build: an unrecognized
//! item tag degrades to an inert placeholder that preserves the original tag
//! and configuration verbatim, so a save/load cycle through an older build
//! loses nothing.

use crate::actions::{
    Annotation, MoveFocuserRelative, SetPanelBrightness, SlewToTarget, SwitchFilter, TakeExposure,
    WaitForDuration,
};
use crate::conditions::{LoopForIterations, LoopForTimeSpan, LoopWhileHfrBelow};
use crate::error::{ItemError, SequenceError};
use crate::item::{Action, Condition, EntityMeta, ExecutionContext, TargetInfo, Trigger};
use crate::plan::{ContainerNode, Node, NodeId, NodeKind, Plan};
use crate::triggers::{AutofocusTrigger, MeridianFlipTrigger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Document format version written by this build.
pub const PLAN_FORMAT: u32 = 1;

// =============================================================================
// REGISTRY
// =============================================================================

/// Catalog entry describing an item type to editing front-ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub tag: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    pub icon: String,
}

impl DisplayInfo {
    fn new(tag: &str, display_name: &str, description: &str, category: &str, icon: &str) -> Self {
        Self {
            tag: tag.into(),
            display_name: display_name.into(),
            description: description.into(),
            category: category.into(),
            icon: icon.into(),
        }
    }
}

pub type ActionFactory = fn(serde_json::Value) -> anyhow::Result<Box<dyn Action>>;
pub type ConditionFactory = fn(serde_json::Value) -> anyhow::Result<Box<dyn Condition>>;
pub type TriggerFactory = fn(serde_json::Value) -> anyhow::Result<Box<dyn Trigger>>;

/// Maps persistence tags to item factories.
///
/// The remap table translates tags from older builds to their current names
/// before lookup, so renames do not orphan saved plans.
pub struct ItemRegistry {
    actions: HashMap<String, (DisplayInfo, ActionFactory)>,
    conditions: HashMap<String, (DisplayInfo, ConditionFactory)>,
    triggers: HashMap<String, (DisplayInfo, TriggerFactory)>,
    tag_remaps: HashMap<String, String>,
}

impl ItemRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
            conditions: HashMap::new(),
            triggers: HashMap::new(),
            tag_remaps: HashMap::new(),
        }
    }

    /// Registry with every built-in item type and the legacy tag remaps.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();

        r.register_action(
            DisplayInfo::new("TakeExposure", "Take Exposure", "Expose one or more frames", "Camera", "camera"),
            |v| Ok(Box::new(serde_json::from_value::<TakeExposure>(v)?)),
        );
        r.register_action(
            DisplayInfo::new("SlewToTarget", "Slew to Target", "Point the mount at the plan target", "Telescope", "telescope"),
            |v| Ok(Box::new(serde_json::from_value::<SlewToTarget>(v)?)),
        );
        r.register_action(
            DisplayInfo::new("SwitchFilter", "Switch Filter", "Select a filter by name", "Filter Wheel", "filter"),
            |v| Ok(Box::new(serde_json::from_value::<SwitchFilter>(v)?)),
        );
        r.register_action(
            DisplayInfo::new("MoveFocuserRelative", "Move Focuser", "Move the focuser by a step offset", "Focuser", "focus"),
            |v| Ok(Box::new(serde_json::from_value::<MoveFocuserRelative>(v)?)),
        );
        r.register_action(
            DisplayInfo::new("SetPanelBrightness", "Set Panel Brightness", "Set the flat panel level", "Flat Panel", "panel"),
            |v| Ok(Box::new(serde_json::from_value::<SetPanelBrightness>(v)?)),
        );
        r.register_action(
            DisplayInfo::new("WaitForDuration", "Wait", "Pause for a fixed duration", "Utility", "clock"),
            |v| Ok(Box::new(serde_json::from_value::<WaitForDuration>(v)?)),
        );
        r.register_action(
            DisplayInfo::new("Annotation", "Annotation", "Log a note, does nothing else", "Utility", "note"),
            |v| Ok(Box::new(serde_json::from_value::<Annotation>(v)?)),
        );

        r.register_condition(
            DisplayInfo::new("LoopForIterations", "Loop N Times", "Repeat the block a fixed number of times", "Loop", "repeat"),
            |v| Ok(Box::new(serde_json::from_value::<LoopForIterations>(v)?)),
        );
        r.register_condition(
            DisplayInfo::new("LoopForTimeSpan", "Loop for Time", "Repeat the block until a time budget elapses", "Loop", "timer"),
            |v| Ok(Box::new(serde_json::from_value::<LoopForTimeSpan>(v)?)),
        );
        r.register_condition(
            DisplayInfo::new("LoopWhileHfrBelow", "Loop While Focused", "Repeat while the focus metric stays good", "Loop", "star"),
            |v| Ok(Box::new(serde_json::from_value::<LoopWhileHfrBelow>(v)?)),
        );

        r.register_trigger(
            DisplayInfo::new("MeridianFlip", "Meridian Flip", "Flip the mount near the meridian crossing", "Telescope", "flip"),
            |v| Ok(Box::new(MeridianFlipTrigger::new(serde_json::from_value(v)?))),
        );
        r.register_trigger(
            DisplayInfo::new("Autofocus", "Autofocus", "Refocus on filter change or focus drift", "Focuser", "focus"),
            |v| Ok(Box::new(AutofocusTrigger::new(serde_json::from_value(v)?))),
        );

        // Tags from earlier builds.
        r.add_tag_remap("Wait", "WaitForDuration");
        r.add_tag_remap("CenterTarget", "SlewToTarget");
        r.add_tag_remap("LoopFor", "LoopForIterations");

        r
    }

    pub fn register_action(&mut self, info: DisplayInfo, factory: ActionFactory) {
        self.actions.insert(info.tag.clone(), (info, factory));
    }

    pub fn register_condition(&mut self, info: DisplayInfo, factory: ConditionFactory) {
        self.conditions.insert(info.tag.clone(), (info, factory));
    }

    pub fn register_trigger(&mut self, info: DisplayInfo, factory: TriggerFactory) {
        self.triggers.insert(info.tag.clone(), (info, factory));
    }

    pub fn add_tag_remap(&mut self, old: impl Into<String>, new: impl Into<String>) {
        self.tag_remaps.insert(old.into(), new.into());
    }

    fn resolve<'a>(&'a self, tag: &'a str) -> &'a str {
        self.tag_remaps.get(tag).map(String::as_str).unwrap_or(tag)
    }

    /// Catalog of registered item types for editing front-ends.
    pub fn catalog(&self) -> impl Iterator<Item = &DisplayInfo> {
        self.actions
            .values()
            .map(|(info, _)| info)
            .chain(self.conditions.values().map(|(info, _)| info))
            .chain(self.triggers.values().map(|(info, _)| info))
    }
}

impl Default for ItemRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// =============================================================================
// UNKNOWN-TAG PLACEHOLDERS
// =============================================================================

/// Stand-in for an action whose tag this build does not know.
///
/// Never executes: validation reports the unknown tag so the coordinator
/// skips the node. Tag and configuration round-trip verbatim.
pub struct UnknownAction {
    pub tag: String,
    pub raw: serde_json::Value,
}

#[async_trait]
impl Action for UnknownAction {
    fn type_tag(&self) -> &str {
        &self.tag
    }

    async fn validate(&self, _ctx: &ExecutionContext) -> Vec<String> {
        vec![format!("unknown action type '{}'", self.tag)]
    }

    async fn execute(&mut self, _ctx: &ExecutionContext) -> Result<(), ItemError> {
        Err(ItemError::Failed(format!(
            "unknown action type '{}'",
            self.tag
        )))
    }

    fn config(&self) -> serde_json::Value {
        self.raw.clone()
    }

    fn clone_boxed(&self) -> Box<dyn Action> {
        Box::new(UnknownAction {
            tag: self.tag.clone(),
            raw: self.raw.clone(),
        })
    }
}

/// Stand-in loop condition: defers to the other conditions on the block.
pub struct UnknownCondition {
    pub tag: String,
    pub raw: serde_json::Value,
}

impl Condition for UnknownCondition {
    fn type_tag(&self) -> &str {
        &self.tag
    }

    fn check(&mut self, _ctx: &ExecutionContext, _next: Option<&EntityMeta>) -> bool {
        true
    }

    fn config(&self) -> serde_json::Value {
        self.raw.clone()
    }

    fn clone_boxed(&self) -> Box<dyn Condition> {
        Box::new(UnknownCondition {
            tag: self.tag.clone(),
            raw: self.raw.clone(),
        })
    }
}

/// Stand-in trigger: never fires.
pub struct UnknownTrigger {
    pub tag: String,
    pub raw: serde_json::Value,
}

#[async_trait]
impl Trigger for UnknownTrigger {
    fn type_tag(&self) -> &str {
        &self.tag
    }

    async fn should_fire(&mut self, _ctx: &ExecutionContext, _next: Option<&EntityMeta>) -> bool {
        false
    }

    async fn execute(&mut self, _ctx: &ExecutionContext) -> Result<(), ItemError> {
        Ok(())
    }

    fn config(&self) -> serde_json::Value {
        self.raw.clone()
    }

    fn clone_boxed(&self) -> Box<dyn Trigger> {
        Box::new(UnknownTrigger {
            tag: self.tag.clone(),
            raw: self.raw.clone(),
        })
    }
}

// =============================================================================
// DOCUMENT
// =============================================================================

#[derive(Serialize, Deserialize)]
struct PlanDoc {
    format: u32,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<TargetInfo>,
    created: DateTime<Utc>,
    root: usize,
    nodes: Vec<NodeDoc>,
}

#[derive(Serialize, Deserialize)]
struct ItemDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    config: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct NodeDoc {
    id: usize,
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    category: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    icon: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    conditions: Vec<ItemDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    triggers: Vec<ItemDoc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    config: serde_json::Value,
}

const CONTAINER_TAG: &str = "Container";

// =============================================================================
// SAVE / LOAD
// =============================================================================

/// Render a plan as a pretty-printed JSON document.
///
/// Node ids are compacted to 0..n in preorder, so the document is stable
/// under arena slot reuse; a node referenced by several parents appears once.
pub fn serialize(plan: &Plan) -> Result<String, SequenceError> {
    let order = plan.reachable();
    let remap: HashMap<NodeId, usize> = order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    let mut nodes = Vec::with_capacity(order.len());
    for &id in &order {
        let node = plan
            .node(id)
            .ok_or_else(|| SequenceError::Format(format!("dangling node id {id}")))?;
        let doc = match &node.kind {
            NodeKind::Action(action) => NodeDoc {
                id: remap[&id],
                kind: action.type_tag().to_string(),
                name: node.meta.name.clone(),
                description: node.meta.description.clone(),
                category: node.meta.category.clone(),
                icon: node.meta.icon.clone(),
                children: Vec::new(),
                conditions: Vec::new(),
                triggers: Vec::new(),
                config: action.config(),
            },
            NodeKind::Container(c) => NodeDoc {
                id: remap[&id],
                kind: CONTAINER_TAG.to_string(),
                name: node.meta.name.clone(),
                description: node.meta.description.clone(),
                category: node.meta.category.clone(),
                icon: node.meta.icon.clone(),
                children: c.children.iter().map(|child| remap[child]).collect(),
                conditions: c
                    .conditions
                    .iter()
                    .map(|cond| ItemDoc {
                        kind: cond.type_tag().to_string(),
                        config: cond.config(),
                    })
                    .collect(),
                triggers: c
                    .triggers
                    .iter()
                    .map(|t| ItemDoc {
                        kind: t.type_tag().to_string(),
                        config: t.config(),
                    })
                    .collect(),
                config: serde_json::Value::Null,
            },
        };
        nodes.push(doc);
    }

    let doc = PlanDoc {
        format: PLAN_FORMAT,
        name: plan.name.clone(),
        target: plan.target.clone(),
        created: plan.created,
        root: remap[&plan.root()],
        nodes,
    };
    serde_json::to_string_pretty(&doc).map_err(|e| SequenceError::Format(e.to_string()))
}

/// A loaded plan plus everything that degraded on the way in.
pub struct LoadResult {
    pub plan: Plan,
    pub warnings: Vec<String>,
}

// Plan holds trait objects, so summarize instead of deriving.
impl std::fmt::Debug for LoadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadResult")
            .field("plan", &self.plan.name)
            .field("nodes", &self.plan.node_count())
            .field("warnings", &self.warnings)
            .finish()
    }
}

/// Parse a plan document.
///
/// Structural damage (bad JSON, unknown format version, dangling child ids,
/// cyclic child references) is an error; an unknown item tag is a warning
/// and the item degrades to a placeholder that preserves it.
pub fn deserialize(text: &str, registry: &ItemRegistry) -> Result<LoadResult, SequenceError> {
    let doc: PlanDoc =
        serde_json::from_str(text).map_err(|e| SequenceError::Format(e.to_string()))?;
    if doc.format != PLAN_FORMAT {
        return Err(SequenceError::Format(format!(
            "unsupported plan format {}",
            doc.format
        )));
    }

    let mut ids = HashSet::new();
    for node in &doc.nodes {
        if !ids.insert(node.id) {
            return Err(SequenceError::Format(format!("duplicate node id {}", node.id)));
        }
    }
    if !ids.contains(&doc.root) {
        return Err(SequenceError::Format(format!("root id {} not in node table", doc.root)));
    }
    let mut child_map: HashMap<usize, Vec<usize>> = HashMap::new();
    for node in &doc.nodes {
        for &child in &node.children {
            if !ids.contains(&child) {
                return Err(SequenceError::Format(format!(
                    "node {} references missing child {}",
                    node.id, child
                )));
            }
        }
        child_map.insert(node.id, node.children.clone());
    }
    check_acyclic(doc.root, &child_map)?;

    let mut warnings = Vec::new();
    let capacity = doc.nodes.iter().map(|n| n.id + 1).max().unwrap_or(0);
    let mut nodes: Vec<Option<Node>> = std::iter::repeat_with(|| None).take(capacity).collect();

    for node_doc in doc.nodes {
        let NodeDoc {
            id,
            kind: tag,
            name,
            description,
            category,
            icon,
            children,
            conditions,
            triggers,
            config,
        } = node_doc;

        let mut meta = EntityMeta::new(name);
        meta.description = description;
        meta.category = category;
        meta.icon = icon;

        let kind = if tag == CONTAINER_TAG {
            let conditions = conditions
                .into_iter()
                .map(|item| make_condition(registry, item, &mut warnings))
                .collect();
            let triggers = triggers
                .into_iter()
                .map(|item| make_trigger(registry, item, &mut warnings))
                .collect();
            NodeKind::Container(ContainerNode {
                children,
                conditions,
                triggers,
            })
        } else {
            NodeKind::Action(make_action(registry, ItemDoc { kind: tag, config }, &mut warnings))
        };
        nodes[id] = Some(Node { meta, kind });
    }

    let root = doc.root;
    if !nodes
        .get(root)
        .and_then(|n| n.as_ref())
        .map(|n| n.is_container())
        .unwrap_or(false)
    {
        return Err(SequenceError::Format("root is not a container".into()));
    }

    Ok(LoadResult {
        plan: Plan::from_parts(doc.name, doc.target, doc.created, nodes, root),
        warnings,
    })
}

/// Depth-first walk rejecting back-edges. Shared sub-trees (several parents,
/// one child) are legal; a node that is its own ancestor is not, since the
/// run recursion would never terminate.
fn check_acyclic(
    root: usize,
    children: &HashMap<usize, Vec<usize>>,
) -> Result<(), SequenceError> {
    fn walk(
        id: usize,
        children: &HashMap<usize, Vec<usize>>,
        on_path: &mut HashSet<usize>,
        done: &mut HashSet<usize>,
    ) -> Result<(), SequenceError> {
        if done.contains(&id) {
            return Ok(());
        }
        if !on_path.insert(id) {
            return Err(SequenceError::Format(format!(
                "node {id} is its own ancestor"
            )));
        }
        if let Some(kids) = children.get(&id) {
            for &child in kids {
                walk(child, children, on_path, done)?;
            }
        }
        on_path.remove(&id);
        done.insert(id);
        Ok(())
    }
    walk(root, children, &mut HashSet::new(), &mut HashSet::new())
}

fn make_action(
    registry: &ItemRegistry,
    item: ItemDoc,
    warnings: &mut Vec<String>,
) -> Box<dyn Action> {
    let resolved = registry.resolve(&item.kind);
    match registry.actions.get(resolved) {
        Some((_, factory)) => match factory(item.config.clone()) {
            Ok(action) => action,
            Err(e) => {
                warnings.push(format!("action '{}' config rejected: {e}", item.kind));
                Box::new(UnknownAction {
                    tag: item.kind,
                    raw: item.config,
                })
            }
        },
        None => {
            warnings.push(format!("unknown action type '{}'", item.kind));
            Box::new(UnknownAction {
                tag: item.kind,
                raw: item.config,
            })
        }
    }
}

fn make_condition(
    registry: &ItemRegistry,
    item: ItemDoc,
    warnings: &mut Vec<String>,
) -> Box<dyn Condition> {
    let resolved = registry.resolve(&item.kind);
    match registry.conditions.get(resolved) {
        Some((_, factory)) => match factory(item.config.clone()) {
            Ok(condition) => condition,
            Err(e) => {
                warnings.push(format!("condition '{}' config rejected: {e}", item.kind));
                Box::new(UnknownCondition {
                    tag: item.kind,
                    raw: item.config,
                })
            }
        },
        None => {
            warnings.push(format!("unknown condition type '{}'", item.kind));
            Box::new(UnknownCondition {
                tag: item.kind,
                raw: item.config,
            })
        }
    }
}

fn make_trigger(
    registry: &ItemRegistry,
    item: ItemDoc,
    warnings: &mut Vec<String>,
) -> Box<dyn Trigger> {
    let resolved = registry.resolve(&item.kind);
    match registry.triggers.get(resolved) {
        Some((_, factory)) => match factory(item.config.clone()) {
            Ok(trigger) => trigger,
            Err(e) => {
                warnings.push(format!("trigger '{}' config rejected: {e}", item.kind));
                Box::new(UnknownTrigger {
                    tag: item.kind,
                    raw: item.config,
                })
            }
        },
        None => {
            warnings.push(format!("unknown trigger type '{}'", item.kind));
            Box::new(UnknownTrigger {
                tag: item.kind,
                raw: item.config,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::LoopForIterations;
    use crate::triggers::MeridianFlipConfig;

    fn sample_plan() -> Plan {
        let mut plan = Plan::new("M31 mosaic");
        plan.target = Some(TargetInfo {
            name: "M31".into(),
            ra_hours: 0.712,
            dec_degrees: 41.27,
        });
        let root = plan.root();
        let imaging = plan.add_container(root, "Imaging").unwrap();
        plan.add_action(
            imaging,
            "Lights",
            Box::new(TakeExposure {
                duration_secs: 120.0,
                count: 10,
                gain: Some(100),
                binning: 1,
            }),
        )
        .unwrap();
        plan.add_condition(imaging, Box::new(LoopForIterations::new(3)))
            .unwrap();
        plan.add_trigger(
            imaging,
            Box::new(MeridianFlipTrigger::new(MeridianFlipConfig::default())),
        )
        .unwrap();
        plan
    }

    #[test]
    fn round_trip_preserves_structure_and_configs() {
        let registry = ItemRegistry::with_builtins();
        let plan = sample_plan();

        let text = serialize(&plan).unwrap();
        let loaded = deserialize(&text, &registry).unwrap();
        assert!(loaded.warnings.is_empty());

        let plan2 = loaded.plan;
        assert_eq!(plan2.name, "M31 mosaic");
        assert_eq!(plan2.target, plan.target);
        assert_eq!(plan2.node_count(), plan.node_count());

        // Saving the loaded plan reproduces the same document.
        assert_eq!(serialize(&plan2).unwrap(), text);
    }

    #[test]
    fn shared_subtree_round_trips_aliased() {
        let registry = ItemRegistry::with_builtins();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let c1 = plan.add_container(root, "A").unwrap();
        let c2 = plan.add_container(root, "B").unwrap();
        let shared = plan
            .add_action(c1, "Shared", Box::new(WaitForDuration { seconds: 1.0 }))
            .unwrap();
        plan.attach_shared(c2, shared).unwrap();

        let text = serialize(&plan).unwrap();
        let loaded = deserialize(&text, &registry).unwrap().plan;

        // Same live node count as the original: the shared leaf is one node,
        // not two copies.
        assert_eq!(loaded.node_count(), plan.node_count());

        let shared_ids: Vec<Vec<usize>> = loaded
            .reachable()
            .iter()
            .filter_map(|&id| match &loaded.node(id).unwrap().kind {
                NodeKind::Container(c) if !c.children.is_empty() && id != loaded.root() => {
                    Some(c.children.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(shared_ids.len(), 2);
        assert_eq!(shared_ids[0], shared_ids[1]);
    }

    #[test]
    fn unknown_action_degrades_and_round_trips_verbatim() {
        let registry = ItemRegistry::with_builtins();
        let text = r#"{
            "format": 1,
            "name": "future plan",
            "created": "2026-01-10T03:00:00Z",
            "root": 0,
            "nodes": [
                { "id": 0, "type": "Container", "name": "Root", "children": [1] },
                { "id": 1, "type": "DitherViaGuider", "name": "Dither",
                  "config": { "pixels": 3.5, "settle": { "time": 8 } } }
            ]
        }"#;

        let loaded = deserialize(text, &registry).unwrap();
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].contains("DitherViaGuider"));

        let saved = serialize(&loaded.plan).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&saved).unwrap();
        let node = &doc["nodes"][1];
        assert_eq!(node["type"], "DitherViaGuider");
        assert_eq!(node["config"]["pixels"], 3.5);
        assert_eq!(node["config"]["settle"]["time"], 8);
    }

    #[test]
    fn unknown_placeholder_is_skipped_not_faulted() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let ctx = ExecutionContext::new();
            let action = UnknownAction {
                tag: "DitherViaGuider".into(),
                raw: serde_json::Value::Null,
            };
            let issues = action.validate(&ctx).await;
            assert_eq!(issues, vec!["unknown action type 'DitherViaGuider'"]);
        });
    }

    #[test]
    fn legacy_tags_resolve_through_the_remap_table() {
        let registry = ItemRegistry::with_builtins();
        let text = r#"{
            "format": 1,
            "name": "old plan",
            "created": "2024-05-01T00:00:00Z",
            "root": 0,
            "nodes": [
                { "id": 0, "type": "Container", "name": "Root", "children": [1] },
                { "id": 1, "type": "Wait", "name": "Wait", "config": { "seconds": 5.0 } }
            ]
        }"#;

        let loaded = deserialize(text, &registry).unwrap();
        assert!(loaded.warnings.is_empty());
        let child = loaded.plan.reachable()[1];
        match &loaded.plan.node(child).unwrap().kind {
            NodeKind::Action(a) => assert_eq!(a.type_tag(), "WaitForDuration"),
            _ => panic!("expected an action"),
        }
    }

    #[test]
    fn display_metadata_round_trips() {
        let registry = ItemRegistry::with_builtins();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let id = plan
            .add_action(root, "Lights", Box::new(WaitForDuration { seconds: 1.0 }))
            .unwrap();
        {
            let meta = &mut plan.node_mut(id).unwrap().meta;
            meta.description = "Luminance frames for the mosaic".into();
            meta.category = "Camera".into();
            meta.icon = "camera".into();
        }

        let text = serialize(&plan).unwrap();
        let loaded = deserialize(&text, &registry).unwrap().plan;
        let meta = &loaded.node(loaded.reachable()[1]).unwrap().meta;
        assert_eq!(meta.name, "Lights");
        assert_eq!(meta.description, "Luminance frames for the mosaic");
        assert_eq!(meta.category, "Camera");
        assert_eq!(meta.icon, "camera");
    }

    #[test]
    fn load_result_debug_summarizes_without_the_tree() {
        let registry = ItemRegistry::with_builtins();
        let text = serialize(&sample_plan()).unwrap();
        let loaded = deserialize(&text, &registry).unwrap();
        let rendered = format!("{loaded:?}");
        assert!(rendered.contains("M31 mosaic"));
        assert!(rendered.contains("warnings"));
    }

    #[test]
    fn cyclic_document_is_a_format_error() {
        let registry = ItemRegistry::with_builtins();
        let text = r#"{
            "format": 1,
            "name": "loop",
            "created": "2026-01-10T03:00:00Z",
            "root": 0,
            "nodes": [
                { "id": 0, "type": "Container", "name": "A", "children": [1] },
                { "id": 1, "type": "Container", "name": "B", "children": [0] }
            ]
        }"#;

        let err = deserialize(text, &registry).unwrap_err();
        match err {
            SequenceError::Format(message) => assert!(message.contains("ancestor")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn self_referencing_container_is_a_format_error() {
        let registry = ItemRegistry::with_builtins();
        let text = r#"{
            "format": 1,
            "name": "loop",
            "created": "2026-01-10T03:00:00Z",
            "root": 0,
            "nodes": [
                { "id": 0, "type": "Container", "name": "Root", "children": [0] }
            ]
        }"#;

        assert!(matches!(
            deserialize(text, &registry),
            Err(SequenceError::Format(_))
        ));
    }

    #[test]
    fn dangling_child_reference_is_a_format_error() {
        let registry = ItemRegistry::with_builtins();
        let text = r#"{
            "format": 1,
            "name": "broken",
            "created": "2026-01-10T03:00:00Z",
            "root": 0,
            "nodes": [
                { "id": 0, "type": "Container", "name": "Root", "children": [7] }
            ]
        }"#;

        let err = deserialize(text, &registry).unwrap_err();
        assert!(matches!(err, SequenceError::Format(_)));
    }

    #[test]
    fn unsupported_format_version_is_rejected() {
        let registry = ItemRegistry::with_builtins();
        let text = r#"{ "format": 9, "name": "x", "created": "2026-01-10T03:00:00Z", "root": 0, "nodes": [] }"#;
        let err = deserialize(text, &registry).unwrap_err();
        assert!(matches!(err, SequenceError::Format(_)));
    }
}
