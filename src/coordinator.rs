//! Execution coordinator
//!
//! Walks the plan tree depth-first, runs leaf actions in order, and repeats
//! container bodies while their conditions allow. After every completed leaf
//! the triggers of all enclosing containers are polled, innermost container
//! first, and a firing trigger's side-sequence runs before the next leaf.
//!
//! Cancellation is cooperative: the flag is checked before every leaf, before
//! every trigger poll, and before every loop repeat. A faulted leaf stops the
//! run; teardown still visits every initialized node, in reverse order.

use crate::error::{ItemError, SequenceError};
use crate::item::{EntityMeta, ExecutionContext, ItemStatus, Trigger};
use crate::plan::{Node, NodeId, NodeKind, Plan};
use futures::future::BoxFuture;
use std::collections::HashMap;

/// How a run ended, short of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Summary of a finished run.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Final status of every reachable node.
    pub statuses: HashMap<NodeId, ItemStatus>,
    /// Nodes skipped by validation, with the issues that blocked them.
    pub validation_issues: Vec<(String, Vec<String>)>,
    /// Type tags of triggers that fired, in firing order.
    pub fired_triggers: Vec<String>,
}

/// Result of one step of the walk, threaded up the recursion.
enum StepResult {
    Continue,
    Cancelled,
    Fault { node: NodeId, message: String },
}

impl StepResult {
    fn is_continue(&self) -> bool {
        matches!(self, StepResult::Continue)
    }
}

/// Per-run working state. The trigger chain holds the triggers of every
/// container currently open on the walk, outermost at index 0; polling
/// iterates it back to front.
struct RunCtx<'c> {
    ctx: &'c ExecutionContext,
    trigger_chain: Vec<Vec<Box<dyn Trigger>>>,
    validation_issues: Vec<(String, Vec<String>)>,
    fired_triggers: Vec<String>,
}

/// Run a plan to completion, cancellation, or first fault.
///
/// The plan is marked running for the duration, which blocks the editing
/// surface. Node statuses and condition counters are reset on entry, so the
/// same plan can be run repeatedly.
pub async fn run_plan(
    plan: &mut Plan,
    ctx: &ExecutionContext,
) -> Result<RunReport, SequenceError> {
    if plan.is_running() {
        return Err(SequenceError::Execution {
            node: plan.root(),
            message: "a run is already in progress".into(),
        });
    }

    tracing::info!("Starting plan '{}'", plan.name);
    plan.running = true;
    plan.reset_progress();

    let order = plan.reachable();
    initialize_all(plan, &order, ctx).await;

    let mut rc = RunCtx {
        ctx,
        trigger_chain: Vec::new(),
        validation_issues: Vec::new(),
        fired_triggers: Vec::new(),
    };

    let root = plan.root();
    let result = run_container(plan, root, &mut rc).await;

    // Teardown visits every initialized node even after a fault, releasing
    // resources in reverse initialization order.
    teardown_all(plan, &order, ctx).await;
    plan.running = false;

    let statuses = order
        .iter()
        .filter_map(|&id| plan.node(id).map(|n| (id, n.meta.status)))
        .collect();

    let outcome = match result {
        StepResult::Continue => {
            tracing::info!("Plan '{}' completed", plan.name);
            RunOutcome::Completed
        }
        StepResult::Cancelled => {
            tracing::info!("Plan '{}' cancelled", plan.name);
            RunOutcome::Cancelled
        }
        StepResult::Fault { node, message } => {
            tracing::error!("Plan '{}' faulted at node {}: {}", plan.name, node, message);
            return Err(SequenceError::Execution { node, message });
        }
    };

    Ok(RunReport {
        outcome,
        statuses,
        validation_issues: rc.validation_issues,
        fired_triggers: rc.fired_triggers,
    })
}

async fn initialize_all(plan: &mut Plan, order: &[NodeId], ctx: &ExecutionContext) {
    for &id in order {
        if let Some(node) = plan.node_mut(id) {
            match &mut node.kind {
                NodeKind::Action(action) => action.initialize(ctx).await,
                NodeKind::Container(c) => {
                    for condition in &mut c.conditions {
                        condition.initialize(ctx);
                    }
                    for trigger in &mut c.triggers {
                        trigger.initialize(ctx).await;
                    }
                }
            }
        }
    }
}

async fn teardown_all(plan: &mut Plan, order: &[NodeId], ctx: &ExecutionContext) {
    for &id in order.iter().rev() {
        if let Some(node) = plan.node_mut(id) {
            match &mut node.kind {
                NodeKind::Action(action) => action.teardown(ctx).await,
                NodeKind::Container(c) => {
                    for trigger in &mut c.triggers {
                        trigger.teardown(ctx).await;
                    }
                }
            }
        }
    }
}

/// Recursive walk of one container. Boxed future because async recursion
/// needs an indirection.
fn run_container<'a, 'c: 'a>(
    plan: &'a mut Plan,
    id: NodeId,
    rc: &'a mut RunCtx<'c>,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        // Lift this container's conditions and triggers out of the arena for
        // the duration of the visit; the triggers join the active chain so
        // leaf completions deeper in the tree can poll them.
        let (mut conditions, triggers) = match plan.node_mut(id) {
            Some(Node {
                meta,
                kind: NodeKind::Container(c),
            }) => {
                meta.status = ItemStatus::Running;
                (std::mem::take(&mut c.conditions), std::mem::take(&mut c.triggers))
            }
            _ => {
                return StepResult::Fault {
                    node: id,
                    message: "expected a container".into(),
                }
            }
        };
        rc.trigger_chain.push(triggers);

        let mut first_pass = true;
        let result = 'body: loop {
            for condition in conditions.iter_mut() {
                condition.on_block_started();
            }
            if let Some(own) = rc.trigger_chain.last_mut() {
                for trigger in own.iter_mut() {
                    trigger.on_block_started();
                }
            }

            let children = match plan.node(id) {
                Some(Node {
                    kind: NodeKind::Container(c),
                    ..
                }) => c.children.clone(),
                _ => Vec::new(),
            };

            // Conditions gate every pass, including the first: a loop
            // configured for zero iterations never runs its body.
            if !conditions.is_empty() {
                let next = children
                    .first()
                    .and_then(|&n| plan.node(n))
                    .map(|n| n.meta.clone());
                let allowed = conditions
                    .iter_mut()
                    .all(|c| c.check(rc.ctx, next.as_ref()));
                if !allowed {
                    break StepResult::Continue;
                }
            }
            if rc.ctx.is_cancelled() {
                break StepResult::Cancelled;
            }
            if !first_pass {
                tracing::debug!("Container {} looping", id);
                plan.restart_children(id);
            }
            first_pass = false;

            for (position, &child) in children.iter().enumerate() {
                if rc.ctx.is_cancelled() {
                    break 'body StepResult::Cancelled;
                }
                let is_container = match plan.node(child) {
                    Some(node) => node.is_container(),
                    None => continue,
                };

                if is_container {
                    let step = run_container(plan, child, rc).await;
                    if !step.is_continue() {
                        break 'body step;
                    }
                } else {
                    let step = run_leaf(plan, child, rc).await;
                    if !step.is_continue() {
                        break 'body step;
                    }
                    // Leaf done: poll the enclosing trigger chain against the
                    // would-be next item before moving on.
                    let next = children
                        .get(position + 1)
                        .and_then(|&n| plan.node(n))
                        .map(|n| n.meta.clone());
                    let step = poll_triggers(rc, child, next.as_ref()).await;
                    if !step.is_continue() {
                        break 'body step;
                    }
                }
            }

            for condition in conditions.iter_mut() {
                condition.on_block_finished();
            }
            if let Some(own) = rc.trigger_chain.last_mut() {
                for trigger in own.iter_mut() {
                    trigger.on_block_finished();
                }
            }

            // No conditions: the body runs exactly once.
            if conditions.is_empty() {
                break StepResult::Continue;
            }
        };

        // Put conditions and triggers back where they live.
        let triggers = rc.trigger_chain.pop().unwrap_or_default();
        if let Some(Node {
            meta,
            kind: NodeKind::Container(c),
        }) = plan.node_mut(id)
        {
            c.conditions = conditions;
            c.triggers = triggers;
            meta.status = match result {
                StepResult::Continue => ItemStatus::Finished,
                StepResult::Cancelled => ItemStatus::Skipped,
                StepResult::Fault { .. } => ItemStatus::Failed,
            };
        }

        result
    })
}

async fn run_leaf(plan: &mut Plan, id: NodeId, rc: &mut RunCtx<'_>) -> StepResult {
    let Some(node) = plan.node_mut(id) else {
        return StepResult::Continue;
    };
    let name = node.meta.name.clone();
    let NodeKind::Action(action) = &mut node.kind else {
        return StepResult::Continue;
    };

    // A node that cannot run right now is skipped, not faulted; the rest of
    // the plan proceeds.
    let issues = action.validate(rc.ctx).await;
    if !issues.is_empty() {
        tracing::warn!("Skipping '{}': {}", name, issues.join("; "));
        node.meta.status = ItemStatus::Skipped;
        rc.validation_issues.push((name, issues));
        return StepResult::Continue;
    }

    node.meta.status = ItemStatus::Running;
    tracing::info!("Running '{}'", name);
    rc.ctx.report(name.clone(), "started");

    match action.execute(rc.ctx).await {
        Ok(()) => {
            node.meta.status = ItemStatus::Finished;
            StepResult::Continue
        }
        Err(ItemError::Cancelled) => {
            node.meta.status = ItemStatus::Skipped;
            StepResult::Cancelled
        }
        Err(ItemError::Failed(message)) => {
            tracing::error!("'{}' failed: {}", name, message);
            node.meta.status = ItemStatus::Failed;
            StepResult::Fault { node: id, message }
        }
    }
}

/// Poll the active trigger chain, innermost container first, and run any
/// firing trigger's side-sequence to completion. A trigger fault is charged
/// to the leaf whose completion prompted the poll.
async fn poll_triggers(
    rc: &mut RunCtx<'_>,
    after_leaf: NodeId,
    next: Option<&EntityMeta>,
) -> StepResult {
    let RunCtx {
        ctx,
        trigger_chain,
        fired_triggers,
        ..
    } = rc;

    for level in trigger_chain.iter_mut().rev() {
        for trigger in level.iter_mut() {
            if ctx.is_cancelled() {
                return StepResult::Cancelled;
            }
            if !trigger.should_fire(ctx, next).await {
                continue;
            }
            tracing::info!("Trigger '{}' firing", trigger.type_tag());
            fired_triggers.push(trigger.type_tag().to_string());
            match trigger.execute(ctx).await {
                Ok(()) => {}
                Err(ItemError::Cancelled) => return StepResult::Cancelled,
                Err(ItemError::Failed(message)) => {
                    tracing::error!("Trigger '{}' failed: {}", trigger.type_tag(), message);
                    return StepResult::Fault {
                        node: after_leaf,
                        message: format!("trigger '{}': {}", trigger.type_tag(), message),
                    };
                }
            }
        }
    }
    StepResult::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::LoopForIterations;
    use crate::item::Action;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// Leaf that appends its label to a shared log.
    #[derive(Clone)]
    struct RecordAction {
        label: String,
        log: Log,
        fail: bool,
        cancel: bool,
        issues: Vec<String>,
        record_teardown: bool,
    }

    impl RecordAction {
        fn new(label: &str, log: &Log) -> Self {
            Self {
                label: label.into(),
                log: log.clone(),
                fail: false,
                cancel: false,
                issues: Vec::new(),
                record_teardown: false,
            }
        }
    }

    #[async_trait]
    impl Action for RecordAction {
        fn type_tag(&self) -> &str {
            "Record"
        }

        async fn validate(&self, _ctx: &ExecutionContext) -> Vec<String> {
            self.issues.clone()
        }

        async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
            self.log.lock().unwrap().push(self.label.clone());
            if self.cancel {
                ctx.request_cancellation();
            }
            if self.fail {
                return Err(ItemError::Failed("boom".into()));
            }
            Ok(())
        }

        async fn teardown(&mut self, _ctx: &ExecutionContext) {
            if self.record_teardown {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("teardown {}", self.label));
            }
        }

        fn config(&self) -> serde_json::Value {
            serde_json::Value::Null
        }

        fn clone_boxed(&self) -> Box<dyn Action> {
            Box::new(self.clone())
        }
    }

    /// Trigger that fires whenever the most recent log entry matches.
    #[derive(Clone)]
    struct FireAfter {
        label: String,
        after: String,
        log: Log,
    }

    #[async_trait]
    impl Trigger for FireAfter {
        fn type_tag(&self) -> &str {
            "FireAfter"
        }

        async fn should_fire(
            &mut self,
            _ctx: &ExecutionContext,
            _next: Option<&EntityMeta>,
        ) -> bool {
            self.log.lock().unwrap().last() == Some(&self.after)
        }

        async fn execute(&mut self, _ctx: &ExecutionContext) -> Result<(), ItemError> {
            self.log.lock().unwrap().push(self.label.clone());
            Ok(())
        }

        fn config(&self) -> serde_json::Value {
            serde_json::Value::Null
        }

        fn clone_boxed(&self) -> Box<dyn Trigger> {
            Box::new(self.clone())
        }
    }

    /// Trigger that fires exactly once, on the first poll.
    #[derive(Clone)]
    struct FireOnce {
        label: String,
        log: Log,
        fired: bool,
    }

    #[async_trait]
    impl Trigger for FireOnce {
        fn type_tag(&self) -> &str {
            "FireOnce"
        }

        async fn should_fire(
            &mut self,
            _ctx: &ExecutionContext,
            _next: Option<&EntityMeta>,
        ) -> bool {
            !self.fired
        }

        async fn execute(&mut self, _ctx: &ExecutionContext) -> Result<(), ItemError> {
            self.fired = true;
            self.log.lock().unwrap().push(self.label.clone());
            Ok(())
        }

        fn config(&self) -> serde_json::Value {
            serde_json::Value::Null
        }

        fn clone_boxed(&self) -> Box<dyn Trigger> {
            Box::new(self.clone())
        }
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn looping_container_interleaves_trigger_each_pass() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let c = plan.add_container(root, "loop").unwrap();
        for label in ["1", "2", "3"] {
            plan.add_action(c, label, Box::new(RecordAction::new(label, &log)))
                .unwrap();
        }
        plan.add_condition(c, Box::new(LoopForIterations::new(2)))
            .unwrap();
        plan.add_trigger(
            c,
            Box::new(FireAfter {
                label: "T".into(),
                after: "2".into(),
                log: log.clone(),
            }),
        )
        .unwrap();

        let ctx = ExecutionContext::new();
        let report = rt().block_on(run_plan(&mut plan, &ctx)).unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(entries(&log), ["1", "2", "T", "3", "1", "2", "T", "3"]);
        assert_eq!(report.fired_triggers, ["FireAfter", "FireAfter"]);
    }

    #[test]
    fn single_iteration_runs_body_once() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let c = plan.add_container(root, "loop").unwrap();
        plan.add_action(c, "a", Box::new(RecordAction::new("a", &log)))
            .unwrap();
        plan.add_condition(c, Box::new(LoopForIterations::new(1)))
            .unwrap();

        let ctx = ExecutionContext::new();
        rt().block_on(run_plan(&mut plan, &ctx)).unwrap();
        assert_eq!(entries(&log), ["a"]);
    }

    #[test]
    fn zero_iteration_condition_never_runs_body() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let c = plan.add_container(root, "loop").unwrap();
        plan.add_action(c, "a", Box::new(RecordAction::new("a", &log)))
            .unwrap();
        plan.add_condition(c, Box::new(LoopForIterations::new(0)))
            .unwrap();

        let ctx = ExecutionContext::new();
        let report = rt().block_on(run_plan(&mut plan, &ctx)).unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn all_conditions_must_allow_continuation() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let c = plan.add_container(root, "loop").unwrap();
        plan.add_action(c, "a", Box::new(RecordAction::new("a", &log)))
            .unwrap();
        plan.add_condition(c, Box::new(LoopForIterations::new(5)))
            .unwrap();
        plan.add_condition(c, Box::new(LoopForIterations::new(2)))
            .unwrap();

        let ctx = ExecutionContext::new();
        rt().block_on(run_plan(&mut plan, &ctx)).unwrap();
        // The stricter condition wins.
        assert_eq!(entries(&log), ["a", "a"]);
    }

    #[test]
    fn nested_loops_restart_inner_counters() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let outer = plan.add_container(root, "outer").unwrap();
        let inner = plan.add_container(outer, "inner").unwrap();
        plan.add_action(inner, "a", Box::new(RecordAction::new("a", &log)))
            .unwrap();
        plan.add_condition(outer, Box::new(LoopForIterations::new(2)))
            .unwrap();
        plan.add_condition(inner, Box::new(LoopForIterations::new(2)))
            .unwrap();

        let ctx = ExecutionContext::new();
        rt().block_on(run_plan(&mut plan, &ctx)).unwrap();
        assert_eq!(entries(&log).len(), 4);
    }

    #[test]
    fn inner_triggers_poll_before_outer() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let inner = plan.add_container(root, "inner").unwrap();
        plan.add_action(inner, "a", Box::new(RecordAction::new("a", &log)))
            .unwrap();
        plan.add_trigger(
            root,
            Box::new(FireOnce {
                label: "outer".into(),
                log: log.clone(),
                fired: false,
            }),
        )
        .unwrap();
        plan.add_trigger(
            inner,
            Box::new(FireOnce {
                label: "inner".into(),
                log: log.clone(),
                fired: false,
            }),
        )
        .unwrap();

        let ctx = ExecutionContext::new();
        rt().block_on(run_plan(&mut plan, &ctx)).unwrap();
        assert_eq!(entries(&log), ["a", "inner", "outer"]);
    }

    #[test]
    fn cancellation_stops_later_leaves_and_triggers() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let mut cancel = RecordAction::new("cancel", &log);
        cancel.cancel = true;
        plan.add_action(root, "1", Box::new(RecordAction::new("1", &log)))
            .unwrap();
        plan.add_action(root, "cancel", Box::new(cancel)).unwrap();
        plan.add_action(root, "3", Box::new(RecordAction::new("3", &log)))
            .unwrap();
        plan.add_trigger(
            root,
            Box::new(FireAfter {
                label: "T".into(),
                after: "cancel".into(),
                log: log.clone(),
            }),
        )
        .unwrap();

        let ctx = ExecutionContext::new();
        let report = rt().block_on(run_plan(&mut plan, &ctx)).unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        // The leaf after the cancellation never runs, and no trigger is
        // polled once the flag is up.
        assert_eq!(entries(&log), ["1", "cancel"]);
        assert!(report.fired_triggers.is_empty());
    }

    #[test]
    fn validation_failure_skips_node_and_continues() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let mut blocked = RecordAction::new("blocked", &log);
        blocked.issues = vec!["camera not connected".into()];
        let skipped = plan.add_action(root, "blocked", Box::new(blocked)).unwrap();
        let after = plan
            .add_action(root, "after", Box::new(RecordAction::new("after", &log)))
            .unwrap();

        let ctx = ExecutionContext::new();
        let report = rt().block_on(run_plan(&mut plan, &ctx)).unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(entries(&log), ["after"]);
        assert_eq!(report.statuses[&skipped], ItemStatus::Skipped);
        assert_eq!(report.statuses[&after], ItemStatus::Finished);
        assert_eq!(report.validation_issues.len(), 1);
        assert_eq!(report.validation_issues[0].0, "blocked");
    }

    #[test]
    fn fault_stops_run_and_teardown_still_visits_in_reverse() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let mut first = RecordAction::new("1", &log);
        first.record_teardown = true;
        let mut failing = RecordAction::new("2", &log);
        failing.fail = true;
        failing.record_teardown = true;
        let mut never = RecordAction::new("3", &log);
        never.record_teardown = true;

        let a1 = plan.add_action(root, "1", Box::new(first)).unwrap();
        let a2 = plan.add_action(root, "2", Box::new(failing)).unwrap();
        plan.add_action(root, "3", Box::new(never)).unwrap();

        let ctx = ExecutionContext::new();
        let err = rt().block_on(run_plan(&mut plan, &ctx)).unwrap_err();

        match err {
            SequenceError::Execution { node, message } => {
                assert_eq!(node, a2);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Leaf 3 never executed, but its teardown still ran, before the
        // earlier nodes' teardowns.
        assert_eq!(
            entries(&log),
            ["1", "2", "teardown 3", "teardown 2", "teardown 1"]
        );
        assert_eq!(plan.node(a1).unwrap().meta.status, ItemStatus::Finished);
        assert_eq!(plan.node(a2).unwrap().meta.status, ItemStatus::Failed);
        assert!(!plan.is_running());
    }

    #[test]
    fn plan_is_locked_while_running_and_released_after() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        plan.add_action(root, "a", Box::new(RecordAction::new("a", &log)))
            .unwrap();

        let ctx = ExecutionContext::new();
        rt().block_on(run_plan(&mut plan, &ctx)).unwrap();
        assert!(!plan.is_running());
        // Edits work again once the run is over.
        plan.add_action(root, "b", Box::new(RecordAction::new("b", &log)))
            .unwrap();
    }

    #[test]
    fn shared_subtree_runs_under_each_parent() {
        let log = log();
        let mut plan = Plan::new("p");
        let root = plan.root();
        let c1 = plan.add_container(root, "A").unwrap();
        let c2 = plan.add_container(root, "B").unwrap();
        let shared = plan
            .add_action(c1, "shared", Box::new(RecordAction::new("s", &log)))
            .unwrap();
        plan.attach_shared(c2, shared).unwrap();

        let ctx = ExecutionContext::new();
        let report = rt().block_on(run_plan(&mut plan, &ctx)).unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(entries(&log), ["s", "s"]);
    }
}
