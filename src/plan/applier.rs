use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::EvalRouter;
use crate::error::{OrchError, Result};
use crate::model::{Plan, PlanResult, Resources};
use crate::plan::{ApplyRequest, DeploymentWrite};
use crate::scheduler::select::proposed_allocs;
use crate::state::{StateSnapshot, StateStore};

/// Check one node's part of the plan against current state.
///
/// There is no comparison of the plan's snapshot index with the latest
/// index. A plan built on an older snapshot still commits on every node
/// where it fits what is committed now, and only the nodes that no longer
/// fit are refused.
fn evaluate_node_plan(snapshot: &StateSnapshot, plan: &Plan, node_id: &str) -> std::result::Result<(), String> {
    let placed = plan.placed_on(node_id);
    // Stops are always allowed.
    if placed.is_empty() {
        return Ok(());
    }
    let node = snapshot
        .node_by_id(node_id)
        .ok_or_else(|| "node does not exist".to_string())?;

    let has_new = placed.iter().any(|a| snapshot.alloc_by_id(&a.id).is_none());
    if has_new && !node.ready_for_placements() {
        return Err(format!("node is {} and not eligible for placements", node.status));
    }

    let used = proposed_allocs(snapshot, plan, node_id)
        .iter()
        .fold(Resources::default(), |acc, a| acc.add(&a.resources));
    node.allocatable()
        .superset(&used)
        .map_err(|dimension| format!("resources exhausted: {dimension}"))
}

/// Decide which nodes of `plan` still fit `snapshot`. Rejected nodes lose
/// both their stops and their placements.
pub fn evaluate_plan(snapshot: &StateSnapshot, plan: &Plan) -> PlanResult {
    let mut result = PlanResult {
        deployment: plan.deployment.clone(),
        deployment_updates: plan.deployment_updates.clone(),
        ..Default::default()
    };

    let nodes: BTreeSet<&String> = plan
        .node_update
        .keys()
        .chain(plan.node_allocation.keys())
        .collect();
    for node_id in nodes {
        match evaluate_node_plan(snapshot, plan, node_id) {
            Ok(()) => {
                if let Some(stops) = plan.node_update.get(node_id) {
                    result.node_update.insert(node_id.clone(), stops.clone());
                }
                if let Some(allocs) = plan.node_allocation.get(node_id) {
                    result.node_allocation.insert(node_id.clone(), allocs.clone());
                }
            }
            Err(reason) => {
                tracing::debug!(eval_id = %plan.eval_id, node_id = %node_id, reason = %reason, "Plan rejected for node");
                result.rejected_nodes.push(node_id.clone());
            }
        }
    }

    // Canaries that did not make it must not be recorded on the deployment.
    if !result.rejected_nodes.is_empty() {
        if let Some(deployment) = result.deployment.as_mut() {
            let accepted: BTreeSet<&str> = result
                .node_allocation
                .values()
                .flatten()
                .map(|a| a.id.as_str())
                .collect();
            for state in deployment.task_groups.values_mut() {
                state.placed_canaries.retain(|id| {
                    accepted.contains(id.as_str()) || snapshot.alloc_by_id(id).is_some()
                });
            }
        }
    }
    result
}

/// Serializes every plan and deployment write on the leader.
pub struct PlanApplier {
    store: Arc<StateStore>,
    router: EvalRouter,
}

impl PlanApplier {
    pub fn new(store: Arc<StateStore>, router: EvalRouter) -> Self {
        Self { store, router }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<ApplyRequest>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    self.handle(request).await;
                }
            }
        }
        tracing::debug!("Plan applier stopped");
    }

    async fn handle(&self, request: ApplyRequest) {
        match request {
            ApplyRequest::SubmitPlan { plan, response_tx } => {
                let result = self.apply_plan(plan).await;
                let _ = response_tx.send(result);
            }
            ApplyRequest::UpdateDeployment { write, response_tx } => {
                let result = self.apply_deployment_write(write).await;
                let _ = response_tx.send(result);
            }
            ApplyRequest::AttachFollowup {
                alloc_id,
                eval,
                response_tx,
            } => {
                let result = self.store.attach_followup_eval(&alloc_id, eval.clone()).await;
                if result.is_ok() {
                    self.router
                        .route_committed(&self.store, std::slice::from_ref(&eval))
                        .await;
                }
                let _ = response_tx.send(result);
            }
        }
    }

    /// Commit the part of `plan` that still fits. The plan's delivery must
    /// still be outstanding; its lease restarts here so the worker can ack
    /// after a slow commit.
    pub async fn apply_plan(&self, plan: Plan) -> Result<PlanResult> {
        if let Err(err) = self
            .router
            .broker()
            .outstanding_reset(&plan.eval_id, &plan.eval_token)
            .await
        {
            return Err(OrchError::PlanRejected(format!(
                "evaluation {} is not outstanding under the plan's token: {err}",
                plan.eval_id
            )));
        }

        let snapshot = self.store.snapshot().await;
        let mut result = evaluate_plan(&snapshot, &plan);
        let (full, expected, actual) = result.full_commit(&plan);

        if result.is_no_op() && plan.followup_evals.is_empty() {
            if !full {
                result.refresh_index = snapshot.index();
            }
            return Ok(result);
        }

        let index = self
            .store
            .upsert_plan_results(&result, plan.followup_evals.clone())
            .await?;
        result.alloc_index = index;
        for allocs in result.node_allocation.values_mut() {
            for alloc in allocs.iter_mut().filter(|a| a.create_index == 0) {
                alloc.create_index = index;
            }
        }
        if !full {
            result.refresh_index = index;
            tracing::info!(
                eval_id = %plan.eval_id,
                expected,
                actual,
                rejected = result.rejected_nodes.len(),
                "Plan partially committed"
            );
        } else {
            tracing::debug!(eval_id = %plan.eval_id, index, "Plan committed");
        }

        self.router
            .route_committed(&self.store, &plan.followup_evals)
            .await;

        // Stopped allocations free capacity in their node's class.
        let snapshot = self.store.snapshot().await;
        let classes: BTreeSet<String> = result
            .node_update
            .keys()
            .filter_map(|node_id| snapshot.node_by_id(node_id))
            .map(|n| n.computed_class.clone())
            .collect();
        for class in classes {
            self.router.blocked().unblock(&class, index).await;
        }
        Ok(result)
    }

    pub async fn apply_deployment_write(&self, write: DeploymentWrite) -> Result<u64> {
        let (index, eval) = match write {
            DeploymentWrite::Status { update, eval } => {
                tracing::info!(
                    deployment_id = %update.deployment_id,
                    status = %update.status,
                    "Updating deployment status"
                );
                let index = self
                    .store
                    .update_deployment_status(update, eval.clone())
                    .await?;
                (index, eval)
            }
            DeploymentWrite::Promotion {
                deployment_id,
                groups,
                eval,
            } => {
                tracing::info!(deployment_id = %deployment_id, "Promoting deployment canaries");
                let index = self
                    .store
                    .update_deployment_promotion(&deployment_id, groups, eval.clone())
                    .await?;
                (index, eval)
            }
            DeploymentWrite::AllocHealth {
                deployment_id,
                healthy,
                unhealthy,
                status_update,
                eval,
                timestamp,
            } => {
                let index = self
                    .store
                    .update_deployment_alloc_health(
                        &deployment_id,
                        &healthy,
                        &unhealthy,
                        status_update,
                        eval.clone(),
                        timestamp,
                    )
                    .await?;
                (index, eval)
            }
        };
        if let Some(eval) = eval {
            self.router
                .route_committed(&self.store, std::slice::from_ref(&eval))
                .await;
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::{BlockedEvals, EvalBroker};
    use crate::config::BrokerConfig;
    use crate::model::test_fixtures::job;
    use crate::model::{alloc_name, Allocation, Evaluation, Node, NodeStatus, TriggerReason};

    async fn store_with_node(cpu: u64, mem: u64) -> (Arc<StateStore>, Arc<crate::model::Job>) {
        let store = Arc::new(StateStore::new());
        store
            .upsert_node(Node::new("n1", "dc1", Resources::new(cpu, mem)).with_driver("mock_driver"))
            .await
            .unwrap();
        let (_, j) = store.upsert_job(job("web", 3), None).await.unwrap();
        (store, j)
    }

    fn placement(j: &Arc<crate::model::Job>, index: u32, node: &str) -> Allocation {
        let tg = j.task_groups[0].clone();
        Allocation::new("e1", j.clone(), &tg, alloc_name("web", "web", index), node, node)
    }

    fn leased_applier(store: &Arc<StateStore>, nack_timeout_ms: u64) -> (PlanApplier, Arc<EvalBroker>) {
        let broker = Arc::new(EvalBroker::new(BrokerConfig {
            nack_timeout_ms,
            delivery_limit: 3,
            initial_nack_delay_ms: 0,
            subsequent_nack_delay_ms: 0,
        }));
        let blocked = Arc::new(BlockedEvals::new(broker.clone()));
        let applier = PlanApplier::new(store.clone(), EvalRouter::new(broker.clone(), blocked));
        (applier, broker)
    }

    #[tokio::test]
    async fn applying_a_plan_restarts_the_lease() {
        let (store, j) = store_with_node(1000, 1024).await;
        let (applier, broker) = leased_applier(&store, 200);
        broker.set_enabled(true).await;
        let eval = Evaluation::new("web", 50, TriggerReason::JobRegister);
        broker.enqueue(eval.clone()).await;
        let (_, token) = broker.dequeue(Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let mut plan = Plan::new(eval.id.clone(), token.clone(), 50);
        plan.append_alloc(placement(&j, 0, "n1"));
        applier.apply_plan(plan).await.unwrap();

        // Past the original lease, within the restarted one
        tokio::time::sleep(Duration::from_millis(120)).await;
        broker.ack(&eval.id, &token).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_rejects_plan_and_redelivers() {
        let (store, j) = store_with_node(1000, 1024).await;
        let (applier, broker) = leased_applier(&store, 50);
        broker.set_enabled(true).await;
        let eval = Evaluation::new("web", 50, TriggerReason::JobRegister);
        broker.enqueue(eval.clone()).await;
        let (_, token) = broker.dequeue(Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let mut plan = Plan::new(eval.id.clone(), token.clone(), 50);
        plan.append_alloc(placement(&j, 0, "n1"));
        let err = applier.apply_plan(plan).await.unwrap_err();
        assert!(matches!(err, OrchError::PlanRejected(_)), "got {err:?}");
        assert!(store.snapshot().await.allocs_by_job("web").is_empty());

        let (again, fresh) = broker.dequeue(Duration::from_millis(100)).await.unwrap();
        assert_eq!(again.id, eval.id);
        assert_ne!(fresh, token);
    }

    #[tokio::test]
    async fn rejects_overcommitted_node() {
        // Each placement asks for 100 cpu.
        let (store, j) = store_with_node(250, 1024).await;
        let mut plan = Plan::new("e1", "t", 50);
        for i in 0..3 {
            plan.append_alloc(placement(&j, i, "n1"));
        }
        let result = evaluate_plan(&store.snapshot().await, &plan);
        assert_eq!(result.rejected_nodes, vec!["n1".to_string()]);
        assert!(result.node_allocation.is_empty());
    }

    #[tokio::test]
    async fn stops_make_room() {
        let (store, j) = store_with_node(250, 1024).await;
        let mut first = Plan::new("e1", "t", 50);
        first.append_alloc(placement(&j, 0, "n1"));
        first.append_alloc(placement(&j, 1, "n1"));
        let result = evaluate_plan(&store.snapshot().await, &first);
        store.upsert_plan_results(&result, vec![]).await.unwrap();

        let snap = store.snapshot().await;
        let existing = snap.allocs_by_job("web");
        let mut second = Plan::new("e2", "t", 50);
        second.append_stopped_alloc(&existing[0], "alloc not needed", None, None);
        second.append_alloc(placement(&j, 2, "n1"));
        let result = evaluate_plan(&snap, &second);
        assert!(result.rejected_nodes.is_empty());
        assert!(result.full_commit(&second).0);
    }

    #[tokio::test]
    async fn missing_or_down_node_rejected_for_placements_only() {
        let (store, j) = store_with_node(1000, 1024).await;
        store
            .update_node_status("n1", NodeStatus::Down, vec![])
            .await
            .unwrap();
        let mut plan = Plan::new("e1", "t", 50);
        plan.append_alloc(placement(&j, 0, "n1"));
        plan.append_alloc(placement(&j, 1, "ghost"));
        let result = evaluate_plan(&store.snapshot().await, &plan);
        assert_eq!(result.rejected_nodes.len(), 2);

        let mut stops_only = Plan::new("e1", "t", 50);
        stops_only.append_stopped_alloc(&placement(&j, 0, "n1"), "alloc is lost", None, None);
        let result = evaluate_plan(&store.snapshot().await, &stops_only);
        assert!(result.rejected_nodes.is_empty());
        assert_eq!(result.node_update["n1"].len(), 1);
    }

    #[tokio::test]
    async fn rejected_canaries_are_dropped_from_deployment() {
        let (store, j) = store_with_node(1000, 1024).await;
        let canary = placement(&j, 0, "ghost");
        let mut deployment = crate::model::Deployment::new(&j);
        deployment.task_groups.insert(
            "web".into(),
            crate::model::DeploymentState {
                desired_canaries: 1,
                desired_total: 3,
                placed_canaries: vec![canary.id.clone()],
                ..Default::default()
            },
        );
        let mut plan = Plan::new("e1", "t", 50);
        plan.append_alloc(canary);
        plan.deployment = Some(deployment);
        let result = evaluate_plan(&store.snapshot().await, &plan);
        let d = result.deployment.unwrap();
        assert!(d.task_groups["web"].placed_canaries.is_empty());
    }
}
