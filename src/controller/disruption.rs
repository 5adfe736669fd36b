//! Pool Disruption Budget
//!
//! A cluster that sets `podDisruptionBudget.minAvailable` gets one
//! PodDisruptionBudget over its pool pods. A changed value replaces the
//! budget under a new name, and a removed or zero value deletes it.

use crate::controller::deployment::{APP_LABEL, APP_NAME};
use crate::crd::{cluster_selector, controller_owner, CStorPoolCluster, CSPC_LABEL};
use crate::domain::ports::ClusterApi;
use crate::error::{Error, Result};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Write needed to bring the budget in line with the cluster spec
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetChange {
    Create(PodDisruptionBudget),
    Replace {
        stale: String,
        with: PodDisruptionBudget,
    },
    Delete(String),
}

impl BudgetChange {
    pub fn describe(&self) -> String {
        match self {
            BudgetChange::Create(budget) => format!("create {}", budget_name(budget)),
            BudgetChange::Replace { stale, with } => format!("replace {} with {}", stale, budget_name(with)),
            BudgetChange::Delete(name) => format!("delete {}", name),
        }
    }
}

fn budget_name(budget: &PodDisruptionBudget) -> &str {
    budget.metadata.name.as_deref().unwrap_or_default()
}

fn min_available(budget: &PodDisruptionBudget) -> Option<i32> {
    match budget.spec.as_ref()?.min_available.as_ref()? {
        IntOrString::Int(n) => Some(*n),
        IntOrString::String(s) => s.parse().ok(),
    }
}

/// Budget for `cspc` keeping `min_available` pool pods up
pub fn build_disruption_budget(
    cspc: &CStorPoolCluster,
    namespace: &str,
    min_available: i32,
) -> Result<PodDisruptionBudget> {
    let owner = controller_owner(cspc)
        .ok_or_else(|| Error::Internal(format!("cstorpoolcluster {} has no uid", cspc.name())))?;

    Ok(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(format!("{}-pdb-{}", cspc.name(), min_available)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(CSPC_LABEL.to_string(), cspc.name().to_string())])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available)),
            selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([
                    (CSPC_LABEL.to_string(), cspc.name().to_string()),
                    (APP_LABEL.to_string(), APP_NAME.to_string()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Compare the existing budgets of `cspc` against its spec. More than one
/// budget is left alone and reported, since picking one would be a guess.
pub fn plan_disruption_budget(
    cspc: &CStorPoolCluster,
    namespace: &str,
    existing: &[PodDisruptionBudget],
) -> Result<Option<BudgetChange>> {
    if existing.len() > 1 {
        warn!(count = existing.len(), "more than one pod disruption budget for cluster");
        return Ok(None);
    }

    let desired = cspc
        .spec
        .pod_disruption_budget
        .as_ref()
        .map(|b| b.min_available)
        .filter(|n| *n > 0);

    let change = match (existing.first(), desired) {
        (None, None) => None,
        (None, Some(n)) => Some(BudgetChange::Create(build_disruption_budget(cspc, namespace, n)?)),
        (Some(current), None) => Some(BudgetChange::Delete(budget_name(current).to_string())),
        (Some(current), Some(n)) if min_available(current) == Some(n) => None,
        (Some(current), Some(n)) => Some(BudgetChange::Replace {
            stale: budget_name(current).to_string(),
            with: build_disruption_budget(cspc, namespace, n)?,
        }),
    };
    Ok(change)
}

/// Read the budgets currently selecting `cspc`
pub async fn observe_disruption_budget(
    api: &dyn ClusterApi,
    cspc: &CStorPoolCluster,
    namespace: &str,
) -> Result<Option<BudgetChange>> {
    let existing = api
        .list_disruption_budgets(namespace, &cluster_selector(cspc.name()))
        .await?;
    plan_disruption_budget(cspc, namespace, &existing)
}

/// Perform a planned change. A budget already gone or already created
/// counts as done.
pub async fn apply_budget_change(api: &dyn ClusterApi, namespace: &str, change: &BudgetChange) -> Result<()> {
    let (stale, fresh) = match change {
        BudgetChange::Create(budget) => (None, Some(budget)),
        BudgetChange::Replace { stale, with } => (Some(stale), Some(with)),
        BudgetChange::Delete(name) => (Some(name), None),
    };

    if let Some(name) = stale {
        match api.delete_disruption_budget(namespace, name).await {
            Ok(()) => info!(budget = %name, "deleted pod disruption budget"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    if let Some(budget) = fresh {
        match api.create_disruption_budget(namespace, budget).await {
            Ok(_) => info!(budget = %budget_name(budget), "created pod disruption budget"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::crd::{CStorPoolClusterSpec, PoolDisruptionBudget};
    use assert_matches::assert_matches;

    const NS: &str = "openebs";

    fn cluster(min_available: Option<i32>) -> CStorPoolCluster {
        let mut cspc = CStorPoolCluster::new(
            "cspc-a",
            CStorPoolClusterSpec {
                pod_disruption_budget: min_available.map(|min_available| PoolDisruptionBudget { min_available }),
                ..Default::default()
            },
        );
        cspc.metadata.uid = Some("cspc-a-uid".to_string());
        cspc
    }

    #[test]
    fn test_budget_shape() {
        let budget = build_disruption_budget(&cluster(Some(2)), NS, 2).unwrap();
        assert_eq!(budget.metadata.name.as_deref(), Some("cspc-a-pdb-2"));
        assert_eq!(
            budget.metadata.labels.unwrap().get(CSPC_LABEL).map(String::as_str),
            Some("cspc-a")
        );
        let owner = &budget.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.block_owner_deletion, Some(true));

        let spec = budget.spec.unwrap();
        assert_eq!(spec.min_available, Some(IntOrString::Int(2)));
        let selector = spec.selector.unwrap().match_labels.unwrap();
        assert_eq!(selector.get(CSPC_LABEL).map(String::as_str), Some("cspc-a"));
        assert_eq!(selector.get(APP_LABEL).map(String::as_str), Some(APP_NAME));
    }

    #[test]
    fn test_plan() {
        let current = build_disruption_budget(&cluster(Some(1)), NS, 1).unwrap();

        assert_eq!(plan_disruption_budget(&cluster(None), NS, &[]).unwrap(), None);
        assert_eq!(plan_disruption_budget(&cluster(Some(0)), NS, &[]).unwrap(), None);
        assert_matches!(
            plan_disruption_budget(&cluster(Some(1)), NS, &[]).unwrap(),
            Some(BudgetChange::Create(_))
        );
        assert_eq!(
            plan_disruption_budget(&cluster(Some(1)), NS, &[current.clone()]).unwrap(),
            None
        );
        assert_matches!(
            plan_disruption_budget(&cluster(Some(2)), NS, &[current.clone()]).unwrap(),
            Some(BudgetChange::Replace { ref stale, ref with })
                if stale == "cspc-a-pdb-1" && budget_name(with) == "cspc-a-pdb-2"
        );
        assert_eq!(
            plan_disruption_budget(&cluster(None), NS, &[current.clone()]).unwrap(),
            Some(BudgetChange::Delete("cspc-a-pdb-1".to_string()))
        );
        assert_eq!(
            plan_disruption_budget(&cluster(Some(3)), NS, &[current.clone(), current]).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_apply_replaces_budget() {
        let store = InMemoryCluster::new();
        let cspc = cluster(Some(1));

        let change = observe_disruption_budget(&store, &cspc, NS).await.unwrap().unwrap();
        apply_budget_change(&store, NS, &change).await.unwrap();
        assert_eq!(store.disruption_budgets(NS).len(), 1);
        assert_eq!(observe_disruption_budget(&store, &cspc, NS).await.unwrap(), None);

        let grown = cluster(Some(2));
        let change = observe_disruption_budget(&store, &grown, NS).await.unwrap().unwrap();
        apply_budget_change(&store, NS, &change).await.unwrap();
        let budgets = store.disruption_budgets(NS);
        assert_eq!(budgets.len(), 1);
        assert_eq!(budgets[0].metadata.name.as_deref(), Some("cspc-a-pdb-2"));

        let change = observe_disruption_budget(&store, &cluster(None), NS).await.unwrap().unwrap();
        apply_budget_change(&store, NS, &change).await.unwrap();
        assert!(store.disruption_budgets(NS).is_empty());

        // Deleting what is already gone is not an error
        apply_budget_change(&store, NS, &change).await.unwrap();
    }
}
