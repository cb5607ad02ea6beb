//! End-to-end runs of the orchestrator against the simulated cloud.

use std::sync::Arc;
use std::time::Duration;

use eks_orchestrator::client::StackClient;
use eks_orchestrator::{
    ClusterConfig, ClusterName, CommandContext, ErrorKind, InMemoryCloud, LeafOutcome,
    Orchestrator, Region, ResourceKind, ResourceSpec, ResourceStatus, Settings, SkipReason,
    StackName,
};
use tokio_util::sync::CancellationToken;

const CLUSTER_YAML: &str = r#"
metadata:
  name: demo
  region: eu-west-1
  version: "1.30"
nodeGroups:
  - name: ng-1
    instanceType: m5.large
    minSize: 1
    maxSize: 3
  - name: ng-2
    instanceType: m5.xlarge
    minSize: 2
    maxSize: 4
    labels:
      role: batch
fargateProfiles:
  - name: fp-default
    selectors:
      - namespace: default
addons:
  - name: vpc-cni
iam:
  serviceAccounts:
    - namespace: kube-system
      name: aws-node
      attachPolicyARNs:
        - arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy
"#;

fn config(yaml: &str) -> ClusterConfig {
    ClusterConfig::from_yaml(yaml).unwrap()
}

fn orchestrator(cloud: &Arc<InMemoryCloud>) -> Orchestrator {
    Orchestrator::new(context(cloud))
}

fn context(cloud: &Arc<InMemoryCloud>) -> CommandContext {
    CommandContext::new(
        ClusterName::new("demo"),
        Region::new("eu-west-1"),
        cloud.clone(),
        cloud.clone(),
    )
}

async fn stack_names(cloud: &InMemoryCloud) -> Vec<String> {
    let mut names: Vec<String> = cloud
        .list_stacks()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name.into_inner())
        .collect();
    names.sort();
    names
}

#[tokio::test(start_paused = true)]
async fn test_create_cluster_from_scratch() {
    let cloud = Arc::new(InMemoryCloud::new());
    let orchestrator = orchestrator(&cloud);

    let outcome = orchestrator
        .create_cluster(&config(CLUSTER_YAML))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let report = outcome.report.unwrap();
    assert!(report.failed().is_empty());
    assert!(report.skipped().is_empty());

    assert_eq!(
        stack_names(&cloud).await,
        [
            "eko-demo-addon-iamserviceaccount-kube-system-aws-node",
            "eko-demo-cluster",
            "eko-demo-network",
            "eko-demo-nodegroup-ng-1",
            "eko-demo-nodegroup-ng-2",
        ]
    );

    let clusters = orchestrator.get_clusters().await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].status, ResourceStatus::Active);
    assert_eq!(
        clusters[0].owner,
        Some(StackName::new("eko-demo-cluster"))
    );

    let nodegroups = orchestrator.get(ResourceKind::NodeGroup).await.unwrap();
    assert_eq!(nodegroups.len(), 2);
    assert!(nodegroups.iter().all(|n| n.status == ResourceStatus::Active));
    assert_eq!(
        nodegroups[1].owner,
        Some(StackName::new("eko-demo-nodegroup-ng-2"))
    );

    for kind in [
        ResourceKind::FargateProfile,
        ResourceKind::Addon,
        ResourceKind::ServiceAccount,
    ] {
        let resources = orchestrator.get(kind).await.unwrap();
        assert_eq!(resources.len(), 1, "{}", kind);
        assert_eq!(resources[0].status, ResourceStatus::Active);
    }
}

#[tokio::test(start_paused = true)]
async fn test_apply_after_create_has_nothing_to_do() {
    let cloud = Arc::new(InMemoryCloud::new());
    let orchestrator = orchestrator(&cloud);
    let config = config(CLUSTER_YAML);
    orchestrator
        .create_cluster(&config)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let plan = orchestrator.plan(&config).await.unwrap();
    assert!(plan.is_empty(), "unexpected plan:\n{}", plan);

    let creates = cloud.calls("create_stack").await;
    let outcome = orchestrator.apply(&config, false).await.unwrap();
    assert!(!outcome.executed());
    assert_eq!(cloud.calls("create_stack").await, creates);
}

#[tokio::test(start_paused = true)]
async fn test_create_existing_cluster_fails() {
    let cloud = Arc::new(InMemoryCloud::new());
    let orchestrator = orchestrator(&cloud);
    let config = config(CLUSTER_YAML);
    orchestrator.create_cluster(&config).await.unwrap();

    let creates = cloud.calls("create_stack").await;
    let err = orchestrator.create_cluster(&config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(cloud.calls("create_stack").await, creates);
}

#[tokio::test(start_paused = true)]
async fn test_failed_update_does_not_block_independent_delete() {
    let cloud = Arc::new(InMemoryCloud::new());
    let orchestrator = orchestrator(&cloud);
    orchestrator
        .create_cluster(&config(CLUSTER_YAML))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    // Raise ng-1's ceiling and drop ng-2.
    let changed = CLUSTER_YAML
        .replace("    maxSize: 3\n", "    maxSize: 5\n")
        .replace(
            "  - name: ng-2\n    instanceType: m5.xlarge\n    minSize: 2\n    maxSize: 4\n    labels:\n      role: batch\n",
            "",
        );
    let changed = config(&changed);
    assert_eq!(changed.node_groups.len(), 1);

    cloud
        .fail_next_stack_operation(
            &StackName::new("eko-demo-nodegroup-ng-1"),
            "Max capacity exceeded for m5.large",
        )
        .await;

    let outcome = orchestrator.apply(&changed, false).await.unwrap();
    assert_eq!(outcome.plan.len(), 2);
    let report = outcome.report.clone().unwrap();
    assert_eq!(
        report.outcome_of("delete stack eko-demo-nodegroup-ng-2"),
        Some(&LeafOutcome::Succeeded)
    );
    assert!(matches!(
        report.outcome_of("update stack eko-demo-nodegroup-ng-1"),
        Some(LeafOutcome::Failed(_))
    ));
    assert_eq!(
        report.outcome_of("wait for nodegroup ng-1 to become ACTIVE"),
        Some(&LeafOutcome::Skipped(SkipReason::PriorFailure))
    );

    let err = outcome.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Aggregate);
    assert_eq!(err.failures().len(), 1);
    let failure = &err.failures()[0];
    assert_eq!(failure.kind(), ErrorKind::StackOperation);
    assert!(failure.to_string().contains("Max capacity exceeded"));
    assert!(failure.context().contains(&"update nodegroup ng-1".to_string()));

    let nodegroups = orchestrator.get(ResourceKind::NodeGroup).await.unwrap();
    assert_eq!(nodegroups.len(), 1);
    assert_eq!(nodegroups[0].name.as_str(), "ng-1");
    assert_eq!(nodegroups[0].summary, "m5.large min=1 max=3 desired=-");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_leaves_in_flight_unresolved_and_pending_skipped() {
    let cloud = Arc::new(InMemoryCloud::with_settle_polls(1_000));
    cloud.seed_cluster(&ClusterName::new("demo"), "1.30").await;

    let cancel = CancellationToken::new();
    let settings = Settings {
        parallel_limit: 1,
        ..Settings::default()
    };
    let orchestrator = Orchestrator::new(
        context(&cloud)
            .with_settings(settings)
            .with_cancel(cancel.clone()),
    );
    let config = config(
        r#"
metadata:
  name: demo
  region: eu-west-1
nodeGroups:
  - name: ng-1
    minSize: 1
    maxSize: 2
    nodeRoleARN: arn:aws:iam::123456789012:role/node
  - name: ng-2
    minSize: 1
    maxSize: 2
    nodeRoleARN: arn:aws:iam::123456789012:role/node
"#,
    );

    let watcher = {
        let cloud = cloud.clone();
        tokio::spawn(async move {
            while cloud.calls("create_stack").await < 1 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            cancel.cancel();
        })
    };

    let outcome = orchestrator.apply(&config, false).await.unwrap();
    watcher.await.unwrap();

    let report = outcome.report.clone().unwrap();
    assert_eq!(
        report.outcome_of("create stack eko-demo-nodegroup-ng-1"),
        Some(&LeafOutcome::Unresolved)
    );
    assert_eq!(
        report.outcome_of("create stack eko-demo-nodegroup-ng-2"),
        Some(&LeafOutcome::Skipped(SkipReason::Cancelled))
    );
    assert_eq!(
        report.outcome_of("wait for nodegroup ng-1 to become ACTIVE"),
        Some(&LeafOutcome::Skipped(SkipReason::Cancelled))
    );
    assert_eq!(cloud.calls("create_stack").await, 1);

    let err = outcome.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    let message = err.to_string();
    assert!(message.contains("create stack eko-demo-nodegroup-ng-1"));
    assert!(message.contains("create stack eko-demo-nodegroup-ng-2"));
}

#[tokio::test(start_paused = true)]
async fn test_rolling_nodegroup_replacement() {
    let cloud = Arc::new(InMemoryCloud::new());
    let orchestrator = orchestrator(&cloud);
    orchestrator
        .create_cluster(&config(CLUSTER_YAML))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let rolled = config(&CLUSTER_YAML.replace(
        "  - name: ng-1\n    instanceType: m5.large\n",
        "  - name: ng-1b\n    replaces: ng-1\n    instanceType: m5.large\n",
    ));
    let outcome = orchestrator
        .apply(&rolled, false)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(outcome
        .tree
        .contains("replace nodegroup ng-1 with nodegroup ng-1b: 2 sequential tasks"));

    let names: Vec<String> = orchestrator
        .get(ResourceKind::NodeGroup)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.name.into_inner())
        .collect();
    assert_eq!(names, ["ng-1b", "ng-2"]);
    assert!(orchestrator.plan(&rolled).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_control_plane_then_nodegroup() {
    let cloud = Arc::new(InMemoryCloud::new());
    let orchestrator = orchestrator(&cloud);
    let older = CLUSTER_YAML.replace("  version: \"1.30\"\n", "  version: \"1.29\"\n");
    orchestrator
        .create_cluster(&config(&older))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(orchestrator.get_clusters().await.unwrap()[0].version, "1.29");

    let skipping = config(&older.replace("  version: \"1.29\"\n", "  version: \"1.31\"\n"));
    let err = orchestrator.apply(&skipping, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(cloud.calls("update_cluster_version").await, 0);

    let upgraded = config(&CLUSTER_YAML.replace(
        "    maxSize: 3\n",
        "    maxSize: 3\n    version: \"1.30\"\n",
    ));
    let outcome = orchestrator
        .apply(&upgraded, false)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(outcome.plan.len(), 2);
    let upgrade = outcome.tree.find("upgrade cluster demo to 1.30").unwrap();
    let nodegroup = outcome.tree.find("update stack eko-demo-nodegroup-ng-1").unwrap();
    assert!(upgrade < nodegroup);

    let clusters = orchestrator.get_clusters().await.unwrap();
    assert_eq!(clusters[0].version, "1.30");
    assert_eq!(clusters[0].status, ResourceStatus::Active);
    let nodegroups = orchestrator.get(ResourceKind::NodeGroup).await.unwrap();
    match &nodegroups[0].spec {
        ResourceSpec::NodeGroup(ng) => assert_eq!(ng.version.as_deref(), Some("1.30")),
        other => panic!("unexpected spec: {other:?}"),
    }
    assert!(orchestrator.plan(&upgraded).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delete_cluster_removes_everything() {
    let cloud = Arc::new(InMemoryCloud::new());
    let orchestrator = orchestrator(&cloud);
    orchestrator
        .create_cluster(&config(CLUSTER_YAML))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let outcome = orchestrator
        .delete_cluster()
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(outcome.tree.contains("(best effort)"));
    assert!(stack_names(&cloud).await.is_empty());
    assert!(orchestrator.get_clusters().await.unwrap().is_empty());

    let err = orchestrator.delete_cluster().await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_delete_cluster_rerun_cleans_leftover_service_account_stack() {
    let cloud = Arc::new(InMemoryCloud::new());
    let orchestrator = orchestrator(&cloud);
    orchestrator
        .create_cluster(&config(CLUSTER_YAML))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let account_stack = "eko-demo-addon-iamserviceaccount-kube-system-aws-node";
    cloud
        .fail_next_stack_operation(&StackName::new(account_stack), "role in use")
        .await;

    let err = orchestrator
        .delete_cluster()
        .await
        .unwrap()
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Aggregate);
    assert_eq!(err.failures().len(), 1);
    assert!(err.failures()[0].to_string().contains("role in use"));
    assert_eq!(stack_names(&cloud).await, vec![account_stack.to_string()]);
    assert!(orchestrator.get_clusters().await.unwrap().is_empty());

    let outcome = orchestrator
        .delete_cluster()
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(outcome.tree.contains(&format!("delete stack {}", account_stack)));
    assert!(stack_names(&cloud).await.is_empty());

    let err = orchestrator.delete_cluster().await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_delete_nodegroup_twice() {
    let cloud = Arc::new(InMemoryCloud::new());
    let orchestrator = orchestrator(&cloud);
    orchestrator
        .create_cluster(&config(CLUSTER_YAML))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let name = eks_orchestrator::ResourceName::new("ng-2");
    orchestrator
        .delete_nodegroup(&name)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(orchestrator.get(ResourceKind::NodeGroup).await.unwrap().len(), 1);

    let err = orchestrator.delete_nodegroup(&name).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_throttling_is_absorbed() {
    let cloud = Arc::new(InMemoryCloud::new());
    let orchestrator = orchestrator(&cloud);
    cloud.throttle_next(3).await;

    orchestrator
        .create_cluster(&config(CLUSTER_YAML))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(orchestrator.plan(&config(CLUSTER_YAML)).await.unwrap().is_empty());
}
