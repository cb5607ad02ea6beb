//! Stack templates, one builder per [`StackPurpose`].
//!
//! Templates are JSON documents in the usual infrastructure-as-code shape:
//! `Parameters`, `Resources` and `Outputs`, with `Ref` / `Fn::GetAtt` /
//! `Fn::Join` intrinsics resolved by the stack service.

use serde_json::{Value, json};
use std::collections::BTreeMap;

use super::{Capability, StackPurpose, StackSpec};
use crate::core::StackOutputs;
use crate::error::{Error, Failure, Result};
use crate::model::{NodeGroupSpec, ServiceAccountSpec};
use crate::types::{ClusterName, StackName};

pub const OUTPUT_CLUSTER_ROLE: &str = "ClusterRoleARN";
pub const OUTPUT_NODE_ROLE: &str = "NodeRoleARN";
pub const OUTPUT_SUBNETS: &str = "SubnetIds";
pub const OUTPUT_VPC: &str = "VpcId";
pub const OUTPUT_SERVICE_ACCOUNT_ROLE: &str = "Role1";

pub const PARAM_NAMESPACE: &str = "Namespace";
pub const PARAM_SERVICE_ACCOUNT: &str = "ServiceAccountName";
pub const PARAM_POLICIES: &str = "AttachPolicyARNs";
pub const PARAM_ROLE_NAME: &str = "RoleName";

pub const EKS_CLUSTER_TYPE: &str = "AWS::EKS::Cluster";
pub const EKS_NODEGROUP_TYPE: &str = "AWS::EKS::Nodegroup";

const SUBNET_ZONES: [&str; 3] = ["a", "b", "c"];

fn string_param() -> Value {
    json!({ "Type": "String" })
}

fn list_param() -> Value {
    json!({ "Type": "CommaDelimitedList" })
}

/// VPC, one subnet per zone, and the cluster and node IAM roles.
pub fn network_stack(cluster: &ClusterName) -> StackSpec {
    let purpose = StackPurpose::Network;
    let mut resources = serde_json::Map::new();
    resources.insert(
        "VPC".into(),
        json!({
            "Type": "AWS::EC2::VPC",
            "Properties": { "CidrBlock": "192.168.0.0/16" }
        }),
    );
    let mut subnet_refs = Vec::new();
    for (i, zone) in SUBNET_ZONES.iter().enumerate() {
        let logical = format!("Subnet{}", zone.to_uppercase());
        resources.insert(
            logical.clone(),
            json!({
                "Type": "AWS::EC2::Subnet",
                "Properties": {
                    "VpcId": { "Ref": "VPC" },
                    "CidrBlock": format!("192.168.{}.0/19", i * 32),
                    "AvailabilityZoneSuffix": zone,
                }
            }),
        );
        subnet_refs.push(json!({ "Ref": logical }));
    }
    resources.insert(
        "ClusterRole".into(),
        json!({
            "Type": "AWS::IAM::Role",
            "Properties": {
                "AssumeRolePolicyDocument": assume_role("eks.amazonaws.com"),
                "ManagedPolicyArns": ["arn:aws:iam::aws:policy/AmazonEKSClusterPolicy"],
            }
        }),
    );
    resources.insert(
        "NodeRole".into(),
        json!({
            "Type": "AWS::IAM::Role",
            "Properties": {
                "AssumeRolePolicyDocument": assume_role("ec2.amazonaws.com"),
                "ManagedPolicyArns": [
                    "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
                    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
                ],
            }
        }),
    );

    let template = json!({
        "Description": format!("network and IAM for cluster {}", cluster),
        "Resources": resources,
        "Outputs": {
            OUTPUT_VPC: { "Value": { "Ref": "VPC" } },
            OUTPUT_SUBNETS: { "Value": { "Fn::Join": [",", subnet_refs] } },
            OUTPUT_CLUSTER_ROLE: { "Value": { "Fn::GetAtt": ["ClusterRole", "Arn"] } },
            OUTPUT_NODE_ROLE: { "Value": { "Fn::GetAtt": ["NodeRole", "Arn"] } },
        }
    });

    StackSpec {
        name: purpose.stack_name(cluster),
        template,
        parameters: BTreeMap::new(),
        capabilities: vec![Capability::Iam],
        tags: purpose.tags(cluster),
    }
}

/// Control plane placed into the network stack's subnets.
pub fn cluster_stack(
    cluster: &ClusterName,
    version: &str,
    network: &StackName,
    outputs: &StackOutputs,
) -> Result<StackSpec> {
    let purpose = StackPurpose::Cluster;
    let mut parameters = BTreeMap::new();
    parameters.insert(
        OUTPUT_CLUSTER_ROLE.to_string(),
        required_output(network, outputs, OUTPUT_CLUSTER_ROLE)?,
    );
    parameters.insert(
        OUTPUT_SUBNETS.to_string(),
        required_output(network, outputs, OUTPUT_SUBNETS)?,
    );

    let template = json!({
        "Description": format!("control plane for cluster {}", cluster),
        "Parameters": {
            OUTPUT_CLUSTER_ROLE: string_param(),
            OUTPUT_SUBNETS: list_param(),
        },
        "Resources": {
            "ControlPlane": {
                "Type": EKS_CLUSTER_TYPE,
                "Properties": {
                    "Name": cluster.as_str(),
                    "Version": version,
                    "RoleArn": { "Ref": OUTPUT_CLUSTER_ROLE },
                    "ResourcesVpcConfig": { "SubnetIds": { "Ref": OUTPUT_SUBNETS } },
                }
            }
        },
        "Outputs": {
            "ClusterName": { "Value": { "Ref": "ControlPlane" } },
        }
    });

    Ok(StackSpec {
        name: purpose.stack_name(cluster),
        template,
        parameters,
        capabilities: Vec::new(),
        tags: purpose.tags(cluster),
    })
}

/// Where a node group's instances go and which role they assume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeNetwork {
    pub node_role_arn: String,
    pub subnets: Vec<String>,
}

/// Managed node group. An explicit `nodeRoleARN` on the spec wins over the
/// network role.
pub fn nodegroup_stack(
    cluster: &ClusterName,
    spec: &NodeGroupSpec,
    network: &NodeNetwork,
) -> StackSpec {
    let purpose = StackPurpose::NodeGroup(spec.name.clone());
    let mut parameters = BTreeMap::new();
    parameters.insert(
        OUTPUT_NODE_ROLE.to_string(),
        spec.node_role_arn
            .clone()
            .unwrap_or_else(|| network.node_role_arn.clone()),
    );
    parameters.insert(OUTPUT_SUBNETS.to_string(), network.subnets.join(","));

    let mut scaling = serde_json::Map::new();
    scaling.insert("MinSize".into(), json!(spec.min_size));
    scaling.insert("MaxSize".into(), json!(spec.max_size));
    if let Some(desired) = spec.desired_capacity {
        scaling.insert("DesiredSize".into(), json!(desired));
    }

    let mut template = json!({
        "Description": format!("nodegroup {} for cluster {}", spec.name, cluster),
        "Parameters": {
            OUTPUT_NODE_ROLE: string_param(),
            OUTPUT_SUBNETS: list_param(),
        },
        "Resources": {
            "ManagedNodeGroup": {
                "Type": EKS_NODEGROUP_TYPE,
                "Properties": {
                    "ClusterName": cluster.as_str(),
                    "NodegroupName": spec.name.as_str(),
                    "InstanceTypes": [spec.instance_type],
                    "ScalingConfig": scaling,
                    "Labels": spec.labels,
                    "NodeRole": { "Ref": OUTPUT_NODE_ROLE },
                    "Subnets": { "Ref": OUTPUT_SUBNETS },
                }
            }
        }
    });
    if let Some(version) = &spec.version {
        template["Resources"]["ManagedNodeGroup"]["Properties"]["Version"] = json!(version);
    }

    StackSpec {
        name: purpose.stack_name(cluster),
        template,
        parameters,
        capabilities: Vec::new(),
        tags: purpose.tags(cluster),
    }
}

/// IAM role for a Kubernetes service account. The account identity and the
/// attached policies are carried as parameters so the stack alone describes
/// the resource.
pub fn service_account_stack(cluster: &ClusterName, spec: &ServiceAccountSpec) -> StackSpec {
    let purpose = StackPurpose::ServiceAccount {
        namespace: spec.namespace.clone(),
        name: spec.name.clone(),
    };
    let policies: Vec<&str> = spec.attach_policy_arns.iter().map(String::as_str).collect();

    let mut parameters = BTreeMap::new();
    parameters.insert(PARAM_NAMESPACE.to_string(), spec.namespace.clone());
    parameters.insert(PARAM_SERVICE_ACCOUNT.to_string(), spec.name.clone());
    parameters.insert(PARAM_POLICIES.to_string(), policies.join(","));
    if let Some(role_name) = &spec.role_name {
        parameters.insert(PARAM_ROLE_NAME.to_string(), role_name.clone());
    }

    let mut role = serde_json::Map::new();
    role.insert(
        "AssumeRolePolicyDocument".into(),
        assume_role("pods.eks.amazonaws.com"),
    );
    role.insert("ManagedPolicyArns".into(), json!({ "Ref": PARAM_POLICIES }));
    if spec.role_name.is_some() {
        role.insert("RoleName".into(), json!({ "Ref": PARAM_ROLE_NAME }));
    }

    let template = json!({
        "Description": format!(
            "IAM role for serviceaccount {}/{} in cluster {}",
            spec.namespace, spec.name, cluster
        ),
        "Parameters": {
            PARAM_NAMESPACE: string_param(),
            PARAM_SERVICE_ACCOUNT: string_param(),
            PARAM_POLICIES: list_param(),
            PARAM_ROLE_NAME: string_param(),
        },
        "Resources": {
            "Role1": { "Type": "AWS::IAM::Role", "Properties": role }
        },
        "Outputs": {
            OUTPUT_SERVICE_ACCOUNT_ROLE: { "Value": { "Fn::GetAtt": ["Role1", "Arn"] } },
        }
    });

    StackSpec {
        name: purpose.stack_name(cluster),
        template,
        parameters,
        capabilities: vec![Capability::Iam, Capability::NamedIam],
        tags: purpose.tags(cluster),
    }
}

fn assume_role(service: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": [service] },
            "Action": ["sts:AssumeRole"],
        }]
    })
}

fn required_output(stack: &StackName, outputs: &StackOutputs, key: &str) -> Result<String> {
    outputs.get(key).cloned().ok_or_else(|| {
        Error::new(Failure::MissingOutput {
            stack: stack.clone(),
            key: key.to_string(),
        })
    })
}

/// Read a service account back from its stack's parameters.
pub fn service_account_from_parameters(
    parameters: &BTreeMap<String, String>,
) -> Option<ServiceAccountSpec> {
    Some(ServiceAccountSpec {
        namespace: parameters.get(PARAM_NAMESPACE)?.clone(),
        name: parameters.get(PARAM_SERVICE_ACCOUNT)?.clone(),
        attach_policy_arns: parameters
            .get(PARAM_POLICIES)
            .map(|p| crate::core::split_list_output(p).into_iter().collect())
            .unwrap_or_default(),
        role_name: parameters.get(PARAM_ROLE_NAME).cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::ResourceName;
    use std::collections::BTreeSet;

    fn cluster() -> ClusterName {
        ClusterName::new("demo")
    }

    #[test]
    fn test_network_stack_declares_outputs() {
        let spec = network_stack(&cluster());
        assert_eq!(spec.name.as_str(), "eko-demo-network");
        let outputs = spec.template["Outputs"].as_object().unwrap();
        for key in [OUTPUT_CLUSTER_ROLE, OUTPUT_NODE_ROLE, OUTPUT_SUBNETS, OUTPUT_VPC] {
            assert!(outputs.contains_key(key), "missing output {key}");
        }
        assert_eq!(spec.capabilities, vec![Capability::Iam]);
    }

    #[test]
    fn test_cluster_stack_requires_network_outputs() {
        let network = StackName::new("eko-demo-network");
        let mut outputs = StackOutputs::new();
        outputs.insert(OUTPUT_CLUSTER_ROLE.into(), "arn:role/cluster".into());

        let err = cluster_stack(&cluster(), "1.30", &network, &outputs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        outputs.insert(OUTPUT_SUBNETS.into(), "subnet-a,subnet-b".into());
        let spec = cluster_stack(&cluster(), "1.30", &network, &outputs).unwrap();
        assert_eq!(spec.parameters[OUTPUT_SUBNETS], "subnet-a,subnet-b");
        assert_eq!(
            spec.template["Resources"]["ControlPlane"]["Properties"]["Version"],
            "1.30"
        );
    }

    #[test]
    fn test_nodegroup_role_override() {
        let network = NodeNetwork {
            node_role_arn: "arn:role/node".into(),
            subnets: vec!["subnet-a".into(), "subnet-b".into()],
        };
        let mut ng = NodeGroupSpec {
            name: ResourceName::new("ng-1"),
            instance_type: "m5.large".into(),
            min_size: 1,
            max_size: 3,
            desired_capacity: None,
            labels: BTreeMap::new(),
            node_role_arn: None,
            version: None,
            replaces: None,
        };
        let spec = nodegroup_stack(&cluster(), &ng, &network);
        assert_eq!(spec.parameters[OUTPUT_NODE_ROLE], "arn:role/node");
        assert_eq!(spec.parameters[OUTPUT_SUBNETS], "subnet-a,subnet-b");
        let scaling = &spec.template["Resources"]["ManagedNodeGroup"]["Properties"]["ScalingConfig"];
        assert!(scaling.get("DesiredSize").is_none());

        ng.node_role_arn = Some("arn:role/custom".into());
        let spec = nodegroup_stack(&cluster(), &ng, &network);
        assert_eq!(spec.parameters[OUTPUT_NODE_ROLE], "arn:role/custom");
    }

    #[test]
    fn test_nodegroup_version_only_when_pinned() {
        let network = NodeNetwork {
            node_role_arn: "arn:role/node".into(),
            subnets: vec!["subnet-a".into()],
        };
        let mut ng = NodeGroupSpec {
            name: ResourceName::new("ng-1"),
            instance_type: "m5.large".into(),
            min_size: 1,
            max_size: 3,
            desired_capacity: None,
            labels: BTreeMap::new(),
            node_role_arn: None,
            version: None,
            replaces: None,
        };
        let properties = |spec: &StackSpec| {
            spec.template["Resources"]["ManagedNodeGroup"]["Properties"].clone()
        };
        let unpinned = nodegroup_stack(&cluster(), &ng, &network);
        assert!(properties(&unpinned).get("Version").is_none());

        ng.version = Some("1.29".into());
        assert_eq!(properties(&nodegroup_stack(&cluster(), &ng, &network))["Version"], "1.29");
    }

    #[test]
    fn test_service_account_parameters_round_trip() {
        let sa = ServiceAccountSpec {
            namespace: "kube-system".into(),
            name: "aws-node".into(),
            attach_policy_arns: BTreeSet::from([
                "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy".to_string(),
            ]),
            role_name: None,
        };
        let spec = service_account_stack(&cluster(), &sa);
        assert_eq!(
            spec.capabilities,
            vec![Capability::Iam, Capability::NamedIam]
        );
        assert_eq!(service_account_from_parameters(&spec.parameters), Some(sa));
    }
}
