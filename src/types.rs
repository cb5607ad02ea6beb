//! NewType wrappers for the identifiers that flow through the orchestrator.
//!
//! Cluster names, stack names and resource names are all plain strings on the
//! wire; wrapping them keeps a stack name from being passed where a node group
//! name is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Name of a managed Kubernetes cluster (e.g., "prod-eu").
    ClusterName
);

newtype_string!(
    /// Cloud region the cluster lives in (e.g., "eu-west-1").
    Region
);

newtype_string!(
    /// Name of an infrastructure-as-code stack.
    ///
    /// Stack names are unique per cluster and purpose; see
    /// [`crate::stack::StackPurpose::stack_name`].
    StackName
);

newtype_string!(
    /// Name of a cluster-scoped resource (node group, Fargate profile, add-on).
    ///
    /// IAM service accounts use `namespace/name` so names stay unique within
    /// their kind.
    ResourceName
);
