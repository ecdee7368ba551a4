//! CassandraDatacenter resource owned by cass-operator
//!
//! Only the fields the operator reads or writes are typed. Everything else is
//! carried through `extra` so patches and snapshots never drop settings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Label carrying the Cassandra cluster name on datacenter resources
pub const CLUSTER_LABEL: &str = "cassandra.datastax.com/cluster";

/// Label carrying the datacenter name on datacenter resources
pub const DATACENTER_LABEL: &str = "cassandra.datastax.com/datacenter";

/// `cassandraOperatorProgress` value once the datacenter is reconciled
pub const PROGRESS_READY: &str = "Ready";

/// Condition types reported by cass-operator
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_UPDATING: &str = "Updating";

/// Rack name cass-operator uses when the spec declares none
const DEFAULT_RACK: &str = "default";

/// CassandraDatacenter specification (partial)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cassandra.datastax.com",
    version = "v1beta1",
    kind = "CassandraDatacenter",
    plural = "cassandradatacenters",
    namespaced,
    status = "CassandraDatacenterStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDatacenterSpec {
    /// Cassandra cluster name
    pub cluster_name: String,

    /// Number of nodes
    #[serde(default)]
    pub size: i32,

    /// Scale every rack to zero when true
    #[serde(default)]
    pub stopped: bool,

    /// Racks making up the datacenter
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub racks: Vec<Rack>,

    /// Racks whose StatefulSets are re-applied even when unchanged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub force_upgrade_racks: Vec<String>,

    /// Template merged into every Cassandra pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template_spec: Option<PodTemplateSpec>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Rack definition
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Rack {
    pub name: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// CassandraDatacenter status (partial)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDatacenterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassandra_operator_progress: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DatacenterCondition>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Datacenter status condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CassandraDatacenter {
    /// Name of the headless service selecting every pod of the datacenter
    pub fn all_pods_service_name(&self) -> String {
        format!(
            "{}-{}-all-pods-service",
            cleanup_for_kubernetes(&self.spec.cluster_name),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Look up a status condition by type
    pub fn condition(&self, type_: &str) -> Option<&DatacenterCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
    }

    /// cass-operator finished reconciling and reports the Ready condition
    pub fn is_ready(&self) -> bool {
        let progress_ready = self
            .status
            .as_ref()
            .and_then(|s| s.cassandra_operator_progress.as_deref())
            == Some(PROGRESS_READY);

        progress_ready
            && self
                .condition(CONDITION_READY)
                .is_some_and(|c| c.status == "True")
    }

    /// The Updating condition went False strictly after `since`
    pub fn updated_after(&self, since: DateTime<Utc>) -> bool {
        self.condition(CONDITION_UPDATING).is_some_and(|c| {
            c.status == "False" && c.last_transition_time.is_some_and(|t| t > since)
        })
    }

    /// Names of every rack, including the implicit default rack
    pub fn rack_names(&self) -> Vec<String> {
        if self.spec.racks.is_empty() {
            vec![DEFAULT_RACK.to_string()]
        } else {
            self.spec.racks.iter().map(|r| r.name.clone()).collect()
        }
    }

    /// Labels carried by every StatefulSet and pod of this datacenter
    pub fn datacenter_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CLUSTER_LABEL.to_string(), self.spec.cluster_name.clone()),
            (
                DATACENTER_LABEL.to_string(),
                self.metadata.name.clone().unwrap_or_default(),
            ),
        ])
    }
}

/// Normalize a cluster name the way cass-operator does for resource names
fn cleanup_for_kubernetes(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kube::core::ObjectMeta;

    fn datacenter(conditions: Vec<DatacenterCondition>, progress: Option<&str>) -> CassandraDatacenter {
        CassandraDatacenter {
            metadata: ObjectMeta {
                name: Some("dc1".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: CassandraDatacenterSpec {
                cluster_name: "Test Cluster".to_string(),
                size: 3,
                ..Default::default()
            },
            status: Some(CassandraDatacenterStatus {
                cassandra_operator_progress: progress.map(str::to_string),
                conditions,
                ..Default::default()
            }),
        }
    }

    fn condition(type_: &str, status: &str, at: Option<DateTime<Utc>>) -> DatacenterCondition {
        DatacenterCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: at,
            ..Default::default()
        }
    }

    #[test]
    fn service_name_uses_cleaned_cluster_name() {
        let dc = datacenter(vec![], None);
        assert_eq!(dc.all_pods_service_name(), "test-cluster-dc1-all-pods-service");
    }

    #[test]
    fn labels_keep_cluster_name_as_written() {
        let mut dc = datacenter(vec![], None);
        dc.spec.cluster_name = "MyCluster".to_string();
        let labels = dc.datacenter_labels();
        assert_eq!(labels[CLUSTER_LABEL], "MyCluster");
        assert_eq!(labels[DATACENTER_LABEL], "dc1");
        assert_eq!(dc.all_pods_service_name(), "mycluster-dc1-all-pods-service");
    }

    #[test]
    fn ready_requires_progress_and_condition() {
        let ready = condition(CONDITION_READY, "True", None);
        assert!(datacenter(vec![ready.clone()], Some("Ready")).is_ready());
        assert!(!datacenter(vec![ready], Some("Updating")).is_ready());
        assert!(!datacenter(vec![], Some("Ready")).is_ready());
    }

    #[test]
    fn updated_after_rejects_transition_at_or_before_reference() {
        let start = Utc::now();
        let stale = datacenter(vec![condition(CONDITION_UPDATING, "False", Some(start))], None);
        assert!(!stale.updated_after(start));

        let earlier = datacenter(
            vec![condition(CONDITION_UPDATING, "False", Some(start - Duration::seconds(5)))],
            None,
        );
        assert!(!earlier.updated_after(start));

        let fresh = datacenter(
            vec![condition(CONDITION_UPDATING, "False", Some(start + Duration::seconds(10)))],
            None,
        );
        assert!(fresh.updated_after(start));

        let still_updating = datacenter(
            vec![condition(CONDITION_UPDATING, "True", Some(start + Duration::seconds(10)))],
            None,
        );
        assert!(!still_updating.updated_after(start));
    }

    #[test]
    fn implicit_default_rack() {
        let mut dc = datacenter(vec![], None);
        assert_eq!(dc.rack_names(), vec!["default".to_string()]);

        dc.spec.racks = vec![Rack {
            name: "rack1".to_string(),
            ..Default::default()
        }];
        assert_eq!(dc.rack_names(), vec!["rack1".to_string()]);
    }

    #[test]
    fn unknown_spec_fields_survive_round_trip() {
        let raw = serde_json::json!({
            "clusterName": "k8ssandra",
            "size": 3,
            "serverVersion": "3.11.7",
            "racks": [{"name": "rack1", "nodeAffinityLabels": {"zone": "a"}}]
        });
        let spec: CassandraDatacenterSpec = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(spec.extra["serverVersion"], "3.11.7");
        assert_eq!(serde_json::to_value(&spec).unwrap()["racks"], raw["racks"]);
    }
}
