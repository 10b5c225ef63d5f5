//! Readiness rules for live Kubernetes objects.
//!
//! Objects are evaluated from their JSON representation so the same rules
//! work for any `DynamicObject` the API returns.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Health of one object, or of a whole unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum UnitHealth {
    Ready,
    /// Not ready yet; may still converge.
    Progressing(String),
    /// Will not converge without operator action.
    Failed(String),
}

impl UnitHealth {
    /// Combine per-object health into a unit health.
    ///
    /// Any failure wins, then the first progressing object, else ready.
    #[must_use]
    pub fn combine<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = (String, Self)>,
    {
        let mut progressing = None;
        for (resource, health) in parts {
            match health {
                Self::Ready => {}
                Self::Failed(reason) => return Self::Failed(format!("{resource}: {reason}")),
                Self::Progressing(reason) => {
                    progressing.get_or_insert_with(|| format!("{resource}: {reason}"));
                }
            }
        }
        progressing.map_or(Self::Ready, Self::Progressing)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

fn int_at(object: &Value, pointer: &str) -> Option<i64> {
    object.pointer(pointer).and_then(Value::as_i64)
}

fn str_at<'a>(object: &'a Value, pointer: &str) -> Option<&'a str> {
    object.pointer(pointer).and_then(Value::as_str)
}

/// Find a `status.conditions` entry by type.
fn condition<'a>(object: &'a Value, kind: &str) -> Option<&'a Value> {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))
}

fn condition_true(object: &Value, kind: &str) -> bool {
    condition(object, kind)
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        == Some("True")
}

fn generation_observed(object: &Value) -> bool {
    match (
        int_at(object, "/metadata/generation"),
        int_at(object, "/status/observedGeneration"),
    ) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

/// Evaluate readiness of a live object of the given kind.
#[must_use]
pub fn evaluate(kind: &str, object: &Value) -> UnitHealth {
    match kind {
        "Deployment" => deployment(object),
        "StatefulSet" => statefulset(object),
        "DaemonSet" => daemonset(object),
        "Namespace" => namespace(object),
        "Job" => job(object),
        "PersistentVolumeClaim" => pvc(object),
        "Pod" => pod(object),
        _ => UnitHealth::Ready,
    }
}

/// Readiness of a Service, judged by the Endpoints object of the same name.
///
/// `ExternalName` services and services without a selector have no managed
/// endpoints; they are ready once they exist.
#[must_use]
pub fn service(service: &Value, endpoints: Option<&Value>) -> UnitHealth {
    let has_selector = service
        .pointer("/spec/selector")
        .and_then(Value::as_object)
        .is_some_and(|selector| !selector.is_empty());
    if str_at(service, "/spec/type") == Some("ExternalName") || !has_selector {
        return UnitHealth::Ready;
    }

    let Some(endpoints) = endpoints else {
        return UnitHealth::Progressing("no endpoints yet".to_string());
    };
    let subsets = endpoints
        .pointer("/subsets")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let count = |key: &str| -> usize {
        subsets
            .iter()
            .filter_map(|subset| subset.get(key).and_then(Value::as_array))
            .map(Vec::len)
            .sum()
    };

    let ready = count("addresses");
    let not_ready = count("notReadyAddresses");
    if ready > 0 {
        UnitHealth::Ready
    } else if not_ready > 0 {
        UnitHealth::Progressing(format!("0 of {not_ready} endpoints ready"))
    } else {
        UnitHealth::Progressing("no ready endpoints".to_string())
    }
}

fn replicas_ready(object: &Value) -> UnitHealth {
    let desired = int_at(object, "/spec/replicas").unwrap_or(1);
    let updated = int_at(object, "/status/updatedReplicas").unwrap_or(0);
    let ready = int_at(object, "/status/readyReplicas").unwrap_or(0);

    if updated < desired {
        UnitHealth::Progressing(format!("{updated} of {desired} replicas updated"))
    } else if ready < desired {
        UnitHealth::Progressing(format!("{ready} of {desired} replicas ready"))
    } else {
        UnitHealth::Ready
    }
}

fn deployment(object: &Value) -> UnitHealth {
    if let Some(progressing) = condition(object, "Progressing") {
        if progressing.get("reason").and_then(Value::as_str) == Some("ProgressDeadlineExceeded") {
            return UnitHealth::Failed("exceeded its progress deadline".to_string());
        }
    }
    if !generation_observed(object) {
        return UnitHealth::Progressing("rollout not yet observed".to_string());
    }
    replicas_ready(object)
}

fn statefulset(object: &Value) -> UnitHealth {
    if !generation_observed(object) {
        return UnitHealth::Progressing("rollout not yet observed".to_string());
    }
    replicas_ready(object)
}

fn daemonset(object: &Value) -> UnitHealth {
    if !generation_observed(object) {
        return UnitHealth::Progressing("rollout not yet observed".to_string());
    }
    let desired = int_at(object, "/status/desiredNumberScheduled").unwrap_or(0);
    let updated = int_at(object, "/status/updatedNumberScheduled").unwrap_or(0);
    let ready = int_at(object, "/status/numberReady").unwrap_or(0);

    if updated < desired {
        UnitHealth::Progressing(format!("{updated} of {desired} pods updated"))
    } else if ready < desired {
        UnitHealth::Progressing(format!("{ready} of {desired} pods ready"))
    } else {
        UnitHealth::Ready
    }
}

fn namespace(object: &Value) -> UnitHealth {
    match str_at(object, "/status/phase") {
        Some("Active") => UnitHealth::Ready,
        Some("Terminating") => UnitHealth::Failed("namespace is terminating".to_string()),
        other => UnitHealth::Progressing(format!("phase {}", other.unwrap_or("unknown"))),
    }
}

fn job(object: &Value) -> UnitHealth {
    if condition_true(object, "Failed") {
        let message = condition(object, "Failed")
            .and_then(|c| c.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("job failed");
        return UnitHealth::Failed(message.to_string());
    }
    if condition_true(object, "Complete") || int_at(object, "/status/succeeded").unwrap_or(0) >= 1
    {
        return UnitHealth::Ready;
    }
    UnitHealth::Progressing("job has not completed".to_string())
}

fn pvc(object: &Value) -> UnitHealth {
    match str_at(object, "/status/phase") {
        Some("Bound") => UnitHealth::Ready,
        Some("Lost") => UnitHealth::Failed("claim lost its volume".to_string()),
        other => UnitHealth::Progressing(format!("claim is {}", other.unwrap_or("unbound"))),
    }
}

/// Waiting reasons that never clear on their own.
const STUCK_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

fn pod(object: &Value) -> UnitHealth {
    let statuses = object
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for status in statuses {
        if let Some(reason) = status.pointer("/state/waiting/reason").and_then(Value::as_str) {
            if STUCK_REASONS.contains(&reason) {
                let container = status.get("name").and_then(Value::as_str).unwrap_or("container");
                return UnitHealth::Failed(format!("{container} is {reason}"));
            }
        }
    }

    match str_at(object, "/status/phase") {
        Some("Succeeded") => UnitHealth::Ready,
        Some("Failed") => UnitHealth::Failed(
            str_at(object, "/status/reason")
                .unwrap_or("pod failed")
                .to_string(),
        ),
        Some("Running") if condition_true(object, "Ready") => UnitHealth::Ready,
        other => UnitHealth::Progressing(format!("pod is {}", other.unwrap_or("Pending"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deployment_ready() {
        let object = json!({
            "metadata": {"generation": 3},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 3, "updatedReplicas": 2, "readyReplicas": 2}
        });
        assert_eq!(evaluate("Deployment", &object), UnitHealth::Ready);
    }

    #[test]
    fn test_deployment_progressing() {
        let object = json!({
            "metadata": {"generation": 3},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 3, "updatedReplicas": 2, "readyReplicas": 1}
        });
        assert_eq!(
            evaluate("Deployment", &object),
            UnitHealth::Progressing("1 of 2 replicas ready".into())
        );

        let stale = json!({
            "metadata": {"generation": 4},
            "spec": {"replicas": 1},
            "status": {"observedGeneration": 3, "updatedReplicas": 1, "readyReplicas": 1}
        });
        assert!(matches!(evaluate("Deployment", &stale), UnitHealth::Progressing(_)));
    }

    #[test]
    fn test_deployment_deadline_exceeded() {
        let object = json!({
            "metadata": {"generation": 1},
            "status": {
                "observedGeneration": 1,
                "conditions": [
                    {"type": "Available", "status": "False"},
                    {"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}
                ]
            }
        });
        assert!(matches!(evaluate("Deployment", &object), UnitHealth::Failed(_)));
    }

    #[test]
    fn test_daemonset() {
        let object = json!({
            "status": {"desiredNumberScheduled": 3, "updatedNumberScheduled": 3, "numberReady": 2}
        });
        assert_eq!(
            evaluate("DaemonSet", &object),
            UnitHealth::Progressing("2 of 3 pods ready".into())
        );
    }

    #[test]
    fn test_namespace_phases() {
        let active = json!({"status": {"phase": "Active"}});
        let terminating = json!({"status": {"phase": "Terminating"}});
        assert!(evaluate("Namespace", &active).is_ready());
        assert!(matches!(evaluate("Namespace", &terminating), UnitHealth::Failed(_)));
    }

    #[test]
    fn test_job_failed_condition() {
        let object = json!({
            "status": {"conditions": [
                {"type": "Failed", "status": "True", "message": "BackoffLimitExceeded"}
            ]}
        });
        assert_eq!(
            evaluate("Job", &object),
            UnitHealth::Failed("BackoffLimitExceeded".into())
        );
        assert!(evaluate("Job", &json!({"status": {"succeeded": 1}})).is_ready());
    }

    #[test]
    fn test_pvc_phases() {
        assert!(evaluate("PersistentVolumeClaim", &json!({"status": {"phase": "Bound"}})).is_ready());
        assert!(matches!(
            evaluate("PersistentVolumeClaim", &json!({"status": {"phase": "Pending"}})),
            UnitHealth::Progressing(_)
        ));
    }

    #[test]
    fn test_pod_crash_loop_is_failed() {
        let object = json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "n8n", "state": {"waiting": {"reason": "CrashLoopBackOff"}}}
                ]
            }
        });
        assert_eq!(
            evaluate("Pod", &object),
            UnitHealth::Failed("n8n is CrashLoopBackOff".into())
        );
    }

    #[test]
    fn test_other_kinds_ready_when_present() {
        assert!(evaluate("ConfigMap", &json!({})).is_ready());
        assert!(evaluate("IngressRoute", &json!({})).is_ready());
    }

    #[test]
    fn test_service_needs_ready_endpoints() {
        let svc = json!({"spec": {"selector": {"app": "n8n"}, "ports": [{"port": 5678}]}});

        assert_eq!(
            service(&svc, None),
            UnitHealth::Progressing("no endpoints yet".into())
        );
        assert_eq!(
            service(&svc, Some(&json!({"metadata": {"name": "n8n"}}))),
            UnitHealth::Progressing("no ready endpoints".into())
        );

        let starting = json!({"subsets": [
            {"notReadyAddresses": [{"ip": "10.42.0.7"}], "ports": [{"port": 5678}]}
        ]});
        assert_eq!(
            service(&svc, Some(&starting)),
            UnitHealth::Progressing("0 of 1 endpoints ready".into())
        );

        let serving = json!({"subsets": [
            {"addresses": [{"ip": "10.42.0.7"}], "notReadyAddresses": [{"ip": "10.42.0.8"}]}
        ]});
        assert!(service(&svc, Some(&serving)).is_ready());
    }

    #[test]
    fn test_service_without_managed_endpoints() {
        let external = json!({"spec": {"type": "ExternalName", "externalName": "nas.lan"}});
        let headless_manual = json!({"spec": {"clusterIP": "None"}});
        assert!(service(&external, None).is_ready());
        assert!(service(&headless_manual, None).is_ready());
    }

    #[test]
    fn test_combine() {
        let ready = ("service/a".to_string(), UnitHealth::Ready);
        let slow = (
            "deployment/b".to_string(),
            UnitHealth::Progressing("0 of 1 replicas ready".into()),
        );
        let broken = ("pod/c".to_string(), UnitHealth::Failed("c is ErrImagePull".into()));

        assert_eq!(UnitHealth::combine(vec![ready.clone()]), UnitHealth::Ready);
        assert_eq!(
            UnitHealth::combine(vec![ready.clone(), slow.clone()]),
            UnitHealth::Progressing("deployment/b: 0 of 1 replicas ready".into())
        );
        assert_eq!(
            UnitHealth::combine(vec![slow, broken, ready]),
            UnitHealth::Failed("pod/c: c is ErrImagePull".into())
        );
    }
}
