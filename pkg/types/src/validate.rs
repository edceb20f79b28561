use anyhow::{Result, bail};

use crate::hpa::ScalingSpec;
use crate::policy::PolicySpec;
use crate::task::ScalingTask;

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Replica bounds must be ordered.
pub fn validate_scaling_spec(spec: &ScalingSpec) -> Result<()> {
    if spec.min_replicas > spec.max_replicas {
        bail!(
            "min_replicas ({}) must not exceed max_replicas ({})",
            spec.min_replicas,
            spec.max_replicas
        );
    }
    Ok(())
}

/// Check a policy definition beyond what deserialization already enforces.
pub fn validate_policy(policy: &PolicySpec) -> Result<()> {
    if policy.name.trim().is_empty() {
        bail!("policy name must not be empty");
    }
    if policy.metric_name.trim().is_empty() {
        bail!("policy '{}': metric name must not be empty", policy.name);
    }
    if policy.evaluation_periods == 0 {
        bail!("policy '{}': evaluation periods must be at least 1", policy.name);
    }
    if !policy.threshold.is_finite() {
        bail!("policy '{}': threshold must be a finite number", policy.name);
    }
    Ok(())
}

/// Structural checks on a scaling task before a task is started for it.
pub fn validate_scaling_task(task: &ScalingTask) -> Result<()> {
    validate_name(&task.name)?;
    validate_name(&task.namespace)?;
    let Some(target) = task.spec.scale_target_refs.first() else {
        bail!("scaling task '{}' has no scale target refs", task.name);
    };
    validate_name(&target.name)?;
    if task.spec.refresh_interval_minutes == Some(0) {
        bail!("scaling task '{}': refresh interval must be at least 1 minute", task.name);
    }
    for policy in &task.spec.policies {
        validate_policy(policy)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpa::ScaleTargetRef;
    use crate::policy::{ComparisonOperator, ScalingAdjustment};
    use crate::task::ScalingTaskSpec;
    use chrono::Utc;

    fn make_policy(name: &str, periods: u32) -> PolicySpec {
        PolicySpec {
            name: name.to_string(),
            target: None,
            metric_name: "cpu".to_string(),
            dimensions: vec![],
            comparison_operator: ComparisonOperator::GreaterThanThreshold,
            threshold: 50.0,
            evaluation_periods: periods,
            adjustment: ScalingAdjustment::ChangeInCapacity(1),
        }
    }

    fn make_task(refs: Vec<ScaleTargetRef>) -> ScalingTask {
        ScalingTask {
            id: "t-1".to_string(),
            name: "web-task".to_string(),
            namespace: "default".to_string(),
            spec: ScalingTaskSpec {
                scale_target_refs: refs,
                ..Default::default()
            },
            resource_version: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn valid_names() {
        assert!(validate_name("nginx").is_ok());
        assert!(validate_name("my-app").is_ok());
        assert!(validate_name("app-123").is_ok());
        assert!(validate_name("a").is_ok());
        assert!(validate_name("a-b-c-d").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("My-App").is_err());
        assert!(validate_name("my_app").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name("special!char").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn scaling_spec_bounds() {
        let mut spec = ScalingSpec {
            min_replicas: 2,
            max_replicas: 5,
            ..Default::default()
        };
        assert!(validate_scaling_spec(&spec).is_ok());
        spec.min_replicas = 6;
        assert!(validate_scaling_spec(&spec).is_err());
    }

    #[test]
    fn policies() {
        assert!(validate_policy(&make_policy("cpu-high", 2)).is_ok());
        assert!(validate_policy(&make_policy("cpu-high", 0)).is_err());
        assert!(validate_policy(&make_policy(" ", 2)).is_err());
        let mut nan = make_policy("nan", 1);
        nan.threshold = f64::NAN;
        assert!(validate_policy(&nan).is_err());
    }

    #[test]
    fn scaling_task_needs_a_target() {
        assert!(validate_scaling_task(&make_task(vec![])).is_err());
        let target = ScaleTargetRef {
            name: "web-hpa".to_string(),
            ..Default::default()
        };
        assert!(validate_scaling_task(&make_task(vec![target])).is_ok());
    }
}
