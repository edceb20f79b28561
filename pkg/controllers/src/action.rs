use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use pkg_types::meta::ObjectKey;
use pkg_types::policy::ScalingAdjustment;

use crate::error::ScalingError;
use crate::store::{TargetStore, bounded};

/// What an adjustment asks for, before anything touches the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    ScaleOut(u32),
    ScaleIn(u32),
    NoChange,
}

impl ScalingAction {
    /// Map an adjustment to an action.
    ///
    /// `ExactCapacity` and `PercentChangeInCapacity` are accepted in config
    /// but have no defined mutation yet.
    pub fn from_adjustment(adjustment: ScalingAdjustment) -> Result<Self, ScalingError> {
        match adjustment {
            ScalingAdjustment::ChangeInCapacity(v) if v > 0 => Ok(ScalingAction::ScaleOut(v.unsigned_abs())),
            ScalingAdjustment::ChangeInCapacity(v) if v < 0 => Ok(ScalingAction::ScaleIn(v.unsigned_abs())),
            ScalingAdjustment::ChangeInCapacity(_) => Ok(ScalingAction::NoChange),
            ScalingAdjustment::ExactCapacity(_) => {
                Err(ScalingError::NotImplemented("ExactCapacity adjustment".to_string()))
            }
            ScalingAdjustment::PercentChangeInCapacity(_) => Err(ScalingError::NotImplemented(
                "PercentChangeInCapacity adjustment".to_string(),
            )),
        }
    }
}

/// Applies policy adjustments to scaling targets through the [`TargetStore`].
pub struct ActionExecutor {
    store: Arc<dyn TargetStore>,
    call_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(store: Arc<dyn TargetStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    pub async fn execute(
        &self,
        target: &ObjectKey,
        adjustment: ScalingAdjustment,
    ) -> Result<ScalingAction, ScalingError> {
        let action = ScalingAction::from_adjustment(adjustment)?;
        match action {
            ScalingAction::ScaleOut(n) => self.scale_out(target, n).await?,
            ScalingAction::ScaleIn(n) => self.scale_in(target, n).await?,
            ScalingAction::NoChange => {
                info!("Adjustment {} on {} requires no change", adjustment, target);
            }
        }
        Ok(action)
    }

    /// Raise the target's replica floor by `n`, bounded by its ceiling.
    async fn scale_out(&self, target: &ObjectKey, n: u32) -> Result<(), ScalingError> {
        info!("Try to scale out {} instances on {}", n, target);
        let mut spec = bounded(
            "get target spec",
            self.call_timeout,
            self.store.get_target_spec(target),
        )
        .await?;

        let desired = spec.min_replicas.saturating_add(n).min(spec.max_replicas);
        if desired == spec.min_replicas {
            warn!(
                "Target {} already at max replicas ({}), scale-out skipped",
                target, spec.max_replicas
            );
            return Ok(());
        }

        let previous = spec.min_replicas;
        spec.min_replicas = desired;
        bounded(
            "update target spec",
            self.call_timeout,
            self.store.update_target_spec(target, spec),
        )
        .await?;
        info!(
            "Scaled out {}: min replicas {} -> {}",
            target, previous, desired
        );
        Ok(())
    }

    async fn scale_in(&self, target: &ObjectKey, n: u32) -> Result<(), ScalingError> {
        warn!("Scale-in of {} instances on {} requested", n, target);
        Err(ScalingError::NotImplemented("scale-in".to_string()))
    }
}
