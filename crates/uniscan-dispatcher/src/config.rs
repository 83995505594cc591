//! Scheduler instance configuration.

use uniscan_core::DispatchPolicy;

/// Prefix of generated instance ids.
const INSTANCE_PREFIX: &str = "disp_";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lease owner written into claimed rows. Must differ between instances.
    pub instance_id: String,
    pub policy: DispatchPolicy,
}

impl SchedulerConfig {
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            instance_id: generate_instance_id(),
            policy,
        }
    }

    #[must_use]
    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(DispatchPolicy::default())
    }
}

/// `disp_` followed by 12 random hex digits.
pub fn generate_instance_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{INSTANCE_PREFIX}{}", &hex[..12])
}
