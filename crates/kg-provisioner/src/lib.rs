//! kg-provisioner: ephemeral cluster provisioning with GitOps bootstrap
//!
//! [`Provisioner`] runs an ordered list of steps: prerequisite checks, a
//! delete-then-create cluster lifecycle, controller setup for the selected
//! [`Mode`](kg_core::Mode) and a final status report.

pub mod cluster;
pub mod gitops;
pub mod pipeline;

pub use cluster::ClusterLifecycle;
pub use gitops::GitOps;
pub use pipeline::{
    plan, teardown_steps, FailurePolicy, ProvisionFailure, Provisioner, RunReport, Step, StepKind,
    StepOutcome, StepRecord,
};
