//! Workspace Controller: one instance per attached cluster, continuously
//! reconciling declared `Workspace` objects into Deployment/Service/Ingress
//! triples and publishing observed status back onto the CRD.
//!
//! Shaped directly on the teacher's cluster controller
//! (`storage_operator::clusters::reconcile`): a `kube_runtime::Controller`
//! loop, a pure `planner` module deciding the next action from observed
//! state, and `actions`/`patch` doing the actual API writes. Leader election
//! is dropped — each attached cluster gets its own task inside this single
//! Host App process, so there is nothing to elect.

pub mod actions;
pub mod patch;
pub mod planner;
pub mod reconcile;

pub use reconcile::run;
