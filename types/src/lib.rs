pub mod cluster;
pub mod db;
pub mod job;
pub mod join;
pub mod workspace;

pub use cluster::{Cluster, ClusterSettings, ClusterState, ProbeCode};
pub use db::{
    AuditAction, AuditEvent, ColumnDef, ColumnType, DatabaseHandle, PermissionBinding, Role,
    TableSchema,
};
pub use job::{Job, JobKind, JobStatus};
pub use join::{ClusterJoin, HostAppJoin, JoinBundle, JoinBundleV1, JoinBundleV2, TailscaleJoin};
pub use workspace::{
    EnvVar, PortSpec, ResourceSpec, Workspace, WorkspacePhase, WorkspaceSpec, WorkspaceStatus,
};
