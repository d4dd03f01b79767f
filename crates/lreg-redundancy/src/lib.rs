//! ---
//! lreg_section: "05-leader-coordination"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Leader election and failover for registry nodes."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
//! Leader election supervisor for lreg cluster nodes.

mod member;
mod supervisor;

pub use member::{HeartbeatStatus, MemberContext, MemberRuntimeState};
pub use supervisor::{FailoverEvent, FailoverReason, RedundancySupervisor};
