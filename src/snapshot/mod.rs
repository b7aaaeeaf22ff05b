pub mod proc_net;

use crate::flow::ConnectionObservation;

pub use proc_net::ProcNetSource;

/// Source of complete point-in-time enumerations of the live flow table.
///
/// `poll` is total: a table read failure is logged and yields an empty
/// enumeration so one failed poll never stops subsequent polls. The call is
/// a pure read with no side effects on the flow table.
pub trait SnapshotSource: Send + Sync {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Enumerates every live flow visible at the instant of the call.
    fn poll(&self) -> Vec<ConnectionObservation>;
}
