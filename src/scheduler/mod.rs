pub mod feasible;
pub mod generic;
pub mod rank;
pub mod reconcile;
pub mod reconcile_util;
pub mod reschedule;
pub mod select;

pub use generic::{GenericScheduler, Planner};
pub use reconcile::{AllocReconciler, ReconcileResults};
pub use select::{GenericStack, SelectOptions};
