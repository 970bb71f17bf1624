pub mod snapshot;
pub mod store;

pub use snapshot::StateSnapshot;
pub use store::{AllocClientUpdate, StateStore};
