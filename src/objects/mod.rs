//! Cached business objects and their synchronization state.

pub mod filter;
pub mod links;
mod object;
mod store;
pub mod tags;
pub mod view;
pub mod worker;

pub use filter::{CompareOp, Filter, FilterValue};
pub use links::{IncomingLink, LinkOnDelete, ObjectLink};
pub use object::{ObjectState, PpsObject, PulledDocument, ServerObjectRow};
pub use store::ObjectStore;
pub use tags::{ObjectTag, TagClass};
pub use view::{ObjectViewRow, ViewOrder, ViewQuery};
pub use worker::{SyncRequest, SyncWorker, WorkerReport};
