pub mod common;
pub mod job;
pub mod pdb;
pub mod secret;
pub mod service;
pub mod statefulset;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, standard_labels};
