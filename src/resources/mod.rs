pub mod api_server;
pub mod cache;
pub mod common;
pub mod converge;
pub mod namespace;
pub mod network_policy;
pub mod quantity;
pub mod quota;

pub use common::{
    API_VERSION, FIELD_MANAGER, KIND, namespace_name, owner_reference, standard_labels,
};
pub use converge::{Converged, Convergent, MutableField, Outcome, converge};
