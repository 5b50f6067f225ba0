pub mod selector;
pub mod types;

pub use selector::HostSelector;
pub use types::{HostLoad, Selection, SelectionContext, SelectionWeights};
