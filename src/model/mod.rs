pub mod branch;
pub mod commit;
pub mod common;
pub mod relationship;
pub mod structure;

pub use branch::*;
pub use commit::*;
pub use common::*;
pub use relationship::*;
pub use structure::*;
