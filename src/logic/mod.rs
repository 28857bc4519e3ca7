pub mod history;
pub mod walk;

pub use history::*;
pub use walk::*;
