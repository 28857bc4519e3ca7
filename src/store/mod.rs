pub mod memory;
pub mod postgres;
pub mod traits;

#[cfg(test)]
pub(crate) mod scenarios;

pub use memory::*;
pub use postgres::*;
pub use traits::*;
