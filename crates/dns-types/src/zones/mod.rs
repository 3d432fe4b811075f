pub mod serialise;
pub mod types;

pub use types::*;
