pub mod namespace;
pub mod types;
pub mod validation;

pub use namespace::*;
pub use types::*;
pub use validation::*;
