pub mod campaign;
pub mod outcome;

pub use campaign::*;
pub use outcome::*;
