pub mod executor;
pub mod result;

pub use executor::*;
pub use result::*;
