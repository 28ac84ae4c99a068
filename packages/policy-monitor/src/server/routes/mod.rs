// HTTP routes
pub mod health;
pub mod pools;

pub use health::*;
pub use pools::*;
