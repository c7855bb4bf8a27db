mod cache;
mod store;
mod types;

pub use cache::*;
pub use store::*;
pub use types::*;
