pub mod branches;
pub mod caches;

pub use branches::*;
pub use caches::*;
