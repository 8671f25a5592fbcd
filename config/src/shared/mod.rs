mod base;
mod neon;
mod sharing;

pub use base::*;
pub use neon::*;
pub use sharing::*;
