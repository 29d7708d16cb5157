mod types;
mod util;

pub use self::types::*;
pub use self::util::*;
