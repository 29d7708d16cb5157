mod parser;
mod types;

pub use self::parser::*;
pub use self::types::*;
