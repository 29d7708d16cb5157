mod parser;
mod types;
mod writer;

pub use self::parser::*;
pub use self::types::*;
pub use self::writer::*;
