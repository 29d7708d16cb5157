//! Live patching for [Java Classfiles](https://docs.oracle.com/javase/specs/jvms/se10/html/jvms-4.html).
//!
//! Two versions of a class are compared with [`diff::compare`]; a class that
//! may be patched is rewritten once with [`instrument::instrument`] so that
//! every method first asks a patch provider whether a newer body exists.

use std::io::{Cursor, Read, Seek};

use binrw::BinRead;

#[macro_use]
extern crate bitflags;

pub mod attribute_info;
pub mod code_attribute;
pub mod constant_info;
pub mod field_info;
pub mod method_info;

pub mod analysis;
pub mod bytecode;
pub mod code;
pub mod descriptor;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod instrument;
pub mod registry;
pub mod types;
pub mod unit;

pub use error::*;
pub use types::*;

/// Parses a class file held in memory.
///
/// ```rust
/// let result = classfile_hotswap::parse_class(b"this_will_be_parsed_as_classfile");
/// assert!(result.is_err());
/// ```
pub fn parse_class(bytes: &[u8]) -> Result<ClassFile, ClassError> {
    parse_class_from_reader(&mut Cursor::new(bytes))
}

/// Parses a class file from a seekable reader. Trailing bytes are ignored.
pub fn parse_class_from_reader<R: Read + Seek>(reader: &mut R) -> Result<ClassFile, ClassError> {
    Ok(ClassFile::read(reader)?)
}
