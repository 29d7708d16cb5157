use std::io::Cursor;

use binrw::BinWrite;

use crate::attribute_info::{AttributeInfo, CodeAttribute, ElementValue, RuntimeAnnotation, RuntimeAnnotationsAttribute};
use crate::ClassError;

impl CodeAttribute {
    /// Serializes the attribute payload (everything after `attribute_length`).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassError> {
        let code_length = u32::try_from(self.code.len())
            .map_err(|_| ClassError::Malformed("code array larger than 4GiB".into()))?;
        let handlers = u16::try_from(self.exception_table.len())
            .map_err(|_| ClassError::Malformed("too many exception handlers".into()))?;
        let attributes = u16::try_from(self.attributes.len())
            .map_err(|_| ClassError::Malformed("too many code attributes".into()))?;

        let mut out = Cursor::new(Vec::with_capacity(self.code.len() + 16));
        self.max_stack.write_be(&mut out)?;
        self.max_locals.write_be(&mut out)?;
        code_length.write_be(&mut out)?;
        self.code.write_be(&mut out)?;
        handlers.write_be(&mut out)?;
        for entry in &self.exception_table {
            (entry.start_pc, entry.end_pc, entry.handler_pc, entry.catch_type).write_be(&mut out)?;
        }
        attributes.write_be(&mut out)?;
        for attribute in &self.attributes {
            attribute.write_be(&mut out)?;
        }
        Ok(out.into_inner())
    }

    pub fn to_attribute(&self, name_index: u16) -> Result<AttributeInfo, ClassError> {
        Ok(AttributeInfo::new(name_index, self.to_bytes()?))
    }
}

/// Payload of an `Exceptions` attribute listing the given class indices.
pub fn exceptions_attribute_bytes(class_indices: &[u16]) -> Result<Vec<u8>, ClassError> {
    let mut out = Cursor::new(Vec::with_capacity(2 + class_indices.len() * 2));
    (class_indices.len() as u16).write_be(&mut out)?;
    class_indices.to_vec().write_be(&mut out)?;
    Ok(out.into_inner())
}

/// Payload of a `ConstantValue` attribute.
pub fn constant_value_attribute_bytes(constant_value_index: u16) -> Vec<u8> {
    constant_value_index.to_be_bytes().to_vec()
}

impl RuntimeAnnotationsAttribute {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassError> {
        let mut out = Cursor::new(Vec::new());
        count(self.annotations.len())?.write_be(&mut out)?;
        for annotation in &self.annotations {
            write_annotation(&mut out, annotation)?;
        }
        Ok(out.into_inner())
    }
}

fn count(len: usize) -> Result<u16, ClassError> {
    u16::try_from(len).map_err(|_| ClassError::Attribute {
        attribute: "RuntimeAnnotations",
    })
}

fn write_annotation(out: &mut Cursor<Vec<u8>>, annotation: &RuntimeAnnotation) -> Result<(), ClassError> {
    annotation.type_index.write_be(out)?;
    count(annotation.element_value_pairs.len())?.write_be(out)?;
    for pair in &annotation.element_value_pairs {
        pair.element_name_index.write_be(out)?;
        write_element_value(out, &pair.value)?;
    }
    Ok(())
}

fn write_element_value(out: &mut Cursor<Vec<u8>>, value: &ElementValue) -> Result<(), ClassError> {
    match value {
        ElementValue::ConstValueIndex { tag, value } => {
            let tag = u8::try_from(*tag).map_err(|_| ClassError::Attribute {
                attribute: "RuntimeAnnotations",
            })?;
            (tag, *value).write_be(out)?;
        }
        ElementValue::EnumConst(e) => (b'e', e.type_name_index, e.const_name_index).write_be(out)?,
        ElementValue::ClassInfoIndex(index) => (b'c', *index).write_be(out)?,
        ElementValue::AnnotationValue(nested) => {
            b'@'.write_be(out)?;
            write_annotation(out, nested)?;
        }
        ElementValue::ElementArray(values) => {
            (b'[', count(values.len())?).write_be(out)?;
            for v in values {
                write_element_value(out, v)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute_info::{
        code_attribute_parser, parse_attribute, runtime_annotations_attribute_parser, ElementValuePair, EnumConstValue,
        ExceptionEntry,
    };

    #[test]
    fn test_code_attribute_survives_rewrite() {
        let code = CodeAttribute {
            max_stack: 3,
            max_locals: 4,
            code: vec![0x2a, 0xb7, 0x00, 0x01, 0xb1],
            exception_table: vec![ExceptionEntry {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 4,
                catch_type: 0,
            }],
            attributes: vec![AttributeInfo::new(9, vec![0, 0])],
        };
        let bytes = code.to_bytes().unwrap();
        let parsed = parse_attribute(&bytes, "Code", code_attribute_parser).unwrap();
        assert_eq!(parsed, code);
    }

    #[test]
    fn test_annotations_survive_rewrite() {
        let attribute = RuntimeAnnotationsAttribute {
            annotations: vec![RuntimeAnnotation {
                type_index: 3,
                element_value_pairs: vec![
                    ElementValuePair {
                        element_name_index: 4,
                        value: ElementValue::ElementArray(vec![
                            ElementValue::ConstValueIndex { tag: 'I', value: 5 },
                            ElementValue::EnumConst(EnumConstValue {
                                type_name_index: 6,
                                const_name_index: 7,
                            }),
                        ]),
                    },
                    ElementValuePair {
                        element_name_index: 8,
                        value: ElementValue::AnnotationValue(RuntimeAnnotation {
                            type_index: 9,
                            element_value_pairs: vec![],
                        }),
                    },
                ],
            }],
        };
        let bytes = attribute.to_bytes().unwrap();
        let parsed = parse_attribute(&bytes, "RuntimeAnnotations", runtime_annotations_attribute_parser).unwrap();
        assert_eq!(parsed, attribute);
    }
}
