use nom::{
    combinator::map,
    error::{Error, ErrorKind},
    multi::{length_count, length_data},
    number::complete::{be_u16, be_u32, be_u8},
    sequence::tuple,
    Err as BaseErr,
};

use crate::attribute_info::*;
use crate::ClassError;

type Err<E> = BaseErr<Error<E>>;

pub fn attribute_parser(input: &[u8]) -> Result<(&[u8], AttributeInfo), Err<&[u8]>> {
    map(tuple((be_u16, length_data(be_u32))), |(name_index, info): (u16, &[u8])| {
        AttributeInfo::new(name_index, info.to_owned())
    })(input)
}

pub fn exception_entry_parser(input: &[u8]) -> Result<(&[u8], ExceptionEntry), Err<&[u8]>> {
    map(
        tuple((be_u16, be_u16, be_u16, be_u16)),
        |(start_pc, end_pc, handler_pc, catch_type)| ExceptionEntry {
            start_pc,
            end_pc,
            handler_pc,
            catch_type,
        },
    )(input)
}

pub fn code_attribute_parser(input: &[u8]) -> Result<(&[u8], CodeAttribute), Err<&[u8]>> {
    let (input, max_stack) = be_u16(input)?;
    let (input, max_locals) = be_u16(input)?;
    let (input, code) = length_data(be_u32)(input)?;
    let (input, exception_table) = length_count(be_u16, exception_entry_parser)(input)?;
    let (input, attributes) = length_count(be_u16, attribute_parser)(input)?;
    Ok((
        input,
        CodeAttribute {
            max_stack,
            max_locals,
            code: code.to_owned(),
            exception_table,
            attributes,
        },
    ))
}

pub fn exceptions_attribute_parser(input: &[u8]) -> Result<(&[u8], ExceptionsAttribute), Err<&[u8]>> {
    map(length_count(be_u16, be_u16), |exception_table| ExceptionsAttribute { exception_table })(input)
}

pub fn constant_value_attribute_parser(input: &[u8]) -> Result<(&[u8], ConstantValueAttribute), Err<&[u8]>> {
    map(be_u16, |constant_value_index| ConstantValueAttribute { constant_value_index })(input)
}

/// Shared by `RuntimeVisibleAnnotations` and `RuntimeInvisibleAnnotations`.
pub fn runtime_annotations_attribute_parser(
    input: &[u8],
) -> Result<(&[u8], RuntimeAnnotationsAttribute), Err<&[u8]>> {
    map(length_count(be_u16, annotation_parser), |annotations| RuntimeAnnotationsAttribute {
        annotations,
    })(input)
}

fn annotation_parser(input: &[u8]) -> Result<(&[u8], RuntimeAnnotation), Err<&[u8]>> {
    map(
        tuple((be_u16, length_count(be_u16, element_value_pair_parser))),
        |(type_index, element_value_pairs)| RuntimeAnnotation {
            type_index,
            element_value_pairs,
        },
    )(input)
}

fn element_value_pair_parser(input: &[u8]) -> Result<(&[u8], ElementValuePair), Err<&[u8]>> {
    map(tuple((be_u16, element_value_parser)), |(element_name_index, value)| ElementValuePair {
        element_name_index,
        value,
    })(input)
}

pub fn element_value_parser(input: &[u8]) -> Result<(&[u8], ElementValue), Err<&[u8]>> {
    let (input, tag) = be_u8(input)?;
    match tag as char {
        'B' | 'C' | 'I' | 'S' | 'Z' | 'D' | 'F' | 'J' | 's' => {
            let (input, value) = be_u16(input)?;
            Ok((
                input,
                ElementValue::ConstValueIndex {
                    tag: tag as char,
                    value,
                },
            ))
        }
        'e' => {
            let (input, (type_name_index, const_name_index)) = tuple((be_u16, be_u16))(input)?;
            Ok((
                input,
                ElementValue::EnumConst(EnumConstValue {
                    type_name_index,
                    const_name_index,
                }),
            ))
        }
        'c' => {
            let (input, class_info_index) = be_u16(input)?;
            Ok((input, ElementValue::ClassInfoIndex(class_info_index)))
        }
        '@' => {
            let (input, annotation) = annotation_parser(input)?;
            Ok((input, ElementValue::AnnotationValue(annotation)))
        }
        '[' => {
            let (input, values) = length_count(be_u16, element_value_parser)(input)?;
            Ok((input, ElementValue::ElementArray(values)))
        }
        _ => Result::Err(Err::Error(Error::new(input, ErrorKind::NoneOf))),
    }
}

/// Runs a payload parser over a whole attribute, mapping nom failures to a
/// `ClassError` that names the attribute.
pub fn parse_attribute<'a, T>(
    info: &'a [u8],
    attribute: &'static str,
    parser: fn(&'a [u8]) -> Result<(&'a [u8], T), Err<&'a [u8]>>,
) -> Result<T, ClassError> {
    match parser(info) {
        Ok((rest, value)) if rest.is_empty() => Ok(value),
        _ => Err(ClassError::Attribute { attribute }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_attribute_layout() {
        let bytes = [
            0x00, 0x02, 0x00, 0x01, // max_stack, max_locals
            0x00, 0x00, 0x00, 0x01, 0xb1, // code_length, return
            0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, // one handler
            0x00, 0x00, // no attributes
        ];
        let code = parse_attribute(&bytes, "Code", code_attribute_parser).unwrap();
        assert_eq!(code.max_stack, 2);
        assert_eq!(code.code, vec![0xb1]);
        assert_eq!(code.exception_table[0].handler_pc, 1);
    }

    #[test]
    fn test_nested_annotation_values() {
        // @T(v = {@U, 7})
        let bytes = [
            0x00, 0x01, // one annotation
            0x00, 0x05, 0x00, 0x01, // type 5, one pair
            0x00, 0x06, b'[', 0x00, 0x02, // name 6, array of two
            b'@', 0x00, 0x07, 0x00, 0x00, // nested annotation type 7
            b'I', 0x00, 0x08, // int constant at 8
        ];
        let attr =
            parse_attribute(&bytes, "RuntimeVisibleAnnotations", runtime_annotations_attribute_parser).unwrap();
        let ElementValue::ElementArray(values) = &attr.annotations[0].element_value_pairs[0].value else {
            panic!("expected array");
        };
        assert_eq!(values.len(), 2);
        assert!(matches!(values[1], ElementValue::ConstValueIndex { tag: 'I', value: 8 }));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let result = parse_attribute(&[0, 1, 0xff], "ConstantValue", constant_value_attribute_parser);
        assert!(matches!(result, Err(ClassError::Attribute { attribute: "ConstantValue" })));
    }
}
