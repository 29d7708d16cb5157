use crate::attribute_info::{ElementValue, RuntimeAnnotation};
use crate::constant_info::ConstantInfo;
use crate::{ClassError, ClassFile};

/// An annotation with every constant-pool reference resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    /// Field descriptor of the annotation type, e.g. `Lcom/example/Marker;`.
    pub type_descriptor: String,
    /// Element name/value pairs in class-file order.
    pub entries: Vec<(String, AnnotationValue)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnnotationValue {
    Int { tag: char, value: i32 },
    Long(i64),
    Float(FloatBits),
    Double(DoubleBits),
    String(String),
    Enum { type_descriptor: String, name: String },
    Class(String),
    Annotation(Box<Annotation>),
    Array(Vec<AnnotationValue>),
}

/// `f32` compared by bit pattern, the way boxed floats compare on the JVM.
#[derive(Clone, Copy, Debug)]
pub struct FloatBits(pub f32);

impl PartialEq for FloatBits {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DoubleBits(pub f64);

impl PartialEq for DoubleBits {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Annotation {
    pub(crate) fn resolve(pool: &ClassFile, raw: &RuntimeAnnotation) -> Result<Self, ClassError> {
        let entries = raw
            .element_value_pairs
            .iter()
            .map(|pair| {
                Ok((
                    pool.utf8(pair.element_name_index)?.to_owned(),
                    AnnotationValue::resolve(pool, &pair.value)?,
                ))
            })
            .collect::<Result<_, ClassError>>()?;
        Ok(Annotation {
            type_descriptor: pool.utf8(raw.type_index)?.to_owned(),
            entries,
        })
    }
}

impl AnnotationValue {
    fn resolve(pool: &ClassFile, raw: &ElementValue) -> Result<Self, ClassError> {
        Ok(match raw {
            ElementValue::ConstValueIndex { tag, value } => match (tag, pool.entry(*value)?) {
                ('B' | 'C' | 'I' | 'S' | 'Z', ConstantInfo::Integer(c)) => AnnotationValue::Int {
                    tag: *tag,
                    value: c.value,
                },
                ('J', ConstantInfo::Long(c)) => AnnotationValue::Long(c.value),
                ('F', ConstantInfo::Float(c)) => AnnotationValue::Float(FloatBits(c.value)),
                ('D', ConstantInfo::Double(c)) => AnnotationValue::Double(DoubleBits(c.value)),
                ('s', ConstantInfo::Utf8(u)) => AnnotationValue::String(u.utf8_string.clone()),
                _ => {
                    return Err(ClassError::PoolTag {
                        index: *value,
                        expected: "annotation constant",
                    })
                }
            },
            ElementValue::EnumConst(e) => AnnotationValue::Enum {
                type_descriptor: pool.utf8(e.type_name_index)?.to_owned(),
                name: pool.utf8(e.const_name_index)?.to_owned(),
            },
            ElementValue::ClassInfoIndex(index) => AnnotationValue::Class(pool.utf8(*index)?.to_owned()),
            ElementValue::AnnotationValue(nested) => {
                AnnotationValue::Annotation(Box::new(Annotation::resolve(pool, nested)?))
            }
            ElementValue::ElementArray(values) => AnnotationValue::Array(
                values
                    .iter()
                    .map(|v| AnnotationValue::resolve(pool, v))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}
