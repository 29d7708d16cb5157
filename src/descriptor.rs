//! Field and method descriptors.

use std::fmt;

use crate::ClassError;

/// A JVM type as spelled in a descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum JvmType {
    Int,
    Long,
    Float,
    Double,
    Byte,
    Char,
    Short,
    Boolean,
    Void,
    Reference(String),
    Array(Box<JvmType>),
}

impl JvmType {
    /// Local-variable / operand-stack slots taken by a value of this type.
    pub fn slots(&self) -> u16 {
        match self {
            JvmType::Void => 0,
            JvmType::Long | JvmType::Double => 2,
            _ => 1,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.slots() == 2
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, JvmType::Reference(_) | JvmType::Array(_))
    }

    pub fn to_descriptor(&self) -> String {
        match self {
            JvmType::Int => "I".into(),
            JvmType::Long => "J".into(),
            JvmType::Float => "F".into(),
            JvmType::Double => "D".into(),
            JvmType::Byte => "B".into(),
            JvmType::Char => "C".into(),
            JvmType::Short => "S".into(),
            JvmType::Boolean => "Z".into(),
            JvmType::Void => "V".into(),
            JvmType::Reference(name) => format!("L{};", name),
            JvmType::Array(inner) => format!("[{}", inner.to_descriptor()),
        }
    }

    /// Operand of `checkcast`/`anewarray`: the internal name for classes, the
    /// descriptor for arrays.
    pub fn class_operand(&self) -> Option<String> {
        match self {
            JvmType::Reference(name) => Some(name.clone()),
            JvmType::Array(_) => Some(self.to_descriptor()),
            _ => None,
        }
    }

    /// `Class.getName()`-style spelling used by reflective lookups
    /// (`int`, `java.lang.String`, `[I`, `[Ljava.lang.String;`).
    pub fn reflective_name(&self) -> String {
        match self {
            JvmType::Reference(name) => internal_to_source_name(name),
            JvmType::Array(_) => internal_to_source_name(&self.to_descriptor()),
            JvmType::Int => "int".into(),
            JvmType::Long => "long".into(),
            JvmType::Float => "float".into(),
            JvmType::Double => "double".into(),
            JvmType::Byte => "byte".into(),
            JvmType::Char => "char".into(),
            JvmType::Short => "short".into(),
            JvmType::Boolean => "boolean".into(),
            JvmType::Void => "void".into(),
        }
    }

    /// Wrapper class, `valueOf` descriptor and unboxing method for primitives.
    pub fn boxing(&self) -> Option<Boxing> {
        let (wrapper, unbox_owner, unbox_name) = match self {
            JvmType::Int => ("java/lang/Integer", "java/lang/Number", "intValue"),
            JvmType::Long => ("java/lang/Long", "java/lang/Number", "longValue"),
            JvmType::Float => ("java/lang/Float", "java/lang/Number", "floatValue"),
            JvmType::Double => ("java/lang/Double", "java/lang/Number", "doubleValue"),
            JvmType::Byte => ("java/lang/Byte", "java/lang/Number", "byteValue"),
            JvmType::Short => ("java/lang/Short", "java/lang/Number", "shortValue"),
            JvmType::Char => ("java/lang/Character", "java/lang/Character", "charValue"),
            JvmType::Boolean => ("java/lang/Boolean", "java/lang/Boolean", "booleanValue"),
            _ => return None,
        };
        let primitive = self.to_descriptor();
        Some(Boxing {
            wrapper,
            value_of_descriptor: format!("({})L{};", primitive, wrapper),
            unbox_owner,
            unbox_name,
            unbox_descriptor: format!("(){}", primitive),
        })
    }
}

impl fmt::Display for JvmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_descriptor())
    }
}

/// How a primitive moves in and out of an `Object[]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Boxing {
    pub wrapper: &'static str,
    pub value_of_descriptor: String,
    pub unbox_owner: &'static str,
    pub unbox_name: &'static str,
    pub unbox_descriptor: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<JvmType>,
    pub ret: JvmType,
}

impl MethodDescriptor {
    pub fn parse(desc: &str) -> Result<Self, ClassError> {
        parse_method_descriptor(desc)
            .map(|(params, ret)| MethodDescriptor { params, ret })
            .ok_or_else(|| ClassError::Descriptor(desc.to_owned()))
    }

    /// Slots taken by the parameters, excluding any receiver.
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(JvmType::slots).sum()
    }

    pub fn to_descriptor(&self) -> String {
        let params: String = self.params.iter().map(JvmType::to_descriptor).collect();
        format!("({}){}", params, self.ret.to_descriptor())
    }

    /// The same method as a static taking `receiver` as first parameter.
    pub fn with_receiver(&self, receiver: &str) -> MethodDescriptor {
        let mut params = Vec::with_capacity(self.params.len() + 1);
        params.push(JvmType::Reference(receiver.to_owned()));
        params.extend(self.params.iter().cloned());
        MethodDescriptor {
            params,
            ret: self.ret.clone(),
        }
    }
}

/// Parse a single type descriptor starting at position `pos` in `desc`.
/// Returns (JvmType, next_position).
pub fn parse_type_at(desc: &str, pos: usize) -> Option<(JvmType, usize)> {
    let bytes = desc.as_bytes();
    match *bytes.get(pos)? {
        b'B' => Some((JvmType::Byte, pos + 1)),
        b'C' => Some((JvmType::Char, pos + 1)),
        b'D' => Some((JvmType::Double, pos + 1)),
        b'F' => Some((JvmType::Float, pos + 1)),
        b'I' => Some((JvmType::Int, pos + 1)),
        b'J' => Some((JvmType::Long, pos + 1)),
        b'S' => Some((JvmType::Short, pos + 1)),
        b'Z' => Some((JvmType::Boolean, pos + 1)),
        b'V' => Some((JvmType::Void, pos + 1)),
        b'L' => {
            let semi = desc[pos + 1..].find(';')?;
            let class_name = &desc[pos + 1..pos + 1 + semi];
            if class_name.is_empty() {
                return None;
            }
            Some((JvmType::Reference(class_name.to_string()), pos + 1 + semi + 1))
        }
        b'[' => {
            let (inner, next) = parse_type_at(desc, pos + 1)?;
            if inner == JvmType::Void {
                return None;
            }
            Some((JvmType::Array(Box::new(inner)), next))
        }
        _ => None,
    }
}

/// Parse a whole field descriptor; trailing characters are rejected.
pub fn parse_type_descriptor(desc: &str) -> Option<JvmType> {
    match parse_type_at(desc, 0)? {
        (ty, end) if end == desc.len() => Some(ty),
        _ => None,
    }
}

/// Parse a method descriptor, e.g. "(II)V" -> ([Int, Int], Void)
pub fn parse_method_descriptor(desc: &str) -> Option<(Vec<JvmType>, JvmType)> {
    if !desc.starts_with('(') {
        return None;
    }
    let close = desc.find(')')?;
    let mut params = Vec::new();
    let mut pos = 1;
    while pos < close {
        let (ty, next) = parse_type_at(desc, pos)?;
        if ty == JvmType::Void {
            return None;
        }
        params.push(ty);
        pos = next;
    }
    let (ret, end) = parse_type_at(desc, close + 1)?;
    (end == desc.len()).then_some((params, ret))
}

/// Type named by a `Class` constant: internal names for classes, a descriptor for arrays.
pub fn class_constant_type(name: &str) -> JvmType {
    if name.starts_with('[') {
        if let Some(ty) = parse_type_descriptor(name) {
            return ty;
        }
    }
    JvmType::Reference(name.to_owned())
}

pub fn internal_to_source_name(name: &str) -> String {
    name.replace('/', ".")
}

/// Convert a newarray type code to the array's descriptor.
pub fn newarray_descriptor(atype: u8) -> Option<&'static str> {
    Some(match atype {
        4 => "[Z",
        5 => "[C",
        6 => "[F",
        7 => "[D",
        8 => "[B",
        9 => "[S",
        10 => "[I",
        11 => "[J",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method_descriptor() {
        let desc = MethodDescriptor::parse("(Ljava/lang/String;J[I)[B").unwrap();
        assert_eq!(
            desc.params,
            vec![
                JvmType::Reference("java/lang/String".into()),
                JvmType::Long,
                JvmType::Array(Box::new(JvmType::Int)),
            ]
        );
        assert_eq!(desc.ret, JvmType::Array(Box::new(JvmType::Byte)));
        assert_eq!(desc.param_slots(), 4);
        assert_eq!(desc.to_descriptor(), "(Ljava/lang/String;J[I)[B");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(MethodDescriptor::parse("(II").is_err());
        assert!(MethodDescriptor::parse("(V)V").is_err());
        assert!(MethodDescriptor::parse("()VV").is_err());
        assert_eq!(parse_type_descriptor("L;"), None);
    }

    #[test]
    fn test_with_receiver() {
        let desc = MethodDescriptor::parse("(I)V").unwrap().with_receiver("a/C");
        assert_eq!(desc.to_descriptor(), "(La/C;I)V");
    }

    #[test]
    fn test_reflective_names() {
        assert_eq!(JvmType::Int.reflective_name(), "int");
        assert_eq!(parse_type_descriptor("[Ljava/lang/String;").unwrap().reflective_name(), "[Ljava.lang.String;");
        assert_eq!(JvmType::Reference("a/b/C".into()).reflective_name(), "a.b.C");
    }

    #[test]
    fn test_boxing_metadata() {
        let boxing = JvmType::Char.boxing().unwrap();
        assert_eq!(boxing.wrapper, "java/lang/Character");
        assert_eq!(boxing.value_of_descriptor, "(C)Ljava/lang/Character;");
        assert_eq!(boxing.unbox_descriptor, "()C");
        assert!(JvmType::Reference("x".into()).boxing().is_none());
    }
}
