use binrw::binrw;

/// An attribute as stored in the class file. The payload is interpreted on
/// demand by the parsers in this module.
#[binrw]
#[derive(Clone, Debug, PartialEq, Eq)]
#[brw(big)]
pub struct AttributeInfo {
    pub attribute_name_index: u16,
    #[br(temp)]
    #[bw(try_calc(u32::try_from(info.len())))]
    attribute_length: u32,
    #[br(count = attribute_length)]
    pub info: Vec<u8>,
}

impl AttributeInfo {
    pub fn new(attribute_name_index: u16, info: Vec<u8>) -> Self {
        AttributeInfo {
            attribute_name_index,
            info,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Zero for a catch-all (`finally`) handler.
    pub catch_type: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeAnnotationsAttribute {
    pub annotations: Vec<RuntimeAnnotation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeAnnotation {
    pub type_index: u16,
    pub element_value_pairs: Vec<ElementValuePair>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementValuePair {
    pub element_name_index: u16,
    pub value: ElementValue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElementValue {
    ConstValueIndex { tag: char, value: u16 },
    EnumConst(EnumConstValue),
    ClassInfoIndex(u16),
    AnnotationValue(RuntimeAnnotation),
    ElementArray(Vec<ElementValue>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumConstValue {
    pub type_name_index: u16,
    pub const_name_index: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionsAttribute {
    pub exception_table: Vec<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstantValueAttribute {
    pub constant_value_index: u16,
}
