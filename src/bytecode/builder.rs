use tracing::warn;

use crate::analysis::{compute_max_stack, MethodContext};
use crate::attribute_info::*;
use crate::bytecode::MethodGenerator;
use crate::code::InsnList;
use crate::constant_info::*;
use crate::descriptor::MethodDescriptor;
use crate::field_info::{FieldAccessFlags, FieldInfo};
use crate::method_info::{MethodAccessFlags, MethodInfo};
use crate::unit::{Annotation, AnnotationValue};
use crate::{ClassAccessFlags, ClassError, ClassFile};

/// Java 8 class files.
pub const DEFAULT_MAJOR_VERSION: u16 = 52;

/// Code for a method added through [`ClassBuilder::add_method`].
#[derive(Clone, Debug)]
pub struct MethodBody {
    pub instructions: InsnList,
    pub max_locals: u16,
}

/// Synthesizes a class file from scratch.
#[derive(Clone, Debug)]
pub struct ClassBuilder {
    class: ClassFile,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: &str) -> Self {
        let const_pool = vec![
            ConstantInfo::Utf8(Utf8Constant::new(name)),
            ConstantInfo::Class(ClassConstant { name_index: 1 }),
            ConstantInfo::Utf8(Utf8Constant::new(super_name)),
            ConstantInfo::Class(ClassConstant { name_index: 3 }),
        ];
        ClassBuilder {
            class: ClassFile {
                minor_version: 0,
                major_version: DEFAULT_MAJOR_VERSION,
                const_pool_size: const_pool.len() as u16 + 1,
                const_pool,
                access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
                this_class: 2,
                super_class: 4,
                interfaces_count: 0,
                interfaces: Vec::new(),
                fields_count: 0,
                fields: Vec::new(),
                methods_count: 0,
                methods: Vec::new(),
                attributes_count: 0,
                attributes: Vec::new(),
            },
        }
    }

    pub fn with_version(mut self, major: u16, minor: u16) -> Self {
        self.class.major_version = major;
        self.class.minor_version = minor;
        self
    }

    pub fn with_access(mut self, flags: ClassAccessFlags) -> Self {
        self.class.access_flags = flags;
        self
    }

    pub fn class_file_mut(&mut self) -> &mut ClassFile {
        &mut self.class
    }

    /// A generator adding its constants to this class.
    pub fn generator(&mut self, first_local: u16) -> MethodGenerator<'_> {
        MethodGenerator::new(&mut self.class, first_local)
    }

    pub fn add_interface(&mut self, name: &str) -> Result<(), ClassError> {
        let index = self.class.get_or_add_class(name)?;
        self.class.interfaces.push(index);
        Ok(())
    }

    pub fn add_field(&mut self, access_flags: FieldAccessFlags, name: &str, descriptor: &str) -> Result<(), ClassError> {
        let field = FieldInfo {
            access_flags,
            name_index: self.class.get_or_add_utf8(name)?,
            descriptor_index: self.class.get_or_add_utf8(descriptor)?,
            attributes_count: 0,
            attributes: Vec::new(),
        };
        self.class.fields.push(field);
        Ok(())
    }

    /// A static field initialized by an `int` `ConstantValue` attribute.
    pub fn add_int_constant(&mut self, access_flags: FieldAccessFlags, name: &str, value: i32) -> Result<(), ClassError> {
        self.add_field(access_flags | FieldAccessFlags::STATIC, name, "I")?;
        let value_index = self.class.get_or_add_integer(value)?;
        let attribute = AttributeInfo::new(
            self.class.get_or_add_utf8("ConstantValue")?,
            constant_value_attribute_bytes(value_index),
        );
        if let Some(field) = self.class.fields.last_mut() {
            field.attributes.push(attribute);
        }
        Ok(())
    }

    /// Adds a method and returns its position in the method table. The
    /// operand stack size of `body` is computed by dataflow analysis.
    pub fn add_method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        body: Option<MethodBody>,
    ) -> Result<usize, ClassError> {
        push_method(&mut self.class, access_flags, name, descriptor, body, 16)
    }

    pub fn set_exceptions(&mut self, method: usize, exceptions: &[&str]) -> Result<(), ClassError> {
        let indices = exceptions
            .iter()
            .map(|e| self.class.get_or_add_class(e))
            .collect::<Result<Vec<_>, _>>()?;
        let attribute = AttributeInfo::new(
            self.class.get_or_add_utf8("Exceptions")?,
            exceptions_attribute_bytes(&indices)?,
        );
        self.method_mut(method)?.attributes.push(attribute);
        Ok(())
    }

    pub fn annotate_class(&mut self, visible: bool, annotation: &Annotation) -> Result<(), ClassError> {
        let mut attributes = std::mem::take(&mut self.class.attributes);
        let result = add_annotation(&mut self.class, &mut attributes, visible, annotation);
        self.class.attributes = attributes;
        result
    }

    pub fn annotate_method(&mut self, method: usize, visible: bool, annotation: &Annotation) -> Result<(), ClassError> {
        let mut attributes = std::mem::take(&mut self.method_mut(method)?.attributes);
        let result = add_annotation(&mut self.class, &mut attributes, visible, annotation);
        self.method_mut(method)?.attributes = attributes;
        result
    }

    fn method_mut(&mut self, method: usize) -> Result<&mut MethodInfo, ClassError> {
        self.class
            .methods
            .get_mut(method)
            .ok_or_else(|| ClassError::Malformed(format!("no method at position {}", method)))
    }

    pub fn into_class_file(mut self) -> ClassFile {
        self.class.sync_counts();
        self.class
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassError> {
        self.class.to_bytes()
    }
}

/// Appends a method to `class`, returning its position. Without a body the
/// method gets no `Code` attribute; `fallback` is the stack size used when
/// the body cannot be analyzed.
pub fn push_method(
    class: &mut ClassFile,
    access_flags: MethodAccessFlags,
    name: &str,
    descriptor: &str,
    body: Option<MethodBody>,
    fallback: u16,
) -> Result<usize, ClassError> {
    let mut method = MethodInfo {
        access_flags,
        name_index: class.get_or_add_utf8(name)?,
        descriptor_index: class.get_or_add_utf8(descriptor)?,
        attributes_count: 0,
        attributes: Vec::new(),
    };
    if let Some(body) = body {
        let parsed = MethodDescriptor::parse(descriptor)?;
        let owner = class.this_class_name()?.to_owned();
        let context = MethodContext {
            owner: &owner,
            is_static: access_flags.contains(MethodAccessFlags::STATIC),
            descriptor: &parsed,
            max_locals: body.max_locals,
        };
        let max_stack = max_stack_or(class, context, &body.instructions, fallback);
        method
            .attributes
            .push(code_attribute(class, &body.instructions, max_stack, body.max_locals, Vec::new())?);
    }
    class.methods.push(method);
    Ok(class.methods.len() - 1)
}

/// Stack size from dataflow analysis, or `fallback` when the code cannot be
/// analyzed.
pub fn max_stack_or(pool: &ClassFile, method: MethodContext<'_>, list: &InsnList, fallback: u16) -> u16 {
    match compute_max_stack(pool, method, list) {
        Ok(max_stack) => max_stack,
        Err(error) => {
            warn!(class = %method.owner, %error, fallback, "max stack computed by fallback");
            fallback
        }
    }
}

/// Assembles `list` into a `Code` attribute of `class`.
pub fn code_attribute(
    class: &mut ClassFile,
    list: &InsnList,
    max_stack: u16,
    max_locals: u16,
    attributes: Vec<AttributeInfo>,
) -> Result<AttributeInfo, ClassError> {
    let assembled = list.assemble()?;
    let code = CodeAttribute {
        max_stack,
        max_locals,
        code: assembled.code,
        exception_table: assembled.exception_table,
        attributes,
    };
    code.to_attribute(class.get_or_add_utf8("Code")?)
}

fn add_annotation(
    class: &mut ClassFile,
    attributes: &mut Vec<AttributeInfo>,
    visible: bool,
    annotation: &Annotation,
) -> Result<(), ClassError> {
    let name = if visible {
        "RuntimeVisibleAnnotations"
    } else {
        "RuntimeInvisibleAnnotations"
    };
    let name_index = class.get_or_add_utf8(name)?;
    let encoded = encode_annotation(class, annotation)?;
    match attributes.iter_mut().find(|a| a.attribute_name_index == name_index) {
        Some(existing) => {
            let mut parsed = parse_attribute(&existing.info, "RuntimeAnnotations", runtime_annotations_attribute_parser)?;
            parsed.annotations.push(encoded);
            existing.info = parsed.to_bytes()?;
        }
        None => {
            let attribute = RuntimeAnnotationsAttribute {
                annotations: vec![encoded],
            };
            attributes.push(AttributeInfo::new(name_index, attribute.to_bytes()?));
        }
    }
    Ok(())
}

fn encode_annotation(class: &mut ClassFile, annotation: &Annotation) -> Result<RuntimeAnnotation, ClassError> {
    let type_index = class.get_or_add_utf8(&annotation.type_descriptor)?;
    let element_value_pairs = annotation
        .entries
        .iter()
        .map(|(name, value)| {
            Ok(ElementValuePair {
                element_name_index: class.get_or_add_utf8(name)?,
                value: encode_value(class, value)?,
            })
        })
        .collect::<Result<_, ClassError>>()?;
    Ok(RuntimeAnnotation {
        type_index,
        element_value_pairs,
    })
}

fn encode_value(class: &mut ClassFile, value: &AnnotationValue) -> Result<ElementValue, ClassError> {
    let constant = |tag: char, value: u16| ElementValue::ConstValueIndex { tag, value };
    Ok(match value {
        AnnotationValue::Int { tag, value } => constant(*tag, class.get_or_add_integer(*value)?),
        AnnotationValue::Long(v) => constant('J', class.get_or_add(ConstantInfo::Long(LongConstant { value: *v }))?),
        AnnotationValue::Float(v) => {
            constant('F', class.get_or_add(ConstantInfo::Float(FloatConstant { value: v.0 }))?)
        }
        AnnotationValue::Double(v) => {
            constant('D', class.get_or_add(ConstantInfo::Double(DoubleConstant { value: v.0 }))?)
        }
        AnnotationValue::String(s) => constant('s', class.get_or_add_utf8(s)?),
        AnnotationValue::Enum { type_descriptor, name } => ElementValue::EnumConst(EnumConstValue {
            type_name_index: class.get_or_add_utf8(type_descriptor)?,
            const_name_index: class.get_or_add_utf8(name)?,
        }),
        AnnotationValue::Class(descriptor) => ElementValue::ClassInfoIndex(class.get_or_add_utf8(descriptor)?),
        AnnotationValue::Annotation(nested) => ElementValue::AnnotationValue(encode_annotation(class, nested)?),
        AnnotationValue::Array(values) => ElementValue::ElementArray(
            values
                .iter()
                .map(|v| encode_value(class, v))
                .collect::<Result<_, _>>()?,
        ),
    })
}
