//! `CompiledUnit`: a parsed class with names, annotations and code resolved
//! into the form the analyzers and the instrumenter work on.

mod annotation;

use std::io::Cursor;

use binrw::BinRead;

use crate::attribute_info::*;
use crate::code::InsnList;
use crate::constant_info::ConstantInfo;
use crate::descriptor::MethodDescriptor;
use crate::field_info::{FieldAccessFlags, FieldInfo};
use crate::method_info::{MethodAccessFlags, MethodInfo};
use crate::{ClassAccessFlags, ClassError, ClassFile};

pub use self::annotation::*;

pub const CONSTRUCTOR_NAME: &str = "<init>";
pub const CLASS_INITIALIZER_NAME: &str = "<clinit>";

#[derive(Clone, Debug)]
pub struct CompiledUnit {
    pub name: String,
    /// `None` only for `java/lang/Object`.
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub access_flags: ClassAccessFlags,
    pub visible_annotations: Vec<Annotation>,
    pub invisible_annotations: Vec<Annotation>,
    pub fields: Vec<FieldMember>,
    pub methods: Vec<MethodMember>,
    class_file: ClassFile,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldMember {
    pub name: String,
    pub descriptor: String,
    pub access_flags: FieldAccessFlags,
    /// Value of a `ConstantValue` attribute, if present.
    pub constant_value: Option<ConstantInfo>,
}

#[derive(Clone, Debug)]
pub struct MethodMember {
    pub name: String,
    pub descriptor: String,
    pub access_flags: MethodAccessFlags,
    pub visible_annotations: Vec<Annotation>,
    pub invisible_annotations: Vec<Annotation>,
    pub exceptions: Vec<String>,
    /// Absent for abstract and native methods.
    pub code: Option<MethodCode>,
    /// Position in the class file's method table.
    pub index: usize,
}

#[derive(Clone, Debug)]
pub struct MethodCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub instructions: InsnList,
    /// Attributes nested in `Code` (line numbers, local variables, frames).
    pub attributes: Vec<AttributeInfo>,
}

impl MethodMember {
    /// The redirect key `"name.descriptor"`.
    pub fn dispatch_key(&self) -> String {
        format!("{}.{}", self.name, self.descriptor)
    }

    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::STATIC)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR_NAME
    }

    pub fn is_class_initializer(&self) -> bool {
        self.name == CLASS_INITIALIZER_NAME
    }

    pub fn parsed_descriptor(&self) -> Result<MethodDescriptor, ClassError> {
        MethodDescriptor::parse(&self.descriptor)
    }

    /// First local slot after the receiver and parameters.
    pub fn first_local(&self) -> Result<u16, ClassError> {
        let receiver = if self.is_static() { 0 } else { 1 };
        Ok(receiver + self.parsed_descriptor()?.param_slots())
    }

    pub fn has_annotation(&self, type_descriptor: &str) -> bool {
        self.visible_annotations
            .iter()
            .chain(&self.invisible_annotations)
            .any(|a| a.type_descriptor == type_descriptor)
    }
}

impl CompiledUnit {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassError> {
        let class_file = ClassFile::read(&mut Cursor::new(bytes))?;
        Self::from_class_file(class_file)
    }

    pub fn from_class_file(class_file: ClassFile) -> Result<Self, ClassError> {
        let name = class_file.this_class_name()?.to_owned();
        let super_name = class_file.super_class_name()?.map(str::to_owned);
        let interfaces = class_file
            .interface_names()?
            .into_iter()
            .map(str::to_owned)
            .collect();
        let (visible_annotations, invisible_annotations) =
            resolve_annotations(&class_file, &class_file.attributes)?;
        let fields = class_file
            .fields
            .iter()
            .map(|f| resolve_field(&class_file, f))
            .collect::<Result<_, _>>()?;
        let methods = class_file
            .methods
            .iter()
            .enumerate()
            .map(|(index, m)| resolve_method(&class_file, index, m))
            .collect::<Result<_, _>>()?;

        Ok(CompiledUnit {
            name,
            super_name,
            interfaces,
            access_flags: class_file.access_flags,
            visible_annotations,
            invisible_annotations,
            fields,
            methods,
            class_file,
        })
    }

    pub fn class_file(&self) -> &ClassFile {
        &self.class_file
    }

    pub fn into_class_file(self) -> ClassFile {
        self.class_file
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodMember> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn field(&self, name: &str, descriptor: &str) -> Option<&FieldMember> {
        self.fields
            .iter()
            .find(|f| f.name == name && f.descriptor == descriptor)
    }

    pub fn has_annotation(&self, type_descriptor: &str) -> bool {
        self.visible_annotations
            .iter()
            .chain(&self.invisible_annotations)
            .any(|a| a.type_descriptor == type_descriptor)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(ClassAccessFlags::INTERFACE)
    }

    /// Canonical text of a method body; `None` for methods without code.
    pub fn render_method(&self, method: &MethodMember) -> Option<Vec<String>> {
        method
            .code
            .as_ref()
            .map(|code| code.instructions.render(&self.class_file))
    }
}

fn attribute_name<'a>(pool: &'a ClassFile, attribute: &AttributeInfo) -> Result<&'a str, ClassError> {
    pool.utf8(attribute.attribute_name_index)
}

fn resolve_annotations(
    pool: &ClassFile,
    attributes: &[AttributeInfo],
) -> Result<(Vec<Annotation>, Vec<Annotation>), ClassError> {
    let mut visible = Vec::new();
    let mut invisible = Vec::new();
    for attribute in attributes {
        let target = match attribute_name(pool, attribute)? {
            "RuntimeVisibleAnnotations" => &mut visible,
            "RuntimeInvisibleAnnotations" => &mut invisible,
            _ => continue,
        };
        let raw = parse_attribute(&attribute.info, "RuntimeAnnotations", runtime_annotations_attribute_parser)?;
        for annotation in &raw.annotations {
            target.push(Annotation::resolve(pool, annotation)?);
        }
    }
    Ok((visible, invisible))
}

fn resolve_field(pool: &ClassFile, field: &FieldInfo) -> Result<FieldMember, ClassError> {
    let mut constant_value = None;
    for attribute in &field.attributes {
        if attribute_name(pool, attribute)? == "ConstantValue" {
            let value = parse_attribute(&attribute.info, "ConstantValue", constant_value_attribute_parser)?;
            let entry = match pool.entry(value.constant_value_index)? {
                // Keep the string itself rather than its pool position.
                ConstantInfo::String(s) => ConstantInfo::Utf8(crate::constant_info::Utf8Constant::new(
                    pool.utf8(s.string_index)?,
                )),
                other => other.clone(),
            };
            constant_value = Some(entry);
        }
    }
    Ok(FieldMember {
        name: pool.utf8(field.name_index)?.to_owned(),
        descriptor: pool.utf8(field.descriptor_index)?.to_owned(),
        access_flags: field.access_flags,
        constant_value,
    })
}

fn resolve_method(pool: &ClassFile, index: usize, method: &MethodInfo) -> Result<MethodMember, ClassError> {
    let (visible_annotations, invisible_annotations) = resolve_annotations(pool, &method.attributes)?;
    let mut code = None;
    let mut exceptions = Vec::new();
    for attribute in &method.attributes {
        match attribute_name(pool, attribute)? {
            "Code" => {
                let raw = parse_attribute(&attribute.info, "Code", code_attribute_parser)?;
                code = Some(MethodCode {
                    max_stack: raw.max_stack,
                    max_locals: raw.max_locals,
                    instructions: InsnList::from_code(&raw.code, &raw.exception_table)?,
                    attributes: raw.attributes,
                });
            }
            "Exceptions" => {
                let raw = parse_attribute(&attribute.info, "Exceptions", exceptions_attribute_parser)?;
                for class_index in raw.exception_table {
                    exceptions.push(pool.class_name(class_index)?.to_owned());
                }
            }
            _ => {}
        }
    }
    Ok(MethodMember {
        name: pool.utf8(method.name_index)?.to_owned(),
        descriptor: pool.utf8(method.descriptor_index)?.to_owned(),
        access_flags: method.access_flags,
        visible_annotations,
        invisible_annotations,
        exceptions,
        code,
        index,
    })
}
