use std::io::Cursor;

use binrw::{binrw, BinWrite};

use crate::attribute_info::AttributeInfo;
use crate::constant_info::*;
use crate::field_info::FieldInfo;
use crate::method_info::MethodInfo;
use crate::ClassError;

#[derive(Clone, Debug, PartialEq)]
#[binrw]
#[brw(big, magic = b"\xca\xfe\xba\xbe")]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub const_pool_size: u16,
    #[br(parse_with = read_const_pool, args(const_pool_size))]
    pub const_pool: Vec<ConstantInfo>,
    pub access_flags: ClassAccessFlags,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces_count: u16,
    #[br(count = interfaces_count)]
    pub interfaces: Vec<u16>,
    pub fields_count: u16,
    #[br(count = fields_count)]
    pub fields: Vec<FieldInfo>,
    pub methods_count: u16,
    #[br(count = methods_count)]
    pub methods: Vec<MethodInfo>,
    pub attributes_count: u16,
    #[br(count = attributes_count)]
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[binrw]
#[brw(big)]
pub struct ClassAccessFlags(u16);

bitflags! {
    impl ClassAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        /// `invokespecial` resolves against the superclass; always set on output.
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

/// A resolved Fieldref, Methodref or InterfaceMethodref.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub owner: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
    pub interface: bool,
}

impl ClassFile {
    pub fn entry(&self, index: u16) -> Result<&ConstantInfo, ClassError> {
        usize::from(index)
            .checked_sub(1)
            .and_then(|i| self.const_pool.get(i))
            .ok_or(ClassError::PoolIndex {
                index,
                size: self.const_pool.len(),
            })
    }

    pub fn utf8(&self, index: u16) -> Result<&str, ClassError> {
        match self.entry(index)? {
            ConstantInfo::Utf8(u) => Ok(&u.utf8_string),
            _ => Err(ClassError::PoolTag {
                index,
                expected: "Utf8",
            }),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<&str, ClassError> {
        match self.entry(index)? {
            ConstantInfo::Class(c) => self.utf8(c.name_index),
            _ => Err(ClassError::PoolTag {
                index,
                expected: "Class",
            }),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), ClassError> {
        match self.entry(index)? {
            ConstantInfo::NameAndType(nt) => {
                Ok((self.utf8(nt.name_index)?, self.utf8(nt.descriptor_index)?))
            }
            _ => Err(ClassError::PoolTag {
                index,
                expected: "NameAndType",
            }),
        }
    }

    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>, ClassError> {
        let (class_index, nat_index, interface) = match self.entry(index)? {
            ConstantInfo::FieldRef(r) => (r.class_index, r.name_and_type_index, false),
            ConstantInfo::MethodRef(r) => (r.class_index, r.name_and_type_index, false),
            ConstantInfo::InterfaceMethodRef(r) => (r.class_index, r.name_and_type_index, true),
            _ => {
                return Err(ClassError::PoolTag {
                    index,
                    expected: "member reference",
                })
            }
        };
        let (name, descriptor) = self.name_and_type(nat_index)?;
        Ok(MemberRef {
            owner: self.class_name(class_index)?,
            name,
            descriptor,
            interface,
        })
    }

    /// Name and descriptor of an InvokeDynamic call site.
    pub fn invoke_dynamic(&self, index: u16) -> Result<(&str, &str), ClassError> {
        match self.entry(index)? {
            ConstantInfo::InvokeDynamic(indy) => self.name_and_type(indy.name_and_type_index),
            _ => Err(ClassError::PoolTag {
                index,
                expected: "InvokeDynamic",
            }),
        }
    }

    pub fn this_class_name(&self) -> Result<&str, ClassError> {
        self.class_name(self.this_class)
    }

    /// `None` only for `java/lang/Object` and module-info.
    pub fn super_class_name(&self) -> Result<Option<&str>, ClassError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> Result<Vec<&str>, ClassError> {
        self.interfaces.iter().map(|&i| self.class_name(i)).collect()
    }

    fn find_entry(&self, wanted: &ConstantInfo) -> Option<u16> {
        self.const_pool
            .iter()
            .position(|c| c == wanted)
            .and_then(|i| u16::try_from(i + 1).ok())
    }

    fn push_entry(&mut self, entry: ConstantInfo) -> Result<u16, ClassError> {
        let wide = entry.is_wide();
        let index = u16::try_from(self.const_pool.len() + 1).map_err(|_| ClassError::PoolOverflow)?;
        let needed = self.const_pool.len() + if wide { 3 } else { 2 };
        if needed > usize::from(u16::MAX) {
            return Err(ClassError::PoolOverflow);
        }
        self.const_pool.push(entry);
        if wide {
            self.const_pool.push(ConstantInfo::Unusable);
        }
        self.const_pool_size = (self.const_pool.len() + 1) as u16;
        Ok(index)
    }

    pub(crate) fn get_or_add(&mut self, entry: ConstantInfo) -> Result<u16, ClassError> {
        match self.find_entry(&entry) {
            Some(index) => Ok(index),
            None => self.push_entry(entry),
        }
    }

    pub fn find_utf8_index(&self, value: &str) -> Option<u16> {
        self.const_pool
            .iter()
            .position(|c| matches!(c, ConstantInfo::Utf8(u) if u.utf8_string == value))
            .and_then(|i| u16::try_from(i + 1).ok())
    }

    pub fn get_or_add_utf8(&mut self, value: &str) -> Result<u16, ClassError> {
        match self.find_utf8_index(value) {
            Some(index) => Ok(index),
            None => self.push_entry(ConstantInfo::Utf8(Utf8Constant::new(value))),
        }
    }

    pub fn get_or_add_class(&mut self, internal_name: &str) -> Result<u16, ClassError> {
        let name_index = self.get_or_add_utf8(internal_name)?;
        self.get_or_add(ConstantInfo::Class(ClassConstant { name_index }))
    }

    pub fn get_or_add_string(&mut self, value: &str) -> Result<u16, ClassError> {
        let string_index = self.get_or_add_utf8(value)?;
        self.get_or_add(ConstantInfo::String(StringConstant { string_index }))
    }

    pub fn get_or_add_integer(&mut self, value: i32) -> Result<u16, ClassError> {
        self.get_or_add(ConstantInfo::Integer(IntegerConstant { value }))
    }

    pub fn get_or_add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassError> {
        let name_index = self.get_or_add_utf8(name)?;
        let descriptor_index = self.get_or_add_utf8(descriptor)?;
        self.get_or_add(ConstantInfo::NameAndType(NameAndTypeConstant {
            name_index,
            descriptor_index,
        }))
    }

    pub fn get_or_add_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassError> {
        let class_index = self.get_or_add_class(owner)?;
        let name_and_type_index = self.get_or_add_name_and_type(name, descriptor)?;
        self.get_or_add(ConstantInfo::FieldRef(FieldRefConstant {
            class_index,
            name_and_type_index,
        }))
    }

    pub fn get_or_add_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassError> {
        let class_index = self.get_or_add_class(owner)?;
        let name_and_type_index = self.get_or_add_name_and_type(name, descriptor)?;
        self.get_or_add(ConstantInfo::MethodRef(MethodRefConstant {
            class_index,
            name_and_type_index,
        }))
    }

    pub fn get_or_add_interface_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassError> {
        let class_index = self.get_or_add_class(owner)?;
        let name_and_type_index = self.get_or_add_name_and_type(name, descriptor)?;
        self.get_or_add(ConstantInfo::InterfaceMethodRef(InterfaceMethodRefConstant {
            class_index,
            name_and_type_index,
        }))
    }

    /// Copies an entry of another pool into this one, returning the new index.
    /// Only the entry kinds that instructions reference through `ldc` and member
    /// instructions are supported.
    pub fn import_entry(&mut self, from: &ClassFile, index: u16) -> Result<u16, ClassError> {
        match from.entry(index)? {
            ConstantInfo::Utf8(u) => self.get_or_add_utf8(&u.utf8_string),
            ConstantInfo::Integer(c) => self.get_or_add(ConstantInfo::Integer(c.clone())),
            ConstantInfo::Float(c) => self.get_or_add(ConstantInfo::Float(c.clone())),
            ConstantInfo::Long(c) => self.get_or_add(ConstantInfo::Long(c.clone())),
            ConstantInfo::Double(c) => self.get_or_add(ConstantInfo::Double(c.clone())),
            ConstantInfo::Class(_) => {
                let name = from.class_name(index)?.to_owned();
                self.get_or_add_class(&name)
            }
            ConstantInfo::String(s) => {
                let value = from.utf8(s.string_index)?.to_owned();
                self.get_or_add_string(&value)
            }
            ConstantInfo::FieldRef(_) | ConstantInfo::MethodRef(_) | ConstantInfo::InterfaceMethodRef(_) => {
                let r = from.member_ref(index)?;
                let (owner, name, descriptor) = (r.owner.to_owned(), r.name.to_owned(), r.descriptor.to_owned());
                match from.entry(index)? {
                    ConstantInfo::FieldRef(_) => self.get_or_add_field_ref(&owner, &name, &descriptor),
                    ConstantInfo::MethodRef(_) => self.get_or_add_method_ref(&owner, &name, &descriptor),
                    _ => self.get_or_add_interface_method_ref(&owner, &name, &descriptor),
                }
            }
            ConstantInfo::MethodType(mt) => {
                let descriptor_index = self.get_or_add_utf8(from.utf8(mt.descriptor_index)?)?;
                self.get_or_add(ConstantInfo::MethodType(MethodTypeConstant { descriptor_index }))
            }
            ConstantInfo::MethodHandle(mh) => {
                let reference_index = self.import_entry(from, mh.reference_index)?;
                self.get_or_add(ConstantInfo::MethodHandle(MethodHandleConstant {
                    reference_kind: mh.reference_kind,
                    reference_index,
                }))
            }
            other => Err(ClassError::Malformed(format!(
                "cannot move a {} constant between classes",
                other.tag_name()
            ))),
        }
    }

    /// Recomputes every `*_count` field from its vector.
    pub fn sync_counts(&mut self) {
        self.const_pool_size = (self.const_pool.len() + 1) as u16;
        self.interfaces_count = self.interfaces.len() as u16;
        self.fields_count = self.fields.len() as u16;
        self.methods_count = self.methods.len() as u16;
        self.attributes_count = self.attributes.len() as u16;
        for field in &mut self.fields {
            field.attributes_count = field.attributes.len() as u16;
        }
        for method in &mut self.methods {
            method.attributes_count = method.attributes.len() as u16;
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassError> {
        let mut synced = self.clone();
        synced.sync_counts();
        let mut cursor = Cursor::new(Vec::new());
        synced.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }
}
