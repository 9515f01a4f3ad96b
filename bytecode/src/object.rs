//! Descriptor tables of a bytecode object.
//!
//! A [`BytecodeObject`] is what the compiler and assembler hand to the
//! runtime: one bytecode buffer holding every proc, plus tables that resolve
//! the 32-bit addresses used as operands.

use crate::instruction::Section;

#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    pub name: String,
    /// Offset of the proc header in the bytecode buffer.
    pub proc_offset: u32,
    pub returns_value: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticDescriptor {
    pub name: String,
    /// Call run the first time the static is loaded while still empty.
    pub initializer: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: String,
    pub supertype: Option<u32>,
}

/// Binds a virtual call address to the call that implements it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodBinding {
    pub call: u32,
    pub implementation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionBinding {
    pub action: u32,
    pub implementation: u32,
}

/// Implementation of a concept by a class-like descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplBinding {
    pub concept: u32,
    pub actions: Vec<ActionBinding>,
}

/// Shape shared by class, struct, instance and enum descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassDescriptor {
    pub name: String,
    pub type_address: Option<u32>,
    /// Parent in the same section.
    pub superclass: Option<u32>,
    /// Trap index of the allocator; inherited from the parent when absent.
    pub allocator: Option<u32>,
    pub ctor: Option<u32>,
    /// Field addresses declared by this descriptor, parent fields excluded.
    pub fields: Vec<u32>,
    pub methods: Vec<MethodBinding>,
    pub impls: Vec<ImplBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptDescriptor {
    pub name: String,
    pub actions: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub name: String,
    pub concept: u32,
}

/// Methods attached to a value that has no virtual table of its own, such
/// as an intrinsic scalar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistentialDescriptor {
    pub name: String,
    pub type_address: Option<u32>,
    pub methods: Vec<MethodBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDescriptor {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralDescriptor {
    Nil,
    Undef,
    Bool(bool),
    I64(i64),
    Dbl(f64),
    Chr(char),
    Utf8(String),
}

/// Type descriptors for values that are not heap objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntrinsicTypes {
    pub nil: Option<u32>,
    pub undef: Option<u32>,
    pub bool: Option<u32>,
    pub i64: Option<u32>,
    pub dbl: Option<u32>,
    pub chr: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BytecodeObject {
    pub name: String,
    pub bytecode: Vec<u8>,
    pub calls: Vec<CallDescriptor>,
    pub fields: Vec<FieldDescriptor>,
    pub statics: Vec<StaticDescriptor>,
    pub types: Vec<TypeDescriptor>,
    pub classes: Vec<ClassDescriptor>,
    pub structs: Vec<ClassDescriptor>,
    pub instances: Vec<ClassDescriptor>,
    pub enums: Vec<ClassDescriptor>,
    pub concepts: Vec<ConceptDescriptor>,
    pub actions: Vec<ActionDescriptor>,
    pub existentials: Vec<ExistentialDescriptor>,
    pub literals: Vec<LiteralDescriptor>,
    pub namespaces: Vec<NamespaceDescriptor>,
    pub intrinsics: IntrinsicTypes,
    /// Call run by the main task.
    pub entry: Option<u32>,
}

impl BytecodeObject {
    /// Number of entries in the table for `section`.
    pub fn section_len(&self, section: Section) -> usize {
        match section {
            Section::Type => self.types.len(),
            Section::Existential => self.existentials.len(),
            Section::Literal => self.literals.len(),
            Section::Call => self.calls.len(),
            Section::Field => self.fields.len(),
            Section::Static => self.statics.len(),
            Section::Action => self.actions.len(),
            Section::Class => self.classes.len(),
            Section::Struct => self.structs.len(),
            Section::Instance => self.instances.len(),
            Section::Concept => self.concepts.len(),
            Section::Enum => self.enums.len(),
            Section::Namespace => self.namespaces.len(),
        }
    }

    pub fn has_descriptor(&self, section: Section, address: u32) -> bool {
        (address as usize) < self.section_len(section)
    }

    /// Class-like table for the section, if the section is class-like.
    pub fn class_table(&self, section: Section) -> Option<&[ClassDescriptor]> {
        match section {
            Section::Class => Some(&self.classes),
            Section::Struct => Some(&self.structs),
            Section::Instance => Some(&self.instances),
            Section::Enum => Some(&self.enums),
            _ => None,
        }
    }

    /// Name of a descriptor, for diagnostics.
    pub fn descriptor_name(&self, section: Section, address: u32) -> Option<&str> {
        let i = address as usize;
        match section {
            Section::Type => self.types.get(i).map(|d| d.name.as_str()),
            Section::Existential => self.existentials.get(i).map(|d| d.name.as_str()),
            Section::Literal => None,
            Section::Call => self.calls.get(i).map(|d| d.name.as_str()),
            Section::Field => self.fields.get(i).map(|d| d.name.as_str()),
            Section::Static => self.statics.get(i).map(|d| d.name.as_str()),
            Section::Action => self.actions.get(i).map(|d| d.name.as_str()),
            Section::Concept => self.concepts.get(i).map(|d| d.name.as_str()),
            Section::Namespace => self.namespaces.get(i).map(|d| d.name.as_str()),
            Section::Class | Section::Struct | Section::Instance | Section::Enum => self
                .class_table(section)
                .and_then(|table| table.get(i))
                .map(|d| d.name.as_str()),
        }
    }
}
