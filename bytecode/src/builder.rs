use crate::instruction::{CallFlags, Condition, Instruction, Section, TrapFlags, pack_new_flags};
use crate::object::{
    ActionDescriptor, BytecodeObject, CallDescriptor, ClassDescriptor, ConceptDescriptor,
    ExistentialDescriptor, FieldDescriptor, IntrinsicTypes, LiteralDescriptor,
    NamespaceDescriptor, StaticDescriptor, TypeDescriptor,
};
use crate::op::Op;
use crate::proc::{PROC_HEADER_SIZE, ProcHeader, ProcLexical};

/// A forward jump whose delta has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jump`] and [`BytecodeBuilder::branch`].
/// Resolve it with [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the i16 delta bytes in the buffer.
    delta_pos: usize,
    /// Position right after the jump instruction (base for the delta).
    base: usize,
}

/// A proc whose header still needs its body size.
#[derive(Debug)]
pub struct ProcStart {
    offset: usize,
    body_start: usize,
}

/// Builds a bytecode byte sequence.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    /// Encode any instruction.
    pub fn emit(&mut self, instruction: Instruction) {
        self.emit_op(instruction.op());
        match instruction {
            Instruction::I64 { value } => self.emit_u64(value as u64),
            Instruction::Dbl { value } => self.emit_u64(value.to_bits()),
            Instruction::Chr { value } => self.emit_u32(value as u32),
            Instruction::Literal { address }
            | Instruction::String { address }
            | Instruction::Url { address } => self.emit_u32(address),
            Instruction::Synthetic { kind } => self.emit_u8(kind as u8),
            Instruction::Descriptor { section, address } => {
                self.emit_u8(section as u8);
                self.emit_u32(address);
            }
            Instruction::Load { target, address } => {
                self.emit_u8(target as u8);
                self.emit_u32(address);
            }
            Instruction::Store { target, address } => {
                self.emit_u8(target as u8);
                self.emit_u32(address);
            }
            Instruction::Pick { offset }
            | Instruction::Drop { offset }
            | Instruction::RPick { offset }
            | Instruction::RDrop { offset } => self.emit_u16(offset),
            Instruction::Branch { delta, .. } | Instruction::Jump { delta } => {
                self.emit_i16(delta)
            }
            Instruction::CallStatic { flags, address, placement }
            | Instruction::CallVirtual { flags, address, placement }
            | Instruction::CallConcept { flags, address, placement }
            | Instruction::CallExistential { flags, address, placement } => {
                self.emit_u8(flags.bits());
                self.emit_u32(address);
                self.emit_u16(placement);
            }
            Instruction::Trap { flags, index } => {
                self.emit_u8(flags.bits());
                self.emit_u32(index);
            }
            Instruction::New { new_type, flags, address, placement } => {
                self.emit_u8(pack_new_flags(new_type, flags));
                self.emit_u32(address);
                self.emit_u16(placement);
            }
            _ => {}
        }
    }

    /// Emit a raw byte. Only useful for producing malformed streams in tests.
    pub fn emit_raw(&mut self, byte: u8) {
        self.emit_u8(byte);
    }

    pub fn i64(&mut self, value: i64) {
        self.emit(Instruction::I64 { value });
    }

    pub fn dbl(&mut self, value: f64) {
        self.emit(Instruction::Dbl { value });
    }

    pub fn trap(&mut self, index: u32) {
        self.emit(Instruction::Trap {
            flags: TrapFlags::empty(),
            index,
        });
    }

    pub fn call_static(&mut self, address: u32, placement: u16) {
        self.emit(Instruction::CallStatic {
            flags: CallFlags::empty(),
            address,
            placement,
        });
    }

    pub fn return_(&mut self) {
        self.emit(Instruction::Return);
    }

    // ── jumps ──────────────────────────────────────────────────────

    /// Emit an unconditional forward jump. Returns a [`Label`] that must be
    /// resolved later with [`bind`](Self::bind).
    pub fn jump(&mut self) -> Label {
        self.emit_jump_placeholder(Op::Jump)
    }

    /// Emit a conditional forward jump. Returns a [`Label`].
    pub fn branch(&mut self, condition: Condition) -> Label {
        self.emit_jump_placeholder(condition.op())
    }

    /// Bind a forward jump label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        let delta = (target as isize - label.base as isize) as i16;
        self.buf[label.delta_pos..label.delta_pos + 2].copy_from_slice(&delta.to_le_bytes());
    }

    /// Emit an unconditional backward jump to `target` (a byte offset obtained
    /// from [`current_offset`](Self::current_offset)).
    pub fn jump_back(&mut self, target: usize) {
        self.emit_back(Op::Jump, target);
    }

    /// Emit a conditional backward jump to `target`.
    pub fn branch_back(&mut self, condition: Condition, target: usize) {
        self.emit_back(condition.op(), target);
    }

    fn emit_back(&mut self, op: Op, target: usize) {
        self.emit_op(op);
        let base = self.buf.len() + 2;
        let delta = (target as isize - base as isize) as i16;
        self.emit_i16(delta);
    }

    fn emit_jump_placeholder(&mut self, op: Op) -> Label {
        self.emit_op(op);
        let delta_pos = self.buf.len();
        self.emit_i16(0); // placeholder
        let base = self.buf.len();
        Label { delta_pos, base }
    }

    // ── procs ──────────────────────────────────────────────────────

    /// Write a proc header and lexical table. The body follows until
    /// [`end_proc`](Self::end_proc).
    pub fn begin_proc(
        &mut self,
        num_arguments: u16,
        num_locals: u16,
        lexicals: &[ProcLexical],
    ) -> ProcStart {
        let offset = self.buf.len();
        let header = ProcHeader {
            body_size: 0,
            num_arguments,
            num_locals,
            num_lexicals: lexicals.len() as u16,
        };
        header.encode(&mut self.buf);
        for lexical in lexicals {
            lexical.encode(&mut self.buf);
        }
        ProcStart {
            offset,
            body_start: self.buf.len(),
        }
    }

    /// Patch the body size of a proc and return its offset.
    pub fn end_proc(&mut self, start: ProcStart) -> u32 {
        let body_size = (self.buf.len() - start.body_start) as u32;
        self.buf[start.offset..start.offset + 4].copy_from_slice(&body_size.to_le_bytes());
        debug_assert!(start.offset + PROC_HEADER_SIZE <= start.body_start);
        start.offset as u32
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shape of a proc defined through [`ObjectBuilder`].
#[derive(Debug, Clone, Default)]
pub struct ProcSignature {
    pub arguments: u16,
    pub locals: u16,
    pub lexicals: Vec<ProcLexical>,
    pub returns_value: bool,
}

impl ProcSignature {
    pub fn new(arguments: u16, locals: u16) -> Self {
        Self {
            arguments,
            locals,
            lexicals: Vec::new(),
            returns_value: true,
        }
    }

    pub fn with_lexicals(mut self, lexicals: Vec<ProcLexical>) -> Self {
        self.lexicals = lexicals;
        self
    }

    pub fn returns_nothing(mut self) -> Self {
        self.returns_value = false;
        self
    }
}

/// Assembles a complete [`BytecodeObject`]: code plus descriptor tables.
pub struct ObjectBuilder {
    object: BytecodeObject,
    code: BytecodeBuilder,
}

impl ObjectBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            object: BytecodeObject {
                name: name.into(),
                ..Default::default()
            },
            code: BytecodeBuilder::new(),
        }
    }

    /// Reserve a call address before its body exists, for forward and
    /// recursive references.
    pub fn declare_call(&mut self, name: impl Into<String>) -> u32 {
        let address = self.object.calls.len() as u32;
        self.object.calls.push(CallDescriptor {
            name: name.into(),
            proc_offset: u32::MAX,
            returns_value: true,
        });
        address
    }

    /// Emit the body of a declared call.
    pub fn define_call(
        &mut self,
        address: u32,
        signature: ProcSignature,
        body: impl FnOnce(&mut BytecodeBuilder),
    ) {
        let start = self
            .code
            .begin_proc(signature.arguments, signature.locals, &signature.lexicals);
        body(&mut self.code);
        let proc_offset = self.code.end_proc(start);
        if let Some(call) = self.object.calls.get_mut(address as usize) {
            call.proc_offset = proc_offset;
            call.returns_value = signature.returns_value;
        }
    }

    pub fn add_call(
        &mut self,
        name: impl Into<String>,
        signature: ProcSignature,
        body: impl FnOnce(&mut BytecodeBuilder),
    ) -> u32 {
        let address = self.declare_call(name);
        self.define_call(address, signature, body);
        address
    }

    pub fn add_field(&mut self, name: impl Into<String>) -> u32 {
        push(&mut self.object.fields, FieldDescriptor { name: name.into() })
    }

    pub fn add_static(&mut self, name: impl Into<String>, initializer: Option<u32>) -> u32 {
        push(
            &mut self.object.statics,
            StaticDescriptor {
                name: name.into(),
                initializer,
            },
        )
    }

    pub fn add_type(&mut self, name: impl Into<String>, supertype: Option<u32>) -> u32 {
        push(
            &mut self.object.types,
            TypeDescriptor {
                name: name.into(),
                supertype,
            },
        )
    }

    /// Add a class-like descriptor to the table for `section`.
    ///
    /// # Panics
    ///
    /// Panics if `section` is not one of the class-like sections.
    pub fn add_class(&mut self, section: Section, descriptor: ClassDescriptor) -> u32 {
        let table = match section {
            Section::Class => &mut self.object.classes,
            Section::Struct => &mut self.object.structs,
            Section::Instance => &mut self.object.instances,
            Section::Enum => &mut self.object.enums,
            other => panic!("{other:?} is not a class-like section"),
        };
        push(table, descriptor)
    }

    /// Mutable access to an already added class-like descriptor.
    pub fn class_mut(&mut self, section: Section, address: u32) -> Option<&mut ClassDescriptor> {
        let table = match section {
            Section::Class => &mut self.object.classes,
            Section::Struct => &mut self.object.structs,
            Section::Instance => &mut self.object.instances,
            Section::Enum => &mut self.object.enums,
            _ => return None,
        };
        table.get_mut(address as usize)
    }

    pub fn add_concept(&mut self, name: impl Into<String>) -> u32 {
        push(
            &mut self.object.concepts,
            ConceptDescriptor {
                name: name.into(),
                actions: Vec::new(),
            },
        )
    }

    pub fn add_action(&mut self, name: impl Into<String>, concept: u32) -> u32 {
        let address = push(
            &mut self.object.actions,
            ActionDescriptor {
                name: name.into(),
                concept,
            },
        );
        if let Some(descriptor) = self.object.concepts.get_mut(concept as usize) {
            descriptor.actions.push(address);
        }
        address
    }

    pub fn add_existential(&mut self, descriptor: ExistentialDescriptor) -> u32 {
        push(&mut self.object.existentials, descriptor)
    }

    pub fn add_literal(&mut self, literal: LiteralDescriptor) -> u32 {
        push(&mut self.object.literals, literal)
    }

    pub fn add_namespace(&mut self, name: impl Into<String>) -> u32 {
        push(&mut self.object.namespaces, NamespaceDescriptor { name: name.into() })
    }

    pub fn intrinsics_mut(&mut self) -> &mut IntrinsicTypes {
        &mut self.object.intrinsics
    }

    pub fn set_entry(&mut self, call: u32) {
        self.object.entry = Some(call);
    }

    pub fn finish(mut self) -> BytecodeObject {
        self.object.bytecode = self.code.into_bytes();
        self.object
    }
}

fn push<T>(table: &mut Vec<T>, value: T) -> u32 {
    table.push(value);
    (table.len() - 1) as u32
}
