mod builder;
mod decoder;
mod instruction;
mod object;
mod op;
mod proc;

pub use builder::{BytecodeBuilder, Label, ObjectBuilder, ProcSignature, ProcStart};
pub use decoder::{BytecodeDecoder, DecodeError};
pub use instruction::{
    CallFlags, Condition, Instruction, LexicalTarget, LoadTarget, NewType, Section, StoreTarget,
    Synthetic, TrapFlags, pack_new_flags, unpack_new_flags,
};
pub use object::{
    ActionBinding, ActionDescriptor, BytecodeObject, CallDescriptor, ClassDescriptor,
    ConceptDescriptor, ExistentialDescriptor, FieldDescriptor, ImplBinding, IntrinsicTypes,
    LiteralDescriptor, MethodBinding, NamespaceDescriptor, StaticDescriptor, TypeDescriptor,
};
pub use op::Op;
pub use proc::{PROC_HEADER_SIZE, PROC_LEXICAL_SIZE, ProcHeader, ProcInfo, ProcLexical, parse_proc};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes)
            .collect::<Result<Vec<_>, _>>()
            .expect("well-formed bytecode")
    }

    #[test]
    fn operands_survive_encoding() {
        let program = vec![
            Instruction::I64 { value: -42 },
            Instruction::Dbl { value: 2.5 },
            Instruction::Chr { value: 'λ' },
            Instruction::Literal { address: 7 },
            Instruction::Synthetic { kind: Synthetic::Rest },
            Instruction::Descriptor { section: Section::Concept, address: 3 },
            Instruction::Load { target: LoadTarget::Enum, address: 0xDEAD_BEEF },
            Instruction::Store { target: StoreTarget::Field, address: 9 },
            Instruction::RPick { offset: 2 },
            Instruction::CallVirtual {
                flags: CallFlags::RECEIVER_FOLLOWS | CallFlags::FORWARD_REST,
                address: 11,
                placement: 3,
            },
            Instruction::Trap { flags: TrapFlags::INDEX_FOLLOWS, index: 0 },
            Instruction::New {
                new_type: NewType::Struct,
                flags: CallFlags::FORWARD_REST,
                address: 4,
                placement: 1,
            },
            Instruction::Halt,
        ];

        let mut b = BytecodeBuilder::new();
        for instruction in &program {
            b.emit(*instruction);
        }
        assert_eq!(decode_all(&b.into_bytes()), program);
    }

    #[test]
    fn forward_and_backward_jumps() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.emit(Instruction::Nil);
        let exit = b.branch(Condition::Nil);
        b.jump_back(top);
        b.bind(exit);
        b.emit(Instruction::Halt);

        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::Nil,
            Instruction::Branch { condition: Condition::Nil, delta: 3 },
            Instruction::Jump { delta: -7 },
            Instruction::Halt,
        ]);
    }

    #[test]
    fn shorthand_calls_and_traps_carry_no_flags() {
        let mut b = BytecodeBuilder::new();
        b.trap(5);
        b.call_static(2, 1);
        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::Trap { flags: TrapFlags::default(), index: 5 },
            Instruction::CallStatic { flags: CallFlags::empty(), address: 2, placement: 1 },
        ]);
        assert_eq!(CallFlags::default(), CallFlags::empty());
        assert_eq!(TrapFlags::default(), TrapFlags::empty());
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let mut b = BytecodeBuilder::new();
        b.emit(Instruction::Noop);
        b.emit_raw(0);

        let mut decoder = BytecodeDecoder::new(b.as_bytes());
        assert_eq!(decoder.decode_next(), Ok(Some(Instruction::Noop)));
        assert_eq!(
            decoder.decode_next(),
            Err(DecodeError::UnknownOpcode { offset: 1, byte: 0 })
        );
    }

    #[test]
    fn truncated_operand_is_an_error() {
        let bytes = [Op::I64 as u8, 1, 2, 3];
        let err = BytecodeDecoder::new(&bytes).decode_next().unwrap_err();
        assert_eq!(err, DecodeError::Truncated { offset: 0, op: Op::I64 });
    }

    #[test]
    fn invalid_load_target_is_an_error() {
        let bytes = [Op::Load as u8, 0x7f, 0, 0, 0, 0];
        let err = BytecodeDecoder::new(&bytes).decode_next().unwrap_err();
        assert!(matches!(err, DecodeError::InvalidOperand { op: Op::Load, value: 0x7f, .. }));
    }

    #[test]
    fn surrogate_char_is_rejected() {
        let mut bytes = vec![Op::Chr as u8];
        bytes.extend_from_slice(&0xD800u32.to_le_bytes());
        assert!(BytecodeDecoder::new(&bytes).decode_next().is_err());
    }

    #[test]
    fn new_flags_pack_type_and_call_flags() {
        let byte = pack_new_flags(NewType::Instance, CallFlags::FORWARD_REST);
        let (type_bits, flags) = unpack_new_flags(byte);
        assert_eq!(NewType::try_from(type_bits), Ok(NewType::Instance));
        assert_eq!(flags, CallFlags::FORWARD_REST);
    }

    #[test]
    fn proc_header_and_lexicals_parse() {
        let lexicals = [
            ProcLexical {
                activation_call: 2,
                target_offset: 1,
                target: LexicalTarget::Local,
            },
            ProcLexical {
                activation_call: 2,
                target_offset: 0,
                target: LexicalTarget::Argument,
            },
        ];
        let mut b = BytecodeBuilder::new();
        b.emit(Instruction::Noop);
        let start = b.begin_proc(3, 4, &lexicals);
        b.emit(Instruction::Nil);
        b.return_();
        let offset = b.end_proc(start);

        let info = parse_proc(b.as_bytes(), offset as usize).expect("valid proc");
        assert_eq!(info.offset, 1);
        assert_eq!(info.header.num_arguments, 3);
        assert_eq!(info.header.num_locals, 4);
        assert_eq!(info.lexicals, lexicals);
        assert_eq!(info.body_start, 1 + PROC_HEADER_SIZE + 2 * PROC_LEXICAL_SIZE);
        assert_eq!(info.body_end - info.body_start, 2);
        assert_eq!(
            decode_all(&b.as_bytes()[info.body_start..info.body_end]),
            vec![Instruction::Nil, Instruction::Return]
        );
    }

    #[test]
    fn proc_overrunning_the_buffer_is_rejected() {
        let mut bytes = Vec::new();
        ProcHeader {
            body_size: 100,
            num_arguments: 0,
            num_locals: 0,
            num_lexicals: 0,
        }
        .encode(&mut bytes);
        assert_eq!(parse_proc(&bytes, 0), Err(DecodeError::InvalidProc { offset: 0 }));
    }

    #[test]
    fn object_builder_resolves_forward_calls() {
        let mut ob = ObjectBuilder::new("test");
        let callee = ob.declare_call("callee");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.call_static(callee, 0);
            b.emit(Instruction::Halt);
        });
        ob.define_call(callee, ProcSignature::new(0, 0).returns_nothing(), |b| {
            b.return_();
        });
        ob.set_entry(main);
        let object = ob.finish();

        assert_eq!(object.entry, Some(main));
        assert!(!object.calls[callee as usize].returns_value);
        let info = parse_proc(&object.bytecode, object.calls[callee as usize].proc_offset as usize)
            .expect("callee proc");
        assert_eq!(info.body_end, object.bytecode.len());
        assert!(object.has_descriptor(Section::Call, main));
        assert!(!object.has_descriptor(Section::Call, 2));
    }
}
