use crate::code_attribute::{Instruction, WideInstruction};
use crate::constant_info::ConstantInfo;
use crate::descriptor::{class_constant_type, newarray_descriptor, parse_type_descriptor, JvmType, MethodDescriptor};
use crate::error::AnalyzerError;
use crate::ClassFile;

/// Kind of a value produced by an instruction, as far as the frame needs it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Float,
    Long,
    Double,
    Null,
    /// Internal name for classes, descriptor for arrays.
    Reference(String),
    ReturnAddress,
}

impl ValueKind {
    pub fn of(ty: &JvmType) -> Option<ValueKind> {
        Some(match ty {
            JvmType::Void => return None,
            JvmType::Int | JvmType::Byte | JvmType::Char | JvmType::Short | JvmType::Boolean => ValueKind::Int,
            JvmType::Long => ValueKind::Long,
            JvmType::Float => ValueKind::Float,
            JvmType::Double => ValueKind::Double,
            JvmType::Reference(name) => ValueKind::Reference(name.clone()),
            JvmType::Array(_) => ValueKind::Reference(ty.to_descriptor()),
        })
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, ValueKind::Long | ValueKind::Double)
    }

    /// The type a local of this kind is declared with; `null` is an
    /// `Object`. Return addresses have none.
    pub fn to_jvm_type(&self) -> Option<JvmType> {
        match self {
            ValueKind::Int => Some(JvmType::Int),
            ValueKind::Float => Some(JvmType::Float),
            ValueKind::Long => Some(JvmType::Long),
            ValueKind::Double => Some(JvmType::Double),
            ValueKind::Null => Some(JvmType::Reference("java/lang/Object".into())),
            ValueKind::Reference(name) if name.starts_with('[') => parse_type_descriptor(name),
            ValueKind::Reference(name) => Some(JvmType::Reference(name.clone())),
            ValueKind::ReturnAddress => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StackOp {
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
}

/// What a non-branching instruction does to a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Pops `pops` values and pushes a fresh value of `push`, if any.
    Compute { pops: usize, push: Option<ValueKind> },
    Load(u16),
    Store(u16),
    Increment(u16),
    Stack(StackOp),
}

fn compute(pops: usize, push: Option<ValueKind>) -> Effect {
    Effect::Compute { pops, push }
}

pub(crate) fn effect(pool: &ClassFile, at: usize, instruction: &Instruction) -> Result<Effect, AnalyzerError> {
    use Instruction::*;
    use ValueKind::*;

    let reference = |name: &str| Some(ValueKind::Reference(name.to_owned()));
    Ok(match instruction {
        Nop => compute(0, None),
        Aconstnull => compute(0, Some(Null)),
        Iconstm1 | Iconst0 | Iconst1 | Iconst2 | Iconst3 | Iconst4 | Iconst5 | Bipush(_) | Sipush(_) => {
            compute(0, Some(Int))
        }
        Lconst0 | Lconst1 => compute(0, Some(Long)),
        Fconst0 | Fconst1 | Fconst2 => compute(0, Some(Float)),
        Dconst0 | Dconst1 => compute(0, Some(Double)),
        Ldc(_) | LdcW(_) | Ldc2W(_) => {
            let index = instruction.pool_index().unwrap_or_default();
            compute(0, Some(constant_kind(pool, index)?))
        }

        Iload(n) | Lload(n) | Fload(n) | Dload(n) | Aload(n) => Effect::Load(u16::from(*n)),
        Iload0 | Lload0 | Fload0 | Dload0 | Aload0 => Effect::Load(0),
        Iload1 | Lload1 | Fload1 | Dload1 | Aload1 => Effect::Load(1),
        Iload2 | Lload2 | Fload2 | Dload2 | Aload2 => Effect::Load(2),
        Iload3 | Lload3 | Fload3 | Dload3 | Aload3 => Effect::Load(3),
        Istore(n) | Lstore(n) | Fstore(n) | Dstore(n) | Astore(n) => Effect::Store(u16::from(*n)),
        Istore0 | Lstore0 | Fstore0 | Dstore0 | Astore0 => Effect::Store(0),
        Istore1 | Lstore1 | Fstore1 | Dstore1 | Astore1 => Effect::Store(1),
        Istore2 | Lstore2 | Fstore2 | Dstore2 | Astore2 => Effect::Store(2),
        Istore3 | Lstore3 | Fstore3 | Dstore3 | Astore3 => Effect::Store(3),
        Iinc { index, .. } => Effect::Increment(u16::from(*index)),
        Wide(wide) => match wide {
            WideInstruction::Iload(n)
            | WideInstruction::Lload(n)
            | WideInstruction::Fload(n)
            | WideInstruction::Dload(n)
            | WideInstruction::Aload(n) => Effect::Load(*n),
            WideInstruction::Istore(n)
            | WideInstruction::Lstore(n)
            | WideInstruction::Fstore(n)
            | WideInstruction::Dstore(n)
            | WideInstruction::Astore(n) => Effect::Store(*n),
            WideInstruction::Iinc { index, .. } => Effect::Increment(*index),
            WideInstruction::Ret(_) => return Err(AnalyzerError::Subroutine),
        },

        Iaload | Baload | Caload | Saload => compute(2, Some(Int)),
        Laload => compute(2, Some(Long)),
        Faload => compute(2, Some(Float)),
        Daload => compute(2, Some(Double)),
        Aaload => compute(2, reference("java/lang/Object")),
        Iastore | Lastore | Fastore | Dastore | Aastore | Bastore | Castore | Sastore => compute(3, None),

        Pop => Effect::Stack(StackOp::Pop),
        Pop2 => Effect::Stack(StackOp::Pop2),
        Dup => Effect::Stack(StackOp::Dup),
        Dupx1 => Effect::Stack(StackOp::DupX1),
        Dupx2 => Effect::Stack(StackOp::DupX2),
        Dup2 => Effect::Stack(StackOp::Dup2),
        Dup2x1 => Effect::Stack(StackOp::Dup2X1),
        Dup2x2 => Effect::Stack(StackOp::Dup2X2),
        Swap => Effect::Stack(StackOp::Swap),

        Iadd | Isub | Imul | Idiv | Irem | Ishl | Ishr | Iushr | Iand | Ior | Ixor => compute(2, Some(Int)),
        Ladd | Lsub | Lmul | Ldiv | Lrem | Lshl | Lshr | Lushr | Land | Lor | Lxor => compute(2, Some(Long)),
        Fadd | Fsub | Fmul | Fdiv | Frem => compute(2, Some(Float)),
        Dadd | Dsub | Dmul | Ddiv | Drem => compute(2, Some(Double)),
        Ineg | L2i | F2i | D2i | I2b | I2c | I2s => compute(1, Some(Int)),
        Lneg | I2l | F2l | D2l => compute(1, Some(Long)),
        Fneg | I2f | L2f | D2f => compute(1, Some(Float)),
        Dneg | I2d | L2d | F2d => compute(1, Some(Double)),
        Lcmp | Fcmpl | Fcmpg | Dcmpl | Dcmpg => compute(2, Some(Int)),

        Ireturn | Lreturn | Freturn | Dreturn | Areturn | Athrow | Monitorenter | Monitorexit => compute(1, None),
        Return => compute(0, None),

        Getstatic(i) => compute(0, Some(field_kind(pool, *i)?)),
        Putstatic(_) => compute(1, None),
        Getfield(i) => compute(1, Some(field_kind(pool, *i)?)),
        Putfield(_) => compute(2, None),
        Invokevirtual(i) | Invokespecial(i) | Invokeinterface { index: i, .. } => {
            let (args, ret) = call_shape(pool, *i, false)?;
            compute(args + 1, ret)
        }
        Invokestatic(i) => {
            let (args, ret) = call_shape(pool, *i, false)?;
            compute(args, ret)
        }
        Invokedynamic { index, .. } => {
            let (args, ret) = call_shape(pool, *index, true)?;
            compute(args, ret)
        }

        New(i) => compute(0, reference(class_name(pool, *i)?)),
        Newarray(atype) => compute(1, reference(newarray_descriptor(*atype).ok_or(AnalyzerError::Reference(0))?)),
        Anewarray(i) => {
            let element = class_constant_type(class_name(pool, *i)?);
            compute(1, Some(Reference(JvmType::Array(Box::new(element)).to_descriptor())))
        }
        Arraylength | Instanceof(_) => compute(1, Some(Int)),
        Checkcast(i) => compute(1, ValueKind::of(&class_constant_type(class_name(pool, *i)?))),
        Multianewarray { index, dimensions } => {
            compute(usize::from(*dimensions), reference(class_name(pool, *index)?))
        }

        Jsr(_) | JsrW(_) | Ret(_) => return Err(AnalyzerError::Subroutine),
        _ => return Err(AnalyzerError::UnlabeledBranch(at)),
    })
}

fn class_name(pool: &ClassFile, index: u16) -> Result<&str, AnalyzerError> {
    pool.class_name(index).map_err(|_| AnalyzerError::Reference(index))
}

fn constant_kind(pool: &ClassFile, index: u16) -> Result<ValueKind, AnalyzerError> {
    let entry = pool.entry(index).map_err(|_| AnalyzerError::Reference(index))?;
    let reference = |name: &str| ValueKind::Reference(name.to_owned());
    Ok(match entry {
        ConstantInfo::Integer(_) => ValueKind::Int,
        ConstantInfo::Float(_) => ValueKind::Float,
        ConstantInfo::Long(_) => ValueKind::Long,
        ConstantInfo::Double(_) => ValueKind::Double,
        ConstantInfo::String(_) => reference("java/lang/String"),
        ConstantInfo::Class(_) => reference("java/lang/Class"),
        ConstantInfo::MethodType(_) => reference("java/lang/invoke/MethodType"),
        ConstantInfo::MethodHandle(_) => reference("java/lang/invoke/MethodHandle"),
        ConstantInfo::Dynamic(d) => {
            let (_, descriptor) = pool
                .name_and_type(d.name_and_type_index)
                .map_err(|_| AnalyzerError::Reference(index))?;
            parse_type_descriptor(descriptor)
                .as_ref()
                .and_then(ValueKind::of)
                .ok_or(AnalyzerError::Reference(index))?
        }
        _ => return Err(AnalyzerError::Reference(index)),
    })
}

fn field_kind(pool: &ClassFile, index: u16) -> Result<ValueKind, AnalyzerError> {
    let field = pool.member_ref(index).map_err(|_| AnalyzerError::Reference(index))?;
    parse_type_descriptor(field.descriptor)
        .as_ref()
        .and_then(ValueKind::of)
        .ok_or(AnalyzerError::Reference(index))
}

/// Argument count (receiver excluded) and result kind of a call site.
pub(crate) fn call_shape(
    pool: &ClassFile,
    index: u16,
    dynamic: bool,
) -> Result<(usize, Option<ValueKind>), AnalyzerError> {
    let descriptor = if dynamic {
        pool.invoke_dynamic(index).map(|(_, d)| d)
    } else {
        pool.member_ref(index).map(|r| r.descriptor)
    }
    .map_err(|_| AnalyzerError::Reference(index))?;
    let parsed = MethodDescriptor::parse(descriptor).map_err(|_| AnalyzerError::Reference(index))?;
    Ok((parsed.params.len(), ValueKind::of(&parsed.ret)))
}
