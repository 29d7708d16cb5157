//! Locating the `super(...)`/`this(...)` call of a constructor.
//!
//! A constructor has the shape
//!
//! ```text
//! ...                 set-up code that cannot touch `this`
//! aload_0             last receiver load before the call
//! ...                 delegation arguments, possibly `new X(...)` calls
//! invokespecial <init>
//! ...                 body
//! ```
//!
//! Only the body can be replaced. The delegation call is the first
//! `invokespecial <init>` whose receiver operand is the value that was in
//! local 0 on entry, which a dataflow pass tracks through dups, stores and
//! branches. Helper objects built while computing the arguments also see
//! `invokespecial <init>`, but on a freshly allocated receiver.

use tracing::debug;

use crate::analysis::{Analyzer, BasicInterpreter, BasicValue, Frame, Interpreter, MethodContext, ValueKind};
use crate::code::{Insn, InsnList, Label};
use crate::code_attribute::{Instruction, WideInstruction};
use crate::descriptor::MethodDescriptor;
use crate::error::AnalyzerError;
use crate::unit::{MethodMember, CONSTRUCTOR_NAME};
use crate::ClassFile;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReceiverValue {
    /// The receiver as it was on entry, before any `<init>` ran on it.
    UninitializedThis,
    Basic(BasicValue),
}

/// Basic values, except that the first value ever created (local 0 of the
/// entry frame) is tagged as the uninitialized receiver.
#[derive(Clone, Debug, Default)]
pub struct ReceiverInterpreter {
    basic: BasicInterpreter,
    tagged: bool,
}

impl Interpreter for ReceiverInterpreter {
    type Value = ReceiverValue;

    fn new_value(&mut self, kind: Option<&ValueKind>) -> ReceiverValue {
        match kind {
            Some(_) if !self.tagged => {
                self.tagged = true;
                ReceiverValue::UninitializedThis
            }
            _ => ReceiverValue::Basic(self.basic.new_value(kind)),
        }
    }

    fn merge(&mut self, a: &ReceiverValue, b: &ReceiverValue) -> ReceiverValue {
        match (a, b) {
            _ if a == b => *a,
            (ReceiverValue::Basic(x), ReceiverValue::Basic(y)) => ReceiverValue::Basic(self.basic.merge(x, y)),
            _ => ReceiverValue::Basic(BasicValue::Uninitialized),
        }
    }

    fn size(&self, value: &ReceiverValue) -> usize {
        match value {
            ReceiverValue::UninitializedThis => 1,
            ReceiverValue::Basic(basic) => self.basic.size(basic),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelegationKind {
    /// `this(...)`: another constructor of the same class.
    This,
    /// `super(...)`.
    Super,
}

/// Where a constructor's fixed prologue ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstructorSplit {
    /// List index of the delegation `invokespecial`.
    pub delegation_index: usize,
    /// List index of the last receiver load before the delegation call.
    pub load_this_index: usize,
    /// Class whose constructor is called.
    pub owner: String,
    pub descriptor: String,
    pub kind: DelegationKind,
    /// Operand stack height right after the delegation call returns.
    pub stack_after_call: usize,
}

/// Finds the delegation call of `method`. Any analysis failure, or a shape
/// the analysis cannot prove, yields `None`.
pub fn find_delegation_call(pool: &ClassFile, owner: &str, method: &MethodMember) -> Option<ConstructorSplit> {
    if !method.is_constructor() {
        return None;
    }
    let code = method.code.as_ref()?;
    let descriptor = method.parsed_descriptor().ok()?;
    let context = MethodContext {
        owner,
        is_static: false,
        descriptor: &descriptor,
        max_locals: code.max_locals,
    };
    let result = Analyzer::new(ReceiverInterpreter::default(), pool)
        .analyze(context, &code.instructions)
        .and_then(|analysis| locate(pool, owner, &code.instructions, &analysis.frames));
    match result {
        Ok(Some(split)) => Some(split),
        Ok(None) => {
            debug!(class = %owner, method = %method.descriptor, "no delegation call found");
            None
        }
        Err(error) => {
            debug!(class = %owner, method = %method.descriptor, %error, "constructor analysis failed");
            None
        }
    }
}

fn locate(
    pool: &ClassFile,
    owner: &str,
    list: &InsnList,
    frames: &[Option<Frame<ReceiverValue>>],
) -> Result<Option<ConstructorSplit>, AnalyzerError> {
    // (index, stack height before the load)
    let mut last_this: Option<(usize, usize)> = None;
    let mut consumed = false;

    for (index, insn) in list.insns.iter().enumerate() {
        let Some(frame) = &frames[index] else {
            continue;
        };
        if let Some((_, depth)) = last_this {
            if frame.stack.len() <= depth {
                consumed = true;
            }
        }
        match insn.as_plain() {
            Some(Instruction::Invokespecial(pool_index)) => {
                let target = pool
                    .member_ref(*pool_index)
                    .map_err(|_| AnalyzerError::Reference(*pool_index))?;
                if target.name != CONSTRUCTOR_NAME {
                    continue;
                }
                let arguments = MethodDescriptor::parse(target.descriptor)
                    .map_err(|_| AnalyzerError::Reference(*pool_index))?
                    .params
                    .len();
                let receiver_at = frame
                    .stack
                    .len()
                    .checked_sub(arguments + 1)
                    .ok_or(AnalyzerError::StackUnderflow(index))?;
                if frame.stack[receiver_at] != ReceiverValue::UninitializedThis {
                    continue;
                }
                let Some((load_this_index, _)) = last_this.filter(|_| !consumed) else {
                    return Err(AnalyzerError::ReceiverConsumed(index));
                };
                return Ok(Some(ConstructorSplit {
                    delegation_index: index,
                    load_this_index,
                    owner: target.owner.to_owned(),
                    descriptor: target.descriptor.to_owned(),
                    kind: if target.owner == owner {
                        DelegationKind::This
                    } else {
                        DelegationKind::Super
                    },
                    stack_after_call: receiver_at,
                }));
            }
            Some(Instruction::Aload0 | Instruction::Aload(0) | Instruction::Wide(WideInstruction::Aload(0))) => {
                last_this = Some((index, frame.stack.len()));
                consumed = false;
            }
            _ => {}
        }
    }
    Ok(None)
}

impl ConstructorSplit {
    /// Copy of `code` without the prologue and the delegation call. Only the
    /// handlers lying entirely inside the body are kept.
    pub fn extract_body(&self, code: &InsnList) -> InsnList {
        let mut body = code.clone();
        body.insns.drain(..=self.delegation_index);
        let inside: std::collections::HashSet<Label> = body
            .insns
            .iter()
            .filter_map(|insn| match insn {
                Insn::Label(label) => Some(*label),
                _ => None,
            })
            .collect();
        body.try_catches
            .retain(|tc| inside.contains(&tc.start) && inside.contains(&tc.end) && inside.contains(&tc.handler));
        body
    }

    /// Places a new label right after the delegation call and returns it.
    /// Indices up to the delegation call stay valid.
    pub fn mark_redirection_point(&self, code: &mut InsnList) -> Label {
        let label = code.new_label();
        code.insert(self.delegation_index + 1, vec![Insn::Label(label)]);
        label
    }

    /// The instructions computing the delegation arguments, between the last
    /// receiver load and the call.
    pub fn prologue<'a>(&self, code: &'a InsnList) -> &'a [Insn] {
        &code.insns[self.load_this_index + 1..self.delegation_index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_created_value_is_tagged() {
        let mut interpreter = ReceiverInterpreter::default();
        let this = interpreter.new_value(Some(&ValueKind::Reference("a/C".into())));
        let other = interpreter.new_value(Some(&ValueKind::Reference("a/C".into())));
        assert_eq!(this, ReceiverValue::UninitializedThis);
        assert_eq!(other, ReceiverValue::Basic(BasicValue::Reference));
        assert_eq!(
            interpreter.merge(&this, &other),
            ReceiverValue::Basic(BasicValue::Uninitialized)
        );
        assert_eq!(interpreter.merge(&this, &this), ReceiverValue::UninitializedThis);
    }

    #[test]
    fn test_unset_locals_do_not_take_the_tag() {
        let mut interpreter = ReceiverInterpreter::default();
        assert_eq!(interpreter.new_value(None), ReceiverValue::Basic(BasicValue::Uninitialized));
        assert_eq!(
            interpreter.new_value(Some(&ValueKind::Int)),
            ReceiverValue::UninitializedThis
        );
    }
}
