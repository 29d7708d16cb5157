//! Fixpoint dataflow over label-based instruction lists.
//!
//! [`Analyzer`] simulates the operand stack and local variables of every
//! reachable instruction, merging frames at control-flow joins with a
//! worklist until nothing changes. What a value *is* is decided by an
//! [`Interpreter`]. The basic one only tracks value sizes; the constructor
//! one additionally tags the uninitialized receiver.

mod basic;
mod constructor;
mod effect;
mod typed;

use std::collections::VecDeque;
use std::fmt::Debug;

use tracing::trace;

use crate::code::{Insn, InsnList, JumpKind};
use crate::descriptor::MethodDescriptor;
use crate::error::AnalyzerError;
use crate::ClassFile;

pub use self::basic::{compute_max_stack, BasicInterpreter, BasicValue};
pub use self::constructor::{find_delegation_call, ConstructorSplit, DelegationKind, ReceiverInterpreter, ReceiverValue};
pub use self::effect::ValueKind;
pub use self::typed::TypeInterpreter;
pub(crate) use self::effect::{effect, Effect, StackOp};

/// Processed instructions per list entry before giving up.
const ITERATIONS_PER_INSTRUCTION: usize = 64;

/// Value semantics plugged into the [`Analyzer`].
pub trait Interpreter {
    type Value: Clone + PartialEq + Debug;

    /// A value of `kind`; `None` stands for an unset local or the upper half
    /// of a long/double.
    fn new_value(&mut self, kind: Option<&ValueKind>) -> Self::Value;

    fn merge(&mut self, a: &Self::Value, b: &Self::Value) -> Self::Value;

    /// Stack slots taken by `value` (1 or 2).
    fn size(&self, value: &Self::Value) -> usize;
}

/// Locals and operand stack before an instruction runs. Long and double
/// locals occupy two entries; stack entries are one per value.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame<V> {
    pub locals: Vec<V>,
    pub stack: Vec<V>,
}

/// The method being analyzed.
#[derive(Clone, Copy, Debug)]
pub struct MethodContext<'a> {
    pub owner: &'a str,
    pub is_static: bool,
    pub descriptor: &'a MethodDescriptor,
    pub max_locals: u16,
}

#[derive(Clone, Debug)]
pub struct Analysis<V> {
    /// Frame before each entry of the list; `None` where unreachable.
    pub frames: Vec<Option<Frame<V>>>,
    /// Largest operand stack seen, in slots.
    pub max_stack: u16,
}

pub struct Analyzer<'p, I> {
    interpreter: I,
    pool: &'p ClassFile,
}

impl<'p, I: Interpreter> Analyzer<'p, I> {
    pub fn new(interpreter: I, pool: &'p ClassFile) -> Self {
        Analyzer { interpreter, pool }
    }

    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }

    pub fn analyze(&mut self, method: MethodContext<'_>, list: &InsnList) -> Result<Analysis<I::Value>, AnalyzerError> {
        let count = list.insns.len();
        let mut frames: Vec<Option<Frame<I::Value>>> = vec![None; count];
        if count == 0 {
            return Ok(Analysis { frames, max_stack: 0 });
        }

        let labels = list.label_positions();
        let handlers = list
            .try_catches
            .iter()
            .map(|tc| {
                let start = labels.get(&tc.start).copied().unwrap_or(count);
                let end = labels.get(&tc.end).copied().unwrap_or(count);
                let handler = labels.get(&tc.handler).copied().ok_or(AnalyzerError::FallOff)?;
                let caught = match tc.catch_type {
                    0 => "java/lang/Throwable",
                    index => self.pool.class_name(index).map_err(|_| AnalyzerError::Reference(index))?,
                };
                Ok((start, end, handler, ValueKind::Reference(caught.to_owned())))
            })
            .collect::<Result<Vec<_>, AnalyzerError>>()?;

        let entry = self.entry_frame(&method)?;
        let mut max_stack = 0usize;
        frames[0] = Some(entry);
        let mut queue: VecDeque<usize> = VecDeque::from([0]);
        let mut queued = vec![false; count];
        queued[0] = true;
        let limit = count * ITERATIONS_PER_INSTRUCTION + 1024;
        let mut steps = 0usize;

        while let Some(index) = queue.pop_front() {
            queued[index] = false;
            steps += 1;
            if steps > limit {
                return Err(AnalyzerError::NonConvergence(steps));
            }
            let Some(before) = frames[index].clone() else {
                continue;
            };
            let insn = &list.insns[index];
            let after = self.execute(index, insn, &before)?;
            max_stack = max_stack.max(self.stack_slots(&after.stack));
            trace!(index, ?insn, stack = after.stack.len(), "simulated");

            let mut successors = Vec::new();
            if insn.falls_through() {
                if index + 1 >= count {
                    return Err(AnalyzerError::FallOff);
                }
                successors.push(index + 1);
            }
            for target in insn.targets() {
                successors.push(*labels.get(&target).ok_or(AnalyzerError::FallOff)?);
            }
            for next in successors {
                self.merge_into(&mut frames, &mut queue, &mut queued, next, &after)?;
            }

            for (start, end, handler, caught) in &handlers {
                if (*start..*end).contains(&index) {
                    let thrown = self.interpreter.new_value(Some(caught));
                    max_stack = max_stack.max(self.interpreter.size(&thrown));
                    for locals in [&before.locals, &after.locals] {
                        let exceptional = Frame {
                            locals: locals.clone(),
                            stack: vec![self.interpreter.new_value(Some(caught))],
                        };
                        self.merge_into(&mut frames, &mut queue, &mut queued, *handler, &exceptional)?;
                    }
                }
            }
        }

        Ok(Analysis {
            frames,
            max_stack: u16::try_from(max_stack).unwrap_or(u16::MAX),
        })
    }

    fn entry_frame(&mut self, method: &MethodContext<'_>) -> Result<Frame<I::Value>, AnalyzerError> {
        let mut locals = Vec::with_capacity(usize::from(method.max_locals));
        if !method.is_static {
            locals.push(
                self.interpreter
                    .new_value(Some(&ValueKind::Reference(method.owner.to_owned()))),
            );
        }
        for param in &method.descriptor.params {
            let kind = ValueKind::of(param);
            let wide = kind.as_ref().is_some_and(ValueKind::is_wide);
            locals.push(self.interpreter.new_value(kind.as_ref()));
            if wide {
                locals.push(self.interpreter.new_value(None));
            }
        }
        if locals.len() > usize::from(method.max_locals) {
            return Err(AnalyzerError::LocalOutOfRange {
                index: 0,
                slot: locals.len() - 1,
            });
        }
        while locals.len() < usize::from(method.max_locals) {
            locals.push(self.interpreter.new_value(None));
        }
        Ok(Frame { locals, stack: Vec::new() })
    }

    fn merge_into(
        &mut self,
        frames: &mut [Option<Frame<I::Value>>],
        queue: &mut VecDeque<usize>,
        queued: &mut [bool],
        index: usize,
        incoming: &Frame<I::Value>,
    ) -> Result<(), AnalyzerError> {
        let changed = match &frames[index] {
            None => {
                frames[index] = Some(incoming.clone());
                true
            }
            Some(existing) => {
                if existing.stack.len() != incoming.stack.len() {
                    return Err(AnalyzerError::StackMismatch {
                        index,
                        left: existing.stack.len(),
                        right: incoming.stack.len(),
                    });
                }
                let merged = Frame {
                    locals: existing
                        .locals
                        .iter()
                        .zip(&incoming.locals)
                        .map(|(a, b)| self.interpreter.merge(a, b))
                        .collect(),
                    stack: existing
                        .stack
                        .iter()
                        .zip(&incoming.stack)
                        .map(|(a, b)| self.interpreter.merge(a, b))
                        .collect(),
                };
                if &merged == existing {
                    false
                } else {
                    frames[index] = Some(merged);
                    true
                }
            }
        };
        if changed && !queued[index] {
            queued[index] = true;
            queue.push_back(index);
        }
        Ok(())
    }

    fn stack_slots(&self, stack: &[I::Value]) -> usize {
        stack.iter().map(|v| self.interpreter.size(v)).sum()
    }

    fn execute(&mut self, index: usize, insn: &Insn, before: &Frame<I::Value>) -> Result<Frame<I::Value>, AnalyzerError> {
        let mut frame = before.clone();
        match insn {
            Insn::Label(_) => {}
            Insn::Jump { kind, .. } => {
                let pops = match kind {
                    JumpKind::Goto => 0,
                    JumpKind::Jsr => return Err(AnalyzerError::Subroutine),
                    JumpKind::IfIcmpeq
                    | JumpKind::IfIcmpne
                    | JumpKind::IfIcmplt
                    | JumpKind::IfIcmpge
                    | JumpKind::IfIcmpgt
                    | JumpKind::IfIcmple
                    | JumpKind::IfAcmpeq
                    | JumpKind::IfAcmpne => 2,
                    _ => 1,
                };
                pop_n(&mut frame.stack, pops, index)?;
            }
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => pop_n(&mut frame.stack, 1, index)?,
            Insn::Plain(instruction) => match effect(self.pool, index, instruction)? {
                Effect::Compute { pops, push } => {
                    pop_n(&mut frame.stack, pops, index)?;
                    if let Some(kind) = push {
                        frame.stack.push(self.interpreter.new_value(Some(&kind)));
                    }
                }
                Effect::Load(slot) => {
                    let value = local(&frame, slot, index)?.clone();
                    frame.stack.push(value);
                }
                Effect::Store(slot) => {
                    let value = frame.stack.pop().ok_or(AnalyzerError::StackUnderflow(index))?;
                    self.store(&mut frame, slot, value, index)?;
                }
                Effect::Increment(slot) => {
                    local(&frame, slot, index)?;
                    let value = self.interpreter.new_value(Some(&ValueKind::Int));
                    frame.locals[usize::from(slot)] = value;
                }
                Effect::Stack(op) => self.stack_op(&mut frame.stack, op, index)?,
            },
        }
        Ok(frame)
    }

    fn store(&mut self, frame: &mut Frame<I::Value>, slot: u16, value: I::Value, index: usize) -> Result<(), AnalyzerError> {
        let slot = usize::from(slot);
        let wide = self.interpreter.size(&value) == 2;
        let last = slot + usize::from(wide);
        if last >= frame.locals.len() {
            return Err(AnalyzerError::LocalOutOfRange { index, slot: last });
        }
        // Overwriting the upper half of a wide local invalidates it.
        if slot > 0 && self.interpreter.size(&frame.locals[slot - 1]) == 2 {
            frame.locals[slot - 1] = self.interpreter.new_value(None);
        }
        frame.locals[slot] = value;
        if wide {
            frame.locals[slot + 1] = self.interpreter.new_value(None);
        }
        Ok(())
    }

    fn stack_op(&self, stack: &mut Vec<I::Value>, op: StackOp, index: usize) -> Result<(), AnalyzerError> {
        let pop = |stack: &mut Vec<I::Value>| stack.pop().ok_or(AnalyzerError::StackUnderflow(index));
        let wide = |v: &I::Value| self.interpreter.size(v) == 2;
        match op {
            StackOp::Pop => {
                pop(stack)?;
            }
            StackOp::Pop2 => {
                let v1 = pop(stack)?;
                if !wide(&v1) {
                    pop(stack)?;
                }
            }
            StackOp::Dup => {
                let v1 = pop(stack)?;
                stack.extend([v1.clone(), v1]);
            }
            StackOp::DupX1 => {
                let v1 = pop(stack)?;
                let v2 = pop(stack)?;
                stack.extend([v1.clone(), v2, v1]);
            }
            StackOp::DupX2 => {
                let v1 = pop(stack)?;
                let v2 = pop(stack)?;
                if wide(&v2) {
                    stack.extend([v1.clone(), v2, v1]);
                } else {
                    let v3 = pop(stack)?;
                    stack.extend([v1.clone(), v3, v2, v1]);
                }
            }
            StackOp::Dup2 => {
                let v1 = pop(stack)?;
                if wide(&v1) {
                    stack.extend([v1.clone(), v1]);
                } else {
                    let v2 = pop(stack)?;
                    stack.extend([v2.clone(), v1.clone(), v2, v1]);
                }
            }
            StackOp::Dup2X1 => {
                let v1 = pop(stack)?;
                if wide(&v1) {
                    let v2 = pop(stack)?;
                    stack.extend([v1.clone(), v2, v1]);
                } else {
                    let v2 = pop(stack)?;
                    let v3 = pop(stack)?;
                    stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                }
            }
            StackOp::Dup2X2 => {
                let v1 = pop(stack)?;
                if wide(&v1) {
                    let v2 = pop(stack)?;
                    if wide(&v2) {
                        stack.extend([v1.clone(), v2, v1]);
                    } else {
                        let v3 = pop(stack)?;
                        stack.extend([v1.clone(), v3, v2, v1]);
                    }
                } else {
                    let v2 = pop(stack)?;
                    let v3 = pop(stack)?;
                    if wide(&v3) {
                        stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                    } else {
                        let v4 = pop(stack)?;
                        stack.extend([v2.clone(), v1.clone(), v4, v3, v2, v1]);
                    }
                }
            }
            StackOp::Swap => {
                let v1 = pop(stack)?;
                let v2 = pop(stack)?;
                stack.extend([v1, v2]);
            }
        }
        Ok(())
    }
}

fn pop_n<V>(stack: &mut Vec<V>, n: usize, index: usize) -> Result<(), AnalyzerError> {
    let len = stack.len().checked_sub(n).ok_or(AnalyzerError::StackUnderflow(index))?;
    stack.truncate(len);
    Ok(())
}

fn local<V>(frame: &Frame<V>, slot: u16, index: usize) -> Result<&V, AnalyzerError> {
    frame.locals.get(usize::from(slot)).ok_or(AnalyzerError::LocalOutOfRange {
        index,
        slot: usize::from(slot),
    })
}
