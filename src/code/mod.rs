//! Label-based instruction lists.
//!
//! Branches in a decoded code array are byte offsets, which shift whenever
//! an instruction is inserted. `InsnList` replaces every branch operand and
//! exception-table boundary with a [`Label`] placed in the list, so code can
//! be spliced freely and re-assembled into a code array afterwards.

mod assembler;

use std::collections::{BTreeMap, HashMap};

use crate::attribute_info::ExceptionEntry;
use crate::code_attribute::{decode_instructions, Instruction};
use crate::constant_info::ConstantInfo;
use crate::{ClassError, ClassFile};

pub use self::assembler::AssembledCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JumpKind {
    Ifeq,
    Ifne,
    Iflt,
    Ifge,
    Ifgt,
    Ifle,
    IfIcmpeq,
    IfIcmpne,
    IfIcmplt,
    IfIcmpge,
    IfIcmpgt,
    IfIcmple,
    IfAcmpeq,
    IfAcmpne,
    Ifnull,
    Ifnonnull,
    Goto,
    Jsr,
}

impl JumpKind {
    fn from_instruction(instruction: &Instruction) -> Option<JumpKind> {
        Some(match instruction {
            Instruction::Ifeq(_) => JumpKind::Ifeq,
            Instruction::Ifne(_) => JumpKind::Ifne,
            Instruction::Iflt(_) => JumpKind::Iflt,
            Instruction::Ifge(_) => JumpKind::Ifge,
            Instruction::Ifgt(_) => JumpKind::Ifgt,
            Instruction::Ifle(_) => JumpKind::Ifle,
            Instruction::IfIcmpeq(_) => JumpKind::IfIcmpeq,
            Instruction::IfIcmpne(_) => JumpKind::IfIcmpne,
            Instruction::IfIcmplt(_) => JumpKind::IfIcmplt,
            Instruction::IfIcmpge(_) => JumpKind::IfIcmpge,
            Instruction::IfIcmpgt(_) => JumpKind::IfIcmpgt,
            Instruction::IfIcmple(_) => JumpKind::IfIcmple,
            Instruction::IfAcmpeq(_) => JumpKind::IfAcmpeq,
            Instruction::IfAcmpne(_) => JumpKind::IfAcmpne,
            Instruction::Ifnull(_) => JumpKind::Ifnull,
            Instruction::Ifnonnull(_) => JumpKind::Ifnonnull,
            Instruction::Goto(_) | Instruction::GotoW(_) => JumpKind::Goto,
            Instruction::Jsr(_) | Instruction::JsrW(_) => JumpKind::Jsr,
            _ => return None,
        })
    }

    pub(crate) fn to_instruction(self, offset: i16) -> Instruction {
        match self {
            JumpKind::Ifeq => Instruction::Ifeq(offset),
            JumpKind::Ifne => Instruction::Ifne(offset),
            JumpKind::Iflt => Instruction::Iflt(offset),
            JumpKind::Ifge => Instruction::Ifge(offset),
            JumpKind::Ifgt => Instruction::Ifgt(offset),
            JumpKind::Ifle => Instruction::Ifle(offset),
            JumpKind::IfIcmpeq => Instruction::IfIcmpeq(offset),
            JumpKind::IfIcmpne => Instruction::IfIcmpne(offset),
            JumpKind::IfIcmplt => Instruction::IfIcmplt(offset),
            JumpKind::IfIcmpge => Instruction::IfIcmpge(offset),
            JumpKind::IfIcmpgt => Instruction::IfIcmpgt(offset),
            JumpKind::IfIcmple => Instruction::IfIcmple(offset),
            JumpKind::IfAcmpeq => Instruction::IfAcmpeq(offset),
            JumpKind::IfAcmpne => Instruction::IfAcmpne(offset),
            JumpKind::Ifnull => Instruction::Ifnull(offset),
            JumpKind::Ifnonnull => Instruction::Ifnonnull(offset),
            JumpKind::Goto => Instruction::Goto(offset),
            JumpKind::Jsr => Instruction::Jsr(offset),
        }
    }

    pub fn is_conditional(self) -> bool {
        !matches!(self, JumpKind::Goto | JumpKind::Jsr)
    }

    /// Branch taken exactly when `self` falls through.
    pub(crate) fn inverse(self) -> Option<JumpKind> {
        Some(match self {
            JumpKind::Ifeq => JumpKind::Ifne,
            JumpKind::Ifne => JumpKind::Ifeq,
            JumpKind::Iflt => JumpKind::Ifge,
            JumpKind::Ifge => JumpKind::Iflt,
            JumpKind::Ifgt => JumpKind::Ifle,
            JumpKind::Ifle => JumpKind::Ifgt,
            JumpKind::IfIcmpeq => JumpKind::IfIcmpne,
            JumpKind::IfIcmpne => JumpKind::IfIcmpeq,
            JumpKind::IfIcmplt => JumpKind::IfIcmpge,
            JumpKind::IfIcmpge => JumpKind::IfIcmplt,
            JumpKind::IfIcmpgt => JumpKind::IfIcmple,
            JumpKind::IfIcmple => JumpKind::IfIcmpgt,
            JumpKind::IfAcmpeq => JumpKind::IfAcmpne,
            JumpKind::IfAcmpne => JumpKind::IfAcmpeq,
            JumpKind::Ifnull => JumpKind::Ifnonnull,
            JumpKind::Ifnonnull => JumpKind::Ifnull,
            JumpKind::Goto | JumpKind::Jsr => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Insn {
    /// Position marker; encodes to nothing.
    Label(Label),
    /// Any instruction without a branch operand.
    Plain(Instruction),
    Jump {
        kind: JumpKind,
        target: Label,
    },
    TableSwitch {
        low: i32,
        default: Label,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
}

impl Insn {
    pub fn as_plain(&self) -> Option<&Instruction> {
        match self {
            Insn::Plain(instruction) => Some(instruction),
            _ => None,
        }
    }

    /// Labels this instruction may transfer control to.
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Insn::Jump { target, .. } => vec![*target],
            Insn::TableSwitch { default, targets, .. } => {
                let mut all = vec![*default];
                all.extend(targets.iter().copied());
                all
            }
            Insn::LookupSwitch { default, pairs } => {
                let mut all = vec![*default];
                all.extend(pairs.iter().map(|(_, l)| *l));
                all
            }
            _ => Vec::new(),
        }
    }

    /// Whether execution can continue with the next list entry.
    pub fn falls_through(&self) -> bool {
        match self {
            Insn::Label(_) => true,
            Insn::Plain(instruction) => !instruction.ends_flow(),
            Insn::Jump { kind, .. } => kind.is_conditional() || *kind == JumpKind::Jsr,
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => false,
        }
    }
}

impl From<Instruction> for Insn {
    fn from(instruction: Instruction) -> Self {
        Insn::Plain(instruction)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TryCatch {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// Pool index of the caught class; zero catches everything.
    pub catch_type: u16,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InsnList {
    pub insns: Vec<Insn>,
    pub try_catches: Vec<TryCatch>,
    next_label: usize,
}

impl InsnList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn push(&mut self, insn: impl Into<Insn>) {
        self.insns.push(insn.into());
    }

    pub fn place(&mut self, label: Label) {
        self.insns.push(Insn::Label(label));
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Decodes a code array, turning every branch target and handler
    /// boundary into a label.
    pub fn from_code(code: &[u8], exception_table: &[ExceptionEntry]) -> Result<Self, ClassError> {
        let decoded = decode_instructions(code)?;
        let end = code.len() as u32;
        let starts: std::collections::HashSet<u32> = decoded.iter().map(|(a, _)| *a).collect();

        let mut list = InsnList::new();
        let mut labels: BTreeMap<u32, Label> = BTreeMap::new();
        let mut label_at = |list: &mut InsnList, address: i64| -> Result<Label, ClassError> {
            let address = u32::try_from(address).map_err(|_| ClassError::BadCodeOffset(u32::MAX))?;
            if address != end && !starts.contains(&address) {
                return Err(ClassError::BadCodeOffset(address));
            }
            Ok(*labels.entry(address).or_insert_with(|| list.new_label()))
        };

        let mut converted = Vec::with_capacity(decoded.len());
        for (address, instruction) in &decoded {
            let base = i64::from(*address);
            let insn = if let Some(kind) = JumpKind::from_instruction(instruction) {
                let offset = instruction.branch_offset().unwrap_or_default();
                Insn::Jump {
                    kind,
                    target: label_at(&mut list, base + i64::from(offset))?,
                }
            } else {
                match instruction {
                    Instruction::Tableswitch {
                        default,
                        low,
                        offsets,
                        ..
                    } => Insn::TableSwitch {
                        low: *low,
                        default: label_at(&mut list, base + i64::from(*default))?,
                        targets: offsets
                            .iter()
                            .map(|o| label_at(&mut list, base + i64::from(*o)))
                            .collect::<Result<_, _>>()?,
                    },
                    Instruction::Lookupswitch { default, pairs, .. } => Insn::LookupSwitch {
                        default: label_at(&mut list, base + i64::from(*default))?,
                        pairs: pairs
                            .iter()
                            .map(|(key, o)| Ok((*key, label_at(&mut list, base + i64::from(*o))?)))
                            .collect::<Result<_, ClassError>>()?,
                    },
                    other => Insn::Plain(other.clone()),
                }
            };
            converted.push((*address, insn));
        }

        for entry in exception_table {
            let start = label_at(&mut list, i64::from(entry.start_pc))?;
            let end = label_at(&mut list, i64::from(entry.end_pc))?;
            let handler = label_at(&mut list, i64::from(entry.handler_pc))?;
            list.try_catches.push(TryCatch {
                start,
                end,
                handler,
                catch_type: entry.catch_type,
            });
        }

        for (address, insn) in converted {
            if let Some(label) = labels.get(&address) {
                list.insns.push(Insn::Label(*label));
            }
            list.insns.push(insn);
        }
        if let Some(label) = labels.get(&end) {
            list.insns.push(Insn::Label(*label));
        }
        Ok(list)
    }

    /// Index of every placed label.
    pub fn label_positions(&self) -> HashMap<Label, usize> {
        self.insns
            .iter()
            .enumerate()
            .filter_map(|(i, insn)| match insn {
                Insn::Label(l) => Some((*l, i)),
                _ => None,
            })
            .collect()
    }

    /// Inserts `insns` before position `at`.
    pub fn insert(&mut self, at: usize, insns: Vec<Insn>) {
        self.insns.splice(at..at, insns);
    }

    /// Pool-independent text, one line per real instruction. Labels are
    /// numbered by first reference so equal code compares equal across
    /// classes with different constant pools and line tables.
    pub fn render(&self, pool: &ClassFile) -> Vec<String> {
        let mut numbering: HashMap<Label, usize> = HashMap::new();
        let mut name = |label: Label| {
            let next = numbering.len();
            format!("L{}", *numbering.entry(label).or_insert(next))
        };
        let mut lines = Vec::with_capacity(self.insns.len());
        for insn in &self.insns {
            let line = match insn {
                Insn::Label(l) => format!("{}:", name(*l)),
                Insn::Plain(instruction) => render_instruction(pool, instruction),
                Insn::Jump { kind, target } => format!("{:?} {}", kind, name(*target)),
                Insn::TableSwitch { low, default, targets } => {
                    let targets: Vec<String> = targets.iter().map(|t| name(*t)).collect();
                    format!("Tableswitch {} [{}] default {}", low, targets.join(" "), name(*default))
                }
                Insn::LookupSwitch { default, pairs } => {
                    let pairs: Vec<String> = pairs.iter().map(|(k, t)| format!("{}:{}", k, name(*t))).collect();
                    format!("Lookupswitch [{}] default {}", pairs.join(" "), name(*default))
                }
            };
            lines.push(line);
        }
        for tc in &self.try_catches {
            let caught = match tc.catch_type {
                0 => "*".to_owned(),
                index => pool.class_name(index).unwrap_or("?").to_owned(),
            };
            lines.push(format!(
                "try {} {} catch {} {}",
                name(tc.start),
                name(tc.end),
                caught,
                name(tc.handler)
            ));
        }
        lines
    }

    /// Rewrites every constant-pool operand from `from`'s numbering into `to`'s,
    /// adding entries to `to` as needed.
    pub fn import_constants(&mut self, from: &ClassFile, to: &mut ClassFile) -> Result<(), ClassError> {
        for insn in &mut self.insns {
            if let Insn::Plain(instruction) = insn {
                if let Some(index) = instruction.pool_index() {
                    if matches!(instruction, Instruction::Invokedynamic { .. }) {
                        return Err(ClassError::Malformed(
                            "invokedynamic call sites cannot move between classes".into(),
                        ));
                    }
                    let moved = to.import_entry(from, index)?;
                    *instruction = instruction.with_pool_index(moved);
                }
            }
        }
        for tc in &mut self.try_catches {
            if tc.catch_type != 0 {
                tc.catch_type = to.import_entry(from, tc.catch_type)?;
            }
        }
        Ok(())
    }
}

fn render_instruction(pool: &ClassFile, instruction: &Instruction) -> String {
    let Some(index) = instruction.pool_index() else {
        return format!("{:?}", instruction);
    };
    let debug = format!("{:?}", instruction);
    let mnemonic = match instruction {
        Instruction::Ldc(_) | Instruction::LdcW(_) => "Ldc",
        _ => debug.split(|c: char| c == '(' || c == ' ').next().unwrap_or(&debug),
    };
    let extra = match instruction {
        Instruction::Multianewarray { dimensions, .. } => format!(" dims={}", dimensions),
        _ => String::new(),
    };
    format!("{} {}{}", mnemonic, describe_constant(pool, index), extra)
}

fn describe_constant(pool: &ClassFile, index: u16) -> String {
    let Ok(entry) = pool.entry(index) else {
        return format!("#{}", index);
    };
    match entry {
        ConstantInfo::Integer(c) => format!("int {}", c.value),
        ConstantInfo::Float(c) => format!("float {:#x}", c.value.to_bits()),
        ConstantInfo::Long(c) => format!("long {}", c.value),
        ConstantInfo::Double(c) => format!("double {:#x}", c.value.to_bits()),
        ConstantInfo::String(s) => format!("{:?}", pool.utf8(s.string_index).unwrap_or("?")),
        ConstantInfo::Class(_) => format!("class {}", pool.class_name(index).unwrap_or("?")),
        ConstantInfo::FieldRef(_) | ConstantInfo::MethodRef(_) | ConstantInfo::InterfaceMethodRef(_) => {
            match pool.member_ref(index) {
                Ok(r) => format!("{}.{}{}", r.owner, r.name, r.descriptor),
                Err(_) => format!("#{}", index),
            }
        }
        ConstantInfo::MethodType(mt) => format!("methodtype {}", pool.utf8(mt.descriptor_index).unwrap_or("?")),
        ConstantInfo::MethodHandle(mh) => {
            format!("handle {} {}", mh.reference_kind, describe_constant(pool, mh.reference_index))
        }
        ConstantInfo::InvokeDynamic(indy) => match pool.name_and_type(indy.name_and_type_index) {
            Ok((name, desc)) => format!("indy#{} {}{}", indy.bootstrap_method_attr_index, name, desc),
            Err(_) => format!("#{}", index),
        },
        other => format!("{} #{}", other.tag_name(), index),
    }
}
