use classfile_hotswap::analysis::{find_delegation_call, DelegationKind};
use classfile_hotswap::bytecode::{ClassBuilder, MethodBody, MethodGenerator};
use classfile_hotswap::code::Insn;
use classfile_hotswap::code_attribute::Instruction;
use classfile_hotswap::field_info::FieldAccessFlags;
use classfile_hotswap::method_info::MethodAccessFlags;
use classfile_hotswap::unit::CompiledUnit;
use pretty_assertions::assert_eq;

#[test]
fn test_helper_construction_before_super() {
    let unit = class_with_constructor("(II)V", 3, helper_then_super);
    let method = unit.method("<init>", "(II)V").unwrap();
    let split = find_delegation_call(unit.class_file(), &unit.name, method).unwrap();

    assert_eq!(split.delegation_index, 6);
    assert_eq!(split.load_this_index, 5);
    assert_eq!(split.owner, "java/lang/Object");
    assert_eq!(split.descriptor, "()V");
    assert_eq!(split.kind, DelegationKind::Super);
    assert_eq!(split.stack_after_call, 0);

    let code = &method.code.as_ref().unwrap().instructions;
    assert!(split.prologue(code).is_empty());
    let body = split.extract_body(code);
    assert_eq!(
        body.render(unit.class_file()),
        vec!["Aload0", "Iload2", "Putfield shapes/C.yI", "Return"]
    );
}

#[test]
fn test_this_delegation_with_computed_arguments() {
    let unit = class_with_constructor("(I)V", 2, |g| {
        g.load_this();
        g.emit(Instruction::Iload1);
        g.new_instance("shapes/H").unwrap();
        g.emit(Instruction::Dup);
        g.invoke_special("shapes/H", "<init>", "()V").unwrap();
        g.invoke_static("shapes/H", "size", "(Lshapes/H;)I").unwrap();
        g.invoke_special("shapes/C", "<init>", "(II)V").unwrap();
        g.emit(Instruction::Return);
    });
    let method = unit.method("<init>", "(I)V").unwrap();
    let split = find_delegation_call(unit.class_file(), &unit.name, method).unwrap();

    assert_eq!(split.kind, DelegationKind::This);
    assert_eq!(split.delegation_index, 6);
    assert_eq!(split.load_this_index, 0);
    assert_eq!(split.descriptor, "(II)V");
    let code = &method.code.as_ref().unwrap().instructions;
    assert_eq!(split.prologue(code).len(), 5);
}

#[test]
fn test_redirection_point_follows_the_call() {
    let unit = class_with_constructor("(II)V", 3, helper_then_super);
    let method = unit.method("<init>", "(II)V").unwrap();
    let split = find_delegation_call(unit.class_file(), &unit.name, method).unwrap();

    let mut code = method.code.as_ref().unwrap().instructions.clone();
    let before = code.len();
    let label = split.mark_redirection_point(&mut code);
    assert_eq!(code.len(), before + 1);
    assert_eq!(code.insns[split.delegation_index + 1], Insn::Label(label));
    assert!(matches!(
        code.insns[split.delegation_index],
        Insn::Plain(Instruction::Invokespecial(_))
    ));
}

#[test]
fn test_no_delegation_call() {
    let unit = class_with_constructor("()V", 1, |g| {
        g.load_this();
        g.emit(Instruction::Pop);
        g.emit(Instruction::Return);
    });
    let method = unit.method("<init>", "()V").unwrap();
    assert!(find_delegation_call(unit.class_file(), &unit.name, method).is_none());
}

#[test]
fn test_ordinary_methods_have_no_split() {
    let unit = class_with_constructor("(II)V", 3, helper_then_super);
    let method = unit.method("size", "()I").unwrap();
    assert!(find_delegation_call(unit.class_file(), &unit.name, method).is_none());
}

// --- Helpers ---

/// `C(int x, int y) { helper = new H(); super(); this.y = y; }`
fn helper_then_super(g: &mut MethodGenerator<'_>) {
    g.load_this();
    g.new_instance("shapes/H").unwrap();
    g.emit(Instruction::Dup);
    g.invoke_special("shapes/H", "<init>", "()V").unwrap();
    g.put_field("shapes/C", "helper", "Lshapes/H;").unwrap();
    g.load_this();
    g.invoke_special("java/lang/Object", "<init>", "()V").unwrap();
    g.load_this();
    g.emit(Instruction::Iload2);
    g.put_field("shapes/C", "y", "I").unwrap();
    g.emit(Instruction::Return);
}

fn class_with_constructor(
    descriptor: &str,
    first_local: u16,
    body: impl FnOnce(&mut MethodGenerator<'_>),
) -> CompiledUnit {
    let mut builder = ClassBuilder::new("shapes/C", "java/lang/Object");
    builder.add_field(FieldAccessFlags::PRIVATE, "helper", "Lshapes/H;").unwrap();
    builder.add_field(FieldAccessFlags::PRIVATE, "y", "I").unwrap();

    let mut generator = builder.generator(first_local);
    body(&mut generator);
    let (instructions, max_locals) = generator.finish();
    builder
        .add_method(
            MethodAccessFlags::PUBLIC,
            "<init>",
            descriptor,
            Some(MethodBody { instructions, max_locals }),
        )
        .unwrap();

    let mut generator = builder.generator(1);
    generator.load_this();
    generator.get_field("shapes/C", "y", "I").unwrap();
    generator.emit(Instruction::Ireturn);
    let (instructions, max_locals) = generator.finish();
    builder
        .add_method(
            MethodAccessFlags::PUBLIC,
            "size",
            "()I",
            Some(MethodBody { instructions, max_locals }),
        )
        .unwrap();

    CompiledUnit::parse(&builder.to_bytes().unwrap()).unwrap()
}
