use std::num::NonZeroI32;

use classfile_hotswap::bytecode::{ClassBuilder, MethodBody, MethodGenerator};
use classfile_hotswap::code_attribute::Instruction;
use classfile_hotswap::descriptor::JvmType;
use classfile_hotswap::diff::{compare, ChangeVerdict, DISABLE_ANNOTATION};
use classfile_hotswap::error::InstrumentError;
use classfile_hotswap::field_info::FieldAccessFlags;
use classfile_hotswap::instrument::{instrument, InstrumentOptions};
use classfile_hotswap::method_info::MethodAccessFlags;
use classfile_hotswap::unit::{Annotation, CompiledUnit};
use classfile_hotswap::ClassAccessFlags;
use pretty_assertions::assert_eq;

const SLOT: &str = "Getstatic shapes/C.$changeLhotswap/runtime/PatchProvider;";

#[test]
fn test_constructor_split_after_super() {
    init_tracing();
    let original = circle(|_| {});
    let (instrumented, skeleton) = instrument(&original, &InstrumentOptions::default()).unwrap();
    assert!(instrumented.redirected.contains(&"<init>.(II)V".to_owned()));
    assert!(instrumented.excluded_constructors.is_empty());

    let unit = CompiledUnit::parse(&instrumented.to_bytes().unwrap()).unwrap();
    let init = code_lines(&unit, "<init>", "(II)V");
    assert_eq!(init[3], "Invokespecial shapes/H.<init>()V");
    assert_eq!(init[6], "Invokespecial java/lang/Object.<init>()V");
    assert_eq!(init[7], SLOT);
    assert!(init.contains(&"Ldc \"init$body.(II)V\"".to_owned()));
    assert_eq!(
        &init[init.len() - 4..],
        ["Aload0", "Iload2", "Putfield shapes/C.yI", "Return"]
    );

    assert!(skeleton.handlers.contains(&"init$args.(II)V".to_owned()));
    assert!(skeleton.handlers.contains(&"init$body.(II)V".to_owned()));

    // adding an unrelated public method is reported, not hidden by the rewrite
    let updated = circle(|b| {
        method(b, MethodAccessFlags::PUBLIC, "perimeter", "()I", 1, |g| {
            g.push_int(0).unwrap();
            g.emit(Instruction::Ireturn);
        });
    });
    assert_eq!(compare(&original, &updated).unwrap(), ChangeVerdict::MethodAdded);
}

#[test]
fn test_methods_get_a_redirect_prologue() {
    let (instrumented, _) = instrument(&circle(|_| {}), &InstrumentOptions::default()).unwrap();
    for key in ["size.()I", "twice.()I", "total.()I", "zero.()I", "describe.()Ljava/lang/String;"] {
        assert!(instrumented.redirected.contains(&key.to_owned()), "{} not redirected", key);
    }

    let unit = CompiledUnit::parse(&instrumented.to_bytes().unwrap()).unwrap();
    let slot = unit.field("$change", "Lhotswap/runtime/PatchProvider;").unwrap();
    assert!(slot.access_flags.contains(
        FieldAccessFlags::PUBLIC | FieldAccessFlags::STATIC | FieldAccessFlags::VOLATILE | FieldAccessFlags::SYNTHETIC
    ));

    let size = code_lines(&unit, "size", "()I");
    assert_eq!(size[0], SLOT);
    assert!(size.contains(&"Ldc \"size.()I\"".to_owned()));
    assert!(size.iter().any(|l| l.starts_with(
        "Invokeinterface hotswap/runtime/PatchProvider.invoke(Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;"
    )));
    assert!(size.contains(&"Getstatic hotswap/runtime/PatchProvider.MISSINGLjava/lang/Object;".to_owned()));
    assert!(size.contains(&"Invokevirtual java/lang/Number.intValue()I".to_owned()));
    assert_eq!(&size[size.len() - 3..], ["Aload0", "Getfield shapes/C.yI", "Ireturn"]);

    // the private field stays private, other members are widened
    assert!(unit.field("y", "I").unwrap().access_flags.contains(FieldAccessFlags::PRIVATE));
    assert!(unit.field("label", "Ljava/lang/String;").unwrap().access_flags.contains(FieldAccessFlags::PUBLIC));
    assert!(unit.access_flags.contains(ClassAccessFlags::SUPER));
}

#[test]
fn test_skeleton_handlers() {
    let (_, skeleton) = instrument(&circle(|_| {}), &InstrumentOptions::default()).unwrap();
    assert_eq!(skeleton.name, "shapes/C$override");
    assert!(skeleton.dropped.is_empty());
    assert_eq!(skeleton.handlers.len(), 7);

    let unit = CompiledUnit::parse(&skeleton.to_bytes().unwrap()).unwrap();
    assert_eq!(unit.interfaces, vec!["hotswap/runtime/PatchProvider".to_owned()]);

    let size = code_lines(&unit, "size", "(Lshapes/C;)I");
    assert!(size.contains(
        &"Invokestatic hotswap/runtime/PatchRuntime.getPrivateField(Ljava/lang/Object;Ljava/lang/String;)Ljava/lang/Object;"
            .to_owned()
    ));
    assert!(!size.iter().any(|l| l.starts_with("Getfield")));

    let body = code_lines(&unit, "init$body", "(Lshapes/C;II)V");
    assert!(body.iter().any(|l| l.contains("PatchRuntime.setPrivateField")));

    let args = code_lines(&unit, "init$args", "(Lshapes/C;II)[Ljava/lang/Object;");
    assert!(args.contains(&"Ldc \"java/lang/Object.()V\"".to_owned()));
    assert_eq!(args.last().map(String::as_str), Some("Areturn"));

    let total = code_lines(&unit, "total", "(Lshapes/C;)I");
    assert!(total.contains(&"Invokestatic shapes/C$override.twice(Lshapes/C;)I".to_owned()));

    let describe = code_lines(&unit, "describe", "(Lshapes/C;)Ljava/lang/String;");
    assert!(describe.contains(&"Ldc \"toString.()Ljava/lang/String;\"".to_owned()));
    assert!(describe.contains(
        &"Invokestatic shapes/C.access$super(Lshapes/C;Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;".to_owned()
    ));

    let zero = unit.method("zero", "()I").unwrap();
    assert!(zero.is_static());

    let invoke = code_lines(&unit, "invoke", "(Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;");
    assert!(invoke.iter().any(|l| l.starts_with("Lookupswitch")));
    assert_eq!(count(&invoke, "java/lang/String.equals"), 7);
    assert!(invoke.contains(&"Ldc \"init$\"".to_owned()));
    assert!(invoke.contains(&"Athrow".to_owned()));
}

#[test]
fn test_super_entry_covers_ancestors() {
    let base = ancestor();
    let unit = circle_extending("shapes/Base", |_| {});
    let options = InstrumentOptions {
        ancestors: vec![base],
        ..InstrumentOptions::default()
    };
    let (instrumented, _) = instrument(&unit, &options).unwrap();
    let unit = CompiledUnit::parse(&instrumented.to_bytes().unwrap()).unwrap();

    let entry = unit
        .method(
            "access$super",
            "(Lshapes/C;Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;",
        )
        .unwrap();
    assert!(entry.is_static());
    let lines = unit.render_method(entry).unwrap();
    assert!(lines.contains(&"Invokespecial shapes/Base.area()I".to_owned()));
    assert!(lines.contains(&"Invokespecial shapes/Base.reset(J)V".to_owned()));
    assert!(!lines.iter().any(|l| l.contains("secret") || l.contains("util")));
    assert!(lines.contains(&"New class hotswap/runtime/MissingPatchTargetException".to_owned()));
    assert!(lines.contains(&"Ldc \"shapes.C\"".to_owned()));
}

#[test]
fn test_prologue_locals_are_carried_to_the_body() {
    let unit = circle(|b| {
        // C(int x) { int z = x + 1; super(); this.y = z; }
        method(b, MethodAccessFlags::PUBLIC, "<init>", "(I)V", 2, |g| {
            let z = g.new_local(&JvmType::Int);
            g.emit(Instruction::Iload1);
            g.emit(Instruction::Iconst1);
            g.emit(Instruction::Iadd);
            g.store(&JvmType::Int, z);
            g.load_this();
            g.invoke_special("java/lang/Object", "<init>", "()V").unwrap();
            g.load_this();
            g.load(&JvmType::Int, z);
            g.put_field("shapes/C", "y", "I").unwrap();
            g.emit(Instruction::Return);
        });
    });
    let (instrumented, skeleton) = instrument(&unit, &InstrumentOptions::default()).unwrap();
    assert!(instrumented.excluded_constructors.is_empty());
    assert!(instrumented.redirected.contains(&"<init>.(I)V".to_owned()));
    assert!(skeleton.dropped.is_empty());

    let after = CompiledUnit::parse(&instrumented.to_bytes().unwrap()).unwrap();
    let constructor = code_lines(&after, "<init>", "(I)V");
    assert!(constructor.contains(&"Ldc \"init$body.(I)V\"".to_owned()));
    assert_eq!(count(&constructor, "Anewarray class java/lang/Object"), 2);
    assert_eq!(count(&constructor, "Invokestatic java/lang/Integer.valueOf(I)Ljava/lang/Integer;"), 2);

    let companion = CompiledUnit::parse(&skeleton.to_bytes().unwrap()).unwrap();
    let body = code_lines(&companion, "init$body", "(Lshapes/C;I[Ljava/lang/Object;)V");
    let restore = body.iter().position(|l| l == "Istore2").unwrap();
    assert!(body[..restore].contains(&"Checkcast class java/lang/Number".to_owned()));
    assert!(body[..restore].contains(&"Invokevirtual java/lang/Number.intValue()I".to_owned()));
    assert!(body[restore..].iter().any(|l| l.contains("PatchRuntime.setPrivateField")));

    let args = code_lines(&companion, "init$args", "(Lshapes/C;I[Ljava/lang/Object;)[Ljava/lang/Object;");
    assert!(args.contains(&"Istore2".to_owned()));
    assert!(args.contains(&"Ldc \"java/lang/Object.()V\"".to_owned()));
    assert_eq!(args.last().map(String::as_str), Some("Areturn"));
}

/// Adds `private C() { super(); }`, which a companion cannot call.
fn private_constructor(b: &mut ClassBuilder) {
    method(b, MethodAccessFlags::PRIVATE, "<init>", "()V", 1, |g| {
        g.load_this();
        g.invoke_special("java/lang/Object", "<init>", "()V").unwrap();
        g.emit(Instruction::Return);
    });
}

#[test]
fn test_constructor_without_body_handler_is_excluded() {
    let unit = circle(|b| {
        private_constructor(b);
        // C(int x) { super(); C other = new C(); } with the allocation not
        // followed by a dup
        method(b, MethodAccessFlags::PUBLIC, "<init>", "(I)V", 2, |g| {
            g.load_this();
            g.invoke_special("java/lang/Object", "<init>", "()V").unwrap();
            g.new_instance("shapes/C").unwrap();
            g.emit(Instruction::Astore2);
            g.emit(Instruction::Aload2);
            g.invoke_special("shapes/C", "<init>", "()V").unwrap();
            g.emit(Instruction::Return);
        });
    });
    let (instrumented, skeleton) = instrument(&unit, &InstrumentOptions::default()).unwrap();
    assert_eq!(instrumented.excluded_constructors, vec!["<init>.(I)V".to_owned()]);
    assert!(!instrumented.redirected.contains(&"<init>.(I)V".to_owned()));
    assert!(skeleton.dropped.contains(&"init$body.(I)V".to_owned()));
    assert!(!skeleton.handlers.iter().any(|k| k.ends_with(".(I)V")));

    let after = CompiledUnit::parse(&instrumented.to_bytes().unwrap()).unwrap();
    assert_eq!(code_lines(&after, "<init>", "(I)V"), code_lines(&unit, "<init>", "(I)V"));
    assert!(instrumented.redirected.contains(&"<init>.(II)V".to_owned()));

    let companion = CompiledUnit::parse(&skeleton.to_bytes().unwrap()).unwrap();
    assert!(companion.method("init$body", "(Lshapes/C;I)V").is_none());
    let invoke = code_lines(&companion, "invoke", "(Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;");
    assert!(!invoke.contains(&"Ldc \"init$body.(I)V\"".to_owned()));
}

#[test]
fn test_method_without_handler_keeps_an_optional_redirect() {
    let unit = circle(|b| {
        private_constructor(b);
        // C copy() { C other = new C(); return other; } without a dup
        method(b, MethodAccessFlags::PUBLIC, "copy", "()Lshapes/C;", 1, |g| {
            g.new_instance("shapes/C").unwrap();
            g.emit(Instruction::Astore1);
            g.emit(Instruction::Aload1);
            g.invoke_special("shapes/C", "<init>", "()V").unwrap();
            g.emit(Instruction::Aload1);
            g.emit(Instruction::Areturn);
        });
    });
    let (instrumented, skeleton) = instrument(&unit, &InstrumentOptions::default()).unwrap();
    let key = "copy.()Lshapes/C;".to_owned();
    assert!(skeleton.dropped.contains(&key));
    assert!(!skeleton.handlers.contains(&key));
    assert!(instrumented.redirected.contains(&key));

    let after = CompiledUnit::parse(&instrumented.to_bytes().unwrap()).unwrap();
    let copy = code_lines(&after, "copy", "()Lshapes/C;");
    assert_eq!(copy[0], SLOT);
    assert!(copy.contains(&"Ldc \"copy.()Lshapes/C;\"".to_owned()));

    let companion = CompiledUnit::parse(&skeleton.to_bytes().unwrap()).unwrap();
    assert!(companion.method("copy", "(Lshapes/C;)Lshapes/C;").is_none());
    let invoke = code_lines(&companion, "invoke", "(Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;");
    assert!(!invoke.contains(&"Ldc \"copy.()Lshapes/C;\"".to_owned()));
    assert!(invoke.contains(&"Getstatic hotswap/runtime/PatchProvider.MISSINGLjava/lang/Object;".to_owned()));
}

#[test]
fn test_disabled_class_keeps_bodies() {
    let unit = circle(|b| {
        b.annotate_class(
            false,
            &Annotation {
                type_descriptor: DISABLE_ANNOTATION.into(),
                entries: Vec::new(),
            },
        )
        .unwrap();
    });
    let (instrumented, skeleton) = instrument(&unit, &InstrumentOptions::default()).unwrap();
    assert!(instrumented.redirected.is_empty());
    assert!(skeleton.handlers.is_empty());

    let after = CompiledUnit::parse(&instrumented.to_bytes().unwrap()).unwrap();
    assert!(after.field("$change", "Lhotswap/runtime/PatchProvider;").is_some());
    assert_eq!(code_lines(&after, "size", "()I"), code_lines(&unit, "size", "()I"));
}

#[test]
fn test_forced_collisions_in_invoke() {
    let options = InstrumentOptions {
        collision_modulus: NonZeroI32::new(2),
        ..InstrumentOptions::default()
    };
    let (_, skeleton) = instrument(&circle(|_| {}), &options).unwrap();
    let unit = CompiledUnit::parse(&skeleton.to_bytes().unwrap()).unwrap();
    let invoke = code_lines(&unit, "invoke", "(Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/Object;");
    assert!(invoke.contains(&"Irem".to_owned()));
    assert_eq!(count(&invoke, "java/lang/String.equals"), skeleton.handlers.len());
}

#[test]
fn test_interfaces_are_rejected() {
    let builder = ClassBuilder::new("shapes/Shape", "java/lang/Object")
        .with_access(ClassAccessFlags::PUBLIC | ClassAccessFlags::INTERFACE | ClassAccessFlags::ABSTRACT);
    let unit = CompiledUnit::parse(&builder.to_bytes().unwrap()).unwrap();
    match instrument(&unit, &InstrumentOptions::default()) {
        Err(InstrumentError::UnsupportedUnit { name, reason }) => {
            assert_eq!(name, "shapes/Shape");
            assert_eq!(reason, "interface");
        }
        other => panic!("expected rejection, got {:?}", other.map(|(u, _)| u.name)),
    }
}

// --- Helpers ---

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn circle(configure: impl FnOnce(&mut ClassBuilder)) -> CompiledUnit {
    circle_extending("java/lang/Object", configure)
}

/// `shapes/C` with the constructor
/// `C(int x, int y) { helper = new H(); super(); this.y = y; }`
/// and a handful of methods touching private state.
fn circle_extending(super_name: &str, configure: impl FnOnce(&mut ClassBuilder)) -> CompiledUnit {
    let mut builder = ClassBuilder::new("shapes/C", super_name);
    builder.add_field(FieldAccessFlags::PRIVATE, "helper", "Lshapes/H;").unwrap();
    builder.add_field(FieldAccessFlags::PRIVATE, "y", "I").unwrap();
    builder.add_field(FieldAccessFlags::empty(), "label", "Ljava/lang/String;").unwrap();

    method(&mut builder, MethodAccessFlags::PUBLIC, "<init>", "(II)V", 3, |g| {
        g.load_this();
        g.new_instance("shapes/H").unwrap();
        g.emit(Instruction::Dup);
        g.invoke_special("shapes/H", "<init>", "()V").unwrap();
        g.put_field("shapes/C", "helper", "Lshapes/H;").unwrap();
        g.load_this();
        g.invoke_special(super_name, "<init>", "()V").unwrap();
        g.load_this();
        g.emit(Instruction::Iload2);
        g.put_field("shapes/C", "y", "I").unwrap();
        g.emit(Instruction::Return);
    });
    method(&mut builder, MethodAccessFlags::PUBLIC, "size", "()I", 1, |g| {
        g.load_this();
        g.get_field("shapes/C", "y", "I").unwrap();
        g.emit(Instruction::Ireturn);
    });
    method(&mut builder, MethodAccessFlags::PRIVATE, "twice", "()I", 1, |g| {
        g.load_this();
        g.invoke_virtual("shapes/C", "size", "()I").unwrap();
        g.push_int(2).unwrap();
        g.emit(Instruction::Imul);
        g.emit(Instruction::Ireturn);
    });
    method(&mut builder, MethodAccessFlags::PUBLIC, "total", "()I", 1, |g| {
        g.load_this();
        g.invoke_special("shapes/C", "twice", "()I").unwrap();
        g.emit(Instruction::Ireturn);
    });
    method(&mut builder, MethodAccessFlags::PUBLIC, "describe", "()Ljava/lang/String;", 1, |g| {
        g.load_this();
        g.invoke_special(super_name, "toString", "()Ljava/lang/String;").unwrap();
        g.emit(Instruction::Areturn);
    });
    method(
        &mut builder,
        MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
        "zero",
        "()I",
        0,
        |g| {
            g.push_int(0).unwrap();
            g.emit(Instruction::Ireturn);
        },
    );
    configure(&mut builder);
    CompiledUnit::parse(&builder.to_bytes().unwrap()).unwrap()
}

/// `shapes/Base` with one method of each kind the super entry point filters.
fn ancestor() -> CompiledUnit {
    let mut builder = ClassBuilder::new("shapes/Base", "java/lang/Object");
    method(&mut builder, MethodAccessFlags::PUBLIC, "area", "()I", 1, |g| {
        g.push_int(1).unwrap();
        g.emit(Instruction::Ireturn);
    });
    method(&mut builder, MethodAccessFlags::PROTECTED, "reset", "(J)V", 3, |g| {
        g.emit(Instruction::Return);
    });
    method(&mut builder, MethodAccessFlags::PRIVATE, "secret", "()V", 1, |g| {
        g.emit(Instruction::Return);
    });
    method(
        &mut builder,
        MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
        "util",
        "()V",
        0,
        |g| g.emit(Instruction::Return),
    );
    CompiledUnit::parse(&builder.to_bytes().unwrap()).unwrap()
}

fn method(
    builder: &mut ClassBuilder,
    flags: MethodAccessFlags,
    name: &str,
    descriptor: &str,
    first_local: u16,
    body: impl FnOnce(&mut MethodGenerator<'_>),
) -> usize {
    let mut generator = builder.generator(first_local);
    body(&mut generator);
    let (instructions, max_locals) = generator.finish();
    builder
        .add_method(flags, name, descriptor, Some(MethodBody { instructions, max_locals }))
        .unwrap()
}

/// Rendered body of a method without its label lines.
fn code_lines(unit: &CompiledUnit, name: &str, descriptor: &str) -> Vec<String> {
    let method = unit.method(name, descriptor).unwrap();
    unit.render_method(method)
        .unwrap()
        .into_iter()
        .filter(|l| !l.ends_with(':'))
        .collect()
}

fn count(lines: &[String], needle: &str) -> usize {
    lines.iter().filter(|l| l.contains(needle)).count()
}
