use classfile_hotswap::bytecode::{ClassBuilder, MethodBody};
use classfile_hotswap::code_attribute::Instruction;
use classfile_hotswap::constant_info::{ConstantInfo, IntegerConstant};
use classfile_hotswap::field_info::FieldAccessFlags;
use classfile_hotswap::method_info::MethodAccessFlags;
use classfile_hotswap::unit::{Annotation, AnnotationValue, CompiledUnit};
use classfile_hotswap::{parse_class, ClassError};
use pretty_assertions::assert_eq;

#[test]
fn test_written_class_reads_back_unchanged() {
    let bytes = sample_class().to_bytes().unwrap();
    let class = parse_class(&bytes).unwrap();
    assert_eq!(class.this_class_name().unwrap(), "sample/Shapes");
    assert_eq!(class.super_class_name().unwrap(), Some("java/lang/Object"));
    assert_eq!(class.interface_names().unwrap(), vec!["java/io/Serializable"]);
    assert_eq!(class.to_bytes().unwrap(), bytes);
}

#[test]
fn test_wide_constants_take_two_slots() {
    let class = parse_class(&sample_class().to_bytes().unwrap()).unwrap();
    let long_at = class
        .const_pool
        .iter()
        .position(|c| matches!(c, ConstantInfo::Long(_)))
        .unwrap();
    assert_eq!(class.const_pool[long_at + 1], ConstantInfo::Unusable);
    assert_eq!(class.const_pool_size as usize, class.const_pool.len() + 1);
}

#[test]
fn test_modified_utf8_strings() {
    let mut builder = ClassBuilder::new("sample/Text", "java/lang/Object");
    let mut generator = builder.generator(0);
    generator.push_string("nul\0 and \u{1F600}").unwrap();
    generator.emit(Instruction::Areturn);
    let (instructions, max_locals) = generator.finish();
    builder
        .add_method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "text",
            "()Ljava/lang/String;",
            Some(MethodBody { instructions, max_locals }),
        )
        .unwrap();
    let bytes = builder.to_bytes().unwrap();

    // NUL as C0 80, the emoji as two three-byte surrogates
    assert!(contains(&bytes, &[b'l', 0xc0, 0x80, b' ']));
    assert!(contains(&bytes, &[0xed, 0xa0, 0xbd, 0xed, 0xb8, 0x80]));

    let class = parse_class(&bytes).unwrap();
    assert!(class.find_utf8_index("nul\0 and \u{1F600}").is_some());
}

#[test]
fn test_unit_resolves_members() {
    let unit = CompiledUnit::parse(&sample_class().to_bytes().unwrap()).unwrap();
    assert_eq!(unit.name, "sample/Shapes");
    assert_eq!(unit.fields.len(), 2);
    let sides = unit.field("SIDES", "I").unwrap();
    assert_eq!(
        sides.constant_value,
        Some(ConstantInfo::Integer(IntegerConstant { value: 4 }))
    );

    let area = unit.method("area", "(II)I").unwrap();
    assert_eq!(area.dispatch_key(), "area.(II)I");
    assert_eq!(area.exceptions, vec!["java/lang/IllegalStateException".to_owned()]);
    assert_eq!(area.visible_annotations.len(), 1);
    assert_eq!(
        area.visible_annotations[0].entries[0].1,
        AnnotationValue::Long(1_000_000_000_000)
    );
    let code = area.code.as_ref().unwrap();
    assert_eq!(code.max_stack, 2);
    assert_eq!(code.max_locals, 2);
    assert_eq!(
        unit.render_method(area).unwrap(),
        vec!["Iload0", "Iload1", "Imul", "Ireturn"]
    );
}

#[test]
fn test_garbage_is_an_error() {
    let result = parse_class(b"\xca\xfe\xba\xbe\x00");
    assert!(matches!(result, Err(ClassError::Binary(_))));
    assert!(CompiledUnit::parse(b"not a class").is_err());
}

// --- Helpers ---

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// `public class Shapes implements Serializable` with a constant, a field
/// and a static `int area(int, int)`.
fn sample_class() -> ClassBuilder {
    let mut builder = ClassBuilder::new("sample/Shapes", "java/lang/Object");
    builder.add_interface("java/io/Serializable").unwrap();
    builder
        .add_int_constant(
            FieldAccessFlags::PUBLIC | FieldAccessFlags::STATIC | FieldAccessFlags::FINAL,
            "SIDES",
            4,
        )
        .unwrap();
    builder
        .add_field(FieldAccessFlags::PRIVATE, "name", "Ljava/lang/String;")
        .unwrap();

    let mut generator = builder.generator(2);
    generator.emit(Instruction::Iload0);
    generator.emit(Instruction::Iload1);
    generator.emit(Instruction::Imul);
    generator.emit(Instruction::Ireturn);
    let (instructions, max_locals) = generator.finish();
    let area = builder
        .add_method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "area",
            "(II)I",
            Some(MethodBody { instructions, max_locals }),
        )
        .unwrap();
    builder
        .set_exceptions(area, &["java/lang/IllegalStateException"])
        .unwrap();
    builder
        .annotate_method(
            area,
            true,
            &Annotation {
                type_descriptor: "Lsample/Quota;".into(),
                entries: vec![("nanos".into(), AnnotationValue::Long(1_000_000_000_000))],
            },
        )
        .unwrap();
    builder
}
