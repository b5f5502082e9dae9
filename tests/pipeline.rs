/// End-to-end tests for the Ratsnake back end: textual IR through the
/// assembler into a binary image, executed by the VM, observed through the
/// global table and the stack discipline.
///
/// These tests verify:
///   - literal arithmetic landing in globals
///   - integer/float promotion and string repetition
///   - conditional and unconditional jumps (JMPIF jumps on falsy)
///   - function definition, call, return, and local slots
///   - small-integer and boolean interning through the constant pool
///   - header invariants of the assembled image
///   - the disassembler's view of the instruction stream
use std::io::Cursor;
use std::rc::Rc;

use indoc::indoc;
use pretty_assertions::assert_eq;

use ratsnake::{assemble, disassemble, BytecodeHeader, Value, Vm, HEADER_SIZE};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn image_of(source: &str) -> Vec<u8> {
    let mut cur = Cursor::new(Vec::new());
    assemble(source, &mut cur).expect("assembly should succeed");
    cur.into_inner()
}

fn run_ir(source: &str) -> Vm {
    let mut vm = Vm::new();
    vm.run_image(image_of(source)).expect("execution should succeed");
    vm
}

// ─── Scenario A: arithmetic + global ─────────────────────────────────────────

#[test]
fn arithmetic_lands_in_a_global() {
    let vm = run_ir(indoc! {"
        INT 3
        INT 4
        OP_ADD
        ID 1 x
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(matches!(&*vm.global_value("x").unwrap(), Value::Int(7)));
}

// ─── Scenario B: integer/float promotion ─────────────────────────────────────

#[test]
fn division_promotes_to_float() {
    let vm = run_ir(indoc! {"
        INT 5
        FLOAT 2.0
        OP_DIV
        ID 1 r
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(matches!(
        &*vm.global_value("r").unwrap(),
        Value::Float(f) if *f == 2.5
    ));
}

// ─── Scenario C: string repetition ───────────────────────────────────────────

#[test]
fn string_repetition_builds_the_repeated_string() {
    let vm = run_ir(indoc! {"
        INT 3
        STR 2 ab
        OP_MUL
        ID 1 s
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(matches!(
        &*vm.global_value("s").unwrap(),
        Value::Str(s) if s == "ababab"
    ));
}

// ─── Scenario D: branch on falsy ─────────────────────────────────────────────

#[test]
fn falsy_condition_takes_the_jump_and_the_global_stays_unset() {
    let vm = run_ir(indoc! {"
        INT 0
        OP_JMPIF +9
        INT 1
        ID 1 f
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(vm.global("f").is_none(), "f must never be bound");
}

#[test]
fn truthy_condition_falls_through() {
    let vm = run_ir(indoc! {"
        INT 7
        OP_JMPIF +9
        INT 1
        ID 1 f
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(matches!(&*vm.global_value("f").unwrap(), Value::Int(1)));
}

#[test]
fn jump_skips_a_whole_store() {
    // +14 clears INT (9) + ID (4) + SET_GLOBAL (1).
    let vm = run_ir(indoc! {"
        OP_JMP +14
        INT 1
        ID 1 a
        OP_SET_GLOBAL
        INT 2
        ID 1 b
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(vm.global("a").is_none());
    assert!(matches!(&*vm.global_value("b").unwrap(), Value::Int(2)));
}

// ─── Scenario E: function call with locals ───────────────────────────────────

#[test]
fn function_call_reads_both_locals() {
    let vm = run_ir(indoc! {"
        OP_FUNCDEF
        NUMARGS 2
        NUMVARS 2
        ID 3 add
        LOCAL 0
        OP_GET_LOCAL
        LOCAL 1
        OP_GET_LOCAL
        OP_ADD
        OP_RETURN
        OP_ENDFUNC
        INT 10
        INT 32
        ID 3 add
        OP_CALL
        ID 1 y
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(matches!(&*vm.global_value("y").unwrap(), Value::Int(42)));
    assert_eq!(vm.base_pointer(), 0, "base pointer restored after return");
    assert_eq!(vm.stack_top(), 0, "no identifier or frame may remain");
}

// ─── Scenario F: interning ───────────────────────────────────────────────────

#[test]
fn repeated_small_int_literals_share_a_pool_entry() {
    let vm = run_ir(indoc! {"
        INT 7
        ID 1 a
        OP_SET_GLOBAL
        INT 7
        ID 1 b
        OP_SET_GLOBAL
        BOOL 1
        ID 1 c
        OP_SET_GLOBAL
        BOOL 1
        ID 1 d
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(Rc::ptr_eq(
        &vm.global_value("a").unwrap(),
        &vm.global_value("b").unwrap()
    ));
    assert!(Rc::ptr_eq(
        &vm.global_value("c").unwrap(),
        &vm.global_value("d").unwrap()
    ));
}

// ─── Header invariants ───────────────────────────────────────────────────────

#[test]
fn assembled_header_round_trips_and_points_inside_the_image() {
    let image = image_of(indoc! {"
        OP_FUNCDEF
        NUMARGS 0
        NUMVARS 0
        ID 1 f
        __NULL__
        OP_RETURN
        OP_ENDFUNC
        OP_HALT
    "});
    let header = BytecodeHeader::parse(&image).unwrap();
    assert_eq!(header.execution_section_start as usize, HEADER_SIZE);
    assert!(header.func_section_start <= header.func_section_end);
    assert!((header.func_section_end as usize) <= image.len());
    assert_eq!(header.class_section_start, 0);
    assert_eq!(header.class_section_end, 0);
}

// ─── Control flow: a real loop ───────────────────────────────────────────────

#[test]
fn backward_jump_drives_a_counting_loop() {
    // s and i live in globals; the backward JMPIF re-enters the body while
    // `i > 3` is falsy.
    let vm = run_ir(indoc! {"
        INT 0
        ID 1 s
        OP_SET_GLOBAL
        INT 1
        ID 1 i
        OP_SET_GLOBAL
        ID 1 s
        OP_GET_GLOBAL
        ID 1 i
        OP_GET_GLOBAL
        OP_ADD
        ID 1 s
        OP_SET_GLOBAL
        ID 1 i
        OP_GET_GLOBAL
        INT 1
        OP_ADD
        ID 1 i
        OP_SET_GLOBAL
        ID 1 i
        OP_GET_GLOBAL
        INT 3
        OP_GT
        OP_JMPIF -56
        OP_HALT
    "});
    assert!(matches!(&*vm.global_value("s").unwrap(), Value::Int(6)));
    assert!(matches!(&*vm.global_value("i").unwrap(), Value::Int(4)));
}

// ─── Supplemental opcodes ────────────────────────────────────────────────────

#[test]
fn modulo_and_bitwise_through_the_pipeline() {
    let vm = run_ir(indoc! {"
        INT 10
        INT 4
        OP_MOD
        ID 1 m
        OP_SET_GLOBAL
        INT 12
        INT 10
        OP_BXOR
        ID 1 x
        OP_SET_GLOBAL
        INT 1
        INT 4
        OP_BLSHIFT
        ID 1 l
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(matches!(&*vm.global_value("m").unwrap(), Value::Int(2)));
    assert!(matches!(&*vm.global_value("x").unwrap(), Value::Int(6)));
    assert!(matches!(&*vm.global_value("l").unwrap(), Value::Int(16)));
}

#[test]
fn comparisons_and_logical_ops_through_the_pipeline() {
    let vm = run_ir(indoc! {"
        INT 3
        FLOAT 3.0
        OP_EQ
        INT 2
        INT 1
        OP_GT
        OP_LOGICAL_AND
        ID 1 t
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(matches!(&*vm.global_value("t").unwrap(), Value::Bool(true)));
}

#[test]
fn null_literal_round_trips() {
    let vm = run_ir(indoc! {"
        __NULL__
        ID 1 n
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(matches!(&*vm.global_value("n").unwrap(), Value::Null));
}

// ─── Error surface ───────────────────────────────────────────────────────────

#[test]
fn type_error_leaves_no_result_on_the_stack() {
    // Adding Null to an Int prints a diagnostic and pushes nothing; the
    // following store then has no value and is abandoned.
    let vm = run_ir(indoc! {"
        INT 1
        __NULL__
        OP_ADD
        ID 1 x
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(vm.global("x").is_none());
}

#[test]
fn division_by_zero_yields_the_missing_sentinel() {
    let vm = run_ir(indoc! {"
        INT 1
        INT 0
        OP_DIV
        ID 1 q
        OP_SET_GLOBAL
        OP_HALT
    "});
    assert!(vm.global("q").is_none());
}

// ─── Disassembler ────────────────────────────────────────────────────────────

#[test]
fn disassembly_lists_every_instruction() {
    let image = image_of(indoc! {"
        OP_FUNCDEF
        NUMARGS 2
        NUMVARS 2
        ID 3 add
        OP_RETURN
        OP_ENDFUNC
        INT 10
        STR 2 hi
        OP_HALT
    "});
    let listing = disassemble(&image).unwrap();
    assert!(listing.contains("OP_FUNCDEF args=2 locals=2"));
    assert!(listing.contains("ID 3 add"));
    assert!(listing.contains("INT 10"));
    assert!(listing.contains("STR 2 hi"));
    assert!(listing.contains("OP_HALT"));
}
