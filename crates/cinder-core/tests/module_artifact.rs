mod common;

use std::fs;
use std::sync::Arc;

use cinder_core::vm::module::{read_module, write_module_to, MODULE_FILE_NAME, MODULE_MAGIC};
use cinder_core::vm::{assemble, execute, CodeSpec, Instruction};
use cinder_core::{CompileOptions, Compiler, Value};
use common::{compiler, read_all, read_one};

#[test]
fn written_module_reloads_and_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut c = Compiler::with_options(CompileOptions {
        default_ns: "module-test.roundtrip".to_string(),
        module_dir: Some(dir.path().to_path_buf()),
        ..CompileOptions::default()
    });
    let forms = read_all(
        "(def m 5)
         (def bump (fn* [x] (+ x m)))
         (bump 1)",
    );
    let path = c.write_module(&forms).expect("write module");
    assert!(path.ends_with(MODULE_FILE_NAME));

    let bytes = fs::read(&path).expect("read artifact");
    assert_eq!(&bytes[..4], b"CND\x01");
    assert_eq!(bytes[..4], MODULE_MAGIC);

    let (_mtime, code) = read_module(bytes.as_slice()).expect("decode");
    assert_eq!(execute(&Arc::new(code)).expect("run"), Value::Int(6));
}

#[test]
fn header_records_the_given_mtime() {
    let mut c = compiler("module-test.mtime");
    let code = c.compile_module(&read_all("[1 :two \"three\"]")).expect("compile");
    let mut bytes = Vec::new();
    write_module_to(&mut bytes, &code, 1_700_000_000).expect("write");
    let (mtime, decoded) = read_module(bytes.as_slice()).expect("decode");
    assert_eq!(mtime, 1_700_000_000);
    let expected = c.eval(&read_one("[1 :two \"three\"]")).expect("eval");
    assert_eq!(execute(&Arc::new(decoded)).expect("run"), expected);
}

#[test]
fn bad_magic_is_rejected() {
    let err = read_module(&b"NOPE\0\0\0\0{}"[..]).expect_err("bad magic");
    assert!(err.to_string().contains("bad magic"));
    assert!(read_module(&b"CND"[..]).is_err());
}

#[test]
fn closures_in_the_constant_pool_cannot_be_written() {
    let mut c = compiler("module-test.closure");
    let closure = c.eval(&read_one("(let* [x 1] (fn* [] x))")).expect("closure");
    let code = assemble(
        &[Instruction::LoadConst(closure), Instruction::ReturnValue],
        CodeSpec {
            name: "module-test.closure/top".to_string(),
            ..CodeSpec::default()
        },
    )
    .expect("assemble");
    let mut bytes = Vec::new();
    assert!(write_module_to(&mut bytes, &code, 0).is_err());
}

#[test]
fn module_compile_failure_leaves_the_compiler_usable() {
    let mut c = compiler("module-test.failure");
    assert!(c.compile_module(&read_all("(def ok 1) (let* [a] a)")).is_err());
    assert_eq!(c.eval(&read_one("(+ 1 2)")).expect("eval"), Value::Int(3));
}
