use pyc_downgrade::{CodeFlags, CodeObject, PyObject};

/// A module-level code object (no locals, not optimized).
pub fn module_code(bytecode: Vec<u8>, consts: Vec<PyObject>, names: &[&str]) -> CodeObject {
    CodeObject {
        arg_count: 0,
        pos_only_arg_count: 0,
        kw_only_arg_count: 0,
        n_locals: 0,
        stack_size: 2,
        flags: CodeFlags::NOFREE,
        bytecode,
        consts,
        names: names.iter().map(|&n| n.to_owned()).collect(),
        varnames: vec![],
        freevars: vec![],
        cellvars: vec![],
        filename: "<test>".to_owned(),
        name: "<module>".to_owned(),
        first_line_no: 1,
        lnotab: vec![],
    }
}

/// A plain function code object.
pub fn function_code(
    name: &str,
    bytecode: Vec<u8>,
    consts: Vec<PyObject>,
    names: &[&str],
) -> CodeObject {
    CodeObject {
        arg_count: 0,
        pos_only_arg_count: 0,
        kw_only_arg_count: 0,
        n_locals: 0,
        stack_size: 2,
        flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS | CodeFlags::NOFREE,
        bytecode,
        consts,
        names: names.iter().map(|&n| n.to_owned()).collect(),
        varnames: vec![],
        freevars: vec![],
        cellvars: vec![],
        filename: "<test>".to_owned(),
        name: name.to_owned(),
        first_line_no: 1,
        lnotab: vec![6, 1],
    }
}

/// The compiled form of
///
/// ```text
/// def test():
///     print('Hello World')
/// ```
///
/// with bytecode as both 3.8 and 3.9 compile it.
pub fn hello_world_module() -> CodeObject {
    let function = function_code(
        "test",
        vec![
            116, 0, // LOAD_GLOBAL    0 (print)
            100, 1, // LOAD_CONST     1 ('Hello World')
            131, 1, // CALL_FUNCTION  1
            1, 0, // POP_TOP
            100, 0, // LOAD_CONST     0 (None)
            83, 0, // RETURN_VALUE
        ],
        vec![PyObject::None, PyObject::Str("Hello World".to_owned())],
        &["print"],
    );
    module_code(
        vec![
            100, 0, // LOAD_CONST     0 (code object for test function)
            100, 1, // LOAD_CONST     1 ('test')
            132, 0, // MAKE_FUNCTION  0
            90, 0, // STORE_NAME     0 (test)
            100, 2, // LOAD_CONST     2 (None)
            83, 0, // RETURN_VALUE
        ],
        vec![
            PyObject::Code(Box::new(function)),
            PyObject::Str("test".to_owned()),
            PyObject::None,
        ],
        &["test"],
    )
}
