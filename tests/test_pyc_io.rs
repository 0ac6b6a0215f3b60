use std::fs;

use pyc_downgrade::schema::magics;
use pyc_downgrade::{marshal, pyc, CompiledFile, PyObject};

mod common;

fn py39_file_bytes(code: &pyc_downgrade::CodeObject) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&magics::magic_word(magics::PY39));
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&1_600_000_000u32.to_le_bytes());
    data.extend_from_slice(&123u32.to_le_bytes());
    data.extend_from_slice(&marshal::dump_code(code));
    data
}

fn temp_file(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("pyc_downgrade_{}_{name}", std::process::id()))
}

#[test]
fn test_py38_file_roundtrips() {
    let code = common::hello_world_module();
    let mut data = Vec::new();
    pyc::write_py38(&code, &mut data, Some(1_600_000_000)).unwrap();

    assert_eq!(magics::magic_word(magics::PY38), data[..4]);
    assert_eq!(0u32.to_le_bytes(), data[4..8]);
    assert_eq!(1_600_000_000u32.to_le_bytes(), data[8..12]);
    // source size is always written as zero
    assert_eq!(0u32.to_le_bytes(), data[12..16]);

    let file = CompiledFile::parse(&data).unwrap();
    assert_eq!((3, 8), file.version);
    assert_eq!(magics::PY38, file.magic);
    assert_eq!(0, file.flags);
    assert_eq!(1_600_000_000, file.timestamp);
    assert_eq!(0, file.source_size);
    assert_eq!(code, file.code);
}

#[test]
fn test_loaded_code_properties() {
    let data = py39_file_bytes(&common::hello_world_module());
    let file = CompiledFile::parse(&data).unwrap();
    assert_eq!((3, 9), file.version);

    let module = &file.code;
    assert!(module.names.iter().any(|n| n == "test"));
    assert_eq!(
        vec![100, 0, 100, 1, 132, 0, 90, 0, 100, 2, 83, 0],
        module.bytecode
    );

    let function = module.consts[0].as_code().unwrap();
    assert_eq!(0, function.arg_count);
    assert_eq!("test", function.name);
    assert_eq!(
        vec![
            PyObject::None,
            PyObject::Str("Hello World".to_owned())
        ],
        function.consts
    );
    assert_eq!(
        vec![116, 0, 100, 1, 131, 1, 1, 0, 100, 0, 83, 0],
        function.bytecode
    );
}

#[test]
fn test_loads_python_3_9_file() {
    let path = temp_file("hello_39.pyc");
    fs::write(&path, py39_file_bytes(&common::hello_world_module())).unwrap();
    let code = pyc::read_py39(&path).unwrap();
    fs::remove_file(&path).unwrap();
    assert_eq!("<module>", code.name);
}

#[test]
fn test_fails_on_non_python_3_9_file() {
    let path = temp_file("hello_38.pyc");
    let mut data = Vec::new();
    pyc::write_py38(&common::hello_world_module(), &mut data, None).unwrap();
    fs::write(&path, data).unwrap();
    let err = pyc::read_py39(&path).unwrap_err();
    fs::remove_file(&path).unwrap();
    assert!(matches!(
        err,
        pyc::Error::UnsupportedVersion { found: (3, 8) }
    ));
    assert!(err.to_string().contains("only Python 3.9 files are supported"));
}

#[test]
fn test_rejects_malformed_headers() {
    assert!(matches!(
        CompiledFile::parse(&[0x61, 0x0d]),
        Err(pyc::Error::Truncated)
    ));

    // plausible length, magic word from no known interpreter
    let mut data = vec![0x0f, 0x27, 0x0d, 0x0a];
    data.extend_from_slice(&[0; 12]);
    data.extend_from_slice(&marshal::dump(&PyObject::None));
    assert!(matches!(
        CompiledFile::parse(&data),
        Err(pyc::Error::UnknownMagic(9999))
    ));

    // 3.9 magic word without the \r\n suffix
    let mut data = vec![0x61, 0x0d, 0, 0];
    data.extend_from_slice(&[0; 12]);
    assert!(matches!(
        CompiledFile::parse(&data),
        Err(pyc::Error::UnknownMagic(_))
    ));
}

#[test]
fn test_rejects_non_code_body() {
    let mut data = Vec::new();
    data.extend_from_slice(&magics::magic_word(magics::PY39));
    data.extend_from_slice(&[0; 12]);
    data.extend_from_slice(&marshal::dump(&PyObject::Int(5)));
    assert!(matches!(
        CompiledFile::parse(&data),
        Err(pyc::Error::NotCode)
    ));
}
