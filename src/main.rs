use std::path::Path;
use std::process::ExitCode;
use std::{env, fs};

use pyc_downgrade::{pyc, rewrite};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: pyc-downgrade <input.pyc> <output.pyc>");
        return ExitCode::FAILURE;
    }
    match run(Path::new(&args[1]), Path::new(&args[2])) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(input: &Path, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let code = pyc::read_py39(input)?;
    let downgraded = rewrite(&code)?;
    let mut sink = fs::File::create(output)?;
    pyc::write_py38(&downgraded, &mut sink, None)?;
    Ok(())
}
