mod infra;
mod runtime;

use std::process::ExitCode;

fn main() -> ExitCode {
    match runtime::run_from_args() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("treater: {e}");
            ExitCode::FAILURE
        }
    }
}
