use std::process::ExitCode;

fn main() -> ExitCode {
    fundflow_cli::run()
}
