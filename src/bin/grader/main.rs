use std::process::ExitCode;

use batch_grader::{cli, test_config::DeclarativeSuite};

fn main() -> ExitCode {
    cli::main_with(|suite_path| DeclarativeSuite::load(suite_path))
}
