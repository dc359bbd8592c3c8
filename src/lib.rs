//! Grading engine shared by the grader binaries. A binary provides a
//! [`suite::Suite`] and hands over to [`cli::main_with`].
pub mod builder;
pub mod cli;
pub mod error;
pub mod logging;
pub mod remote;
pub mod report;
pub mod scheduler;
pub mod scoring;
pub mod settings;
pub mod submission;
pub mod suite;
pub mod template;
pub mod test_config;
pub mod utils;
pub mod vm;
