pub mod repository;

pub use repository::{exec_git, exec_git_stdin, Repository};
