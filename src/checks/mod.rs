//! Built-in checkers.

pub mod command;

use crate::runner::Check;

/// All checkers shipped with the binary.
pub fn builtins() -> Vec<Box<dyn Check>> {
    vec![Box::new(command::CommandCheck)]
}
