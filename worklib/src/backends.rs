//! Local implementations of the collaborator traits in `services`.

pub mod fs;
pub mod memory;
pub mod sqlite;
