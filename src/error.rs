use std::fmt;

/// Out-of-memory failure: the node store hit its configured ceiling and
/// garbage collection did not free enough space.
///
/// This is the only checked failure the engine surfaces. Retrying the same
/// operation without raising the ceiling (`set_max_num_nodes`) or dropping
/// live handles will fail identically.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemOut;

impl fmt::Display for MemOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BDD operation ran out of nodes")
    }
}

impl std::error::Error for MemOut {}

/// Result type with [`MemOut`] error.
pub type Result<T> = std::result::Result<T, MemOut>;
