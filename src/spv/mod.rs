//! SPIR-V dialect information (the parts that affect how functions may be transformed).

use std::collections::BTreeSet;

/// Semantic properties of a SPIR-V module (not tied to any IDs).
#[derive(Clone)]
pub struct Dialect {
    pub version_major: u8,
    pub version_minor: u8,

    pub capabilities: BTreeSet<Capability>,
}

impl Dialect {
    /// SPIR-V 1.3 dialect declaring `capabilities`.
    pub fn with_capabilities(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            version_major: 1,
            version_minor: 3,

            capabilities: capabilities.into_iter().collect(),
        }
    }
}

/// Subset of SPIR-V capabilities (with their SPIR-V enumerant values).
///
/// Only `Shader` matters for control-flow: it implies the structured
/// control-flow rules (every selection/loop needs a declared merge block).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Capability {
    Matrix = 0,
    Shader = 1,
    Addresses = 4,
    Linkage = 5,
    Kernel = 6,
    Int64 = 11,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Self::Matrix => "Matrix",
            Self::Shader => "Shader",
            Self::Addresses => "Addresses",
            Self::Linkage => "Linkage",
            Self::Kernel => "Kernel",
            Self::Int64 => "Int64",
        }
    }
}
