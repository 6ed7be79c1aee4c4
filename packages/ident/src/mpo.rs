//! Machine/Process/Owner addressing.
//!
//! A simulation instance is named by an [`Mpo`] triple: which machine
//! (daemon) it lives under, which leaf process hosts it, and which owner
//! slot within that process it occupies. The [`Mp`] prefix alone names a
//! leaf process. All three components are minted by ring allocators and are
//! only unique while held.

use serde::{Deserialize, Serialize};

/// Identifier of one machine (daemon) in the mesh.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct MachineId(u8);

impl MachineId {
    /// Wrap a raw machine index.
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// The raw machine index.
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one leaf process under a machine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ProcessId(u8);

impl ProcessId {
    /// Wrap a raw process index.
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// The raw process index.
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one simulation owner slot under a leaf process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct OwnerId(u16);

impl OwnerId {
    /// Wrap a raw owner index.
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// The raw owner index.
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Machine/Process prefix naming one leaf process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Mp {
    machine: MachineId,
    process: ProcessId,
}

impl Mp {
    /// Build an MP from its components.
    pub const fn new(machine: MachineId, process: ProcessId) -> Self {
        Self { machine, process }
    }

    /// The machine component.
    pub const fn machine(self) -> MachineId {
        self.machine
    }

    /// The process component.
    pub const fn process(self) -> ProcessId {
        self.process
    }
}

impl std::fmt::Display for Mp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.machine, self.process)
    }
}

/// Machine/Process/Owner triple naming one simulation instance.
///
/// Ordering is machine-major so collections of references sort grouped by
/// owning process, which the memory managers rely on for range sweeps.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Mpo {
    machine: MachineId,
    process: ProcessId,
    owner: OwnerId,
}

impl Mpo {
    /// Build an MPO from its components.
    pub const fn new(machine: MachineId, process: ProcessId, owner: OwnerId) -> Self {
        Self {
            machine,
            process,
            owner,
        }
    }

    /// The machine component.
    pub const fn machine(self) -> MachineId {
        self.machine
    }

    /// The process component.
    pub const fn process(self) -> ProcessId {
        self.process
    }

    /// The owner component.
    pub const fn owner(self) -> OwnerId {
        self.owner
    }

    /// The machine/process prefix of this MPO.
    pub const fn mp(self) -> Mp {
        Mp::new(self.machine, self.process)
    }

    /// Whether this MPO lives under the given leaf process.
    pub fn is_under(self, mp: Mp) -> bool {
        self.mp() == mp
    }
}

impl From<Mpo> for Mp {
    fn from(mpo: Mpo) -> Self {
        mpo.mp()
    }
}

impl std::fmt::Display for Mpo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.machine, self.process, self.owner)
    }
}
