//! Fixed capacities and well-known identifiers of the mesh address scheme.

use crate::reference::{ObjectId, TypeId};

/// Maximum number of machines (daemons) in one mesh.
pub const MAX_MACHINES: u16 = 8;

/// Maximum number of leaf processes per machine.
pub const MAX_PROCESS_PER_MACHINE: u16 = 16;

/// Maximum number of simulation owners per leaf process.
pub const MAX_OWNER_PER_PROCESS: u16 = 256;

/// Type of the root object every simulation is constructed around.
pub const ROOT_TYPE_ID: TypeId = TypeId::new(1);

/// Object slot of the root object within its MPO.
pub const ROOT_OBJECT_ID: ObjectId = ObjectId::new(0);
