//! # lattice-flow
//!
//! lattice-flow is the distributed-memory core of a lattice-Boltzmann fluid
//! solver: it advances a 3-D D3Q15 lattice one step per call across an
//! arbitrary number of cooperating processes, overlapping the halo exchange
//! of boundary-site data with the collision of purely local sites.
//!
//! ## What lives here
//! - A pluggable [`comm::Communicator`] (serial, in-process multi-rank for
//!   tests, MPI behind the `mpi-support` feature) with the small set of
//!   collectives the setup protocol needs
//! - The block-need resolver ([`geometry::needs`]): which ranks require a
//!   copy of each spatial block, settled with bounded traffic at setup
//! - Validated neighbor topology ([`topology`]): per-neighbor exchange
//!   windows and index maps, checked fail-fast before the first step
//! - The cycle engine ([`engine`]): double-buffered collision + streaming
//!   with non-blocking message overlap, per-step global stability and
//!   optional convergence agreement, flow-field telemetry
//!
//! Geometry file parsing, checkpointing, visualization and the interactive
//! steering surface are collaborators feeding or consuming the narrow
//! interfaces here; they are not part of this crate.
//!
//! ## Determinism
//! The step loop is single-threaded per rank; all cross-rank traffic flows
//! through explicit non-blocking primitives with a strict per-step ordering,
//! so runs are reproducible for a fixed partition.

pub mod comm;
pub mod engine;
pub mod flow_error;
pub mod geometry;
pub mod lattice;
pub mod topology;

/// A convenient prelude importing the most-used traits & types.
pub mod prelude {
    pub use crate::comm::{CommTag, Communicator, NoComm, ReduceOp, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::comm::RayonComm;
    pub use crate::engine::forcing::BoundaryForcing;
    pub use crate::engine::{CycleEngine, EngineConfig, FieldExtrema, StabilityCode, StepParams};
    pub use crate::flow_error::FlowError;
    pub use crate::geometry::needs::{NeedMap, resolve_block_needs};
    pub use crate::geometry::{
        BlockGrid, CollisionKind, CollisionPolicy, SiteKind, SiteRecord,
    };
    pub use crate::lattice::{Distribution, Q};
    pub use crate::topology::{NeighborSpec, SiteOrdering, Topology};
}
