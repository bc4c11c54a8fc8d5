//! # convplan: Convolution Planning and Solver Selection
//!
//! `convplan` decides *how* a convolution should run before any kernel is
//! launched. It derives exact tensor shapes for every convolution mode,
//! sizes the scratch memory any eventual strategy may need, and picks a
//! strategy from a catalog of solvers, autotuning the searchable ones and
//! persisting the winning configs so a problem is searched only once.
//!
//! ## Core Modules
//!
//! - **[`core`]**: Tensor and convolution descriptors, shape arithmetic, the device boundary.
//! - **[`problem`]**: The resolved problem a solver sees and its cache key.
//! - **[`solver`]**: The solver catalog: direct, GEMM, Winograd and FFT families.
//! - **[`search`]**: Config resolution and best-solution selection.
//! - **[`perf_db`]**: Durable store of tuned configs.
//! - **[`workspace`]**: Scratch memory planning per direction.
//!
//! ## Features
//!
//! - `gemm` (default): Enables the matrix-multiply family.

pub mod core;
pub mod error;
pub mod perf_db;
pub mod problem;
pub mod search;
pub mod solver;
pub mod workspace;

pub use crate::core::config::PlannerConfig;
pub use crate::core::conv::{ConvolutionMode, ConvolutionParams, PaddingMode};
pub use crate::core::device::{DeviceHandle, DeviceProfile, SimulatedDevice};
pub use crate::core::tensor::{DataType, TensorShape};
pub use crate::error::{ConvError, Result};
pub use crate::perf_db::PerfDb;
pub use crate::problem::{Direction, ProblemDescription, ProblemSignature};
pub use crate::search::{ConfigSource, FindOptions, Found, SearchEngine, Selection};
pub use crate::solver::{AnySolver, ConvContext, ConvSolution, PerformanceConfig, Solver, SolverFamily, SolverRegistry};
pub use crate::workspace::{WorkspaceEstimate, WorkspacePlanner};
