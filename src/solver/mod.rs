//! # Strategy catalog
//!
//! Every convolution algorithm is a [`Solver`]: a stateless policy object
//! that decides whether it can handle a problem and, if so, turns a
//! performance config into a [`ConvSolution`]. Searchable solvers carry a
//! typed [`PerformanceConfig`] that the search engine resolves through the
//! performance database.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

use crate::core::config::PlannerConfig;
use crate::core::device::{DeviceHandle, DeviceProfile, LaunchParams};
use crate::error::Result;
use crate::perf_db::PerfDb;
use crate::problem::ProblemDescription;
use crate::search::{Found, SearchContext, SolverRequest};

pub mod direct;
pub mod fft;
pub mod gemm;
pub mod generic_search;
pub mod winograd;

pub use direct::{ConvDirect1x1, ConvDirectBwdWeights, ConvDirectGeneric, ConvDirectSubsample1x1, ConvImplicitGemm};
pub use fft::ConvFft;
pub use gemm::ConvGemm;
pub use winograd::ConvWinograd3x3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SolverFamily {
    Direct,
    ImplicitGemm,
    Gemm,
    Winograd,
    Fft,
}

/// Everything a solver may look at: the problem, the device it will run on
/// and the planner switches.
#[derive(Debug, Clone, Copy)]
pub struct ConvContext<'a> {
    pub problem: &'a ProblemDescription,
    pub device: &'a DeviceProfile,
    pub config: &'a PlannerConfig,
}

impl<'a> ConvContext<'a> {
    pub fn new(problem: &'a ProblemDescription, device: &'a DeviceProfile, config: &'a PlannerConfig) -> Self {
        Self { problem, device, config }
    }
}

/// Tunable state of a searchable solver.
///
/// Configs travel through the performance database as JSON, so they must
/// round-trip through serde without loss.
pub trait PerformanceConfig: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// A stored config that fails this check is treated as a database miss.
    fn is_valid(&self, _ctx: &ConvContext<'_>) -> bool {
        true
    }
}

impl PerformanceConfig for () {}

/// One kernel to build and launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelInfo {
    pub solver_id: &'static str,
    pub kernel_file: String,
    pub kernel_name: String,
    pub comp_options: String,
    pub l_wk: [usize; 3],
    pub g_wk: [usize; 3],
}

impl KernelInfo {
    pub fn launch_params(&self) -> LaunchParams {
        LaunchParams::new(self.g_wk, self.l_wk)
    }
}

/// Realized execution plan: kernels in launch order plus the scratch bytes they share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvSolution {
    pub solver_id: &'static str,
    pub construction_params: Vec<KernelInfo>,
    pub workspace_size: usize,
}

impl ConvSolution {
    pub fn new(solver_id: &'static str) -> Self {
        Self {
            solver_id,
            construction_params: Vec::new(),
            workspace_size: 0,
        }
    }

    pub fn with_workspace(mut self, bytes: usize) -> Self {
        self.workspace_size = bytes;
        self
    }

    pub fn push_kernel(&mut self, file: &str, name: &str, options: String, l_wk: [usize; 3], g_wk: [usize; 3]) {
        self.construction_params.push(KernelInfo {
            solver_id: self.solver_id,
            kernel_file: file.to_string(),
            kernel_name: name.to_string(),
            comp_options: options,
            l_wk,
            g_wk,
        });
    }

    /// Source file of the first kernel, which names the plan in logs.
    pub fn kernel_file(&self) -> Option<&str> {
        self.construction_params.first().map(|k| k.kernel_file.as_str())
    }
}

pub trait Solver: Send + Sync {
    type Config: PerformanceConfig;

    /// Stable identifier, part of every performance database key.
    fn id(&self) -> &'static str;

    fn family(&self) -> SolverFamily;

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool;

    fn is_fast(&self, _ctx: &ConvContext<'_>) -> bool {
        true
    }

    fn is_searchable(&self) -> bool {
        false
    }

    /// Deterministic and free of device work.
    fn default_config(&self, ctx: &ConvContext<'_>) -> Self::Config;

    fn search(&self, ctx: &ConvContext<'_>, _handle: &dyn DeviceHandle) -> Result<Self::Config> {
        Ok(self.default_config(ctx))
    }

    fn workspace_size(&self, _ctx: &ConvContext<'_>, _config: &Self::Config) -> usize {
        0
    }

    /// Must succeed for every config returned by `default_config` or `search`
    /// on a matching problem.
    fn get_solution(&self, ctx: &ConvContext<'_>, config: &Self::Config) -> Result<ConvSolution>;
}

/// Object-safe view of a [`Solver`], used by the registry.
///
/// The typed config never crosses this boundary: each call re-enters the
/// generic search code with the concrete solver type.
pub trait AnySolver: Send + Sync {
    fn id(&self) -> &'static str;
    fn family(&self) -> SolverFamily;
    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool;
    fn is_fast(&self, ctx: &ConvContext<'_>) -> bool;
    fn is_searchable(&self) -> bool;

    fn find(&self, ctx: &ConvContext<'_>, search: &SearchContext<'_>) -> Result<Found>;

    /// Workspace of the plan this solver would produce without searching.
    fn planned_workspace(&self, ctx: &ConvContext<'_>, db: Option<&PerfDb>) -> Result<usize>;
}

impl<S: Solver> AnySolver for S {
    fn id(&self) -> &'static str {
        Solver::id(self)
    }

    fn family(&self) -> SolverFamily {
        Solver::family(self)
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        Solver::is_applicable(self, ctx)
    }

    fn is_fast(&self, ctx: &ConvContext<'_>) -> bool {
        Solver::is_fast(self, ctx)
    }

    fn is_searchable(&self) -> bool {
        Solver::is_searchable(self)
    }

    fn find(&self, ctx: &ConvContext<'_>, search: &SearchContext<'_>) -> Result<Found> {
        let mut request = SolverRequest::new(self, *ctx);
        request.resolve(search)?;
        request.realize()
    }

    fn planned_workspace(&self, ctx: &ConvContext<'_>, db: Option<&PerfDb>) -> Result<usize> {
        let search = SearchContext::without_search(db);
        Ok(AnySolver::find(self, ctx, &search)?.solution.workspace_size)
    }
}

/// Registered solvers in priority order.
pub struct SolverRegistry {
    solvers: Vec<Box<dyn AnySolver>>,
}

impl SolverRegistry {
    pub fn new() -> Self {
        Self { solvers: Vec::new() }
    }

    /// The built-in catalog. Registration order is the tie-break order.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register(ConvWinograd3x3)
            .register(ConvDirect1x1)
            .register(ConvDirectGeneric)
            .register(ConvDirectSubsample1x1)
            .register(ConvDirectBwdWeights)
            .register(ConvImplicitGemm)
            .register(ConvGemm)
            .register(ConvFft);
        registry
    }

    pub fn register<S: Solver + 'static>(&mut self, solver: S) -> &mut Self {
        self.solvers.push(Box::new(solver));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn AnySolver> {
        self.solvers.iter().map(|s| s.as_ref())
    }

    pub fn get(&self, id: &str) -> Option<&dyn AnySolver> {
        self.iter().find(|s| s.id() == id)
    }

    pub fn applicable(&self, ctx: &ConvContext<'_>) -> Vec<&dyn AnySolver> {
        self.iter().filter(|s| s.is_applicable(ctx)).collect()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.iter().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.solvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solvers.is_empty()
    }
}

impl Default for SolverRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
