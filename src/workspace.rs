//! # Workspace planning
//!
//! Computes how much scratch memory to reserve so that whichever solver the
//! runtime later picks for a problem can run. Every family's requirement is
//! held against the device's single-allocation ceiling; a family above it
//! is dropped from the maximum rather than failing the plan.

use crate::core::config::PlannerConfig;
use crate::core::conv::{ConvolutionMode, ConvolutionParams};
use crate::core::device::DeviceProfile;
use crate::core::tensor::TensorShape;
use crate::error::Result;
use crate::perf_db::PerfDb;
use crate::problem::{Direction, ProblemDescription};
use crate::solver::{fft, gemm, winograd, ConvContext, SolverFamily, SolverRegistry};

/// Scratch requirement of one strategy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceEstimate {
    /// The family cannot run this problem.
    NotApplicable,
    /// The family runs without scratch memory.
    NotNeeded,
    Required(usize),
    /// The family would need more than one allocation may hold.
    ExceedsAllocLimit(usize),
}

impl WorkspaceEstimate {
    /// Byte count given as a product of factors. A product that does not fit
    /// in `usize` exceeds any allocation ceiling.
    pub fn from_factors(factors: &[usize]) -> Self {
        match checked_bytes(factors) {
            Some(bytes) => Self::from_bytes(bytes),
            None => Self::ExceedsAllocLimit(usize::MAX),
        }
    }

    pub fn from_bytes(bytes: usize) -> Self {
        if bytes == 0 {
            Self::NotNeeded
        } else {
            Self::Required(bytes)
        }
    }

    /// Bytes to reserve for this estimate; zero unless `Required`.
    pub fn bytes(self) -> usize {
        match self {
            Self::Required(n) => n,
            _ => 0,
        }
    }

    pub fn scaled(self, factor: usize) -> Self {
        match self {
            Self::Required(n) => Self::from_factors(&[n, factor]),
            other => other,
        }
    }

    /// Sum of two requirements, for plans made of several buffers.
    pub fn plus(self, other: Self) -> Self {
        match (self, other) {
            (Self::ExceedsAllocLimit(a), b) | (b, Self::ExceedsAllocLimit(a)) => {
                Self::ExceedsAllocLimit(a.saturating_add(b.bytes()))
            }
            (Self::NotApplicable, b) | (b, Self::NotApplicable) => b,
            (a, b) => match a.bytes().checked_add(b.bytes()) {
                Some(total) => Self::from_bytes(total),
                None => Self::ExceedsAllocLimit(usize::MAX),
            },
        }
    }

    pub fn capped(self, limit: usize) -> Self {
        match self {
            Self::Required(n) if n > limit => Self::ExceedsAllocLimit(n),
            other => other,
        }
    }

    pub fn is_applicable(self) -> bool {
        !matches!(self, Self::NotApplicable | Self::ExceedsAllocLimit(_))
    }
}

impl Default for WorkspaceEstimate {
    fn default() -> Self {
        Self::NotApplicable
    }
}

/// Which rule produced the final size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRule {
    /// Transposed mode: only the GEMM column buffer matters.
    TransposedGemm,
    /// Pointwise filter on the relayout GEMM path.
    GemmTranspose,
    /// Dilated problems only run on GEMM or direct kernels.
    Dilated,
    /// The Winograd kernel is eligible and needs no scratch memory.
    Winograd,
    /// Largest requirement across every family.
    Maximum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePlan {
    pub direction: Direction,
    pub rule: PlanRule,
    pub direct: WorkspaceEstimate,
    pub gemm: WorkspaceEstimate,
    pub fft: WorkspaceEstimate,
    pub winograd_eligible: bool,
    pub bytes: usize,
}

pub struct WorkspacePlanner<'a> {
    registry: &'a SolverRegistry,
    device: &'a DeviceProfile,
    config: &'a PlannerConfig,
    db: Option<&'a PerfDb>,
}

impl<'a> WorkspacePlanner<'a> {
    pub fn new(registry: &'a SolverRegistry, device: &'a DeviceProfile, config: &'a PlannerConfig) -> Self {
        Self {
            registry,
            device,
            config,
            db: None,
        }
    }

    /// Lets searchable direct solvers size their plan from stored configs.
    pub fn with_perf_db(mut self, db: &'a PerfDb) -> Self {
        self.db = Some(db);
        self
    }

    pub fn forward(&self, w: &TensorShape, x: &TensorShape, y: &TensorShape, params: &ConvolutionParams) -> Result<usize> {
        let problem = ProblemDescription::new(Direction::Forward, *x, *w, *y, *params)?;
        Ok(self.plan(&problem).bytes)
    }

    pub fn backward_data(&self, w: &TensorShape, dy: &TensorShape, dx: &TensorShape, params: &ConvolutionParams) -> Result<usize> {
        let problem = ProblemDescription::new(Direction::BackwardData, *dx, *w, *dy, *params)?;
        Ok(self.plan(&problem).bytes)
    }

    pub fn backward_weights(&self, dy: &TensorShape, x: &TensorShape, dw: &TensorShape, params: &ConvolutionParams) -> Result<usize> {
        let problem = ProblemDescription::new(Direction::BackwardWeights, *x, *dw, *dy, *params)?;
        Ok(self.plan(&problem).bytes)
    }

    pub fn workspace_size(&self, problem: &ProblemDescription) -> usize {
        self.plan(problem).bytes
    }

    pub fn plan(&self, problem: &ProblemDescription) -> WorkspacePlan {
        let plan = match problem.direction() {
            Direction::BackwardWeights => self.plan_backward_weights(problem),
            _ => self.plan_data(problem),
        };
        log::debug!(
            "workspace {} via {:?}: direct={:?} gemm={:?} fft={:?} -> {} bytes",
            problem.signature(),
            plan.rule,
            plan.direct,
            plan.gemm,
            plan.fft,
            plan.bytes
        );
        plan
    }

    fn ceiling(&self, estimate: WorkspaceEstimate) -> WorkspaceEstimate {
        estimate.capped(self.device.max_mem_alloc_size)
    }

    fn gemm_enabled(&self) -> bool {
        self.config.gemm_enabled()
    }

    /// Forward and backward-data share one shape of decision.
    fn plan_data(&self, problem: &ProblemDescription) -> WorkspacePlan {
        let p = problem.params();
        let mut plan = WorkspacePlan {
            direction: problem.direction(),
            rule: PlanRule::Maximum,
            direct: WorkspaceEstimate::NotApplicable,
            gemm: WorkspaceEstimate::NotApplicable,
            fft: WorkspaceEstimate::NotApplicable,
            winograd_eligible: false,
            bytes: 0,
        };

        if p.mode() == ConvolutionMode::Transposed {
            if self.gemm_enabled() {
                plan.gemm = self.ceiling(gemm::direction_gemm_size(problem));
            }
            plan.rule = PlanRule::TransposedGemm;
            plan.bytes = plan.gemm.bytes();
            return plan;
        }

        let groups = p.groups_for(problem.x().c);
        plan.direct = self.ceiling(self.direct_family(problem));

        if self.gemm_enabled() {
            if gemm::uses_transpose_path(problem) {
                plan.gemm = self.ceiling(gemm::gemm_transpose_size(problem));
                plan.rule = PlanRule::GemmTranspose;
                plan.bytes = plan.gemm.bytes().max(plan.direct.bytes());
                return plan;
            }
            if !p.is_unit_dilation() {
                plan.gemm = self.ceiling(gemm::direction_gemm_size(problem).scaled(groups));
                plan.rule = PlanRule::Dilated;
                plan.bytes = plan.gemm.bytes().max(plan.direct.bytes());
                return plan;
            }
        }

        plan.winograd_eligible = winograd::is_eligible(problem, self.device, self.config.enable_precompiled_binaries);
        if plan.winograd_eligible && !p.mode().is_grouped() {
            plan.rule = PlanRule::Winograd;
            plan.bytes = 0;
            return plan;
        }

        if self.gemm_enabled() {
            plan.gemm = self.ceiling(gemm::direction_gemm_size(problem).scaled(groups));
        }
        plan.fft = self.ceiling(fft::workspace(problem));
        plan.bytes = plan.fft.bytes().max(plan.gemm.bytes()).max(plan.direct.bytes());
        plan
    }

    fn plan_backward_weights(&self, problem: &ProblemDescription) -> WorkspacePlan {
        let p = problem.params();
        let mut plan = WorkspacePlan {
            direction: Direction::BackwardWeights,
            rule: PlanRule::Maximum,
            direct: WorkspaceEstimate::NotApplicable,
            gemm: WorkspaceEstimate::NotApplicable,
            fft: WorkspaceEstimate::NotApplicable,
            winograd_eligible: false,
            bytes: 0,
        };
        if p.mode() == ConvolutionMode::Transposed {
            if self.gemm_enabled() {
                plan.gemm = self.ceiling(gemm::direction_gemm_size(problem));
            }
            plan.rule = PlanRule::TransposedGemm;
            plan.bytes = plan.gemm.bytes();
            return plan;
        }
        let groups = p.groups_for(problem.x().c);
        plan.direct = self.ceiling(self.direct_family(problem));
        if self.gemm_enabled() {
            plan.gemm = self.ceiling(gemm::direction_gemm_size(problem).scaled(groups));
        }
        plan.bytes = plan.direct.bytes().max(plan.gemm.bytes());
        plan
    }

    /// Largest plan among the registered, applicable direct solvers, sized
    /// without any device work. Each solver is held against the ceiling on
    /// its own, so one oversized variant does not hide the others.
    fn direct_family(&self, problem: &ProblemDescription) -> WorkspaceEstimate {
        if !self.config.enable_direct {
            return WorkspaceEstimate::NotApplicable;
        }
        if problem.direction() != Direction::BackwardWeights && !is_direct_supported(problem.params(), problem.w()) {
            return WorkspaceEstimate::NotApplicable;
        }
        let ctx = ConvContext::new(problem, self.device, self.config);
        let mut best = WorkspaceEstimate::NotApplicable;
        for solver in self.registry.iter().filter(|s| s.family() == SolverFamily::Direct) {
            if !solver.is_applicable(&ctx) {
                continue;
            }
            let bytes = match solver.planned_workspace(&ctx, self.db) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("{} could not size its plan: {}", solver.id(), e);
                    continue;
                }
            };
            let estimate = self.ceiling(WorkspaceEstimate::from_bytes(bytes));
            if !estimate.is_applicable() {
                log::debug!("{} wants {} bytes, over the allocation ceiling", solver.id(), bytes);
                continue;
            }
            log::debug!("{} wants {} bytes", solver.id(), bytes);
            if estimate.bytes() >= best.bytes() {
                best = estimate;
            }
        }
        best
    }
}

/// Product of `factors`, `None` on overflow.
pub fn checked_bytes(factors: &[usize]) -> Option<usize> {
    factors.iter().try_fold(1usize, |acc, f| acc.checked_mul(*f))
}

/// Filter shapes the direct kernels are built for, in standard mode.
///
/// Other modes are always accepted here; their solvers decide for
/// themselves.
pub fn is_direct_supported(params: &ConvolutionParams, w: &TensorShape) -> bool {
    if params.mode() != ConvolutionMode::Standard {
        return true;
    }
    let (kh, kw) = (w.h, w.w);
    let (u, v) = (params.u(), params.v());
    let strided_wide = u == 2 && v == 2 && params.is_zero_pad();
    let supported = matches!((kh, kw), (1, 1) | (3, 3) | (5, 5) | (7, 7) | (9, 9) | (11, 11))
        || (kh == 5 && (kw == 10 || kw == 20) && strided_wide);
    let workarounds = (kh == 3 && kw == 3 && (u > 2 || v > 2))
        || (kh == 1 && kw == 1 && !params.is_zero_pad())
        || (kh % 2 == 0 && kw % 2 == 0);
    supported && !workarounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conv::PaddingMode;
    use crate::core::tensor::DataType;
    use crate::solver::{ConvSolution, Solver};

    fn t(n: usize, c: usize, h: usize, w: usize) -> TensorShape {
        TensorShape::new(DataType::Float, n, c, h, w)
    }

    fn planner_parts() -> (SolverRegistry, DeviceProfile, PlannerConfig) {
        (SolverRegistry::standard(), DeviceProfile::default(), PlannerConfig::default())
    }

    #[test]
    fn estimate_helpers() {
        assert_eq!(WorkspaceEstimate::from_bytes(0), WorkspaceEstimate::NotNeeded);
        assert_eq!(WorkspaceEstimate::Required(10).scaled(3), WorkspaceEstimate::Required(30));
        assert_eq!(WorkspaceEstimate::Required(10).capped(5), WorkspaceEstimate::ExceedsAllocLimit(10));
        assert_eq!(WorkspaceEstimate::ExceedsAllocLimit(10).bytes(), 0);
        assert!(!WorkspaceEstimate::ExceedsAllocLimit(10).is_applicable());
        assert!(WorkspaceEstimate::NotNeeded.is_applicable());
    }

    #[test]
    fn direct_support_filter() {
        let p = |pad, s| ConvolutionParams::new(pad, pad, s, s, 1, 1).unwrap();
        assert!(is_direct_supported(&p(1, 1), &t(8, 8, 3, 3)));
        assert!(!is_direct_supported(&p(1, 3), &t(8, 8, 3, 3)));
        assert!(!is_direct_supported(&p(1, 1), &t(8, 8, 1, 1)));
        assert!(is_direct_supported(&p(0, 2), &t(8, 8, 5, 10)));
        assert!(!is_direct_supported(&p(0, 1), &t(8, 8, 5, 10)));
        assert!(!is_direct_supported(&p(0, 1), &t(8, 8, 4, 4)));
        assert!(!is_direct_supported(&p(0, 1), &t(8, 8, 13, 13)));
        let depthwise = ConvolutionParams::with_modes(ConvolutionMode::Depthwise, PaddingMode::Default, 0, 0, 1, 1, 1, 1).unwrap();
        assert!(is_direct_supported(&depthwise, &t(8, 1, 4, 4)));
    }

    #[test]
    fn winograd_short_circuits_to_zero() {
        let (registry, device, config) = planner_parts();
        let planner = WorkspacePlanner::new(&registry, &device, &config);
        let p = ConvolutionParams::new(1, 1, 1, 1, 1, 1).unwrap();
        let problem = ProblemDescription::forward(t(2, 32, 28, 28), t(32, 32, 3, 3), p).unwrap();
        let plan = planner.plan(&problem);
        assert_eq!(plan.rule, PlanRule::Winograd);
        assert_eq!(plan.bytes, 0);

        // Without the precompiled binaries the GEMM column buffer dominates.
        let no_bin = PlannerConfig {
            enable_precompiled_binaries: false,
            ..PlannerConfig::default()
        };
        let planner = WorkspacePlanner::new(&registry, &device, &no_bin);
        let plan = planner.plan(&problem);
        assert_eq!(plan.rule, PlanRule::Maximum);
        assert_eq!(plan.bytes, 32 * 9 * 28 * 28 * 4);
    }

    #[test]
    fn ceiling_drops_family_instead_of_failing() {
        let (registry, _, config) = planner_parts();
        let device = DeviceProfile::default().with_max_mem_alloc_size(1000);
        let planner = WorkspacePlanner::new(&registry, &device, &config);
        let p = ConvolutionParams::new(1, 1, 1, 1, 1, 1).unwrap();
        let problem = ProblemDescription::forward(t(1, 3, 64, 64), t(8, 3, 3, 3), p).unwrap();
        let plan = planner.plan(&problem);
        assert_eq!(plan.gemm, WorkspaceEstimate::ExceedsAllocLimit(3 * 9 * 64 * 64 * 4));
        assert_eq!(plan.bytes, 0);
    }

    #[test]
    fn huge_problem_is_over_the_ceiling() {
        let (registry, device, config) = planner_parts();
        let planner = WorkspacePlanner::new(&registry, &device, &config);
        let p = ConvolutionParams::new(1, 1, 1, 1, 1, 1).unwrap();
        let problem = ProblemDescription::forward(t(1, 65536, 1 << 22, 1 << 22), t(2, 65536, 3, 3), p).unwrap();
        let plan = planner.plan(&problem);
        assert_eq!(plan.gemm, WorkspaceEstimate::ExceedsAllocLimit(usize::MAX));
        assert_eq!(planner.workspace_size(&problem), 0);

        assert_eq!(checked_bytes(&[usize::MAX, 2]), None);
        assert_eq!(
            WorkspaceEstimate::from_factors(&[usize::MAX, 2]),
            WorkspaceEstimate::ExceedsAllocLimit(usize::MAX)
        );
        assert_eq!(
            WorkspaceEstimate::Required(usize::MAX).plus(WorkspaceEstimate::Required(1)),
            WorkspaceEstimate::ExceedsAllocLimit(usize::MAX)
        );
    }

    struct Scratch {
        id: &'static str,
        bytes: usize,
    }

    impl Solver for Scratch {
        type Config = ();

        fn id(&self) -> &'static str {
            self.id
        }

        fn family(&self) -> SolverFamily {
            SolverFamily::Direct
        }

        fn is_applicable(&self, _ctx: &ConvContext<'_>) -> bool {
            true
        }

        fn default_config(&self, _ctx: &ConvContext<'_>) {}

        fn workspace_size(&self, _ctx: &ConvContext<'_>, _config: &()) -> usize {
            self.bytes
        }

        fn get_solution(&self, _ctx: &ConvContext<'_>, _config: &()) -> Result<ConvSolution> {
            Ok(ConvSolution::new(self.id).with_workspace(self.bytes))
        }
    }

    #[test]
    fn oversized_direct_variant_does_not_hide_smaller_ones() {
        let mut registry = SolverRegistry::new();
        registry.register(Scratch { id: "Small", bytes: 100 });
        registry.register(Scratch { id: "Large", bytes: 5000 });
        let device = DeviceProfile::default().with_max_mem_alloc_size(1000);
        let config = PlannerConfig {
            enable_gemm: false,
            ..PlannerConfig::default()
        };
        let planner = WorkspacePlanner::new(&registry, &device, &config);
        let p = ConvolutionParams::new(1, 1, 1, 1, 1, 1).unwrap();
        let problem = ProblemDescription::forward(t(1, 3, 16, 16), t(4, 3, 3, 3), p).unwrap();
        let plan = planner.plan(&problem);
        assert_eq!(plan.direct, WorkspaceEstimate::Required(100));
        assert_eq!(plan.bytes, 100);
    }

    #[test]
    fn dilation_takes_gemm_or_direct() {
        let (registry, device, config) = planner_parts();
        let planner = WorkspacePlanner::new(&registry, &device, &config);
        let p = ConvolutionParams::new(2, 2, 1, 1, 2, 2).unwrap();
        let problem = ProblemDescription::forward(t(1, 32, 28, 28), t(32, 32, 3, 3), p).unwrap();
        let plan = planner.plan(&problem);
        assert_eq!(plan.rule, PlanRule::Dilated);
        assert_eq!(plan.bytes, 32 * 9 * 28 * 28 * 4);
    }

    #[test]
    fn transposed_mode_uses_input_grid() {
        let (registry, device, config) = planner_parts();
        let planner = WorkspacePlanner::new(&registry, &device, &config);
        let p = ConvolutionParams::with_modes(ConvolutionMode::Transposed, PaddingMode::Default, 1, 1, 2, 2, 1, 1).unwrap();
        let problem = ProblemDescription::forward(t(1, 16, 8, 8), t(16, 4, 3, 3), p).unwrap();
        let plan = planner.plan(&problem);
        assert_eq!(plan.rule, PlanRule::TransposedGemm);
        assert_eq!(plan.bytes, 4 * 9 * 8 * 8 * 4);
    }

    #[test]
    fn backward_weights_takes_direct_or_gemm() {
        let (registry, device, config) = planner_parts();
        let planner = WorkspacePlanner::new(&registry, &device, &config);
        let p = ConvolutionParams::new(1, 1, 1, 1, 1, 1).unwrap();
        let x = t(8, 16, 14, 14);
        let w = t(16, 16, 3, 3);
        let y = p.forward_output_shape(&x, &w).unwrap();
        let bytes = planner.backward_weights(&y, &x, &w, &p).unwrap();
        let gemm = 16 * 9 * 14 * 14 * 4;
        assert!(bytes >= gemm);
    }

    #[test]
    fn disabled_families_contribute_nothing() {
        let registry = SolverRegistry::standard();
        let device = DeviceProfile::rocm("gfx1030", 64);
        let config = PlannerConfig {
            enable_direct: false,
            enable_gemm: false,
            ..PlannerConfig::default()
        };
        let planner = WorkspacePlanner::new(&registry, &device, &config);
        let p = ConvolutionParams::new(1, 1, 1, 1, 1, 1).unwrap();
        let problem = ProblemDescription::forward(t(1, 3, 32, 32), t(8, 3, 3, 3), p).unwrap();
        let plan = planner.plan(&problem);
        assert_eq!(plan.direct, WorkspaceEstimate::NotApplicable);
        assert_eq!(plan.gemm, WorkspaceEstimate::NotApplicable);
        assert_eq!(plan.bytes, 0);
    }

    #[test]
    fn shape_errors_propagate() {
        let (registry, device, config) = planner_parts();
        let planner = WorkspacePlanner::new(&registry, &device, &config);
        let p = ConvolutionParams::new(0, 0, 1, 1, 1, 1).unwrap();
        let x = t(1, 3, 8, 8);
        let half = TensorShape::new(DataType::Half, 4, 3, 3, 3);
        assert!(planner.forward(&half, &x, &t(1, 4, 6, 6), &p).is_err());
        assert!(planner.forward(&t(4, 3, 3, 3), &x, &t(1, 4, 5, 5), &p).is_err());
        assert_eq!(planner.forward(&t(4, 3, 3, 3), &x, &t(1, 4, 6, 6), &p).unwrap(), 3 * 9 * 36 * 4);
    }
}
