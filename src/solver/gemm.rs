//! im2col + GEMM convolution and its workspace arithmetic.

use crate::core::conv::{ConvolutionMode, ConvolutionParams};
use crate::core::tensor::TensorShape;
use crate::error::Result;
use crate::problem::{Direction, ProblemDescription};
use crate::solver::{ConvContext, ConvSolution, Solver, SolverFamily};
use crate::workspace::WorkspaceEstimate;

const GEMM_GROUP: usize = 256;

/// Column buffer for one group: `w.C * w.H * w.W` rows by `out.H * out.W` columns.
///
/// Pointwise filters with unit stride and no padding read the input in
/// place and need nothing.
pub fn gemm_size(params: &ConvolutionParams, w: &TensorShape, out: &TensorShape) -> WorkspaceEstimate {
    if w.h == 1 && w.w == 1 && params.is_unit_stride() && params.is_zero_pad() {
        return WorkspaceEstimate::NotNeeded;
    }
    WorkspaceEstimate::from_factors(&[w.c, w.h, w.w, out.h, out.w, out.type_size()])
}

/// Relayout buffers for the transposed-layout GEMM path: the input
/// subsampled to the output grid plus a copy of the output.
pub fn gemm_transpose_size(problem: &ProblemDescription) -> WorkspaceEstimate {
    let (x, y) = (problem.x(), problem.y());
    let subsampled = WorkspaceEstimate::from_factors(&[x.n, x.c, y.h, y.w, x.type_size()]);
    subsampled.plus(WorkspaceEstimate::from_factors(&[y.n, y.c, y.h, y.w, y.type_size()]))
}

/// Whether the relayout path replaces im2col for this problem.
pub fn uses_transpose_path(problem: &ProblemDescription) -> bool {
    let p = problem.params();
    let (w, x) = (problem.w(), problem.x());
    if p.mode() == ConvolutionMode::Transposed || !(w.h == 1 && w.w == 1 && p.is_zero_pad()) {
        return false;
    }
    let stride2 = p.u() == 2 && p.v() == 2;
    match problem.direction() {
        Direction::Forward => (x.h <= 14 && x.w <= 14 && p.is_unit_stride()) || stride2,
        Direction::BackwardData => stride2,
        Direction::BackwardWeights => false,
    }
}

/// Per-group column buffer for the problem's direction.
///
/// Transposed convolutions swap the data roles, so their column buffer is
/// laid over the input grid instead of the output grid.
pub fn direction_gemm_size(problem: &ProblemDescription) -> WorkspaceEstimate {
    let p = problem.params();
    if p.mode() == ConvolutionMode::Transposed {
        gemm_size(p, problem.w(), problem.x())
    } else {
        gemm_size(p, problem.w(), problem.y())
    }
}

/// What a GEMM plan for this problem allocates, before the device ceiling.
pub fn workspace(problem: &ProblemDescription) -> WorkspaceEstimate {
    let p = problem.params();
    if p.mode() == ConvolutionMode::Transposed {
        return direction_gemm_size(problem);
    }
    if uses_transpose_path(problem) {
        return gemm_transpose_size(problem);
    }
    direction_gemm_size(problem).scaled(p.groups_for(problem.x().c))
}

fn round_up(v: usize, m: usize) -> usize {
    v.div_ceil(m).saturating_mul(m)
}

pub struct ConvGemm;

impl Solver for ConvGemm {
    type Config = ();

    fn id(&self) -> &'static str {
        "ConvGemm"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::Gemm
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        ctx.config.gemm_enabled()
            && !matches!(
                workspace(ctx.problem).capped(ctx.device.max_mem_alloc_size),
                WorkspaceEstimate::ExceedsAllocLimit(_)
            )
    }

    fn is_fast(&self, _ctx: &ConvContext<'_>) -> bool {
        false
    }

    fn default_config(&self, _ctx: &ConvContext<'_>) {}

    fn workspace_size(&self, ctx: &ConvContext<'_>, _config: &()) -> usize {
        workspace(ctx.problem).bytes()
    }

    fn get_solution(&self, ctx: &ConvContext<'_>, config: &()) -> Result<ConvSolution> {
        let problem = ctx.problem;
        let ws = self.workspace_size(ctx, config);
        let mut solution = ConvSolution::new(Solver::id(self)).with_workspace(ws);
        let (w, y) = (problem.w(), problem.y());
        let gemm_options = format!("-DGEMM_M={} -DGEMM_N={} -DGEMM_K={}", w.n, y.h * y.w, w.c * w.h * w.w);
        let out_elems = round_up(y.element_count(), GEMM_GROUP);
        let l_wk = [GEMM_GROUP, 1, 1];

        if uses_transpose_path(problem) {
            let x = problem.x();
            solver_kernel(&mut solution, "transpose_NCHW2CNHW", x.element_count(), String::new());
            solution.push_kernel("MIOpenGEMM.cl", "gemm", gemm_options, l_wk, [out_elems, 1, 1]);
            solver_kernel(&mut solution, "transpose_CNHW2NCHW", y.element_count(), String::new());
        } else {
            if ws > 0 {
                let p = problem.params();
                let im2col = format!(
                    "-DFILTER_H={} -DFILTER_W={} -DPAD_H={} -DPAD_W={} -DSTRIDE_H={} -DSTRIDE_W={} -DDILATION_H={} -DDILATION_W={}",
                    w.h,
                    w.w,
                    p.pad_h(),
                    p.pad_w(),
                    p.u(),
                    p.v(),
                    p.dilation_h(),
                    p.dilation_w()
                );
                let columns = ws / y.type_size().max(1);
                let kernel = match problem.direction() {
                    Direction::BackwardData => "col2Im",
                    _ => "Im2Col",
                };
                solver_kernel(&mut solution, kernel, columns, im2col);
            }
            solution.push_kernel("MIOpenGEMM.cl", "gemm", gemm_options, l_wk, [out_elems, 1, 1]);
        }
        Ok(solution)
    }
}

fn solver_kernel(solution: &mut ConvSolution, name: &str, elements: usize, options: String) {
    solution.push_kernel(
        "MIOpenUtilKernels.cl",
        name,
        options,
        [GEMM_GROUP, 1, 1],
        [round_up(elements.max(1), GEMM_GROUP), 1, 1],
    );
}
