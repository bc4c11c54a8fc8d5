//! Transform-domain convolution for 5x5 filters on small square images.

use crate::core::conv::ConvolutionMode;
use crate::error::Result;
use crate::problem::{Direction, ProblemDescription};
use crate::solver::{ConvContext, ConvSolution, Solver, SolverFamily};
use crate::workspace::{checked_bytes, WorkspaceEstimate};

const SUPPORTED_IMAGES: &[(usize, usize)] = &[(28, 28), (27, 27), (14, 14), (7, 7)];
const PADDING: usize = 64;

pub fn is_supported(problem: &ProblemDescription) -> bool {
    let p = problem.params();
    let (x, w) = (problem.x(), problem.w());
    let (n, c, k, cw) = (x.n, x.c, w.n, w.c);
    problem.direction() != Direction::BackwardWeights
        && p.mode() == ConvolutionMode::Standard
        && (1..=512).contains(&n)
        && (1..=512).contains(&k)
        && divisible_by_16(c, n)
        && divisible_by_16(cw, k)
        && divisible_by_16(n, k)
        && SUPPORTED_IMAGES.contains(&(x.h, x.w))
        && w.h == 5
        && w.w == 5
        && p.pad_h() == 2
        && p.pad_w() == 2
        && p.is_unit_stride()
        && p.is_unit_dilation()
        && x.type_size() == 4
        && w.type_size() == 4
}

fn divisible_by_16(a: usize, b: usize) -> bool {
    a.checked_mul(b).is_some_and(|v| v % 16 == 0)
}

/// Side of the power-of-two transform covering the padded image.
fn transform_side(problem: &ProblemDescription) -> usize {
    (problem.x().h + problem.w().h - 1).next_power_of_two()
}

/// Frequency-domain buffers: input, filter and output spectra, complex-valued and
/// double-buffered.
pub fn workspace(problem: &ProblemDescription) -> WorkspaceEstimate {
    if !is_supported(problem) {
        return WorkspaceEstimate::NotApplicable;
    }
    let (x, w) = (problem.x(), problem.w());
    let side = transform_side(problem);
    let tile = (side / 2 + 1) * side;
    let inputs = checked_bytes(&[x.c, x.n]).zip(checked_bytes(&[w.n, w.c]));
    let spectra = inputs
        .and_then(|(a, b)| a.checked_add(b)?.checked_add(2 * PADDING))
        .map(|s| s.max(x.n * w.n + PADDING));
    match spectra {
        Some(s) => WorkspaceEstimate::from_factors(&[2, 2, tile, s, 4]),
        None => WorkspaceEstimate::ExceedsAllocLimit(usize::MAX),
    }
}

pub struct ConvFft;

impl Solver for ConvFft {
    type Config = ();

    fn id(&self) -> &'static str {
        "ConvFft"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::Fft
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        is_supported(ctx.problem)
    }

    fn default_config(&self, _ctx: &ConvContext<'_>) {}

    fn workspace_size(&self, ctx: &ConvContext<'_>, _config: &()) -> usize {
        workspace(ctx.problem).bytes()
    }

    fn get_solution(&self, ctx: &ConvContext<'_>, config: &()) -> Result<ConvSolution> {
        let problem = ctx.problem;
        let (x, w) = (problem.x(), problem.w());
        let side = transform_side(problem);
        let options = format!(
            "-DCFF_TRANSFORM_SIZE={} -DCFF_IMG_H={} -DCFF_IMG_W={} -DCFF_BATCH={} -DCFF_NFILTER={} -DCFF_CHANNELS={} -DCFF_BACKWARD={}",
            side,
            x.h,
            x.w,
            x.n,
            w.n,
            w.c,
            u8::from(problem.direction() == Direction::BackwardData)
        );
        let mut solution = ConvSolution::new(Solver::id(self)).with_workspace(self.workspace_size(ctx, config));
        let tile = (side / 2 + 1) * side;
        let stages = [
            ("MIOpenConvFFT_fwd_in", x.n * x.c),
            ("MIOpenConvFFT_fwd_we", w.n * w.c),
            ("MIOpenConvFFT_transpose_in", x.n * x.c),
            ("MIOpenConvFFT_transpose_we", w.n * w.c),
            ("MIOpenConvFFT_cgemm", tile),
            ("MIOpenConvFFT_transpose_out", x.n * w.n),
            ("MIOpenConvFFT_inv_out", x.n * w.n),
        ];
        for (name, groups) in stages {
            solution.push_kernel("MIOpenConvFFT.cl", name, options.clone(), [64, 1, 1], [64 * groups.max(1), 1, 1]);
        }
        Ok(solution)
    }
}
