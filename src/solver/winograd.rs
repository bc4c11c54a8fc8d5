//! Precompiled 3x3 Winograd kernels for a short list of AMD devices.

use crate::core::conv::ConvolutionMode;
use crate::core::device::DeviceProfile;
use crate::error::Result;
use crate::problem::{Direction, ProblemDescription};
use crate::solver::{ConvContext, ConvSolution, Solver, SolverFamily};

/// Architectures the binaries were built for.
pub const SUPPORTED_DEVICES: &[&str] = &["gfx803", "gfx900", "gfx906"];

const LIMIT_16: usize = 1 << 16;
const LIMIT_28: usize = 1 << 28;

/// Eligibility of the fixed-pattern 3x3 kernel.
///
/// Never an error: any failed clause just means "not eligible". Backward
/// weights has no Winograd kernel.
pub fn is_eligible(problem: &ProblemDescription, device: &DeviceProfile, precompiled_binaries: bool) -> bool {
    if !precompiled_binaries {
        return false;
    }
    let p = problem.params();
    if p.mode() != ConvolutionMode::Standard {
        return false;
    }
    if !SUPPORTED_DEVICES.contains(&device.name.as_str()) {
        return false;
    }
    let w = problem.w();
    let n_outputs = match problem.direction() {
        Direction::Forward => w.n,
        Direction::BackwardData => w.c,
        Direction::BackwardWeights => return false,
    };
    let batch = problem.batch_size();
    let n_inputs = problem.in_channels();
    let (h, wd) = (problem.in_height(), problem.in_width());
    let (kh, kw) = (w.h, w.w);
    let min_inputs = if device.is_gfx8() { 16 } else { 18 };

    p.pad_h() == 1
        && p.pad_w() == 1
        && kh == 3
        && kw == 3
        && p.u() == 1
        && p.v() == 1
        && batch < LIMIT_16
        && n_inputs < LIMIT_16
        && n_outputs < LIMIT_16
        && h < LIMIT_16
        && wd < LIMIT_16
        && device.max_compute_units < LIMIT_16
        && n_inputs * h * wd <= LIMIT_28
        && n_outputs * h * wd <= LIMIT_28
        && n_inputs * kh * kw <= LIMIT_28
        && n_outputs * kh * kw <= LIMIT_28
        && n_inputs % 2 == 0
        && n_inputs >= min_inputs
        && w.type_size() == 4
        && problem.in_type_size() == 4
}

pub struct ConvWinograd3x3;

impl Solver for ConvWinograd3x3 {
    type Config = ();

    fn id(&self) -> &'static str {
        "ConvBinWinograd3x3U"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::Winograd
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        is_eligible(ctx.problem, ctx.device, ctx.config.enable_precompiled_binaries)
    }

    fn default_config(&self, _ctx: &ConvContext<'_>) {}

    fn get_solution(&self, ctx: &ConvContext<'_>, _config: &()) -> Result<ConvSolution> {
        let problem = ctx.problem;
        let binary = if ctx.device.is_gfx8() {
            "conv_3x3_wheel_alpha_v3_0b_gfx803_m30.so"
        } else {
            "conv_3x3_wheel_alpha_v3_0b_gfx9_m30.so"
        };
        let flip = u8::from(problem.direction() == Direction::BackwardData);
        let options = format!(
            "-DBATCH={} -DC={} -DK={} -DH={} -DW={} -DFLIP={}",
            problem.batch_size(),
            problem.in_channels(),
            problem.out_channels(),
            problem.in_height(),
            problem.in_width(),
            flip
        );
        let mut solution = ConvSolution::new(Solver::id(self));
        solution.push_kernel(
            binary,
            "sp3AsmConv3x3F",
            options,
            [512, 1, 1],
            [512 * ctx.device.max_compute_units, 1, 1],
        );
        Ok(solution)
    }
}
