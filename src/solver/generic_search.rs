//! Exhaustive search over a solver's config space.
//!
//! Each feasible candidate is realized into a plan and timed on the device;
//! the fastest one wins. Candidate failures only drop that candidate, except
//! for fatal device errors which end the search.

use crate::core::device::{BufferId, DeviceHandle};
use crate::error::{ConvError, Result};
use crate::solver::{ConvContext, ConvSolution, PerformanceConfig, Solver};

/// A solver whose configs can be enumerated.
pub trait Tunable: Solver {
    /// Every candidate to try, in a stable order.
    fn search_space(&self, ctx: &ConvContext<'_>) -> Vec<Self::Config>;

    /// Cheap check run before any device work.
    fn is_feasible(&self, ctx: &ConvContext<'_>, config: &Self::Config) -> bool {
        config.is_valid(ctx)
    }
}

/// Device buffers for one trial run.
struct TrialBuffers<'h> {
    handle: &'h dyn DeviceHandle,
    ids: Vec<BufferId>,
}

impl<'h> TrialBuffers<'h> {
    fn allocate(handle: &'h dyn DeviceHandle, sizes: &[usize]) -> Result<Self> {
        let mut buffers = Self { handle, ids: Vec::new() };
        for &bytes in sizes.iter().filter(|b| **b > 0) {
            buffers.ids.push(handle.allocate(bytes)?);
        }
        Ok(buffers)
    }
}

impl Drop for TrialBuffers<'_> {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            if let Err(e) = self.handle.free(id) {
                log::warn!("failed to release trial buffer: {}", e);
            }
        }
    }
}

/// Launches every kernel of `solution` once and returns the summed kernel time.
pub fn run_trial(ctx: &ConvContext<'_>, solution: &ConvSolution, handle: &dyn DeviceHandle) -> Result<f32> {
    let problem = ctx.problem;
    let buffers = TrialBuffers::allocate(
        handle,
        &[
            problem.x().byte_size(),
            problem.w().byte_size(),
            problem.y().byte_size(),
            solution.workspace_size,
        ],
    )?;
    let mut total = 0.0;
    for kernel in &solution.construction_params {
        let program = handle.load_program(&kernel.kernel_file, &kernel.comp_options)?;
        handle.launch(&program, &kernel.kernel_name, kernel.launch_params(), &buffers.ids)?;
        handle.finish()?;
        total += handle.kernel_time_ms();
    }
    Ok(total)
}

pub fn generic_search<S: Tunable>(solver: &S, ctx: &ConvContext<'_>, handle: &dyn DeviceHandle) -> Result<S::Config> {
    let space = solver.search_space(ctx);
    let total = space.len();
    log::info!("{}: searching {} candidates", Solver::id(solver), total);

    let mut best: Option<(f32, S::Config)> = None;
    for (i, cfg) in space.into_iter().enumerate() {
        if !solver.is_feasible(ctx, &cfg) {
            log::debug!("[{}/{}] infeasible: {:?}", i + 1, total, cfg);
            continue;
        }
        let timed = solver
            .get_solution(ctx, &cfg)
            .and_then(|solution| run_trial(ctx, &solution, handle));
        match timed {
            Ok(ms) => {
                log::debug!("[{}/{}] {:?}: {:.4} ms", i + 1, total, cfg, ms);
                if best.as_ref().map_or(true, |(b, _)| ms < *b) {
                    best = Some((ms, cfg));
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => log::warn!("[{}/{}] {:?} failed: {}", i + 1, total, cfg, e),
        }
    }

    match best {
        Some((ms, cfg)) => {
            log::info!("{}: best {:?} ({:.4} ms)", Solver::id(solver), cfg, ms);
            Ok(cfg)
        }
        None => Err(ConvError::SearchFailed {
            solver: Solver::id(solver).to_string(),
            reason: format!("none of {} candidates ran", total),
        }),
    }
}
