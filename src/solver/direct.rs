//! Direct convolution kernels and the implicit-GEMM kernel.
//!
//! Searchable members carry a small tile/partition config and delegate
//! their search to [`generic_search`].

use serde::{Deserialize, Serialize};

use crate::core::conv::ConvolutionMode;
use crate::core::device::DeviceHandle;
use crate::error::Result;
use crate::problem::Direction;
use crate::solver::generic_search::{generic_search, Tunable};
use crate::solver::{ConvContext, ConvSolution, PerformanceConfig, Solver, SolverFamily};
use crate::workspace::{checked_bytes, is_direct_supported};

const GROUP_SIZES: [usize; 3] = [64, 128, 256];

fn round_up(v: usize, m: usize) -> usize {
    v.div_ceil(m).saturating_mul(m)
}

fn is_pointwise(ctx: &ConvContext<'_>) -> bool {
    let w = ctx.problem.w();
    w.h == 1 && w.w == 1
}

fn geometry_options(ctx: &ConvContext<'_>) -> String {
    let p = ctx.problem;
    format!(
        "-DMLO_BATCH_SZ={} -DMLO_N_INPUTS={} -DMLO_IN_HEIGHT={} -DMLO_IN_WIDTH={} -DMLO_N_OUTPUTS={} -DMLO_OUT_HEIGHT={} -DMLO_OUT_WIDTH={} -DMLO_FILTER_SIZE0={} -DMLO_FILTER_SIZE1={} -DMLO_FILTER_PAD0={} -DMLO_FILTER_PAD1={} -DMLO_FILTER_STRIDE0={} -DMLO_FILTER_STRIDE1={} -DMLO_DIR_FORWARD={}",
        p.batch_size(),
        p.in_channels(),
        p.in_height(),
        p.in_width(),
        p.out_channels(),
        p.out_height(),
        p.out_width(),
        p.filter_width(),
        p.filter_height(),
        p.params().pad_w(),
        p.params().pad_h(),
        p.params().v(),
        p.params().u(),
        u8::from(p.direction().is_forward())
    )
}

// ---------------------------------------------------------------------------
// 1x1

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Direct1x1Config {
    pub read_unit: usize,
    pub n_out_maps: usize,
    pub group_size: usize,
}

impl PerformanceConfig for Direct1x1Config {
    fn is_valid(&self, ctx: &ConvContext<'_>) -> bool {
        let p = ctx.problem;
        let spatial = p.in_height().saturating_mul(p.in_width());
        self.read_unit > 0
            && self.n_out_maps > 0
            && GROUP_SIZES.contains(&self.group_size)
            && p.out_channels() % self.n_out_maps == 0
            && spatial % self.read_unit == 0
    }
}

/// Pointwise filter, unit stride, no padding.
pub struct ConvDirect1x1;

impl Solver for ConvDirect1x1 {
    type Config = Direct1x1Config;

    fn id(&self) -> &'static str {
        "ConvOclDirectFwd1x1"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::Direct
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        let p = ctx.problem.params();
        ctx.problem.direction() != Direction::BackwardWeights
            && p.mode() == ConvolutionMode::Standard
            && is_pointwise(ctx)
            && p.is_unit_stride()
            && p.is_zero_pad()
            && p.is_unit_dilation()
    }

    fn is_searchable(&self) -> bool {
        true
    }

    fn default_config(&self, ctx: &ConvContext<'_>) -> Direct1x1Config {
        let p = ctx.problem;
        let spatial = p.in_height().saturating_mul(p.in_width());
        let read_unit = [4, 2, 1].into_iter().find(|r| spatial % r == 0).unwrap_or(1);
        let n_out_maps = [8, 4, 2, 1].into_iter().find(|n| p.out_channels() % n == 0).unwrap_or(1);
        Direct1x1Config {
            read_unit,
            n_out_maps,
            group_size: 64,
        }
    }

    fn search(&self, ctx: &ConvContext<'_>, handle: &dyn DeviceHandle) -> Result<Direct1x1Config> {
        generic_search(self, ctx, handle)
    }

    fn get_solution(&self, ctx: &ConvContext<'_>, config: &Direct1x1Config) -> Result<ConvSolution> {
        let p = ctx.problem;
        let spatial = p.in_height().saturating_mul(p.in_width());
        let options = format!(
            "{} -DMLO_READ_UNIT={} -DMLO_N_OUT_MAPS={} -DMLO_GRP_SZ0={}",
            geometry_options(ctx),
            config.read_unit,
            config.n_out_maps,
            config.group_size
        );
        let mut solution = ConvSolution::new(Solver::id(self));
        solution.push_kernel(
            "MIOpenConv1x1.cl",
            "MIOpenConv1x1",
            options,
            [config.group_size, 1, 1],
            [
                round_up((spatial / config.read_unit).max(1), config.group_size),
                (p.out_channels() / config.n_out_maps).max(1),
                p.batch_size(),
            ],
        );
        Ok(solution)
    }
}

impl Tunable for ConvDirect1x1 {
    fn search_space(&self, _ctx: &ConvContext<'_>) -> Vec<Direct1x1Config> {
        let mut space = Vec::new();
        for read_unit in [1, 2, 4] {
            for n_out_maps in [1, 2, 4, 8] {
                for group_size in GROUP_SIZES {
                    space.push(Direct1x1Config {
                        read_unit,
                        n_out_maps,
                        group_size,
                    });
                }
            }
        }
        space
    }
}

// ---------------------------------------------------------------------------
// Generic direct

/// Any filter the direct-support filter accepts, unit dilation.
pub struct ConvDirectGeneric;

impl Solver for ConvDirectGeneric {
    type Config = ();

    fn id(&self) -> &'static str {
        "ConvOclDirectFwd"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::Direct
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        let p = ctx.problem.params();
        ctx.problem.direction() != Direction::BackwardWeights
            && p.mode() != ConvolutionMode::Transposed
            && p.is_unit_dilation()
            && is_direct_supported(p, ctx.problem.w())
    }

    fn default_config(&self, _ctx: &ConvContext<'_>) {}

    fn get_solution(&self, ctx: &ConvContext<'_>, _config: &()) -> Result<ConvSolution> {
        let p = ctx.problem;
        let groups = p.params().groups_for(p.x().c);
        let options = format!("{} -DMLO_GROUP_COUNTS={}", geometry_options(ctx), groups);
        let mut solution = ConvSolution::new(Solver::id(self));
        solution.push_kernel(
            "MIOpenConvDirUni.cl",
            "MIOpenConvUni",
            options,
            [8, 8, 1],
            [
                round_up(p.out_width(), 8),
                round_up(p.out_height(), 8),
                p.out_channels().saturating_mul(p.batch_size()),
            ],
        );
        Ok(solution)
    }
}

// ---------------------------------------------------------------------------
// Strided 1x1

/// Pointwise filter with stride 2: subsample the input first, then run the
/// unit-stride 1x1 kernel on the subsampled copy.
pub struct ConvDirectSubsample1x1;

impl ConvDirectSubsample1x1 {
    fn subsampled_bytes(ctx: &ConvContext<'_>) -> usize {
        let (x, y) = (ctx.problem.x(), ctx.problem.y());
        checked_bytes(&[x.n, x.c, y.h, y.w, x.type_size()]).unwrap_or(usize::MAX)
    }
}

impl Solver for ConvDirectSubsample1x1 {
    type Config = ();

    fn id(&self) -> &'static str {
        "ConvOclDirectFwdSubsample1x1"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::Direct
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        let p = ctx.problem.params();
        ctx.problem.direction() == Direction::Forward
            && p.mode() == ConvolutionMode::Standard
            && is_pointwise(ctx)
            && p.u() == 2
            && p.v() == 2
            && p.is_zero_pad()
            && p.is_unit_dilation()
    }

    fn default_config(&self, _ctx: &ConvContext<'_>) {}

    fn workspace_size(&self, ctx: &ConvContext<'_>, _config: &()) -> usize {
        Self::subsampled_bytes(ctx)
    }

    fn get_solution(&self, ctx: &ConvContext<'_>, config: &()) -> Result<ConvSolution> {
        let p = ctx.problem;
        let (x, y) = (p.x(), p.y());
        let ws = self.workspace_size(ctx, config);
        let mut solution = ConvSolution::new(Solver::id(self)).with_workspace(ws);
        solution.push_kernel(
            "MIOpenUtilKernels3.cl",
            "SubSample",
            format!("-DMLO_SUBSAMPLE_STRIDE0={} -DMLO_SUBSAMPLE_STRIDE1={}", p.params().v(), p.params().u()),
            [256, 1, 1],
            [round_up(checked_bytes(&[x.n, x.c, y.h, y.w]).unwrap_or(usize::MAX), 256), 1, 1],
        );
        solution.push_kernel(
            "MIOpenConv1x1.cl",
            "MIOpenConv1x1",
            format!("{} -DMLO_READ_UNIT=1 -DMLO_N_OUT_MAPS=1 -DMLO_GRP_SZ0=64", geometry_options(ctx)),
            [64, 1, 1],
            [round_up(y.h * y.w, 64), y.c, y.n],
        );
        Ok(solution)
    }
}

// ---------------------------------------------------------------------------
// Backward weights

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BwdWrWConfig {
    /// Batch partitions reduced in a second pass.
    pub n_batch_blocks: usize,
    pub group_size: usize,
}

impl PerformanceConfig for BwdWrWConfig {
    fn is_valid(&self, ctx: &ConvContext<'_>) -> bool {
        self.n_batch_blocks > 0
            && ctx.problem.batch_size() % self.n_batch_blocks == 0
            && GROUP_SIZES.contains(&self.group_size)
    }
}

/// Weight gradient for odd filters up to 11 with stride at most 2.
pub struct ConvDirectBwdWeights;

impl Solver for ConvDirectBwdWeights {
    type Config = BwdWrWConfig;

    fn id(&self) -> &'static str {
        "ConvOclBwdWrW2"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::Direct
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        let p = ctx.problem.params();
        let w = ctx.problem.w();
        ctx.problem.direction() == Direction::BackwardWeights
            && matches!(p.mode(), ConvolutionMode::Standard | ConvolutionMode::Grouped)
            && p.is_unit_dilation()
            && w.h % 2 == 1
            && w.w % 2 == 1
            && w.h <= 11
            && w.w <= 11
            && p.u() <= 2
            && p.v() <= 2
    }

    fn is_searchable(&self) -> bool {
        true
    }

    fn default_config(&self, _ctx: &ConvContext<'_>) -> BwdWrWConfig {
        BwdWrWConfig {
            n_batch_blocks: 1,
            group_size: 64,
        }
    }

    fn search(&self, ctx: &ConvContext<'_>, handle: &dyn DeviceHandle) -> Result<BwdWrWConfig> {
        generic_search(self, ctx, handle)
    }

    /// Partial sums per batch block; a single block writes `dw` directly.
    fn workspace_size(&self, ctx: &ConvContext<'_>, config: &BwdWrWConfig) -> usize {
        if config.n_batch_blocks <= 1 {
            return 0;
        }
        let w = ctx.problem.w();
        checked_bytes(&[config.n_batch_blocks, w.element_count(), w.type_size()]).unwrap_or(usize::MAX)
    }

    fn get_solution(&self, ctx: &ConvContext<'_>, config: &BwdWrWConfig) -> Result<ConvSolution> {
        let p = ctx.problem;
        let w = p.w();
        let ws = self.workspace_size(ctx, config);
        let options = format!(
            "{} -DMLO_N_BATCH_BLKS={} -DMLO_GRP_SZ0={} -DMLO_GROUP_COUNTS={}",
            geometry_options(ctx),
            config.n_batch_blocks,
            config.group_size,
            p.params().groups_for(p.x().c)
        );
        let mut solution = ConvSolution::new(Solver::id(self)).with_workspace(ws);
        solution.push_kernel(
            "MIOpenConvBwdWrW.cl",
            "MIOpenCvBwdWrW",
            options.clone(),
            [config.group_size, 1, 1],
            [config.group_size * config.n_batch_blocks, w.c, w.n],
        );
        if config.n_batch_blocks > 1 {
            solution.push_kernel(
                "MIOpenConvBwdWrW.cl",
                "MIOpenCvBwdWrW_rdc",
                options,
                [config.group_size, 1, 1],
                [round_up(w.element_count(), config.group_size), 1, 1],
            );
        }
        Ok(solution)
    }
}

impl Tunable for ConvDirectBwdWeights {
    fn search_space(&self, ctx: &ConvContext<'_>) -> Vec<BwdWrWConfig> {
        let batch = ctx.problem.batch_size();
        [1, 2, 4, 8, 16]
            .into_iter()
            .filter(|b| batch % b == 0)
            .flat_map(|n_batch_blocks| {
                GROUP_SIZES.into_iter().map(move |group_size| BwdWrWConfig {
                    n_batch_blocks,
                    group_size,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Implicit GEMM

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplicitGemmConfig {
    pub block_m: usize,
    pub block_n: usize,
    pub block_k: usize,
}

impl ImplicitGemmConfig {
    /// Double-buffered A and B tiles in local memory.
    pub fn lds_bytes(&self) -> usize {
        (self.block_m + self.block_n) * self.block_k * 4 * 2
    }

    fn block_size(&self) -> usize {
        (self.block_m * self.block_n / 16).max(1)
    }
}

/// GEMM dimensions seen by the implicit kernel: output channels, output
/// pixels over the batch, and the reduction length.
fn implicit_gemm_dims(ctx: &ConvContext<'_>) -> (usize, usize, usize) {
    let p = ctx.problem;
    let w = p.w();
    (
        p.out_channels(),
        checked_bytes(&[p.batch_size(), p.out_height(), p.out_width()]).unwrap_or(usize::MAX),
        checked_bytes(&[w.c, w.h, w.w]).unwrap_or(usize::MAX),
    )
}

impl PerformanceConfig for ImplicitGemmConfig {
    fn is_valid(&self, ctx: &ConvContext<'_>) -> bool {
        let (m, n, k) = implicit_gemm_dims(ctx);
        self.block_m > 0
            && self.block_n > 0
            && self.block_k > 0
            && m % self.block_m == 0
            && n % self.block_n == 0
            && k % self.block_k == 0
            && self.lds_bytes() <= ctx.device.local_memory_size
    }
}

pub struct ConvImplicitGemm;

impl Solver for ConvImplicitGemm {
    type Config = ImplicitGemmConfig;

    fn id(&self) -> &'static str {
        "ConvImplicitGemm"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::ImplicitGemm
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        let p = ctx.problem.params();
        let (m, n, k) = implicit_gemm_dims(ctx);
        ctx.problem.direction() == Direction::Forward
            && p.mode() == ConvolutionMode::Standard
            && p.is_unit_dilation()
            && ctx.problem.in_type_size() == 4
            && m % 16 == 0
            && k % 8 == 0
            && n % 16 == 0
    }

    fn is_searchable(&self) -> bool {
        true
    }

    fn default_config(&self, _ctx: &ConvContext<'_>) -> ImplicitGemmConfig {
        ImplicitGemmConfig {
            block_m: 16,
            block_n: 16,
            block_k: 4,
        }
    }

    fn search(&self, ctx: &ConvContext<'_>, handle: &dyn DeviceHandle) -> Result<ImplicitGemmConfig> {
        generic_search(self, ctx, handle)
    }

    fn get_solution(&self, ctx: &ConvContext<'_>, config: &ImplicitGemmConfig) -> Result<ConvSolution> {
        let (m, n, k) = implicit_gemm_dims(ctx);
        let block = config.block_size();
        let options = format!(
            "{} -DCK_GEMM_M={} -DCK_GEMM_N={} -DCK_GEMM_K={} -DCK_BLOCK_M={} -DCK_BLOCK_N={} -DCK_BLOCK_K={} -DCK_BLOCK_SIZE={}",
            geometry_options(ctx),
            m,
            n,
            k,
            config.block_m,
            config.block_n,
            config.block_k,
            block
        );
        let tiles = (m / config.block_m.max(1)).max(1) * (n / config.block_n.max(1)).max(1);
        let mut solution = ConvSolution::new(Solver::id(self));
        solution.push_kernel(
            "gridwise_convolution_implicit_gemm.cpp",
            "gridwise_convolution_implicit_gemm",
            options,
            [block, 1, 1],
            [tiles * block, 1, 1],
        );
        Ok(solution)
    }
}

impl Tunable for ConvImplicitGemm {
    fn search_space(&self, _ctx: &ConvContext<'_>) -> Vec<ImplicitGemmConfig> {
        let tiles = [16, 32, 64, 128];
        let mut space = Vec::with_capacity(tiles.len() * tiles.len() * 3);
        for block_m in tiles {
            for block_n in tiles {
                for block_k in [4, 8, 16] {
                    space.push(ImplicitGemmConfig { block_m, block_n, block_k });
                }
            }
        }
        space
    }
}
