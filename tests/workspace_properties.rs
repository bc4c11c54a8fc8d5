use convplan::workspace::PlanRule;
use convplan::{
    ConvolutionMode, ConvolutionParams, DataType, DeviceProfile, Direction, PaddingMode, PerfDb, PlannerConfig,
    ProblemDescription, SolverRegistry, TensorShape, WorkspacePlanner,
};

fn t(n: usize, c: usize, h: usize, w: usize) -> TensorShape {
    TensorShape::new(DataType::Float, n, c, h, w)
}

#[test]
fn pointwise_unit_stride_needs_no_workspace() {
    let registry = SolverRegistry::standard();
    let device = DeviceProfile::rocm("gfx1030", 40);
    let config = PlannerConfig::default();
    let planner = WorkspacePlanner::new(&registry, &device, &config);
    let p = ConvolutionParams::new(0, 0, 1, 1, 1, 1).unwrap();
    for (n, c, k, hw) in [(1, 64, 64, 56), (8, 256, 64, 28), (2, 32, 16, 100)] {
        let x = t(n, c, hw, hw);
        let w = t(k, c, 1, 1);
        let y = p.forward_output_shape(&x, &w).unwrap();
        assert_eq!(planner.forward(&w, &x, &y, &p).unwrap(), 0, "{}x{}x{}", n, c, hw);
        assert_eq!(planner.backward_data(&w, &y, &x, &p).unwrap(), 0);
    }
}

#[test]
fn small_pointwise_forward_reserves_relayout_buffers() {
    let registry = SolverRegistry::standard();
    let device = DeviceProfile::default();
    let config = PlannerConfig::default();
    let planner = WorkspacePlanner::new(&registry, &device, &config);
    let p = ConvolutionParams::new(0, 0, 1, 1, 1, 1).unwrap();
    let problem = ProblemDescription::forward(t(4, 32, 7, 7), t(64, 32, 1, 1), p).unwrap();
    let plan = planner.plan(&problem);
    assert_eq!(plan.rule, PlanRule::GemmTranspose);
    assert_eq!(plan.bytes, 4 * 32 * 7 * 7 * 4 + 4 * 64 * 7 * 7 * 4);
}

#[test]
fn strided_pointwise_takes_larger_of_relayout_and_subsample() {
    let registry = SolverRegistry::standard();
    let device = DeviceProfile::default();
    let config = PlannerConfig::default();
    let planner = WorkspacePlanner::new(&registry, &device, &config);
    let p = ConvolutionParams::new(0, 0, 2, 2, 1, 1).unwrap();
    let problem = ProblemDescription::forward(t(2, 16, 32, 32), t(8, 16, 1, 1), p).unwrap();
    let plan = planner.plan(&problem);
    let relayout = 2 * 16 * 16 * 16 * 4 + 2 * 8 * 16 * 16 * 4;
    let subsample = 2 * 16 * 16 * 16 * 4;
    assert_eq!(plan.direct.bytes(), subsample);
    assert_eq!(plan.bytes, relayout.max(subsample));
}

#[test]
fn grouped_never_short_circuits() {
    let registry = SolverRegistry::standard();
    let device = DeviceProfile::default();
    let config = PlannerConfig::default();
    let planner = WorkspacePlanner::new(&registry, &device, &config);
    let p = ConvolutionParams::with_modes(ConvolutionMode::Grouped, PaddingMode::Default, 1, 1, 1, 1, 1, 1)
        .unwrap()
        .with_group_count(2)
        .unwrap();
    let problem = ProblemDescription::forward(t(2, 32, 28, 28), t(32, 16, 3, 3), p).unwrap();
    let plan = planner.plan(&problem);
    assert_ne!(plan.rule, PlanRule::Winograd);
    assert_eq!(plan.bytes, 2 * 16 * 9 * 28 * 28 * 4);
}

#[test]
fn winograd_eligibility_drives_the_short_circuit() {
    let registry = SolverRegistry::standard();
    let config = PlannerConfig::default();
    let p = ConvolutionParams::new(1, 1, 1, 1, 1, 1).unwrap();
    let problem = ProblemDescription::forward(t(1, 64, 56, 56), t(64, 64, 3, 3), p).unwrap();

    let listed = DeviceProfile::rocm("gfx906", 60);
    let plan = WorkspacePlanner::new(&registry, &listed, &config).plan(&problem);
    assert!(plan.winograd_eligible);
    assert_eq!(plan.bytes, 0);

    let unlisted = DeviceProfile::rocm("gfx1100", 48);
    let plan = WorkspacePlanner::new(&registry, &unlisted, &config).plan(&problem);
    assert!(!plan.winograd_eligible);
    assert_eq!(plan.bytes, 64 * 9 * 56 * 56 * 4);
}

#[test]
fn fft_is_part_of_the_maximum() {
    let registry = SolverRegistry::standard();
    let device = DeviceProfile::rocm("gfx1030", 40);
    let config = PlannerConfig::default();
    let planner = WorkspacePlanner::new(&registry, &device, &config);
    let p = ConvolutionParams::new(2, 2, 1, 1, 1, 1).unwrap();
    let problem = ProblemDescription::forward(t(16, 16, 28, 28), t(16, 16, 5, 5), p).unwrap();
    let plan = planner.plan(&problem);
    assert!(plan.fft.bytes() > 0);
    assert_eq!(plan.bytes, plan.fft.bytes().max(plan.gemm.bytes()).max(plan.direct.bytes()));
}

#[test]
fn backward_data_transposed_mode_uses_input_grid() {
    let registry = SolverRegistry::standard();
    let device = DeviceProfile::default();
    let config = PlannerConfig::default();
    let planner = WorkspacePlanner::new(&registry, &device, &config);
    let p = ConvolutionParams::with_modes(ConvolutionMode::Transposed, PaddingMode::Default, 1, 1, 2, 2, 1, 1).unwrap();
    let x = t(1, 16, 8, 8);
    let w = t(16, 4, 4, 4);
    let y = p.forward_output_shape(&x, &w).unwrap();
    assert_eq!(planner.backward_data(&w, &y, &x, &p).unwrap(), 4 * 16 * 8 * 8 * 4);
}

#[test]
fn stored_partitioning_grows_the_backward_weights_plan() {
    let dir = tempfile::tempdir().unwrap();
    let db = PerfDb::new(dir.path().join("perf_db.jsonl"));
    let registry = SolverRegistry::standard();
    let device = DeviceProfile::default();
    let config = PlannerConfig {
        enable_gemm: false,
        ..PlannerConfig::default()
    };
    let p = ConvolutionParams::new(1, 1, 1, 1, 1, 1).unwrap();
    let x = t(8, 4, 14, 14);
    let dy = t(8, 6, 14, 14);
    let problem = ProblemDescription::backward_weights(x, dy, p).unwrap();
    assert_eq!(problem.direction(), Direction::BackwardWeights);

    let planner = WorkspacePlanner::new(&registry, &device, &config).with_perf_db(&db);
    assert_eq!(planner.workspace_size(&problem), 0);

    db.store(
        &problem.signature(),
        "ConvOclBwdWrW2",
        &serde_json::json!({ "n_batch_blocks": 2, "group_size": 64 }),
    )
    .unwrap();
    assert_eq!(planner.workspace_size(&problem), 2 * 6 * 4 * 9 * 4);
}
