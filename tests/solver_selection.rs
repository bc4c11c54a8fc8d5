use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use convplan::core::device::DeviceHandle;
use convplan::{
    ConfigSource, ConvContext, ConvError, ConvSolution, ConvolutionParams, DataType, DeviceProfile, FindOptions,
    PerfDb, PerformanceConfig, PlannerConfig, ProblemDescription, Result, SearchEngine, SimulatedDevice, Solver,
    SolverFamily, SolverRegistry, TensorShape,
};

fn single_kernel(id: &'static str, file: &str) -> ConvSolution {
    let mut solution = ConvSolution::new(id);
    solution.push_kernel(file, "main", String::new(), [64, 1, 1], [64, 1, 1]);
    solution
}

/// Always applicable to single-column inputs, fast only on single-row ones.
struct TrivialSlowTestSolver;

impl Solver for TrivialSlowTestSolver {
    type Config = ();

    fn id(&self) -> &'static str {
        "TrivialSlowTestSolver"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::Direct
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        ctx.problem.in_width() == 1
    }

    fn is_fast(&self, ctx: &ConvContext<'_>) -> bool {
        ctx.problem.in_height() == 1
    }

    fn default_config(&self, _ctx: &ConvContext<'_>) {}

    fn get_solution(&self, _ctx: &ConvContext<'_>, _config: &()) -> Result<ConvSolution> {
        Ok(single_kernel(Solver::id(self), "TrivialSlowTestSolver"))
    }
}

struct TrivialTestSolver;

impl Solver for TrivialTestSolver {
    type Config = ();

    fn id(&self) -> &'static str {
        "TrivialTestSolver"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::Direct
    }

    fn is_applicable(&self, ctx: &ConvContext<'_>) -> bool {
        ctx.problem.in_width() == 1
    }

    fn default_config(&self, _ctx: &ConvContext<'_>) {}

    fn get_solution(&self, _ctx: &ConvContext<'_>, _config: &()) -> Result<ConvSolution> {
        Ok(single_kernel(Solver::id(self), "TrivialTestSolver"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Label(String);

impl PerformanceConfig for Label {}

/// Applicable everywhere; the config string becomes the kernel file so the
/// test can tell a default plan from a searched one.
struct SearchableTestSolver {
    searches: Arc<AtomicUsize>,
}

impl Solver for SearchableTestSolver {
    type Config = Label;

    fn id(&self) -> &'static str {
        "SearchableTestSolver"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::Direct
    }

    fn is_applicable(&self, _ctx: &ConvContext<'_>) -> bool {
        true
    }

    fn is_searchable(&self) -> bool {
        true
    }

    fn default_config(&self, _ctx: &ConvContext<'_>) -> Label {
        Label("SearchableTestSolver.NoSearch".to_string())
    }

    fn search(&self, _ctx: &ConvContext<'_>, _handle: &dyn DeviceHandle) -> Result<Label> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(Label("SearchableTestSolver".to_string()))
    }

    fn get_solution(&self, _ctx: &ConvContext<'_>, config: &Label) -> Result<ConvSolution> {
        Ok(single_kernel(Solver::id(self), &config.0))
    }
}

fn registry(searches: &Arc<AtomicUsize>) -> SolverRegistry {
    let mut registry = SolverRegistry::new();
    registry
        .register(TrivialSlowTestSolver)
        .register(TrivialTestSolver)
        .register(SearchableTestSolver {
            searches: Arc::clone(searches),
        });
    registry
}

fn problem(h: usize, w: usize) -> ProblemDescription {
    let params = ConvolutionParams::new(0, 0, 1, 1, 1, 1).unwrap();
    ProblemDescription::forward(
        TensorShape::new(DataType::Float, 1, 1, h, w),
        TensorShape::new(DataType::Float, 1, 1, 1, 1),
        params,
    )
    .unwrap()
}

fn search_off() -> FindOptions {
    FindOptions { search_on_miss: false }
}

#[test]
fn selection_follows_speed_then_registration_order() {
    let dir = tempfile::tempdir().unwrap();
    let searches = Arc::new(AtomicUsize::new(0));
    let device = SimulatedDevice::new(DeviceProfile::default());
    let engine = SearchEngine::new(
        registry(&searches),
        PerfDb::new(dir.path().join("perf_db.jsonl")),
        &device,
        PlannerConfig::default(),
    )
    .with_options(search_off());

    let pick = |h, w| {
        engine
            .find_best(&problem(h, w))
            .unwrap()
            .solution()
            .kernel_file()
            .map(str::to_string)
    };

    assert_eq!(pick(1, 1).as_deref(), Some("TrivialSlowTestSolver"));
    assert_eq!(pick(2, 1).as_deref(), Some("TrivialTestSolver"));
    assert_eq!(pick(2, 2).as_deref(), Some("SearchableTestSolver.NoSearch"));
    assert_eq!(searches.load(Ordering::SeqCst), 0);
}

#[test]
fn searched_config_is_reused_from_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("perf_db.jsonl");
    let searches = Arc::new(AtomicUsize::new(0));
    let device = SimulatedDevice::new(DeviceProfile::default());
    let p = problem(2, 2);

    let searching = SearchEngine::new(registry(&searches), PerfDb::new(&db_path), &device, PlannerConfig::default());
    let first = searching.find_best(&p).unwrap();
    assert_eq!(first.solution().kernel_file(), Some("SearchableTestSolver"));
    assert_eq!(first.found.source, ConfigSource::Searched);
    assert_eq!(searches.load(Ordering::SeqCst), 1);

    for _ in 0..5 {
        let again = searching.find_best(&p).unwrap();
        assert_eq!(again.solution().kernel_file(), Some("SearchableTestSolver"));
        assert_eq!(again.found.source, ConfigSource::Stored);
    }

    let reading = SearchEngine::new(registry(&searches), PerfDb::new(&db_path), &device, PlannerConfig::default())
        .with_options(search_off());
    let stored = reading.find_best(&p).unwrap();
    assert_eq!(stored.solution().kernel_file(), Some("SearchableTestSolver"));
    assert_eq!(searches.load(Ordering::SeqCst), 1);
    assert_eq!(reading.db().records().len(), 1);
}

#[test]
fn skipped_solvers_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let searches = Arc::new(AtomicUsize::new(0));
    let device = SimulatedDevice::new(DeviceProfile::default());
    let engine = SearchEngine::new(
        registry(&searches),
        PerfDb::new(dir.path().join("perf_db.jsonl")),
        &device,
        PlannerConfig::default(),
    )
    .with_options(search_off());

    let selection = engine.find_best(&problem(2, 2)).unwrap();
    let skipped: Vec<_> = selection.skipped.iter().map(|s| s.solver_id).collect();
    assert_eq!(skipped, ["TrivialSlowTestSolver", "TrivialTestSolver"]);
}

#[test]
fn empty_catalog_has_no_solution() {
    let dir = tempfile::tempdir().unwrap();
    let device = SimulatedDevice::new(DeviceProfile::default());
    let engine = SearchEngine::new(
        SolverRegistry::new(),
        PerfDb::new(dir.path().join("perf_db.jsonl")),
        &device,
        PlannerConfig::default(),
    );
    assert!(matches!(engine.find_best(&problem(1, 1)), Err(ConvError::NoApplicableSolver(_))));
}

#[test]
fn standard_catalog_tunes_pointwise_once() {
    let dir = tempfile::tempdir().unwrap();
    let device = SimulatedDevice::new(DeviceProfile::rocm("gfx906", 16));
    let config = PlannerConfig::default().with_perf_db_path(dir.path().join("perf_db.jsonl"));
    let engine = SearchEngine::with_config(&device, config);

    let params = ConvolutionParams::new(0, 0, 1, 1, 1, 1).unwrap();
    let p = ProblemDescription::forward(
        TensorShape::new(DataType::Float, 2, 16, 14, 14),
        TensorShape::new(DataType::Float, 32, 16, 1, 1),
        params,
    )
    .unwrap();

    let first = engine.find_solution_by_id("ConvOclDirectFwd1x1", &p).unwrap();
    assert_eq!(first.source, ConfigSource::Searched);
    let launches = device.launches();
    assert!(launches > 0);

    let second = engine.find_solution_by_id("ConvOclDirectFwd1x1", &p).unwrap();
    assert_eq!(second.source, ConfigSource::Stored);
    assert_eq!(second.solution, first.solution);
    assert_eq!(device.launches(), launches);
}
