//! # Solver search engine
//!
//! Resolves a performance config for one solver (default, stored, or
//! freshly searched), realizes it into a [`ConvSolution`], and picks the
//! best solution across the whole catalog.
//!
//! A searchable solver is searched at most once per problem signature: the
//! result is written through to the [`PerfDb`] before the plan is realized,
//! and every later request is served from the store.

use std::mem;

use crate::core::config::PlannerConfig;
use crate::core::device::DeviceHandle;
use crate::error::{ConvError, Result};
use crate::perf_db::PerfDb;
use crate::problem::ProblemDescription;
use crate::solver::{ConvContext, ConvSolution, PerformanceConfig, Solver, SolverRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindOptions {
    /// Search a searchable solver on a store miss. When off, a miss falls
    /// back to the default config and no device work is done.
    pub search_on_miss: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self { search_on_miss: true }
    }
}

/// Store and device used to resolve configs.
#[derive(Clone, Copy)]
pub struct SearchContext<'a> {
    pub db: Option<&'a PerfDb>,
    pub handle: Option<&'a dyn DeviceHandle>,
    pub options: FindOptions,
}

impl<'a> SearchContext<'a> {
    pub fn new(db: &'a PerfDb, handle: &'a dyn DeviceHandle, options: FindOptions) -> Self {
        Self {
            db: Some(db),
            handle: Some(handle),
            options,
        }
    }

    /// Reads the store if given, never searches.
    pub fn without_search(db: Option<&'a PerfDb>) -> Self {
        Self {
            db,
            handle: None,
            options: FindOptions { search_on_miss: false },
        }
    }

    fn search_handle(&self) -> Option<&'a dyn DeviceHandle> {
        if self.options.search_on_miss {
            self.handle
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    Stored,
    Searched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Found {
    pub solution: ConvSolution,
    pub source: ConfigSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestState<C> {
    Idle,
    ConfigResolved { config: C, source: ConfigSource },
    PlanRealized(Found),
}

/// One (problem, solver) request, driven Idle -> ConfigResolved -> PlanRealized.
pub struct SolverRequest<'a, S: Solver> {
    solver: &'a S,
    ctx: ConvContext<'a>,
    state: RequestState<S::Config>,
}

impl<'a, S: Solver> SolverRequest<'a, S> {
    pub fn new(solver: &'a S, ctx: ConvContext<'a>) -> Self {
        Self {
            solver,
            ctx,
            state: RequestState::Idle,
        }
    }

    pub fn state(&self) -> &RequestState<S::Config> {
        &self.state
    }

    /// Obtains the config. A no-op once past `Idle`.
    pub fn resolve(&mut self, search: &SearchContext<'_>) -> Result<()> {
        if !matches!(self.state, RequestState::Idle) {
            return Ok(());
        }
        let (config, source) = self.obtain_config(search)?;
        self.state = RequestState::ConfigResolved { config, source };
        Ok(())
    }

    fn obtain_config(&self, search: &SearchContext<'_>) -> Result<(S::Config, ConfigSource)> {
        let solver = self.solver;
        let ctx = &self.ctx;
        if !solver.is_searchable() {
            return Ok((solver.default_config(ctx), ConfigSource::Default));
        }

        let signature = ctx.problem.signature();
        if let Some(db) = search.db {
            if let Some(stored) = db.load::<S::Config>(&signature, solver.id()) {
                if stored.is_valid(ctx) {
                    return Ok((stored, ConfigSource::Stored));
                }
                log::warn!("stored config {:?} for {} no longer valid, ignoring", stored, solver.id());
            }
        }

        let handle = match search.search_handle() {
            Some(h) => h,
            None => return Ok((solver.default_config(ctx), ConfigSource::Default)),
        };

        log::info!("searching {} for {}", solver.id(), signature);
        let config = solver.search(ctx, handle).map_err(|e| {
            if e.is_fatal() {
                e
            } else {
                ConvError::SearchFailed {
                    solver: solver.id().to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        log::info!("{} search finished: {:?}", solver.id(), config);

        if let Some(db) = search.db {
            if let Err(e) = db.store(&signature, solver.id(), &config) {
                log::warn!("failed to save {} config to {:?}: {}", solver.id(), db.path(), e);
            }
        }
        Ok((config, ConfigSource::Searched))
    }

    /// Realizes the resolved config. Terminal: later calls return the same plan.
    pub fn realize(&mut self) -> Result<Found> {
        match mem::replace(&mut self.state, RequestState::Idle) {
            RequestState::ConfigResolved { config, source } => {
                let solution = self.solver.get_solution(&self.ctx, &config)?;
                let found = Found { solution, source };
                self.state = RequestState::PlanRealized(found.clone());
                Ok(found)
            }
            RequestState::PlanRealized(found) => {
                self.state = RequestState::PlanRealized(found.clone());
                Ok(found)
            }
            RequestState::Idle => Err(ConvError::InvalidValue(format!(
                "{} has no resolved config to realize",
                self.solver.id()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotApplicable,
    SearchFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSolver {
    pub solver_id: &'static str,
    pub reason: SkipReason,
}

/// Outcome of a best-solution request: the plan plus every solver passed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub found: Found,
    pub skipped: Vec<SkippedSolver>,
}

impl Selection {
    pub fn solution(&self) -> &ConvSolution {
        &self.found.solution
    }
}

pub struct SearchEngine<'h> {
    registry: SolverRegistry,
    db: PerfDb,
    handle: &'h dyn DeviceHandle,
    config: PlannerConfig,
    options: FindOptions,
}

impl<'h> SearchEngine<'h> {
    pub fn new(registry: SolverRegistry, db: PerfDb, handle: &'h dyn DeviceHandle, config: PlannerConfig) -> Self {
        Self {
            registry,
            db,
            handle,
            config,
            options: FindOptions::default(),
        }
    }

    /// Engine over the standard catalog with the store named by `config`.
    ///
    /// `config.sync_timeout` is a property of the handle and is not applied
    /// here; build a simulated handle with [`SimulatedDevice::from_config`] to
    /// honor it.
    ///
    /// [`SimulatedDevice::from_config`]: crate::core::device::SimulatedDevice::from_config
    pub fn with_config(handle: &'h dyn DeviceHandle, config: PlannerConfig) -> Self {
        let db = PerfDb::new(config.perf_db_path.clone());
        Self::new(SolverRegistry::standard(), db, handle, config)
    }

    pub fn with_options(mut self, options: FindOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &SolverRegistry {
        &self.registry
    }

    pub fn db(&self) -> &PerfDb {
        &self.db
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn context<'a>(&'a self, problem: &'a ProblemDescription) -> ConvContext<'a> {
        ConvContext::new(problem, self.handle.profile(), &self.config)
    }

    fn search_context(&self) -> SearchContext<'_> {
        SearchContext::new(&self.db, self.handle, self.options)
    }

    /// Plan from one specific solver, keeping its typed config.
    pub fn find_solution<S: Solver>(&self, solver: &S, problem: &ProblemDescription) -> Result<Found> {
        let ctx = self.context(problem);
        if !solver.is_applicable(&ctx) {
            return Err(ConvError::NoApplicableSolver(format!("{} rejects {}", solver.id(), problem.signature())));
        }
        let mut request = SolverRequest::new(solver, ctx);
        request.resolve(&self.search_context())?;
        request.realize()
    }

    /// Plan from the registered solver named `id`.
    pub fn find_solution_by_id(&self, id: &str, problem: &ProblemDescription) -> Result<Found> {
        let solver = self
            .registry
            .get(id)
            .ok_or_else(|| ConvError::InvalidValue(format!("unknown solver {}", id)))?;
        let ctx = self.context(problem);
        if !solver.is_applicable(&ctx) {
            return Err(ConvError::NoApplicableSolver(format!("{} rejects {}", id, problem.signature())));
        }
        solver.find(&ctx, &self.search_context())
    }

    /// Plans from every applicable solver in registration order. Solvers
    /// whose search fails are left out.
    pub fn find_all_solutions(&self, problem: &ProblemDescription) -> Result<Vec<Found>> {
        let ctx = self.context(problem);
        let search = self.search_context();
        let mut out = Vec::new();
        for solver in self.registry.applicable(&ctx) {
            match solver.find(&ctx, &search) {
                Ok(found) => out.push(found),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => log::warn!("dropping {}: {}", solver.id(), e),
            }
        }
        Ok(out)
    }

    /// The preferred plan: fast applicable solvers first, then the rest, each
    /// group in registration order. The first solver that yields a plan wins.
    pub fn find_best(&self, problem: &ProblemDescription) -> Result<Selection> {
        let ctx = self.context(problem);
        let search = self.search_context();
        let mut skipped = Vec::new();
        let mut fast = Vec::new();
        let mut slow = Vec::new();

        for solver in self.registry.iter() {
            if !solver.is_applicable(&ctx) {
                skipped.push(SkippedSolver {
                    solver_id: solver.id(),
                    reason: SkipReason::NotApplicable,
                });
            } else if solver.is_fast(&ctx) {
                fast.push(solver);
            } else {
                slow.push(solver);
            }
        }

        for solver in fast.into_iter().chain(slow) {
            match solver.find(&ctx, &search) {
                Ok(found) => {
                    log::debug!("selected {} for {}", solver.id(), problem.signature());
                    return Ok(Selection { found, skipped });
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("dropping {}: {}", solver.id(), e);
                    skipped.push(SkippedSolver {
                        solver_id: solver.id(),
                        reason: SkipReason::SearchFailed(e.to_string()),
                    });
                }
            }
        }

        Err(ConvError::NoApplicableSolver(problem.signature().to_string()))
    }
}
