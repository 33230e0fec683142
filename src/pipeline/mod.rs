//! Pipelines: immutable execution plans and the per-tick executor.
//!
//! A pipeline is built once from registered systems and reused every
//! tick. Execution walks the phases in their fixed order; inside a phase
//! the plan's stages run strictly one after another while the systems
//! within a stage may run concurrently on the worker pool (the builder
//! guarantees they cannot conflict). Deferred command buffers are
//! applied in submission order at the end of each stage.

mod builder;

pub use builder::PipelineBuilder;

use std::sync::Arc;

use bit_set::BitSet;
use fxhash::{FxHashMap, FxHashSet};
use itertools::izip;
use rayon::prelude::*;
use tracing::{trace, trace_span};

use crate::command::CommandBuffer;
use crate::entity::{SystemId, WorldId};
use crate::error::{DispatchError, PlanError, SystemError};
use crate::registry::Registry;
use crate::system::{Phase, SystemContext, SystemDescriptor, SystemInvoke};
use crate::world::{World, WorldNotification};

/// Executor tuning knobs.
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    /// Size of the pipeline's own worker pool. `None` shares the global
    /// pool.
    pub worker_threads: Option<usize>,
}

pub(crate) struct Plan {
    pub(crate) startup: Vec<ExecUnit>,
    pub(crate) phases: Vec<PhasePlan>,
}

pub(crate) struct PhasePlan {
    pub(crate) temporaries: Vec<ExecUnit>,
    pub(crate) stages: Vec<Stage>,
}

pub(crate) struct Stage {
    pub(crate) units: Vec<ExecUnit>,
}

pub(crate) struct ExecUnit {
    pub(crate) id: SystemId,
    pub(crate) descriptor: Arc<SystemDescriptor>,
    /// Index into the per-world retirement flags.
    pub(crate) flat_index: usize,
    pub(crate) sub_plan: Option<Box<Plan>>,
    pub(crate) repeat: u32,
}

/// Per pipeline+world preparation token: which startup/temporary units
/// have retired, and whether the ready notification went out.
struct WorldState {
    world: WorldId,
    started: bool,
    retired: Vec<bool>,
}

/// An immutable execution plan over registered systems, dispatched
/// against a world once per tick.
pub struct Pipeline {
    pub(crate) registry: Arc<Registry>,
    pub(crate) plan: Plan,
    pub(crate) pool: Option<Arc<rayon::ThreadPool>>,
    pub(crate) unit_count: usize,
    pub(crate) declared_components: BitSet,
    pub(crate) declared_databags: BitSet,
    pub(crate) declared_events: BitSet,
    /// Event kind -> emitter names present anywhere in the plan.
    pub(crate) emitter_cache: FxHashMap<u32, FxHashSet<String>>,
    states: Vec<WorldState>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("unit_count", &self.unit_count)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn builder(registry: Arc<Registry>) -> PipelineBuilder {
        PipelineBuilder::new(registry)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The emitter names the plan contains for an event kind; receivers
    /// of other names will see empty iterations.
    pub fn emitter_names(&self, event: crate::entity::EventKindId) -> Vec<String> {
        self.emitter_cache
            .get(&event.index())
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every system the plan contains, including startup, temporary and
    /// sub-pipeline members.
    pub fn system_ids(&self) -> Vec<SystemId> {
        fn collect(plan: &Plan, out: &mut Vec<SystemId>) {
            for unit in &plan.startup {
                out.push(unit.id);
            }
            for phase in &plan.phases {
                for unit in &phase.temporaries {
                    out.push(unit.id);
                }
                for stage in &phase.stages {
                    for unit in &stage.units {
                        out.push(unit.id);
                        if let Some(sub_plan) = &unit.sub_plan {
                            collect(sub_plan, out);
                        }
                    }
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.plan, &mut out);
        out
    }

    /// System names per stage of one phase, in execution order. Stages
    /// listed together may run concurrently.
    pub fn stage_layout(&self, phase: Phase) -> Vec<Vec<String>> {
        self.plan.phases[phase.index()]
            .stages
            .iter()
            .map(|stage| {
                stage
                    .units
                    .iter()
                    .map(|unit| unit.descriptor.name().to_string())
                    .collect()
            })
            .collect()
    }

    /// Executes one tick against the world.
    ///
    /// The first pairing with a world prepares it: storages, databags and
    /// event stores for everything the plan declares are created up
    /// front, and the world's ready notification goes out.
    pub fn dispatch(&mut self, world: &mut World) -> Result<(), DispatchError> {
        let state_index = self.state_for(world)?;
        let span = trace_span!("dispatch", world = %world.id(), tick = world.tick());
        let _guard = span.enter();

        let Pipeline {
            plan, pool, states, ..
        } = self;
        let state = &mut states[state_index];
        if !state.started {
            state.started = true;
            world.notify(WorldNotification::Ready(world.id()));
        }

        let result = run_plan(plan, world, state, pool.as_deref());
        world.advance_tick();
        result
    }

    fn state_for(&mut self, world: &mut World) -> Result<usize, DispatchError> {
        if let Some(index) = self
            .states
            .iter()
            .position(|state| state.world == world.id())
        {
            return Ok(index);
        }

        trace!(world = %world.id(), "preparing world for pipeline");
        for component in self.declared_components.iter() {
            world
                .ensure_storage(crate::entity::ComponentKindId::new(component as u32))
                .map_err(|_| {
                    DispatchError::Prepare(PlanError::PrepareFailed {
                        kind: "component storage",
                        id: component as u32,
                    })
                })?;
        }
        for databag in self.declared_databags.iter() {
            world
                .ensure_databag(crate::entity::DatabagKindId::new(databag as u32))
                .map_err(|_| {
                    DispatchError::Prepare(PlanError::PrepareFailed {
                        kind: "databag",
                        id: databag as u32,
                    })
                })?;
        }
        for event in self.declared_events.iter() {
            world
                .ensure_event(crate::entity::EventKindId::new(event as u32))
                .map_err(|_| {
                    DispatchError::Prepare(PlanError::PrepareFailed {
                        kind: "event storage",
                        id: event as u32,
                    })
                })?;
        }

        self.states.push(WorldState {
            world: world.id(),
            started: false,
            retired: vec![false; self.unit_count],
        });
        Ok(self.states.len() - 1)
    }
}

fn run_plan(
    plan: &Plan,
    world: &mut World,
    state: &mut WorldState,
    pool: Option<&rayon::ThreadPool>,
) -> Result<(), DispatchError> {
    for unit in &plan.startup {
        run_retiring(unit, world, state)?;
    }

    for phase_plan in &plan.phases {
        for unit in &phase_plan.temporaries {
            run_retiring(unit, world, state)?;
        }
        for stage in &phase_plan.stages {
            // dispatchers stand alone in their stage and need the world
            // mutably to flush their sub-plan's stages
            if let [unit] = stage.units.as_slice() {
                if let Some(sub_plan) = &unit.sub_plan {
                    for _ in 0..unit.repeat {
                        run_plan(sub_plan, world, state, pool)?;
                    }
                    continue;
                }
            }

            let results = run_stage(stage, world, pool);

            // apply buffers in declaration order before surfacing any
            // failure; partial results stay in place
            let mut failure: Option<(String, SystemError)> = None;
            for (unit, (result, mut commands)) in izip!(&stage.units, results) {
                commands.apply(world);
                if failure.is_none() {
                    if let Err(err) = result {
                        failure = Some((unit.descriptor.name().to_string(), err));
                    }
                }
            }
            if let Some((system, source)) = failure {
                return Err(DispatchError::SystemFailed { system, source });
            }
        }
    }
    Ok(())
}

fn run_stage(
    stage: &Stage,
    world: &World,
    pool: Option<&rayon::ThreadPool>,
) -> Vec<(Result<(), SystemError>, CommandBuffer)> {
    let run = |unit: &ExecUnit| {
        let span = trace_span!("system", name = unit.descriptor.name());
        let _guard = span.enter();
        let ctx = SystemContext::new(world, &unit.descriptor);
        let result = match &unit.descriptor.invoke {
            SystemInvoke::Normal(body) => (body.as_ref())(&ctx),
            // retiring and dispatcher units never reach a stage
            SystemInvoke::Retiring(_) | SystemInvoke::Dispatcher => Ok(()),
        };
        (result, ctx.take_commands())
    };

    if stage.units.len() == 1 {
        return vec![run(&stage.units[0])];
    }
    match pool {
        Some(pool) => pool.install(|| stage.units.par_iter().map(run).collect()),
        None => stage.units.par_iter().map(run).collect(),
    }
}

fn run_retiring(
    unit: &ExecUnit,
    world: &mut World,
    state: &mut WorldState,
) -> Result<(), DispatchError> {
    if state.retired[unit.flat_index] {
        return Ok(());
    }
    let (result, mut commands) = {
        let ctx = SystemContext::new(world, &unit.descriptor);
        let result = match &unit.descriptor.invoke {
            SystemInvoke::Retiring(body) => {
                let mut body = body.lock();
                (*body)(&ctx)
            }
            _ => Ok(false),
        };
        (result, ctx.take_commands())
    };
    commands.apply(world);
    match result {
        Ok(done) => {
            if done {
                trace!(system = unit.descriptor.name(), "system retired");
                state.retired[unit.flat_index] = true;
            }
            Ok(())
        }
        Err(source) => Err(DispatchError::SystemFailed {
            system: unit.descriptor.name().to_string(),
            source,
        }),
    }
}
