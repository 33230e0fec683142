//! Execution-plan construction.
//!
//! The builder consumes an ordered list of system and bundle ids and
//! produces the immutable plan the executor replays every tick: bundles
//! are expanded (carrying their ordering onto each member), systems are
//! bucketed by phase, explicit before/after edges form a DAG whose
//! longest-path layering yields stage candidates, and candidates are
//! split wherever two systems' access sets conflict, preserving
//! declaration order. Dispatchers get their sub-pipelines built
//! recursively and always stand alone in their stage.

use std::sync::Arc;

use bit_set::BitSet;
use fxhash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::entity::{EventKindId, SystemBundleId, SystemId};
use crate::error::PlanError;
use crate::registry::Registry;
use crate::system::{SystemAccess, SystemDescriptor, SystemKind};

use super::{ExecUnit, PhasePlan, Pipeline, PipelineConfig, Plan, Stage};

#[derive(Copy, Clone)]
enum Entry {
    System(SystemId),
    Bundle(SystemBundleId),
}

/// Composes a [`Pipeline`] out of registered systems and bundles.
pub struct PipelineBuilder {
    registry: Arc<Registry>,
    entries: Vec<Entry>,
    sub_pipelines: FxHashMap<String, Vec<Entry>>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new(registry: Arc<Registry>) -> Self {
        PipelineBuilder {
            registry,
            entries: Vec::new(),
            sub_pipelines: FxHashMap::default(),
            config: PipelineConfig::default(),
        }
    }

    /// Appends a system. The call order is the declaration order used
    /// for conflict splitting and deferred-command application.
    pub fn add_system(mut self, system: SystemId) -> Self {
        self.entries.push(Entry::System(system));
        self
    }

    pub fn add_systems(mut self, systems: &[SystemId]) -> Self {
        self.entries
            .extend(systems.iter().map(|&id| Entry::System(id)));
        self
    }

    pub fn add_bundle(mut self, bundle: SystemBundleId) -> Self {
        self.entries.push(Entry::Bundle(bundle));
        self
    }

    /// Provides the member systems of a named dispatcher sub-pipeline.
    pub fn sub_pipeline(mut self, name: &str, systems: &[SystemId]) -> Self {
        self.sub_pipelines
            .entry(name.to_string())
            .or_default()
            .extend(systems.iter().map(|&id| Entry::System(id)));
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Pipeline, PlanError> {
        let mut ctx = BuildCtx {
            registry: self.registry.as_ref(),
            sub_pipelines: &self.sub_pipelines,
            unit_count: 0,
            dispatcher_stack: Vec::new(),
            declared_components: BitSet::new(),
            declared_databags: BitSet::new(),
            declared_events: BitSet::new(),
            emitters: Vec::new(),
            receivers: Vec::new(),
        };
        let plan = build_plan(&mut ctx, &self.entries, Vec::new())?;
        let BuildCtx {
            unit_count,
            declared_components,
            declared_databags,
            declared_events,
            emitters,
            receivers,
            ..
        } = ctx;

        // event kind -> names someone emits under, for fail-fast receivers
        let mut emitter_cache: FxHashMap<u32, FxHashSet<String>> = FxHashMap::default();
        for (event, name) in &emitters {
            emitter_cache
                .entry(event.index())
                .or_default()
                .insert(name.clone());
        }
        for (event, name, system) in &receivers {
            let known = emitter_cache
                .get(&event.index())
                .map_or(false, |names| names.contains(name));
            if !known {
                warn!(
                    system = system.as_str(),
                    emitter = name.as_str(),
                    "receiver has no emitter; it will see no events"
                );
            }
        }

        let pool = match self.config.worker_threads {
            Some(threads) => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|err| PlanError::WorkerPool(err.to_string()))?,
            )),
            None => None,
        };

        debug!(
            units = unit_count,
            components = declared_components.len(),
            "pipeline built"
        );
        Ok(Pipeline {
            registry: self.registry,
            plan,
            pool,
            unit_count,
            declared_components,
            declared_databags,
            declared_events,
            emitter_cache,
            states: Vec::new(),
        })
    }
}

struct BuildCtx<'r> {
    registry: &'r Registry,
    sub_pipelines: &'r FxHashMap<String, Vec<Entry>>,
    unit_count: usize,
    dispatcher_stack: Vec<String>,
    declared_components: BitSet,
    declared_databags: BitSet,
    declared_events: BitSet,
    emitters: Vec<(EventKindId, String)>,
    receivers: Vec<(EventKindId, String, String)>,
}

impl<'r> BuildCtx<'r> {
    fn next_unit(&mut self) -> usize {
        let index = self.unit_count;
        self.unit_count += 1;
        index
    }

    fn record_access(&mut self, descriptor: &SystemDescriptor, access: &SystemAccess) {
        self.declared_components.union_with(access.components.reads());
        self.declared_components.union_with(access.components.writes());
        self.declared_components.union_with(&access.storages);
        self.declared_databags.union_with(access.databags.reads());
        self.declared_databags.union_with(access.databags.writes());
        for (event, name) in &access.emitters {
            self.declared_events.insert(event.index() as usize);
            self.emitters.push((*event, name.clone()));
        }
        for (event, name) in &access.receivers {
            self.declared_events.insert(event.index() as usize);
            self.receivers
                .push((*event, name.clone(), descriptor.name().to_string()));
        }
    }
}

struct Expanded {
    id: SystemId,
    descriptor: Arc<SystemDescriptor>,
    effective: SystemAccess,
    extra_before: Vec<String>,
    extra_after: Vec<String>,
    /// Already routed into its dispatcher; do not route again.
    direct: bool,
}

fn build_plan(
    ctx: &mut BuildCtx,
    entries: &[Entry],
    direct_members: Vec<Expanded>,
) -> Result<Plan, PlanError> {
    // 1. bundle expansion, carrying bundle ordering onto each member
    let mut expanded = Vec::new();
    for entry in entries {
        match entry {
            Entry::System(id) => expanded.push(expand_system(ctx, *id, &[], &[])?),
            Entry::Bundle(id) => {
                let bundle = ctx
                    .registry
                    .bundle(*id)
                    .ok_or(PlanError::UnknownBundle(*id))?;
                for &member in bundle.systems() {
                    expanded.push(expand_system(ctx, member, bundle.before(), bundle.after())?);
                }
            }
        }
    }
    expanded.extend(direct_members);

    // 2. route systems targeted into a dispatcher's sub-pipeline
    let mut routed: FxHashMap<String, Vec<Expanded>> = FxHashMap::default();
    let mut scheduled = Vec::new();
    for item in expanded {
        match item.descriptor.parent_dispatcher.clone() {
            Some(parent) if !item.direct => routed.entry(parent).or_default().push(item),
            _ => scheduled.push(item),
        }
    }
    for name in routed.keys() {
        let exists = scheduled.iter().any(|item| {
            matches!(item.descriptor.kind(), SystemKind::Dispatcher { pipeline, .. } if pipeline == name)
        });
        if !exists {
            let system = routed[name][0].descriptor.name().to_string();
            return Err(PlanError::UnknownParentDispatcher {
                system,
                name: name.clone(),
            });
        }
    }

    // 3. partition by kind, then by phase
    let mut startup = Vec::new();
    let mut phase_temporaries: Vec<Vec<ExecUnit>> = (0..6).map(|_| Vec::new()).collect();
    let mut phase_nodes: Vec<Vec<Expanded>> = (0..6).map(|_| Vec::new()).collect();
    for item in scheduled {
        ctx.record_access(&item.descriptor, &item.effective);
        match item.descriptor.kind() {
            SystemKind::Startup => startup.push(make_unit(ctx, item, None, 1)),
            SystemKind::Temporary => {
                let phase = item.descriptor.phase().index();
                phase_temporaries[phase].push(make_unit(ctx, item, None, 1));
            }
            SystemKind::Normal => {
                phase_nodes[item.descriptor.phase().index()].push(item);
            }
            SystemKind::Dispatcher { .. } => {
                phase_nodes[item.descriptor.phase().index()].push(item);
            }
        }
    }

    // 4.-6. per phase: dependency DAG, longest-path layering, conflict
    // splitting, dispatcher wiring
    let mut phases = Vec::with_capacity(6);
    for (phase_index, nodes) in phase_nodes.into_iter().enumerate() {
        let stages = schedule_phase(ctx, nodes, &mut routed)?;
        phases.push(PhasePlan {
            temporaries: std::mem::take(&mut phase_temporaries[phase_index]),
            stages,
        });
    }

    Ok(Plan {
        startup,
        phases,
    })
}

fn expand_system(
    ctx: &BuildCtx,
    id: SystemId,
    extra_before: &[String],
    extra_after: &[String],
) -> Result<Expanded, PlanError> {
    let descriptor = ctx.registry.system(id).ok_or(PlanError::UnknownSystem(id))?;
    let mut effective = descriptor.access().clone();
    effective.expand_spawners(ctx.registry);
    Ok(Expanded {
        id,
        descriptor,
        effective,
        extra_before: extra_before.to_vec(),
        extra_after: extra_after.to_vec(),
        direct: false,
    })
}

fn make_unit(
    ctx: &mut BuildCtx,
    item: Expanded,
    sub_plan: Option<Box<Plan>>,
    repeat: u32,
) -> ExecUnit {
    ExecUnit {
        id: item.id,
        descriptor: item.descriptor,
        flat_index: ctx.next_unit(),
        sub_plan,
        repeat,
    }
}

fn schedule_phase(
    ctx: &mut BuildCtx,
    nodes: Vec<Expanded>,
    routed: &mut FxHashMap<String, Vec<Expanded>>,
) -> Result<Vec<Stage>, PlanError> {
    if nodes.is_empty() {
        return Ok(Vec::new());
    }

    let position: FxHashMap<SystemId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| (node.id, index))
        .collect();

    // explicit before/after edges; A before B == B after A
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut indegree: Vec<usize> = vec![0; nodes.len()];
    fn add_edge(from: usize, to: usize, successors: &mut Vec<Vec<usize>>, indegree: &mut Vec<usize>) {
        if !successors[from].contains(&to) {
            successors[from].push(to);
            indegree[to] += 1;
        }
    }
    for (index, node) in nodes.iter().enumerate() {
        let befores = node.descriptor.before.iter().chain(node.extra_before.iter());
        for name in befores {
            let target = resolve_dependency(ctx, node, name)?;
            // edges to systems outside this phase are governed by the
            // phase order itself
            if let Some(&other) = position.get(&target) {
                add_edge(index, other, &mut successors, &mut indegree);
            }
        }
        let afters = node.descriptor.after.iter().chain(node.extra_after.iter());
        for name in afters {
            let target = resolve_dependency(ctx, node, name)?;
            if let Some(&other) = position.get(&target) {
                add_edge(other, index, &mut successors, &mut indegree);
            }
        }
    }

    // longest-path layering (Kahn order)
    let mut layer = vec![0usize; nodes.len()];
    let mut ready: Vec<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut remaining = indegree.clone();
    let mut processed = 0;
    while let Some(index) = ready.pop() {
        processed += 1;
        for &next in &successors[index] {
            layer[next] = layer[next].max(layer[index] + 1);
            remaining[next] -= 1;
            if remaining[next] == 0 {
                ready.push(next);
            }
        }
    }
    if processed != nodes.len() {
        let participants = remaining
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .map(|(i, _)| nodes[i].descriptor.name().to_string())
            .collect();
        return Err(PlanError::Cycle { participants });
    }

    // conflict splitting inside each layer, in declaration order
    let layer_count = layer.iter().max().map_or(0, |&m| m + 1);
    let mut stages = Vec::new();
    for current in 0..layer_count {
        let members: Vec<usize> = (0..nodes.len()).filter(|&i| layer[i] == current).collect();
        let mut substage_of: FxHashMap<usize, usize> = FxHashMap::default();
        let mut substages: Vec<Vec<usize>> = Vec::new();
        for &index in &members {
            let mut substage = 0;
            for &earlier in &members {
                if earlier == index {
                    break;
                }
                if nodes[index].effective.conflicts_with(&nodes[earlier].effective) {
                    substage = substage.max(substage_of[&earlier] + 1);
                }
            }
            substage_of.insert(index, substage);
            if substage == substages.len() {
                substages.push(Vec::new());
            }
            substages[substage].push(index);
        }
        for substage in substages {
            stages.push(substage);
        }
    }

    // materialize stages, building dispatcher sub-plans on the way
    let mut node_slots: Vec<Option<Expanded>> = nodes.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(stages.len());
    for stage in stages {
        let mut units = Vec::with_capacity(stage.len());
        for index in stage {
            let item = node_slots[index].take().expect("node scheduled twice");
            let unit = match item.descriptor.kind().clone() {
                SystemKind::Dispatcher { pipeline, repeat } => {
                    let sub_plan = build_dispatcher(ctx, &item, &pipeline, routed)?;
                    make_unit(ctx, item, Some(Box::new(sub_plan)), repeat)
                }
                _ => make_unit(ctx, item, None, 1),
            };
            units.push(unit);
        }
        out.push(Stage { units });
    }
    Ok(out)
}

fn resolve_dependency(
    ctx: &BuildCtx,
    node: &Expanded,
    name: &str,
) -> Result<SystemId, PlanError> {
    ctx.registry
        .system_id(name)
        .ok_or_else(|| PlanError::UnknownDependency {
            system: node.descriptor.name().to_string(),
            name: name.to_string(),
        })
}

fn build_dispatcher(
    ctx: &mut BuildCtx,
    item: &Expanded,
    pipeline: &str,
    routed: &mut FxHashMap<String, Vec<Expanded>>,
) -> Result<Plan, PlanError> {
    if ctx.dispatcher_stack.iter().any(|name| name == pipeline) {
        let mut participants = ctx.dispatcher_stack.clone();
        participants.push(pipeline.to_string());
        return Err(PlanError::Cycle { participants });
    }

    let declared = ctx.sub_pipelines.get(pipeline);
    let mut targeted = routed.remove(pipeline).unwrap_or_default();
    if declared.is_none() && targeted.is_empty() {
        return Err(PlanError::UnresolvedDispatcher {
            system: item.descriptor.name().to_string(),
            name: pipeline.to_string(),
        });
    }

    let entries: Vec<Entry> = declared.cloned().unwrap_or_default();
    for member in &mut targeted {
        member.direct = true;
    }

    ctx.dispatcher_stack.push(pipeline.to_string());
    let plan = build_plan(ctx, &entries, targeted);
    ctx.dispatcher_stack.pop();
    plan
}
