use std::sync::Arc;

use keel::prelude::*;
use keel::{DispatchError, EntityId, Registry, RegistryBuilder, WorldNotification};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

#[derive(Default, Debug, PartialEq)]
struct Position {
    x: i32,
}

impl Component for Position {}

#[derive(Default, Debug, PartialEq)]
struct A {
    i: i32,
}

impl Component for A {}

#[derive(Default, Debug, PartialEq)]
struct B {
    i: i32,
}

impl Component for B {}

#[derive(Default)]
struct Trace {
    calls: Vec<&'static str>,
}

#[derive(Default)]
struct Seen {
    entities: Vec<EntityId>,
    passes: u32,
}

#[derive(Default)]
struct Counter {
    count: u32,
}

#[test]
fn minimal_tick_increments_every_dispatch() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    registry
        .register_component::<Position>("Position", StorageDiscipline::Dense)
        .unwrap();
    let inc = registry
        .register_system(
            SystemBuilder::new("Inc")
                .phase(Phase::Process)
                .with_query::<(Write<Position>,)>()
                .build(|ctx| {
                    let mut query = ctx.query::<(Write<Position>,)>().unwrap();
                    query.for_each(|_, (position,)| position.x += 1);
                }),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    let entity: EntityId = world.create_entity().with(Position { x: 0 }).into();

    let mut pipeline = Pipeline::builder(registry).add_system(inc).build().unwrap();
    for _ in 0..3 {
        pipeline.dispatch(&mut world).unwrap();
    }

    assert_eq!(world.get_component::<Position>(entity).unwrap().x, 3);
    assert_eq!(world.tick(), 3);
}

#[test]
fn change_list_is_observed_once_then_drained() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    registry
        .register_component::<Position>("Position", StorageDiscipline::Dense)
        .unwrap();
    registry.register_databag::<Seen>("Seen").unwrap();

    // retires after its first run, so the second tick mutates nothing
    let inc = registry
        .register_system(
            SystemBuilder::new("Inc")
                .phase(Phase::Process)
                .with_query::<(Write<Position>,)>()
                .build_temporary(|ctx| {
                    let mut query = ctx.query::<(Write<Position>,)>().unwrap();
                    query.for_each(|_, (position,)| position.x += 1);
                    true
                }),
        )
        .unwrap();
    let observe = registry
        .register_system(
            SystemBuilder::new("Observe")
                .phase(Phase::Process)
                .with_query::<(Changed<Position>,)>()
                .write_databag::<Seen>()
                .build(|ctx| {
                    let mut seen = Vec::new();
                    let mut query = ctx.query::<(Changed<Position>,)>().unwrap();
                    query.for_each(|entity, (_,)| seen.push(entity));
                    let mut bag = ctx.databag_mut::<Seen>();
                    bag.entities = seen;
                    bag.passes += 1;
                }),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    let entity: EntityId = world.create_entity().with(Position { x: 0 }).into();

    let mut pipeline = Pipeline::builder(registry)
        .add_system(inc)
        .add_system(observe)
        .build()
        .unwrap();

    pipeline.dispatch(&mut world).unwrap();
    {
        let seen = world.get_databag::<Seen>().unwrap();
        assert_eq!(seen.entities, vec![entity]);
        assert_eq!(seen.passes, 1);
    }

    pipeline.dispatch(&mut world).unwrap();
    let seen = world.get_databag::<Seen>().unwrap();
    assert_eq!(seen.entities, Vec::new());
    assert_eq!(seen.passes, 2);
}

#[test]
fn disjoint_writers_share_a_stage() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    registry
        .register_component::<A>("A", StorageDiscipline::Dense)
        .unwrap();
    registry
        .register_component::<B>("B", StorageDiscipline::Dense)
        .unwrap();
    let inc_a = registry
        .register_system(
            SystemBuilder::new("IncA")
                .with_query::<(Write<A>,)>()
                .build(|ctx| {
                    let mut query = ctx.query::<(Write<A>,)>().unwrap();
                    query.for_each(|_, (a,)| a.i += 1);
                }),
        )
        .unwrap();
    let inc_b = registry
        .register_system(
            SystemBuilder::new("IncB")
                .with_query::<(Write<B>,)>()
                .build(|ctx| {
                    let mut query = ctx.query::<(Write<B>,)>().unwrap();
                    query.for_each(|_, (b,)| b.i += 1);
                }),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    for index in 0..10_000 {
        if index % 2 == 0 {
            world.create_entity().with(A { i: 0 });
        } else {
            world.create_entity().with(B { i: 0 });
        }
    }

    let mut pipeline = Pipeline::builder(registry)
        .add_system(inc_a)
        .add_system(inc_b)
        .config(PipelineConfig {
            worker_threads: Some(4),
        })
        .build()
        .unwrap();
    assert_eq!(
        pipeline.stage_layout(Phase::Process),
        vec![vec!["IncA".to_string(), "IncB".to_string()]]
    );

    pipeline.dispatch(&mut world).unwrap();

    let mut checked = 0;
    let mut query = world.query::<(Read<A>,)>().unwrap();
    query.for_each(|_, (a,)| {
        assert_eq!(a.i, 1);
        checked += 1;
    });
    let mut query = world.query::<(Read<B>,)>().unwrap();
    query.for_each(|_, (b,)| {
        assert_eq!(b.i, 1);
        checked += 1;
    });
    assert_eq!(checked, 10_000);
}

#[test]
fn crossed_accesses_split_into_ordered_stages() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    registry
        .register_component::<A>("A", StorageDiscipline::Dense)
        .unwrap();
    registry
        .register_component::<B>("B", StorageDiscipline::Dense)
        .unwrap();
    let first = registry
        .register_system(
            SystemBuilder::new("ReadA_WriteB")
                .read_component::<A>()
                .write_component::<B>()
                .build(|_| {}),
        )
        .unwrap();
    let second = registry
        .register_system(
            SystemBuilder::new("ReadB_WriteA")
                .read_component::<B>()
                .write_component::<A>()
                .build(|_| {}),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let pipeline = Pipeline::builder(registry)
        .add_system(first)
        .add_system(second)
        .build()
        .unwrap();
    assert_eq!(
        pipeline.stage_layout(Phase::Process),
        vec![
            vec!["ReadA_WriteB".to_string()],
            vec!["ReadB_WriteA".to_string()],
        ]
    );
}

#[test]
fn dispatcher_runs_its_sub_plan_to_completion() {
    init_tracing();

    fn tracer(name: &'static str) -> impl Fn(&keel::SystemContext) + Send + Sync + 'static {
        move |ctx: &keel::SystemContext| ctx.databag_mut::<Trace>().calls.push(name)
    }

    let mut registry = RegistryBuilder::new();
    registry.register_databag::<Trace>("Trace").unwrap();
    let a = registry
        .register_system(
            SystemBuilder::new("A")
                .write_databag::<Trace>()
                .build(tracer("A")),
        )
        .unwrap();
    let physics = registry
        .register_system(SystemBuilder::new("PhysicsDispatcher").dispatcher("Physics", 2))
        .unwrap();
    let b = registry
        .register_system(
            SystemBuilder::new("B")
                .write_databag::<Trace>()
                .build(tracer("B")),
        )
        .unwrap();
    let p1 = registry
        .register_system(
            SystemBuilder::new("P1")
                .write_databag::<Trace>()
                .build(tracer("P1")),
        )
        .unwrap();
    let p2 = registry
        .register_system(
            SystemBuilder::new("P2")
                .write_databag::<Trace>()
                .build(tracer("P2")),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    let mut pipeline = Pipeline::builder(registry)
        .add_system(a)
        .add_system(physics)
        .add_system(b)
        .sub_pipeline("Physics", &[p1, p2])
        .build()
        .unwrap();

    pipeline.dispatch(&mut world).unwrap();
    assert_eq!(
        world.get_databag::<Trace>().unwrap().calls,
        vec!["A", "P1", "P2", "P1", "P2", "B"]
    );
    assert_eq!(pipeline.system_ids(), vec![a, physics, p1, p2, b]);
}

#[test]
fn zero_systems_dispatch_is_a_no_op() {
    init_tracing();
    let registry: Arc<Registry> = RegistryBuilder::new().freeze().unwrap();
    let mut world = World::new(registry.clone());
    let mut pipeline = Pipeline::builder(registry).build().unwrap();
    pipeline.dispatch(&mut world).unwrap();
    assert_eq!(world.tick(), 1);
    assert_eq!(world.entity_count(), 0);
}

#[test]
fn empty_access_systems_share_one_stage() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    let ids: Vec<_> = (0..3)
        .map(|index| {
            registry
                .register_system(SystemBuilder::new(&format!("noop{}", index)).build(|_| {}))
                .unwrap()
        })
        .collect();
    let registry = registry.freeze().unwrap();

    let pipeline = Pipeline::builder(registry).add_systems(&ids).build().unwrap();
    let layout = pipeline.stage_layout(Phase::Process);
    assert_eq!(layout.len(), 1);
    assert_eq!(layout[0].len(), 3);
}

#[test]
fn explicit_ordering_is_respected_and_cycles_are_rejected() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    let late = registry
        .register_system(SystemBuilder::new("late").after("early").build(|_| {}))
        .unwrap();
    let early = registry
        .register_system(SystemBuilder::new("early").build(|_| {}))
        .unwrap();
    let registry = registry.freeze().unwrap();

    // declaration order says late first, the edge says otherwise
    let pipeline = Pipeline::builder(registry.clone())
        .add_system(late)
        .add_system(early)
        .build()
        .unwrap();
    assert_eq!(
        pipeline.stage_layout(Phase::Process),
        vec![vec!["early".to_string()], vec!["late".to_string()]]
    );

    let mut cyclic = RegistryBuilder::new();
    let x = cyclic
        .register_system(SystemBuilder::new("x").before("y").after("y").build(|_| {}))
        .unwrap();
    let y = cyclic
        .register_system(SystemBuilder::new("y").build(|_| {}))
        .unwrap();
    let registry = cyclic.freeze().unwrap();
    let err = Pipeline::builder(registry)
        .add_system(x)
        .add_system(y)
        .build()
        .unwrap_err();
    assert!(matches!(err, keel::PlanError::Cycle { .. }));
}

#[test]
fn startup_systems_run_until_they_retire() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    registry.register_databag::<Counter>("Counter").unwrap();
    let startup = registry
        .register_system(
            SystemBuilder::new("warmup")
                .write_databag::<Counter>()
                .build_startup(|ctx| {
                    let mut counter = ctx.databag_mut::<Counter>();
                    counter.count += 1;
                    counter.count >= 2
                }),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    let mut pipeline = Pipeline::builder(registry).add_system(startup).build().unwrap();
    for _ in 0..10 {
        pipeline.dispatch(&mut world).unwrap();
    }
    assert_eq!(world.get_databag::<Counter>().unwrap().count, 2);
}

#[test]
fn deferred_commands_apply_at_stage_end() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    registry
        .register_component::<Position>("Position", StorageDiscipline::Dense)
        .unwrap();
    let spawner = registry
        .register_system(
            SystemBuilder::new("spawn_one")
                .read_component::<Position>()
                .build(|ctx| {
                    ctx.commands().spawn(|entity| {
                        entity.with(Position { x: 7 });
                    });
                }),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    let mut pipeline = Pipeline::builder(registry).add_system(spawner).build().unwrap();

    pipeline.dispatch(&mut world).unwrap();
    assert_eq!(world.entity_count(), 1);
    pipeline.dispatch(&mut world).unwrap();
    assert_eq!(world.entity_count(), 2);

    let mut xs = Vec::new();
    let mut query = world.query::<(Read<Position>,)>().unwrap();
    query.for_each(|_, (position,)| xs.push(position.x));
    assert_eq!(xs, vec![7, 7]);
}

#[test]
fn a_failing_system_aborts_the_tick() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    registry.register_databag::<Counter>("Counter").unwrap();
    let faulty = registry
        .register_system(
            SystemBuilder::new("faulty")
                .write_databag::<Counter>()
                .build_fallible(|ctx| {
                    if ctx.tick() == 0 {
                        Err(SystemError::new("boom"))
                    } else {
                        ctx.databag_mut::<Counter>().count += 1;
                        Ok(())
                    }
                }),
        )
        .unwrap();
    let after = registry
        .register_system(
            SystemBuilder::new("after_faulty")
                .write_databag::<Counter>()
                .build(|ctx| ctx.databag_mut::<Counter>().count += 10),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    let mut pipeline = Pipeline::builder(registry)
        .add_system(faulty)
        .add_system(after)
        .build()
        .unwrap();

    let err = pipeline.dispatch(&mut world).unwrap_err();
    assert!(matches!(err, DispatchError::SystemFailed { ref system, .. } if system == "faulty"));
    // the stage after the failure never ran
    assert_eq!(world.get_databag::<Counter>().unwrap().count, 0);

    pipeline.dispatch(&mut world).unwrap();
    assert_eq!(world.get_databag::<Counter>().unwrap().count, 11);
}

#[test]
fn ready_notification_arrives_on_first_dispatch_only() {
    init_tracing();
    let registry: Arc<Registry> = RegistryBuilder::new().freeze().unwrap();
    let mut world = World::new(registry.clone());
    let events = world.subscribe();

    let mut pipeline = Pipeline::builder(registry).build().unwrap();
    pipeline.dispatch(&mut world).unwrap();
    pipeline.dispatch(&mut world).unwrap();

    assert_eq!(
        events.try_recv().unwrap(),
        WorldNotification::Ready(world.id())
    );
    assert!(events.try_recv().is_err());
}

#[derive(Debug, PartialEq)]
struct Ping(u32);

#[derive(Default)]
struct Received {
    values: Vec<u32>,
}

#[test]
fn events_flow_from_emitter_to_receiver_within_one_tick() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    registry.register_event::<Ping>("Ping").unwrap();
    registry.register_databag::<Received>("Received").unwrap();
    let emit = registry
        .register_system(
            SystemBuilder::new("emit")
                .emitter::<Ping>("physics")
                .build(|ctx| {
                    let mut emitter = ctx.emitter::<Ping>();
                    emitter.emit(Ping(ctx.tick() as u32));
                }),
        )
        .unwrap();
    let receive = registry
        .register_system(
            SystemBuilder::new("receive")
                .receiver::<Ping>("physics")
                .write_databag::<Received>()
                .build(|ctx| {
                    let receiver = ctx.receiver::<Ping>();
                    let values: Vec<u32> = receiver.iter().map(|ping| ping.0).collect();
                    ctx.databag_mut::<Received>().values.extend(values);
                }),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    let mut pipeline = Pipeline::builder(registry)
        .add_system(emit)
        .add_system(receive)
        .build()
        .unwrap();

    // emitter/receiver conflict forces the emitter stage first
    assert_eq!(
        pipeline.stage_layout(Phase::Process),
        vec![vec!["emit".to_string()], vec!["receive".to_string()]]
    );

    pipeline.dispatch(&mut world).unwrap();
    pipeline.dispatch(&mut world).unwrap();
    assert_eq!(world.get_databag::<Received>().unwrap().values, vec![0, 1]);
}

#[test]
fn a_receiver_without_emitter_sees_nothing() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    registry.register_event::<Ping>("Ping").unwrap();
    registry.register_databag::<Counter>("Counter").unwrap();
    let receive = registry
        .register_system(
            SystemBuilder::new("receive")
                .receiver::<Ping>("nobody")
                .write_databag::<Counter>()
                .build(|ctx| {
                    ctx.databag_mut::<Counter>().count += ctx.receiver::<Ping>().events().len() as u32;
                }),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    let mut pipeline = Pipeline::builder(registry).add_system(receive).build().unwrap();
    assert!(pipeline.emitter_names(pipeline.registry().event_id::<Ping>().unwrap()).is_empty());

    pipeline.dispatch(&mut world).unwrap();
    assert_eq!(world.get_databag::<Counter>().unwrap().count, 0);
}

#[test]
fn bundles_expand_in_order_and_carry_their_dependencies() {
    init_tracing();

    fn tracer(name: &'static str) -> impl Fn(&keel::SystemContext) + Send + Sync + 'static {
        move |ctx: &keel::SystemContext| ctx.databag_mut::<Trace>().calls.push(name)
    }

    let mut registry = RegistryBuilder::new();
    registry.register_databag::<Trace>("Trace").unwrap();
    let first = registry
        .register_system(
            SystemBuilder::new("first")
                .write_databag::<Trace>()
                .build(tracer("first")),
        )
        .unwrap();
    let second = registry
        .register_system(
            SystemBuilder::new("second")
                .write_databag::<Trace>()
                .build(tracer("second")),
        )
        .unwrap();
    let closer = registry
        .register_system(
            SystemBuilder::new("closer")
                .write_databag::<Trace>()
                .build(tracer("closer")),
        )
        .unwrap();
    let bundle = registry.register_system_bundle("warmup").unwrap();
    registry.bundle_add_system(bundle, first).unwrap();
    registry.bundle_add_system(bundle, second).unwrap();
    // every member completes before `closer`
    registry.bundle_run_before(bundle, "closer").unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    // the bundle is declared after `closer`; its dependency still wins
    let mut pipeline = Pipeline::builder(registry)
        .add_system(closer)
        .add_bundle(bundle)
        .build()
        .unwrap();
    pipeline.dispatch(&mut world).unwrap();

    assert_eq!(
        world.get_databag::<Trace>().unwrap().calls,
        vec!["first", "second", "closer"]
    );
}

struct PhysicsBodies;

impl keel::SpawnerTag for PhysicsBodies {}

#[test]
fn spawners_only_touch_their_member_components() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    let a = registry
        .register_component::<A>("A", StorageDiscipline::Dense)
        .unwrap();
    registry
        .register_component::<B>("B", StorageDiscipline::Dense)
        .unwrap();
    let spawner = registry.register_spawner::<PhysicsBodies>("PhysicsBodies").unwrap();
    registry.component_joins_spawner(a, spawner).unwrap();

    let spawn = registry
        .register_system(
            SystemBuilder::new("spawn_bodies")
                .spawner::<PhysicsBodies>()
                .build(|ctx| {
                    let spawner = ctx.spawner::<PhysicsBodies>();
                    spawner.insert(keel::EntityId::new(0), A { i: 3 }).unwrap();
                    // B never joined the family
                    assert!(spawner.insert(keel::EntityId::new(0), B { i: 3 }).is_err());
                }),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    let entity = world.create_entity_id();
    let mut pipeline = Pipeline::builder(registry).add_system(spawn).build().unwrap();
    pipeline.dispatch(&mut world).unwrap();

    assert!(world.has_component::<A>(entity));
    assert!(!world.has_component::<B>(entity));
}

#[derive(Default)]
struct SceneTree {
    touches: u32,
}

#[test]
fn single_thread_databags_force_solo_stages() {
    init_tracing();
    let mut registry = RegistryBuilder::new();
    registry
        .register_databag_single_thread::<SceneTree>("SceneTree")
        .unwrap();
    let touching = registry
        .register_system(
            SystemBuilder::new("touching")
                .read_databag::<SceneTree>()
                .build(|_| {}),
        )
        .unwrap();
    let idle = registry
        .register_system(SystemBuilder::new("idle").build(|_| {}))
        .unwrap();
    let registry = registry.freeze().unwrap();

    let pipeline = Pipeline::builder(registry)
        .add_system(touching)
        .add_system(idle)
        .build()
        .unwrap();
    assert_eq!(
        pipeline.stage_layout(Phase::Process),
        vec![vec!["touching".to_string()], vec!["idle".to_string()]]
    );
}

#[test]
fn systems_route_into_their_parent_dispatcher() {
    init_tracing();

    fn tracer(name: &'static str) -> impl Fn(&keel::SystemContext) + Send + Sync + 'static {
        move |ctx: &keel::SystemContext| ctx.databag_mut::<Trace>().calls.push(name)
    }

    let mut registry = RegistryBuilder::new();
    registry.register_databag::<Trace>("Trace").unwrap();
    let dispatcher = registry
        .register_system(SystemBuilder::new("loop").dispatcher("inner", 1))
        .unwrap();
    let routed = registry
        .register_system(
            SystemBuilder::new("routed")
                .in_dispatcher("inner")
                .write_databag::<Trace>()
                .build(tracer("routed")),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    let mut pipeline = Pipeline::builder(registry)
        .add_system(dispatcher)
        .add_system(routed)
        .build()
        .unwrap();
    pipeline.dispatch(&mut world).unwrap();
    assert_eq!(world.get_databag::<Trace>().unwrap().calls, vec!["routed"]);
}

#[test]
fn phases_execute_in_their_fixed_order() {
    init_tracing();

    fn tracer(name: &'static str) -> impl Fn(&keel::SystemContext) + Send + Sync + 'static {
        move |ctx: &keel::SystemContext| ctx.databag_mut::<Trace>().calls.push(name)
    }

    let mut registry = RegistryBuilder::new();
    registry.register_databag::<Trace>("Trace").unwrap();
    let render = registry
        .register_system(
            SystemBuilder::new("render")
                .phase(Phase::PreRender)
                .write_databag::<Trace>()
                .build(tracer("render")),
        )
        .unwrap();
    let input = registry
        .register_system(
            SystemBuilder::new("input")
                .phase(Phase::Input)
                .write_databag::<Trace>()
                .build(tracer("input")),
        )
        .unwrap();
    let process = registry
        .register_system(
            SystemBuilder::new("process")
                .phase(Phase::Process)
                .write_databag::<Trace>()
                .build(tracer("process")),
        )
        .unwrap();
    let registry = registry.freeze().unwrap();

    let mut world = World::new(registry.clone());
    // declaration order deliberately disagrees with the phase order
    let mut pipeline = Pipeline::builder(registry)
        .add_system(render)
        .add_system(process)
        .add_system(input)
        .build()
        .unwrap();
    pipeline.dispatch(&mut world).unwrap();

    assert_eq!(
        world.get_databag::<Trace>().unwrap().calls,
        vec!["input", "process", "render"]
    );
}
