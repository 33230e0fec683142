use keel::prelude::*;
use keel::{EntityId, QueryError, RegistryBuilder};

#[derive(Clone, Copy, Debug, PartialEq, Default)]
struct Pos(f32, f32, f32);

impl Component for Pos {}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
struct Rot(f32, f32, f32);

impl Component for Rot {}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
struct Scale(f32);

impl Component for Scale {}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
struct Frozen;

impl Component for Frozen {}

fn world() -> World {
    let mut registry = RegistryBuilder::new();
    registry
        .register_component::<Pos>("Pos", StorageDiscipline::Dense)
        .unwrap();
    registry
        .register_component::<Rot>("Rot", StorageDiscipline::Dense)
        .unwrap();
    registry
        .register_component::<Scale>("Scale", StorageDiscipline::Steady)
        .unwrap();
    registry
        .register_component::<Frozen>("Frozen", StorageDiscipline::Dense)
        .unwrap();
    World::new(registry.freeze().unwrap())
}

#[test]
fn query_read() {
    let mut world = world();
    let shared: EntityId = world
        .create_entity()
        .with(Pos(1., 2., 3.))
        .with(Rot(0.1, 0.2, 0.3))
        .into();
    world.create_entity().with(Pos(4., 5., 6.));

    let mut seen = Vec::new();
    let mut query = world.query::<(Read<Pos>, Read<Rot>)>().unwrap();
    query.for_each(|entity, (pos, rot)| seen.push((entity, *pos, *rot)));

    assert_eq!(seen, vec![(shared, Pos(1., 2., 3.), Rot(0.1, 0.2, 0.3))]);
}

#[test]
fn query_write_visits_each_entity_once() {
    let mut world = world();
    let entities: Vec<EntityId> = (0..8)
        .map(|index| {
            world
                .create_entity()
                .with(Pos(index as f32, 0., 0.))
                .into()
        })
        .collect();

    let mut visited = Vec::new();
    let mut query = world.query::<(Write<Pos>,)>().unwrap();
    query.for_each(|entity, (pos,)| {
        pos.1 += 1.;
        visited.push(entity);
    });

    visited.sort();
    let mut expected = entities.clone();
    expected.sort();
    assert_eq!(visited, expected);

    let mut query = world.query::<(Read<Pos>,)>().unwrap();
    query.for_each(|_, (pos,)| assert_eq!(pos.1, 1.));
}

#[test]
fn query_without_excludes() {
    let mut world = world();
    let plain: EntityId = world.create_entity().with(Pos::default()).into();
    world.create_entity().with(Pos::default()).with(Frozen);

    let mut query = world.query::<(Read<Pos>, Without<Frozen>)>().unwrap();
    assert_eq!(query.entities(), vec![plain]);
    assert_eq!(query.count(), 1);
}

#[test]
fn query_maybe_yields_options() {
    let mut world = world();
    let with_rot: EntityId = world
        .create_entity()
        .with(Pos::default())
        .with(Rot(1., 0., 0.))
        .into();
    let without_rot: EntityId = world.create_entity().with(Pos::default()).into();

    let mut seen = Vec::new();
    let mut query = world.query::<(Read<Pos>, Maybe<Read<Rot>>)>().unwrap();
    query.for_each(|entity, (_, rot)| seen.push((entity, rot.copied())));

    seen.sort_by_key(|(entity, _)| *entity);
    assert_eq!(
        seen,
        vec![(with_rot, Some(Rot(1., 0., 0.))), (without_rot, None)]
    );
}

#[test]
fn query_changed_consumes_the_list() {
    let mut world = world();
    let a: EntityId = world.create_entity().with(Pos::default()).into();
    let b: EntityId = world.create_entity().with(Pos::default()).into();
    world.storage_mut::<Pos>().unwrap().clear_changed();

    world.get_component_mut::<Pos>(a).unwrap().0 = 5.;

    {
        let mut query = world.query::<(Changed<Pos>,)>().unwrap();
        assert_eq!(query.entities(), vec![a]);
        let mut seen = Vec::new();
        query.for_each(|entity, (pos,)| seen.push((entity, *pos)));
        assert_eq!(seen, vec![(a, Pos(5., 0., 0.))]);
    }

    // drained by the pass above
    let mut query = world.query::<(Changed<Pos>,)>().unwrap();
    let mut count = 0;
    query.for_each(|_, _| count += 1);
    assert_eq!(count, 0);

    let _ = b;
}

#[test]
fn query_batch_yields_single_value_slices() {
    let mut world = world();
    world.create_entity().with(Pos(9., 0., 0.));

    let mut query = world.query::<(Batch<Pos>,)>().unwrap();
    let mut seen = 0;
    query.for_each(|_, (batch,)| {
        assert_eq!(batch, &[Pos(9., 0., 0.)]);
        seen += 1;
    });
    assert_eq!(seen, 1);
}

#[test]
fn query_any_of_unions_without_duplicates() {
    let mut world = world();
    let pos_only: EntityId = world.create_entity().with(Pos::default()).into();
    let rot_only: EntityId = world.create_entity().with(Rot::default()).into();
    let both: EntityId = world
        .create_entity()
        .with(Pos::default())
        .with(Rot::default())
        .into();
    world.create_entity().with(Scale(1.));

    let mut seen = Vec::new();
    let mut query = world
        .query::<(AnyOf<(Read<Pos>, Read<Rot>)>,)>()
        .unwrap();
    query.for_each(|entity, ((pos, rot),)| {
        seen.push((entity, pos.is_some(), rot.is_some()));
    });

    seen.sort_by_key(|(entity, ..)| *entity);
    assert_eq!(
        seen,
        vec![
            (pos_only, true, false),
            (rot_only, false, true),
            (both, true, true),
        ]
    );
}

#[test]
fn query_needs_a_driver() {
    let world = world();
    let result = world.query::<(Maybe<Read<Pos>>, Without<Frozen>)>();
    assert!(matches!(result, Err(QueryError::NoDriver)));
}

#[test]
fn query_on_an_absent_storage_is_empty() {
    let world = world();
    // no entity ever had a Pos, the storage does not even exist
    let mut query = world.query::<(Read<Pos>,)>().unwrap();
    assert_eq!(query.count(), 0);
    query.for_each(|_, _| panic!("nothing to yield"));
}

#[test]
fn get_fetches_a_single_entity() {
    let mut world = world();
    let entity: EntityId = world.create_entity().with(Pos(1., 1., 1.)).into();
    let other = world.create_entity_id();

    let mut query = world.query::<(Read<Pos>,)>().unwrap();
    assert_eq!(query.get(entity).map(|(pos,)| *pos), Some(Pos(1., 1., 1.)));
    assert!(query.get(other).is_none());
}
