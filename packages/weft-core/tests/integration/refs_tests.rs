//! Inbound reference tracking and the stale/removed lifecycle.

use ntest::timeout;

use weft_core::{
    ComponentDef, FieldKind, World, WorldDef, WorldOptions,
};

use super::value_component;

fn springs_world() -> World {
    let defs = vec![
        WorldDef::Component(value_component("Mass")),
        WorldDef::Component(
            ComponentDef::new("Spring")
                .field("target", FieldKind::Ref)
                .field("anchor", FieldKind::Ref)
                .field("stiffness", FieldKind::F64),
        ),
    ];
    World::create(WorldOptions {
        defs,
        max_entities: 100,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn backrefs_follow_assignments() -> anyhow::Result<()> {
    let mut world = springs_world();
    let mass = world.type_id("Mass")?;
    let spring = world.type_id("Spring")?;

    let m1 = world.create_entity()?;
    let m2 = world.create_entity()?;
    let s = world.create_entity()?;
    world.add(m1, mass)?;
    world.add(m2, mass)?;
    world.add(s, spring)?;

    let target_seq = 0;
    {
        let mut ctx = world.context();
        let mut view = ctx.bind_mut(s, spring)?;
        view.set_ref(target_seq, Some(m1))?;
    }
    world.execute()?;

    assert_eq!(world.backrefs(m1)?, vec![s]);
    assert!(world.backrefs(m2)?.is_empty());
    assert_eq!(world.backrefs_via(m1, "Spring", "target")?, vec![s]);

    // Retargeting releases the old edge entirely.
    {
        let mut ctx = world.context();
        let mut view = ctx.bind_mut(s, spring)?;
        view.set_ref(target_seq, Some(m2))?;
    }
    world.execute()?;

    assert!(world.backrefs(m1)?.is_empty());
    assert_eq!(world.backrefs(m2)?, vec![s]);
    world.check_invariants()?;
    Ok(())
}

#[test]
#[timeout(60000)]
fn one_source_with_two_fields_lists_once() {
    let mut world = springs_world();
    let mass = world.type_id("Mass").unwrap();
    let spring = world.type_id("Spring").unwrap();

    let m = world.create_entity().unwrap();
    let s = world.create_entity().unwrap();
    world.add(m, mass).unwrap();
    world.add(s, spring).unwrap();

    {
        let mut ctx = world.context();
        let mut view = ctx.bind_mut(s, spring).unwrap();
        view.set_ref(0, Some(m)).unwrap();
        view.set_ref(1, Some(m)).unwrap();
    }
    world.execute().unwrap();
    assert_eq!(world.backrefs(m).unwrap(), vec![s]);

    // Clearing one of the two fields keeps the source listed.
    {
        let mut ctx = world.context();
        let mut view = ctx.bind_mut(s, spring).unwrap();
        view.set_ref(0, None).unwrap();
    }
    world.execute().unwrap();
    assert_eq!(world.backrefs(m).unwrap(), vec![s]);
    assert!(world.backrefs_via(m, "Spring", "target").unwrap().is_empty());
    assert_eq!(world.backrefs_via(m, "Spring", "anchor").unwrap(), vec![s]);

    // Clearing the last field delists it.
    {
        let mut ctx = world.context();
        let mut view = ctx.bind_mut(s, spring).unwrap();
        view.set_ref(1, None).unwrap();
    }
    world.execute().unwrap();
    assert!(world.backrefs(m).unwrap().is_empty());
    world.check_invariants().unwrap();
}

#[test]
#[timeout(60000)]
fn deleting_the_target_clears_source_fields() {
    let mut world = springs_world();
    let mass = world.type_id("Mass").unwrap();
    let spring = world.type_id("Spring").unwrap();

    let m = world.create_entity().unwrap();
    let s = world.create_entity().unwrap();
    world.add(m, mass).unwrap();
    world.add(s, spring).unwrap();
    {
        let mut ctx = world.context();
        let mut view = ctx.bind_mut(s, spring).unwrap();
        view.set_ref(0, Some(m)).unwrap();
    }
    world.execute().unwrap();
    assert_eq!(world.backrefs(m).unwrap(), vec![s]);

    world.delete_entity(m).unwrap();
    world.execute().unwrap();

    // The source's ref reads as null once the target finalises.
    let ctx = world.context();
    let view = ctx.bind(s, spring).unwrap();
    assert_eq!(view.get_ref(0).unwrap(), None);
    drop(ctx);
    world.check_invariants().unwrap();
}

#[test]
#[timeout(60000)]
fn deleted_targets_release_live_edges_before_finalisation() {
    let mut world = springs_world();
    let mass = world.type_id("Mass").unwrap();
    let spring = world.type_id("Spring").unwrap();

    let m = world.create_entity().unwrap();
    let s = world.create_entity().unwrap();
    world.add(m, mass).unwrap();
    world.add(s, spring).unwrap();
    {
        let mut ctx = world.context();
        let mut view = ctx.bind_mut(s, spring).unwrap();
        view.set_ref(0, Some(m)).unwrap();
    }
    world.execute().unwrap();
    assert_eq!(world.backrefs(m).unwrap(), vec![s]);

    // While the deleted target sits in limbo, the live edge is already
    // released and the source's field reads as null, but the stale
    // tracker still lists the source.
    world.delete_entity(m).unwrap();
    assert!(world.backrefs(m).unwrap().is_empty());
    assert_eq!(world.stale_backrefs(m).unwrap(), vec![s]);
    {
        let ctx = world.context();
        let view = ctx.bind(s, spring).unwrap();
        assert_eq!(view.get_ref(0).unwrap(), None);
    }

    // Finalisation clears the stale tracker and reclaims the id.
    world.execute().unwrap();
    assert!(world.backrefs(m).is_err());
    world.check_invariants().unwrap();
}

#[test]
#[timeout(60000)]
fn deleting_the_source_releases_its_edges() {
    let mut world = springs_world();
    let mass = world.type_id("Mass").unwrap();
    let spring = world.type_id("Spring").unwrap();

    let m = world.create_entity().unwrap();
    let s = world.create_entity().unwrap();
    world.add(m, mass).unwrap();
    world.add(s, spring).unwrap();
    {
        let mut ctx = world.context();
        let mut view = ctx.bind_mut(s, spring).unwrap();
        view.set_ref(0, Some(m)).unwrap();
    }
    world.execute().unwrap();

    world.delete_entity(s).unwrap();
    world.execute().unwrap();

    assert!(world.backrefs(m).unwrap().is_empty());
    world.check_invariants().unwrap();
}
