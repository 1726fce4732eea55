use relmodel_core::{
    Endpoint, Error, Instance, InstanceId, Registry, ReplicationMessage, Visibility,
};
use relmodel_test_support::{assert_mirror_matches, game_registry, plain_graph, Mirror};
use serde_json::{json, Value};

fn id(raw: &str) -> InstanceId {
    raw.parse().unwrap()
}

fn classes(mirror: &Mirror) -> Vec<String> {
    mirror
        .registry()
        .schema()
        .classes()
        .map(|def| def.name.clone())
        .collect()
}

fn has(mirror: &Mirror, raw: &str) -> bool {
    mirror.registry().find(raw).is_some()
}

fn members(mirror: &Mirror, raw: &str, role: &str) -> Vec<String> {
    mirror
        .registry()
        .many(&id(raw), role)
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn partner(mirror: &Mirror, raw: &str, role: &str) -> Option<String> {
    mirror
        .registry()
        .one(&id(raw), role)
        .unwrap()
        .map(ToString::to_string)
}

#[test]
fn stream_opens_with_schema_and_snapshot() {
    let mut source = Registry::new();
    source.declare_class("Game", true).unwrap();
    let mirror = Mirror::attach(&mut source, json!({})).unwrap();

    assert_eq!(classes(&mirror), vec!["Game"]);
    let kinds: Vec<_> = mirror.messages().iter().map(|m| m.kind()).collect();
    assert_eq!(kinds, vec!["schema", "snapshot"]);
    assert_eq!(mirror.wire()[1], r#"["snapshot","{}"]"#);
}

#[test]
fn existing_and_new_instances_are_mirrored() {
    let mut source = Registry::new();
    source.declare_class("Game", true).unwrap();
    source.create("Game").unwrap();
    let mirror = Mirror::attach(&mut source, json!({})).unwrap();
    assert!(has(&mirror, "Game@0"));
    assert!(!has(&mirror, "Game@1"));

    source.create("Game").unwrap();
    assert!(has(&mirror, "Game@1"));
    assert_eq!(mirror.wire().last().unwrap(), r#"["init","Game","Game@1"]"#);
    assert_mirror_matches(&source, &mirror);
}

#[test]
fn attribute_updates_follow() {
    let mut source = game_registry();
    let game = source.create("Game").unwrap();
    source.set_attribute(&game, "running", false).unwrap();
    let mirror = Mirror::attach(&mut source, json!({})).unwrap();
    assert_eq!(
        mirror.registry().attribute(&game, "running").unwrap(),
        Some(&json!(false))
    );

    source.set_attribute(&game, "running", true).unwrap();
    assert_eq!(
        mirror.registry().attribute(&game, "running").unwrap(),
        Some(&json!(true))
    );
    assert_eq!(
        mirror.wire().last().unwrap(),
        r#"["change","running",true,false,"Game@0"]"#
    );

    source.unset_attribute(&game, "running").unwrap();
    assert_eq!(mirror.registry().attribute(&game, "running").unwrap(), None);
}

#[test]
fn initial_links_arrive_with_the_snapshot() {
    let mut source = game_registry();
    let game = source.create("Game").unwrap();
    let map = source.create("Map").unwrap();
    source.set_one(&game, "map", Some(&map)).unwrap();

    let mirror = Mirror::attach(&mut source, json!({})).unwrap();

    assert_eq!(partner(&mirror, "Game@0", "map").as_deref(), Some("Map@1"));
    assert_eq!(partner(&mirror, "Map@1", "game").as_deref(), Some("Game@0"));
    assert_mirror_matches(&source, &mirror);
}

#[test]
fn one_to_one_links_made_later_follow() {
    let mut source = Registry::new();
    source.declare_class("Game", true).unwrap();
    source.declare_class("Map", true).unwrap();
    source.declare_link("Map", "Game", Some("1-1"), true).unwrap();
    let game = source.create("Game").unwrap();
    let map = source.create("Map").unwrap();
    let mirror = Mirror::attach(&mut source, json!({})).unwrap();
    assert_eq!(partner(&mirror, "Game@0", "map"), None);
    assert_eq!(partner(&mirror, "Map@1", "game"), None);

    source.set_one(&game, "map", Some(&map)).unwrap();

    assert_eq!(partner(&mirror, "Game@0", "map").as_deref(), Some("Map@1"));
    assert_eq!(partner(&mirror, "Map@1", "game").as_deref(), Some("Game@0"));
    assert_mirror_matches(&source, &mirror);
}

#[test]
fn sequence_additions_and_removals_follow() {
    let mut source = game_registry();
    let game = source.create("Game").unwrap();
    let player1 = source.create("Player").unwrap();
    let player2 = source.create("Player").unwrap();
    source.append(&game, "players", &player1).unwrap();
    let mirror = Mirror::attach(&mut source, json!({})).unwrap();
    assert_eq!(members(&mirror, "Game@0", "players"), vec!["Player@1"]);

    source.append(&game, "players", &player2).unwrap();
    assert_eq!(
        members(&mirror, "Game@0", "players"),
        vec!["Player@1", "Player@2"]
    );

    source.remove(&game, "players", &player1).unwrap();
    assert_eq!(members(&mirror, "Game@0", "players"), vec!["Player@2"]);
    assert_eq!(partner(&mirror, "Player@1", "game"), None);

    source.prepend(&game, "players", &player1).unwrap();
    source
        .replace_all(&game, "players", &[player2.clone(), player1.clone()])
        .unwrap();
    assert_eq!(
        members(&mirror, "Game@0", "players"),
        vec!["Player@2", "Player@1"]
    );
    assert_mirror_matches(&source, &mirror);
}

#[test]
fn several_mirrors_can_follow_one_source() {
    let mut source = game_registry();
    let first = Mirror::attach(&mut source, json!({})).unwrap();
    let game = source.create("Game").unwrap();
    let player = source.create("Player").unwrap();
    source.append(&game, "players", &player).unwrap();
    let second = Mirror::attach(&mut source, json!({})).unwrap();
    source.set_attribute(&game, "running", true).unwrap();

    assert_mirror_matches(&source, &first);
    assert_mirror_matches(&source, &second);
}

#[test]
fn unsubscribing_ends_the_stream() {
    let mut source = game_registry();
    let mirror = Mirror::new();
    let subscription = mirror.follow(&mut source, json!({})).unwrap();
    source.create("Game").unwrap();
    assert!(source.unsubscribe(subscription));
    source.create("Game").unwrap();
    assert!(has(&mirror, "Game@0"));
    assert!(!has(&mirror, "Game@1"));
}

#[test]
fn mirrors_can_be_chained() {
    let mut source = game_registry();
    let middle = Mirror::attach(&mut source, json!({})).unwrap();
    let last = Mirror::new();
    middle
        .with_registry(|registry| last.follow(registry, json!({})))
        .unwrap();

    let game = source.create("Game").unwrap();
    let map = source.create("Map").unwrap();
    source.set_one(&game, "map", Some(&map)).unwrap();

    assert_mirror_matches(&source, &last);
}

#[test]
fn subclass_instances_replicate() {
    let mut source = game_registry();
    source
        .declare_attribute("Player", "score", "Number", true)
        .unwrap();
    source.inherit("Player", "Bot", true).unwrap();
    let game = source.create("Game").unwrap();
    let first = source.create("Bot").unwrap();
    source.set_attribute(&first, "score", 1).unwrap();
    source.append(&game, "players", &first).unwrap();

    let mirror = Mirror::attach(&mut source, json!({})).unwrap();
    assert_eq!(members(&mirror, "Game@0", "players"), vec!["Bot@1"]);
    let superclass = mirror
        .registry()
        .schema()
        .class("Bot")
        .and_then(|def| def.superclass.clone());
    assert_eq!(superclass.as_deref(), Some("Player"));

    let second = source.create("Bot").unwrap();
    source.set_attribute(&second, "score", 3).unwrap();
    source.set_one(&second, "game", Some(&game)).unwrap();
    assert_eq!(partner(&mirror, "Bot@2", "game").as_deref(), Some("Game@0"));
    assert_eq!(
        mirror.registry().attribute(&second, "score").unwrap(),
        Some(&json!(3))
    );
    assert_mirror_matches(&source, &mirror);
}

fn cells() -> Registry {
    let mut r = Registry::new();
    r.declare_class("Cell", true).unwrap();
    r.declare_link(
        Endpoint::new("Cell").one().named("prev"),
        Endpoint::new("Cell").one().named("next"),
        None,
        true,
    )
    .unwrap();
    r.declare_link(
        Endpoint::new("Cell").many().named("neighbors"),
        Endpoint::new("Cell").many().named("invNeighbors"),
        None,
        true,
    )
    .unwrap();
    r
}

#[test]
fn self_links_replicate() {
    let mut source = cells();
    let early = Mirror::attach(&mut source, json!({})).unwrap();
    let a = source.create("Cell").unwrap();
    let b = source.create("Cell").unwrap();
    source.set_one(&a, "next", Some(&a)).unwrap();
    assert_eq!(partner(&early, "Cell@0", "prev").as_deref(), Some("Cell@0"));

    let late = Mirror::attach(&mut source, json!({})).unwrap();
    assert_eq!(partner(&late, "Cell@0", "next").as_deref(), Some("Cell@0"));

    // b takes a's prev slot, which detaches a from itself
    source.set_one(&b, "next", Some(&a)).unwrap();
    for mirror in [&early, &late] {
        assert_eq!(partner(mirror, "Cell@0", "next"), None);
        assert_eq!(partner(mirror, "Cell@0", "prev").as_deref(), Some("Cell@1"));
        assert_mirror_matches(&source, mirror);
    }
}

#[test]
fn many_to_many_links_replicate() {
    let mut source = cells();
    let early = Mirror::attach(&mut source, json!({})).unwrap();
    let c: Vec<_> = (0..4).map(|_| source.create("Cell").unwrap()).collect();
    source.append(&c[0], "neighbors", &c[0]).unwrap();
    source.append(&c[0], "neighbors", &c[1]).unwrap();
    source.append(&c[2], "neighbors", &c[1]).unwrap();

    let late = Mirror::attach(&mut source, json!({})).unwrap();
    assert_eq!(members(&late, "Cell@0", "neighbors"), vec!["Cell@0", "Cell@1"]);
    assert_eq!(members(&late, "Cell@1", "invNeighbors"), vec!["Cell@0", "Cell@2"]);

    source
        .replace_all(&c[1], "invNeighbors", &[c[3].clone(), c[2].clone()])
        .unwrap();
    source.remove(&c[0], "neighbors", &c[0]).unwrap();
    for mirror in [&early, &late] {
        assert_eq!(members(mirror, "Cell@1", "invNeighbors"), vec!["Cell@3", "Cell@2"]);
        assert!(members(mirror, "Cell@0", "neighbors").is_empty());
        assert!(members(mirror, "Cell@0", "invNeighbors").is_empty());
        assert_mirror_matches(&source, mirror);
    }
}

mod hidden {
    use super::*;

    #[test]
    fn hidden_classes_stay_home() {
        let mut source = Registry::new();
        source.declare_class("Game", false).unwrap();
        source.create("Game").unwrap();
        let mirror = Mirror::attach(&mut source, json!({})).unwrap();
        assert!(classes(&mirror).is_empty());
        assert!(!has(&mirror, "Game@0"));

        source.create("Game").unwrap();
        assert!(!has(&mirror, "Game@1"));
        assert_eq!(mirror.messages().len(), 2);
    }

    #[test]
    fn hidden_attributes_stay_home() {
        let mut source = Registry::new();
        source.declare_class("Game", true).unwrap();
        source
            .declare_attribute("Game", "running", "boolean", false)
            .unwrap();
        let game = source.create("Game").unwrap();
        source.set_attribute(&game, "running", false).unwrap();
        let mirror = Mirror::attach(&mut source, json!({})).unwrap();
        assert!(has(&mirror, "Game@0"));
        assert!(mirror.registry().schema().attribute("Game", "running").is_none());

        source.set_attribute(&game, "running", true).unwrap();
        assert_eq!(mirror.messages().len(), 2);
        assert!(mirror.errors().is_empty());
    }

    #[test]
    fn hidden_links_stay_home() {
        let mut source = Registry::new();
        source.declare_class("Game", true).unwrap();
        source.declare_class("Player", true).unwrap();
        source.declare_link("Game", "Player", Some("1-*"), false).unwrap();
        let game = source.create("Game").unwrap();
        let player1 = source.create("Player").unwrap();
        let player2 = source.create("Player").unwrap();
        source.append(&game, "players", &player1).unwrap();
        let mirror = Mirror::attach(&mut source, json!({})).unwrap();

        source.append(&game, "players", &player2).unwrap();

        assert!(mirror.registry().schema().role("Game", "players").is_none());
        for raw in ["Game@0", "Player@1", "Player@2"] {
            assert!(has(&mirror, raw));
            assert_eq!(
                Value::Object(mirror.registry().clone_instance(&id(raw)).unwrap()),
                json!({})
            );
        }
        assert!(mirror.errors().is_empty());
    }

    #[test]
    fn links_to_hidden_classes_stay_home() {
        let mut source = Registry::new();
        source.declare_class("Game", true).unwrap();
        source.declare_class("Player", false).unwrap();
        source.declare_link("Game", "Player", Some("1-*"), true).unwrap();
        let game = source.create("Game").unwrap();
        let player1 = source.create("Player").unwrap();
        let player2 = source.create("Player").unwrap();
        source.append(&game, "players", &player1).unwrap();
        let mirror = Mirror::attach(&mut source, json!({})).unwrap();

        source.append(&game, "players", &player2).unwrap();

        assert!(has(&mirror, "Game@0"));
        assert!(!has(&mirror, "Player@1"));
        assert!(!has(&mirror, "Player@2"));
        assert!(mirror.registry().schema().role("Game", "players").is_none());
        assert_eq!(mirror.messages().len(), 2);
    }
}

mod per_viewer {
    use super::*;

    fn viewer_is(wanted: i64) -> Visibility {
        Visibility::predicate(move |viewer, _| viewer["id"] == wanted)
    }

    fn two_viewers(source: &mut Registry) -> (Mirror, Mirror) {
        (
            Mirror::attach(source, json!({"id": 1})).unwrap(),
            Mirror::attach(source, json!({"id": 2})).unwrap(),
        )
    }

    #[test]
    fn schema_differs_per_viewer() {
        let mut source = Registry::new();
        source.declare_class("Game", viewer_is(2)).unwrap();
        let (one, two) = two_viewers(&mut source);
        assert!(classes(&one).is_empty());
        assert_eq!(classes(&two), vec!["Game"]);
    }

    #[test]
    fn instances_differ_per_viewer() {
        let mut source = Registry::new();
        source.declare_class("Game", viewer_is(2)).unwrap();
        source.create("Game").unwrap();
        let (one, two) = two_viewers(&mut source);
        assert!(!has(&one, "Game@0"));
        assert!(has(&two, "Game@0"));

        source.create("Game").unwrap();
        assert!(!has(&one, "Game@1"));
        assert!(has(&two, "Game@1"));
    }

    #[test]
    fn attribute_updates_differ_per_viewer() {
        let mut source = Registry::new();
        source.declare_class("Game", true).unwrap();
        source
            .declare_attribute("Game", "running", "boolean", viewer_is(2))
            .unwrap();
        let game = source.create("Game").unwrap();
        source.set_attribute(&game, "running", false).unwrap();
        let (one, two) = two_viewers(&mut source);
        assert!(has(&one, "Game@0"));
        assert!(one.registry().schema().attribute("Game", "running").is_none());
        assert_eq!(
            two.registry().attribute(&game, "running").unwrap(),
            Some(&json!(false))
        );

        source.set_attribute(&game, "running", true).unwrap();
        assert_eq!(
            two.registry().attribute(&game, "running").unwrap(),
            Some(&json!(true))
        );
        assert!(one.errors().is_empty());
    }

    #[test]
    fn restricted_link_per_viewer() {
        let mut source = Registry::new();
        source.declare_class("Game", true).unwrap();
        source.declare_class("Map", true).unwrap();
        source
            .declare_link("Game", "Map", Some("1-1"), viewer_is(2))
            .unwrap();
        let game = source.create("Game").unwrap();
        let map = source.create("Map").unwrap();
        let (one, two) = two_viewers(&mut source);
        assert_eq!(partner(&two, "Game@0", "map"), None);

        source.set_one(&game, "map", Some(&map)).unwrap();

        assert!(one.registry().schema().role("Game", "map").is_none());
        assert!(has(&one, "Game@0"));
        assert!(has(&one, "Map@1"));
        assert_eq!(one.messages().len(), 2);
        assert_eq!(partner(&two, "Game@0", "map").as_deref(), Some("Map@1"));
        assert_eq!(partner(&two, "Map@1", "game").as_deref(), Some("Game@0"));
        assert!(two.errors().is_empty());
    }

    #[test]
    fn restricted_class_per_viewer() {
        let mut source = Registry::new();
        source.declare_class("Game", true).unwrap();
        source.declare_class("Player", viewer_is(2)).unwrap();
        source.declare_link("Game", "Player", Some("1-*"), true).unwrap();
        let game = source.create("Game").unwrap();
        let player1 = source.create("Player").unwrap();
        let player2 = source.create("Player").unwrap();
        source.append(&game, "players", &player1).unwrap();
        let (one, two) = two_viewers(&mut source);

        assert!(one.registry().schema().role("Game", "players").is_none());
        assert!(!has(&one, "Player@1"));
        assert_eq!(members(&two, "Game@0", "players"), vec!["Player@1"]);
        assert_eq!(partner(&two, "Player@1", "game").as_deref(), Some("Game@0"));
        assert_eq!(partner(&two, "Player@2", "game"), None);

        source.append(&game, "players", &player2).unwrap();

        assert!(!has(&one, "Player@2"));
        assert_eq!(
            members(&two, "Game@0", "players"),
            vec!["Player@1", "Player@2"]
        );
        assert_eq!(partner(&two, "Player@2", "game").as_deref(), Some("Game@0"));
        assert!(one.errors().is_empty());
        assert!(two.errors().is_empty());
    }

    fn owned_by_viewer(viewer: &Value, player: Option<&Instance>) -> bool {
        player.map_or(true, |player| player.attribute("id") == Some(&viewer["id"]))
    }

    #[test]
    fn instance_level_rules_distinguish_viewers() {
        let mut source = Registry::new();
        source.declare_class("Game", true).unwrap();
        source
            .declare_class("Player", Visibility::predicate(owned_by_viewer))
            .unwrap();
        source.declare_attribute("Player", "id", "Number", true).unwrap();
        source.declare_link("Game", "Player", Some("1-*"), true).unwrap();
        let game = source.create("Game").unwrap();
        let player1 = source.create("Player").unwrap();
        source.set_attribute(&player1, "id", 1).unwrap();
        let player2 = source.create("Player").unwrap();
        source.set_attribute(&player2, "id", 2).unwrap();
        source.append(&game, "players", &player1).unwrap();
        let (one, two) = two_viewers(&mut source);

        assert_eq!(members(&one, "Game@0", "players"), vec!["Player@1"]);
        assert_eq!(partner(&one, "Player@1", "game").as_deref(), Some("Game@0"));
        assert!(!has(&one, "Player@2"));
        assert!(members(&two, "Game@0", "players").is_empty());
        assert!(!has(&two, "Player@1"));
        assert!(has(&two, "Player@2"));

        source.append(&game, "players", &player2).unwrap();

        assert_eq!(
            source.many(&game, "players").unwrap(),
            &[player1, player2]
        );
        assert_eq!(members(&one, "Game@0", "players"), vec!["Player@1"]);
        assert!(!has(&one, "Player@2"));
        assert_eq!(members(&two, "Game@0", "players"), vec!["Player@2"]);
        assert_eq!(partner(&two, "Player@2", "game").as_deref(), Some("Game@0"));
        assert!(!has(&two, "Player@1"));
        assert!(one.errors().is_empty());
        assert!(two.errors().is_empty());
    }

    #[test]
    fn instances_are_introduced_once_they_become_visible() {
        let mut source = Registry::new();
        source.declare_class("Game", true).unwrap();
        source
            .declare_class("Player", Visibility::predicate(owned_by_viewer))
            .unwrap();
        source.declare_attribute("Player", "id", "Number", true).unwrap();
        source.declare_link("Game", "Player", Some("1-*"), true).unwrap();
        let (one, two) = two_viewers(&mut source);

        let game = source.create("Game").unwrap();
        let player = source.create("Player").unwrap();
        source.append(&game, "players", &player).unwrap();
        assert!(!has(&one, "Player@1"));
        assert!(!has(&two, "Player@1"));

        source.set_attribute(&player, "id", 1).unwrap();

        assert!(has(&one, "Player@1"));
        assert!(!has(&two, "Player@1"));
        assert_eq!(members(&one, "Game@0", "players"), vec!["Player@1"]);
        assert_eq!(
            one.registry().attribute(&player, "id").unwrap(),
            Some(&json!(1))
        );
        let late: Vec<_> = one
            .messages()
            .into_iter()
            .filter(|m| matches!(m, ReplicationMessage::Snapshot(_)))
            .collect();
        assert_eq!(late.len(), 2);
        assert!(one.errors().is_empty());
        assert!(two.errors().is_empty());
    }

    #[test]
    fn late_members_keep_their_place_in_sequences() {
        let mut source = Registry::new();
        source.declare_class("Game", true).unwrap();
        source
            .declare_class("Player", Visibility::predicate(owned_by_viewer))
            .unwrap();
        source.declare_attribute("Player", "id", "Number", true).unwrap();
        source.declare_link("Game", "Player", Some("1-*"), true).unwrap();
        let one = Mirror::attach(&mut source, json!({"id": 1})).unwrap();

        let game = source.create("Game").unwrap();
        let late = source.create("Player").unwrap();
        let early = source.create("Player").unwrap();
        source.set_attribute(&early, "id", 1).unwrap();
        source.append(&game, "players", &late).unwrap();
        source.append(&game, "players", &early).unwrap();
        assert_eq!(members(&one, "Game@0", "players"), vec!["Player@2"]);

        source.set_attribute(&late, "id", 1).unwrap();

        assert_eq!(
            members(&one, "Game@0", "players"),
            vec!["Player@1", "Player@2"]
        );
        assert_eq!(partner(&one, "Player@1", "game").as_deref(), Some("Game@0"));
        assert!(one.errors().is_empty());
        one.registry().validate_invariants().unwrap();
    }

    #[test]
    fn sequence_indices_are_rebased_for_the_viewer() {
        let mut source = Registry::new();
        source.declare_class("Game", true).unwrap();
        source
            .declare_class("Player", Visibility::predicate(owned_by_viewer))
            .unwrap();
        source.declare_attribute("Player", "id", "Number", true).unwrap();
        source.declare_link("Game", "Player", Some("1-*"), true).unwrap();
        let game = source.create("Game").unwrap();
        let hidden = source.create("Player").unwrap();
        source.set_attribute(&hidden, "id", 2).unwrap();
        source.append(&game, "players", &hidden).unwrap();
        let one = Mirror::attach(&mut source, json!({"id": 1})).unwrap();

        let mine = source.create("Player").unwrap();
        source.set_attribute(&mine, "id", 1).unwrap();
        one.clear_messages();
        source.append(&game, "players", &mine).unwrap();

        assert_eq!(
            one.wire()[0],
            r#"["addto","players","Player@2",0,"Game@0"]"#
        );
        source.remove(&game, "players", &mine).unwrap();
        assert!(members(&one, "Game@0", "players").is_empty());
        assert!(one.errors().is_empty());
    }
}

mod receiving {
    use super::*;

    fn mirror_of_games() -> Registry {
        let mut r = game_registry();
        r.register_with_explicit_id(id("Game@0")).unwrap();
        r.register_with_explicit_id(id("Player@1")).unwrap();
        r
    }

    #[test]
    fn addto_is_idempotent_and_clamped() {
        let mut r = mirror_of_games();
        r.receive_tuple(r#"["addto","players","Player@1",5,"Game@0"]"#)
            .unwrap();
        r.receive_tuple(r#"["addto","players","Player@1",0,"Game@0"]"#)
            .unwrap();
        assert_eq!(r.many(&id("Game@0"), "players").unwrap(), &[id("Player@1")]);
    }

    #[test]
    fn removefrom_of_absent_members_is_a_noop() {
        let mut r = mirror_of_games();
        r.receive_tuple(r#"["removefrom","players","Player@1",0,"Game@0"]"#)
            .unwrap();
        r.receive_tuple(r#"["removefrom","players","Player@9",0,"Game@0"]"#)
            .unwrap();
        assert!(r.many(&id("Game@0"), "players").unwrap().is_empty());
    }

    #[test]
    fn duplicate_init_is_an_identity_conflict() {
        let mut r = mirror_of_games();
        let err = r.receive_tuple(r#"["init","Game","Game@0"]"#).unwrap_err();
        assert!(matches!(err, Error::IdentityConflict(_)));
        let err = r.receive_tuple(r#"["init","Map","Game@7"]"#).unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }

    #[test]
    fn snapshots_may_reference_later_entries() {
        let mut r = game_registry();
        let snapshot = json!({
            "Player@3": {"game": "Game@10"},
            "Game@10": {"players": ["Player@3"], "running": true},
        });
        r.receive(ReplicationMessage::Snapshot(snapshot.to_string()))
            .unwrap();
        assert_eq!(r.one(&id("Player@3"), "game").unwrap(), Some(&id("Game@10")));
        assert_eq!(
            r.attribute(&id("Game@10"), "running").unwrap(),
            Some(&json!(true))
        );
        let err = r
            .receive(ReplicationMessage::Snapshot(json!({"Game@10": {}}).to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::IdentityConflict(_)));
    }

    #[test]
    fn rejected_snapshots_leave_the_mirror_unchanged() {
        let mut r = mirror_of_games();
        let before = plain_graph(&r);
        let rejected = [
            json!({"Game@5": {"players": ["Map@6"]}, "Map@6": {}}),
            json!({"Game@5": {}, "Player@6": {"score": 1}}),
            json!({"Game@5": {"players": ["Player@9"]}}),
            json!({"Game@0": {}, "Game@5": {}}),
        ];
        let errors: Vec<_> = rejected
            .iter()
            .map(|snapshot| r.import_snapshot(&snapshot.to_string()).unwrap_err())
            .collect();
        assert!(matches!(errors[0], Error::TargetMismatch { .. }));
        assert!(matches!(errors[1], Error::UnknownField { .. }));
        assert!(matches!(errors[2], Error::UnknownReference(_)));
        assert!(matches!(errors[3], Error::IdentityConflict(_)));
        assert_eq!(plain_graph(&r), before);

        let corrected = json!({"Game@5": {"players": ["Player@6", "Player@1"]}, "Player@6": {}});
        r.import_snapshot(&corrected.to_string()).unwrap();
        assert_eq!(
            r.many(&id("Game@5"), "players").unwrap(),
            &[id("Player@6"), id("Player@1")]
        );
        assert_eq!(r.one(&id("Player@1"), "game").unwrap(), Some(&id("Game@5")));
    }

    #[test]
    fn ids_past_the_sequence_space_are_refused() {
        let mut r = game_registry();
        let err = r
            .receive_tuple(r#"["init","Game","Game@18446744073709551615"]"#)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedId(_)));
        let snapshot = json!({"Game@18446744073709551615": {}}).to_string();
        assert!(matches!(
            r.import_snapshot(&snapshot),
            Err(Error::MalformedId(_))
        ));
        assert_eq!(r.create("Game").unwrap(), id("Game@0"));

        r.receive_tuple(r#"["init","Game","Game@18446744073709551614"]"#)
            .unwrap();
        assert!(matches!(r.create("Game"), Err(Error::InconsistentState(_))));
        assert_eq!(r.len(), 2);
        assert!(r.contains(&id("Game@18446744073709551614")));
    }

    #[test]
    fn changes_on_sequences_replace_them() {
        let mut r = mirror_of_games();
        r.register_with_explicit_id(id("Player@2")).unwrap();
        r.receive_tuple(r#"["change","players",["Player@2","Player@1"],[],"Game@0"]"#)
            .unwrap();
        assert_eq!(
            r.many(&id("Game@0"), "players").unwrap(),
            &[id("Player@2"), id("Player@1")]
        );
        let err = r
            .receive_tuple(r#"["change","players","Player@2",[],"Game@0"]"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }
}
