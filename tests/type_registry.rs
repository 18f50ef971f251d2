use declad::error::TypeError;
use declad::types::{ClassDef, TypeId, TypeKind, TypeRegistry};
use declad::value::Value;

fn namespaces(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn builtin_names_and_aliases_resolve() {
    let types = TypeRegistry::new();
    assert_eq!(types.resolve("int", &[]), Ok(TypeId::I32));
    assert_eq!(types.resolve("System.Int32", &[]), Ok(TypeId::I32), "aliases apply when nothing else matched");
    assert_eq!(types.resolve("string", &[]), Ok(TypeId::STRING));
    assert!(matches!(types.resolve("Nope", &[]), Err(TypeError::Unknown(_))));
    assert!(matches!(types.resolve("", &[]), Err(TypeError::Malformed(_))));
}

#[test]
fn namespaces_shorten_and_disambiguate() {
    let mut types = TypeRegistry::new();
    let game_item = types.register_composite(ClassDef::new("Game.Item")).expect("register");
    let mods_item = types.register_composite(ClassDef::new("Mods.Item")).expect("register");

    assert_eq!(types.resolve("Item", &namespaces(&["Game"])), Ok(game_item));
    assert_eq!(types.resolve("Game.Item", &namespaces(&["Mods"])), Ok(game_item), "full names always resolve");
    match types.resolve("Item", &namespaces(&["Game", "Mods"])) {
        Err(TypeError::Ambiguous { first, .. }) => assert_eq!(first, game_item, "first namespace wins the tie"),
        other => panic!("expected ambiguity, got {other:?}"),
    }
    assert_eq!(types.compose_name(mods_item, &namespaces(&["Mods"])), "Item");
    assert_eq!(types.compose_name(mods_item, &[]), "Mods.Item");
}

#[test]
fn generic_and_array_names_round_trip() {
    let mut types = TypeRegistry::new();
    let list = types.list_of(TypeId::I32);
    let map = types.map_of(TypeId::STRING, list);
    let grid = types.array_of(TypeId::F64, 2);
    let pair = types.tuple_of(&[TypeId::I32, TypeId::STRING]);
    let set = types.set_of(TypeId::STRING);

    for id in [list, map, grid, pair, set] {
        let written = types.compose_name(id, &[]);
        assert_eq!(types.resolve(&written, &[]), Ok(id), "`{written}` should resolve to itself");
    }
    assert_eq!(types.compose_name(map, &[]), "Dictionary<string, List<int>>");
    assert_eq!(types.compose_name(grid, &[]), "double[,]");
    assert_eq!(types.list_of(TypeId::I32), list, "shapes are interned");
    assert!(matches!(types.resolve("List<int", &[]), Err(TypeError::Malformed(_))));
}

#[test]
fn record_hierarchy_queries() {
    let mut types = TypeRegistry::new();
    let weapon = types.register_record(ClassDef::new("Weapon").field("damage", TypeId::I32)).expect("weapon");
    let sword = types
        .register_record(ClassDef::new("Sword").parent(weapon).field("edge", TypeId::STRING))
        .expect("sword");
    let plain = types.register_composite(ClassDef::new("Plain")).expect("plain");

    assert!(types.is_assignable(weapon, sword));
    assert!(!types.is_assignable(sword, weapon));
    assert!(types.is_assignable(TypeId::OBJECT, plain));
    assert_eq!(types.root_record_type(sword), Some(weapon));
    assert_eq!(types.root_record_type(plain), None);
    assert!(types.is_record(sword));

    let fields: Vec<&str> = types.get(sword).fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(fields, vec!["damage", "edge"], "inherited fields come first");
    assert_eq!(types.field(sword, "edge").map(|(slot, _)| slot), Some(1));
}

#[test]
fn mismatched_parent_kind_is_rejected() {
    let mut types = TypeRegistry::new();
    let plain = types.register_composite(ClassDef::new("Plain")).expect("plain");
    assert!(types.register_record(ClassDef::new("Rec").parent(plain)).is_err(), "records cannot derive from composites");
    assert!(types.register_composite(ClassDef::new("Plain")).is_err(), "names are unique");
    assert!(types.register_composite(ClassDef::new("Bad Name")).is_err());
}

#[test]
fn defaults_follow_kind() {
    let mut types = TypeRegistry::new();
    let color = types.register_enum("Color", ["Red", "Green"]).expect("enum");
    let pair = types.tuple_of(&[TypeId::BOOL, TypeId::STRING]);
    assert_eq!(types.default_value(TypeId::I64), Value::I64(0));
    assert_eq!(types.default_value(color), Value::Enum(color, "Red".into()));
    assert_eq!(types.default_value(pair), Value::Tuple(pair, vec![Value::Bool(false), Value::Null]));
    assert_eq!(types.default_value(TypeId::STRING), Value::Null);
    assert!(matches!(types.kind(color), TypeKind::Enum(v) if v.len() == 2));
}
