use std::fs;

use declad::types::{ClassDef, TypeId, TypeRegistry};
use declad::{Engine, Heap, Settings};

#[test]
fn toml_overrides_only_what_it_names() {
    let settings = Settings::from_toml("reference_depth = 5\nusing_namespaces = [\"Game\", \"Mods\"]\n").expect("valid toml");
    assert_eq!(settings.reference_depth, 5);
    assert_eq!(settings.using_namespaces, vec!["Game".to_string(), "Mods".to_string()]);
    assert_eq!(settings.reference_depth_overrun, Settings::default().reference_depth_overrun);
    assert!(settings.pretty);
}

#[test]
fn settings_file_is_optional() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = Settings::load(dir.path().join("absent.toml")).expect("missing file falls back");
    assert_eq!(missing.max_write_depth, Settings::default().max_write_depth);

    let path = dir.path().join("declad.toml");
    fs::write(&path, "pretty = false\nmax_write_depth = 12\n").expect("write settings");
    let loaded = Settings::load(&path).expect("load");
    assert!(!loaded.pretty);
    assert_eq!(loaded.max_write_depth, 12);
}

#[test]
fn malformed_settings_are_an_error() {
    assert!(Settings::from_toml("reference_depth = \"deep\"").is_err());
}

#[test]
fn engine_follows_its_settings() {
    let mut types = TypeRegistry::new();
    let item = types.register_composite(ClassDef::new("Game.Item").field("count", TypeId::I32)).expect("item");
    let settings = Settings { pretty: false, ..Settings::default() }.with_namespaces(["Game"]);
    let engine = Engine::with_settings(types, settings);
    assert_eq!(engine.resolve("Item"), Some(item), "namespace prefixes apply to lookups");

    let mut heap = Heap::new();
    let value = engine.read_simple(&mut heap, "<Item><count>2</count></Item>", item, "item.xml");
    let text = engine.write_simple(&mut heap, &value, item, "Item");
    assert_eq!(text, "<Item><count>2</count></Item>");
}
