use std::sync::{Arc, Mutex};

use declad::loader::hook;
use declad::types::{ClassDef, TypeId, TypeRegistry};
use declad::{CollectingSink, Engine, Value};

type Log = Arc<Mutex<Vec<String>>>;

fn logging(log: &Log, tag: &'static str) -> declad::loader::RecordHook {
    let log = Arc::clone(log);
    hook(move |ctx| {
        log.lock().expect("log lock").push(format!("{tag}:{}", ctx.name()));
        Ok(())
    })
}

fn load(engine: &mut Engine, text: &str) {
    let mut loader = engine.loader();
    loader.create_module("core").add_string(text, "hooks.xml").expect("ingest");
    loader.finish();
}

#[test]
fn post_load_follows_type_dependencies() {
    let log: Log = Arc::default();
    let mut types = TypeRegistry::new();
    let weapon = types
        .register_record(ClassDef::new("Weapon").field("dmg", TypeId::I32).post_load(logging(&log, "weapon")))
        .expect("weapon");
    types
        .register_record(ClassDef::new("Armor").depends_on(weapon).post_load(logging(&log, "armor")))
        .expect("armor");
    let sink = CollectingSink::new();
    let mut engine = Engine::new(types).with_sink(Arc::new(sink.clone()));

    load(&mut engine, r#"<Decs><Armor decName="Mail" /><Weapon decName="Axe" /></Decs>"#);
    assert!(sink.entries().is_empty(), "unexpected diagnostics: {:?}", sink.entries());
    assert_eq!(*log.lock().expect("log lock"), vec!["weapon:Axe", "armor:Mail"], "Armor waits for Weapon");
}

#[test]
fn subtypes_inherit_hooks() {
    let log: Log = Arc::default();
    let mut types = TypeRegistry::new();
    let weapon = types.register_record(ClassDef::new("Weapon").post_load(logging(&log, "weapon"))).expect("weapon");
    types.register_record(ClassDef::new("Bow").parent(weapon)).expect("bow");
    let mut engine = Engine::new(types).with_sink(Arc::new(CollectingSink::new()));

    load(&mut engine, r#"<Decs><Bow decName="Yew" /></Decs>"#);
    assert_eq!(*log.lock().expect("log lock"), vec!["weapon:Yew"]);
}

#[test]
fn hooks_can_fix_up_fields() {
    let mut types = TypeRegistry::new();
    let weapon = types
        .register_record(ClassDef::new("Weapon").field("dmg", TypeId::I32).post_load(hook(|ctx| {
            let doubled = ctx.field("dmg").and_then(Value::as_i64).unwrap_or_default() * 2;
            ctx.set_field("dmg", Value::I32(doubled as i32));
            Ok(())
        })))
        .expect("weapon");
    let mut engine = Engine::new(types).with_sink(Arc::new(CollectingSink::new()));

    load(&mut engine, r#"<Decs><Weapon decName="Axe"><dmg>4</dmg></Weapon></Decs>"#);
    let axe = engine.get(weapon, "Axe").expect("axe");
    assert_eq!(engine.field(axe, "dmg"), Some(&Value::I32(8)));
}

#[test]
fn hook_failures_are_contained() {
    let mut types = TypeRegistry::new();
    types
        .register_record(
            ClassDef::new("Weapon")
                .field("dmg", TypeId::I32)
                .config_errors(hook(|ctx| {
                    if ctx.field("dmg").and_then(Value::as_i64).unwrap_or_default() < 0 {
                        ctx.report("damage must not be negative");
                    }
                    Ok(())
                }))
                .post_load(hook(|ctx| match ctx.name() {
                    "Broken" => Err("missing sprite".into()),
                    "Cursed" => panic!("cursed blade"),
                    _ => Ok(()),
                })),
        )
        .expect("weapon");
    let sink = CollectingSink::new();
    let mut engine = Engine::new(types).with_sink(Arc::new(sink.clone()));

    load(
        &mut engine,
        r#"<Decs>
             <Weapon decName="Negative"><dmg>-1</dmg></Weapon>
             <Weapon decName="Broken" />
             <Weapon decName="Cursed" />
             <Weapon decName="Fine" />
           </Decs>"#,
    );
    assert_eq!(sink.count_errors_containing("[Weapon:Negative]: damage must not be negative"), 1);
    let exceptions: Vec<String> = sink.exceptions().into_iter().map(|d| d.message).collect();
    assert_eq!(exceptions.len(), 2, "got {exceptions:?}");
    assert!(exceptions[0].contains("[Weapon:Broken]: post-load failed: missing sprite"));
    assert!(exceptions[1].contains("[Weapon:Cursed]: post-load panicked: cursed blade"));
    assert_eq!(engine.list(engine.resolve("Weapon").expect("type")).len(), 4, "records survive their hooks");
}

#[test]
fn dependency_on_a_base_type_covers_its_subtypes() {
    let log: Log = Arc::default();
    let mut types = TypeRegistry::new();
    let material = types.register_record(ClassDef::new("Material")).expect("material");
    types
        .register_record(ClassDef::new("Metal").parent(material).post_load(logging(&log, "metal")))
        .expect("metal");
    types
        .register_record(ClassDef::new("Armor").depends_on(material).post_load(logging(&log, "armor")))
        .expect("armor");
    let sink = CollectingSink::new();
    let mut engine = Engine::new(types).with_sink(Arc::new(sink.clone()));

    load(&mut engine, r#"<Decs><Armor decName="Plate" /><Metal decName="Iron" /></Decs>"#);
    assert!(sink.entries().is_empty(), "unexpected diagnostics: {:?}", sink.entries());
    assert_eq!(*log.lock().expect("log lock"), vec!["metal:Iron", "armor:Plate"], "Armor waits for every Material");
}

#[test]
fn dependency_without_records_is_reported() {
    let log: Log = Arc::default();
    let mut types = TypeRegistry::new();
    let material = types.register_record(ClassDef::new("Material")).expect("material");
    types
        .register_record(ClassDef::new("Armor").depends_on(material).post_load(logging(&log, "armor")))
        .expect("armor");
    let sink = CollectingSink::new();
    let mut engine = Engine::new(types).with_sink(Arc::new(sink.clone()));

    load(&mut engine, r#"<Decs><Armor decName="Plate" /></Decs>"#);
    assert_eq!(sink.count_errors_containing("`Armor` depends on `Material`, but no records of that type were loaded"), 1);
    assert_eq!(*log.lock().expect("log lock"), vec!["armor:Plate"], "hooks still run");
}
