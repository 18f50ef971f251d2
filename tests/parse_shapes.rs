use declad::types::{ClassDef, FieldDescriptor, TypeId, TypeRegistry};
use declad::{CollectingSink, Engine, Heap, Settings, Value};

struct Shapes {
    engine: Engine,
    sink: CollectingSink,
    inventory: TypeId,
    part: TypeId,
    color: TypeId,
}

fn shapes() -> Shapes {
    let mut types = TypeRegistry::new();
    let color = types.register_enum("Color", ["Red", "Green", "Blue"]).expect("enum");
    let part = types.register_composite(ClassDef::new("Part").field("size", TypeId::I32)).expect("part");
    let tags = types.list_of(TypeId::STRING);
    let grid = types.array_of(TypeId::I32, 2);
    let scores = types.map_of(TypeId::STRING, TypeId::I32);
    let flags = types.set_of(TypeId::STRING);
    let pair = types.tuple_of(&[TypeId::I32, TypeId::STRING]);
    let inventory = types
        .register_composite(
            ClassDef::new("Inventory")
                .field("name", TypeId::STRING)
                .field("count", TypeId::I32)
                .field("ratio", TypeId::F64)
                .field("color", color)
                .field("tags", tags)
                .field("grid", grid)
                .field("scores", scores)
                .field("flags", flags)
                .field_with(FieldDescriptor::new("pair", pair).tuple_names(["id", "label"]))
                .field("kind", TypeId::TYPE)
                .field("child", part)
                .field("anything", TypeId::OBJECT),
        )
        .expect("inventory");
    let sink = CollectingSink::new();
    let engine = Engine::new(types).with_sink(std::sync::Arc::new(sink.clone()));
    Shapes { engine, sink, inventory, part, color }
}

const INVENTORY: &str = r#"
<Inventory>
  <name>Pack</name>
  <count> 3 </count>
  <ratio>NaN</ratio>
  <color>Green</color>
  <tags><li>a</li><li>b</li></tags>
  <grid><li><li>1</li><li>2</li></li><li><li>3</li><li>4</li></li></grid>
  <scores><li><key>x</key><value>1</value></li><y>2</y></scores>
  <flags><li>red</li><blue /></flags>
  <pair><id>5</id><label>five</label></pair>
  <kind>Part</kind>
  <child><size>9</size></child>
  <anything class="Part"><size>1</size></anything>
</Inventory>
"#;

#[test]
fn every_shape_reads() {
    let s = shapes();
    let types = s.engine.types();
    let mut heap = Heap::new();
    let value = s.engine.read_simple(&mut heap, INVENTORY, s.inventory, "inventory.xml");
    assert!(s.sink.entries().is_empty(), "unexpected diagnostics: {:?}", s.sink.entries());
    let id = value.as_object().expect("inventory object");
    let field = |name: &str| heap.field(types, id, name).cloned().expect(name);

    assert_eq!(field("name"), Value::str("Pack"));
    assert_eq!(field("count"), Value::I32(3), "primitive text is trimmed");
    assert!(field("ratio").as_f64().is_some_and(f64::is_nan));
    assert_eq!(field("color"), Value::Enum(s.color, "Green".into()));

    let tags = heap.list(field("tags").as_object().expect("tags")).expect("list");
    assert_eq!(tags, &[Value::str("a"), Value::str("b")]);

    let (lengths, items) = heap.array(field("grid").as_object().expect("grid")).expect("array");
    assert_eq!(lengths, &[2, 2]);
    assert_eq!(items, &[Value::I32(1), Value::I32(2), Value::I32(3), Value::I32(4)], "arrays are row-major");

    let scores = heap.map(field("scores").as_object().expect("scores")).expect("map");
    assert_eq!(scores.get(&Value::str("x")), Some(&Value::I32(1)));
    assert_eq!(scores.get(&Value::str("y")), Some(&Value::I32(2)), "inline keys use the tag name");

    let flags = heap.set(field("flags").as_object().expect("flags")).expect("set");
    assert!(flags.contains(&Value::str("red")) && flags.contains(&Value::str("blue")));

    match field("pair") {
        Value::Tuple(_, items) => assert_eq!(items, vec![Value::I32(5), Value::str("five")]),
        other => panic!("expected a tuple, got {other:?}"),
    }
    assert_eq!(field("kind"), Value::Type(s.part));

    let child = field("child").as_object().expect("child");
    assert_eq!(heap.field(types, child, "size"), Some(&Value::I32(9)));
    let anything = field("anything").as_object().expect("anything");
    assert_eq!(heap.ty(anything), Some(s.part), "class attribute picks the concrete type");
}

#[test]
fn simple_documents_round_trip() {
    let s = shapes();
    let mut heap = Heap::new();
    let value = s.engine.read_simple(&mut heap, INVENTORY, s.inventory, "inventory.xml");
    let written = s.engine.write_simple(&mut heap, &value, s.inventory, "Inventory");
    let mut again = Heap::new();
    let back = s.engine.read_simple(&mut again, &written, s.inventory, "written.xml");
    assert!(s.sink.errors().is_empty(), "round trip reported {:?}\n{written}", s.sink.errors());
    assert!(heap.graph_eq(&value, &again, &back), "graphs differ after round trip:\n{written}");
}

#[test]
fn misspelled_field_gets_a_suggestion() {
    let s = shapes();
    let mut heap = Heap::new();
    s.engine.read_simple(&mut heap, "<Inventory><Name>x</Name><bogus>1</bogus></Inventory>", s.inventory, "typo.xml");
    assert_eq!(s.sink.count_errors_containing("did you mean `name`?"), 1);
    assert_eq!(s.sink.count_errors_containing("Field `bogus` does not exist"), 1);
}

#[test]
fn bad_leaf_text_keeps_previous_value() {
    let s = shapes();
    let mut heap = Heap::new();
    let value = s.engine.read_simple(
        &mut heap,
        "<Inventory><count>lots</count><color>Purple</color><name>a<b /></name></Inventory>",
        s.inventory,
        "bad.xml",
    );
    let id = value.as_object().expect("object still built");
    assert_eq!(heap.field(s.engine.types(), id, "count"), Some(&Value::I32(0)));
    assert_eq!(s.sink.count_errors_containing("is not a valid int"), 1);
    assert_eq!(s.sink.count_errors_containing("is not a member of enum"), 1);
    assert_eq!(s.sink.count_errors_containing("Cannot have both text and child nodes"), 1);
}

#[test]
fn null_attribute_and_conflicts() {
    let s = shapes();
    let mut heap = Heap::new();
    let value = s.engine.read_simple(
        &mut heap,
        r#"<Inventory><child null="true" /><tags null="true" mode="append" /><pair ref="r1" /></Inventory>"#,
        s.inventory,
        "null.xml",
    );
    let id = value.as_object().expect("object");
    assert_eq!(heap.field(s.engine.types(), id, "child"), Some(&Value::Null));
    assert_eq!(s.sink.count_errors_containing("cannot be combined"), 1);
    assert_eq!(s.sink.count_errors_containing("outside of a recorder document"), 1);
}

#[test]
fn ragged_arrays_are_padded() {
    let s = shapes();
    let mut heap = Heap::new();
    let value = s.engine.read_simple(
        &mut heap,
        "<Inventory><grid><li><li>1</li><li>2</li></li><li><li>3</li></li></grid></Inventory>",
        s.inventory,
        "ragged.xml",
    );
    let id = value.as_object().expect("object");
    let grid = heap.field(s.engine.types(), id, "grid").and_then(Value::as_object).expect("grid");
    let (lengths, items) = heap.array(grid).expect("array");
    assert_eq!(lengths, &[2, 2]);
    assert_eq!(items, &[Value::I32(1), Value::I32(2), Value::I32(3), Value::I32(0)]);
    assert_eq!(s.sink.count_errors_containing("padding or truncating"), 1);
}

#[test]
fn postponed_abstract_composite_is_reported_at_its_node() {
    let mut types = TypeRegistry::new();
    let outline = types.register_composite(ClassDef::new("Outline").abstract_class().field("x", TypeId::I32)).expect("outline");
    let sketch = types.register_composite(ClassDef::new("Sketch").field("outline", outline)).expect("sketch");
    let sink = CollectingSink::new();
    let settings = Settings { max_read_depth: 0, ..Settings::default() };
    let engine = Engine::with_settings(types, settings).with_sink(std::sync::Arc::new(sink.clone()));

    let mut heap = Heap::new();
    let value = engine.read_simple(&mut heap, "<Sketch>\n  <outline><x>1</x></outline>\n</Sketch>", sketch, "sketch.xml");
    let id = value.as_object().expect("the sketch itself is created");
    assert_eq!(heap.field(engine.types(), id, "outline"), Some(&Value::Null));
    assert_eq!(sink.count_errors_containing("sketch.xml:2: Cannot create an instance of `Outline`"), 1, "{:?}", sink.errors());
}
