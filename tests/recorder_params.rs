use std::sync::Arc;

use declad::recorder::{Factory, FactoryTable, Recordable};
use declad::types::{TypeId, TypeRegistry};
use declad::value::ObjectData;
use declad::{CollectingSink, Engine, Heap, Parameters, Recorder, Value};

#[derive(Debug, Default)]
struct Dog {
    name: String,
    trained: bool,
}

impl Recordable for Dog {
    fn record(&mut self, recorder: &mut Recorder<'_, '_>) {
        recorder.field(&mut self.name, "name");
        recorder.field(&mut self.trained, "trained");
    }
}

/// Builds its dog through a factory; `SHARED` also asks for sharing.
#[derive(Debug, Default)]
struct Kennel<const SHARED: bool> {
    dog: Value,
}

impl<const SHARED: bool> Recordable for Kennel<SHARED> {
    fn record(&mut self, recorder: &mut Recorder<'_, '_>) {
        let ty = recorder.types().resolve("Dog", &[]).unwrap_or(TypeId::OBJECT);
        let factory: Factory = Arc::new(|_: TypeId| Some(Box::new(Dog { name: "Rex".into(), trained: true }) as Box<dyn Recordable>));
        let mut table = FactoryTable::default();
        table.insert(ty, factory);
        let params = if SHARED { Parameters::new().shared().with_factory(table) } else { Parameters::new().with_factory(table) };
        recorder.record_with(&mut self.dog, "dog", ty, params);
    }
}

/// Stores its list directly in its own node.
#[derive(Debug, Default)]
struct Bag {
    items: Value,
}

impl Recordable for Bag {
    fn record(&mut self, recorder: &mut Recorder<'_, '_>) {
        let ty = recorder.types().resolve("List<int>", &[]).unwrap_or(TypeId::OBJECT);
        recorder.record_as_this(&mut self.items, ty);
    }
}

/// Records a field and then tries to record as `this` as well.
#[derive(Debug, Default)]
struct Muddled {
    count: i32,
    items: Value,
}

impl Recordable for Muddled {
    fn record(&mut self, recorder: &mut Recorder<'_, '_>) {
        let ty = recorder.types().resolve("List<int>", &[]).unwrap_or(TypeId::OBJECT);
        recorder.field(&mut self.count, "count");
        recorder.record_as_this(&mut self.items, ty);
    }
}

struct Params {
    engine: Engine,
    sink: CollectingSink,
    kennel: TypeId,
    conflicted_kennel: TypeId,
    bag: TypeId,
    muddled: TypeId,
    ints: TypeId,
}

fn params() -> Params {
    let mut types = TypeRegistry::new();
    let ints = types.list_of(TypeId::I32);
    types.register_recordable("Dog", None, Arc::new(|| Box::new(Dog::default()) as Box<dyn Recordable>)).expect("dog");
    let kennel = types
        .register_recordable("Kennel", None, Arc::new(|| Box::new(Kennel::<false>::default()) as Box<dyn Recordable>))
        .expect("kennel");
    let conflicted_kennel = types
        .register_recordable("SharedKennel", None, Arc::new(|| Box::new(Kennel::<true>::default()) as Box<dyn Recordable>))
        .expect("shared kennel");
    let bag = types.register_recordable("Bag", None, Arc::new(|| Box::new(Bag::default()) as Box<dyn Recordable>)).expect("bag");
    let muddled = types
        .register_recordable("Muddled", None, Arc::new(|| Box::new(Muddled::default()) as Box<dyn Recordable>))
        .expect("muddled");
    let sink = CollectingSink::new();
    let engine = Engine::new(types).with_sink(Arc::new(sink.clone()));
    Params { engine, sink, kennel, conflicted_kennel, bag, muddled, ints }
}

const KENNEL: &str = "<Record><recordFormatVersion>1</recordFormatVersion><data><dog><name>Fido</name></dog></data></Record>";

#[test]
fn factory_builds_the_instance_that_is_read_into() {
    let p = params();
    let mut heap = Heap::new();
    let value = p.engine.read(&mut heap, KENNEL, p.kennel);
    assert!(p.sink.entries().is_empty(), "unexpected diagnostics: {:?}", p.sink.entries());

    let kennel = heap.recordable::<Kennel<false>>(value.as_object().expect("kennel")).expect("kennel");
    let dog = heap.recordable::<Dog>(kennel.dog.as_object().expect("dog")).expect("dog");
    assert_eq!(dog.name, "Fido", "document data overrides the factory's");
    assert!(dog.trained, "fields the document leaves out keep the factory's value");
}

#[test]
fn factory_and_sharing_cannot_be_combined() {
    let p = params();
    let mut heap = Heap::new();
    let value = p.engine.read(&mut heap, KENNEL, p.conflicted_kennel);
    assert_eq!(p.sink.count_errors_containing("`shared` and `with_factory` cannot be combined; dropping `shared`"), 1);

    let kennel = heap.recordable::<Kennel<true>>(value.as_object().expect("kennel")).expect("kennel");
    let dog = heap.recordable::<Dog>(kennel.dog.as_object().expect("dog")).expect("dog");
    assert!(dog.trained, "the factory still applies");
}

#[test]
fn record_as_this_uses_the_holders_node() {
    let p = params();
    let mut heap = Heap::new();
    let items = heap.alloc(p.ints, ObjectData::List(vec![Value::I32(1), Value::I32(2)]));
    let bag = heap.alloc(p.bag, ObjectData::Recordable(Box::new(Bag { items: Value::Object(items) })));

    let text = p.engine.write(&mut heap, &Value::Object(bag), p.bag);
    assert!(text.contains("<li>2</li>"), "{text}");
    assert!(!text.contains("<items>"), "no wrapper element:\n{text}");

    let mut again = Heap::new();
    let back = p.engine.read(&mut again, &text, p.bag);
    assert!(p.sink.errors().is_empty(), "{:?}", p.sink.errors());
    let bag = again.recordable::<Bag>(back.as_object().expect("bag")).expect("bag");
    assert_eq!(again.list(bag.items.as_object().expect("items")), Some(&[Value::I32(1), Value::I32(2)][..]));
}

#[test]
fn record_as_this_must_stand_alone() {
    let p = params();
    let mut heap = Heap::new();
    let text = "<Record><recordFormatVersion>1</recordFormatVersion><data><count>3</count></data></Record>";
    let value = p.engine.read(&mut heap, text, p.muddled);
    assert_eq!(p.sink.count_errors_containing("Recording as `this` must be the only record call"), 1);
    let muddled = heap.recordable::<Muddled>(value.as_object().expect("muddled")).expect("muddled");
    assert_eq!(muddled.count, 3);
    assert_eq!(muddled.items, Value::Null);
}
