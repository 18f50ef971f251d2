use std::any::Any;
use std::sync::Arc;

use declad::convert::{ConvertError, ConvertResult, Converter, FactoryConverter, RecordConverter, StringConverter};
use declad::recorder::Recordable;
use declad::types::{ClassDef, TypeId, TypeRegistry};
use declad::value::NativeBox;
use declad::{CollectingSink, Engine, Heap, Parameters, Recorder, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Point(i32, i32);

struct PointText;

impl StringConverter for PointText {
    fn read(&self, text: &str, _ty: TypeId) -> ConvertResult<NativeBox> {
        let (x, y) = text.split_once(',').ok_or_else(|| ConvertError::new(format!("`{text}` is not a point")))?;
        let parse = |s: &str| s.trim().parse::<i32>().map_err(|e| ConvertError::new(e.to_string()));
        Ok(Box::new(Point(parse(x)?, parse(y)?)))
    }

    fn write(&self, value: &dyn Any, _ty: TypeId) -> ConvertResult<String> {
        let point = value.downcast_ref::<Point>().ok_or_else(|| ConvertError::new("not a point"))?;
        Ok(format!("{},{}", point.0, point.1))
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Rgb {
    r: u8,
    g: u8,
    b: u8,
}

struct RgbFields;

impl RecordConverter for RgbFields {
    fn create(&self, _ty: TypeId) -> NativeBox {
        Box::new(Rgb::default())
    }

    fn record(&self, value: &mut dyn Any, _ty: TypeId, recorder: &mut Recorder<'_, '_>) -> ConvertResult<()> {
        let rgb = value.downcast_mut::<Rgb>().ok_or_else(|| ConvertError::new("not a color"))?;
        recorder.field(&mut rgb.r, "r");
        recorder.field(&mut rgb.g, "g");
        recorder.field(&mut rgb.b, "b");
        Ok(())
    }
}

/// Needs its `id` before it can exist; `notes` may change afterwards.
#[derive(Debug, PartialEq)]
struct Ticket {
    id: u32,
    notes: String,
}

struct TicketFactory;

impl FactoryConverter for TicketFactory {
    fn create(&self, _ty: TypeId, recorder: &mut Recorder<'_, '_>) -> ConvertResult<NativeBox> {
        let mut id = 0u32;
        recorder.field(&mut id, "id");
        if id == 0 {
            return Err(ConvertError::new("ticket without id"));
        }
        Ok(Box::new(Ticket { id, notes: String::new() }))
    }

    fn read(&self, value: &mut dyn Any, _ty: TypeId, recorder: &mut Recorder<'_, '_>) -> ConvertResult<()> {
        let ticket = value.downcast_mut::<Ticket>().ok_or_else(|| ConvertError::new("not a ticket"))?;
        recorder.ignore("id");
        recorder.field(&mut ticket.notes, "notes");
        Ok(())
    }

    fn write(&self, value: &dyn Any, _ty: TypeId, recorder: &mut Recorder<'_, '_>) -> ConvertResult<()> {
        let ticket = value.downcast_ref::<Ticket>().ok_or_else(|| ConvertError::new("not a ticket"))?;
        let (mut id, mut notes) = (ticket.id, ticket.notes.clone());
        recorder.field(&mut id, "id");
        recorder.field(&mut notes, "notes");
        Ok(())
    }
}

/// Tries to pull a shared reference in while constructing.
struct Greedy;

impl FactoryConverter for Greedy {
    fn create(&self, _ty: TypeId, recorder: &mut Recorder<'_, '_>) -> ConvertResult<NativeBox> {
        let mut link = Value::Null;
        recorder.record_with(&mut link, "link", TypeId::OBJECT, Parameters::new().shared());
        Ok(Box::new(link.is_null()))
    }

    fn read(&self, _value: &mut dyn Any, _ty: TypeId, recorder: &mut Recorder<'_, '_>) -> ConvertResult<()> {
        recorder.ignore("link");
        Ok(())
    }

    fn write(&self, _value: &dyn Any, _ty: TypeId, _recorder: &mut Recorder<'_, '_>) -> ConvertResult<()> {
        Ok(())
    }
}

/// Panics as soon as it is asked for an instance.
struct Shattering;

impl FactoryConverter for Shattering {
    fn create(&self, _ty: TypeId, _recorder: &mut Recorder<'_, '_>) -> ConvertResult<NativeBox> {
        panic!("shattered")
    }

    fn read(&self, _value: &mut dyn Any, _ty: TypeId, _recorder: &mut Recorder<'_, '_>) -> ConvertResult<()> {
        Ok(())
    }

    fn write(&self, _value: &dyn Any, _ty: TypeId, _recorder: &mut Recorder<'_, '_>) -> ConvertResult<()> {
        Ok(())
    }
}

struct Crumbling;

impl RecordConverter for Crumbling {
    fn create(&self, _ty: TypeId) -> NativeBox {
        panic!("crumbled")
    }

    fn record(&self, _value: &mut dyn Any, _ty: TypeId, _recorder: &mut Recorder<'_, '_>) -> ConvertResult<()> {
        Ok(())
    }
}

/// Holds one shared object of each fragile kind.
#[derive(Debug, Default)]
struct Shelf {
    vase: Value,
    cookie: Value,
}

impl Recordable for Shelf {
    fn record(&mut self, recorder: &mut Recorder<'_, '_>) {
        let vase = recorder.types().resolve("Vase", &[]).unwrap_or(TypeId::OBJECT);
        let cookie = recorder.types().resolve("Cookie", &[]).unwrap_or(TypeId::OBJECT);
        recorder.record_with(&mut self.vase, "vase", vase, Parameters::new().shared());
        recorder.record_with(&mut self.cookie, "cookie", cookie, Parameters::new().shared());
    }
}

struct Converted {
    engine: Engine,
    sink: CollectingSink,
    holder: TypeId,
    point: TypeId,
}

fn converted() -> Converted {
    let mut types = TypeRegistry::new();
    let point = types.register_native("Point").expect("point");
    let rgb = types.register_native("Rgb").expect("rgb");
    let ticket = types.register_native("Ticket").expect("ticket");
    let greedy = types.register_native("Greedy").expect("greedy");
    let holder = types
        .register_composite(
            ClassDef::new("Holder").field("at", point).field("tint", rgb).field("ticket", ticket).field("greedy", greedy),
        )
        .expect("holder");
    let sink = CollectingSink::new();
    let mut engine = Engine::new(types).with_sink(Arc::new(sink.clone()));
    engine.register_converter(&[point], Converter::string(PointText));
    engine.register_converter(&[rgb], Converter::record(RgbFields));
    engine.register_converter(&[ticket], Converter::factory(TicketFactory));
    engine.register_converter(&[greedy], Converter::factory(Greedy));
    Converted { engine, sink, holder, point }
}

const HOLDER: &str = "<Holder><at>3, -4</at><tint><r>255</r><b>9</b></tint><ticket><id>42</id><notes>urgent</notes></ticket></Holder>";

#[test]
fn each_converter_shape_reads() {
    let c = converted();
    let mut heap = Heap::new();
    let value = c.engine.read_simple(&mut heap, HOLDER, c.holder, "holder.xml");
    assert!(c.sink.entries().is_empty(), "unexpected diagnostics: {:?}", c.sink.entries());

    let holder = value.as_object().expect("holder");
    let field = |name: &str| heap.field(c.engine.types(), holder, name).and_then(Value::as_object).expect(name);
    assert_eq!(heap.native::<Point>(field("at")), Some(&Point(3, -4)));
    assert_eq!(heap.native::<Rgb>(field("tint")), Some(&Rgb { r: 255, g: 0, b: 9 }));
    assert_eq!(heap.native::<Ticket>(field("ticket")), Some(&Ticket { id: 42, notes: "urgent".into() }));
}

#[test]
fn converted_values_write_back() {
    let c = converted();
    let mut heap = Heap::new();
    let value = c.engine.read_simple(&mut heap, HOLDER, c.holder, "holder.xml");
    let text = c.engine.write_simple(&mut heap, &value, c.holder, "Holder");
    assert!(text.contains("<at>3,-4</at>"), "string converter output:\n{text}");

    let mut again = Heap::new();
    let back = c.engine.read_simple(&mut again, &text, c.holder, "written.xml");
    assert!(c.sink.errors().is_empty(), "{:?}\n{text}", c.sink.errors());
    let ticket = again.field(c.engine.types(), back.as_object().expect("holder"), "ticket").and_then(Value::as_object).expect("ticket");
    assert_eq!(again.native::<Ticket>(ticket), Some(&Ticket { id: 42, notes: "urgent".into() }));
}

#[test]
fn converter_errors_are_reported() {
    let c = converted();
    let mut heap = Heap::new();
    let value = c.engine.read_simple(
        &mut heap,
        "<Holder><at>nowhere</at><ticket><notes>lost</notes></ticket></Holder>",
        c.holder,
        "broken.xml",
    );
    assert_eq!(c.sink.count_errors_containing("`nowhere` is not a point"), 1);
    let exceptions = c.sink.exceptions();
    assert_eq!(exceptions.len(), 1, "{exceptions:?}");
    assert!(exceptions[0].message.contains("converter for `Ticket` failed: ticket without id"));
    let holder = value.as_object().expect("holder");
    assert_eq!(heap.field(c.engine.types(), holder, "ticket"), Some(&Value::Null));
}

#[test]
fn factory_construction_refuses_shared_references() {
    let c = converted();
    let mut heap = Heap::new();
    c.engine.read_simple(&mut heap, "<Holder><greedy><link null=\"true\" /></greedy></Holder>", c.holder, "t.xml");
    assert_eq!(c.sink.count_errors_containing("Shared references cannot be used while a factory converter"), 1);
}

#[test]
fn first_registration_wins() {
    let mut c = converted();
    c.engine.register_converter(&[c.point], Converter::string(PointText));
    assert_eq!(c.sink.count_errors_containing("Type `Point` already has a converter"), 1);
    c.engine.register_converter(&[], Converter::string(PointText));
    assert_eq!(c.sink.count_errors_containing("registered for no types"), 1);
}

#[test]
fn panicking_constructors_of_shared_objects_are_contained() {
    let mut types = TypeRegistry::new();
    let vase = types.register_native("Vase").expect("vase");
    let cookie = types.register_native("Cookie").expect("cookie");
    let shelf = types.register_recordable("Shelf", None, Arc::new(|| Box::new(Shelf::default()) as Box<dyn Recordable>)).expect("shelf");
    let sink = CollectingSink::new();
    let mut engine = Engine::new(types).with_sink(Arc::new(sink.clone()));
    engine.register_converter(&[vase], Converter::factory(Shattering));
    engine.register_converter(&[cookie], Converter::record(Crumbling));

    let text = r#"<Record>
        <recordFormatVersion>1</recordFormatVersion>
        <refs>
            <Ref id="ref00000" class="Vase"><color>blue</color></Ref>
            <Ref id="ref00001" class="Cookie" />
        </refs>
        <data><vase ref="ref00000" /><cookie ref="ref00001" /></data>
    </Record>"#;
    let mut heap = Heap::new();
    let value = engine.read(&mut heap, text, shelf);

    let exceptions = sink.exceptions();
    assert_eq!(exceptions.len(), 2, "{exceptions:?}");
    assert!(exceptions[0].message.contains("converter for `Vase` panicked: shattered"));
    assert!(exceptions[1].message.contains("converter for `Cookie` panicked: crumbled"));
    assert_eq!(sink.count_errors_containing("Couldn't find reference with id"), 2);
    let shelf = heap.recordable::<Shelf>(value.as_object().expect("the rest of the document still reads")).expect("shelf");
    assert_eq!(shelf.vase, Value::Null);
    assert_eq!(shelf.cookie, Value::Null);
}
