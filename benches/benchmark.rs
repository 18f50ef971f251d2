use std::fmt::Write;
use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use declad::diag::init_tracing;
use declad::recorder::Recordable;
use declad::types::{ClassDef, TypeId, TypeRegistry};
use declad::value::ObjectData;
use declad::{CollectingSink, Engine, Heap, Parameters, Recorder, Value};

// ------------- Records -------------

fn record_types() -> TypeRegistry {
    let mut types = TypeRegistry::new();
    let tags = types.list_of(TypeId::STRING);
    let stats = types.map_of(TypeId::STRING, TypeId::I32);
    types
        .register_record(ClassDef::new("Unit").field("hp", TypeId::I32).field("tags", tags).field("stats", stats))
        .expect("unit");
    types
}

/// `count` concrete units, each inheriting from one of ten abstract bases,
/// plus a balance module that patches every base.
fn record_modules(count: usize) -> (String, String) {
    let mut core = String::from("<Decs>\n");
    let mut balance = String::from("<Decs>\n");
    for base in 0..10 {
        let _ = writeln!(core, r#"<Unit decName="Base{base}" abstract="true"><hp>{base}</hp><tags><li>base</li></tags></Unit>"#);
        let _ = writeln!(balance, r#"<Unit decName="Base{base}"><stats mode="patch"><armor>{base}</armor></stats></Unit>"#);
    }
    for n in 0..count {
        let _ = writeln!(core, r#"<Unit decName="Unit{n}" parent="Base{}"><stats><speed>{n}</speed></stats></Unit>"#, n % 10);
    }
    core.push_str("</Decs>\n");
    balance.push_str("</Decs>\n");
    (core, balance)
}

fn load(core: &str, balance: &str) -> Engine {
    let mut engine = Engine::new(record_types()).with_sink(Arc::new(CollectingSink::new()));
    let mut loader = engine.loader();
    loader.create_module("core").add_string(core, "units.xml").expect("core");
    loader.create_module("balance").add_string(balance, "balance.xml").expect("balance");
    loader.finish();
    engine
}

// ------------- Chains -------------

#[derive(Debug, Default)]
struct Link {
    value: i32,
    next: Value,
}

impl Recordable for Link {
    fn record(&mut self, recorder: &mut Recorder<'_, '_>) {
        let ty = recorder.types().resolve("Link", &[]).unwrap_or(TypeId::OBJECT);
        recorder.field(&mut self.value, "value");
        recorder.record_with(&mut self.next, "next", ty, Parameters::new().shared());
    }
}

fn chain(len: i32) -> (Engine, Heap, Value, TypeId) {
    let mut types = TypeRegistry::new();
    let ty = types.register_recordable("Link", None, Arc::new(|| Box::new(Link::default()) as Box<dyn Recordable>)).expect("link");
    let engine = Engine::new(types).with_sink(Arc::new(CollectingSink::new()));
    let mut heap = Heap::new();
    let mut next = Value::Null;
    for value in (0..len).rev() {
        next = Value::Object(heap.alloc(ty, ObjectData::Recordable(Box::new(Link { value, next }))));
    }
    (engine, heap, next, ty)
}

pub fn criterion_benchmark(c: &mut Criterion) {
    init_tracing("warn");

    let (core, balance) = record_modules(1_000);
    c.bench_function("load 1k records", |b| b.iter(|| black_box(load(&core, &balance))));

    let mut engine = load(&core, &balance);
    c.bench_function("compose 1k records", |b| b.iter(|| black_box(engine.compose_records())));

    let (engine, mut heap, head, ty) = chain(10_000);
    let text = engine.write(&mut heap, &head, ty);
    println!("chain document: {} bytes", text.len());
    c.bench_function("write 10k chain", |b| b.iter(|| black_box(engine.write(&mut heap, &head, ty))));
    c.bench_function("read 10k chain", |b| {
        b.iter(|| {
            let mut fresh = Heap::new();
            black_box(engine.read(&mut fresh, &text, ty))
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
