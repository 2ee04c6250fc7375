// codec_benchmark.rs - Performance benchmarks for the CIP codec
// =========================================================================
//
// Measures encode/decode throughput of the type system over elementary
// values, arrays and bit-packed structures.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use logix_cip::{ArrayLength, CipType, Elementary, StructValue, TagValue};
use logix_cip::types::{StructMember, StructType};

fn sample_struct(bool_count: usize) -> Arc<StructType> {
    let mut members = vec![
        StructMember {
            name: "Count".to_string(),
            typ: CipType::Elementary(Elementary::Dint),
            offset: 0,
            bit: None,
            hidden: false,
        },
        StructMember {
            name: "Rate".to_string(),
            typ: CipType::Elementary(Elementary::Real),
            offset: 4,
            bit: None,
            hidden: false,
        },
        StructMember {
            name: "ZZZZZZZZZZHost0".to_string(),
            typ: CipType::Elementary(Elementary::Dint),
            offset: 8,
            bit: None,
            hidden: true,
        },
    ];
    for i in 0..bool_count {
        members.push(StructMember {
            name: format!("Flag{i:02}"),
            typ: CipType::Elementary(Elementary::Bool),
            offset: 8,
            bit: Some(i as u16),
            hidden: false,
        });
    }
    Arc::new(StructType {
        name: "BenchData".to_string(),
        members,
        size: 12,
        handle: 0x0042,
        string_capacity: None,
    })
}

fn sample_value(struct_type: &StructType) -> TagValue {
    let mut fields = StructValue::new();
    fields.set("Count", TagValue::Dint(123_456));
    fields.set("Rate", TagValue::Real(98.6));
    for member in &struct_type.members {
        if member.bit.is_some() {
            fields.set(&member.name, TagValue::Bool(member.bit.unwrap() % 2 == 0));
        }
    }
    TagValue::Struct(fields)
}

fn benchmark_elementary_roundtrip(c: &mut Criterion) {
    let dint = CipType::Elementary(Elementary::Dint);
    let lreal = CipType::Elementary(Elementary::Lreal);

    c.bench_function("encode_dint", |b| {
        b.iter(|| dint.encode(black_box(&TagValue::Dint(42))).unwrap())
    });
    c.bench_function("decode_lreal", |b| {
        let bytes = lreal.encode(&TagValue::Lreal(3.14159)).unwrap();
        b.iter(|| {
            let mut cursor = black_box(bytes.as_slice());
            lreal.decode(&mut cursor).unwrap()
        })
    });
}

fn benchmark_array_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("array_decode");

    for element_count in [10usize, 100, 1000].iter() {
        let array = CipType::Array {
            element: Box::new(CipType::Elementary(Elementary::Dint)),
            length: ArrayLength::Fixed(*element_count),
        };
        let value = TagValue::List(
            (0..*element_count as i32).map(TagValue::Dint).collect(),
        );
        let encoded = array.encode(&value).unwrap();

        group.bench_with_input(
            BenchmarkId::new("dint_array", element_count),
            element_count,
            |b, _| {
                b.iter(|| {
                    let mut cursor = black_box(encoded.as_slice());
                    array.decode(&mut cursor).unwrap()
                })
            },
        );
    }

    group.finish();
}

fn benchmark_struct_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("struct_roundtrip");

    for bool_count in [4usize, 16, 32].iter() {
        let struct_type = sample_struct(*bool_count);
        let typ = CipType::Struct(struct_type.clone());
        let value = sample_value(&struct_type);
        let encoded = typ.encode(&value).unwrap();

        group.bench_with_input(
            BenchmarkId::new("encode", bool_count),
            bool_count,
            |b, _| b.iter(|| typ.encode(black_box(&value)).unwrap()),
        );
        group.bench_with_input(
            BenchmarkId::new("decode", bool_count),
            bool_count,
            |b, _| {
                b.iter(|| {
                    let mut cursor = black_box(encoded.as_slice());
                    typ.decode(&mut cursor).unwrap()
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_elementary_roundtrip,
    benchmark_array_decode,
    benchmark_struct_roundtrip
);
criterion_main!(benches);
