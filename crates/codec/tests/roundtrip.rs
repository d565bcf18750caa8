use bytes::Bytes;
use codec::{
    Container, DataType, DatumId, Multiset, StructField, StructRegistry, StructType, StructTypeId,
    StructValue, Value,
};
use quickcheck::{Arbitrary, Gen};

// A generated value paired with the registry its struct instances need.
#[derive(Debug, Clone)]
struct AnyValue(Value);

fn test_registry() -> StructRegistry {
    let mut registry = StructRegistry::new();
    registry
        .register(
            StructTypeId(1),
            StructType {
                name: "pair".to_string(),
                fields: vec![
                    StructField {
                        name: "first".to_string(),
                        val_type: DataType::Integer,
                    },
                    StructField {
                        name: "second".to_string(),
                        val_type: DataType::String,
                    },
                ],
            },
        )
        .unwrap();
    registry
}

fn arbitrary_scalar(g: &mut Gen) -> Value {
    match u8::arbitrary(g) % 6 {
        0 => Value::Null,
        1 => Value::Integer(i64::arbitrary(g)),
        // NaN never compares equal; stick to finite floats.
        2 => Value::Float(i32::arbitrary(g) as f64 / 16.0),
        3 => Value::String(String::arbitrary(g)),
        4 => Value::Blob(Bytes::from(Vec::<u8>::arbitrary(g))),
        _ => Value::Ref(DatumId(i64::arbitrary(g))),
    }
}

fn scalar_type(g: &mut Gen) -> DataType {
    *g.choose(&[
        DataType::Integer,
        DataType::Float,
        DataType::String,
        DataType::Blob,
        DataType::Ref,
    ])
    .unwrap()
}

fn typed_scalar(ty: DataType, g: &mut Gen) -> Value {
    match ty {
        DataType::Integer => Value::Integer(i64::arbitrary(g)),
        DataType::Float => Value::Float(i32::arbitrary(g) as f64 / 16.0),
        DataType::String => Value::String(String::arbitrary(g)),
        DataType::Blob => Value::Blob(Bytes::from(Vec::<u8>::arbitrary(g))),
        DataType::Ref => Value::Ref(DatumId(i64::arbitrary(g))),
        _ => unreachable!(),
    }
}

impl Arbitrary for AnyValue {
    fn arbitrary(g: &mut Gen) -> Self {
        let value = match u8::arbitrary(g) % 4 {
            0 | 1 => arbitrary_scalar(g),
            2 => {
                let val_type = scalar_type(g);
                let mut c = Container::new(DataType::String, val_type);
                for _ in 0..(usize::arbitrary(g) % 6) {
                    c.members
                        .insert(Vec::<u8>::arbitrary(g).into(), Some(typed_scalar(val_type, g)));
                }
                Value::Container(c)
            }
            _ => {
                let elem_type = scalar_type(g);
                let mut m = Multiset::new(elem_type);
                for _ in 0..(usize::arbitrary(g) % 6) {
                    m.elems.push(typed_scalar(elem_type, g));
                }
                Value::Multiset(m)
            }
        };
        AnyValue(value)
    }
}

#[quickcheck_macros::quickcheck]
fn pack_then_unpack_is_identity(value: AnyValue) -> bool {
    let registry = test_registry();
    let bytes = codec::packed(&value.0);
    let unpacked = codec::unpack(value.0.data_type(), &bytes, &registry).unwrap();
    unpacked == value.0
}

#[test]
fn struct_values_round_trip_through_registry() {
    let registry = test_registry();
    let value = Value::Struct(StructValue {
        struct_type: StructTypeId(1),
        fields: vec![Some(Value::Integer(-4)), Some(Value::String("x".into()))],
    });
    let bytes = codec::packed(&value);
    assert_eq!(codec::unpack(DataType::Struct, &bytes, &registry).unwrap(), value);
}
