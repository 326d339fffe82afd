//! Property tests for the value codec

use isolink_core::{
    deserialize, serialize, BufferRef, CodecOptions, ExecutionUnitId, HandleBridge, HandleId,
    NativeResource, Value, ValueMap,
};
use proptest::prelude::*;

// Handles in one generated value share a bridge, so repeated ids resolve to
// the same live proxy
fn handle(bridge: HandleBridge) -> impl Strategy<Value = Value> {
    (1i64..8).prop_map(move |id| {
        Value::Handle(bridge.attach(ExecutionUnitId::new(1), HandleId::new(id), NativeResource::new(id)))
    })
}

fn leaf(bridge: HandleBridge) -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::I64),
        (-1.0e12f64..1.0e12).prop_map(Value::F64),
        ".{0,16}".prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(|b| Value::Buffer(BufferRef::new(b))),
        handle(bridge),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    leaf(HandleBridge::new()).prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
            prop::collection::vec((inner.clone(), inner), 0..8)
                .prop_map(|entries| Value::Map(entries.into_iter().collect::<ValueMap>())),
        ]
    })
}

proptest! {
    #[test]
    fn codec_roundtrip(v in value()) {
        let options = CodecOptions::default();
        let encoded = serialize(&v, &options).unwrap();
        let decoded = deserialize(&encoded.bytes, &encoded.attachments, &options).unwrap();
        prop_assert_eq!(decoded, v);
    }

    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = deserialize(&bytes, &[], &CodecOptions::default());
    }
}
