use super::*;

fn roundtrip(value: &PlistValue) -> PlistValue {
    let bytes = encode(value).unwrap();
    decode(&bytes).unwrap()
}

#[test]
fn roundtrip_scalars() {
    assert_eq!(roundtrip(&PlistValue::Boolean(true)), PlistValue::Boolean(true));
    assert_eq!(roundtrip(&PlistValue::Integer(0)), PlistValue::Integer(0));
    assert_eq!(roundtrip(&PlistValue::Integer(352)), PlistValue::Integer(352));
    assert_eq!(
        roundtrip(&PlistValue::Integer(0x40000)),
        PlistValue::Integer(0x40000)
    );
    assert_eq!(roundtrip(&PlistValue::Integer(-1)), PlistValue::Integer(-1));
    assert_eq!(
        roundtrip(&PlistValue::String("timingProtocol".into())),
        PlistValue::String("timingProtocol".into())
    );
    assert_eq!(
        roundtrip(&PlistValue::Data(vec![1, 2, 3])),
        PlistValue::Data(vec![1, 2, 3])
    );
}

#[test]
fn roundtrip_real() {
    match roundtrip(&PlistValue::Real(44100.5)) {
        PlistValue::Real(f) => assert!((f - 44100.5).abs() < f64::EPSILON),
        other => panic!("expected Real, got {other:?}"),
    }
}

#[test]
fn roundtrip_unicode_string() {
    let s = "Küche Lautsprecher";
    assert_eq!(
        roundtrip(&PlistValue::String(s.into())),
        PlistValue::String(s.into())
    );
}

#[test]
fn roundtrip_long_data() {
    // Length does not fit the marker nibble
    let data = vec![0xabu8; 5000];
    assert_eq!(
        roundtrip(&PlistValue::Data(data.clone())),
        PlistValue::Data(data)
    );
}

#[test]
fn roundtrip_setup_shaped_dict() {
    let streams = PlistValue::Array(vec![
        DictBuilder::new()
            .insert("type", 96)
            .insert("audioFormat", 0x40000)
            .insert("spf", 352)
            .insert("shk", PlistValue::Data(vec![0u8; 32]))
            .build(),
    ]);

    let setup = DictBuilder::new()
        .insert("streams", streams)
        .insert("timingProtocol", "PTP")
        .insert("sessionUUID", "ABCD-1234")
        .insert("osName", "tonecast")
        .build();

    let back = roundtrip(&setup);
    assert_eq!(back.get("timingProtocol").and_then(PlistValue::as_str), Some("PTP"));

    let stream = &back.get("streams").and_then(PlistValue::as_array).unwrap()[0];
    assert_eq!(stream.get("audioFormat").and_then(PlistValue::as_i64), Some(0x40000));
    assert_eq!(stream.get("spf").and_then(PlistValue::as_i64), Some(352));
    assert_eq!(
        stream.get("shk").and_then(PlistValue::as_bytes).map(<[u8]>::len),
        Some(32)
    );
}

#[test]
fn roundtrip_empty_dict_and_array() {
    assert_eq!(
        roundtrip(&PlistValue::Dictionary(Default::default())),
        PlistValue::Dictionary(Default::default())
    );
    assert_eq!(
        roundtrip(&PlistValue::Array(Vec::new())),
        PlistValue::Array(Vec::new())
    );
}

#[test]
fn decode_rejects_garbage() {
    assert!(decode(b"not a plist at all............................").is_err());
    assert!(decode(&[]).is_err());

    // Valid magic, truncated trailer
    let mut data = b"bplist00".to_vec();
    data.extend_from_slice(&[0u8; 10]);
    assert!(decode(&data).is_err());
}

#[test]
fn decode_rejects_dangling_reference() {
    // Encode a small dict, then corrupt the root object index in the trailer
    let bytes = encode(&DictBuilder::new().insert("a", 1).build()).unwrap();
    let mut corrupted = bytes.clone();
    let root_pos = corrupted.len() - 16;
    corrupted[root_pos..root_pos + 8].copy_from_slice(&u64::to_be_bytes(999));
    assert!(decode(&corrupted).is_err());
}

#[test]
fn encoded_dict_is_deterministic() {
    let dict = DictBuilder::new()
        .insert("b", 2)
        .insert("a", 1)
        .insert("c", 3)
        .build();
    assert_eq!(encode(&dict).unwrap(), encode(&dict).unwrap());
}
