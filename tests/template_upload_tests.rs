// template_upload_tests.rs - Integration tests for template parsing
// =========================================================================
//
// Exercises the full offline path of the template uploader: raw Template
// Object bytes -> parsed definition -> structure descriptor -> codec.

use logix_cip::tag_manager::{
    build_struct_type, elementary_member_type, parse_template, parse_template_attributes,
    MemberInfo, ParsedTemplate, TemplateHeader,
};
use logix_cip::{CipType, EipError, StructValue, TagValue};

/// Builds one 8-byte template member record.
fn member_record(info: u16, type_code: u16, offset: u32) -> Vec<u8> {
    let mut rec = Vec::with_capacity(8);
    rec.extend_from_slice(&info.to_le_bytes());
    rec.extend_from_slice(&type_code.to_le_bytes());
    rec.extend_from_slice(&offset.to_le_bytes());
    rec
}

fn resolve_elementary(code: u16) -> Result<CipType, EipError> {
    elementary_member_type(code)
        .ok_or_else(|| EipError::TypeLookup(format!("unexpected nested type 0x{code:04X}")))
}

/// A realistic UDT: a DINT, a REAL, three BOOLs bit-packed into a hidden
/// SINT host, and a DINT[4] array, padded to 28 bytes.
fn recipe_template() -> (ParsedTemplate, TemplateHeader) {
    let mut data = Vec::new();
    data.extend_from_slice(&member_record(0, 0x00C4, 0)); // Batches: DINT
    data.extend_from_slice(&member_record(0, 0x00CA, 4)); // Temp: REAL
    data.extend_from_slice(&member_record(0, 0x00C2, 8)); // host SINT (hidden)
    data.extend_from_slice(&member_record(0, 0x00C1, 8)); // Enabled: BOOL bit 0
    data.extend_from_slice(&member_record(1, 0x00C1, 8)); // Paused: BOOL bit 1
    data.extend_from_slice(&member_record(7, 0x00C1, 8)); // Faulted: BOOL bit 7
    data.extend_from_slice(&member_record(4, 0x00C4, 12)); // Steps: DINT[4]
    data.extend_from_slice(
        b"Recipe;n_8a7f001\0Batches\0Temp\0ZZZZZZZZZZRecipe5\0Enabled\0Paused\0Faulted\0Steps\0",
    );

    let header = TemplateHeader {
        definition_size_words: 40,
        structure_size: 28,
        member_count: 7,
        structure_handle: 0xB00B,
    };
    let parsed = parse_template(&data, header.member_count, 0x0234).unwrap();
    (parsed, header)
}

#[test]
fn test_template_parse_names_and_records() {
    let (parsed, _) = recipe_template();
    assert_eq!(parsed.name, "Recipe");
    assert_eq!(parsed.members.len(), 7);
    assert_eq!(parsed.members[0].0, "Batches");
    assert_eq!(
        parsed.members[6].1,
        MemberInfo {
            info: 4,
            type_code: 0x00C4,
            offset: 12
        }
    );
}

#[test]
fn test_struct_descriptor_layout() {
    let (parsed, header) = recipe_template();
    let recipe = build_struct_type(&parsed, &header, 0x0234, resolve_elementary).unwrap();

    assert_eq!(recipe.size, 28);
    assert_eq!(recipe.handle, 0xB00B);
    assert_eq!(
        recipe.attributes(),
        vec!["Batches", "Temp", "Enabled", "Paused", "Faulted", "Steps"]
    );
    // bit members carry their bit positions
    assert_eq!(recipe.members[3].bit, Some(0));
    assert_eq!(recipe.members[4].bit, Some(1));
    assert_eq!(recipe.members[5].bit, Some(7));
    // host member is retained but hidden
    assert!(recipe.members[2].hidden);
    assert_eq!(recipe.string_capacity, None);
}

#[test]
fn test_uploaded_struct_roundtrip() {
    let (parsed, header) = recipe_template();
    let recipe = build_struct_type(&parsed, &header, 0x0234, resolve_elementary).unwrap();
    let typ = CipType::Struct(recipe.into());

    let value = TagValue::Struct(
        [
            ("Batches", TagValue::Dint(3)),
            ("Temp", TagValue::Real(72.5)),
            ("Enabled", TagValue::Bool(true)),
            ("Paused", TagValue::Bool(false)),
            ("Faulted", TagValue::Bool(true)),
            (
                "Steps",
                TagValue::List(vec![
                    TagValue::Dint(10),
                    TagValue::Dint(20),
                    TagValue::Dint(30),
                    TagValue::Dint(40),
                ]),
            ),
        ]
        .into_iter()
        .collect::<StructValue>(),
    );

    let encoded = typ.encode(&value).unwrap();
    assert_eq!(encoded.len(), 28);
    // Enabled (bit 0) and Faulted (bit 7) set in the host byte
    assert_eq!(encoded[8], 0b1000_0001);

    let mut cursor = encoded.as_slice();
    let decoded = typ.decode(&mut cursor).unwrap();
    assert_eq!(decoded, value);
    assert!(cursor.is_empty());
}

#[test]
fn test_string_template_becomes_string_alias() {
    let mut data = Vec::new();
    data.extend_from_slice(&member_record(0, 0x00C4, 0)); // LEN
    data.extend_from_slice(&member_record(20, 0x00C2, 4)); // DATA: SINT[20]
    data.extend_from_slice(b"MyStr;n_0\0LEN\0DATA\0");

    let header = TemplateHeader {
        definition_size_words: 12,
        structure_size: 24,
        member_count: 2,
        structure_handle: 0x0FCE,
    };
    let parsed = parse_template(&data, 2, 0x0345).unwrap();
    let my_str = build_struct_type(&parsed, &header, 0x0345, resolve_elementary).unwrap();
    assert_eq!(my_str.string_capacity, Some(20));

    // string aliases encode and decode as plain strings end to end
    let typ = CipType::Struct(my_str.into());
    let encoded = typ.encode(&TagValue::String("hi".into())).unwrap();
    assert_eq!(encoded.len(), 24);
    assert_eq!(&encoded[0..4], &2u32.to_le_bytes());
    assert_eq!(&encoded[4..6], b"hi");

    let mut cursor = encoded.as_slice();
    assert_eq!(typ.decode(&mut cursor).unwrap(), TagValue::String("hi".into()));
}

#[test]
fn test_nested_template_resolution() {
    // inner template
    let mut inner_data = Vec::new();
    inner_data.extend_from_slice(&member_record(0, 0x00C4, 0));
    inner_data.extend_from_slice(b"Point;n_1\0X\0");
    let inner_header = TemplateHeader {
        definition_size_words: 8,
        structure_size: 4,
        member_count: 1,
        structure_handle: 0x0001,
    };
    let inner_parsed = parse_template(&inner_data, 1, 0x0200).unwrap();
    let inner = std::sync::Arc::new(
        build_struct_type(&inner_parsed, &inner_header, 0x0200, resolve_elementary).unwrap(),
    );

    // outer template references the inner by its template instance
    let mut outer_data = Vec::new();
    outer_data.extend_from_slice(&member_record(0, 0x8200, 0));
    outer_data.extend_from_slice(&member_record(0, 0x00C4, 4));
    outer_data.extend_from_slice(b"Shape;n_2\0Origin\0Area\0");
    let outer_header = TemplateHeader {
        definition_size_words: 10,
        structure_size: 8,
        member_count: 2,
        structure_handle: 0x0002,
    };
    let outer_parsed = parse_template(&outer_data, 2, 0x0300).unwrap();
    let outer = build_struct_type(&outer_parsed, &outer_header, 0x0300, |code| {
        if let Some(elementary) = elementary_member_type(code) {
            return Ok(elementary);
        }
        if code & 0x0FFF == 0x0200 {
            return Ok(CipType::Struct(inner.clone()));
        }
        Err(EipError::TypeLookup(format!("0x{code:04X}")))
    })
    .unwrap();

    assert_eq!(outer.members[0].typ.name(), "Point");

    let typ = CipType::Struct(outer.into());
    let value = TagValue::Struct(
        [
            (
                "Origin",
                TagValue::Struct([("X", TagValue::Dint(-7))].into_iter().collect::<StructValue>()),
            ),
            ("Area", TagValue::Dint(99)),
        ]
        .into_iter()
        .collect::<StructValue>(),
    );
    let encoded = typ.encode(&value).unwrap();
    assert_eq!(encoded.len(), 8);
    let mut cursor = encoded.as_slice();
    assert_eq!(typ.decode(&mut cursor).unwrap(), value);
}

#[test]
fn test_template_attribute_reply_parsing() {
    let mut data = Vec::new();
    data.extend_from_slice(&4u16.to_le_bytes());
    for (attr, value) in [(4u16, 40u32), (5, 28)] {
        data.extend_from_slice(&attr.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&value.to_le_bytes());
    }
    for (attr, value) in [(2u16, 7u16), (1, 0xB00B)] {
        data.extend_from_slice(&attr.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&value.to_le_bytes());
    }

    let header = parse_template_attributes(&data).unwrap();
    assert_eq!(
        header,
        TemplateHeader {
            definition_size_words: 40,
            structure_size: 28,
            member_count: 7,
            structure_handle: 0xB00B,
        }
    );
    // 40 words of definition minus the 23-byte object header
    assert_eq!(header.definition_bytes(), 137);
}
