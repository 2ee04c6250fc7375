//! Tag list and template upload: parsing of Symbol Object enumeration
//! replies, Template Object attribute and definition blocks, and the
//! construction of [`StructType`] descriptors from raw template data.
//!
//! All functions here are pure parsers; the paging and recursive
//! template-fetch loops live on [`crate::LogixClient`].

use bytes::{Buf, BufMut};
use log::debug;

use crate::cip::{
    class_code, service, type_code, ExternalAccess, BASE_TAG_BIT, TEMPLATE_MEMBER_INFO_LEN,
};
use crate::epath::{encode_padded_epath, Segment};
use crate::error::{EipError, Result};
use crate::types::{ArrayLength, CipType, Elementary, StructMember, StructType};

/// Whether a tag stores an atomic value or an uploaded structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    Atomic,
    Struct,
}

/// One tag definition uploaded from the controller.
#[derive(Debug, Clone)]
pub struct TagDefinition {
    /// Name as addressed in requests; program-scoped tags carry the
    /// `Program:<name>.` prefix.
    pub tag_name: String,
    pub instance_id: u32,
    pub tag_type: TagType,
    /// Name of the data type, e.g. `DINT` or `MotorData`.
    pub data_type_name: String,
    /// Descriptor for one element of this tag.
    pub type_class: CipType,
    /// Number of array dimensions (0-3).
    pub dim: u8,
    pub dimensions: [u32; 3],
    pub external_access: ExternalAccess,
    /// Educated guess from the symbol attributes; informational only.
    pub alias: bool,
    /// Bit position for BOOL tags packed into a host word.
    pub bit_position: Option<u8>,
    /// Capacity when the data type is a string alias.
    pub string_length: Option<usize>,
}

impl TagDefinition {
    /// Total number of elements across the defined dimensions.
    pub fn element_count(&self) -> usize {
        if self.dim == 0 {
            1
        } else {
            self.dimensions[..self.dim as usize]
                .iter()
                .map(|d| *d as usize)
                .product::<usize>()
                .max(1)
        }
    }

    /// The full descriptor: the element type wrapped in a fixed array
    /// when the tag is dimensioned.
    pub fn full_type(&self) -> CipType {
        if self.dim == 0 {
            self.type_class.clone()
        } else {
            CipType::Array {
                element: Box::new(self.type_class.clone()),
                length: ArrayLength::Fixed(self.element_count()),
            }
        }
    }
}

/// One record of a Get_Instance_Attribute_List reply, before any
/// filtering or type resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSymbolEntry {
    pub instance_id: u32,
    pub tag_name: String,
    pub symbol_type: u16,
    pub symbol_address: u32,
    pub symbol_object_address: u32,
    pub software_control: u32,
    pub dimensions: [u32; 3],
    pub external_access: Option<u8>,
}

impl RawSymbolEntry {
    pub fn is_struct(&self) -> bool {
        self.symbol_type & 0x8000 != 0
    }

    pub fn is_system(&self) -> bool {
        self.symbol_type & 0x1000 != 0
    }

    pub fn dim(&self) -> u8 {
        ((self.symbol_type & 0x6000) >> 13) as u8
    }

    pub fn template_instance(&self) -> u16 {
        self.symbol_type & 0x0FFF
    }

    pub fn atomic_code(&self) -> u8 {
        (self.symbol_type & 0x00FF) as u8
    }

    pub fn bool_bit_position(&self) -> u8 {
        ((self.symbol_type & 0x0700) >> 8) as u8
    }

    pub fn is_alias(&self) -> bool {
        self.software_control & BASE_TAG_BIT == 0
    }
}

/// Builds the Get_Instance_Attribute_List request resuming at
/// `start_instance`. Program-scoped enumeration prefixes the Symbol
/// Object path with the program's symbolic segment.
pub fn build_symbol_enumeration_request(
    program: Option<&str>,
    start_instance: u32,
    include_access: bool,
) -> Result<Vec<u8>> {
    let mut segments = Vec::new();
    if let Some(program) = program {
        let scoped = if program.starts_with("Program:") {
            program.to_string()
        } else {
            format!("Program:{program}")
        };
        segments.push(Segment::Symbolic(scoped));
    }
    segments.push(Segment::ClassId(class_code::SYMBOL_OBJECT));
    segments.push(Segment::InstanceId(start_instance));
    let path = encode_padded_epath(&segments, true, false)?;

    let mut attributes: Vec<u16> = vec![1, 2, 3, 5, 6, 8];
    if include_access {
        attributes.push(10);
    }

    let mut message = Vec::with_capacity(1 + path.len() + 2 + attributes.len() * 2);
    message.push(service::GET_INSTANCE_ATTRIBUTE_LIST);
    message.extend_from_slice(&path);
    message.put_u16_le(attributes.len() as u16);
    for attr in attributes {
        message.put_u16_le(attr);
    }
    Ok(message)
}

/// Parses the records of one enumeration reply.
pub fn parse_instance_attribute_list(
    mut data: &[u8],
    include_access: bool,
) -> Result<Vec<RawSymbolEntry>> {
    let mut entries = Vec::new();
    while data.has_remaining() {
        let record_min = 4 + 2 + 2 + 4 * 6 + usize::from(include_access);
        if data.remaining() < record_min {
            return Err(EipError::Framing(format!(
                "symbol record truncated: {} bytes left",
                data.remaining()
            )));
        }
        let instance_id = data.get_u32_le();
        let name_len = data.get_u16_le() as usize;
        if data.remaining() < name_len {
            return Err(EipError::Framing("symbol name truncated".into()));
        }
        let tag_name = String::from_utf8_lossy(&data[..name_len]).into_owned();
        data.advance(name_len);
        if data.remaining() < record_min - 6 {
            return Err(EipError::Framing("symbol record truncated".into()));
        }
        let symbol_type = data.get_u16_le();
        let symbol_address = data.get_u32_le();
        let symbol_object_address = data.get_u32_le();
        let software_control = data.get_u32_le();
        let dimensions = [data.get_u32_le(), data.get_u32_le(), data.get_u32_le()];
        let external_access = if include_access {
            Some(data.get_u8())
        } else {
            None
        };
        entries.push(RawSymbolEntry {
            instance_id,
            tag_name,
            symbol_type,
            symbol_address,
            symbol_object_address,
            software_control,
            dimensions,
            external_access,
        });
    }
    Ok(entries)
}

/// Non-tag symbols discovered while isolating user tags.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IsolatedSymbols {
    pub tags: Vec<RawSymbolEntry>,
    pub programs: Vec<(String, u32)>,
    pub tasks: Vec<(String, u32)>,
    /// Routine names seen while enumerating a program's symbols.
    pub routines: Vec<String>,
    /// `(module, slot, connection kind)`; slot is `None` for
    /// slot-less entries like `module:I`.
    pub modules: Vec<(String, Option<u8>, String)>,
}

/// Splits an enumeration into user tags and the bookkeeping symbols the
/// controller mixes into the Symbol Object table. Program-scoped names
/// get their `Program:<prog>.` prefix here.
pub fn isolate_user_tags(entries: Vec<RawSymbolEntry>, program: Option<&str>) -> IsolatedSymbols {
    let mut isolated = IsolatedSymbols::default();

    for mut entry in entries {
        let name = entry.tag_name.clone();

        if let Some(prog_name) = name.strip_prefix("Program:") {
            isolated
                .programs
                .push((prog_name.to_string(), entry.instance_id));
            continue;
        }
        if let Some(routine) = name.strip_prefix("Routine:") {
            isolated.routines.push(routine.to_string());
            continue;
        }
        if let Some(task_name) = name.strip_prefix("Task:") {
            isolated
                .tasks
                .push((task_name.to_string(), entry.instance_id));
            continue;
        }
        if name.contains("Map:") || name.contains("Cxn:") {
            continue;
        }

        // I/O module connection tags: `module:slot:kind` or `module:kind`
        let mut io_tag = false;
        if [":I", ":O", ":C", ":S"].iter().any(|k| name.contains(k)) {
            io_tag = true;
            let parts: Vec<&str> = name.split(':').collect();
            match parts.as_slice() {
                [module, slot, kind] if slot.chars().all(|c| c.is_ascii_digit()) => {
                    isolated
                        .modules
                        .push((module.to_string(), slot.parse().ok(), kind.to_string()));
                }
                [module, kind] => {
                    isolated
                        .modules
                        .push((module.to_string(), None, kind.to_string()));
                }
                _ => {}
            }
        }

        if (!io_tag && name.contains(':')) || name.starts_with("__") {
            continue;
        }
        if entry.is_system() {
            continue;
        }

        if let Some(program) = program {
            entry.tag_name = format!("Program:{}.{}", program, entry.tag_name);
        }
        isolated.tags.push(entry);
    }

    isolated
}

/// Template Object instance attributes sized for the definition read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateHeader {
    pub definition_size_words: u32,
    pub structure_size: u32,
    pub member_count: u16,
    pub structure_handle: u16,
}

impl TemplateHeader {
    /// Number of definition bytes to fetch via the template read service.
    pub fn definition_bytes(&self) -> u32 {
        (self.definition_size_words * 4).saturating_sub(crate::cip::TEMPLATE_HEADER_ADJUST)
    }
}

/// Request data asking for attributes {4, 5, 2, 1} of a template.
pub fn template_attributes_request_data() -> Vec<u8> {
    let mut data = Vec::with_capacity(10);
    data.put_u16_le(4);
    for attr in [4u16, 5, 2, 1] {
        data.put_u16_le(attr);
    }
    data
}

/// Parses the Get_Attribute_List reply for the template attributes.
pub fn parse_template_attributes(mut data: &[u8]) -> Result<TemplateHeader> {
    if data.remaining() < 2 {
        return Err(EipError::Framing("template attribute reply too short".into()));
    }
    let count = data.get_u16_le();
    let mut definition_size_words = None;
    let mut structure_size = None;
    let mut member_count = None;
    let mut structure_handle = None;

    for _ in 0..count {
        if data.remaining() < 4 {
            return Err(EipError::Framing("template attribute entry truncated".into()));
        }
        let attr = data.get_u16_le();
        let status = data.get_u16_le();
        match attr {
            4 | 5 => {
                if data.remaining() < 4 {
                    return Err(EipError::Framing("template attribute value truncated".into()));
                }
                let value = data.get_u32_le();
                if status == 0 {
                    if attr == 4 {
                        definition_size_words = Some(value);
                    } else {
                        structure_size = Some(value);
                    }
                }
            }
            1 | 2 => {
                if data.remaining() < 2 {
                    return Err(EipError::Framing("template attribute value truncated".into()));
                }
                let value = data.get_u16_le();
                if status == 0 {
                    if attr == 2 {
                        member_count = Some(value);
                    } else {
                        structure_handle = Some(value);
                    }
                }
            }
            other => {
                return Err(EipError::Framing(format!(
                    "unexpected template attribute {other}"
                )));
            }
        }
    }

    match (definition_size_words, structure_size, member_count, structure_handle) {
        (Some(d), Some(s), Some(m), Some(h)) => Ok(TemplateHeader {
            definition_size_words: d,
            structure_size: s,
            member_count: m,
            structure_handle: h,
        }),
        _ => Err(EipError::Framing("template attribute reply incomplete".into())),
    }
}

/// Request data for one fragment of the template definition read.
pub fn template_read_request_data(offset: u32, remaining: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(6);
    data.put_i32_le(offset as i32);
    data.put_u16_le(remaining.min(u16::MAX as u32) as u16);
    data
}

/// An 8-byte template member record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberInfo {
    /// Bit number for BOOL members, element count for arrays, else 0.
    pub info: u16,
    pub type_code: u16,
    pub offset: u32,
}

/// A parsed template definition block, before member type resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTemplate {
    pub name: String,
    pub members: Vec<(String, MemberInfo)>,
}

/// Range of non-predefined template instances; anything outside is a
/// builtin type such as TIMER or STRING.
fn is_predefined(template_instance: u16) -> bool {
    !(0x100..=0xEFF).contains(&template_instance)
}

/// Parses the template definition block: `member_count` fixed records
/// followed by the NUL-separated name blob.
pub fn parse_template(
    data: &[u8],
    member_count: u16,
    template_instance: u16,
) -> Result<ParsedTemplate> {
    let info_len = member_count as usize * TEMPLATE_MEMBER_INFO_LEN;
    if data.len() < info_len {
        return Err(EipError::Framing(format!(
            "template definition too short: {} bytes for {} members",
            data.len(),
            member_count
        )));
    }

    let mut records = Vec::with_capacity(member_count as usize);
    let mut cursor = &data[..info_len];
    for _ in 0..member_count {
        let info = cursor.get_u16_le();
        let type_code = cursor.get_u16_le();
        let offset = cursor.get_u32_le();
        records.push(MemberInfo {
            info,
            type_code,
            offset,
        });
    }

    let mut template_name: Option<String> = None;
    let mut member_names: Vec<String> = Vec::new();
    for chunk in data[info_len..].split(|&b| b == 0) {
        let name = String::from_utf8_lossy(chunk).into_owned();
        if template_name.is_none() && name.contains(';') {
            template_name = name.split(';').next().map(str::to_string);
        } else {
            member_names.push(name);
        }
    }

    // predefined types carry their name as the first member entry
    if is_predefined(template_instance) && template_name.is_none() && !member_names.is_empty() {
        template_name = Some(member_names.remove(0));
    }

    let mut name = template_name
        .ok_or_else(|| EipError::Framing("template name missing from definition".into()))?;
    if name == "ASCIISTRING82" {
        name = "STRING".to_string();
    }

    let mut unknown = 0usize;
    let members = records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let member_name = match member_names.get(i) {
                Some(n) if !n.is_empty() => n.clone(),
                _ => {
                    let n = format!("__unknown{unknown}");
                    unknown += 1;
                    n
                }
            };
            (member_name, record)
        })
        .collect();

    debug!("parsed template {name:?} ({member_count} members)");
    Ok(ParsedTemplate { name, members })
}

/// Builds a [`StructType`] out of a parsed template. `resolve` maps a
/// member's raw type code to its descriptor, fetching nested templates
/// as needed.
pub fn build_struct_type(
    parsed: &ParsedTemplate,
    header: &TemplateHeader,
    template_instance: u16,
    mut resolve: impl FnMut(u16) -> Result<CipType>,
) -> Result<StructType> {
    let predefined = is_predefined(template_instance);
    let mut members = Vec::with_capacity(parsed.members.len());

    for (name, record) in &parsed.members {
        let hidden = name.starts_with("ZZZZZZZZZZ")
            || name.starts_with("__")
            || (predefined && (name == "CTL" || name == "Control"));

        let element = resolve(record.type_code)?;
        let is_bool = element == CipType::Elementary(Elementary::Bool);

        let (typ, bit) = if is_bool {
            (element, Some(record.info))
        } else if record.info > 0 {
            (
                CipType::Array {
                    element: Box::new(element),
                    length: ArrayLength::Fixed(record.info as usize),
                },
                None,
            )
        } else {
            (element, None)
        };

        members.push(StructMember {
            name: name.clone(),
            typ,
            offset: record.offset,
            bit,
            hidden,
        });
    }

    let string_capacity = detect_string_alias(&members, header.structure_size as usize);

    Ok(StructType {
        name: parsed.name.clone(),
        members,
        size: header.structure_size as usize,
        handle: header.structure_handle,
        string_capacity,
    })
}

/// A template whose public members are exactly `LEN: DINT` and
/// `DATA: SINT[n]` is a string alias.
fn detect_string_alias(members: &[StructMember], structure_size: usize) -> Option<usize> {
    let public: Vec<&StructMember> = members.iter().filter(|m| !m.hidden).collect();
    if public.len() != 2 || public[0].name != "LEN" || public[1].name != "DATA" {
        return None;
    }
    if public[0].typ != CipType::Elementary(Elementary::Dint) {
        return None;
    }
    match &public[1].typ {
        CipType::Array { element, length } => {
            let is_sint_array = **element == CipType::Elementary(Elementary::Sint)
                && matches!(length, ArrayLength::Fixed(_));
            is_sint_array.then(|| structure_size.saturating_sub(4))
        }
        _ => None,
    }
}

/// Resolves an elementary member type code; `None` for struct members
/// (their low 12 bits name the nested template instance).
pub fn elementary_member_type(code: u16) -> Option<CipType> {
    if code & 0x8000 != 0 {
        return None;
    }
    let low = (code & 0x00FF) as u8;
    if u16::from(low) != code & 0x0FFF {
        return None;
    }
    Elementary::from_code(low).map(CipType::Elementary)
}

/// True when the code is the BOOL elementary type (used to spot packed
/// bit tags during symbol parsing).
pub fn is_bool_code(code: u8) -> bool {
    code == type_code::BOOL
}
