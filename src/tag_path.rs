//! Parsing of user tag references: `name(.member)*([i(,j,k)?])?({count})?`.
//!
//! `recipe[2].Temp`, `dint_array[50]{5}`, `Program:Main.counter` and
//! `flags.3` (numeric trailing member = bit access) are all valid. An
//! omitted subscript addresses element 0; an omitted count reads one
//! element.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{EipError, Result};

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Read or write; BOOL-array folding differs between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// A syntactically parsed tag reference, before type resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TagRequest {
    /// The reference exactly as the user spelled it.
    pub user_tag: String,
    /// The name addressed on the PLC (count removed, bit folded away).
    pub plc_tag: String,
    /// Element count to transfer.
    pub elements: u16,
    /// `true` when no `{count}` was given.
    pub implicit_count: bool,
    /// Bit number for single-bit access (`tag.3`) or BOOL-array index.
    pub bit: Option<u32>,
    /// Number of BOOLs requested from a BOOL array, once folded.
    pub bool_elements: Option<u16>,
}

/// Splits `"tag[5]"` into `("tag", Some(5))`; names without a trailing
/// subscript return `None`.
pub fn array_index(tag: &str) -> Result<(&str, Option<u32>)> {
    if let Some(open) = tag.rfind('[') {
        if !tag.ends_with(']') {
            return Err(EipError::PathSyntax(format!("unterminated subscript in {tag:?}")));
        }
        let idx = tag[open + 1..tag.len() - 1]
            .parse()
            .map_err(|_| EipError::PathSyntax(format!("invalid subscript in {tag:?}")))?;
        Ok((&tag[..open], Some(idx)))
    } else {
        Ok((tag, None))
    }
}

/// Strips any subscript: `"tag[5]"` -> `"tag"`.
pub fn strip_array(tag: &str) -> &str {
    match tag.find('[') {
        Some(open) => &tag[..open],
        None => tag,
    }
}

/// Splits a reference into base tag and member names, keeping a
/// `Program:x` prefix attached to the base.
pub fn split_base_and_members(tag: &str) -> (String, Vec<String>) {
    let mut parts: Vec<String> = tag.split('.').map(str::to_string).collect();
    let mut base = parts.remove(0);
    if base.starts_with("Program:") && !parts.is_empty() {
        base = format!("{}.{}", base, parts.remove(0));
    }
    (base, parts)
}

fn validate_name(name: &str) -> Result<()> {
    let bare = strip_array(name);
    let bare = bare.strip_prefix("Program:").unwrap_or(bare);
    if !NAME_RE.is_match(bare) {
        return Err(EipError::PathSyntax(format!("invalid tag name {name:?}")));
    }
    Ok(())
}

/// Parses one user reference. Only syntax is handled here; DWORD-backed
/// BOOL array folding needs the resolved type, see
/// [`TagRequest::fold_bool_array`].
pub fn parse_tag_request(tag: &str) -> Result<TagRequest> {
    let user_tag = tag.to_string();

    let (body, elements, implicit_count) = match (tag.find('{'), tag.ends_with('}')) {
        (Some(open), true) => {
            let count: u16 = tag[open + 1..tag.len() - 1]
                .parse()
                .ok()
                .filter(|c| *c > 0)
                .ok_or_else(|| EipError::PathSyntax(format!("invalid element count in {tag:?}")))?;
            (&tag[..open], count, false)
        }
        (Some(_), false) => {
            return Err(EipError::PathSyntax(format!("unterminated count in {tag:?}")))
        }
        (None, _) => (tag, 1, true),
    };
    if body.is_empty() {
        return Err(EipError::PathSyntax("empty tag reference".into()));
    }

    let (base, mut members) = split_base_and_members(body);
    validate_name(&base)?;

    // a trailing all-digit member selects a single bit of the tag
    let bit = match members.last() {
        Some(last) if !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()) => {
            let bit = members
                .pop()
                .unwrap()
                .parse()
                .map_err(|_| EipError::PathSyntax(format!("invalid bit number in {tag:?}")))?;
            Some(bit)
        }
        _ => None,
    };
    for member in &members {
        validate_name(member)?;
    }

    let plc_tag = if members.is_empty() {
        base
    } else {
        format!("{}.{}", base, members.join("."))
    };

    Ok(TagRequest {
        user_tag,
        plc_tag,
        elements,
        implicit_count,
        bit,
        bool_elements: None,
    })
}

impl TagRequest {
    /// Rewrites the request for a `DWORD`-backed BOOL array: the
    /// subscript becomes a bit index, reads are rebased to element 0,
    /// writes to the containing DWORD, and the element count grows to
    /// cover whole host words.
    pub fn fold_bool_array(&mut self, access: Access) -> Result<()> {
        let (name, idx) = array_index(&self.plc_tag)?;
        let name = name.to_string();
        if let Some(idx) = idx {
            self.plc_tag = match access {
                Access::Read => format!("{}[0]", name),
                Access::Write => format!("{}[{}]", name, idx / 32),
            };
            self.bit = Some(idx);
        }
        self.bool_elements = if self.implicit_count || self.elements == 1 {
            None
        } else {
            Some(self.elements)
        };
        let total = self.bit.unwrap_or(0) + self.elements as u32;
        self.elements = (total / 32 + u32::from(total % 32 != 0)) as u16;
        Ok(())
    }

    /// The whole-DWORD write rule: multi-bit writes must start on a
    /// 32-bit boundary and span whole words.
    pub fn check_bool_write_alignment(&self) -> Result<()> {
        if self.bool_elements.is_some() {
            let start = self.bit.unwrap_or(0);
            let count = self.bool_elements.unwrap() as u32;
            if start % 32 != 0 || count % 32 != 0 {
                return Err(EipError::Request(
                    "BOOL array writes require start and count to be multiples of 32".into(),
                ));
            }
        }
        Ok(())
    }
}
