// lib.rs - EtherNet/IP + CIP client driver for Logix controllers
// =========================================================================
//
// # logix-cip
//
// An EtherNet/IP client for reading and writing tags in Allen-Bradley
// ControlLogix, CompactLogix and Micro800 PLCs, written in pure Rust on
// top of tokio. On connect the driver uploads the controller's tag table
// and structure templates, so reads and writes work symbolically with
// automatic encoding of UDTs, AOIs and builtin structures.
//
// ## Highlights
//
// - **Symbolic tag access**: `read(&["counter", "dint_array[50]{5}"])`
// - **Template upload**: UDT/AOI layouts (including bit-packed BOOLs and
//   string aliases) are fetched from the Template Object at connect time
// - **Request packing**: many operations per frame via the Multiple
//   Service Packet, sized to the negotiated connection budget
// - **Transparent fragmentation**: over-size operations page through the
//   Read/Write Tag Fragmented services
// - **Generic messaging**: raw CIP services for anything else

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod cip;
pub mod eip;
pub mod epath;
pub mod error;
pub mod generic;
pub mod planner;
pub mod session;
pub mod tag_manager;
pub mod tag_path;
pub mod types;

pub use cip::ExternalAccess;
pub use error::{EipError, Result};
pub use generic::MessageParams;
pub use session::{CipConnection, IdentityObject, Session};
pub use tag_manager::{TagDefinition, TagType, TemplateHeader};
pub use types::{ArrayLength, CipType, Elementary, StructType, StructValue, TagValue};

use cip::{
    class_code, service, STATUS_PARTIAL_TRANSFER, STATUS_PATH_SEGMENT_ERROR, STATUS_SUCCESS,
    MIN_VER_EXTERNAL_ACCESS, MIN_VER_INSTANCE_IDS, STRUCTURE_TYPE_MARKER,
};
use eip::ServiceReply;
use epath::{parse_connection_path, Segment};
use planner::{
    decode_read_reply, expected_read_bytes, multi_service_request, parse_multi_service_reply,
    plan_requests, read_fragmented_request, read_request, write_fragmented_request, write_request,
    Operation, OperationKind, PlannedRequest,
};
use tag_manager::{
    build_struct_type, build_symbol_enumeration_request, elementary_member_type,
    isolate_user_tags, parse_instance_attribute_list, parse_template, parse_template_attributes,
    template_attributes_request_data, template_read_request_data, RawSymbolEntry,
};
use tag_path::{parse_tag_request, Access, TagRequest};
use types::StructType as StructTypeDef;

// =========================================================================
// RESULT CARRIER
// =========================================================================

/// Result of one read, write or generic message.
///
/// `error == None` if and only if the operation succeeded, in which case
/// `value` is set (for writes, to the value written).
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// The tag reference exactly as submitted, or the request name for
    /// generic messages.
    pub tag: String,
    pub value: Option<TagValue>,
    /// Data type name, with an `[n]` suffix for multi-element requests.
    pub data_type: Option<String>,
    pub error: Option<String>,
}

impl Tag {
    pub fn ok(tag: impl Into<String>, value: TagValue, data_type: impl Into<String>) -> Self {
        Tag {
            tag: tag.into(),
            value: Some(value),
            data_type: Some(data_type.into()),
            error: None,
        }
    }

    pub fn err(tag: impl Into<String>, error: impl Into<String>) -> Self {
        Tag {
            tag: tag.into(),
            value: None,
            data_type: None,
            error: Some(error.into()),
        }
    }

    /// `true` when the operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.value.is_some() && self.error.is_none()
    }
}

// =========================================================================
// CONFIGURATION AND UPLOADED METADATA
// =========================================================================

/// Connection settings; `path` is the only required field.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Route to the controller: `"10.20.30.100"`, `"10.20.30.100/1"` or a
    /// full route like `"1.2.3.4/bp/1/enet/5.6.7.8"`.
    pub path: String,
    /// Upload identity and program name on open.
    pub init_info: bool,
    /// Upload controller-scoped tag definitions on open; required for
    /// `read`/`write` unless definitions are transplanted.
    pub init_tags: bool,
    /// Also upload program-scoped tags on open.
    pub init_program_tags: bool,
    /// Deadline applied to every socket operation.
    pub connection_timeout: Duration,
    /// Attempt the Large Forward Open (~4000 byte payloads) first.
    pub large_packets: bool,
}

impl ClientConfig {
    pub fn new(path: impl Into<String>) -> Self {
        ClientConfig {
            path: path.into(),
            init_info: true,
            init_tags: true,
            init_program_tags: true,
            connection_timeout: Duration::from_secs(10),
            large_packets: true,
        }
    }
}

/// A program discovered during tag upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramInfo {
    pub instance_id: u32,
    pub routines: Vec<String>,
}

/// An I/O module discovered during tag upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleInfo {
    /// Connection kinds per slot, e.g. `{3: ["I", "O"]}`.
    pub slots: HashMap<u8, Vec<String>>,
    /// Connection kinds for slot-less entries.
    pub types: Vec<String>,
}

/// Everything the driver learns about the controller.
#[derive(Debug, Clone, Default)]
pub struct PlcInfo {
    pub identity: IdentityObject,
    /// Controller program name (class 0x64), absent on Micro800.
    pub name: Option<String>,
    pub programs: HashMap<String, ProgramInfo>,
    pub tasks: HashMap<String, u32>,
    pub modules: HashMap<String, ModuleInfo>,
}

impl PlcInfo {
    pub fn revision_major(&self) -> u8 {
        self.identity.revision_major
    }
}

// =========================================================================
// CLIENT
// =========================================================================

/// EtherNet/IP client for Logix PLCs.
///
/// One client owns one TCP connection; operations serialize through
/// `&mut self`. Uploaded tag and type metadata is immutable after open
/// and may be cloned into other clients to skip the upload.
///
/// # Examples
///
/// ```rust,no_run
/// use logix_cip::{LogixClient, TagValue};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut plc = LogixClient::open("10.20.30.100/1").await?;
///
///     plc.write(&[("counter", TagValue::Dint(42))]).await?;
///     let results = plc.read(&["counter", "dint_array[50]{5}"]).await?;
///     for tag in &results {
///         println!("{}: {:?}", tag.tag, tag.value);
///     }
///
///     plc.close().await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct LogixClient {
    session: Session,
    config: ClientConfig,
    route: Vec<Segment>,
    micro800: bool,
    use_instance_ids: bool,
    info: PlcInfo,
    tags: HashMap<String, TagDefinition>,
    data_types: HashMap<String, Arc<StructTypeDef>>,
    templates: HashMap<u16, Arc<StructTypeDef>>,
}

impl LogixClient {
    /// Connects with default settings and runs the full initialization:
    /// identity, program name and tag list upload.
    pub async fn open(path: &str) -> Result<Self> {
        Self::open_with_config(ClientConfig::new(path)).await
    }

    /// Connects with explicit settings.
    pub async fn open_with_config(config: ClientConfig) -> Result<Self> {
        let parsed = parse_connection_path(&config.path)?;
        let session =
            Session::connect(&parsed.host, parsed.port, config.connection_timeout).await?;

        let mut client = LogixClient {
            session,
            route: parsed.route,
            config,
            micro800: false,
            use_instance_ids: true,
            info: PlcInfo::default(),
            tags: HashMap::new(),
            data_types: HashMap::new(),
            templates: HashMap::new(),
        };
        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&mut self) -> Result<()> {
        info!("initializing driver...");

        let identity = self.session.list_identity().await?;
        self.micro800 = identity.is_micro800();
        if self.micro800 {
            // these processors have no backplane to route through
            self.route.clear();
        }
        self.info.identity = identity;

        if self.config.init_info {
            self.get_plc_info().await?;
            if !self.micro800 {
                if let Err(err) = self.get_plc_name().await {
                    warn!("failed to read program name: {err}");
                }
            }
        }

        self.use_instance_ids =
            self.info.revision_major() >= MIN_VER_INSTANCE_IDS && !self.micro800;

        if self.config.init_tags {
            let program = if self.config.init_program_tags {
                Some("*")
            } else {
                None
            };
            self.get_tag_list(program).await?;
        }

        info!("initialization complete");
        Ok(())
    }

    /// Forward Close (best effort), UnRegisterSession, socket drop.
    pub async fn close(&mut self) -> Result<()> {
        let route = self.route.clone();
        if let Err(err) = self.session.forward_close(&route).await {
            warn!("Forward Close failed: {err}");
        }
        self.session.unregister().await
    }

    // ---------------------------------------------------------------------
    // read-only views
    // ---------------------------------------------------------------------

    /// Tag definitions uploaded from the controller, keyed by name.
    pub fn tags(&self) -> &HashMap<String, TagDefinition> {
        &self.tags
    }

    /// Structure definitions uploaded from the controller, keyed by name.
    pub fn data_types(&self) -> &HashMap<String, Arc<StructTypeDef>> {
        &self.data_types
    }

    /// Identity, program name and program/task/module bookkeeping.
    pub fn info(&self) -> &PlcInfo {
        &self.info
    }

    pub fn connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Negotiated per-direction payload budget in bytes.
    pub fn connection_size(&self) -> usize {
        self.session.connection_size()
    }

    /// Injects tag and type definitions uploaded by another client,
    /// skipping the upload cost on this one.
    pub fn set_tags_from(
        &mut self,
        tags: HashMap<String, TagDefinition>,
        data_types: HashMap<String, Arc<StructTypeDef>>,
    ) {
        self.tags = tags;
        self.data_types = data_types;
    }

    // ---------------------------------------------------------------------
    // transport helpers
    // ---------------------------------------------------------------------

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.session.is_connected() {
            return Ok(());
        }
        let route = self.route.clone();
        self.session
            .forward_open(&route, self.config.large_packets)
            .await
    }

    async fn send_connected(&mut self, message: &[u8]) -> Result<ServiceReply> {
        self.ensure_connected().await?;
        self.session.send_unit_data(message).await
    }

    // ---------------------------------------------------------------------
    // controller information services
    // ---------------------------------------------------------------------

    /// Reads the Identity Object and stores it in [`Self::info`].
    pub async fn get_plc_info(&mut self) -> Result<IdentityObject> {
        let mut params =
            MessageParams::new(service::GET_ATTRIBUTES_ALL, class_code::IDENTITY_OBJECT, 1)
                .name("get_plc_info")
                .unconnected();
        if !self.micro800 {
            params = params.unconnected_send();
        }
        let result = self.generic_message(params).await?;
        match (result.value, result.error) {
            (Some(TagValue::Bytes(raw)), None) => {
                let identity = IdentityObject::decode(&raw)?;
                self.info.identity = identity.clone();
                Ok(identity)
            }
            (_, err) => Err(EipError::Connection(format!(
                "failed to read PLC identity: {}",
                err.unwrap_or_else(|| "empty reply".into())
            ))),
        }
    }

    /// Reads the controller program name (Rockwell KB 23341).
    pub async fn get_plc_name(&mut self) -> Result<String> {
        let params = MessageParams::new(service::GET_ATTRIBUTES_ALL, class_code::PROGRAM_NAME, 1)
            .response_type(CipType::String)
            .name("get_plc_name");
        let result = self.generic_message(params).await?;
        match (result.value, result.error) {
            (Some(TagValue::String(name)), None) => {
                self.info.name = Some(name.clone());
                Ok(name)
            }
            (_, err) => Err(EipError::Connection(format!(
                "failed to read program name: {}",
                err.unwrap_or_else(|| "empty reply".into())
            ))),
        }
    }

    /// Current value of the PLC wall clock, in microseconds since the
    /// Unix epoch.
    pub async fn get_plc_time(&mut self) -> Result<Tag> {
        let params =
            MessageParams::new(service::GET_ATTRIBUTE_LIST, class_code::WALL_CLOCK_TIME, 1)
                .request_data(vec![0x01, 0x00, 0x0B, 0x00]) // one attribute: #11
                .name("get_plc_time");
        let result = self.generic_message(params).await?;
        Ok(match (result.value, result.error) {
            (Some(TagValue::Bytes(raw)), None) if raw.len() >= 14 => {
                let micros = u64::from_le_bytes(raw[6..14].try_into().unwrap());
                Tag::ok("get_plc_time", TagValue::Ulint(micros), "ULINT")
            }
            (_, err) => Tag::err(
                "get_plc_time",
                err.unwrap_or_else(|| "malformed wall clock reply".into()),
            ),
        })
    }

    /// Sets the PLC wall clock to `microseconds` since the Unix epoch.
    pub async fn set_plc_time(&mut self, microseconds: u64) -> Result<Tag> {
        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(&1u16.to_le_bytes()); // attribute count
        data.extend_from_slice(&6u16.to_le_bytes()); // attribute #6
        data.extend_from_slice(&microseconds.to_le_bytes());
        let params =
            MessageParams::new(service::SET_ATTRIBUTE_LIST, class_code::WALL_CLOCK_TIME, 1)
                .request_data(data)
                .name("set_plc_time");
        self.generic_message(params).await
    }

    /// Identity of the module in `slot` of the local rack.
    pub async fn get_module_info(&mut self, slot: u8) -> Result<IdentityObject> {
        let mut route = self.route.clone();
        route.pop();
        route.push(Segment::Port(epath::PortSegment::backplane(slot)));

        let params =
            MessageParams::new(service::GET_ATTRIBUTES_ALL, class_code::IDENTITY_OBJECT, 1)
                .unconnected_send()
                .route_path(route)
                .name("get_module_info");
        let result = self.generic_message(params).await?;
        match (result.value, result.error) {
            (Some(TagValue::Bytes(raw)), None) => IdentityObject::decode(&raw),
            (_, err) => Err(EipError::Connection(format!(
                "failed to read module identity: {}",
                err.unwrap_or_else(|| "empty reply".into())
            ))),
        }
    }

    // ---------------------------------------------------------------------
    // generic messaging
    // ---------------------------------------------------------------------

    /// Sends a caller-defined CIP message, like a MSG instruction.
    ///
    /// Connected messages ride the established CIP connection; the rest
    /// go out unconnected, optionally wrapped in an Unconnected Send
    /// with a route path.
    pub async fn generic_message(&mut self, params: MessageParams) -> Result<Tag> {
        let message = params.encode()?;
        debug!("sending generic message {:?}", params.name);

        let reply = if params.connected {
            self.send_connected(&message).await?
        } else if params.unconnected_send {
            let route = params.route_path.clone().unwrap_or_else(|| self.route.clone());
            let wrapped = generic::wrap_unconnected_send(&message, &route)?;
            self.session.send_rr_data(&wrapped).await?
        } else {
            self.session.send_rr_data(&message).await?
        };

        if let Some(err) = reply.status_error() {
            error!("generic message {:?} failed: {err}", params.name);
            return Ok(Tag::err(params.name, err.to_string()));
        }

        let (value, type_name) = match &params.response_type {
            Some(typ) => {
                let mut cursor = reply.data.as_slice();
                (typ.decode(&mut cursor)?, Some(typ.name()))
            }
            None => (TagValue::Bytes(reply.data), None),
        };
        Ok(Tag {
            tag: params.name,
            value: Some(value),
            data_type: type_name,
            error: None,
        })
    }

    // ---------------------------------------------------------------------
    // tag list and template upload
    // ---------------------------------------------------------------------

    /// Uploads tag definitions. `None` uploads controller-scoped tags,
    /// `Some("*")` all programs too, any other value one program.
    /// The result is cached in [`Self::tags`].
    pub async fn get_tag_list(&mut self, program: Option<&str>) -> Result<Vec<TagDefinition>> {
        info!("starting tag list upload...");
        let mut definitions = Vec::new();

        match program {
            Some("*") => {
                self.upload_scope(None, &mut definitions).await?;
                let programs: Vec<String> = self.info.programs.keys().cloned().collect();
                for program in programs {
                    self.upload_scope(Some(&program), &mut definitions).await?;
                }
            }
            scope => self.upload_scope(scope, &mut definitions).await?,
        }

        for def in &definitions {
            self.tags.insert(def.tag_name.clone(), def.clone());
        }
        info!("completed tag list upload: {} tags", definitions.len());
        Ok(definitions)
    }

    async fn upload_scope(
        &mut self,
        program: Option<&str>,
        definitions: &mut Vec<TagDefinition>,
    ) -> Result<()> {
        debug!("uploading {} tags", program.unwrap_or("controller"));
        let include_access = self.info.revision_major() >= MIN_VER_EXTERNAL_ACCESS;

        let mut entries = Vec::new();
        let mut start_instance = 0u32;
        loop {
            let message =
                build_symbol_enumeration_request(program, start_instance, include_access)?;
            let reply = self.send_connected(&message).await?;
            match reply.status {
                STATUS_SUCCESS | STATUS_PARTIAL_TRANSFER => {
                    let page = parse_instance_attribute_list(&reply.data, include_access)?;
                    let last = page.last().map(|e| e.instance_id);
                    entries.extend(page);
                    if reply.status == STATUS_SUCCESS {
                        break;
                    }
                    match last {
                        Some(last) => start_instance = last + 1,
                        None => break,
                    }
                }
                _ => return Err(reply.status_error().unwrap()),
            }
        }

        let isolated = isolate_user_tags(entries, program);
        for (name, instance_id) in isolated.programs {
            self.info.programs.entry(name).or_default().instance_id = instance_id;
        }
        if let Some(program) = program {
            let prog = self.info.programs.entry(program.to_string()).or_default();
            prog.routines.extend(isolated.routines);
        }
        for (name, instance_id) in isolated.tasks {
            self.info.tasks.insert(name, instance_id);
        }
        for (module, slot, kind) in isolated.modules {
            let info = self.info.modules.entry(module).or_default();
            match slot {
                Some(slot) => info.slots.entry(slot).or_default().push(kind),
                None => info.types.push(kind),
            }
        }

        for entry in isolated.tags {
            match self.symbol_to_definition(&entry).await {
                Ok(def) => definitions.push(def),
                Err(err) => warn!("skipping tag {:?}: {err}", entry.tag_name),
            }
        }
        Ok(())
    }

    async fn symbol_to_definition(&mut self, entry: &RawSymbolEntry) -> Result<TagDefinition> {
        let external_access = ExternalAccess::from_attribute(entry.external_access);
        let dim = entry.dim();

        if entry.is_struct() {
            let template_instance = entry.template_instance();
            let struct_type = self.struct_type_for(template_instance).await?;
            Ok(TagDefinition {
                tag_name: entry.tag_name.clone(),
                instance_id: entry.instance_id,
                tag_type: TagType::Struct,
                data_type_name: struct_type.name.clone(),
                string_length: struct_type.string_capacity,
                type_class: CipType::Struct(struct_type),
                dim,
                dimensions: entry.dimensions,
                external_access,
                alias: entry.is_alias(),
                bit_position: None,
            })
        } else {
            let element = Elementary::from_code(entry.atomic_code()).ok_or_else(|| {
                EipError::TypeLookup(format!(
                    "unknown atomic type 0x{:02X} for {:?}",
                    entry.atomic_code(),
                    entry.tag_name
                ))
            })?;
            let bit_position = (element == Elementary::Bool)
                .then(|| entry.bool_bit_position());
            Ok(TagDefinition {
                tag_name: entry.tag_name.clone(),
                instance_id: entry.instance_id,
                tag_type: TagType::Atomic,
                data_type_name: element.name().to_string(),
                type_class: CipType::Elementary(element),
                dim,
                dimensions: entry.dimensions,
                external_access,
                alias: entry.is_alias(),
                bit_position,
                string_length: None,
            })
        }
    }

    /// Fetches (or returns the cached) structure definition for a
    /// template instance, recursing into nested structures.
    async fn struct_type_for(&mut self, template_instance: u16) -> Result<Arc<StructTypeDef>> {
        if let Some(cached) = self.templates.get(&template_instance) {
            return Ok(cached.clone());
        }

        let header = self.template_header(template_instance).await?;
        let raw = self.read_template_raw(template_instance, &header).await?;
        let parsed = parse_template(&raw, header.member_count, template_instance)?;

        // nested structures first, so resolution below is purely local
        for (_, record) in &parsed.members {
            if elementary_member_type(record.type_code).is_none() {
                let nested = record.type_code & 0x0FFF;
                Box::pin(self.struct_type_for(nested)).await?;
            }
        }

        let templates = &self.templates;
        let struct_type = build_struct_type(&parsed, &header, template_instance, |code| {
            elementary_member_type(code)
                .or_else(|| {
                    templates
                        .get(&(code & 0x0FFF))
                        .map(|s| CipType::Struct(s.clone()))
                })
                .ok_or_else(|| {
                    EipError::TypeLookup(format!("unresolved member type 0x{code:04X}"))
                })
        })?;

        let struct_type = Arc::new(struct_type);
        self.templates.insert(template_instance, struct_type.clone());
        self.data_types
            .insert(struct_type.name.clone(), struct_type.clone());
        debug!(
            "uploaded template {:?} (instance {template_instance}, {} bytes)",
            struct_type.name, struct_type.size
        );
        Ok(struct_type)
    }

    async fn template_header(&mut self, template_instance: u16) -> Result<TemplateHeader> {
        let params = MessageParams::new(
            service::GET_ATTRIBUTE_LIST,
            class_code::TEMPLATE_OBJECT,
            template_instance as u32,
        )
        .request_data(template_attributes_request_data())
        .name("template_attributes");
        let message = params.encode()?;
        let reply = self.send_connected(&message).await?;
        if let Some(err) = reply.status_error() {
            return Err(err);
        }
        parse_template_attributes(&reply.data)
    }

    async fn read_template_raw(
        &mut self,
        template_instance: u16,
        header: &TemplateHeader,
    ) -> Result<Vec<u8>> {
        let total = header.definition_bytes();
        let mut raw: Vec<u8> = Vec::with_capacity(total as usize);

        while (raw.len() as u32) < total {
            let offset = raw.len() as u32;
            let params = MessageParams::new(
                service::READ_TAG,
                class_code::TEMPLATE_OBJECT,
                template_instance as u32,
            )
            .request_data(template_read_request_data(offset, total - offset))
            .name("read_template");
            let message = params.encode()?;
            let reply = self.send_connected(&message).await?;
            match reply.status {
                STATUS_SUCCESS | STATUS_PARTIAL_TRANSFER => {
                    if reply.data.is_empty() {
                        return Err(EipError::Framing(
                            "template read returned no data".into(),
                        ));
                    }
                    raw.extend_from_slice(&reply.data);
                    if reply.status == STATUS_SUCCESS {
                        break;
                    }
                }
                _ => return Err(reply.status_error().unwrap()),
            }
        }
        Ok(raw)
    }

    // ---------------------------------------------------------------------
    // read / write
    // ---------------------------------------------------------------------

    /// Reads one or more tags. One result is returned per reference, in
    /// order; per-tag failures are reported in the result's `error`
    /// field and never abort the batch.
    pub async fn read(&mut self, tags: &[&str]) -> Result<Vec<Tag>> {
        self.ensure_connected().await?;

        let ops: Vec<Operation> = tags
            .iter()
            .enumerate()
            .map(|(i, tag)| self.resolve_read(i, tag))
            .collect();

        let raw_results = self.execute(&ops).await?;

        Ok(ops
            .iter()
            .zip(raw_results)
            .map(|(op, result)| finish_read(op, result))
            .collect())
    }

    /// Writes one or more `(tag, value)` pairs. Results mirror `read`:
    /// one per pair, in order, with per-tag errors inline.
    pub async fn write(&mut self, writes: &[(&str, TagValue)]) -> Result<Vec<Tag>> {
        self.ensure_connected().await?;

        let ops: Vec<Operation> = writes
            .iter()
            .enumerate()
            .map(|(i, (tag, value))| self.resolve_write(i, tag, value))
            .collect();

        let raw_results = self.execute(&ops).await?;

        Ok(ops
            .iter()
            .zip(raw_results)
            .zip(writes)
            .map(|((op, result), (_, value))| finish_write(op, result, value))
            .collect())
    }

    fn resolve_read(&self, request_id: usize, tag: &str) -> Operation {
        match resolve_operation(&self.tags, tag, Access::Read, self.use_instance_ids) {
            Ok((request, resolved)) => Operation {
                request_id,
                user_tag: tag.to_string(),
                plc_tag: request.plc_tag,
                elements: request.elements,
                element_type: resolved.element_type,
                data_type_name: resolved.data_type_name,
                instance_id: resolved.instance_id,
                bit: request.bit,
                bool_elements: request.bool_elements,
                kind: OperationKind::Read,
                error: None,
            },
            Err(err) => failed_operation(request_id, tag, err),
        }
    }

    fn resolve_write(&self, request_id: usize, tag: &str, value: &TagValue) -> Operation {
        let (mut request, resolved) =
            match resolve_operation(&self.tags, tag, Access::Write, self.use_instance_ids) {
                Ok(parts) => parts,
                Err(err) => return failed_operation(request_id, tag, err),
            };

        // single-bit writes become read-modify-write requests
        let is_dword = resolved.data_type_name == "DWORD";
        if request.bit.is_some() && request.bool_elements.is_none() {
            let set = match value.as_boolean() {
                Some(set) => set,
                None => {
                    return failed_operation(
                        request_id,
                        tag,
                        EipError::DataValue("bit writes require a boolean value".into()),
                    )
                }
            };
            return Operation {
                request_id,
                user_tag: tag.to_string(),
                plc_tag: request.plc_tag,
                elements: 1,
                element_type: resolved.element_type,
                data_type_name: resolved.data_type_name,
                instance_id: resolved.instance_id,
                bit: request.bit,
                bool_elements: None,
                kind: OperationKind::WriteBit { set },
                error: None,
            };
        }

        if let Err(err) = request.check_bool_write_alignment() {
            return failed_operation(request_id, tag, err);
        }
        if is_dword {
            // only the host words covering the written span go out
            request.elements -= (request.bit.unwrap_or(0) / 32) as u16;
        }

        let encoded = encode_write_value(
            &resolved.element_type,
            request.elements,
            request.bool_elements,
            value,
        );
        match encoded {
            Ok(bytes) => Operation {
                request_id,
                user_tag: tag.to_string(),
                plc_tag: request.plc_tag,
                elements: request.elements,
                element_type: resolved.element_type,
                data_type_name: resolved.data_type_name,
                instance_id: resolved.instance_id,
                bit: request.bit,
                bool_elements: request.bool_elements,
                kind: OperationKind::Write { value: bytes },
                error: None,
            },
            Err(err) => failed_operation(request_id, tag, err),
        }
    }

    // ---------------------------------------------------------------------
    // plan execution
    // ---------------------------------------------------------------------

    /// Runs the planned requests; returns one raw result per operation,
    /// indexed by `request_id`.
    async fn execute(&mut self, ops: &[Operation]) -> Result<Vec<Tag>> {
        let budget = self.session.connection_size();
        let plan = plan_requests(ops, budget, !self.micro800, self.use_instance_ids)?;

        let mut results: Vec<Option<Tag>> = ops
            .iter()
            .map(|op| op.error.clone().map(|err| Tag::err(&op.user_tag, err)))
            .collect();

        for planned in plan {
            match planned {
                PlannedRequest::Multi(ids) => {
                    self.execute_multi(&ids, ops, &mut results).await?;
                }
                PlannedRequest::Single(id) => {
                    let tag = self.execute_single(&ops[id]).await?;
                    results[id] = Some(tag);
                }
                PlannedRequest::FragmentedRead(id) => {
                    let tag = self.execute_fragmented_read(&ops[id]).await?;
                    results[id] = Some(tag);
                }
                PlannedRequest::FragmentedWrite(id) => {
                    let tag = self.execute_fragmented_write(&ops[id]).await?;
                    results[id] = Some(tag);
                }
                PlannedRequest::BitWrite(write) => {
                    let message = write.build_message(self.use_instance_ids)?;
                    let reply = self.send_connected(&message).await?;
                    for id in &write.request_ids {
                        results[*id] = Some(match reply.status_error() {
                            None => Tag::ok(&ops[*id].user_tag, TagValue::Bool(true), "BOOL"),
                            Some(err) => Tag::err(&ops[*id].user_tag, err.to_string()),
                        });
                    }
                }
            }
        }

        Ok(results
            .into_iter()
            .enumerate()
            .map(|(i, tag)| {
                tag.unwrap_or_else(|| Tag::err(&ops[i].user_tag, "no response for operation"))
            })
            .collect())
    }

    async fn execute_multi(
        &mut self,
        ids: &[usize],
        ops: &[Operation],
        results: &mut [Option<Tag>],
    ) -> Result<()> {
        let mut messages = Vec::with_capacity(ids.len());
        for &id in ids {
            messages.push(self.build_plain_message(&ops[id], self.use_instance_ids)?);
        }
        let request = multi_service_request(&messages)?;
        let reply = self.send_connected(&request).await?;

        // 0x1E means one or more embedded replies carry their own error;
        // 0x06 means the reply was cut short but entries are still parseable
        if !matches!(reply.status, STATUS_SUCCESS | STATUS_PARTIAL_TRANSFER | 0x1E) {
            let err = reply.status_error().unwrap().to_string();
            for &id in ids {
                results[id] = Some(Tag::err(&ops[id].user_tag, &err));
            }
            return Ok(());
        }

        let replies = parse_multi_service_reply(&reply.data)?;
        for (slot, &id) in ids.iter().enumerate() {
            let op = &ops[id];
            match replies.get(slot) {
                Some(entry) => {
                    results[id] = Some(self.finish_entry(op, entry).await?);
                }
                None => {
                    results[id] = Some(Tag::err(&op.user_tag, "missing multi-service reply entry"));
                }
            }
        }
        Ok(())
    }

    /// Turns one service reply into a raw result, retrying symbolically
    /// when instance addressing hits a path segment error.
    async fn finish_entry(&mut self, op: &Operation, reply: &ServiceReply) -> Result<Tag> {
        if reply.status == STATUS_PATH_SEGMENT_ERROR
            && self.use_instance_ids
            && op.instance_id.is_some()
        {
            warn!(
                "instance addressing failed for {:?} (path segment error), retrying symbolically",
                op.plc_tag
            );
            return self.execute_single_with(op, false).await;
        }
        Ok(raw_result(op, reply))
    }

    async fn execute_single(&mut self, op: &Operation) -> Result<Tag> {
        let tag = self.execute_single_with(op, self.use_instance_ids).await?;
        Ok(tag)
    }

    async fn execute_single_with(&mut self, op: &Operation, use_instance_ids: bool) -> Result<Tag> {
        let message = self.build_plain_message(op, use_instance_ids)?;
        let reply = self.send_connected(&message).await?;

        if reply.status == STATUS_PATH_SEGMENT_ERROR
            && use_instance_ids
            && op.instance_id.is_some()
        {
            warn!(
                "instance addressing failed for {:?} (path segment error), retrying symbolically",
                op.plc_tag
            );
            return Box::pin(self.execute_single_with(op, false)).await;
        }

        // a read reply that unexpectedly overflows pages through the
        // fragmented service instead
        if matches!(op.kind, OperationKind::Read) && reply.status == STATUS_PARTIAL_TRANSFER {
            return self.execute_fragmented_read(op).await;
        }

        Ok(raw_result(op, &reply))
    }

    fn build_plain_message(&self, op: &Operation, use_instance_ids: bool) -> Result<Vec<u8>> {
        match &op.kind {
            OperationKind::Read => read_request(op, use_instance_ids),
            OperationKind::Write { value } => write_request(op, use_instance_ids, value),
            OperationKind::WriteBit { .. } => Err(EipError::Request(
                "bit writes are planned as read-modify-write requests".into(),
            )),
        }
    }

    async fn execute_fragmented_read(&mut self, op: &Operation) -> Result<Tag> {
        let expected = expected_read_bytes(op);
        let mut use_instance_ids = self.use_instance_ids && op.instance_id.is_some();
        let mut collected: Vec<u8> = Vec::with_capacity(expected);
        let mut offset = 0u32;
        let mut retried = false;

        loop {
            let message = read_fragmented_request(op, use_instance_ids, offset)?;
            let reply = self.send_connected(&message).await?;

            match reply.status {
                STATUS_SUCCESS | STATUS_PARTIAL_TRANSFER => {
                    let fragment = match strip_read_type_prefix(&reply.data, op) {
                        Ok(fragment) => fragment,
                        Err(err) => return Ok(Tag::err(&op.user_tag, err.to_string())),
                    };
                    if fragment.is_empty() && reply.status == STATUS_PARTIAL_TRANSFER {
                        return Ok(Tag::err(
                            &op.user_tag,
                            "fragmented read made no progress",
                        ));
                    }
                    offset += fragment.len() as u32;
                    collected.extend_from_slice(fragment);
                    if reply.status == STATUS_SUCCESS {
                        break;
                    }
                }
                STATUS_PATH_SEGMENT_ERROR if use_instance_ids && !retried => {
                    warn!(
                        "instance addressing failed for {:?}, retrying fragmented read symbolically",
                        op.plc_tag
                    );
                    use_instance_ids = false;
                    retried = true;
                    collected.clear();
                    offset = 0;
                }
                _ => {
                    return Ok(Tag::err(
                        &op.user_tag,
                        reply.status_error().unwrap().to_string(),
                    ))
                }
            }
        }

        debug!(
            "fragmented read of {:?} reassembled {} bytes (expected {})",
            op.plc_tag,
            collected.len(),
            expected
        );
        let mut cursor = collected.as_slice();
        match op
            .element_type
            .decode_elements(&mut cursor, op.elements as usize)
        {
            Ok(value) => Ok(Tag::ok(&op.user_tag, value, &op.data_type_name)),
            Err(err) => Ok(Tag::err(&op.user_tag, err.to_string())),
        }
    }

    async fn execute_fragmented_write(&mut self, op: &Operation) -> Result<Tag> {
        let OperationKind::Write { value } = &op.kind else {
            return Ok(Tag::err(&op.user_tag, "fragmented write without a value"));
        };
        let use_instance_ids = self.use_instance_ids && op.instance_id.is_some();

        // chunk size leaves room for the service header and path
        let overhead = write_fragmented_request(op, use_instance_ids, 0, &[])?.len();
        let budget = self.session.connection_size();
        let segment_size = budget.saturating_sub(overhead).max(1);
        // keep element boundaries intact where possible
        let element_size = op.element_size().max(1);
        let segment_size = if segment_size >= element_size {
            segment_size - segment_size % element_size
        } else {
            segment_size
        };

        let mut offset = 0usize;
        while offset < value.len() {
            let end = (offset + segment_size).min(value.len());
            let message =
                write_fragmented_request(op, use_instance_ids, offset as u32, &value[offset..end])?;
            let reply = self.send_connected(&message).await?;
            if let Some(err) = reply.status_error() {
                return Ok(Tag::err(&op.user_tag, err.to_string()));
            }
            offset = end;
        }
        Ok(Tag::ok(&op.user_tag, TagValue::Bool(true), &op.data_type_name))
    }
}

// =========================================================================
// RESOLUTION AND RESULT SHAPING (pure helpers)
// =========================================================================

#[derive(Debug, Clone)]
struct ResolvedType {
    element_type: CipType,
    data_type_name: String,
    instance_id: Option<u32>,
}

fn failed_operation(request_id: usize, tag: &str, err: EipError) -> Operation {
    Operation {
        request_id,
        user_tag: tag.to_string(),
        plc_tag: tag.to_string(),
        elements: 1,
        element_type: CipType::Elementary(Elementary::Dint),
        data_type_name: String::new(),
        instance_id: None,
        bit: None,
        bool_elements: None,
        kind: OperationKind::Read,
        error: Some(err.to_string()),
    }
}

/// Parses a user reference and resolves its type against the uploaded
/// tag table. Returns the (possibly DWORD-folded) request and the
/// element descriptor.
fn resolve_operation(
    tags: &HashMap<String, TagDefinition>,
    tag: &str,
    access: Access,
    use_instance_ids: bool,
) -> Result<(TagRequest, ResolvedType)> {
    let mut request = parse_tag_request(tag)?;
    let (base, members) = tag_path::split_base_and_members(&request.plc_tag);

    let def = tags
        .get(tag_path::strip_array(&base))
        .ok_or_else(|| EipError::TypeLookup(format!("tag {:?} is not defined", base)))?;

    let mut resolved_type = def.type_class.clone();
    for member in &members {
        let struct_type = match &resolved_type {
            CipType::Struct(s) => s.clone(),
            other => {
                return Err(EipError::TypeLookup(format!(
                    "{:?} has no member {:?} ({} is not a structure)",
                    base,
                    member,
                    other.name()
                )))
            }
        };
        let member_name = tag_path::strip_array(member);
        let found = struct_type
            .members
            .iter()
            .find(|m| m.name == member_name)
            .ok_or_else(|| {
                EipError::TypeLookup(format!(
                    "structure {} has no member {:?}",
                    struct_type.name, member_name
                ))
            })?;
        resolved_type = if member.contains('[') {
            match &found.typ {
                CipType::Array { element, .. } => (**element).clone(),
                _ => {
                    return Err(EipError::TypeLookup(format!(
                        "member {:?} of {} is not an array",
                        member_name, struct_type.name
                    )))
                }
            }
        } else {
            found.typ.clone()
        };
    }

    let data_type_name = resolved_type.name();

    // a trailing numeric member is only meaningful on integer types
    if request.bit.is_some() {
        let bit_capable = matches!(
            resolved_type,
            CipType::Elementary(
                Elementary::Sint
                    | Elementary::Int
                    | Elementary::Dint
                    | Elementary::Lint
                    | Elementary::Usint
                    | Elementary::Uint
                    | Elementary::Udint
                    | Elementary::Ulint
                    | Elementary::Byte
                    | Elementary::Word
                    | Elementary::Dword
                    | Elementary::Lword
            )
        );
        if !bit_capable {
            return Err(EipError::Request(format!(
                "bit access is not valid on type {}",
                data_type_name
            )));
        }
    }

    if data_type_name == "DWORD" {
        request.fold_bool_array(access)?;
    }

    // program-scoped tags must use symbolic addressing (firmware quirk)
    let instance_id = (use_instance_ids
        && members.is_empty()
        && !request.plc_tag.starts_with("Program:"))
    .then_some(def.instance_id);

    Ok((
        request,
        ResolvedType {
            element_type: resolved_type,
            data_type_name,
            instance_id,
        },
    ))
}

/// Encodes a write value for `elements` elements of `element_type`.
fn encode_write_value(
    element_type: &CipType,
    elements: u16,
    bool_elements: Option<u16>,
    value: &TagValue,
) -> Result<Vec<u8>> {
    let is_dword = *element_type == CipType::Elementary(Elementary::Dword);
    let value_elements = bool_elements.unwrap_or(elements) as usize;

    if value_elements > 1 {
        let items = match value {
            TagValue::List(items) => items,
            _ => {
                return Err(EipError::Request(format!(
                    "writing {value_elements} elements requires a list value"
                )))
            }
        };
        if items.len() < value_elements {
            return Err(EipError::Request(format!(
                "insufficient data for requested elements, expected {} and got {}",
                value_elements,
                items.len()
            )));
        }
        let items = &items[..value_elements];

        let mut out = Vec::new();
        if is_dword {
            for word in items.chunks(32) {
                out.extend_from_slice(&element_type.encode(&TagValue::List(word.to_vec()))?);
            }
        } else {
            for item in items {
                out.extend_from_slice(&element_type.encode(item)?);
            }
        }
        Ok(out)
    } else {
        element_type.encode(value)
    }
}

/// Removes the type prefix (and validates the structure handle) from a
/// read reply fragment, returning the value bytes.
fn strip_read_type_prefix<'a>(data: &'a [u8], op: &Operation) -> Result<&'a [u8]> {
    if data.len() < 2 {
        return Err(EipError::Framing("read reply missing type code".into()));
    }
    let reply_type = u16::from_le_bytes([data[0], data[1]]);
    if reply_type == STRUCTURE_TYPE_MARKER {
        if data.len() < 4 {
            return Err(EipError::Framing("read reply missing structure handle".into()));
        }
        let handle = u16::from_le_bytes([data[2], data[3]]);
        if let CipType::Struct(expected) = &op.element_type {
            if expected.handle != handle {
                return Err(EipError::DataValue(format!(
                    "structure handle 0x{:04X} does not match template {} (0x{:04X})",
                    handle, expected.name, expected.handle
                )));
            }
        }
        Ok(&data[4..])
    } else {
        Ok(&data[2..])
    }
}

/// Decodes a raw service reply into an intermediate result, before
/// BOOL/bit post-processing.
fn raw_result(op: &Operation, reply: &ServiceReply) -> Tag {
    if let Some(err) = reply.status_error() {
        return Tag::err(&op.user_tag, err.to_string());
    }
    match &op.kind {
        OperationKind::Read => match decode_read_reply(&reply.data, op) {
            Ok((value, type_name)) => Tag::ok(&op.user_tag, value, type_name),
            Err(err) => Tag::err(&op.user_tag, err.to_string()),
        },
        _ => Tag::ok(&op.user_tag, TagValue::Bool(true), &op.data_type_name),
    }
}

/// Final shaping of a read result: bit extraction, BOOL array slicing
/// and the `[n]` type suffix.
fn finish_read(op: &Operation, result: Tag) -> Tag {
    if op.error.is_some() || !result.is_ok() {
        return result;
    }
    let value = result.value.clone().unwrap();

    if op.data_type_name == "DWORD" {
        // flatten the per-DWORD bool lists into one bit vector
        let mut bits: Vec<TagValue> = Vec::new();
        match value {
            TagValue::List(words) => {
                for word in words {
                    match word {
                        TagValue::List(word_bits) => bits.extend(word_bits),
                        TagValue::Bool(b) => bits.push(TagValue::Bool(b)),
                        other => bits.push(other),
                    }
                }
            }
            other => return Tag::ok(&op.user_tag, other, &op.data_type_name),
        }

        let start = op.bit.unwrap_or(0) as usize;
        return match op.bool_elements {
            Some(count) => {
                let count = count as usize;
                if start + count > bits.len() {
                    Tag::err(&op.user_tag, "BOOL array reply shorter than requested span")
                } else {
                    Tag::ok(
                        &op.user_tag,
                        TagValue::List(bits[start..start + count].to_vec()),
                        format!("BOOL[{count}]"),
                    )
                }
            }
            None => match bits.get(start) {
                Some(bit) => Tag::ok(&op.user_tag, bit.clone(), "BOOL"),
                None => Tag::err(&op.user_tag, "BOOL array reply shorter than requested index"),
            },
        };
    }

    if let Some(bit) = op.bit {
        return match value.as_int() {
            Some(host) if bit < 64 => Tag::ok(
                &op.user_tag,
                TagValue::Bool(host & (1i64 << bit) != 0),
                "BOOL",
            ),
            _ => Tag::err(&op.user_tag, "bit access on a non-integer reply"),
        };
    }

    let data_type = if op.elements > 1 {
        format!("{}[{}]", op.data_type_name, op.elements)
    } else {
        op.data_type_name.clone()
    };
    Tag {
        tag: result.tag,
        value: Some(value),
        data_type: Some(data_type),
        error: None,
    }
}

/// Final shaping of a write result: echo the written value and name the
/// written type.
fn finish_write(op: &Operation, result: Tag, value: &TagValue) -> Tag {
    if op.error.is_some() || result.error.is_some() {
        return result;
    }

    let data_type = if op.bit.is_some() && op.bool_elements.is_none() {
        "BOOL".to_string()
    } else if let Some(count) = op.bool_elements {
        format!("BOOL[{count}]")
    } else if op.elements > 1 {
        format!("{}[{}]", op.data_type_name, op.elements)
    } else {
        op.data_type_name.clone()
    };

    Tag {
        tag: result.tag,
        value: Some(value.clone()),
        data_type: Some(data_type),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArrayLength, StructMember};

    fn dint_def(name: &str, instance: u32, dims: [u32; 3], dim: u8) -> TagDefinition {
        TagDefinition {
            tag_name: name.to_string(),
            instance_id: instance,
            tag_type: TagType::Atomic,
            data_type_name: "DINT".to_string(),
            type_class: CipType::Elementary(Elementary::Dint),
            dim,
            dimensions: dims,
            external_access: ExternalAccess::ReadWrite,
            alias: false,
            bit_position: None,
            string_length: None,
        }
    }

    fn dword_def(name: &str, instance: u32, len: u32) -> TagDefinition {
        TagDefinition {
            tag_name: name.to_string(),
            instance_id: instance,
            tag_type: TagType::Atomic,
            data_type_name: "DWORD".to_string(),
            type_class: CipType::Elementary(Elementary::Dword),
            dim: 1,
            dimensions: [len, 0, 0],
            external_access: ExternalAccess::ReadWrite,
            alias: false,
            bit_position: None,
            string_length: None,
        }
    }

    fn motor_def(name: &str, instance: u32) -> (TagDefinition, Arc<StructType>) {
        let st = Arc::new(StructType {
            name: "MotorData".to_string(),
            members: vec![
                StructMember {
                    name: "Speed".to_string(),
                    typ: CipType::Elementary(Elementary::Real),
                    offset: 0,
                    bit: None,
                    hidden: false,
                },
                StructMember {
                    name: "Counts".to_string(),
                    typ: CipType::Array {
                        element: Box::new(CipType::Elementary(Elementary::Dint)),
                        length: ArrayLength::Fixed(4),
                    },
                    offset: 4,
                    bit: None,
                    hidden: false,
                },
            ],
            size: 20,
            handle: 0x1234,
            string_capacity: None,
        });
        let def = TagDefinition {
            tag_name: name.to_string(),
            instance_id: instance,
            tag_type: TagType::Struct,
            data_type_name: "MotorData".to_string(),
            type_class: CipType::Struct(st.clone()),
            dim: 0,
            dimensions: [0; 3],
            external_access: ExternalAccess::ReadWrite,
            alias: false,
            bit_position: None,
            string_length: None,
        };
        (def, st)
    }

    fn tag_table() -> HashMap<String, TagDefinition> {
        let mut tags = HashMap::new();
        tags.insert("counter".to_string(), dint_def("counter", 10, [0; 3], 0));
        tags.insert(
            "dint_array".to_string(),
            dint_def("dint_array", 11, [100, 0, 0], 1),
        );
        tags.insert("bits".to_string(), dword_def("bits", 12, 4));
        let (motor, _) = motor_def("motor", 13);
        tags.insert("motor".to_string(), motor);
        tags.insert(
            "Program:MainProgram.local".to_string(),
            dint_def("Program:MainProgram.local", 14, [0; 3], 0),
        );
        tags
    }

    #[test]
    fn test_resolve_plain_tag_uses_instance_id() {
        let tags = tag_table();
        let (request, resolved) =
            resolve_operation(&tags, "counter", Access::Read, true).unwrap();
        assert_eq!(request.plc_tag, "counter");
        assert_eq!(resolved.data_type_name, "DINT");
        assert_eq!(resolved.instance_id, Some(10));
    }

    #[test]
    fn test_resolve_without_instance_ids() {
        let tags = tag_table();
        let (_, resolved) = resolve_operation(&tags, "counter", Access::Read, false).unwrap();
        assert_eq!(resolved.instance_id, None);
    }

    #[test]
    fn test_resolve_program_tag_is_always_symbolic() {
        let tags = tag_table();
        let (request, resolved) =
            resolve_operation(&tags, "Program:MainProgram.local", Access::Read, true).unwrap();
        assert_eq!(request.plc_tag, "Program:MainProgram.local");
        assert_eq!(resolved.instance_id, None);
    }

    #[test]
    fn test_resolve_member_access() {
        let tags = tag_table();
        let (_, resolved) = resolve_operation(&tags, "motor.Speed", Access::Read, true).unwrap();
        assert_eq!(resolved.data_type_name, "REAL");
        // members always use the symbolic path
        assert_eq!(resolved.instance_id, None);
    }

    #[test]
    fn test_resolve_array_member_with_subscript() {
        let tags = tag_table();
        let (_, resolved) =
            resolve_operation(&tags, "motor.Counts[2]", Access::Read, false).unwrap();
        assert_eq!(resolved.data_type_name, "DINT");
    }

    #[test]
    fn test_resolve_whole_array_member() {
        let tags = tag_table();
        let (_, resolved) =
            resolve_operation(&tags, "motor.Counts", Access::Read, false).unwrap();
        assert_eq!(resolved.data_type_name, "DINT[4]");
    }

    #[test]
    fn test_resolve_unknown_tag_fails() {
        let tags = tag_table();
        assert!(matches!(
            resolve_operation(&tags, "missing", Access::Read, true),
            Err(EipError::TypeLookup(_))
        ));
        assert!(matches!(
            resolve_operation(&tags, "motor.Nope", Access::Read, true),
            Err(EipError::TypeLookup(_))
        ));
    }

    #[test]
    fn test_resolve_dword_read_is_folded() {
        let tags = tag_table();
        let (request, resolved) =
            resolve_operation(&tags, "bits[50]{5}", Access::Read, false).unwrap();
        assert_eq!(resolved.data_type_name, "DWORD");
        assert_eq!(request.plc_tag, "bits[0]");
        assert_eq!(request.bit, Some(50));
        assert_eq!(request.bool_elements, Some(5));
        assert_eq!(request.elements, 2);
    }

    #[test]
    fn test_resolve_bit_access_on_dint() {
        let tags = tag_table();
        let (request, resolved) =
            resolve_operation(&tags, "counter.3", Access::Read, false).unwrap();
        assert_eq!(request.plc_tag, "counter");
        assert_eq!(request.bit, Some(3));
        assert_eq!(resolved.data_type_name, "DINT");
    }

    #[test]
    fn test_resolve_bit_access_on_struct_fails() {
        let tags = tag_table();
        assert!(matches!(
            resolve_operation(&tags, "motor.5", Access::Read, false),
            Err(EipError::Request(_))
        ));
    }

    #[test]
    fn test_encode_write_value_list_rules() {
        let dint = CipType::Elementary(Elementary::Dint);
        // exact
        let value = TagValue::List(vec![TagValue::Dint(1), TagValue::Dint(2)]);
        let bytes = encode_write_value(&dint, 2, None, &value).unwrap();
        assert_eq!(bytes.len(), 8);
        // longer than requested truncates
        let value = TagValue::List(vec![
            TagValue::Dint(1),
            TagValue::Dint(2),
            TagValue::Dint(3),
        ]);
        assert_eq!(encode_write_value(&dint, 2, None, &value).unwrap().len(), 8);
        // shorter than requested is a request error
        let value = TagValue::List(vec![TagValue::Dint(1)]);
        assert!(matches!(
            encode_write_value(&dint, 2, None, &value),
            Err(EipError::Request(_))
        ));
    }

    #[test]
    fn test_encode_write_value_dword_chunks_bools() {
        let dword = CipType::Elementary(Elementary::Dword);
        let mut bools = vec![TagValue::Bool(false); 64];
        bools[0] = TagValue::Bool(true);
        bools[63] = TagValue::Bool(true);
        let bytes =
            encode_write_value(&dword, 2, Some(64), &TagValue::List(bools)).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x8000_0000u32.to_le_bytes());
    }

    fn read_op_for(tags: &HashMap<String, TagDefinition>, tag: &str) -> Operation {
        let (request, resolved) = resolve_operation(tags, tag, Access::Read, false).unwrap();
        Operation {
            request_id: 0,
            user_tag: tag.to_string(),
            plc_tag: request.plc_tag,
            elements: request.elements,
            element_type: resolved.element_type,
            data_type_name: resolved.data_type_name,
            instance_id: resolved.instance_id,
            bit: request.bit,
            bool_elements: request.bool_elements,
            kind: OperationKind::Read,
            error: None,
        }
    }

    #[test]
    fn test_finish_read_slices_bool_array() {
        let tags = tag_table();
        let op = read_op_for(&tags, "bits[30]{4}");
        // two DWORDs: bit 30 set in the first, bit 32 (index 0 of second)
        let mut words = Vec::new();
        for word in [1u32 << 30, 1u32] {
            let mut bits = Vec::new();
            for i in 0..32 {
                bits.push(TagValue::Bool(word & (1 << i) != 0));
            }
            words.push(TagValue::List(bits));
        }
        let raw = Tag::ok("bits[30]{4}", TagValue::List(words), "DWORD");
        let finished = finish_read(&op, raw);
        assert_eq!(
            finished.value,
            Some(TagValue::List(vec![
                TagValue::Bool(true),  // bit 30
                TagValue::Bool(false), // bit 31
                TagValue::Bool(true),  // bit 32
                TagValue::Bool(false), // bit 33
            ]))
        );
        assert_eq!(finished.data_type.as_deref(), Some("BOOL[4]"));
    }

    #[test]
    fn test_finish_read_extracts_single_bit() {
        let tags = tag_table();
        let op = read_op_for(&tags, "counter.3");
        let raw = Tag::ok("counter.3", TagValue::Dint(0b1000), "DINT");
        let finished = finish_read(&op, raw);
        assert_eq!(finished.value, Some(TagValue::Bool(true)));
        assert_eq!(finished.data_type.as_deref(), Some("BOOL"));
    }

    #[test]
    fn test_finish_read_adds_element_suffix() {
        let tags = tag_table();
        let op = read_op_for(&tags, "dint_array[50]{5}");
        let raw = Tag::ok(
            "dint_array[50]{5}",
            TagValue::List(vec![TagValue::Dint(1); 5]),
            "DINT",
        );
        let finished = finish_read(&op, raw);
        assert_eq!(finished.data_type.as_deref(), Some("DINT[5]"));
        assert_eq!(finished.tag, "dint_array[50]{5}");
    }

    #[test]
    fn test_finish_write_echoes_value_and_type() {
        let tags = tag_table();
        let (request, resolved) =
            resolve_operation(&tags, "counter", Access::Write, false).unwrap();
        let op = Operation {
            request_id: 0,
            user_tag: "counter".to_string(),
            plc_tag: request.plc_tag,
            elements: request.elements,
            element_type: resolved.element_type,
            data_type_name: resolved.data_type_name,
            instance_id: resolved.instance_id,
            bit: request.bit,
            bool_elements: request.bool_elements,
            kind: OperationKind::Write {
                value: 42i32.to_le_bytes().to_vec(),
            },
            error: None,
        };
        let raw = Tag::ok("counter", TagValue::Bool(true), "DINT");
        let finished = finish_write(&op, raw, &TagValue::Dint(42));
        assert_eq!(finished.value, Some(TagValue::Dint(42)));
        assert_eq!(finished.data_type.as_deref(), Some("DINT"));
        assert!(finished.is_ok());
    }

    #[test]
    fn test_strip_read_type_prefix_checks_handle() {
        let tags = tag_table();
        let mut op = read_op_for(&tags, "motor");
        op.data_type_name = "MotorData".to_string();

        let mut good = STRUCTURE_TYPE_MARKER.to_le_bytes().to_vec();
        good.extend_from_slice(&0x1234u16.to_le_bytes());
        good.extend_from_slice(&[0u8; 20]);
        assert_eq!(strip_read_type_prefix(&good, &op).unwrap().len(), 20);

        let mut bad = STRUCTURE_TYPE_MARKER.to_le_bytes().to_vec();
        bad.extend_from_slice(&0x5678u16.to_le_bytes());
        bad.extend_from_slice(&[0u8; 20]);
        assert!(strip_read_type_prefix(&bad, &op).is_err());
    }

    #[test]
    fn test_tag_truthiness() {
        assert!(Tag::ok("t", TagValue::Dint(1), "DINT").is_ok());
        assert!(!Tag::err("t", "boom").is_ok());
    }
}
