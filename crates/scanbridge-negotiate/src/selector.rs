//! Stream / source / pixel format selection
//!
//! Walks one `configure` action against a device. Streams are tried in order;
//! the first stream that does not escalate to `nextStream` wins. Within a
//! pixel format the color mode is set first, then resolution, compression,
//! image count and the remaining attributes in task order, because capability
//! models may reject a setting made before the ones it depends on.

use scanbridge_core::reply::{ActionReply, PixelFormatReply, SourceReply, StreamReply};
use scanbridge_core::task::{Action, Attribute, Node, PixelFormat, Source, Stream};
use scanbridge_core::TaskError;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::capability::{CapValue, Capability, CapabilityDevice, INVALID_VALUE};
use crate::mapping::{
    pixel_format_name, pixel_type, source_mapping, AttributeKind, SourceMapping,
    UNKNOWN_ATTRIBUTE_RANK,
};
use crate::resolver::{apply_policy, resolve, Candidate, Resolution};

/// Names of what was picked, used to address image blocks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub stream_name: String,
    pub sources: Vec<SelectedSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedSource {
    pub name: String,
    /// Surface the device ended up on
    pub source: String,
    pub pixel_formats: Vec<SelectedFormat>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedFormat {
    pub name: String,
    pub pixel_format: String,
}

impl Selection {
    pub fn source_name(&self) -> &str {
        self.sources.first().map_or("source0", |s| s.name.as_str())
    }

    pub fn pixel_format_name(&self) -> &str {
        self.sources
            .first()
            .and_then(|s| s.pixel_formats.first())
            .map_or("pixelFormat0", |f| f.name.as_str())
    }
}

/// Result of negotiating one `configure` action
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub reply: ActionReply,
    pub selection: Selection,
    /// The active surface is the flatbed
    pub flatbed: bool,
    /// Both sides of each sheet will be captured
    pub duplex: bool,
}

impl Negotiated {
    /// Facts derived from the device as it stands
    pub fn from_device<D: CapabilityDevice + ?Sized>(
        reply: ActionReply,
        selection: Selection,
        device: &D,
    ) -> Self {
        let feeder = device.get(Capability::FeederEnabled);
        let sensing = device.get(Capability::AutomaticSenseMedium) == Some(1);
        let loaded = device.get(Capability::FeederLoaded);

        let flatbed = matches!(feeder, None | Some(0)) || (sensing && loaded == Some(0));
        let duplex = !flatbed && device.get(Capability::DuplexEnabled) == Some(1);

        Self {
            reply,
            selection,
            flatbed,
            duplex,
        }
    }
}

/// Why a stream stopped early
enum Abort {
    Task(TaskError),
    NextStream(String),
}

impl From<TaskError> for Abort {
    fn from(err: TaskError) -> Self {
        Abort::Task(err)
    }
}

/// Resolve and turn a `nextStream` outcome into an early return
fn step<D: CapabilityDevice + ?Sized>(
    device: &mut D,
    cap: Capability,
    candidates: &[Candidate],
) -> Result<Resolution, Abort> {
    escalate(resolve(device, cap, candidates)?)
}

fn escalate(resolution: Resolution) -> Result<Resolution, Abort> {
    match resolution {
        Resolution::NextStream { json_key } => Err(Abort::NextStream(json_key)),
        other => Ok(other),
    }
}

fn single(node: &Node, value: CapValue, json_key: String, original: &str) -> Candidate {
    Candidate {
        value,
        exception: node.exception.clone(),
        owner: node.owner,
        json_key,
        original: JsonValue::String(original.to_string()),
    }
}

/// Negotiate a `configure` action
pub fn select_stream<D: CapabilityDevice + ?Sized>(
    device: &mut D,
    action: &Action,
) -> Result<Negotiated, TaskError> {
    let mut reply = ActionReply::new(action.kind.as_str());

    if action.streams.is_empty() {
        debug!(json_key = %action.node.json_key, "No streams, keeping device defaults");
        return Ok(Negotiated::from_device(reply, Selection::default(), device));
    }

    let mut tried_any = false;
    let mut last_escalation = None;

    for stream in &action.streams {
        if stream.node.is_foreign() {
            debug!(json_key = %stream.node.json_key, "Skipping foreign stream");
            continue;
        }

        if tried_any {
            device.reset_all();
        }
        tried_any = true;

        match try_stream(device, stream) {
            Ok((stream_reply, selection)) => {
                info!(stream = %stream.name, sources = selection.sources.len(), "Stream selected");
                reply.streams.push(stream_reply);
                return Ok(Negotiated::from_device(reply, selection, device));
            }
            Err(Abort::Task(err)) => return Err(err),
            Err(Abort::NextStream(json_key)) => {
                info!(stream = %stream.name, json_key = %json_key, "Stream escalated to nextStream");
                last_escalation = Some(json_key);
            }
        }
    }

    match last_escalation {
        Some(json_key) => Err(TaskError::Exhausted { json_key }),
        None => {
            debug!("Every stream belongs to another vendor");
            Ok(Negotiated::from_device(reply, Selection::default(), device))
        }
    }
}

fn try_stream<D: CapabilityDevice + ?Sized>(
    device: &mut D,
    stream: &Stream,
) -> Result<(StreamReply, Selection), Abort> {
    let mut stream_reply = StreamReply::default();
    let mut selection = Selection {
        stream_name: stream.name.clone(),
        sources: Vec::new(),
    };

    for source in &stream.sources {
        if source.node.is_foreign() {
            debug!(json_key = %source.node.json_key, "Skipping foreign source");
            continue;
        }

        let surface = apply_source(device, source)?;
        let mut source_reply = SourceReply::new(surface.clone());
        let mut selected = SelectedSource {
            name: source.name.clone(),
            source: surface,
            pixel_formats: Vec::new(),
        };

        if let Some((format_reply, format)) = apply_pixel_formats(device, &source.pixel_formats)? {
            source_reply.pixel_formats.push(format_reply);
            selected.pixel_formats.push(format);
        }

        stream_reply.sources.push(source_reply);
        selection.sources.push(selected);
    }

    Ok((stream_reply, selection))
}

/// Put the device on the requested surface and name the surface it ended on
fn apply_source<D: CapabilityDevice + ?Sized>(
    device: &mut D,
    source: &Source,
) -> Result<String, Abort> {
    let mapping = source_mapping(&source.source).unwrap_or_else(|| {
        debug!(source = %source.source, json_key = %source.node.json_key, "Unknown source");
        SourceMapping::UNKNOWN
    });
    let key = source.node.key("source");
    let candidate = |value| single(&source.node, value, key.clone(), &source.source);

    if device.is_supported(Capability::AutomaticSenseMedium) {
        step(
            device,
            Capability::AutomaticSenseMedium,
            &[candidate(mapping.automatic_sense_medium)],
        )?;
    }

    let sensing = device.get(Capability::AutomaticSenseMedium) == Some(1);
    if !sensing {
        step(device, Capability::FeederEnabled, &[candidate(mapping.feeder_enabled)])?;
    }

    let mut surface = if sensing {
        "any"
    } else {
        match device.get(Capability::FeederEnabled) {
            Some(1) => "feeder",
            Some(0) => "flatbed",
            _ => "any",
        }
    };

    step(device, Capability::DuplexEnabled, &[candidate(mapping.duplex_enabled)])?;
    if surface == "feeder" && device.get(Capability::DuplexEnabled) != Some(1) {
        surface = "feederFront";
    }

    debug!(requested = %source.source, surface = surface, "Source applied");
    Ok(surface.to_string())
}

/// Try pixel formats in order; the first whose color mode the device takes
/// is applied with its attributes. If none is taken, the attributes of the
/// last one tried are applied on top of the device's current color mode.
fn apply_pixel_formats<D: CapabilityDevice + ?Sized>(
    device: &mut D,
    formats: &[PixelFormat],
) -> Result<Option<(PixelFormatReply, SelectedFormat)>, Abort> {
    let mut fallback = None;

    for format in formats {
        if format.node.is_foreign() {
            debug!(json_key = %format.node.json_key, "Skipping foreign pixel format");
            continue;
        }

        let value = pixel_type(&format.pixel_format).unwrap_or(INVALID_VALUE);
        let candidate = single(
            &format.node,
            value,
            format.node.key("pixelFormat"),
            &format.pixel_format,
        );

        if step(device, Capability::PixelType, &[candidate])?.is_accepted() {
            let mut reply = PixelFormatReply::new(format.pixel_format.clone());
            apply_attributes(device, &format.attributes, &mut reply)?;
            let selected = SelectedFormat {
                name: format.name.clone(),
                pixel_format: format.pixel_format.clone(),
            };
            return Ok(Some((reply, selected)));
        }
        fallback = Some(format);
    }

    let Some(format) = fallback else {
        return Ok(None);
    };

    let current = device
        .get(Capability::PixelType)
        .and_then(pixel_format_name)
        .map(str::to_string);
    let mut reply = PixelFormatReply::new(current.clone().unwrap_or_default());
    apply_attributes(device, &format.attributes, &mut reply)?;

    Ok(current.map(|pixel_format| {
        let selected = SelectedFormat {
            name: format.name.clone(),
            pixel_format,
        };
        (reply, selected)
    }))
}

fn apply_attributes<D: CapabilityDevice + ?Sized>(
    device: &mut D,
    attributes: &[Attribute],
    reply: &mut PixelFormatReply,
) -> Result<(), Abort> {
    let mut ordered: Vec<(u8, &Attribute, Option<AttributeKind>)> = attributes
        .iter()
        .filter(|a| {
            let foreign = a.node.is_foreign();
            if foreign {
                debug!(json_key = %a.node.json_key, "Skipping foreign attribute");
            }
            !foreign
        })
        .map(|a| {
            let kind = AttributeKind::parse(&a.attribute);
            (kind.map_or(UNKNOWN_ATTRIBUTE_RANK, AttributeKind::rank), a, kind)
        })
        .collect();
    // Stable, so attributes of equal rank keep task order
    ordered.sort_by_key(|(rank, _, _)| *rank);

    for (_, attribute, kind) in ordered {
        let Some(kind) = kind else {
            debug!(attribute = %attribute.attribute, json_key = %attribute.node.json_key, "Unknown attribute");
            escalate(apply_policy(
                &attribute.node.exception,
                &attribute.node.key("attribute"),
                &JsonValue::String(attribute.attribute.clone()),
            )?)?;
            continue;
        };

        let candidates: Vec<Candidate> = attribute
            .values
            .iter()
            .map(|v| Candidate {
                value: kind.to_cap_value(&v.value),
                exception: v.node.exception.clone(),
                owner: v.node.owner,
                json_key: v.node.json_key.clone(),
                original: v.value.clone(),
            })
            .collect();

        if let Resolution::Accepted { original, .. } = step(device, kind.capability(), &candidates)? {
            reply.accept(attribute.attribute.clone(), original);
        }
    }
    Ok(())
}
