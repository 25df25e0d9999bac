//! OpenADR 2.0a/b payload codec.
//!
//! Reading is schema-driven against the `oadrDistributeEvent` grammar with
//! namespace-aware lookups (any prefix the VTN chooses works); writing
//! produces the `oadrCreatedEvent` and `oadrRequestEvent` documents the VEN
//! sends back.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use quick_xml::Writer;
use roxmltree::{Document, Node};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::config::OadrProfile;
use crate::event::{Event, EventStatus, SignalInterval, TargetSets};
use crate::schedule;

pub const OADR_XMLNS_A: &str = "http://openadr.org/oadr-2.0a/2012/07";
pub const OADR_XMLNS_B: &str = "http://openadr.org/oadr-2.0b/2012/07";
pub const PYLD_XMLNS: &str = "http://docs.oasis-open.org/ns/energyinterop/201110/payloads";
pub const EI_XMLNS: &str = "http://docs.oasis-open.org/ns/energyinterop/201110";
pub const EMIX_XMLNS: &str = "http://docs.oasis-open.org/ns/emix/2011/06";
pub const XCAL_XMLNS: &str = "urn:ietf:params:xml:ns:icalendar-2.0";
pub const STRM_XMLNS: &str = "urn:ietf:params:xml:ns:icalendar-2.0:stream";

/// The only signal profile this VEN consumes (2.0a conformance rule).
pub const SIMPLE_SIGNAL_NAME: &str = "simple";
pub const VALID_SIGNAL_TYPES: [&str; 4] = ["level", "price", "delta", "setpoint"];

/// Namespace map for one profile. Only the `oadr` namespace differs
/// between 2.0a and 2.0b.
#[derive(Debug, Clone, Copy)]
pub struct NsMap {
    pub oadr: &'static str,
    pub pyld: &'static str,
    pub ei: &'static str,
    pub emix: &'static str,
    pub xcal: &'static str,
    pub strm: &'static str,
}

impl NsMap {
    pub fn for_profile(profile: OadrProfile) -> NsMap {
        NsMap {
            oadr: match profile {
                OadrProfile::A => OADR_XMLNS_A,
                OadrProfile::B => OADR_XMLNS_B,
            },
            pyld: PYLD_XMLNS,
            ei: EI_XMLNS,
            emix: EMIX_XMLNS,
            xcal: XCAL_XMLNS,
            strm: STRM_XMLNS,
        }
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("expected {0} document")]
    WrongRoot(&'static str),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid {element}: {detail}")]
    Invalid {
        element: &'static str,
        detail: String,
    },
    #[error("failed to serialize payload: {0}")]
    Write(String),
}

fn invalid(element: &'static str, err: impl ToString) -> PayloadError {
    PayloadError::Invalid {
        element,
        detail: err.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseRequired {
    Always,
    Never,
}

/// One `oadr:oadrEvent` entry of a broadcast.
#[derive(Debug)]
pub struct EventEnvelope {
    pub response_required: ResponseRequired,
    pub event: Event,
}

/// A parsed `oadrDistributeEvent`.
#[derive(Debug)]
pub struct DistributeEvent {
    pub request_id: String,
    pub vtn_id: Option<String>,
    pub events: Vec<EventEnvelope>,
    /// Ids salvaged from entries that failed to parse; still counted as
    /// present in the broadcast so a parse hiccup cannot implicitly cancel
    /// a live event.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptType {
    OptIn,
    OptOut,
}

impl OptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptType::OptIn => "optIn",
            OptType::OptOut => "optOut",
        }
    }
}

/// One entry of the `ei:eventResponses` list in a reply.
#[derive(Debug, Clone)]
pub struct ReplyEntry {
    pub event_id: String,
    pub mod_number: u32,
    pub request_id: String,
    pub opt: OptType,
    pub response_code: u16,
}

// Reading

fn child<'a, 'i>(node: Node<'a, 'i>, ns: &str, name: &str) -> Option<Node<'a, 'i>> {
    node.children()
        .find(|n| n.is_element() && n.has_tag_name((ns, name)))
}

fn find<'a, 'i>(node: Node<'a, 'i>, path: &[(&str, &str)]) -> Option<Node<'a, 'i>> {
    path.iter()
        .try_fold(node, |n, &(ns, name)| child(n, ns, name))
}

fn text_at<'a>(node: Node<'a, '_>, path: &[(&str, &str)]) -> Option<&'a str> {
    find(node, path)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parse an `oadrDistributeEvent` document. Individual event entries that
/// fail to parse are logged and skipped; the broadcast as a whole only
/// fails when the document itself is unusable.
pub fn parse_distribute_event(xml: &str, ns: &NsMap) -> Result<DistributeEvent, PayloadError> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();
    if !root.has_tag_name((ns.oadr, "oadrDistributeEvent")) {
        return Err(PayloadError::WrongRoot("oadr:oadrDistributeEvent"));
    }

    let request_id = text_at(root, &[(ns.pyld, "requestID")])
        .unwrap_or_default()
        .to_string();
    let vtn_id = text_at(root, &[(ns.ei, "vtnID")]).map(str::to_string);

    let mut events = Vec::new();
    let mut skipped = Vec::new();
    for entry in root
        .children()
        .filter(|n| n.is_element() && n.has_tag_name((ns.oadr, "oadrEvent")))
    {
        let response_required =
            match text_at(entry, &[(ns.oadr, "oadrResponseRequired")]) {
                Some("always") => ResponseRequired::Always,
                _ => ResponseRequired::Never,
            };
        let Some(ei_event) = child(entry, ns.ei, "eiEvent") else {
            warn!("skipping oadrEvent without an ei:eiEvent body");
            continue;
        };
        match parse_event(ei_event, ns) {
            Ok(event) => events.push(EventEnvelope {
                response_required,
                event,
            }),
            Err(err) => {
                let id = salvage_event_id(ei_event, ns);
                warn!(
                    event_id = id.as_deref().unwrap_or("<unknown>"),
                    error = %err,
                    "skipping malformed event entry"
                );
                if let Some(id) = id {
                    skipped.push(id);
                }
            }
        }
    }

    Ok(DistributeEvent {
        request_id,
        vtn_id,
        events,
        skipped,
    })
}

fn salvage_event_id(ei_event: Node, ns: &NsMap) -> Option<String> {
    ei_event
        .descendants()
        .find(|n| n.has_tag_name((ns.ei, "eventID")))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Parse one `ei:eiEvent` into the typed model, deriving the effective
/// start (with the deterministic `startafter` draw) and the nominal end.
pub fn parse_event(ei_event: Node, ns: &NsMap) -> Result<Event, PayloadError> {
    let descriptor = child(ei_event, ns.ei, "eventDescriptor")
        .ok_or(PayloadError::Missing("ei:eventDescriptor"))?;

    let id = text_at(descriptor, &[(ns.ei, "eventID")])
        .ok_or(PayloadError::Missing("ei:eventID"))?
        .to_string();
    let mod_number = text_at(descriptor, &[(ns.ei, "modificationNumber")])
        .ok_or(PayloadError::Missing("ei:modificationNumber"))?
        .parse::<u32>()
        .map_err(|e| invalid("ei:modificationNumber", e))?;
    let priority = match text_at(descriptor, &[(ns.ei, "priority")]) {
        Some(p) => p.parse::<i64>().map_err(|e| invalid("ei:priority", e))?,
        None => 0,
    };
    let market_context = text_at(
        descriptor,
        &[(ns.ei, "eiMarketContext"), (ns.emix, "marketContext")],
    )
    .map(str::to_string);
    let status = EventStatus::from_wire(
        text_at(descriptor, &[(ns.ei, "eventStatus")])
            .ok_or(PayloadError::Missing("ei:eventStatus"))?,
    );
    // anything but an explicit "false" marks a test event
    let test_event = text_at(descriptor, &[(ns.ei, "testEvent")])
        .map(|t| !t.eq_ignore_ascii_case("false"))
        .unwrap_or(false);

    let properties = find(
        ei_event,
        &[(ns.ei, "eiActivePeriod"), (ns.xcal, "properties")],
    )
    .ok_or(PayloadError::Missing("ei:eiActivePeriod"))?;
    let original_start = schedule::parse_datetime(
        text_at(properties, &[(ns.xcal, "dtstart"), (ns.xcal, "date-time")])
            .ok_or(PayloadError::Missing("xcal:dtstart"))?,
    )
    .map_err(|e| invalid("xcal:date-time", e))?;
    let start_offset_bound = text_at(
        properties,
        &[
            (ns.xcal, "tolerance"),
            (ns.xcal, "tolerate"),
            (ns.xcal, "startafter"),
        ],
    )
    .map(schedule::parse_duration)
    .transpose()
    .map_err(|e| invalid("xcal:startafter", e))?;

    let signals = parse_signals(ei_event, ns)?;

    let mut targets = TargetSets::default();
    if let Some(target) = child(ei_event, ns.ei, "eiTarget") {
        for n in target.children().filter(|n| n.is_element()) {
            let Some(text) = n.text().map(str::trim).filter(|t| !t.is_empty()) else {
                continue;
            };
            match n.tag_name().name() {
                "venID" => targets.ven_ids.push(text.to_string()),
                "groupID" => targets.group_ids.push(text.to_string()),
                "resourceID" => targets.resource_ids.push(text.to_string()),
                "partyID" => targets.party_ids.push(text.to_string()),
                _ => {}
            }
        }
    }

    let start = match start_offset_bound {
        Some(bound) => original_start + schedule::start_offset(&id, bound),
        None => original_start,
    };
    // the startafter tolerance also bounds the cancellation tail
    let cancellation_offset = start_offset_bound;

    let mut event = Event {
        id,
        mod_number,
        status,
        priority,
        market_context,
        test_event,
        original_start,
        start,
        start_offset_bound,
        cancellation_offset,
        end: None,
        signals,
        targets,
    };
    event.end = event.nominal_end();
    Ok(event)
}

/// Pick the single `simple` signal of a supported type and parse its
/// intervals. No qualifying signal yields an empty profile, which the
/// acceptance pipeline answers with an opt-out.
fn parse_signals(ei_event: Node, ns: &NsMap) -> Result<Vec<SignalInterval>, PayloadError> {
    let Some(signals_el) = child(ei_event, ns.ei, "eiEventSignals") else {
        return Ok(Vec::new());
    };
    let simple = signals_el
        .children()
        .filter(|n| n.is_element() && n.has_tag_name((ns.ei, "eiEventSignal")))
        .find(|sig| {
            text_at(*sig, &[(ns.ei, "signalName")]) == Some(SIMPLE_SIGNAL_NAME)
                && text_at(*sig, &[(ns.ei, "signalType")])
                    .map(|t| VALID_SIGNAL_TYPES.contains(&t))
                    .unwrap_or(false)
        });
    let Some(simple) = simple else {
        return Ok(Vec::new());
    };
    let Some(intervals_el) = child(simple, ns.strm, "intervals") else {
        return Ok(Vec::new());
    };

    let mut signals = Vec::new();
    for (position, interval) in intervals_el
        .children()
        // VTNs emit intervals in either the ei or the strm namespace
        .filter(|n| n.is_element() && n.tag_name().name() == "interval")
        .enumerate()
    {
        let duration = schedule::parse_duration(
            text_at(interval, &[(ns.xcal, "duration"), (ns.xcal, "duration")])
                .ok_or(PayloadError::Missing("xcal:duration"))?,
        )
        .map_err(|e| invalid("xcal:duration", e))?;
        let index = match text_at(interval, &[(ns.xcal, "uid"), (ns.xcal, "text")]) {
            Some(uid) => uid.parse::<u32>().unwrap_or_else(|_| {
                warn!(uid, "non-numeric interval uid, falling back to document order");
                position as u32
            }),
            None => position as u32,
        };
        let level = interval
            .descendants()
            .find(|n| n.has_tag_name((ns.ei, "value")))
            .and_then(|n| n.text())
            .ok_or(PayloadError::Missing("ei:signalPayload value"))?
            .trim()
            .parse::<f64>()
            .map_err(|e| invalid("ei:signalPayload value", e))?;
        signals.push(SignalInterval {
            index,
            duration,
            level,
        });
    }
    signals.sort_by_key(|s| s.index);
    Ok(signals)
}

// Writing

type XmlWriter = Writer<Vec<u8>>;

fn open(w: &mut XmlWriter, tag: &str) -> quick_xml::Result<()> {
    w.write_event(XmlEvent::Start(BytesStart::new(tag)))?;
    Ok(())
}

fn close(w: &mut XmlWriter, tag: &str) -> quick_xml::Result<()> {
    w.write_event(XmlEvent::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn leaf(w: &mut XmlWriter, tag: &str, text: &str) -> quick_xml::Result<()> {
    open(w, tag)?;
    if !text.is_empty() {
        w.write_event(XmlEvent::Text(BytesText::new(text)))?;
    }
    close(w, tag)
}

fn created_event_root(ns: &NsMap) -> BytesStart<'static> {
    let mut root = BytesStart::new("oadr:oadrCreatedEvent");
    root.push_attribute(("xmlns:oadr", ns.oadr));
    root.push_attribute(("xmlns:pyld", ns.pyld));
    root.push_attribute(("xmlns:ei", ns.ei));
    root
}

fn finish(w: XmlWriter) -> Result<String, PayloadError> {
    String::from_utf8(w.into_inner()).map_err(|e| PayloadError::Write(e.to_string()))
}

/// Build the `oadrCreatedEvent` reply for events that required a response.
/// The top-level `requestID` is left empty: the counterparty reads the
/// request id from each `eventResponse` entry.
pub fn build_created_event(
    ven_id: &str,
    entries: &[ReplyEntry],
    ns: &NsMap,
) -> Result<String, PayloadError> {
    let mut w = Writer::new(Vec::new());
    (|| -> quick_xml::Result<()> {
        w.write_event(XmlEvent::Start(created_event_root(ns)))?;
        open(&mut w, "pyld:eiCreatedEvent")?;
        open(&mut w, "ei:eiResponse")?;
        leaf(&mut w, "ei:responseCode", "200")?;
        leaf(&mut w, "pyld:requestID", "")?;
        close(&mut w, "ei:eiResponse")?;
        open(&mut w, "ei:eventResponses")?;
        for entry in entries {
            open(&mut w, "ei:eventResponse")?;
            leaf(&mut w, "ei:responseCode", &entry.response_code.to_string())?;
            leaf(&mut w, "pyld:requestID", &entry.request_id)?;
            open(&mut w, "ei:qualifiedEventID")?;
            leaf(&mut w, "ei:eventID", &entry.event_id)?;
            leaf(&mut w, "ei:modificationNumber", &entry.mod_number.to_string())?;
            close(&mut w, "ei:qualifiedEventID")?;
            leaf(&mut w, "ei:optType", entry.opt.as_str())?;
            close(&mut w, "ei:eventResponse")?;
        }
        close(&mut w, "ei:eventResponses")?;
        leaf(&mut w, "ei:venID", ven_id)?;
        close(&mut w, "pyld:eiCreatedEvent")?;
        close(&mut w, "oadr:oadrCreatedEvent")
    })()
    .map_err(|e| PayloadError::Write(e.to_string()))?;
    finish(w)
}

/// Build the broadcast-level error reply. Unlike the success reply this
/// one echoes the offending broadcast's `requestID` at the top level.
pub fn build_error_response(
    ven_id: &str,
    request_id: &str,
    code: u16,
    description: &str,
    ns: &NsMap,
) -> Result<String, PayloadError> {
    let mut w = Writer::new(Vec::new());
    (|| -> quick_xml::Result<()> {
        w.write_event(XmlEvent::Start(created_event_root(ns)))?;
        open(&mut w, "pyld:eiCreatedEvent")?;
        open(&mut w, "ei:eiResponse")?;
        leaf(&mut w, "ei:responseCode", &code.to_string())?;
        if !description.is_empty() {
            leaf(&mut w, "ei:responseDescription", description)?;
        }
        leaf(&mut w, "pyld:requestID", request_id)?;
        close(&mut w, "ei:eiResponse")?;
        leaf(&mut w, "ei:venID", ven_id)?;
        close(&mut w, "pyld:eiCreatedEvent")?;
        close(&mut w, "oadr:oadrCreatedEvent")
    })()
    .map_err(|e| PayloadError::Write(e.to_string()))?;
    finish(w)
}

/// Build the `oadrRequestEvent` the poll carrier posts to the VTN.
pub fn build_request_event(ven_id: &str, ns: &NsMap) -> Result<String, PayloadError> {
    let mut w = Writer::new(Vec::new());
    (|| -> quick_xml::Result<()> {
        let mut root = BytesStart::new("oadr:oadrRequestEvent");
        root.push_attribute(("xmlns:oadr", ns.oadr));
        root.push_attribute(("xmlns:pyld", ns.pyld));
        root.push_attribute(("xmlns:ei", ns.ei));
        w.write_event(XmlEvent::Start(root))?;
        open(&mut w, "pyld:eiRequestEvent")?;
        leaf(&mut w, "pyld:requestID", &Uuid::new_v4().to_string())?;
        leaf(&mut w, "ei:venID", ven_id)?;
        leaf(&mut w, "pyld:replyLimit", "99")?;
        close(&mut w, "pyld:eiRequestEvent")?;
        close(&mut w, "oadr:oadrRequestEvent")
    })()
    .map_err(|e| PayloadError::Write(e.to_string()))?;
    finish(w)
}
