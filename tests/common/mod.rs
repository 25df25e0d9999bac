//! Test payload generator: builds `oadrDistributeEvent` documents the way
//! a VTN would send them.

use chrono::{DateTime, Duration, Utc};

pub const REQUEST_ID: &str = "OadrDisReq092520_152645_178";
pub const VTN_ID: &str = "TH_VTN";

pub fn format_duration(d: Duration) -> String {
    let secs = d.num_seconds();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    format!("P0Y0M0DT{hours}H{minutes}M{seconds}S")
}

pub fn format_datetime(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Now, truncated to whole seconds so timestamps survive the XML
/// round-trip exactly.
pub fn now_rounded() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0).expect("valid timestamp")
}

#[derive(Clone)]
pub struct AdrInterval {
    pub duration: Duration,
    pub level: f64,
}

#[derive(Clone)]
pub struct AdrEvent {
    pub id: String,
    pub mod_number: u32,
    pub start: DateTime<Utc>,
    pub status: &'static str,
    pub priority: i64,
    pub test_event: bool,
    pub market_context: String,
    pub signal_name: String,
    pub startafter: Option<Duration>,
    pub response_required: &'static str,
    pub ven_ids: Vec<String>,
    pub group_ids: Vec<String>,
    pub resource_ids: Vec<String>,
    pub party_ids: Vec<String>,
    pub intervals: Vec<AdrInterval>,
}

impl AdrEvent {
    pub fn new(id: &str, start: DateTime<Utc>, status: &'static str) -> Self {
        Self {
            id: id.to_string(),
            mod_number: 1,
            start,
            status,
            priority: 1,
            test_event: false,
            market_context: "http://some-url".to_string(),
            signal_name: "simple".to_string(),
            startafter: None,
            response_required: "always",
            ven_ids: Vec::new(),
            group_ids: Vec::new(),
            resource_ids: Vec::new(),
            party_ids: Vec::new(),
            intervals: Vec::new(),
        }
    }

    pub fn with_interval(mut self, duration: Duration, level: f64) -> Self {
        self.intervals.push(AdrInterval { duration, level });
        self
    }

    pub fn with_mod_number(mut self, mod_number: u32) -> Self {
        self.mod_number = mod_number;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_startafter(mut self, bound: Duration) -> Self {
        self.startafter = Some(bound);
        self
    }

    pub fn with_status(mut self, status: &'static str) -> Self {
        self.status = status;
        self
    }

    pub fn as_test_event(mut self) -> Self {
        self.test_event = true;
        self
    }

    pub fn with_market_context(mut self, ctx: &str) -> Self {
        self.market_context = ctx.to_string();
        self
    }

    pub fn with_signal_name(mut self, name: &str) -> Self {
        self.signal_name = name.to_string();
        self
    }

    pub fn without_response(mut self) -> Self {
        self.response_required = "never";
        self
    }

    pub fn overall_duration(&self) -> Duration {
        self.intervals
            .iter()
            .fold(Duration::zero(), |acc, i| acc + i.duration)
    }

    fn intervals_xml(&self) -> String {
        self.intervals
            .iter()
            .enumerate()
            .map(|(index, interval)| {
                format!(
                    r#"<ei:interval>
                         <ical:duration><ical:duration>{duration}</ical:duration></ical:duration>
                         <ical:uid><ical:text>{index}</ical:text></ical:uid>
                         <ei:signalPayload>
                           <ei:payloadFloat><ei:value>{level}</ei:value></ei:payloadFloat>
                         </ei:signalPayload>
                       </ei:interval>"#,
                    duration = format_duration(interval.duration),
                    level = interval.level,
                )
            })
            .collect()
    }

    fn targets_xml(&self) -> String {
        let mut out = String::new();
        for id in &self.ven_ids {
            out.push_str(&format!("<ei:venID>{id}</ei:venID>"));
        }
        for id in &self.group_ids {
            out.push_str(&format!("<ei:groupID>{id}</ei:groupID>"));
        }
        for id in &self.resource_ids {
            out.push_str(&format!("<ei:resourceID>{id}</ei:resourceID>"));
        }
        for id in &self.party_ids {
            out.push_str(&format!("<ei:partyID>{id}</ei:partyID>"));
        }
        out
    }

    fn tolerance_xml(&self) -> String {
        match self.startafter {
            Some(bound) => format!(
                "<ical:tolerance><ical:tolerate><ical:startafter>{}</ical:startafter></ical:tolerate></ical:tolerance>",
                format_duration(bound)
            ),
            None => String::new(),
        }
    }

    pub fn to_xml(&self) -> String {
        format!(
            r#"<oadr:oadrEvent>
              <oadr:oadrResponseRequired>{response_required}</oadr:oadrResponseRequired>
              <ei:eiEvent>
                <ei:eventDescriptor>
                  <ei:eventID>{id}</ei:eventID>
                  <ei:modificationNumber>{mod_number}</ei:modificationNumber>
                  <ei:priority>{priority}</ei:priority>
                  <ei:eiMarketContext>
                    <emix:marketContext>{market_context}</emix:marketContext>
                  </ei:eiMarketContext>
                  <ei:createdDateTime>2020-01-01T13:00:00.000Z</ei:createdDateTime>
                  <ei:eventStatus>{status}</ei:eventStatus>
                  <ei:testEvent>{test_event}</ei:testEvent>
                  <ei:vtnComment></ei:vtnComment>
                </ei:eventDescriptor>
                <ei:eiActivePeriod>
                  <ical:properties>
                    <ical:dtstart>
                      <ical:date-time>{start}</ical:date-time>
                    </ical:dtstart>
                    <ical:duration><ical:duration>{duration}</ical:duration></ical:duration>
                    {tolerance}
                  </ical:properties>
                </ei:eiActivePeriod>
                <ei:eiEventSignals>
                  <ei:eiEventSignal>
                    <strm:intervals>{intervals}</strm:intervals>
                    <ei:signalName>{signal_name}</ei:signalName>
                    <ei:signalType>level</ei:signalType>
                    <ei:currentValue>
                      <ei:payloadFloat><ei:value>0.0</ei:value></ei:payloadFloat>
                    </ei:currentValue>
                  </ei:eiEventSignal>
                </ei:eiEventSignals>
                <ei:eiTarget>{targets}</ei:eiTarget>
              </ei:eiEvent>
            </oadr:oadrEvent>"#,
            response_required = self.response_required,
            id = self.id,
            mod_number = self.mod_number,
            priority = self.priority,
            market_context = self.market_context,
            status = self.status,
            test_event = if self.test_event { "True" } else { "False" },
            start = format_datetime(self.start),
            duration = format_duration(self.overall_duration()),
            tolerance = self.tolerance_xml(),
            intervals = self.intervals_xml(),
            signal_name = self.signal_name,
            targets = self.targets_xml(),
        )
    }
}

pub fn distribute_payload(events: &[AdrEvent]) -> String {
    distribute_payload_from(VTN_ID, events)
}

pub fn distribute_payload_from(vtn_id: &str, events: &[AdrEvent]) -> String {
    let body: String = events.iter().map(AdrEvent::to_xml).collect();
    format!(
        r#"<oadr:oadrDistributeEvent
             xmlns:oadr="http://openadr.org/oadr-2.0a/2012/07"
             xmlns:pyld="http://docs.oasis-open.org/ns/energyinterop/201110/payloads"
             xmlns:ei="http://docs.oasis-open.org/ns/energyinterop/201110"
             xmlns:emix="http://docs.oasis-open.org/ns/emix/2011/06"
             xmlns:strm="urn:ietf:params:xml:ns:icalendar-2.0:stream"
             xmlns:ical="urn:ietf:params:xml:ns:icalendar-2.0">
           <pyld:requestID>{REQUEST_ID}</pyld:requestID>
           <ei:vtnID>{vtn_id}</ei:vtnID>
           {body}
         </oadr:oadrDistributeEvent>"#
    )
}

/// All text values of descendant elements with the given local name, in
/// document order.
pub fn reply_fields(xml: &str, local_name: &str) -> Vec<String> {
    let doc = roxmltree::Document::parse(xml).expect("reply should be well-formed XML");
    doc.descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == local_name)
        .map(|n| n.text().unwrap_or_default().trim().to_string())
        .collect()
}

pub fn reply_field(xml: &str, local_name: &str) -> Option<String> {
    reply_fields(xml, local_name).into_iter().next()
}
