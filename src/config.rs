//! VEN configuration.

use std::time::Duration;

use clap::ValueEnum;

pub const DEFAULT_CONTROL_INTERVAL: Duration = Duration::from_secs(30);

/// OpenADR profile; selects the XML namespace map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OadrProfile {
    #[default]
    #[value(name = "2.0a")]
    A,
    #[value(name = "2.0b")]
    B,
}

#[derive(Debug, Clone)]
pub struct VenConfig {
    /// This VEN's identifier.
    pub ven_id: String,
    /// Accepted VTN ids; empty accepts any.
    pub vtn_ids: Vec<String>,
    /// Accepted market contexts; empty accepts any.
    pub market_contexts: Vec<String>,
    /// Membership identifiers used for target matching.
    pub group_id: Option<String>,
    pub resource_id: Option<String>,
    pub party_id: Option<String>,
    pub profile: OadrProfile,
    pub control_interval: Duration,
}

impl VenConfig {
    pub fn new(ven_id: impl Into<String>) -> Self {
        Self {
            ven_id: ven_id.into(),
            vtn_ids: Vec::new(),
            market_contexts: Vec::new(),
            group_id: None,
            resource_id: None,
            party_id: None,
            profile: OadrProfile::A,
            control_interval: DEFAULT_CONTROL_INTERVAL,
        }
    }
}
