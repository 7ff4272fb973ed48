//! Core data types: subscriptions, filters, envelopes, and the shapes the
//! management surface and statistics surface exchange with callers.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DispatchError, Result};

/// Third-party automation platform a subscription delivers to. Affects only
/// which additive header is injected (§4.3); otherwise all platforms are
/// delivered to identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Zapier,
    Make,
    N8n,
    Pipedream,
    Custom,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Zapier => "zapier",
            Platform::Make => "make",
            Platform::N8n => "n8n",
            Platform::Pipedream => "pipedream",
            Platform::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// The closed set of webhook event kinds a subscription may be registered
/// against. Upstream bus event types are translated into this set by the
/// router's mapping table (§6); a few additional kinds exist here only as
/// targets that future routings may populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LinkCreated,
    LinkClicked,
    LinkUpdated,
    LinkDeleted,
    LinkMilestone,
    QrScanned,
    PagePublished,
    PageViewed,
    CommentCreated,
    UserInvited,
    CampaignStarted,
    CampaignEnded,
    FormSubmitted,
    ConversionTracked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LinkCreated => "link.created",
            EventKind::LinkClicked => "link.clicked",
            EventKind::LinkUpdated => "link.updated",
            EventKind::LinkDeleted => "link.deleted",
            EventKind::LinkMilestone => "link.milestone",
            EventKind::QrScanned => "qr.scanned",
            EventKind::PagePublished => "page.published",
            EventKind::PageViewed => "page.viewed",
            EventKind::CommentCreated => "comment.created",
            EventKind::UserInvited => "user.invited",
            EventKind::CampaignStarted => "campaign.started",
            EventKind::CampaignEnded => "campaign.ended",
            EventKind::FormSubmitted => "form.submitted",
            EventKind::ConversionTracked => "conversion.tracked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "link.created" => EventKind::LinkCreated,
            "link.clicked" => EventKind::LinkClicked,
            "link.updated" => EventKind::LinkUpdated,
            "link.deleted" => EventKind::LinkDeleted,
            "link.milestone" => EventKind::LinkMilestone,
            "qr.scanned" => EventKind::QrScanned,
            "page.published" => EventKind::PagePublished,
            "page.viewed" => EventKind::PageViewed,
            "comment.created" => EventKind::CommentCreated,
            "user.invited" => EventKind::UserInvited,
            "campaign.started" => EventKind::CampaignStarted,
            "campaign.ended" => EventKind::CampaignEnded,
            "form.submitted" => EventKind::FormSubmitted,
            "conversion.tracked" => EventKind::ConversionTracked,
            _ => return None,
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full closed set of recognized event kinds, for the management
/// surface's `get_events()` contract (§6).
pub fn all_event_kinds() -> &'static [EventKind] {
    &[
        EventKind::LinkCreated,
        EventKind::LinkClicked,
        EventKind::LinkUpdated,
        EventKind::LinkDeleted,
        EventKind::LinkMilestone,
        EventKind::QrScanned,
        EventKind::PagePublished,
        EventKind::PageViewed,
        EventKind::CommentCreated,
        EventKind::UserInvited,
        EventKind::CampaignStarted,
        EventKind::CampaignEnded,
        EventKind::FormSubmitted,
        EventKind::ConversionTracked,
    ]
}

/// The full closed set of supported platforms, for the management
/// surface's `get_platforms()` contract (§6).
pub fn all_platforms() -> &'static [Platform] {
    &[Platform::Zapier, Platform::Make, Platform::N8n, Platform::Pipedream, Platform::Custom]
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventKind::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown event kind: {s}")))
    }
}

/// A single filter condition: `field_path` is looked up at the top level of
/// the event payload (no nested path resolution).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub field_path: String,
    pub operator: Operator,
    pub compare_value: Value,
}

/// Comparison operator for a filter condition. Deserialization accepts any
/// string so that a record written by a future version with a not-yet-known
/// operator still loads; `Operator::Unknown` is evaluated leniently
/// (§4.2) but rejected at subscription creation/update time so that
/// `create`/`update` callers of this implementation can never introduce one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
    StartsWith,
    Unknown(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::Unknown(s) => s,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Operator::Unknown(_))
    }
}

impl Serialize for Operator {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "lt" => Operator::Lt,
            "contains" => Operator::Contains,
            "starts_with" => Operator::StartsWith,
            _ => Operator::Unknown(s),
        })
    }
}

/// Structured predicate evaluated by the filter evaluator against an
/// event's `data` payload. Absent entirely (`None` on `Subscription`)
/// means "always matches".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    #[serde(default)]
    pub link_ids: Vec<String>,
    #[serde(default)]
    pub page_ids: Vec<String>,
    #[serde(default)]
    pub campaign_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Filter {
    /// Validates that every condition uses a known operator. Called on the
    /// create/update path so a caller of this implementation can never
    /// persist a filter the evaluator would have to fall back on.
    pub fn validate_operators(&self) -> Result<()> {
        for condition in &self.conditions {
            if !condition.operator.is_known() {
                return Err(DispatchError::invalid_input(format!(
                    "unknown filter operator: {}",
                    condition.operator.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// A tenant-owned registration of where to send which webhook event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub tenant_id: String,
    pub owner_id: Option<String>,
    pub platform: Platform,
    pub name: String,
    pub target_url: String,
    pub event_kind: EventKind,
    pub enabled: bool,
    pub secret: String,
    pub filters: Option<Filter>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_URL_LEN: usize = 2048;
pub const MIN_SECRET_BYTES: usize = 32;

/// Validates a target URL against the invariant in §3: must parse as an
/// absolute URL with scheme http or https.
pub fn validate_target_url(raw: &str) -> Result<()> {
    if raw.len() > MAX_URL_LEN {
        return Err(DispatchError::invalid_input("target_url exceeds maximum length"));
    }
    let parsed = url::Url::parse(raw)
        .map_err(|e| DispatchError::invalid_input(format!("invalid target_url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(DispatchError::invalid_input(format!(
            "target_url scheme must be http or https, got {other}"
        ))),
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DispatchError::invalid_input(format!(
            "name must be 1..={MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_secret(secret: &str) -> Result<()> {
    if secret.len() < MIN_SECRET_BYTES {
        return Err(DispatchError::invalid_input(format!(
            "secret must be at least {MIN_SECRET_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Input to `SubscriptionStore::create`.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionInput {
    pub owner_id: Option<String>,
    pub platform: Platform,
    pub name: String,
    pub target_url: String,
    pub event_kind: EventKind,
    pub filters: Option<Filter>,
    pub extra_headers: HashMap<String, String>,
    /// If absent, a fresh secret is generated.
    pub secret: Option<String>,
    /// Defaults to `true`.
    pub enabled: Option<bool>,
}

/// Partial update applied by `SubscriptionStore::update`. Only present
/// fields are merged into the stored record; the merged record is then
/// revalidated exactly as on create.
#[derive(Debug, Clone, Default)]
pub struct UpdateSubscriptionPatch {
    pub platform: Option<Platform>,
    pub name: Option<String>,
    pub target_url: Option<String>,
    pub event_kind: Option<EventKind>,
    pub enabled: Option<bool>,
    pub filters: Option<Filter>,
    pub extra_headers: Option<HashMap<String, String>>,
}

/// Whitelisted sort fields for `list`. Anything else falls back to
/// `CreatedAt` descending (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    Name,
    SuccessCount,
    FailureCount,
    LastTriggeredAt,
    Platform,
    Enabled,
}

impl SortField {
    pub fn parse_or_default(s: Option<&str>) -> Self {
        match s {
            Some("created_at") => SortField::CreatedAt,
            Some("updated_at") => SortField::UpdatedAt,
            Some("name") => SortField::Name,
            Some("success_count") => SortField::SuccessCount,
            Some("failure_count") => SortField::FailureCount,
            Some("last_triggered_at") => SortField::LastTriggeredAt,
            Some("platform") => SortField::Platform,
            Some("enabled") => SortField::Enabled,
            _ => SortField::CreatedAt,
        }
    }
}

pub const MAX_LIST_LIMIT: u32 = 100;

/// Query parameters for `SubscriptionStore::list`.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub platform: Option<Platform>,
    pub enabled: Option<bool>,
    pub search: Option<String>,
    pub sort: SortField,
    pub page: u32,
    pub limit: u32,
}

impl ListQuery {
    /// Clamps `limit` to `MAX_LIST_LIMIT` and resolves the sort field,
    /// falling back to the documented default (§4.1).
    pub fn normalize(
        platform: Option<Platform>,
        enabled: Option<bool>,
        search: Option<String>,
        sort: Option<&str>,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Self {
        Self {
            platform,
            enabled,
            search,
            sort: SortField::parse_or_default(sort),
            page: page.unwrap_or(0),
            limit: limit.map(|l| l.min(MAX_LIST_LIMIT)).unwrap_or(MAX_LIST_LIMIT),
        }
    }
}

/// A decoded message off the bus, before kind translation (§6 wire shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// The canonical outbound envelope (§4.3). Field order here is irrelevant;
/// the order fields are emitted in JSON is whatever serde_json produces —
/// signing covers whatever bytes are actually sent, not a fixed ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    pub data: Value,
    pub timestamp: String,
    #[serde(rename = "teamId")]
    pub team_id: String,
    #[serde(rename = "webhookId")]
    pub webhook_id: String,
}

/// Outcome of a manual test delivery (§4.3); never mutates subscription
/// counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDeliveryOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    #[serde(rename = "responseTime")]
    pub response_time_ms: u64,
    pub error: Option<String>,
}

/// Per-tenant aggregate (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStats {
    pub total: u64,
    pub enabled: u64,
    pub by_platform: HashMap<String, u64>,
    pub by_event_kind: HashMap<String, u64>,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Process-wide aggregate (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub total: u64,
    pub enabled: u64,
    pub with_failures: u64,
    pub total_deliveries: u64,
    pub success_rate: f64,
    pub by_platform: HashMap<String, u64>,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
