use chrono::NaiveDate;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

use crate::capabilities::{KeyNamespace, KvError, KvKey};

/// Marker value the server uses for a read message.
pub const READ_MARKER: &str = "yes";

/// Server-assigned message id. Strictly increasing across a tenant's stream,
/// which makes it the only field usable as a sync cursor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

// The portal API is not consistent about numeric fields: ids arrive as
// numbers from some endpoints and as numeric strings from others.
impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Scalar::deserialize(deserializer)? {
            Scalar::Unsigned(n) => Ok(Self(n)),
            Scalar::Text(s) => s
                .trim()
                .parse()
                .map(Self)
                .map_err(|_| de::Error::custom(format!("invalid message id: {s:?}"))),
            other => Err(de::Error::custom(format!(
                "invalid message id: {}",
                other.into_string()
            ))),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Unsigned(n) => n.to_string(),
            Scalar::Signed(n) => n.to_string(),
            Scalar::Float(n) => n.to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Text(s) => s,
        }
    }
}

/// Accepts a string, number, bool or null and keeps it as text.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(Scalar::into_string))
}

/// Grouping key shared by a request and the notifications it fans out to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TopicId(String);

impl TopicId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TopicId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(Scalar::deserialize(deserializer)?.into_string()))
    }
}

/// One row of the notification feed.
///
/// Known fields are kept as text exactly as sent, blank values included.
/// Fields the engine does not interpret are kept verbatim in `extra`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_topic")]
    pub topicid: Option<TopicId>,

    /// Null or missing reads as empty, which fails retention.
    #[serde(default, deserialize_with = "lenient_dat")]
    pub dat: String,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub isread: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub rtime: Option<String>,

    #[serde(
        rename = "concessionApprovalStatus",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_string"
    )]
    pub decision_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub classid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub sectionid: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn lenient_topic<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<TopicId>, D::Error> {
    Ok(lenient_string(deserializer)?.map(TopicId))
}

fn lenient_dat<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

impl Message {
    pub fn new(id: u64, dat: impl Into<String>) -> Self {
        Self {
            id: MessageId(id),
            topicid: None,
            dat: dat.into(),
            isread: None,
            rtime: None,
            decision_status: None,
            title: None,
            content: None,
            classid: None,
            sectionid: None,
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topicid = Some(TopicId::new(topic));
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>, content: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self.content = Some(content.into());
        self
    }

    pub fn is_read(&self) -> bool {
        self.isread.as_deref() == Some(READ_MARKER)
    }

    /// Calendar date of `dat`. Accepts `YYYY-MM-DD` with or without a time part.
    pub fn date(&self) -> Option<NaiveDate> {
        let day = self.dat.trim().get(..10)?;
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }

    /// A blank topic groups nothing, not even other blank rows.
    pub fn belongs_to(&self, topic: &TopicId) -> bool {
        !topic.as_str().trim().is_empty() && self.topicid.as_ref() == Some(topic)
    }
}

/// Identity the feed is synced for. Read-only to this crate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub branchid: String,
    pub owner: String,
    pub role: String,
    /// One phone may map to several student records; the delta query needs all of them.
    #[serde(default)]
    pub enrollment_ids: Vec<String>,
}

impl TenantContext {
    pub fn new(
        branchid: impl Into<String>,
        owner: impl Into<String>,
        role: impl Into<String>,
        enrollment_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            branchid: branchid.into(),
            owner: owner.into(),
            role: role.into(),
            enrollment_ids: enrollment_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tenant_key(&self) -> &str {
        &self.branchid
    }

    /// Rejects contexts whose branch id cannot be used as a storage key.
    pub fn validate(&self) -> Result<(), KvError> {
        KvKey::new(KeyNamespace::Messages, self.branchid.as_str()).map(|_| ())
    }
}

/// Response of the delta-feed endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaFeed {
    #[serde(default)]
    pub new_messages: Vec<Message>,
    #[serde(default)]
    pub scheduled_messages: Vec<Message>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(deserialize_with = "required_lenient_string")]
    pub confirmed_read_time: String,
}

fn required_lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    lenient_string(deserializer)?.ok_or_else(|| de::Error::custom("missing value"))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Declined,
}

impl Decision {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Declined => "declined",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approved" | "approve" => Ok(Self::Approved),
            "declined" | "decline" | "rejected" | "reject" => Ok(Self::Declined),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}
