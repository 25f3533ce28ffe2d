//! Canonical statement model and entity normalization.
//!
//! Everything in this crate is pure: a [`Statement`] is a typed view over an
//! inbound JSON record, and [`normalize`] turns it into the four entity rows
//! the relational store persists. Storage and delivery concerns live in the
//! store and worker crates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};

/// Localization preferred when resolving language maps.
pub const PREFERRED_LANGUAGE: &str = "en-US";

const DEFAULT_ACTOR_OBJECT_TYPE: &str = "Agent";
const DEFAULT_ACTIVITY_OBJECT_TYPE: &str = "Activity";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum NormalizationError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

impl NormalizationError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Text resolved from a language map together with the tag it came from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LocalizedText {
    pub text: String,
    pub language: String,
}

/// Optional-field accessor over one JSON object inside a statement.
///
/// Absent keys and explicit `null` both read as `None`; a value of the wrong
/// JSON type is an [`NormalizationError::InvalidField`] naming the full path.
#[derive(Debug, Clone)]
pub struct Fields<'a> {
    path: String,
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
    #[must_use]
    pub fn new(path: impl Into<String>, map: Option<&'a Map<String, Value>>) -> Self {
        Self {
            path: path.into(),
            map,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.map.is_some()
    }

    fn field_path(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.path)
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map
            .and_then(|map| map.get(key))
            .filter(|value| !value.is_null())
    }

    /// Reads a string field.
    ///
    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when the value is not a string.
    pub fn str(&self, key: &str) -> Result<Option<&'a str>, NormalizationError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.as_str())),
            Some(other) => Err(NormalizationError::invalid(
                self.field_path(key),
                format!("expected string, found {}", json_kind(other)),
            )),
        }
    }

    /// Reads a string field, trimmed, treating blank text as absent.
    ///
    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when the value is not a string.
    pub fn non_empty_str(&self, key: &str) -> Result<Option<&'a str>, NormalizationError> {
        Ok(self
            .str(key)?
            .map(str::trim)
            .filter(|value| !value.is_empty()))
    }

    /// Reads a required non-blank string field.
    ///
    /// # Errors
    /// Returns [`NormalizationError::MissingField`] when absent or blank and
    /// [`NormalizationError::InvalidField`] when not a string.
    pub fn required_str(&self, key: &str) -> Result<&'a str, NormalizationError> {
        self.non_empty_str(key)?
            .ok_or_else(|| NormalizationError::MissingField(self.field_path(key)))
    }

    /// Reads a boolean field.
    ///
    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when the value is not a boolean.
    pub fn bool(&self, key: &str) -> Result<Option<bool>, NormalizationError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(flag)) => Ok(Some(*flag)),
            Some(other) => Err(NormalizationError::invalid(
                self.field_path(key),
                format!("expected boolean, found {}", json_kind(other)),
            )),
        }
    }

    /// Reads a numeric field as `f64`.
    ///
    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when the value is not a number.
    pub fn number(&self, key: &str) -> Result<Option<f64>, NormalizationError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(number)) => number.as_f64().map(Some).ok_or_else(|| {
                NormalizationError::invalid(self.field_path(key), "number is not representable")
            }),
            Some(other) => Err(NormalizationError::invalid(
                self.field_path(key),
                format!("expected number, found {}", json_kind(other)),
            )),
        }
    }

    /// Descends into a nested object. An absent child yields an empty view.
    ///
    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when the value is not an object.
    pub fn child(&self, key: &str) -> Result<Fields<'a>, NormalizationError> {
        let path = self.field_path(key);
        match self.get(key) {
            None => Ok(Fields::new(path, None)),
            Some(Value::Object(map)) => Ok(Fields::new(path, Some(map))),
            Some(other) => Err(NormalizationError::invalid(
                path,
                format!("expected object, found {}", json_kind(other)),
            )),
        }
    }

    /// Descends into a nested object that must be present.
    ///
    /// # Errors
    /// Returns [`NormalizationError::MissingField`] when absent and
    /// [`NormalizationError::InvalidField`] when not an object.
    pub fn required_child(&self, key: &str) -> Result<Fields<'a>, NormalizationError> {
        let child = self.child(key)?;
        if child.is_present() {
            Ok(child)
        } else {
            Err(NormalizationError::MissingField(child.path))
        }
    }

    /// Compact JSON text of any non-null value, stored without interpretation.
    #[must_use]
    pub fn opaque(&self, key: &str) -> Option<String> {
        self.get(key).map(Value::to_string)
    }

    /// Resolves a language map field.
    ///
    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when the value is not an object.
    pub fn localized(&self, key: &str) -> Result<Option<LocalizedText>, NormalizationError> {
        Ok(self.child(key)?.map.and_then(resolve_localized))
    }
}

/// Picks `en-US` when present, otherwise the first entry in document order
/// whose value is a string.
#[must_use]
pub fn resolve_localized(map: &Map<String, Value>) -> Option<LocalizedText> {
    if let Some(Value::String(text)) = map.get(PREFERRED_LANGUAGE) {
        return Some(LocalizedText {
            text: text.clone(),
            language: PREFERRED_LANGUAGE.to_string(),
        });
    }

    map.iter().find_map(|(language, value)| {
        value.as_str().map(|text| LocalizedText {
            text: text.to_string(),
            language: language.clone(),
        })
    })
}

/// Case-normalized identifier used as the primary key of actors, activities
/// and verbs.
#[must_use]
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Actor id priority: account name, mailbox, OpenID, display name.
///
/// # Errors
/// Returns [`NormalizationError::InvalidField`] when one of the candidate
/// fields has the wrong JSON type.
pub fn resolve_actor_id(actor: &Fields<'_>) -> Result<Option<String>, NormalizationError> {
    let account = actor.child("account")?;
    let candidate = match account.non_empty_str("name")? {
        Some(value) => Some(value),
        None => match actor.non_empty_str("mbox")? {
            Some(value) => Some(value),
            None => match actor.non_empty_str("openid")? {
                Some(value) => Some(value),
                None => actor.non_empty_str("name")?,
            },
        },
    };

    Ok(candidate.map(normalize_key))
}

/// Typed view over one inbound statement.
///
/// Construction checks the required substructures (`id`, `actor`, `verb.id`,
/// `object.id`) and resolves the effective timestamp; everything else is read
/// lazily through [`Fields`].
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    id: String,
    body: Map<String, Value>,
    timestamp: OffsetDateTime,
    stored: Option<OffsetDateTime>,
    received_at: OffsetDateTime,
}

impl Statement {
    /// Parses statement JSON text.
    ///
    /// # Errors
    /// Returns a [`NormalizationError`] when the text is not JSON or the
    /// statement is missing required substructures.
    pub fn parse(text: &str, received_at: OffsetDateTime) -> Result<Self, NormalizationError> {
        Self::from_value(parse_payload(text)?, received_at)
    }

    /// Builds the view from an already-decoded JSON value. `received_at` is the
    /// publish time on the event log and the last-resort default timestamp.
    ///
    /// # Errors
    /// Returns a [`NormalizationError`] when the value is not an object or is
    /// missing required substructures.
    pub fn from_value(value: Value, received_at: OffsetDateTime) -> Result<Self, NormalizationError> {
        let body = match value {
            Value::Object(body) => body,
            other => {
                return Err(NormalizationError::InvalidPayload(format!(
                    "statement must be a JSON object, found {}",
                    json_kind(&other)
                )))
            }
        };

        let received_at = received_at.to_offset(UtcOffset::UTC);
        let root = Fields::new("", Some(&body));
        let id = root.required_str("id")?.to_string();
        root.required_child("actor")?;
        root.required_child("verb")?.required_str("id")?;
        root.required_child("object")?.required_str("id")?;

        let stored = root
            .str("stored")?
            .map(|raw| parse_statement_timestamp("stored", raw))
            .transpose()?;
        let timestamp = match root.str("timestamp")? {
            Some(raw) => parse_statement_timestamp("timestamp", raw)?,
            None => stored.unwrap_or(received_at),
        };

        Ok(Self {
            id,
            body,
            timestamp,
            stored,
            received_at,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    #[must_use]
    pub fn stored(&self) -> Option<OffsetDateTime> {
        self.stored
    }

    #[must_use]
    pub fn received_at(&self) -> OffsetDateTime {
        self.received_at
    }

    #[must_use]
    pub fn root(&self) -> Fields<'_> {
        Fields::new("", Some(&self.body))
    }

    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when `actor` is not an object.
    pub fn actor(&self) -> Result<Fields<'_>, NormalizationError> {
        self.root().child("actor")
    }

    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when `verb` is not an object.
    pub fn verb(&self) -> Result<Fields<'_>, NormalizationError> {
        self.root().child("verb")
    }

    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when `object` is not an object.
    pub fn object(&self) -> Result<Fields<'_>, NormalizationError> {
        self.root().child("object")
    }

    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when `result` is not an object.
    pub fn result(&self) -> Result<Fields<'_>, NormalizationError> {
        self.root().child("result")
    }

    /// # Errors
    /// Returns [`NormalizationError::InvalidField`] when `context` is not an object.
    pub fn context(&self) -> Result<Fields<'_>, NormalizationError> {
        self.root().child("context")
    }
}

/// Decodes raw payload text into JSON.
///
/// # Errors
/// Returns [`NormalizationError::InvalidPayload`] when the text is not valid JSON.
pub fn parse_payload(text: &str) -> Result<Value, NormalizationError> {
    serde_json::from_str(text)
        .map_err(|err| NormalizationError::InvalidPayload(format!("payload is not JSON: {err}")))
}

/// Reads the statement id from a decoded payload without validating the rest
/// of the statement, so the raw copy can be keyed even when normalization
/// later fails.
///
/// # Errors
/// Returns a [`NormalizationError`] when the payload is not an object or has
/// no usable `id`.
pub fn statement_id_of(value: &Value) -> Result<String, NormalizationError> {
    let Value::Object(map) = value else {
        return Err(NormalizationError::InvalidPayload(format!(
            "statement must be a JSON object, found {}",
            json_kind(value)
        )));
    };
    Ok(Fields::new("", Some(map)).required_str("id")?.to_string())
}

/// Untouched payload as received from the event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub statement_id: String,
    pub payload: String,
    pub log_entry_id: Option<i64>,
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Actor {
    pub actor_id: Option<String>,
    pub object_type: String,
    pub name: Option<String>,
    pub mbox: Option<String>,
    pub openid: Option<String>,
    pub account_name: Option<String>,
    pub account_homepage: Option<String>,
    pub last_seen_ms: i64,
    pub last_statement_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub activity_id: String,
    pub object_type: String,
    pub activity_type: Option<String>,
    pub name: Option<String>,
    pub name_lang: Option<String>,
    pub description: Option<String>,
    pub description_lang: Option<String>,
    pub interaction_type: Option<String>,
    pub more_info: Option<String>,
    pub correct_responses_pattern: Option<String>,
    pub choices: Option<String>,
    pub scale: Option<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub steps: Option<String>,
    pub extensions: Option<String>,
    pub last_seen_ms: i64,
    pub last_statement_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verb {
    pub verb_id: String,
    pub display: Option<String>,
    pub display_lang: Option<String>,
    pub last_seen_ms: i64,
    pub last_statement_id: String,
}

/// Normalized statement row. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub statement_id: String,
    pub actor_id: Option<String>,
    pub verb_id: String,
    pub activity_id: String,
    pub result_success: Option<bool>,
    pub result_completion: Option<bool>,
    pub result_duration: Option<String>,
    pub result_response: Option<String>,
    pub result_score_scaled: Option<f64>,
    pub result_score_raw: Option<f64>,
    pub result_score_min: Option<f64>,
    pub result_score_max: Option<f64>,
    pub result_extensions: Option<String>,
    pub context_registration: Option<String>,
    pub context_platform: Option<String>,
    pub context_language: Option<String>,
    pub context_instructor: Option<String>,
    pub context_activities: Option<String>,
    pub context_extensions: Option<String>,
    pub statement_version: Option<String>,
    pub timestamp: OffsetDateTime,
    pub stored: Option<OffsetDateTime>,
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedStatement {
    pub actor: Actor,
    pub activity: Activity,
    pub verb: Verb,
    pub fact: Fact,
}

/// Decomposes a statement into actor, activity, verb and fact rows.
///
/// # Errors
/// Returns a [`NormalizationError`] when a field the extraction rules read has
/// the wrong JSON type.
pub fn normalize(statement: &Statement) -> Result<NormalizedStatement, NormalizationError> {
    let actor = extract_actor(statement)?;
    let verb = extract_verb(statement)?;
    let activity = extract_activity(statement)?;
    let fact = extract_fact(statement, &actor, &verb, &activity)?;

    Ok(NormalizedStatement {
        actor,
        activity,
        verb,
        fact,
    })
}

fn extract_actor(statement: &Statement) -> Result<Actor, NormalizationError> {
    let fields = statement.actor()?;
    let account = fields.child("account")?;

    Ok(Actor {
        actor_id: resolve_actor_id(&fields)?,
        object_type: fields
            .non_empty_str("objectType")?
            .unwrap_or(DEFAULT_ACTOR_OBJECT_TYPE)
            .to_string(),
        name: owned(fields.str("name")?),
        mbox: owned(fields.str("mbox")?),
        openid: owned(fields.str("openid")?),
        account_name: owned(account.str("name")?),
        account_homepage: owned(account.str("homePage")?),
        last_seen_ms: unix_millis(statement.timestamp()),
        last_statement_id: statement.id().to_string(),
    })
}

fn extract_verb(statement: &Statement) -> Result<Verb, NormalizationError> {
    let fields = statement.verb()?;
    let display = fields.localized("display")?;

    Ok(Verb {
        verb_id: normalize_key(fields.required_str("id")?),
        display: display.as_ref().map(|item| item.text.clone()),
        display_lang: display.map(|item| item.language),
        last_seen_ms: unix_millis(statement.timestamp()),
        last_statement_id: statement.id().to_string(),
    })
}

fn extract_activity(statement: &Statement) -> Result<Activity, NormalizationError> {
    let fields = statement.object()?;
    let definition = fields.child("definition")?;
    let name = definition.localized("name")?;
    let description = definition.localized("description")?;

    Ok(Activity {
        activity_id: normalize_key(fields.required_str("id")?),
        object_type: fields
            .non_empty_str("objectType")?
            .unwrap_or(DEFAULT_ACTIVITY_OBJECT_TYPE)
            .to_string(),
        activity_type: owned(definition.str("type")?),
        name: name.as_ref().map(|item| item.text.clone()),
        name_lang: name.map(|item| item.language),
        description: description.as_ref().map(|item| item.text.clone()),
        description_lang: description.map(|item| item.language),
        interaction_type: owned(definition.str("interactionType")?),
        more_info: owned(definition.str("moreInfo")?),
        correct_responses_pattern: definition.opaque("correctResponsesPattern"),
        choices: definition.opaque("choices"),
        scale: definition.opaque("scale"),
        source: definition.opaque("source"),
        target: definition.opaque("target"),
        steps: definition.opaque("steps"),
        extensions: definition.opaque("extensions"),
        last_seen_ms: unix_millis(statement.timestamp()),
        last_statement_id: statement.id().to_string(),
    })
}

fn extract_fact(
    statement: &Statement,
    actor: &Actor,
    verb: &Verb,
    activity: &Activity,
) -> Result<Fact, NormalizationError> {
    let result = statement.result()?;
    let score = result.child("score")?;
    let context = statement.context()?;

    Ok(Fact {
        statement_id: statement.id().to_string(),
        actor_id: actor.actor_id.clone(),
        verb_id: verb.verb_id.clone(),
        activity_id: activity.activity_id.clone(),
        result_success: result.bool("success")?,
        result_completion: result.bool("completion")?,
        result_duration: owned(result.str("duration")?),
        result_response: owned(result.str("response")?),
        result_score_scaled: score.number("scaled")?,
        result_score_raw: score.number("raw")?,
        result_score_min: score.number("min")?,
        result_score_max: score.number("max")?,
        result_extensions: result.opaque("extensions"),
        context_registration: owned(context.str("registration")?),
        context_platform: owned(context.str("platform")?),
        context_language: owned(context.str("language")?),
        context_instructor: context.opaque("instructor"),
        context_activities: context.opaque("contextActivities"),
        context_extensions: context.opaque("extensions"),
        statement_version: owned(statement.root().str("version")?),
        timestamp: statement.timestamp(),
        stored: statement.stored(),
        received_at: statement.received_at(),
    })
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_statement_timestamp(
    field: &str,
    raw: &str,
) -> Result<OffsetDateTime, NormalizationError> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .map(|value| value.to_offset(UtcOffset::UTC))
        .map_err(|err| NormalizationError::invalid(field, format!("invalid RFC3339 timestamp: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`NormalizationError::InvalidField`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, NormalizationError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| NormalizationError::invalid("timestamp", format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(NormalizationError::invalid(
            "timestamp",
            "timestamp MUST use UTC offset Z",
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`NormalizationError::InvalidField`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, NormalizationError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            NormalizationError::invalid("timestamp", format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Inverse of [`unix_millis`]; out-of-range input clamps to the Unix epoch.
#[must_use]
pub fn from_unix_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
