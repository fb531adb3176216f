use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// 变更事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Which change kinds a subscription wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventFilter {
    #[default]
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl EventFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFilter::All => "*",
            EventFilter::Insert => "INSERT",
            EventFilter::Update => "UPDATE",
            EventFilter::Delete => "DELETE",
        }
    }

    pub fn matches(&self, kind: ChangeKind) -> bool {
        matches!(
            (self, kind),
            (EventFilter::All, _)
                | (EventFilter::Insert, ChangeKind::Insert)
                | (EventFilter::Update, ChangeKind::Update)
                | (EventFilter::Delete, ChangeKind::Delete)
        )
    }
}

/// Equality predicate on a single column, rendered in PostgREST syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowFilter {
    Eq { column: String, value: String },
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        RowFilter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            RowFilter::Eq { column, .. } => column,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            RowFilter::Eq { value, .. } => value,
        }
    }

    /// `(column, "eq.value")`, the query-string pair PostgREST expects.
    pub fn as_query_pair(&self) -> (String, String) {
        match self {
            RowFilter::Eq { column, value } => (column.clone(), format!("eq.{}", value)),
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowFilter::Eq { column, value } => write!(f, "{}=eq.{}", column, value),
        }
    }
}

/// Server-side filter for a change-feed subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    pub events: EventFilter,
    pub row_filter: Option<RowFilter>,
}

impl ChangeFilter {
    pub fn table(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            events: EventFilter::All,
            row_filter: None,
        }
    }

    pub fn with_row_filter(mut self, filter: RowFilter) -> Self {
        self.row_filter = Some(filter);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.schema == event.schema && self.table == event.table && self.events.matches(event.kind)
    }
}

/// 变更通知：只作为失效信号使用，不携带行数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phoenix 通道协议消息（Supabase Realtime 使用的帧格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub const JOIN: &'static str = "phx_join";
    pub const LEAVE: &'static str = "phx_leave";
    pub const REPLY: &'static str = "phx_reply";
    pub const ERROR: &'static str = "phx_error";
    pub const CLOSE: &'static str = "phx_close";
    pub const HEARTBEAT: &'static str = "heartbeat";
    pub const POSTGRES_CHANGES: &'static str = "postgres_changes";

    pub fn topic_for(channel: &str) -> String {
        format!("realtime:{}", channel)
    }

    pub fn join(topic: &str, filter: &ChangeFilter, access_token: &str, reference: &str) -> Self {
        let mut change = serde_json::json!({
            "event": filter.events.as_str(),
            "schema": filter.schema,
            "table": filter.table,
        });
        if let Some(row_filter) = &filter.row_filter {
            change["filter"] = serde_json::Value::String(row_filter.to_string());
        }

        Self {
            topic: topic.to_string(),
            event: Self::JOIN.to_string(),
            payload: serde_json::json!({
                "config": {
                    "broadcast": { "ack": false, "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [change],
                    "private": false
                },
                "access_token": access_token
            }),
            reference: Some(reference.to_string()),
            join_ref: Some(reference.to_string()),
        }
    }

    pub fn leave(topic: &str, reference: &str, join_ref: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: Self::LEAVE.to_string(),
            payload: serde_json::json!({}),
            reference: Some(reference.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: "phoenix".to_string(),
            event: Self::HEARTBEAT.to_string(),
            payload: serde_json::json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    /// `Some(Ok)` / `Some(Err(reason))` for a reply, `None` for anything else.
    pub fn reply_status(&self) -> Option<std::result::Result<(), String>> {
        if self.event != Self::REPLY {
            return None;
        }
        let status = self.payload.get("status").and_then(|s| s.as_str()).unwrap_or("");
        if status == "ok" {
            Some(Ok(()))
        } else {
            let reason = self
                .payload
                .get("response")
                .and_then(|r| r.get("reason"))
                .and_then(|r| r.as_str())
                .unwrap_or(status);
            Some(Err(reason.to_string()))
        }
    }

    /// The change carried by a `postgres_changes` push, if this is one.
    pub fn postgres_change(&self) -> Option<ChangeEvent> {
        if self.event != Self::POSTGRES_CHANGES {
            return None;
        }
        let data = self.payload.get("data")?;
        let kind = serde_json::from_value(data.get("type")?.clone()).ok()?;
        let commit_timestamp = data
            .get("commit_timestamp")
            .and_then(|t| t.as_str())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        Some(ChangeEvent {
            schema: data.get("schema")?.as_str()?.to_string(),
            table: data.get("table")?.as_str()?.to_string(),
            kind,
            commit_timestamp,
        })
    }
}
