use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub customer: String,
    #[serde(default)]
    pub times: Vec<TimedInterval>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            customer: String::new(),
            times: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "task.id")?;
        for interval in &self.times {
            interval.validate()?;
        }
        Ok(())
    }

    pub fn running_intervals(&self) -> impl Iterator<Item = &TimedInterval> {
        self.times.iter().filter(|interval| interval.is_running())
    }
}

/// A tracked span of work on a task.
///
/// On the wire the remote API marks a running interval with an empty
/// `end_date` string and reports `spent_time` in decimal hours. Both are
/// normalized here: a running interval has `end_timestamp == None` and the
/// duration is held in whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimedInterval {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "begin_date")]
    pub begin_timestamp: DateTime<Utc>,
    #[serde(rename = "end_date", default, with = "running_sentinel")]
    pub end_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "spent_time", default, with = "spent_hours")]
    pub duration_seconds: i64,
}

impl TimedInterval {
    pub fn running(begin_timestamp: DateTime<Utc>, description: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            description: description.into(),
            begin_timestamp,
            end_timestamp: None,
            duration_seconds: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.end_timestamp.is_none()
    }

    /// Ends the interval at `end_timestamp`, or at its begin when the clock
    /// reads earlier than that.
    pub fn stopped_at(&self, end_timestamp: DateTime<Utc>) -> Self {
        let end_timestamp = end_timestamp.max(self.begin_timestamp);
        Self {
            end_timestamp: Some(end_timestamp),
            duration_seconds: seconds_between(self.begin_timestamp, end_timestamp),
            ..self.clone()
        }
    }

    pub fn elapsed_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        match self.end_timestamp {
            Some(_) => self.duration_seconds,
            None => seconds_between(self.begin_timestamp, now),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(end_timestamp) = self.end_timestamp {
            if end_timestamp < self.begin_timestamp {
                return Err(
                    "interval.end_timestamp must not be before interval.begin_timestamp".to_string(),
                );
            }
        }
        if self.duration_seconds < 0 {
            return Err("interval.duration_seconds must be >= 0".to_string());
        }
        Ok(())
    }
}

pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds().max(0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationMethod {
    #[serde(rename = "POST")]
    Create,
    #[serde(rename = "PUT")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl OperationMethod {
    pub fn as_http_method(self) -> &'static str {
        match self {
            Self::Create => "POST",
            Self::Update => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TargetPath {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_id: Option<String>,
}

impl TargetPath {
    pub fn times(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            interval_id: None,
        }
    }

    pub fn time(task_id: impl Into<String>, interval_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            interval_id: Some(interval_id.into()),
        }
    }

    /// Relative endpoint, e.g. `/tasks/42/times/7`.
    pub fn endpoint(&self) -> String {
        match self.interval_id.as_deref() {
            Some(interval_id) => format!("/tasks/{}/times/{}", self.task_id, interval_id),
            None => format!("/tasks/{}/times", self.task_id),
        }
    }

    pub fn belongs_to(&self, task_id: &str) -> bool {
        self.task_id == task_id
    }
}

/// The caller-supplied half of a pending operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOperation {
    pub method: OperationMethod,
    pub target: TargetPath,
    pub payload: Option<TimedInterval>,
}

impl NewOperation {
    pub fn create(task_id: impl Into<String>, interval: TimedInterval) -> Self {
        Self {
            method: OperationMethod::Create,
            target: TargetPath::times(task_id),
            payload: Some(interval),
        }
    }

    pub fn update(task_id: impl Into<String>, interval: TimedInterval) -> Self {
        Self {
            method: OperationMethod::Update,
            target: TargetPath::time(task_id, interval.id.clone()),
            payload: Some(interval),
        }
    }

    pub fn delete(task_id: impl Into<String>, interval_id: impl Into<String>) -> Self {
        Self {
            method: OperationMethod::Delete,
            target: TargetPath::time(task_id, interval_id),
            payload: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_operation_shape(self.method, &self.target, self.payload.as_ref())
    }
}

impl From<&PendingOperation> for NewOperation {
    fn from(operation: &PendingOperation) -> Self {
        Self {
            method: operation.method,
            target: operation.target.clone(),
            payload: operation.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingOperation {
    pub id: String,
    pub method: OperationMethod,
    pub target: TargetPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<TimedInterval>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl PendingOperation {
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "operation.id")?;
        validate_operation_shape(self.method, &self.target, self.payload.as_ref())
    }
}

fn validate_operation_shape(
    method: OperationMethod,
    target: &TargetPath,
    payload: Option<&TimedInterval>,
) -> Result<(), String> {
    validate_non_empty(&target.task_id, "operation.target.task_id")?;
    match method {
        OperationMethod::Create => {
            if target.interval_id.is_some() {
                return Err("create operation must not address an existing interval".to_string());
            }
        }
        OperationMethod::Update | OperationMethod::Delete => {
            let interval_id = target.interval_id.as_deref().unwrap_or_default();
            validate_non_empty(interval_id, "operation.target.interval_id")?;
        }
    }
    match (method, payload) {
        (OperationMethod::Create | OperationMethod::Update, None) => {
            Err("operation.payload is required for create and update".to_string())
        }
        (OperationMethod::Delete, Some(_)) => {
            Err("operation.payload must be absent for delete".to_string())
        }
        (_, Some(payload)) => payload.validate(),
        (OperationMethod::Delete, None) => Ok(()),
    }
}

/// Live view of the one interval currently running process-wide.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActiveSession {
    pub task: Task,
    pub interval: TimedInterval,
    pub elapsed_seconds: i64,
    /// True while the interval exists only locally, waiting for its queued create.
    pub provisional: bool,
}

/// Result of a mutation that may have been deferred to the pending ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome<T> {
    Confirmed(T),
    Queued { value: T, operation_id: String },
}

impl<T> MutationOutcome<T> {
    pub fn value(&self) -> &T {
        match self {
            Self::Confirmed(value) | Self::Queued { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Confirmed(value) | Self::Queued { value, .. } => value,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::Confirmed(_) => None,
            Self::Queued { operation_id, .. } => Some(operation_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskSyncStatus {
    pub task_id: String,
    pub pending: Vec<PendingOperation>,
    pub exhausted: Vec<PendingOperation>,
}

impl TaskSyncStatus {
    pub fn is_synced(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn needs_attention(&self) -> bool {
        !self.exhausted.is_empty()
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

mod running_sentinel {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(end_timestamp) => serializer.serialize_str(&end_timestamp.to_rfc3339()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => DateTime::parse_from_rfc3339(value)
                .map(|parsed| Some(parsed.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}

mod spent_hours {
    use serde::{Deserialize, Deserializer, Serializer};

    const SECONDS_PER_HOUR: f64 = 3600.0;

    pub fn serialize<S>(seconds: &i64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(*seconds as f64 / SECONDS_PER_HOUR)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hours = Option::<f64>::deserialize(deserializer)?.unwrap_or_default();
        if !hours.is_finite() || hours < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "spent_time must be a non-negative number of hours, got {hours}"
            )));
        }
        Ok((hours * SECONDS_PER_HOUR).round() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_interval() -> TimedInterval {
        TimedInterval {
            id: "time-1".to_string(),
            description: "code review".to_string(),
            begin_timestamp: fixed_time("2026-02-16T09:00:00Z"),
            end_timestamp: Some(fixed_time("2026-02-16T10:30:00Z")),
            duration_seconds: 5400,
        }
    }

    #[test]
    fn running_interval_serializes_empty_end_date() {
        let interval = TimedInterval::running(fixed_time("2026-02-16T09:00:00Z"), "");
        let value = serde_json::to_value(&interval).expect("serialize");

        assert_eq!(value["end_date"], serde_json::json!(""));
        assert_eq!(value["spent_time"], serde_json::json!(0.0));
        assert!(value.get("id").is_none());
    }

    #[test]
    fn null_and_missing_end_date_mean_running() {
        let with_null: TimedInterval = serde_json::from_value(serde_json::json!({
            "id": "a",
            "begin_date": "2026-02-16T09:00:00Z",
            "end_date": null,
            "spent_time": 0
        }))
        .expect("deserialize null end");
        let missing: TimedInterval = serde_json::from_value(serde_json::json!({
            "id": "b",
            "begin_date": "2026-02-16T09:00:00Z"
        }))
        .expect("deserialize missing end");

        assert!(with_null.is_running());
        assert!(missing.is_running());
    }

    #[test]
    fn spent_time_is_exchanged_in_hours() {
        let value = serde_json::to_value(sample_interval()).expect("serialize");
        assert_eq!(value["spent_time"], serde_json::json!(1.5));

        let parsed: TimedInterval = serde_json::from_value(value).expect("deserialize");
        assert_eq!(parsed, sample_interval());
    }

    #[test]
    fn negative_spent_time_is_rejected() {
        let result = serde_json::from_value::<TimedInterval>(serde_json::json!({
            "begin_date": "2026-02-16T09:00:00Z",
            "end_date": "2026-02-16T10:00:00Z",
            "spent_time": -1.0
        }));
        assert!(result.is_err());
    }

    #[test]
    fn stopped_at_computes_duration_from_begin() {
        let running = TimedInterval::running(fixed_time("2026-02-16T09:00:00Z"), "focus");
        let stopped = running.stopped_at(fixed_time("2026-02-16T09:02:05Z"));

        assert!(!stopped.is_running());
        assert_eq!(stopped.duration_seconds, 125);
        assert_eq!(stopped.description, "focus");
    }

    #[test]
    fn stopped_at_before_begin_ends_at_begin() {
        let running = TimedInterval::running(fixed_time("2026-02-16T09:00:02Z"), "skewed");
        let stopped = running.stopped_at(fixed_time("2026-02-16T09:00:00Z"));

        assert_eq!(stopped.end_timestamp, Some(running.begin_timestamp));
        assert_eq!(stopped.duration_seconds, 0);
        assert!(stopped.validate().is_ok());
    }

    #[test]
    fn interval_validate_rejects_reverse_range() {
        let mut interval = sample_interval();
        interval.end_timestamp = Some(fixed_time("2026-02-16T08:00:00Z"));
        assert!(interval.validate().is_err());
    }

    #[test]
    fn target_path_renders_endpoints() {
        assert_eq!(TargetPath::times("42").endpoint(), "/tasks/42/times");
        assert_eq!(TargetPath::time("42", "7").endpoint(), "/tasks/42/times/7");
        assert!(TargetPath::time("42", "7").belongs_to("42"));
        assert!(!TargetPath::time("420", "7").belongs_to("42"));
    }

    #[test]
    fn new_operation_shapes_are_validated() {
        assert!(NewOperation::create("t1", sample_interval()).validate().is_ok());
        assert!(NewOperation::delete("t1", "time-1").validate().is_ok());
        assert!(NewOperation::delete("t1", " ").validate().is_err());

        let mut update = NewOperation::update("t1", sample_interval());
        update.payload = None;
        assert!(update.validate().is_err());

        let mut create = NewOperation::create("t1", sample_interval());
        create.target.interval_id = Some("time-1".to_string());
        assert!(create.validate().is_err());
    }

    #[test]
    fn operation_method_uses_http_verbs_when_persisted() {
        let encoded = serde_json::to_string(&OperationMethod::Update).expect("serialize");
        assert_eq!(encoded, "\"PUT\"");
        assert_eq!(OperationMethod::Delete.as_http_method(), "DELETE");
    }

    #[test]
    fn mutation_outcome_exposes_operation_id_only_when_queued() {
        let confirmed = MutationOutcome::Confirmed(1);
        let queued = MutationOutcome::Queued {
            value: 2,
            operation_id: "req-1".to_string(),
        };

        assert!(!confirmed.is_queued());
        assert_eq!(confirmed.operation_id(), None);
        assert_eq!(queued.operation_id(), Some("req-1"));
        assert_eq!(queued.into_value(), 2);
    }
}
