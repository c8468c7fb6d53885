//! In-process tools that never touch a transport.
//!
//! The reminder tools drive a [`ReminderScheduler`]; every call answers with a
//! small JSON status payload echoing the normalized parameters.

use std::cmp::Reverse;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::tool::{ToolArguments, ToolDescriptor, ToolErrorCode, ToolResult, UsageExample};

pub const SETUP_REMINDER: &str = "setup_reminder";
pub const UPDATE_REMINDER: &str = "update_reminder";
pub const STOP_REMINDER: &str = "stop_reminder";

pub const DEFAULT_MESSAGE_COUNT: u32 = 10;
pub const MIN_MESSAGE_COUNT: u32 = 1;
pub const MAX_MESSAGE_COUNT: u32 = 30;

/// A fixed set of tools served without any transport.
#[async_trait]
pub trait LocalToolHandler: Send + Sync {
    /// Category name advertised in the system prompt.
    fn category(&self) -> &str;

    fn descriptors(&self) -> Vec<ToolDescriptor>;

    fn handles(&self, name: &str) -> bool {
        self.descriptors().iter().any(|d| d.name == name)
    }

    /// Never fails as a Rust error; problems come back as error results.
    async fn handle(&self, name: &str, arguments: ToolArguments) -> ToolResult;
}

const INTERVALS: [(u64, &str); 7] = [
    (10, "10 seconds"),
    (30, "30 seconds"),
    (60, "1 minute"),
    (300, "5 minutes"),
    (600, "10 minutes"),
    (1800, "30 minutes"),
    (3600, "1 hour"),
];

/// One of the allowed reminder periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderInterval {
    seconds: u64,
    label: &'static str,
}

impl ReminderInterval {
    /// Nearest allowed interval; ties go to the longer one.
    pub fn snap(requested_seconds: i64) -> Self {
        let (seconds, label) = INTERVALS
            .iter()
            .copied()
            .min_by_key(|(allowed, _)| {
                (
                    (*allowed as i64 - requested_seconds).unsigned_abs(),
                    Reverse(*allowed),
                )
            })
            .unwrap_or(INTERVALS[2]);
        Self { seconds, label }
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderSettings {
    /// Stored without the leading `@`.
    pub channel: String,
    pub interval: ReminderInterval,
    pub message_count: u32,
}

impl ReminderSettings {
    pub fn display_channel(&self) -> String {
        format!("@{}", self.channel)
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no reminder is active")]
    NotActive,
    #[error("scheduler failure: {0}")]
    Failed(String),
}

/// The scheduling subsystem the reminder tools mutate.
#[async_trait]
pub trait ReminderScheduler: Send + Sync {
    async fn start(&self, settings: ReminderSettings) -> Result<(), SchedulerError>;
    async fn update(&self, settings: ReminderSettings) -> Result<(), SchedulerError>;
    async fn stop(&self) -> Result<(), SchedulerError>;
    async fn current(&self) -> Option<ReminderSettings>;
}

#[derive(Default)]
pub struct InMemoryReminderScheduler {
    active: RwLock<Option<ReminderSettings>>,
}

impl InMemoryReminderScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReminderScheduler for InMemoryReminderScheduler {
    async fn start(&self, settings: ReminderSettings) -> Result<(), SchedulerError> {
        *self.active.write().await = Some(settings);
        Ok(())
    }

    async fn update(&self, settings: ReminderSettings) -> Result<(), SchedulerError> {
        let mut active = self.active.write().await;
        if active.is_none() {
            return Err(SchedulerError::NotActive);
        }
        *active = Some(settings);
        Ok(())
    }

    async fn stop(&self) -> Result<(), SchedulerError> {
        self.active.write().await.take();
        Ok(())
    }

    async fn current(&self) -> Option<ReminderSettings> {
        self.active.read().await.clone()
    }
}

#[derive(Serialize)]
struct StartedStatus<'a> {
    status: &'static str,
    channel: &'a str,
    interval: &'static str,
    message_count: u32,
}

#[derive(Serialize)]
struct UpdatedStatus<'a> {
    status: &'static str,
    field: &'a str,
    value: Value,
}

#[derive(Serialize)]
struct StoppedStatus {
    status: &'static str,
}

/// Telegram channel reminder tools.
pub struct ReminderTools {
    scheduler: Arc<dyn ReminderScheduler>,
}

impl ReminderTools {
    pub fn new(scheduler: Arc<dyn ReminderScheduler>) -> Self {
        Self { scheduler }
    }

    async fn setup(&self, arguments: &ToolArguments) -> ToolResult {
        let channel = match arguments.get("channel").and_then(loose_string) {
            Some(raw) => match normalize_channel(&raw) {
                Some(channel) => channel,
                None => return invalid("channel must not be empty"),
            },
            None => return invalid("missing required argument 'channel'"),
        };
        let interval = match arguments.get("interval_seconds") {
            Some(value) => match loose_int(value) {
                Some(seconds) => ReminderInterval::snap(seconds),
                None => return invalid("interval_seconds must be a number"),
            },
            None => return invalid("missing required argument 'interval_seconds'"),
        };
        let message_count = match arguments.get("message_count") {
            None | Some(Value::Null) => DEFAULT_MESSAGE_COUNT,
            Some(value) => match loose_int(value) {
                Some(count) => clamp_count(count),
                None => return invalid("message_count must be a number"),
            },
        };

        let settings = ReminderSettings {
            channel,
            interval,
            message_count,
        };
        if let Err(err) = self.scheduler.start(settings.clone()).await {
            return ToolResult::error(ToolErrorCode::ExecutionFailed, err.to_string());
        }
        info!(
            target: "ai_agent::local_tools",
            channel = %settings.channel,
            interval_seconds = settings.interval.seconds(),
            message_count = settings.message_count,
            "reminder started"
        );

        let channel = settings.display_channel();
        ToolResult::json(&StartedStatus {
            status: "started",
            channel: &channel,
            interval: settings.interval.label(),
            message_count: settings.message_count,
        })
    }

    async fn update(&self, arguments: &ToolArguments) -> ToolResult {
        let Some(field) = arguments.get("field").and_then(loose_string) else {
            return invalid("missing required argument 'field'");
        };
        let Some(raw_value) = arguments.get("value").and_then(loose_string) else {
            return invalid("missing required argument 'value'");
        };

        let Some(mut settings) = self.scheduler.current().await else {
            return ToolResult::error(ToolErrorCode::ExecutionFailed, "no reminder is active");
        };

        let echoed = match field.as_str() {
            "channel" => match normalize_channel(&raw_value) {
                Some(channel) => {
                    settings.channel = channel;
                    Value::String(settings.display_channel())
                }
                None => return invalid("channel must not be empty"),
            },
            "interval_seconds" => match parse_int(&raw_value) {
                Some(seconds) => {
                    settings.interval = ReminderInterval::snap(seconds);
                    Value::String(settings.interval.label().to_string())
                }
                None => return invalid(format!("'{raw_value}' is not a valid interval")),
            },
            "message_count" => match parse_int(&raw_value) {
                Some(count) => {
                    settings.message_count = clamp_count(count);
                    json!(settings.message_count)
                }
                None => return invalid(format!("'{raw_value}' is not a valid message count")),
            },
            other => return invalid(format!("unknown field '{other}'")),
        };

        if let Err(err) = self.scheduler.update(settings).await {
            return ToolResult::error(ToolErrorCode::ExecutionFailed, err.to_string());
        }
        debug!(target: "ai_agent::local_tools", field = %field, "reminder updated");
        ToolResult::json(&UpdatedStatus {
            status: "updated",
            field: &field,
            value: echoed,
        })
    }

    async fn stop(&self) -> ToolResult {
        if let Err(err) = self.scheduler.stop().await {
            return ToolResult::error(ToolErrorCode::ExecutionFailed, err.to_string());
        }
        info!(target: "ai_agent::local_tools", "reminder stopped");
        ToolResult::json(&StoppedStatus { status: "stopped" })
    }
}

#[async_trait]
impl LocalToolHandler for ReminderTools {
    fn category(&self) -> &str {
        "Telegram channel reminders"
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        reminder_descriptors()
    }

    fn handles(&self, name: &str) -> bool {
        matches!(name, SETUP_REMINDER | UPDATE_REMINDER | STOP_REMINDER)
    }

    async fn handle(&self, name: &str, arguments: ToolArguments) -> ToolResult {
        match name {
            SETUP_REMINDER => self.setup(&arguments).await,
            UPDATE_REMINDER => self.update(&arguments).await,
            STOP_REMINDER => self.stop().await,
            other => ToolResult::error(
                ToolErrorCode::UnknownTool,
                format!("tool '{other}' is not handled locally"),
            ),
        }
    }
}

fn reminder_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            SETUP_REMINDER,
            "Start periodic reminders with the latest posts of a Telegram channel.",
            json!({
                "type": "object",
                "properties": {
                    "channel": {
                        "type": "string",
                        "description": "Channel username, with or without a leading @"
                    },
                    "interval_seconds": {
                        "type": "integer",
                        "description": "Reminder period in seconds; one of 10, 30, 60, 300, 600, 1800, 3600"
                    },
                    "message_count": {
                        "type": "integer",
                        "description": "How many recent posts to include (1-30, default 10)"
                    }
                },
                "required": ["channel", "interval_seconds"]
            }),
        )
        .with_example(UsageExample::new(
            "What's new on channel durov?",
            json!({"channel": "durov", "interval_seconds": 60}),
        ))
        .with_example(UsageExample::new(
            "Send me the last 5 posts from @telegram every 10 minutes",
            json!({"channel": "telegram", "interval_seconds": 600, "message_count": 5}),
        )),
        ToolDescriptor::new(
            UPDATE_REMINDER,
            "Change one setting of the active reminder.",
            json!({
                "type": "object",
                "properties": {
                    "field": {
                        "type": "string",
                        "enum": ["channel", "interval_seconds", "message_count"]
                    },
                    "value": {
                        "type": "string",
                        "description": "New value for the field"
                    }
                },
                "required": ["field", "value"]
            }),
        )
        .with_example(UsageExample::new(
            "Remind me every half hour instead",
            json!({"field": "interval_seconds", "value": "1800"}),
        ))
        .with_example(UsageExample::new(
            "Switch the reminder to @bbcnews",
            json!({"field": "channel", "value": "bbcnews"}),
        )),
        ToolDescriptor::new(
            STOP_REMINDER,
            "Stop the active reminder.",
            json!({"type": "object", "properties": {}}),
        )
        .with_example(UsageExample::new("Stop the reminders", json!({}))),
    ]
}

fn invalid(message: impl Into<String>) -> ToolResult {
    ToolResult::error(ToolErrorCode::InvalidArguments, message)
}

fn normalize_channel(raw: &str) -> Option<String> {
    let channel = raw.trim().trim_start_matches('@').trim();
    (!channel.is_empty()).then(|| channel.to_string())
}

fn clamp_count(count: i64) -> u32 {
    count.clamp(MIN_MESSAGE_COUNT as i64, MAX_MESSAGE_COUNT as i64) as u32
}

fn loose_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn loose_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        Value::String(s) => parse_int(s),
        _ => None,
    }
}

fn parse_int(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f.round() as i64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> ToolArguments {
        match value {
            Value::Object(map) => map,
            _ => panic!("arguments must be an object"),
        }
    }

    fn tools() -> (ReminderTools, Arc<InMemoryReminderScheduler>) {
        let scheduler = Arc::new(InMemoryReminderScheduler::new());
        (ReminderTools::new(scheduler.clone()), scheduler)
    }

    #[test]
    fn interval_snaps_to_nearest_allowed_value() {
        assert_eq!(ReminderInterval::snap(45).seconds(), 60);
        assert_eq!(ReminderInterval::snap(45).label(), "1 minute");
        assert_eq!(ReminderInterval::snap(0).seconds(), 10);
        assert_eq!(ReminderInterval::snap(-5).seconds(), 10);
        assert_eq!(ReminderInterval::snap(19).seconds(), 10);
        assert_eq!(ReminderInterval::snap(100_000).label(), "1 hour");
        assert_eq!(ReminderInterval::snap(1100).seconds(), 600);
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLog {
        type Writer = CapturedLog;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn events_pass_the_crate_level_filter() {
        let captured = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("warn,ai_agent=debug"))
            .with_writer(captured.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (tools, _) = tools();
        tools
            .handle(SETUP_REMINDER, args(json!({"channel": "durov", "interval_seconds": 60})))
            .await;
        tools
            .handle(UPDATE_REMINDER, args(json!({"field": "message_count", "value": "5"})))
            .await;
        tools.handle(STOP_REMINDER, ToolArguments::new()).await;

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("ai_agent::local_tools"), "{output}");
        assert!(output.contains("reminder updated"), "{output}");
        assert!(output.contains("reminder stopped"), "{output}");
    }

    #[test]
    fn equidistant_requests_snap_to_the_longer_interval() {
        assert_eq!(ReminderInterval::snap(20).seconds(), 30);
        assert_eq!(ReminderInterval::snap(1200).seconds(), 1800);
        assert_eq!(ReminderInterval::snap(2700).label(), "1 hour");
    }

    #[tokio::test]
    async fn setup_reports_exact_status_payload() {
        let (tools, scheduler) = tools();
        let result = tools
            .handle(
                SETUP_REMINDER,
                args(json!({"channel": "durov", "interval_seconds": 45})),
            )
            .await;
        assert!(!result.is_error);
        assert_eq!(
            result.content,
            r#"{"status":"started","channel":"@durov","interval":"1 minute","message_count":10}"#
        );
        let active = scheduler.current().await.unwrap();
        assert_eq!(active.channel, "durov");
        assert_eq!(active.interval.seconds(), 60);
    }

    #[tokio::test]
    async fn setup_accepts_loosely_typed_values() {
        let (tools, scheduler) = tools();
        let result = tools
            .handle(
                SETUP_REMINDER,
                args(json!({"channel": "@news", "interval_seconds": "300", "message_count": 99})),
            )
            .await;
        assert!(!result.is_error, "{}", result.content);
        let active = scheduler.current().await.unwrap();
        assert_eq!(active.channel, "news");
        assert_eq!(active.message_count, MAX_MESSAGE_COUNT);
    }

    #[tokio::test]
    async fn setup_requires_channel_and_interval() {
        let (tools, scheduler) = tools();
        let result = tools
            .handle(SETUP_REMINDER, args(json!({"interval_seconds": 60})))
            .await;
        assert!(result.is_error);
        assert_eq!(result.error_code, Some(ToolErrorCode::InvalidArguments));
        assert!(result.content.contains("channel"));

        let result = tools
            .handle(SETUP_REMINDER, args(json!({"channel": "durov"})))
            .await;
        assert_eq!(result.error_code, Some(ToolErrorCode::InvalidArguments));
        assert!(scheduler.current().await.is_none());
    }

    #[tokio::test]
    async fn update_requires_active_reminder() {
        let (tools, _) = tools();
        let result = tools
            .handle(
                UPDATE_REMINDER,
                args(json!({"field": "message_count", "value": "5"})),
            )
            .await;
        assert_eq!(result.error_code, Some(ToolErrorCode::ExecutionFailed));
    }

    #[tokio::test]
    async fn update_snaps_and_echoes_new_value() {
        let (tools, scheduler) = tools();
        tools
            .handle(
                SETUP_REMINDER,
                args(json!({"channel": "durov", "interval_seconds": 60})),
            )
            .await;

        let result = tools
            .handle(
                UPDATE_REMINDER,
                args(json!({"field": "interval_seconds", "value": "1700"})),
            )
            .await;
        assert_eq!(
            result.content,
            r#"{"status":"updated","field":"interval_seconds","value":"30 minutes"}"#
        );
        assert_eq!(scheduler.current().await.unwrap().interval.seconds(), 1800);

        let result = tools
            .handle(UPDATE_REMINDER, args(json!({"field": "colour", "value": "red"})))
            .await;
        assert_eq!(result.error_code, Some(ToolErrorCode::InvalidArguments));

        let result = tools
            .handle(
                UPDATE_REMINDER,
                args(json!({"field": "message_count", "value": "lots"})),
            )
            .await;
        assert_eq!(result.error_code, Some(ToolErrorCode::InvalidArguments));
    }

    #[tokio::test]
    async fn stop_clears_scheduler() {
        let (tools, scheduler) = tools();
        tools
            .handle(
                SETUP_REMINDER,
                args(json!({"channel": "durov", "interval_seconds": 10})),
            )
            .await;
        let result = tools.handle(STOP_REMINDER, ToolArguments::new()).await;
        assert_eq!(result.content, r#"{"status":"stopped"}"#);
        assert!(scheduler.current().await.is_none());
    }

    #[tokio::test]
    async fn unknown_names_are_reported_not_thrown() {
        let (tools, _) = tools();
        let result = tools.handle("launch_rocket", ToolArguments::new()).await;
        assert!(result.is_error);
        assert_eq!(result.error_code, Some(ToolErrorCode::UnknownTool));
    }

    #[test]
    fn every_descriptor_ships_examples() {
        for descriptor in reminder_descriptors() {
            assert!(!descriptor.examples.is_empty(), "{}", descriptor.name);
        }
    }
}
