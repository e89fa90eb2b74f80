use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Inactive,
    Archived,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "archived" => Ok(Self::Archived),
            other => Err(EnumParseError::new("workflow status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of an execution.
///
/// Transitions follow `pending -> running -> {completed, failed, cancelled,
/// suspended}`; a suspended execution is re-enqueued as `pending` on resume.
/// The three terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EnumParseError::new("execution status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a single node evaluation within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for NodeRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeRunStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(EnumParseError::new("node run status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// What caused an execution to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Schedule,
    Timer,
    Subworkflow,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Timer => "timer",
            Self::Subworkflow => "subworkflow",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "webhook" => Ok(Self::Webhook),
            "schedule" => Ok(Self::Schedule),
            "timer" => Ok(Self::Timer),
            "subworkflow" => Ok(Self::Subworkflow),
            other => Err(EnumParseError::new("trigger type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of human task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Approval,
    Input,
    Review,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approval => "approval",
            Self::Input => "input",
            Self::Review => "review",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approval" => Ok(Self::Approval),
            "input" => Ok(Self::Input),
            "review" => Ok(Self::Review),
            other => Err(EnumParseError::new("task type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a human task.
///
/// `approved`, `rejected`, `expired` and `cancelled` are terminal; a
/// terminal task never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EnumParseError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Why a task escalation was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    Timeout,
    Manual,
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

impl FromStr for EscalationReason {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(Self::Timeout),
            "manual" => Ok(Self::Manual),
            other => Err(EnumParseError::new("escalation reason", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task escalation record. At most one escalation per task is
/// `active`; raising a new level supersedes the previous active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Active,
    Superseded,
    Completed,
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for EscalationStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "superseded" => Ok(Self::Superseded),
            "completed" => Ok(Self::Completed),
            other => Err(EnumParseError::new("escalation status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// What to do when a schedule fires while a prior run is still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    Skip,
    Queue,
    Terminate,
}

impl fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skip => "skip",
            Self::Queue => "queue",
            Self::Terminate => "terminate",
        };
        f.write_str(s)
    }
}

impl FromStr for OverlapPolicy {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "queue" => Ok(Self::Queue),
            "terminate" => Ok(Self::Terminate),
            other => Err(EnumParseError::new("overlap policy", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// How an inbound webhook request is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookAuthType {
    None,
    Signature,
    ApiKey,
}

impl fmt::Display for WebhookAuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Signature => "signature",
            Self::ApiKey => "api_key",
        };
        f.write_str(s)
    }
}

impl FromStr for WebhookAuthType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "signature" => Ok(Self::Signature),
            "api_key" => Ok(Self::ApiKey),
            other => Err(EnumParseError::new("webhook auth type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Comparison operator of a webhook filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    In,
    NotIn,
    Exists,
    Regex,
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Exists => "exists",
            Self::Regex => "regex",
        };
        f.write_str(s)
    }
}

impl FromStr for FilterOperator {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals" => Ok(Self::Equals),
            "not_equals" => Ok(Self::NotEquals),
            "contains" => Ok(Self::Contains),
            "not_contains" => Ok(Self::NotContains),
            "in" => Ok(Self::In),
            "not_in" => Ok(Self::NotIn),
            "exists" => Ok(Self::Exists),
            "regex" => Ok(Self::Regex),
            other => Err(EnumParseError::new("filter operator", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Outcome recorded for an inbound webhook request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Accepted,
    Filtered,
    Rejected,
}

impl fmt::Display for WebhookEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accepted => "accepted",
            Self::Filtered => "filtered",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for WebhookEventStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "filtered" => Ok(Self::Filtered),
            "rejected" => Ok(Self::Rejected),
            other => Err(EnumParseError::new("webhook event status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// State of a circuit breaker shared across executions of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

impl FromStr for BreakerState {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            other => Err(EnumParseError::new("breaker state", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone)]
pub struct EnumParseError {
    kind: &'static str,
    value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A workflow -- the versioned graph definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub version: i32,
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable snapshot of a workflow definition at one version.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Execution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub trigger_type: TriggerType,
    pub trigger_payload: serde_json::Value,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output: Option<serde_json::Value>,
    pub parent_execution_id: Option<Uuid>,
    pub parent_node_id: Option<String>,
    pub depth: i32,
    pub resume_node_id: Option<String>,
    pub resume_payload: Option<serde_json::Value>,
    pub wake_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One node's evaluation within an execution.
///
/// `(execution_id, node_id, attempt)` is unique; the attempt counter is
/// incremented by the retry operator and by loop iterations for body nodes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub attempt: i32,
    pub status: NodeRunStatus,
    pub input_snapshot: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// A human approval / input / review task pausing an execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HumanTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub task_type: TaskType,
    pub title: String,
    pub description: Option<String>,
    /// JSON array of user-id-or-role strings.
    pub assignees: serde_json::Value,
    pub status: TaskStatus,
    pub due_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
    pub response_data: Option<serde_json::Value>,
    pub escalation_level: i32,
    pub max_escalation_level: i32,
    pub last_escalated_at: Option<DateTime<Utc>>,
    /// The node config the task was created from, including the escalation
    /// plan.
    pub config: serde_json::Value,
    /// Optimistic lock counter; bumped on every mutation.
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

impl HumanTask {
    /// The assignee list as strings, tolerating malformed entries.
    pub fn assignee_list(&self) -> Vec<String> {
        self.assignees
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Audit record for one escalation event of a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskEscalation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub escalation_level: i32,
    pub escalated_at: DateTime<Utc>,
    pub escalated_from: serde_json::Value,
    pub escalated_to: serde_json::Value,
    pub reason: EscalationReason,
    pub timeout_minutes: Option<i32>,
    pub auto_action_taken: Option<String>,
    pub status: EscalationStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
}

/// A cron-driven trigger for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Schedule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub cron_expression: String,
    /// IANA timezone name, e.g. "America/New_York".
    pub timezone: String,
    pub overlap_policy: OverlapPolicy,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_execution_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// An inbound HTTP trigger endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Webhook {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    /// The `trigger:webhook` node in the workflow graph this endpoint maps to.
    pub node_id: String,
    pub path: String,
    pub auth_type: WebhookAuthType,
    pub secret: Option<String>,
    /// Header carrying the API key when `auth_type = api_key`.
    pub api_key_header: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// One filter predicate attached to a webhook.
///
/// Filters in the same `logic_group` combine with AND; distinct groups
/// combine with OR.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookFilter {
    pub id: Uuid,
    pub webhook_id: Uuid,
    /// `$.a.b[0].c` style path into the payload.
    pub field_path: String,
    pub operator: FilterOperator,
    pub value: Option<String>,
    pub logic_group: i32,
    pub enabled: bool,
    pub position: i32,
}

/// Record of one inbound webhook request.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub tenant_id: Uuid,
    pub status: WebhookEventStatus,
    pub payload: Option<serde_json::Value>,
    /// Request headers with sensitive entries removed.
    pub headers: Option<serde_json::Value>,
    pub execution_id: Option<Uuid>,
    pub received_at: DateTime<Utc>,
}

/// Shared circuit breaker state, keyed by `(workflow_id, node_id)` so every
/// execution through the same breaker observes the same state.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CircuitBreaker {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    pub state: BreakerState,
    pub failure_count: i32,
    pub half_open_attempts: i32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Optimistic lock counter for compare-and-set updates.
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

/// An in-app notification row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: String,
    pub event: String,
    pub title: String,
    pub body: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// An audit log entry for control-plane mutations and engine milestones.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLog {
    pub id: i64,
    pub tenant_id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A short lease guarding singleton background loops (schedule dispatcher,
/// overdue scanner) against duplicate dispatch across processes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DispatcherLease {
    pub name: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
