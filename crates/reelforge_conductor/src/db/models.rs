//! Row structs and their projections.

use super::parse_ts;
use reelforge_protocol::http_types::{ChannelSummary, CostEntryView, TaskDetail, TaskSummary};
use reelforge_protocol::{format_usd, ErrorLog, Priority, ReviewGate, Stage, TaskState};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChannelRow {
    pub channel_id: String,
    pub channel_name: String,
    pub planning_db_id: String,
    pub is_active: i64,
    pub priority_weight: i64,
    pub max_concurrent: i64,
    pub voice_id: Option<String>,
    pub intro_path: Option<String>,
    pub outro_path: Option<String>,
    pub storage_strategy: String,
    pub upload_privacy: String,
    pub daily_spend_cap_usd: Option<f64>,
    pub last_served_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ChannelRow {
    pub fn summary(&self, in_flight: i64, daily_spend: f64) -> ChannelSummary {
        ChannelSummary {
            channel_id: self.channel_id.clone(),
            channel_name: self.channel_name.clone(),
            is_active: self.is_active != 0,
            priority_weight: self.priority_weight,
            max_concurrent: self.max_concurrent,
            in_flight,
            daily_spend_cap_usd: self.daily_spend_cap_usd.map(format_usd),
            daily_spend_usd: format_usd(daily_spend),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub channel_id: String,
    pub planning_page_ref: String,
    pub title: String,
    pub topic: String,
    pub story_direction: String,
    pub priority: i64,
    pub state: String,
    pub stage_index: i64,
    pub completed_stages: i64,
    pub retry_count: i64,
    pub attempt: i64,
    pub available_at: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub lease_expires_at: Option<String>,
    pub error_kind: Option<String>,
    pub error_log: Option<String>,
    pub video_url: Option<String>,
    pub correlation_id: String,
    pub mirrored_label: Option<String>,
    pub mirrored_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    pub fn task_state(&self) -> TaskState {
        TaskState::parse(&self.state).unwrap_or(TaskState::Pending)
    }

    pub fn stage(&self) -> Stage {
        Stage::from_index(self.stage_index as u8).unwrap_or(Stage::Finalize)
    }

    pub fn bitmap(&self) -> u32 {
        self.completed_stages as u32
    }

    pub fn priority_level(&self) -> Priority {
        Priority::from_i64(self.priority)
    }

    /// The gate an `awaiting_review` task is blocked on.
    pub fn current_gate(&self) -> Option<ReviewGate> {
        self.stage().gate_after()
    }

    pub fn parsed_error_log(&self) -> Option<ErrorLog> {
        self.error_log.as_deref().and_then(ErrorLog::from_json)
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            title: self.title.clone(),
            priority: self.priority_level(),
            state: self.task_state(),
            stage_index: self.stage_index as u8,
            retry_count: self.retry_count,
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
        }
    }

    pub fn detail(&self) -> TaskDetail {
        TaskDetail {
            summary: self.summary(),
            planning_page_ref: self.planning_page_ref.clone(),
            topic: self.topic.clone(),
            story_direction: self.story_direction.clone(),
            completed_stages: self.bitmap(),
            attempt: self.attempt,
            available_at: parse_ts(&self.available_at),
            claimed_by: self.claimed_by.clone(),
            lease_expires_at: self.lease_expires_at.as_deref().map(parse_ts),
            error_log: self.parsed_error_log(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReviewRow {
    pub id: String,
    pub task_id: String,
    pub gate: String,
    pub attempt: i64,
    pub reviewer: String,
    pub decision: String,
    pub note: Option<String>,
    pub created_at: String,
}

impl ReviewRow {
    pub fn gate_parsed(&self) -> Option<ReviewGate> {
        ReviewGate::parse(&self.gate)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CostEntryRow {
    pub id: i64,
    pub task_id: String,
    pub channel_id: String,
    pub component: String,
    pub units: f64,
    pub usd_cost: f64,
    pub api_calls: i64,
    pub metadata: String,
    pub created_at: String,
}

impl CostEntryRow {
    pub fn view(&self) -> CostEntryView {
        CostEntryView {
            component: self.component.clone(),
            units: self.units,
            usd_cost: format_usd(self.usd_cost),
            api_calls: self.api_calls,
            created_at: parse_ts(&self.created_at),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    pub id: i64,
    pub created_at: String,
    pub channel_id: Option<String>,
    pub task_id: Option<String>,
    pub action: String,
    pub actor: String,
    pub note: Option<String>,
    pub metadata: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerRow {
    pub channel_id: String,
    pub date: String,
    pub units_used: i64,
    pub daily_ceiling: i64,
    pub warned_at_80: i64,
}
