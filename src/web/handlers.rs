//! HTTP request handlers.

use super::AppState;
use crate::db::DowntimeEvent;
use crate::notify::format_duration;
use crate::scheduler::{ConnectivityState, LinkStatus};
use crate::stats::WindowStatus;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json},
};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Templates (simple string replacement)
// ============================================================================

const LAYOUT_TEMPLATE: &str = include_str!("templates/layout.html");
const STATUS_TEMPLATE: &str = include_str!("templates/status.html");

const DEFAULT_DOWNTIME_LIMIT: u32 = 50;
const MAX_DOWNTIME_LIMIT: u32 = 1000;
const DASHBOARD_RECENT: u32 = 10;

// ============================================================================
// Dashboard
// ============================================================================

pub async fn handle_dashboard(State(state): State<AppState>) -> impl IntoResponse {
    let windows = state.status.get_status();
    let link = state.link.borrow().clone();
    let recent = state.store.recent_events(DASHBOARD_RECENT).unwrap_or_default();
    let db_size = state.store.get_db_size_bytes().unwrap_or(0);
    let event_count = state.store.count_events().unwrap_or(0);

    let content = render_status(
        &state.config.link_name,
        &windows,
        &link,
        &recent,
        Utc::now(),
    )
    .replace("{{db_size}}", &format_bytes(db_size))
    .replace("{{event_count}}", &event_count.to_string());

    let page = LAYOUT_TEMPLATE
        .replace("{{title}}", &format!("{} Status", escape_html(&state.config.link_name)))
        .replace("{{content}}", &content);

    Html(page)
}

/// Fill the status template; storage placeholders are left for the caller.
fn render_status(
    link_name: &str,
    windows: &[WindowStatus],
    link: &LinkStatus,
    recent: &[DowntimeEvent],
    now: DateTime<Utc>,
) -> String {
    let (state_label, state_class) = match (link.settled, link.state) {
        (false, ConnectivityState::Up) => ("Starting", "pending"),
        (_, ConnectivityState::Up) => ("Up", "up"),
        (_, ConnectivityState::Down) => ("Down", "down"),
    };

    let since = match link.seconds_since_transition(now) {
        Some(secs) => format!("for {}", format_duration(secs)),
        None => "since startup".to_string(),
    };

    let window_rows: String = windows
        .iter()
        .map(|w| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape_html(&w.window_label),
                w.downtime_count,
                format_duration(w.total_downtime_seconds.round() as i64)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let target_rows: String = link
        .outcomes
        .iter()
        .map(|o| {
            let result = match (o.latency_ns, &o.error) {
                (Some(ns), _) => format!("{:.1} ms", ns / 1e6),
                (None, Some(err)) => escape_html(err),
                (None, None) => "unreachable".to_string(),
            };
            format!("<tr><td>{}</td><td>{}</td></tr>", escape_html(&o.name), result)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let event_rows: String = recent
        .iter()
        .map(|e| {
            let end = match e.end() {
                Some(end) => local_time(end),
                None => "ongoing".to_string(),
            };
            let duration = match e.duration_seconds() {
                Some(secs) => format_duration(secs),
                None => format_duration((now - e.start()).num_seconds().max(0)),
            };
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                local_time(e.start()),
                end,
                duration
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    STATUS_TEMPLATE
        .replace("{{link_name}}", &escape_html(link_name))
        .replace("{{state_label}}", state_label)
        .replace("{{state_class}}", state_class)
        .replace("{{state_since}}", &since)
        .replace("{{window_rows}}", &window_rows)
        .replace("{{target_rows}}", &target_rows)
        .replace("{{event_rows}}", &event_rows)
}

fn local_time(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ============================================================================
// API
// ============================================================================

pub async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.get_status())
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    #[serde(flatten)]
    pub link: LinkStatus,
    pub seconds_since_transition: Option<i64>,
}

pub async fn handle_get_state(State(state): State<AppState>) -> impl IntoResponse {
    let link = state.link.borrow().clone();
    let seconds_since_transition = link.seconds_since_transition(Utc::now());
    Json(StateResponse {
        link,
        seconds_since_transition,
    })
}

#[derive(Debug, Deserialize)]
pub struct DowntimeQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ApiDowntimeEvent {
    pub id: i64,
    pub link_name: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub ongoing: bool,
    pub clock_skew: bool,
}

impl From<&DowntimeEvent> for ApiDowntimeEvent {
    fn from(e: &DowntimeEvent) -> Self {
        Self {
            id: e.id,
            link_name: e.link_name.clone(),
            start: e.start(),
            end: e.end(),
            duration_seconds: e.duration_seconds(),
            ongoing: e.is_open(),
            clock_skew: e.clock_skew,
        }
    }
}

pub async fn handle_get_downtime(
    State(state): State<AppState>,
    Query(query): Query<DowntimeQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DOWNTIME_LIMIT)
        .clamp(1, MAX_DOWNTIME_LIMIT);

    match state.store.recent_events(limit) {
        Ok(events) => {
            let events: Vec<ApiDowntimeEvent> = events.iter().map(ApiDowntimeEvent::from).collect();
            Json(events).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Static Assets
// ============================================================================

pub async fn handle_favicon() -> impl IntoResponse {
    let svg = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 100 100">
        <circle cx="50" cy="50" r="45" fill="#2e7d32"/>
        <path d="M20 62 Q50 22 80 62" stroke="white" stroke-width="7" fill="none"/>
        <circle cx="50" cy="68" r="7" fill="white"/>
    </svg>"##;

    ([(axum::http::header::CONTENT_TYPE, "image/svg+xml")], svg)
}
