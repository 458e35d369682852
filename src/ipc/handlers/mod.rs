pub mod backup_exchange;
pub mod charts;
pub mod core;
pub mod dashboard;
pub mod exams;
pub mod leaderboard;
pub mod points;
pub mod setup;
pub mod students;
pub mod subjects;

use rusqlite::Connection;

use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::scoring::CoreError;

pub(crate) fn db_conn<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub(crate) fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub(crate) fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

pub(crate) fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params.get(key).and_then(|v| v.as_i64()).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("missing or non-integer {}", key),
            None,
        )
    })
}

pub(crate) fn optional_i64(req: &Request, key: &str) -> Option<i64> {
    req.params.get(key).and_then(|v| v.as_i64())
}

pub(crate) fn required_date(
    req: &Request,
    key: &str,
) -> Result<chrono::NaiveDate, serde_json::Value> {
    let raw = required_str(req, key)?;
    parse_date(req, key, &raw)
}

pub(crate) fn parse_date(
    req: &Request,
    key: &str,
    raw: &str,
) -> Result<chrono::NaiveDate, serde_json::Value> {
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be an ISO date (YYYY-MM-DD)", key),
            None,
        )
    })
}

/// Optional "YYYY-MM" month filter.
pub(crate) fn optional_month(
    req: &Request,
    key: &str,
) -> Result<Option<(i32, u32)>, serde_json::Value> {
    let Some(raw) = optional_str(req, key) else {
        return Ok(None);
    };
    let bad = || {
        err(
            &req.id,
            "bad_params",
            format!("{} must be formatted YYYY-MM", key),
            None,
        )
    };
    let (year, month) = raw.split_once('-').ok_or_else(bad)?;
    let year: i32 = year.parse().map_err(|_| bad())?;
    let month: u32 = month.parse().map_err(|_| bad())?;
    if !(1..=12).contains(&month) {
        return Err(bad());
    }
    Ok(Some((year, month)))
}

pub(crate) fn core_err(req: &Request, e: CoreError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

pub(crate) fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}
