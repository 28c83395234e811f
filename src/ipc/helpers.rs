use crate::decimal::Decimal;
use crate::engine::CalcError;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {key}"), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

/// Decimal param accepted as a JSON number or a decimal string.
pub fn optional_decimal(req: &Request, key: &str) -> Result<Option<Decimal>, serde_json::Value> {
    let Some(raw) = req.params.get(key) else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    parse_decimal_value(raw).map(Some).map_err(|_| {
        err(
            &req.id,
            "bad_params",
            format!("{key} must be a decimal number"),
            Some(json!({ "value": raw.clone() })),
        )
    })
}

pub fn parse_decimal_value(raw: &serde_json::Value) -> Result<Decimal, ()> {
    if let Some(s) = raw.as_str() {
        return s.parse().map_err(|_| ());
    }
    if let Some(n) = raw.as_i64() {
        return Ok(Decimal::from_int(n));
    }
    if let Some(f) = raw.as_f64() {
        return Decimal::from_f64(f).ok_or(());
    }
    Err(())
}

pub fn db_conn<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn calc_err(req: &Request, e: CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}
