//! Client subcommands.
//!
//! Each command works on a connected `Connection` and returns the lines to
//! print, so the formatting can be tested against an in-process hub.

use std::time::Duration;
use tracing::debug;
use ubus_core::{listener_fn, BusError, Connection, ObjectInfo, Result, Value};

/// Parse a JSON message argument. A missing message is an empty table.
pub fn parse_message(text: Option<&str>) -> Result<Value> {
    let Some(text) = text else {
        return Ok(Value::empty_table());
    };
    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| BusError::InvalidArgument {
            message: format!("Failed to parse message data: {}", e),
        })?;
    if !json.is_object() {
        return Err(BusError::InvalidArgument {
            message: "Message data must be a JSON object".to_string(),
        });
    }
    Ok(Value::from(json))
}

fn format_object(info: &ObjectInfo, verbose: bool) -> Vec<String> {
    if !verbose {
        return vec![info.path.clone()];
    }
    let mut lines = vec![format!("'{}' @{}", info.path, info.id)];
    for method in &info.methods {
        let args: serde_json::Map<String, serde_json::Value> = method
            .signature
            .policies()
            .iter()
            .map(|p| (p.name.clone(), p.kind.as_str().into()))
            .collect();
        lines.push(format!(
            "\t\"{}\":{}",
            method.name,
            serde_json::Value::Object(args)
        ));
    }
    lines
}

pub fn list(conn: &mut Connection, path: Option<&str>, verbose: bool) -> Result<Vec<String>> {
    let objects = conn.objects(path)?;
    debug!("Lookup returned {} objects", objects.len());
    Ok(objects
        .iter()
        .flat_map(|info| format_object(info, verbose))
        .collect())
}

pub fn call(
    conn: &mut Connection,
    object: &str,
    method: &str,
    message: Option<&str>,
    timeout: Duration,
) -> Result<Vec<String>> {
    let args = parse_message(message)?;
    let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    let replies = conn.call(object, method, &args, timeout_ms)?;
    replies.iter().map(|reply| pretty(&reply.to_json())).collect()
}

pub fn send(conn: &mut Connection, event: &str, message: Option<&str>) -> Result<()> {
    let data = parse_message(message)?;
    conn.send(event, &data)
}

/// Print matching events until the run loop is stopped.
pub fn listen(conn: &mut Connection, patterns: &[String]) -> Result<()> {
    let patterns: Vec<String> = if patterns.is_empty() {
        vec!["*".to_string()]
    } else {
        patterns.to_vec()
    };
    let pairs = patterns.into_iter().map(|pattern| {
        let listener = listener_fn(|_, event, data| {
            println!("{}", event_line(event, data)?);
            Ok(())
        });
        (pattern, listener)
    });
    let handles = conn.listen(pairs)?;
    if handles.is_empty() {
        return Err(BusError::usage("No event pattern could be registered"));
    }
    conn.run(None)
}

fn event_line(event: &str, data: &Value) -> Result<String> {
    let mut line = serde_json::Map::new();
    line.insert(event.to_string(), data.to_json());
    pretty(&serde_json::Value::Object(line))
}

fn pretty(json: &serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string_pretty(json)?)
}
