//! Sample Callables
//!
//! Functions registered by the `bear` binary so callable tasks can be
//! run from a manifest without writing a host program.

use std::thread;
use std::time::Duration;

use serde_json::{json, Map, Value};

use super::worker::Registry;

/// Registry with every sample callable.
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register("add", |args, _| {
            arithmetic("add", args, i64::checked_add, |a, b| a + b)
        })
        .register("subtract", |args, _| {
            arithmetic("subtract", args, i64::checked_sub, |a, b| a - b)
        })
        .register("multiply", |args, _| {
            arithmetic("multiply", args, i64::checked_mul, |a, b| a * b)
        })
        .register("sleep", |args, _| {
            let seconds = float_arg("sleep", args, 0)?;
            thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
            Ok(json!(seconds))
        })
        .register("hold_memory", hold_memory)
        .register("fail", |args, _| {
            let message = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("failed on request");
            Err(message.to_string())
        })
        .register("echo", |args, _| Ok(Value::Array(args.to_vec())))
        .register("concat", concat);
    registry
}

/// `hold_memory(megabytes, seconds)`: fills a buffer and keeps it
/// resident for the given time. Returns the buffer size in bytes.
fn hold_memory(args: &[Value], _kwargs: &Map<String, Value>) -> Result<Value, String> {
    let megabytes = float_arg("hold_memory", args, 0)?;
    let seconds = float_arg("hold_memory", args, 1)?;
    if megabytes < 0.0 {
        return Err("hold_memory: size must not be negative".to_string());
    }

    // Non-zero fill so every page is actually touched
    let buffer = vec![0xA5u8; (megabytes * 1024.0 * 1024.0) as usize];
    thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
    let len = std::hint::black_box(&buffer).len();
    Ok(json!(len))
}

/// `concat(*parts, sep="")`: joins the string form of every argument.
fn concat(args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, String> {
    let sep = match kwargs.get("sep") {
        None => "",
        Some(Value::String(s)) => s.as_str(),
        Some(other) => return Err(format!("concat: sep must be a string, got {}", other)),
    };

    let parts: Vec<String> = args
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    Ok(json!(parts.join(sep)))
}

fn arithmetic(
    name: &str,
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, String> {
    let [a, b] = args else {
        return Err(format!("{} expects 2 arguments, got {}", name, args.len()));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return int_op(x, y)
            .map(Value::from)
            .ok_or_else(|| format!("{} overflowed", name));
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(json!(float_op(x, y))),
        _ => Err(format!("unsupported operand types for {}: {} and {}", name, a, b)),
    }
}

fn float_arg(name: &str, args: &[Value], index: usize) -> Result<f64, String> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("{}: argument {} must be a number", name, index + 1))
}
