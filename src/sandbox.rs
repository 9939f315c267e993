//! The sandbox message loop: the engine's only interface.
//!
//! The host and the engine exchange `(code, body)` frames over a pair of
//! byte streams, serialized as MessagePack (self-describing: integers,
//! floats, byte strings, text, lists, dictionaries, booleans, null).
//! `CALL` carries `[name, ...args]`; the reply is `DATA` with the return
//! value or `EXC` with `"ErrorKind message"`. Requests pair with replies in
//! FIFO order; the engine serves one request at a time.

use std::collections::HashMap;
use std::io::{Read, Write};

use anyhow::Context;
use reckon_core::{DocError, Document};
use serde_json::json;

pub const CALL: u8 = 1;
pub const DATA: u8 = 2;
pub const EXC: u8 = 3;

pub struct Sandbox {
    document: Document,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Sandbox {
    pub fn new() -> Sandbox {
        Sandbox { document: Document::new() }
    }

    /// Serve frames until the input stream closes.
    pub fn run(&mut self, input: &mut dyn Read, output: &mut dyn Write) -> anyhow::Result<()> {
        loop {
            let frame: (u8, serde_json::Value) = match rmp_serde::from_read(&mut *input) {
                Ok(frame) => frame,
                Err(rmp_serde::decode::Error::InvalidMarkerRead(ref io))
                    if io.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("dropping malformed frame: {}", err);
                    self.reply(output, EXC, json!(format!("InvalidRequest {}", err)))?;
                    continue;
                }
            };
            let (code, body) = frame;
            if code != CALL {
                self.reply(output, EXC, json!("InvalidRequest expected a CALL frame"))?;
                continue;
            }
            match self.dispatch(&body) {
                Ok(value) => self.reply(output, DATA, value)?,
                Err(err) => {
                    self.reply(output, EXC, json!(format!("{} {}", err.kind(), message_of(&err))))?
                }
            }
        }
    }

    fn reply(
        &self,
        output: &mut dyn Write,
        code: u8,
        body: serde_json::Value,
    ) -> anyhow::Result<()> {
        let frame = rmp_serde::to_vec(&(code, body)).context("encoding reply frame")?;
        output.write_all(&frame).context("writing reply frame")?;
        output.flush().context("flushing reply frame")?;
        Ok(())
    }

    /// Dispatch one `[name, ...args]` request to the document.
    pub fn dispatch(
        &mut self,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, DocError> {
        let parts = body
            .as_array()
            .ok_or_else(|| DocError::invalid("CALL body must be [name, ...args]"))?;
        let name = parts
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| DocError::invalid("CALL body must start with a method name"))?;
        let args = &parts[1..];
        log::debug!("calling {}", name);

        match name {
            "load_empty" => self.document.load_empty(),
            "load_meta_tables" => {
                let tables = arg(args, 0)?;
                let columns = arg(args, 1)?;
                self.document.load_meta_tables(tables, columns)
            }
            "load_table" => {
                let table_id = str_arg(args, 0)?;
                let data = arg(args, 1)?;
                self.document.load_table(table_id, data)
            }
            "load_done" => self.document.load_done(),
            "apply_user_actions" => {
                let actions = arg(args, 0)?
                    .as_array()
                    .ok_or_else(|| DocError::invalid("expected an array of user actions"))?;
                self.document.apply_user_actions(actions)
            }
            "fetch_table" => {
                let table_id = str_arg(args, 0)?;
                let formulas = args.get(1).and_then(|v| v.as_bool()).unwrap_or(true);
                let query = args.get(2).filter(|v| !v.is_null());
                self.document.fetch_table(table_id, formulas, query)
            }
            "fetch_meta_tables" => self.document.fetch_meta_tables(),
            "fetch_snapshot" => self.document.fetch_snapshot(),
            "autocomplete" => {
                let prefix = str_arg(args, 0)?;
                let table_id = str_arg(args, 1)?;
                Ok(json!(self.document.autocomplete(prefix, table_id)))
            }
            "find_col_from_values" => {
                let values = arg(args, 0)?
                    .as_array()
                    .ok_or_else(|| DocError::invalid("expected an array of values"))?;
                let n = args.get(1).and_then(|v| v.as_u64()).unwrap_or(1) as usize;
                let table_id = args.get(2).and_then(|v| v.as_str());
                Ok(json!(self.document.find_col_from_values(values, n, table_id)))
            }
            "get_formula_error" => {
                let table_id = str_arg(args, 0)?;
                let col_id = str_arg(args, 1)?;
                let row_id = args
                    .get(2)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| DocError::invalid("expected a row id"))?;
                self.document.get_formula_error(table_id, col_id, row_id)
            }
            "create_migrations" => {
                let all_tables = if let Some(obj) = args.first().filter(|v| v.is_object()) {
                    obj.clone()
                } else {
                    // Tolerate the tables arriving as a list of TableData.
                    let empty = Vec::new();
                    let payloads = args.first().and_then(|v| v.as_array()).unwrap_or(&empty);
                    let mut map = HashMap::new();
                    for payload in payloads {
                        if let Some(id) = payload.get(1).and_then(|v| v.as_str()) {
                            map.insert(id.to_string(), payload.clone());
                        }
                    }
                    json!(map)
                };
                self.document.create_migrations(&all_tables)
            }
            "get_version" => Ok(json!(self.document.get_version())),
            other => Err(DocError::invalid(format!("unknown engine method: {}", other))),
        }
    }
}

fn arg<'a>(args: &'a [serde_json::Value], index: usize) -> Result<&'a serde_json::Value, DocError> {
    args.get(index).ok_or_else(|| DocError::invalid(format!("missing argument {}", index)))
}

fn str_arg<'a>(args: &'a [serde_json::Value], index: usize) -> Result<&'a str, DocError> {
    arg(args, index)?
        .as_str()
        .ok_or_else(|| DocError::invalid(format!("expected string argument {}", index)))
}

fn message_of(err: &DocError) -> String {
    match err {
        DocError::Engine(inner) => {
            let text = inner.to_string();
            // EngineError renders as "Kind: message"; the wire form wants
            // just the message after the kind.
            match text.split_once(": ") {
                Some((_, message)) => message.to_string(),
                None => text,
            }
        }
        DocError::InvalidRequest(message) => message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_round_trip() {
        let mut sandbox = Sandbox::new();
        sandbox.dispatch(&json!(["load_empty"])).unwrap();
        let version = sandbox.dispatch(&json!(["get_version"])).unwrap();
        assert_eq!(version, json!(reckon_core::SCHEMA_VERSION));
        let err = sandbox.dispatch(&json!(["no_such_method"])).unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }

    #[test]
    fn test_run_loop_frames() {
        let mut sandbox = Sandbox::new();
        let mut input = Vec::new();
        input.extend(rmp_serde::to_vec(&(CALL, json!(["load_empty"]))).unwrap());
        input.extend(rmp_serde::to_vec(&(CALL, json!(["get_version"]))).unwrap());
        let mut output = Vec::new();
        sandbox.run(&mut input.as_slice(), &mut output).unwrap();

        let mut cursor = output.as_slice();
        let first: (u8, serde_json::Value) = rmp_serde::from_read(&mut cursor).unwrap();
        assert_eq!(first.0, DATA);
        let second: (u8, serde_json::Value) = rmp_serde::from_read(&mut cursor).unwrap();
        assert_eq!(second, (DATA, json!(reckon_core::SCHEMA_VERSION)));
    }

    #[test]
    fn test_error_reply_carries_kind() {
        let mut sandbox = Sandbox::new();
        sandbox.dispatch(&json!(["load_empty"])).unwrap();
        let err = sandbox
            .dispatch(&json!(["apply_user_actions", [["AddColumn", "Nope", "x", {}]]]))
            .unwrap_err();
        assert_eq!(err.kind(), "SchemaError");
    }
}
