//! Test-only build server used by integration tests.
//!
//! Speaks `Content-Length` framed JSON-RPC on stdio and serves two targets rooted at the
//! `rootUri` of `build/initialize`: `fake://Lib` (`Sources/Lib/lib.c`) and `fake://App`
//! (`Sources/App/main.c`, depends on Lib).
//!
//! Modes:
//! - `--legacy`: do not declare `sourceKitOptionsProvider`; push options after
//!   `textDocument/registerForChanges` instead.
//! - `--hang-method <METHOD>`: never answer that method unless the request is cancelled,
//!   in which case it is answered with `-32800`.
//! - `--delay-method <METHOD> <MS>`: sleep before answering that method.
//! - `--fail-initialize`: answer `build/initialize` with an error.
//! - `--ignore-exit`: keep running after `build/exit`.
//!
//! `test/stats` returns the cancelled request ids, the received notification methods and
//! the prepared targets.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read, Write},
    path::PathBuf,
    time::Duration,
};
use url::Url;

const LIB: &str = "fake://Lib";
const APP: &str = "fake://App";

#[derive(Default)]
struct Options {
    legacy: bool,
    ignore_exit: bool,
    fail_initialize: bool,
    hang_method: Option<String>,
    delays: HashMap<String, Duration>,
}

#[derive(Default)]
struct State {
    root: Option<PathBuf>,
    hung: Vec<Value>,
    cancelled: Vec<Value>,
    notifications: Vec<String>,
    prepared: Vec<String>,
}

fn main() -> Result<()> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--legacy" => options.legacy = true,
            "--ignore-exit" => options.ignore_exit = true,
            "--fail-initialize" => options.fail_initialize = true,
            "--hang-method" => options.hang_method = args.next(),
            "--delay-method" => {
                let method = args.next().context("--delay-method needs a method")?;
                let ms = args
                    .next()
                    .context("--delay-method needs a duration")?
                    .parse::<u64>()?;
                options.delays.insert(method, Duration::from_millis(ms));
            }
            other => return Err(anyhow!("unknown argument `{other}`")),
        }
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();
    let mut state = State::default();

    while let Some(message) = read_message(&mut reader)? {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let Some(id) = message.get("id").cloned() else {
            state.notifications.push(method.to_string());
            match method {
                "build/exit" if !options.ignore_exit => return Ok(()),
                "$/cancelRequest" => {
                    let cancelled = params.get("id").cloned().unwrap_or(Value::Null);
                    if let Some(pos) = state.hung.iter().position(|id| *id == cancelled) {
                        state.hung.remove(pos);
                        write_message(
                            &mut writer,
                            &json!({
                                "jsonrpc": "2.0",
                                "id": cancelled,
                                "error": { "code": -32800, "message": "request cancelled" },
                            }),
                        )?;
                    }
                    state.cancelled.push(cancelled);
                }
                "textDocument/registerForChanges" if options.legacy => {
                    let action = params.get("action").and_then(Value::as_str);
                    let uri = params.get("uri").and_then(Value::as_str);
                    if let (Some("register"), Some(uri)) = (action, uri) {
                        let path = file_path(uri);
                        write_message(
                            &mut writer,
                            &json!({
                                "jsonrpc": "2.0",
                                "method": "build/sourceKitOptionsChanged",
                                "params": {
                                    "uri": uri,
                                    "updatedOptions": { "options": ["clang", "-DLEGACY", path] },
                                },
                            }),
                        )?;
                    }
                }
                "workspace/didChangeWatchedFiles" => {
                    write_message(
                        &mut writer,
                        &json!({
                            "jsonrpc": "2.0",
                            "method": "buildTarget/didChange",
                            "params": {
                                "changes": [
                                    { "target": { "uri": LIB }, "kind": 2 },
                                    { "target": { "uri": APP }, "kind": 2 },
                                ],
                            },
                        }),
                    )?;
                }
                _ => {}
            }
            continue;
        };

        if options.hang_method.as_deref() == Some(method) {
            state.hung.push(id);
            continue;
        }
        if let Some(delay) = options.delays.get(method) {
            std::thread::sleep(*delay);
        }

        let response = match handle_request(method, &params, &options, &mut state) {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message },
            }),
        };
        write_message(&mut writer, &response)?;
    }

    Ok(())
}

fn handle_request(
    method: &str,
    params: &Value,
    options: &Options,
    state: &mut State,
) -> std::result::Result<Value, (i64, String)> {
    match method {
        "build/initialize" => {
            if options.fail_initialize {
                return Err((-32603, "initialization failed".to_string()));
            }
            state.root = params
                .get("rootUri")
                .and_then(Value::as_str)
                .and_then(|uri| Url::parse(uri).ok())
                .and_then(|uri| uri.to_file_path().ok());
            let mut data = json!({
                "indexDatabasePath": "index/db",
                "indexStorePath": "index/store",
                "prepareProvider": true,
                "watchers": [{ "globPattern": "**/*.fakebuild" }],
            });
            if !options.legacy {
                data["sourceKitOptionsProvider"] = json!(true);
            }
            Ok(json!({
                "displayName": "fake-build-server",
                "version": "0.1.0",
                "bspVersion": "2.2.0",
                "capabilities": { "languageIds": ["c", "swift"] },
                "dataKind": "sourceKit",
                "data": data,
            }))
        }
        "build/shutdown" => Ok(Value::Null),
        "workspace/buildTargets" => Ok(json!({
            "targets": [
                { "id": { "uri": LIB }, "displayName": "Lib", "tags": ["library"], "languageIds": ["c"], "dependencies": [] },
                { "id": { "uri": APP }, "displayName": "App", "tags": ["application"], "languageIds": ["c"], "dependencies": [{ "uri": LIB }] },
            ],
        })),
        "buildTarget/sources" => {
            let requested: Vec<&str> = params
                .get("targets")
                .and_then(Value::as_array)
                .map(|targets| {
                    targets
                        .iter()
                        .filter_map(|target| target.get("uri").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            let items: Vec<Value> = requested
                .into_iter()
                .filter_map(|target| {
                    let source = source_for_target(target)?;
                    let uri = file_uri(state, source)?;
                    Some(json!({
                        "target": { "uri": target },
                        "sources": [{
                            "uri": uri,
                            "kind": 1,
                            "generated": false,
                            "dataKind": "sourceKit",
                            "data": { "language": "c", "kind": "source", "outputPath": output_path(source) },
                        }],
                    }))
                })
                .collect();
            Ok(json!({ "items": items }))
        }
        "textDocument/sourceKitOptions" => {
            let uri = params
                .pointer("/textDocument/uri")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let known = [LIB, APP]
                .into_iter()
                .filter_map(source_for_target)
                .filter_map(|source| file_uri(state, source))
                .any(|source| source == uri);
            if !known {
                return Ok(Value::Null);
            }
            let path = file_path(uri);
            let object = format!("build/{}.o", stem(&path));
            Ok(json!({
                "compilerArguments": ["clang", "-c", path, "-o", object],
                "workingDirectory": state.root.as_ref().map(|root| root.display().to_string()),
            }))
        }
        "buildTarget/prepare" => {
            if let Some(targets) = params.get("targets").and_then(Value::as_array) {
                state.prepared.extend(
                    targets
                        .iter()
                        .filter_map(|target| target.get("uri").and_then(Value::as_str))
                        .map(str::to_string),
                );
            }
            Ok(Value::Null)
        }
        "workspace/waitForBuildSystemUpdates" => Ok(Value::Null),
        "test/stats" => Ok(json!({
            "cancelled": state.cancelled,
            "notifications": state.notifications,
            "prepared": state.prepared,
        })),
        other => Err((-32601, format!("method not found: {other}"))),
    }
}

fn source_for_target(target: &str) -> Option<&'static str> {
    match target {
        LIB => Some("Sources/Lib/lib.c"),
        APP => Some("Sources/App/main.c"),
        _ => None,
    }
}

fn output_path(source: &str) -> String {
    format!("build/{}.o", stem(source))
}

fn stem(path: &str) -> &str {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.split('.').next().unwrap_or(file)
}

fn file_uri(state: &State, relative: &str) -> Option<String> {
    let path = state.root.as_ref()?.join(relative);
    Url::from_file_path(path).ok().map(String::from)
}

fn file_path(uri: &str) -> String {
    Url::parse(uri)
        .ok()
        .and_then(|uri| uri.to_file_path().ok())
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| uri.to_string())
}

fn read_message(reader: &mut impl BufRead) -> Result<Option<Value>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line)?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(value.trim().parse::<usize>()?);
            }
        }
    }

    let len = content_length.ok_or_else(|| anyhow!("missing Content-Length header"))?;
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .context("failed to read framed JSON-RPC message")?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

fn write_message(writer: &mut impl Write, msg: &Value) -> Result<()> {
    let json = serde_json::to_vec(msg)?;
    write!(writer, "Content-Length: {}\r\n\r\n", json.len())?;
    writer.write_all(&json)?;
    writer.flush()?;
    Ok(())
}
