//! Globals installed into the guest context.
//!
//! `fetch` is always present. `JSONPath` is added only for code that
//! mentions it. Nothing else from the host is reachable by the guest.

use std::rc::Rc;
use std::sync::Arc;

use rquickjs::function::Opt;
use rquickjs::{Coerced, Ctx, Exception, Function, IntoJs, Object, Promise, Value};

use super::jsonpath;
use super::scheduler::{BodyFormat, HostOp, SharedState};
use crate::http::{FetchError, RequestOptions, ResponseHandle};

/// Name the guest uses for the JSONPath helper.
pub(crate) const JSONPATH_GLOBAL: &str = "JSONPath";

pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    state: &SharedState<'js>,
    with_jsonpath: bool,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.set("fetch", fetch_function(ctx, state)?)?;

    if with_jsonpath {
        let query = jsonpath_function(ctx)?;
        // Also reachable as `JSONPath.JSONPath(...)`, the jsonpath-plus spelling
        query.set(JSONPATH_GLOBAL, query.clone())?;
        globals.set(JSONPATH_GLOBAL, query)?;
    }
    Ok(())
}

fn fetch_function<'js>(ctx: &Ctx<'js>, state: &SharedState<'js>) -> rquickjs::Result<Function<'js>> {
    let state = Rc::clone(state);
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, url: Coerced<String>, options: Opt<Value<'js>>| -> rquickjs::Result<Promise<'js>> {
            let (promise, resolve, reject) = ctx.promise()?;
            match request_options(&ctx, options.0) {
                Ok(options) => {
                    state
                        .borrow_mut()
                        .enqueue(HostOp::Fetch { url: url.0, options }, resolve, reject);
                }
                Err(error) => reject_with(&ctx, &state, &reject, error)?,
            }
            Ok(promise)
        },
    )?
    .with_name("fetch")
}

/// Reads the guest's options object through JSON, so only plain data
/// crosses into the host.
fn request_options<'js>(ctx: &Ctx<'js>, value: Option<Value<'js>>) -> Result<RequestOptions, FetchError> {
    let Some(value) = value.filter(|v| !v.is_undefined() && !v.is_null()) else {
        return Ok(RequestOptions::default());
    };
    if !value.is_object() {
        return Err(FetchError::InvalidRequest("fetch options must be an object".to_string()));
    }

    let json = match ctx.json_stringify(value) {
        Ok(Some(json)) => json.to_string(),
        Ok(None) => return Ok(RequestOptions::default()),
        Err(_) => {
            // Clear the pending exception (cycles, BigInt) before reporting
            let _ = ctx.catch();
            return Err(FetchError::InvalidRequest(
                "fetch options are not serializable".to_string(),
            ));
        }
    }
    .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

    serde_json::from_str(&json)
        .map_err(|e| FetchError::InvalidRequest(format!("invalid fetch options: {e}")))
}

/// Rejects a guest promise with an error object built from `error`, and
/// remembers that object so an uncaught rejection maps back to `error`.
pub(crate) fn reject_with<'js>(
    ctx: &Ctx<'js>,
    state: &SharedState<'js>,
    reject: &Function<'js>,
    error: FetchError,
) -> rquickjs::Result<()> {
    let message = error.to_string();
    let name = match error {
        FetchError::InvalidJson(_) => "SyntaxError",
        _ => "TypeError",
    };
    let exception = Exception::from_message(ctx.clone(), &message)?;
    exception.set("name", name)?;

    let rejection = exception.into_object();
    state.borrow_mut().record_failure(rejection.clone(), error);
    reject.call::<_, ()>((rejection,))
}

/// The guest view of a response: status fields, headers, and body readers
/// that each return a promise.
pub(crate) fn response_object<'js>(
    ctx: &Ctx<'js>,
    state: &SharedState<'js>,
    handle: Arc<ResponseHandle>,
) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("ok", handle.ok)?;
    obj.set("status", i32::from(handle.status))?;
    obj.set("statusText", handle.status_text.as_str())?;
    obj.set("url", handle.url.as_str())?;
    obj.set("headers", headers_object(ctx, &handle.headers)?)?;

    for (name, format) in [
        ("text", BodyFormat::Text),
        ("json", BodyFormat::Json),
        ("blob", BodyFormat::Blob),
        ("arrayBuffer", BodyFormat::Blob),
    ] {
        let state = Rc::clone(state);
        let handle = Arc::clone(&handle);
        let reader = Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Promise<'js>> {
            let (promise, resolve, reject) = ctx.promise()?;
            state.borrow_mut().enqueue(
                HostOp::ReadBody {
                    handle: Arc::clone(&handle),
                    format,
                },
                resolve,
                reject,
            );
            Ok(promise)
        })?
        .with_name(name)?;
        obj.set(name, reader)?;
    }

    Ok(obj)
}

/// Lower-cased header names; repeated headers joined with ", ".
fn merged_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        match merged.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => merged.push((name, value.clone())),
        }
    }
    merged
}

fn headers_object<'js>(ctx: &Ctx<'js>, headers: &[(String, String)]) -> rquickjs::Result<Object<'js>> {
    let merged = merged_headers(headers);
    let obj = Object::new(ctx.clone())?;
    for (name, value) in &merged {
        obj.set(name.as_str(), value.as_str())?;
    }

    let get = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, name: Coerced<String>| -> rquickjs::Result<Value<'js>> {
            let name = name.0.to_ascii_lowercase();
            match merged.iter().find(|(n, _)| *n == name) {
                Some((_, value)) => value.as_str().into_js(&ctx),
                None => Ok(Value::new_null(ctx)),
            }
        },
    )?;
    obj.set("get", get)?;
    Ok(obj)
}

/// `JSONPath({path, json})`, or `JSONPath(path, json)`. Returns an array
/// of matches (empty when nothing matches).
fn jsonpath_function<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        |ctx: Ctx<'js>, first: Value<'js>, second: Opt<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let (path, json) = match first.as_string() {
                Some(path) => (path.to_string()?, second.0),
                None => match first.as_object() {
                    Some(args) => (
                        args.get::<_, Coerced<String>>("path")?.0,
                        args.get::<_, Option<Value<'js>>>("json")?,
                    ),
                    None => return Err(Exception::throw_type(&ctx, "JSONPath expects {path, json}")),
                },
            };

            let document = match json {
                Some(json) => match ctx.json_stringify(json)? {
                    Some(text) => serde_json::from_str(&text.to_string()?)
                        .map_err(|e| Exception::throw_type(&ctx, &e.to_string()))?,
                    None => serde_json::Value::Null,
                },
                None => serde_json::Value::Null,
            };

            let matches = jsonpath::query(&path, &document)
                .map_err(|e| Exception::throw_type(&ctx, &e.to_string()))?;
            ctx.json_parse(serde_json::Value::Array(matches).to_string())
        },
    )?
    .with_name(JSONPATH_GLOBAL)
}
