//! Per-session DevTools HTTP endpoints.
//!
//! Mounted under `/cdp/{instance}/{alias}/`. Each handler finds the engine by
//! instance id and the session by alias, issues the matching metadata request
//! against the session's forwarded port, and returns the response with the
//! session's rewrite rules applied. An unknown instance or alias is a 404.

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{Path, RawQuery},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use crate::cdp::FetchError;
use crate::engine::ProxyEngine;
use crate::error::ProxyError;
use crate::registry;
use crate::rewrite::rewrite;
use crate::sessions::ActiveTarget;

#[derive(Debug, Deserialize)]
pub struct SessionPath {
    pub instance: String,
    pub alias: String,
}

#[derive(Debug, Deserialize)]
pub struct TabPath {
    pub instance: String,
    pub alias: String,
    pub target_id: String,
}

fn lookup(instance: &str, alias: &str) -> Result<(Arc<ProxyEngine>, ActiveTarget), ProxyError> {
    registry::find(instance)
        .and_then(|engine| engine.active_target(alias).map(|target| (engine, target)))
        .ok_or_else(|| ProxyError::UnknownTarget {
            name: alias.to_string(),
        })
}

fn rewritten(target: &ActiveTarget, result: Result<Value, FetchError>) -> Result<Value, ProxyError> {
    let value = result.map_err(|source| ProxyError::MetadataFetch {
        name: target.name.clone(),
        source,
    })?;
    Ok(rewrite(&value, &target.rewrites))
}

/// JSON stays JSON; text bodies go back as plain text.
fn respond(value: Value) -> Response {
    match value {
        Value::String(text) => text.into_response(),
        other => Json(other).into_response(),
    }
}

/// `GET .../json/version`
pub async fn version(Path(p): Path<SessionPath>) -> Result<Response, ProxyError> {
    let (engine, target) = lookup(&p.instance, &p.alias)?;
    let result = engine.cdp().version(target.local_port).await;
    Ok(respond(rewritten(&target, result)?))
}

/// `GET .../json` and `GET .../json/list`
pub async fn list(Path(p): Path<SessionPath>) -> Result<Response, ProxyError> {
    let (engine, target) = lookup(&p.instance, &p.alias)?;
    let result = engine.cdp().list(target.local_port).await;
    Ok(respond(rewritten(&target, result)?))
}

/// `GET .../json/protocol`
pub async fn protocol(Path(p): Path<SessionPath>) -> Result<Response, ProxyError> {
    let (engine, target) = lookup(&p.instance, &p.alias)?;
    let result = engine.cdp().protocol(target.local_port).await;
    Ok(respond(rewritten(&target, result)?))
}

/// `PUT .../json/new?<url>`: the whole raw query is the (encoded) tab URL.
pub async fn open_tab(
    Path(p): Path<SessionPath>,
    RawQuery(query): RawQuery,
) -> Result<Response, ProxyError> {
    let (engine, target) = lookup(&p.instance, &p.alias)?;
    let url = query.map(|q| decode_tab_url(&q).into_owned());
    let result = engine.cdp().open_tab(target.local_port, url.as_deref()).await;
    Ok(respond(rewritten(&target, result)?))
}

/// `GET .../json/activate/{target_id}`
pub async fn activate(Path(p): Path<TabPath>) -> Result<Response, ProxyError> {
    let (engine, target) = lookup(&p.instance, &p.alias)?;
    let result = engine.cdp().activate_tab(target.local_port, &p.target_id).await;
    Ok(respond(rewritten(&target, result)?))
}

/// `GET .../json/close/{target_id}`
pub async fn close(Path(p): Path<TabPath>) -> Result<Response, ProxyError> {
    let (engine, target) = lookup(&p.instance, &p.alias)?;
    let result = engine.cdp().close_tab(target.local_port, &p.target_id).await;
    Ok(respond(rewritten(&target, result)?))
}

/// `GET .../devtools/inspector.html`
pub async fn inspector(Path(p): Path<SessionPath>) -> Result<Response, ProxyError> {
    let (engine, target) = lookup(&p.instance, &p.alias)?;
    let result = engine.cdp().inspector(target.local_port).await;
    Ok(match rewritten(&target, result)? {
        Value::String(html) => Html(html).into_response(),
        other => Json(other).into_response(),
    })
}

/// Percent-decode a `json/new` query. Invalid UTF-8 keeps the raw text.
pub fn decode_tab_url(query: &str) -> Cow<'_, str> {
    urlencoding::decode(query).unwrap_or(Cow::Borrowed(query))
}
