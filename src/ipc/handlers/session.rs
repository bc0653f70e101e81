use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::ipc::{parse_params, RpcFailure};
use crate::AppContext;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AcquireParams {
    owner_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIdParams {
    session_id: String,
}

pub async fn acquire(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: AcquireParams = if params.is_null() {
        AcquireParams::default()
    } else {
        parse_params(params)?
    };
    let view = ctx.pool.create_session(p.owner_id, p.metadata).await?;
    Ok(serde_json::to_value(view).unwrap_or_default())
}

pub async fn release(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: SessionIdParams = parse_params(params)?;
    let closed = ctx.pool.close_session(&p.session_id).await?;
    Ok(json!({ "closed": closed }))
}

pub async fn info(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: SessionIdParams = parse_params(params)?;
    let view = ctx.pool.session_info(&p.session_id).await?;
    Ok(serde_json::to_value(view).unwrap_or_default())
}

pub async fn list(_params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let sessions = ctx.pool.list_sessions().await;
    Ok(json!(sessions))
}
