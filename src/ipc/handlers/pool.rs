use serde_json::Value;

use crate::ipc::RpcFailure;
use crate::AppContext;

pub async fn stats(_params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let stats = ctx.pool.stats().await;
    Ok(serde_json::to_value(stats).unwrap_or_default())
}

pub async fn health(_params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let stats = ctx.pool.stats().await;
    let health = crate::health::evaluate(&stats);
    Ok(serde_json::to_value(health).unwrap_or_default())
}
