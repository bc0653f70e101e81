use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::ScreenshotOptions;
use crate::ipc::{parse_params, RpcFailure};
use crate::AppContext;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    session_id: String,
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageParams {
    session_id: String,
    page_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavigateParams {
    session_id: String,
    page_id: String,
    url: String,
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateParams {
    session_id: String,
    page_id: String,
    expression: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorParams {
    session_id: String,
    page_id: String,
    selector: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeParams {
    session_id: String,
    page_id: String,
    selector: String,
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotParams {
    session_id: String,
    page_id: String,
    #[serde(default)]
    full_page: bool,
    format: Option<String>,
    quality: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitForParams {
    session_id: String,
    page_id: String,
    selector: String,
    timeout_ms: Option<u64>,
}

pub async fn create(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: CreateParams = parse_params(params)?;
    let page_id = ctx.pool.create_page(&p.session_id, p.url.as_deref()).await?;
    Ok(json!({ "pageId": page_id, "sessionId": p.session_id }))
}

pub async fn close(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: PageParams = parse_params(params)?;
    let closed = ctx.pool.close_page(&p.session_id, &p.page_id).await?;
    Ok(json!({ "closed": closed }))
}

pub async fn info(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: PageParams = parse_params(params)?;
    let nav = ctx.pool.page_info(&p.session_id, &p.page_id).await?;
    Ok(json!({
        "pageId": p.page_id,
        "sessionId": p.session_id,
        "url": nav.url,
        "title": nav.title,
    }))
}

pub async fn navigate(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: NavigateParams = parse_params(params)?;
    let nav = ctx
        .pool
        .navigate(&p.session_id, &p.page_id, &p.url, p.timeout_ms)
        .await?;
    Ok(json!({ "url": nav.url, "title": nav.title }))
}

/// Runs caller-supplied code in the page context. Trusted-orchestrator
/// surface — no sandboxing beyond the engine's own isolation.
pub async fn evaluate(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: EvaluateParams = parse_params(params)?;
    let result = ctx
        .pool
        .evaluate(&p.session_id, &p.page_id, &p.expression)
        .await?;
    Ok(json!({ "result": result }))
}

pub async fn click(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: SelectorParams = parse_params(params)?;
    ctx.pool.click(&p.session_id, &p.page_id, &p.selector).await?;
    Ok(json!({}))
}

pub async fn type_text(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: TypeParams = parse_params(params)?;
    ctx.pool
        .type_text(&p.session_id, &p.page_id, &p.selector, &p.text)
        .await?;
    Ok(json!({}))
}

pub async fn screenshot(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: ScreenshotParams = parse_params(params)?;
    let opts = ScreenshotOptions {
        full_page: p.full_page,
        format: p.format.unwrap_or_else(|| "png".to_string()),
        quality: p.quality,
    };
    let bytes = ctx.pool.screenshot(&p.session_id, &p.page_id, &opts).await?;
    Ok(json!({
        "screenshot": BASE64.encode(&bytes),
        "format": opts.format,
        "pageId": p.page_id,
    }))
}

pub async fn content(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: PageParams = parse_params(params)?;
    let html = ctx.pool.content(&p.session_id, &p.page_id).await?;
    Ok(json!({ "content": html }))
}

pub async fn wait_for(params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    let p: WaitForParams = parse_params(params)?;
    let timeout_ms = p
        .timeout_ms
        .unwrap_or(ctx.config.page_load_timeout_secs * 1000);
    ctx.pool
        .wait_for(&p.session_id, &p.page_id, &p.selector, timeout_ms)
        .await?;
    Ok(json!({ "satisfied": true }))
}
