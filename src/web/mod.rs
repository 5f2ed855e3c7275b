//! Web front-end: a plain HTML registration form.
//!
//! Shares the orchestrator with the Telegram bot; the only web-specific
//! policy is the originating identity, which is the client IP. Since a
//! browser cannot be pushed to, approval progress is exposed as a polling
//! page under `/pending/{id}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Form, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fluent_templates::fluent_bundle::FluentArgs;
use secrecy::SecretString;
use serde::Deserialize;
use unic_langid::LanguageIdentifier;
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::error::AppError;
use crate::custodian::{ArtifactKind, Custodian, RetrievalToken};
use crate::i18n;
use crate::orchestrator::{
    ApprovalStatus, CompletedRegistration, Identity, Registrar, RegistrationOutcome,
    RegistrationRequest,
};

/// Shared state for the web handlers.
pub struct WebState {
    pub config: Arc<Config>,
    pub registrar: Arc<Registrar>,
    pub custodian: Arc<Custodian>,
}

/// Creates the registration router.
pub fn create_router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/", get(show_form))
        .route("/register", post(handle_register))
        .route("/download/{token}", get(handle_download))
        .route("/pending/{id}", get(show_pending))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Runs the web server until the task is cancelled.
pub async fn run_web_server(
    host: &str,
    port: u16,
    state: Arc<WebState>,
) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("{host}:{port}");
    log::info!("Starting registration web server on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "talkreg-web"
    }))
}

#[derive(Deserialize)]
struct LangQuery {
    lang: Option<String>,
}

#[derive(Deserialize)]
struct RegisterForm {
    username: String,
    password: String,
    #[serde(default)]
    nickname: String,
    #[serde(default)]
    lang: String,
}

/// Escape a value for embedding into HTML text or attributes.
fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn resolve_lang(code: Option<&str>) -> (String, LanguageIdentifier) {
    let code = code.and_then(i18n::is_language_supported).unwrap_or("en");
    (code.to_string(), i18n::lang_from_code(code))
}

/// Originating address: the proxy header when present, the peer otherwise.
fn client_ip(headers: &HeaderMap, peer: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
<title>{title}</title>\n\
<style>\n\
body {{ font-family: sans-serif; max-width: 32em; margin: 2em auto; padding: 0 1em; }}\n\
label {{ display: block; margin-top: 1em; }}\n\
input, select {{ width: 100%; padding: 0.4em; margin-top: 0.2em; }}\n\
button {{ margin-top: 1.5em; padding: 0.6em 2em; }}\n\
.error {{ color: #b00020; }}\n\
code {{ word-break: break-all; }}\n\
</style>\n</head>\n<body>\n{body}\n</body>\n</html>\n"
    ))
}

async fn show_form(
    State(state): State<Arc<WebState>>,
    Query(q): Query<LangQuery>,
) -> Html<String> {
    let (code, lang) = resolve_lang(q.lang.as_deref());
    let mut args = FluentArgs::new();
    args.set("server", state.config.server.name.clone());
    let title = i18n::t_args(&lang, "web-title", &args);

    let lang_options: String = i18n::SUPPORTED_LANGS
        .iter()
        .map(|(c, name)| {
            let selected = if *c == code { " selected" } else { "" };
            format!("<option value=\"{c}\"{selected}>{name}</option>")
        })
        .collect();

    let body = format!(
        "<h1>{title}</h1>\n\
<form method=\"post\" action=\"/register\">\n\
<label>{l_username}<input name=\"username\" required maxlength=\"64\"></label>\n\
<label>{l_password}<input name=\"password\" type=\"password\" required minlength=\"4\"></label>\n\
<label>{l_nickname}<input name=\"nickname\"></label>\n\
<label>{l_lang}<select name=\"lang\">{lang_options}</select></label>\n\
<button type=\"submit\">{l_submit}</button>\n\
</form>",
        title = html_escape(&title),
        l_username = i18n::t(&lang, "web-form-username"),
        l_password = i18n::t(&lang, "web-form-password"),
        l_nickname = i18n::t(&lang, "web-form-nickname"),
        l_lang = i18n::t(&lang, "web-form-language"),
        l_submit = i18n::t(&lang, "web-form-submit"),
    );
    page(&title, &body)
}

async fn handle_register(
    State(state): State<Arc<WebState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<RegisterForm>,
) -> Response {
    let (code, lang) = resolve_lang(Some(form.lang.as_str()).filter(|s| !s.is_empty()));
    let ip = client_ip(&headers, &peer);

    let request = RegistrationRequest {
        identity: Identity::Web(ip.clone()),
        username: form.username,
        password: SecretString::from(form.password),
        nickname: Some(form.nickname).filter(|n| !n.trim().is_empty()),
        channel: None,
        lang: code.clone(),
        source: format!("IP {ip}"),
    };

    match state.registrar.submit(request).await {
        Ok(RegistrationOutcome::Completed(completed)) => {
            success_page(&lang, &completed).into_response()
        }
        Ok(RegistrationOutcome::AwaitingApproval { request_id }) => {
            Redirect::to(&format!("/pending/{request_id}?lang={code}")).into_response()
        }
        Err(e) => error_page(&lang, &e).into_response(),
    }
}

fn success_page(lang: &LanguageIdentifier, completed: &CompletedRegistration) -> Html<String> {
    let title = i18n::t(lang, "web-success-title");
    let mut args = FluentArgs::new();
    args.set("username", completed.username.clone());
    let intro = i18n::t_args(lang, "web-success-intro", &args);

    let minutes = (completed.artifact_ttl_secs / 60).max(1);
    let mut args = FluentArgs::new();
    args.set("minutes", minutes);
    let expiry = i18n::t_args(lang, "web-files-expire", &args);

    let archive_link = match (&completed.archive_token, &completed.archive_filename) {
        (Some(token), Some(_)) => format!(
            "<li><a href=\"/download/{token}\">{label}</a></li>\n",
            label = i18n::t(lang, "web-download-archive"),
        ),
        _ => String::new(),
    };

    let body = format!(
        "<h1>{title}</h1>\n<p>{intro}</p>\n\
<p>{l_link}:<br><code>{link}</code></p>\n\
<ul>\n<li><a href=\"/download/{descriptor_token}\">{l_descriptor}</a></li>\n{archive_link}</ul>\n\
<p>{expiry}</p>",
        title = html_escape(&title),
        intro = html_escape(&intro),
        l_link = i18n::t(lang, "web-quick-connect"),
        link = html_escape(&completed.quick_connect_link),
        descriptor_token = completed.descriptor_token,
        l_descriptor = i18n::t(lang, "web-download-descriptor"),
        expiry = html_escape(&expiry),
    );
    page(&title, &body)
}

fn error_page(lang: &LanguageIdentifier, error: &AppError) -> (StatusCode, Html<String>) {
    let title = i18n::t(lang, "web-error-title");
    let reason = i18n::t(lang, error.reason_key());
    let status = match error {
        AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::AlreadyRegistered | AppError::AlreadyPending | AppError::UsernameTaken => {
            StatusCode::CONFLICT
        }
        AppError::Banned => StatusCode::FORBIDDEN,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = format!(
        "<h1>{title}</h1>\n<p class=\"error\">{reason}</p>\n<p><a href=\"/\">&larr;</a></p>",
        title = html_escape(&title),
        reason = html_escape(&reason),
    );
    (status, page(&title, &body))
}

async fn show_pending(
    State(state): State<Arc<WebState>>,
    Path(id): Path<String>,
    Query(q): Query<LangQuery>,
) -> Response {
    let (_, lang) = resolve_lang(q.lang.as_deref());
    let Ok(request_id) = Uuid::parse_str(&id) else {
        return error_page(&lang, &AppError::PendingNotFound).into_response();
    };

    match state.registrar.approval_status(request_id) {
        Some(ApprovalStatus::Pending) => {
            let title = i18n::t(&lang, "web-pending-title");
            let body = format!(
                "<meta http-equiv=\"refresh\" content=\"5\">\n<h1>{title}</h1>\n<p>{text}</p>",
                title = html_escape(&title),
                text = html_escape(&i18n::t(&lang, "web-pending-waiting")),
            );
            page(&title, &body).into_response()
        }
        Some(ApprovalStatus::Approved(completed)) => success_page(&lang, &completed).into_response(),
        Some(ApprovalStatus::Denied) => {
            let title = i18n::t(&lang, "web-pending-title");
            let body = format!(
                "<h1>{title}</h1>\n<p class=\"error\">{text}</p>",
                title = html_escape(&title),
                text = html_escape(&i18n::t(&lang, "web-pending-denied")),
            );
            (StatusCode::FORBIDDEN, page(&title, &body)).into_response()
        }
        Some(ApprovalStatus::Failed(reason_key)) => {
            let title = i18n::t(&lang, "web-error-title");
            let body = format!(
                "<h1>{title}</h1>\n<p class=\"error\">{text}</p>",
                title = html_escape(&title),
                text = html_escape(&i18n::t(&lang, &reason_key)),
            );
            (StatusCode::CONFLICT, page(&title, &body)).into_response()
        }
        None => error_page(&lang, &AppError::PendingNotFound).into_response(),
    }
}

async fn handle_download(
    State(state): State<Arc<WebState>>,
    Path(token): Path<String>,
    Query(q): Query<LangQuery>,
) -> Response {
    let (_, lang) = resolve_lang(q.lang.as_deref());
    match state.custodian.retrieve(&RetrievalToken::from(token)) {
        Ok(artifact) => {
            let content_type = match artifact.kind {
                ArtifactKind::Descriptor => "application/octet-stream",
                ArtifactKind::ClientArchive => "application/zip",
            };
            let disposition = format!("attachment; filename=\"{}\"", artifact.filename);
            (
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                artifact.bytes,
            )
                .into_response()
        }
        Err(e @ AppError::TokenExpired) => {
            let (_, html) = error_page(&lang, &e);
            (StatusCode::GONE, html).into_response()
        }
        Err(e) => {
            let (_, html) = error_page(&lang, &e);
            (StatusCode::NOT_FOUND, html).into_response()
        }
    }
}
