//! Axum + Askama front end: the aggregated feed as an HTML page and as JSON.

use std::future::Future;
use std::sync::Arc;

use agora_core::{SiteKey, TopicView};
use agora_storage::TopicStore;
use agora_sync::{select_feed, FeedConfig};
use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "agora-web";

const ROBOTS_TXT: &str = "User-agent: *\nAllow: /\nDisallow: /api/\n";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TopicStore>,
    pub feed: FeedConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn TopicStore>, feed: FeedConfig) -> Self {
        Self { store, feed }
    }

    async fn current_feed(&self) -> anyhow::Result<Vec<TopicView>> {
        let now = Utc::now().fixed_offset();
        Ok(select_feed(self.store.as_ref(), &self.feed, now).await?)
    }
}

/// Display row; absent usernames render as a placeholder.
struct FeedRow {
    site: &'static str,
    title: String,
    topic_url: String,
    username: String,
    replies: u32,
    last_activity: String,
}

impl From<TopicView> for FeedRow {
    fn from(topic: TopicView) -> Self {
        Self {
            site: topic.site_key.as_str(),
            title: topic.title,
            topic_url: topic.topic_url,
            username: topic.username.unwrap_or_else(|| "anonyme".to_string()),
            replies: topic.replies,
            last_activity: topic.last_activity,
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    title: &'static str,
    description: &'static str,
    topics: Vec<FeedRow>,
}

#[derive(Template)]
#[template(path = "about.html")]
struct AboutTemplate {
    title: &'static str,
    description: &'static str,
    forums: Vec<&'static str>,
}

#[derive(Template)]
#[template(path = "not_found.html")]
struct NotFoundTemplate {
    title: &'static str,
    description: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/about", get(about_handler))
        .route("/api/topics", get(api_topics_handler))
        .route("/robots.txt", get(robots_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state))
}

/// Web port from `AGORA_WEB_PORT`, 5000 by default.
pub fn port_from_env() -> u16 {
    std::env::var("AGORA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    serve_with_shutdown(state, port, std::future::pending()).await
}

pub async fn serve_with_shutdown<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "web server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.current_feed().await {
        Ok(topics) => render_html(IndexTemplate {
            title: "Agora - les sujets du moment",
            description: "Les derniers sujets des forums onche, avenoel, village, jeuxvideo et 2sucres.",
            topics: topics.into_iter().map(FeedRow::from).collect(),
        }),
        Err(err) => server_error(err),
    }
}

async fn about_handler() -> Response {
    render_html(AboutTemplate {
        title: "Agora - à propos",
        description: "Comment Agora choisit les sujets affichés.",
        forums: SiteKey::ALL.iter().map(|site| site.as_str()).collect(),
    })
}

async fn api_topics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.current_feed().await {
        Ok(topics) => Json(topics).into_response(),
        Err(err) => {
            error!(error = %err, "feed query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "feed unavailable" })),
            )
                .into_response()
        }
    }
}

async fn robots_handler() -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], ROBOTS_TXT).into_response()
}

async fn not_found_handler() -> Response {
    let mut resp = render_html(NotFoundTemplate {
        title: "Agora - page introuvable",
        description: "Cette page n'existe pas.",
    });
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err}")),
    )
        .into_response()
}
