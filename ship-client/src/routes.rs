//! Mapping from cache keys to REST endpoints.

use async_trait::async_trait;
use serde_json::Value;
use ship_cache::{FetchError, QueryFetcher};
use ship_core::{keys, normalize_project, KeySegment, QueryKey};

use crate::api_client::RestClient;

/// How the envelope's `data` becomes the cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Raw,
    Project,
    ProjectList,
    /// `data.messages` of a conversation.
    Messages,
    /// `data.saved` of a bookmark check.
    SavedFlag,
}

impl Shape {
    pub fn extract(self, data: Value) -> Value {
        match self {
            Self::Raw => data,
            Self::Project => normalize_project(data),
            Self::ProjectList => match data {
                Value::Array(items) => Value::Array(items.into_iter().map(normalize_project).collect()),
                other => other,
            },
            Self::Messages => match data {
                Value::Object(mut map) => map.remove("messages").unwrap_or(Value::Array(Vec::new())),
                Value::Null => Value::Array(Vec::new()),
                other => other,
            },
            Self::SavedFlag => Value::Bool(data.get("saved").and_then(Value::as_bool).unwrap_or(false)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: String,
    pub query: Vec<(&'static str, String)>,
    pub shape: Shape,
}

impl Route {
    fn get(path: impl Into<String>, shape: Shape) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
            shape,
        }
    }

    fn param(mut self, name: &'static str, value: impl ToString) -> Self {
        self.query.push((name, value.to_string()));
        self
    }
}

/// Resolve the endpoint that loads `key`, if the taxonomy defines one.
pub fn route(key: &QueryKey) -> Option<Route> {
    use KeySegment::{Int, Str};

    let head = key.head()?;
    let rest = &key.segments()[1..];
    let route = match (head, rest) {
        (keys::PROJECTS, [Str(sort), Int(page)]) => {
            Route::get("/projects", Shape::ProjectList).param("sort", sort).param("page", page)
        }
        (keys::PROJECT, [Str(id)]) => Route::get(format!("/projects/{}", id), Shape::Project),
        (keys::COMMENTS, [Str(id)]) => Route::get("/comments", Shape::Raw).param("project_id", id),
        (keys::BADGES, [Str(id)]) => Route::get(format!("/badges/{}", id), Shape::Raw),
        (keys::LEADERBOARD, [Str(kind), Int(limit)]) if kind == "projects" || kind == "builders" => {
            Route::get(format!("/users/leaderboard/{}", kind), Shape::Raw).param("limit", limit)
        }
        (keys::USER, [Str(name)]) => Route::get(format!("/users/{}", name), Shape::Raw),
        (keys::INTROS, [Str(kind)]) if kind == "received" || kind == "sent" => {
            Route::get(format!("/intros/{}", kind), Shape::Raw)
        }
        (keys::MESSAGES, [Str(kind)]) if kind == "conversations" => {
            Route::get("/messages/conversations", Shape::Raw)
        }
        (keys::MESSAGES, [Str(kind), Str(user)]) if kind == "conversation" => {
            Route::get(format!("/messages/conversation/{}", user), Shape::Messages)
        }
        (keys::SAVED_PROJECTS, [Int(page), Int(per_page)]) => Route::get("/saved/my-saved", Shape::ProjectList)
            .param("page", page)
            .param("per_page", per_page),
        (keys::SAVED_CHECK, [Str(id)]) => Route::get(format!("/saved/check/{}", id), Shape::SavedFlag),
        _ => return None,
    };
    Some(route)
}

/// [`QueryFetcher`] backed by the REST API.
#[derive(Clone)]
pub struct RestFetcher {
    client: RestClient,
}

impl RestFetcher {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueryFetcher for RestFetcher {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError> {
        let route = route(key).ok_or_else(|| FetchError::unroutable(key))?;
        let query: Vec<(&str, String)> = route.query.iter().map(|(k, v)| (*k, v.clone())).collect();
        tracing::debug!(key = %key, path = %route.path, "fetching query");
        let data = self
            .client
            .get_data(&route.path, &query)
            .await
            .map_err(|e| FetchError::new(e.user_message()))?;
        Ok(route.shape.extract(data))
    }
}
