use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: u64,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friend_id: Option<u64>,
    #[serde(skip)]
    pub version: u64,
}

impl Person {
    fn etag(&self) -> String {
        format!("\"{}-{}\"", self.id, self.version)
    }
}

/// Create/update payload, accepted form-encoded or as JSON.
#[derive(Debug, Default, Deserialize)]
pub struct PersonInput {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub age: Option<u64>,
    pub friend_id: Option<u64>,
}

impl PersonInput {
    fn parse(headers: &HeaderMap, body: &[u8]) -> Result<Self, String> {
        let is_json = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        if is_json {
            serde_json::from_slice(body).map_err(|err| err.to_string())
        } else {
            serde_urlencoded::from_bytes(body).map_err(|err| err.to_string())
        }
    }
}

#[derive(Debug, Default)]
pub struct AppState {
    people: RwLock<BTreeMap<u64, Person>>,
    next_id: AtomicU64,
    expires_hits: AtomicU64,
}

impl AppState {
    async fn insert(&self, input: PersonInput, first_name: String) -> Person {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let person = Person {
            id,
            first_name,
            last_name: input.last_name,
            age: input.age,
            friend_id: input.friend_id,
            version: 1,
        };
        self.people.write().await.insert(id, person.clone());
        person
    }
}

pub type Db = Arc<AppState>;

pub fn app() -> Router {
    let db: Db = Arc::new(AppState::default());
    Router::new()
        .route("/people", get(list_people).post(create_person))
        .route("/people.xml", get(list_people_xml))
        .route(
            "/people/{id}",
            get(get_person).put(update_person).delete(delete_person),
        )
        .route("/hal/people/{id}", get(get_person_hal))
        .route("/expiring", get(expiring))
        .route("/echo", get(echo_query).post(echo_body))
        .route("/status/{code}", get(status_code))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

fn not_found(id: u64) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not found", "id": id })),
    )
        .into_response()
}

async fn list_people(State(db): State<Db>) -> Json<Vec<Person>> {
    let people = db.people.read().await;
    Json(people.values().cloned().collect())
}

async fn list_people_xml(State(db): State<Db>) -> Response {
    let people = db.people.read().await;
    let mut body = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><people>"#);
    for person in people.values() {
        body.push_str(&format!(
            r#"<person id="{}"><first_name>{}</first_name></person>"#,
            person.id, person.first_name
        ));
    }
    body.push_str("</people>");
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

async fn create_person(State(db): State<Db>, headers: HeaderMap, body: Bytes) -> Response {
    let input = match PersonInput::parse(&headers, &body) {
        Ok(input) => input,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
    };
    let Some(first_name) = input.first_name.clone().filter(|n| !n.is_empty()) else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "errors": { "first_name": ["must be present"] } })),
        )
            .into_response();
    };
    let person = db.insert(input, first_name).await;
    info!(id = person.id, "created person");
    (StatusCode::CREATED, Json(person)).into_response()
}

async fn get_person(State(db): State<Db>, Path(id): Path<u64>, headers: HeaderMap) -> Response {
    let people = db.people.read().await;
    let Some(person) = people.get(&id) else {
        return not_found(id);
    };
    let etag = person.etag();
    let matches = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == etag);
    if matches {
        debug!(id, "etag matched");
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
    }
    ([(header::ETAG, etag)], Json(person.clone())).into_response()
}

async fn update_person(
    State(db): State<Db>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let input = match PersonInput::parse(&headers, &body) {
        Ok(input) => input,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
    };
    let mut people = db.people.write().await;
    let Some(person) = people.get_mut(&id) else {
        return not_found(id);
    };
    if let Some(first_name) = input.first_name {
        person.first_name = first_name;
    }
    if input.last_name.is_some() {
        person.last_name = input.last_name;
    }
    if input.age.is_some() {
        person.age = input.age;
    }
    if input.friend_id.is_some() {
        person.friend_id = input.friend_id;
    }
    person.version += 1;
    Json(person.clone()).into_response()
}

async fn delete_person(State(db): State<Db>, Path(id): Path<u64>) -> Response {
    let mut people = db.people.write().await;
    match people.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => not_found(id),
    }
}

/// HAL view of a person: the friend is embedded, `self` and `all` are links.
async fn get_person_hal(State(db): State<Db>, Path(id): Path<u64>) -> Response {
    let people = db.people.read().await;
    let Some(person) = people.get(&id) else {
        return not_found(id);
    };
    let mut links = json!({
        "self": { "href": format!("/people/{id}") },
        "all": { "href": "/people" },
    });
    let mut embedded = json!({});
    if let Some(friend) = person.friend_id.and_then(|fid| people.get(&fid)) {
        let href = format!("/people/{}", friend.id);
        links["friend"] = json!({ "href": href });
        let mut body = serde_json::to_value(friend).unwrap_or(Value::Null);
        body["_links"] = json!({ "self": { "href": href } });
        embedded["friend"] = body;
    }
    let doc = json!({
        "id": person.id,
        "first_name": person.first_name,
        "_links": links,
        "_embedded": embedded,
    });
    ([(header::CONTENT_TYPE, "application/hal+json")], Json(doc)).into_response()
}

/// Always fresh for an hour; the hit counter shows whether a client
/// served the second read from its cache.
async fn expiring(State(db): State<Db>) -> Response {
    let hits = db.expires_hits.fetch_add(1, Ordering::SeqCst) + 1;
    let expires = httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(3600));
    ([(header::EXPIRES, expires)], Json(json!({ "hits": hits }))).into_response()
}

async fn echo_query(
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Json<Value> {
    Json(json!({ "query": query, "headers": header_map(&headers) }))
}

async fn echo_body(headers: HeaderMap, body: Bytes) -> Json<Value> {
    Json(json!({
        "body": String::from_utf8_lossy(&body),
        "headers": header_map(&headers),
    }))
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

async fn status_code(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
    (status, Json(json!({ "status": status.as_u16(), "reason": status.canonical_reason() })))
        .into_response()
}
