//! End-to-end tests against the live mock server.
//!
//! # Design
//! Each test starts the mock server on a random port, then drives the client
//! over real HTTP through a ureq-backed `Connection`. This checks that request
//! building, caching and materialization line up with an actual server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use restclient_core::{
    ApiError, CallOptions, Client, Connection, ConnectionFactory, HeaderList, MemoryCacheStore,
    Params, RawResponse, Registry, ResourceObject, ResourceType, Rule, TransportError, Value,
};

/// A `Connection` that performs requests with ureq.
///
/// Status codes are returned as data (`http_status_as_error(false)`) so the
/// core decides what a 404 or 500 means.
struct UreqConnection {
    base_url: String,
    agent: ureq::Agent,
}

impl UreqConnection {
    fn new(base_url: &str) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(5)))
            .build()
            .new_agent();
        Self {
            base_url: base_url.to_string(),
            agent,
        }
    }

    fn finish(
        &self,
        url: &str,
        result: Result<ureq::http::Response<ureq::Body>, ureq::Error>,
    ) -> Result<RawResponse, TransportError> {
        let mut response = result.map_err(|err| match err {
            ureq::Error::Timeout(_) => TransportError::Timeout(url.to_string()),
            _ => TransportError::ConnectionFailed(url.to_string()),
        })?;
        let mut raw = RawResponse::new(
            response.status().as_u16(),
            response.body_mut().read_to_string().unwrap_or_default(),
        );
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                raw.headers.set(name.as_str(), value);
            }
        }
        Ok(raw)
    }
}

impl Connection for UreqConnection {
    fn get(&self, path: &str, headers: &HeaderList) -> Result<RawResponse, TransportError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.agent.get(&url);
        for (name, value) in headers.iter_split() {
            request = request.header(name, value);
        }
        self.finish(&url, request.call())
    }

    fn post(&self, path: &str, body: &str, headers: &HeaderList) -> Result<RawResponse, TransportError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.agent.post(&url);
        for (name, value) in headers.iter_split() {
            request = request.header(name, value);
        }
        self.finish(&url, request.send(body.as_bytes()))
    }

    fn put(&self, path: &str, body: &str, headers: &HeaderList) -> Result<RawResponse, TransportError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.agent.put(&url);
        for (name, value) in headers.iter_split() {
            request = request.header(name, value);
        }
        self.finish(&url, request.send(body.as_bytes()))
    }

    fn delete(&self, path: &str, headers: &HeaderList) -> Result<RawResponse, TransportError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.agent.delete(&url);
        for (name, value) in headers.iter_split() {
            request = request.header(name, value);
        }
        self.finish(&url, request.call())
    }
}

fn ureq_factory() -> Arc<dyn ConnectionFactory> {
    Arc::new(|base_url: &str| -> Arc<dyn Connection> { Arc::new(UreqConnection::new(base_url)) })
}

/// Start a fresh mock server on a random port.
fn start_server() -> SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });
    addr
}

fn person(addr: SocketAddr) -> restclient_core::mapping::ResourceTypeBuilder {
    ResourceType::builder("Person")
        .base_url(&format!("http://{addr}"))
        .get("all", "/people")
        .get("find", "/people/:id")
        .post("create", "/people")
        .put("save", "/people/:id")
        .delete("remove", "/people/:id")
        .get_with("hal", "/hal/people/:id", CallOptions::new())
        .get_with("xml", "/people.xml", CallOptions::new().ignore_xml_root("people"))
        .get("expiring", "/expiring")
        .get("echo", "/echo")
        .post_with("echo_post", "/echo", CallOptions::new().request_body_type(restclient_core::BodyEncoding::Json))
        .get("status", "/status/:code")
}

fn client(resource: ResourceType) -> Client {
    Client::new(Registry::builder().register(resource).build().unwrap(), ureq_factory())
}

fn create(client: &Client, first_name: &str) -> ResourceObject {
    client
        .call("Person", "create", Params::new().with("first_name", first_name))
        .unwrap()
        .into_object()
        .unwrap()
}

#[test]
fn crud_lifecycle() {
    let addr = start_server();
    let client = client(person(addr).validates("first_name", Rule::Presence).build().unwrap());

    // Step 1: list, empty.
    let all = client.call("Person", "all", Params::new()).unwrap();
    assert!(all.as_list().unwrap().is_empty());

    // Step 2: create (form-encoded).
    let created = client
        .call("Person", "create", Params::new().with("first_name", "Billy").with("age", 21))
        .unwrap();
    let created = created.as_object().unwrap();
    assert_eq!(created.status(), Some(201));
    assert_eq!(created["first_name"], "Billy");
    assert_eq!(created["age"], 21_i64);
    let id = created["id"].as_i64().unwrap();

    // Step 3: find, clean with an ETag.
    let mut found = client
        .call("Person", "find", Params::new().with("id", id))
        .unwrap()
        .into_object()
        .unwrap();
    assert!(!found.is_dirty());
    assert!(found.etag().is_some());

    // Step 4: edit and save in place.
    found.set("age", 30);
    assert!(found.is_dirty_key("age"));
    client.call_on(&mut found, "save", Params::new()).unwrap();
    assert_eq!(found["age"], 30_i64);
    assert!(!found.is_dirty());

    // Step 5: validation blocks a save without a name.
    let mut nameless = ResourceObject::with_attributes("Person", [("id", Value::from(id))]);
    let err = client.call_on(&mut nameless, "save", Params::new()).unwrap_err();
    assert!(matches!(err, ApiError::ValidationFailed { .. }));

    // Step 6: delete, then the resource is gone.
    client.call("Person", "remove", Params::new().with("id", id)).unwrap();
    let err = client.call("Person", "find", Params::new().with("id", id)).unwrap_err();
    let ApiError::NotFound(failure) = err else {
        panic!("expected NotFound, got {err:?}");
    };
    assert_eq!(failure.status, 404);
    assert_eq!(failure.url, format!("http://{addr}/people/{id}"));
    assert_eq!(failure.result.unwrap()["id"], id);

    assert_eq!(client.instrumentation().calls_made(), 6);
}

#[test]
fn sends_headers_and_encoded_params() {
    let addr = start_server();
    let client = client(person(addr).header("X-Api-Key", "secret").build().unwrap());

    let echoed = client
        .call("Person", "echo", Params::new().with("name", "John Smith").with("age", 21))
        .unwrap();
    assert_eq!(echoed["query"]["name"], "John Smith");
    assert_eq!(echoed["query"]["age"], "21");
    assert_eq!(
        echoed["headers"]["accept"],
        "application/hal+json, application/json;q=0.5"
    );
    assert_eq!(echoed["headers"]["x-api-key"], "secret");
    assert!(echoed["headers"]["user-agent"].as_str().unwrap().starts_with("restclient-core/"));

    let posted = client
        .call("Person", "echo_post", Params::new().with("first_name", "Jane"))
        .unwrap();
    assert_eq!(posted["body"], r#"{"first_name":"Jane"}"#);
    assert_eq!(posted["headers"]["content-type"], "application/json");
}

#[test]
fn etag_revalidation_uses_not_modified() {
    let addr = start_server();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let resource = person(addr)
        .perform_caching(true)
        .record_response(move |_, response| sink.lock().push(response.status))
        .build()
        .unwrap();
    let registry = Registry::builder()
        .cache_store(Arc::new(MemoryCacheStore::default()))
        .register(resource)
        .build()
        .unwrap();
    let client = Client::new(registry, ureq_factory());

    let id = create(&client, "Billy")["id"].as_i64().unwrap();
    let first = client.call("Person", "find", Params::new().with("id", id)).unwrap();
    let second = client.call("Person", "find", Params::new().with("id", id)).unwrap();

    assert_eq!(second["first_name"], "Billy");
    assert_eq!(first.as_object().unwrap().to_json(), second.as_object().unwrap().to_json());
    assert_eq!(*statuses.lock(), vec![201, 200, 304]);
}

#[test]
fn fresh_expires_entries_skip_the_server() {
    let addr = start_server();
    let registry = Registry::builder()
        .cache_store(Arc::new(MemoryCacheStore::default()))
        .register(person(addr).perform_caching(true).build().unwrap())
        .build()
        .unwrap();
    let client = Client::new(registry, ureq_factory());

    let first = client.call("Person", "expiring", Params::new()).unwrap();
    let second = client.call("Person", "expiring", Params::new()).unwrap();
    assert_eq!(first["hits"], 1_i64);
    assert_eq!(second["hits"], 1_i64);
}

#[test]
fn hal_embeds_friends_and_defers_links() {
    let addr = start_server();
    let client = client(person(addr).build().unwrap());
    let billy = create(&client, "Billy");
    let sammy = client
        .call(
            "Person",
            "create",
            Params::new().with("first_name", "Sammy").with("friend_id", billy["id"].as_i64().unwrap()),
        )
        .unwrap();

    let hal = client
        .call("Person", "hal", Params::new().with("id", sammy["id"].as_i64().unwrap()))
        .unwrap();
    let hal = hal.as_object().unwrap();
    assert_eq!(hal["friend"]["first_name"], "Billy");
    assert_eq!(hal.links().get("all").map(String::as_str), Some("/people"));

    let all = hal["all"].as_lazy().unwrap();
    assert!(!all.is_resolved());
    let everyone = all.load(&client).unwrap();
    assert_eq!(everyone.as_list().unwrap().len(), 2);
    assert!(all.is_resolved());
}

#[test]
fn xml_listings_materialize() {
    let addr = start_server();
    let client = client(person(addr).build().unwrap());
    create(&client, "A");
    create(&client, "B");

    let listing = client.call("Person", "xml", Params::new()).unwrap();
    let people = listing["person"].as_list().unwrap();
    assert_eq!(people.len(), 2);
    assert_eq!(people[0]["first_name"], "A");
    assert_eq!(people[1]["id"], "2");
}

#[test]
fn status_codes_map_to_errors() {
    let addr = start_server();
    let client = client(person(addr).build().unwrap());

    let err = client.call("Person", "status", Params::new().with("code", 401)).unwrap_err();
    assert!(matches!(err, ApiError::Unauthorised(_)));

    let err = client.call("Person", "status", Params::new().with("code", 503)).unwrap_err();
    let ApiError::ServerError(failure) = err else {
        panic!("expected ServerError, got {err:?}");
    };
    assert_eq!(failure.result.unwrap()["status"], 503_i64);

    let err = client
        .call("Person", "create", Params::new().with("age", 3))
        .unwrap_err();
    let failure = err.http_failure().unwrap();
    assert_eq!(failure.status, 422);
    assert_eq!(failure.result.as_ref().unwrap()["errors"]["first_name"][0], "must be present");
}

#[test]
fn batches_dispatch_concurrently() {
    let addr = start_server();
    let client = client(person(addr).build().unwrap());
    for name in ["A", "B", "C"] {
        create(&client, name);
    }

    let deferred = client.in_parallel(|batch| {
        (1..=3)
            .map(|id| batch.call("Person", "find", Params::new().with("id", id)))
            .collect::<Vec<_>>()
    });

    let names: Vec<String> = deferred
        .iter()
        .map(|d| d.result().unwrap()["first_name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["A", "B", "C"]);
}

#[test]
fn refused_connections_fail_after_one_retry() {
    // Bind then drop to get a port nothing listens on.
    let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let client = client(person(addr).build().unwrap());
    let err = client.call("Person", "all", Params::new()).unwrap_err();
    assert!(matches!(err, ApiError::ConnectionFailed { .. }), "got {err:?}");
}
