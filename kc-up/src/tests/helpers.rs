use httpmock::prelude::*;
use httpmock::{
    Mock,
    Then,
    When,
};
use serde_json::json;

pub struct MockServerBuilder {
    server: MockServer,
    mock_ids: Vec<(usize, usize)>,
}

impl MockServerBuilder {
    pub fn new() -> MockServerBuilder {
        MockServerBuilder { server: MockServer::start(), mock_ids: vec![] }
    }

    pub fn assert(&self) {
        for (id, calls) in &self.mock_ids {
            Mock::new(*id, &self.server).assert_hits(*calls);
        }
    }

    pub fn handle<F: Fn(When, Then) + 'static>(&mut self, f: F) -> usize {
        self.handle_multiple(f, 1)
    }

    pub fn handle_multiple<F: Fn(When, Then) + 'static>(&mut self, f: F, calls: usize) -> usize {
        let mock_id = self.server.mock(f).id;
        self.mock_ids.push((mock_id, calls));
        mock_id
    }

    pub fn url(&self) -> http::Uri {
        http::Uri::try_from(self.server.url("/")).unwrap()
    }
}

pub fn make_fake_apiserver() -> (MockServerBuilder, kube::Client) {
    let builder = MockServerBuilder::new();
    let config = kube::Config::new(builder.url());
    let client = kube::Client::try_from(config).unwrap();
    (builder, client)
}

pub fn status_conflict() -> serde_json::Value {
    json!({
      "kind": "Status",
      "apiVersion": "v1",
      "metadata": {},
      "status": "Failure",
      "reason": "AlreadyExists",
      "code": 409
    })
}

pub fn list_of<T: serde::Serialize>(kind: &str, items: &[T]) -> serde_json::Value {
    json!({
        "kind": kind,
        "apiVersion": "v1",
        "metadata": {},
        "items": items,
    })
}
