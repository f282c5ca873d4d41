// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Handler for Pingora’s `request_filter` and `logging` phases

use async_trait::async_trait;
use log::{error, trace};
use pandora_module_utils::pingora::{Error, SessionWrapper};
use pandora_module_utils::{RequestFilter, RequestFilterResult};
use std::sync::Arc;
use std::time::Instant;

use crate::compression::compress;
use crate::configuration::RedisLogConf;
use crate::entry::{LogEntry, RequestInfo};
use crate::sink::RedisSink;

/// Handler for Pingora’s `request_filter` and `logging` phases
#[derive(Debug, Clone)]
pub struct RedisLogHandler {
    sink: Option<Arc<RedisSink>>,
    with_body: bool,
    compress: bool,
}

impl TryFrom<RedisLogConf> for RedisLogHandler {
    type Error = Box<Error>;

    fn try_from(conf: RedisLogConf) -> Result<Self, Self::Error> {
        let sink = if conf.redis_key.is_empty() {
            None
        } else {
            Some(Arc::new(RedisSink::connect(&conf)?))
        };

        Ok(Self {
            sink,
            with_body: conf.redis_with_body,
            compress: conf.redis_compress,
        })
    }
}

#[derive(Debug)]
struct CapturedRequest {
    info: RequestInfo,
    bytes_read: u64,
}

impl CapturedRequest {
    fn capture(session: &impl SessionWrapper) -> Self {
        Self {
            info: RequestInfo::capture(session),
            bytes_read: RequestInfo::content_length(session),
        }
    }
}

/// Context data for the Redis log module
#[derive(Debug)]
pub struct RequestCtx {
    start: Instant,
    request: Option<CapturedRequest>,
}

async fn read_body(session: &mut impl SessionWrapper) -> String {
    // Consume whatever is left of the request body, it will be added to the retry buffer
    while !session.is_body_done() {
        match session.read_request_body().await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(err) => {
                trace!("Failed reading request body: {err}");
                break;
            }
        }
    }

    session
        .get_retry_buffer()
        .map(|body| String::from_utf8_lossy(&body).into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl RequestFilter for RedisLogHandler {
    type Conf = RedisLogConf;
    type CTX = RequestCtx;
    fn new_ctx() -> Self::CTX {
        RequestCtx {
            start: Instant::now(),
            request: None,
        }
    }

    async fn request_filter(
        &self,
        session: &mut impl SessionWrapper,
        ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>> {
        if self.sink.is_none() {
            // Logging disabled
            return Ok(RequestFilterResult::Unhandled);
        }

        ctx.request = Some(CapturedRequest::capture(session));
        if self.with_body {
            session.enable_retry_buffering();
        }

        Ok(RequestFilterResult::Unhandled)
    }

    async fn logging(
        &self,
        session: &mut impl SessionWrapper,
        _e: Option<&Error>,
        ctx: &mut RequestCtx,
    ) {
        let Some(sink) = &self.sink else {
            // Logging disabled
            return;
        };

        // Request filter doesn't run if an earlier phase produced an error
        let request = ctx
            .request
            .take()
            .unwrap_or_else(|| CapturedRequest::capture(session));
        let body = if self.with_body {
            Some(read_body(session).await)
        } else {
            None
        };

        let entry = LogEntry::new(
            session,
            request.info,
            request.bytes_read,
            ctx.start.elapsed(),
            body,
        );
        let mut payload = match entry.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                error!("Error marshaling log entry to JSON: {err}");
                return;
            }
        };
        if self.compress {
            payload = match compress(&payload) {
                Ok(payload) => payload,
                Err(err) => {
                    error!("Error compressing log entry: {err}");
                    return;
                }
            };
        }

        match sink.push(payload).await {
            Ok(()) => trace!("Pushed log entry to Redis list {}", sink.key()),
            Err(err) => error!("Error pushing log entry to Redis: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::header;
    use pandora_module_utils::pingora::{
        create_test_session, create_test_session_with_body, RequestHeader, ResponseHeader, Session,
    };
    use pandora_module_utils::{DeserializeMap, FromYaml};
    use startup_module::DefaultApp;
    use test_log::test;

    use crate::compression::decompress;
    use crate::fake_redis::FakeRedis;

    #[derive(Debug, Clone, PartialEq, Eq, DeserializeMap)]
    struct TestConf {
        test_status: u16,
    }

    impl Default for TestConf {
        fn default() -> Self {
            Self { test_status: 200 }
        }
    }

    #[derive(Debug)]
    struct TestResponder {
        status: u16,
    }

    impl TryFrom<TestConf> for TestResponder {
        type Error = Box<Error>;

        fn try_from(conf: TestConf) -> Result<Self, Self::Error> {
            Ok(Self {
                status: conf.test_status,
            })
        }
    }

    #[async_trait]
    impl RequestFilter for TestResponder {
        type Conf = TestConf;
        type CTX = ();
        fn new_ctx() -> Self::CTX {}

        async fn request_filter(
            &self,
            session: &mut impl SessionWrapper,
            _ctx: &mut Self::CTX,
        ) -> Result<RequestFilterResult, Box<Error>> {
            let mut response = ResponseHeader::build(self.status, None)?;
            response.insert_header(header::CONTENT_LENGTH, 2)?;
            response.insert_header("X-Test", "response")?;
            session
                .write_response_header(Box::new(response), false)
                .await?;
            session
                .write_response_body(Some("hi".into()), true)
                .await?;
            Ok(RequestFilterResult::ResponseSent)
        }
    }

    #[derive(Debug, RequestFilter)]
    struct Handler {
        log: RedisLogHandler,
        responder: TestResponder,
    }

    fn make_app(conf: &str) -> Result<DefaultApp<Handler>, Box<Error>> {
        DefaultApp::from_conf(<Handler as RequestFilter>::Conf::from_yaml(conf).unwrap())
    }

    fn conf(redis: &FakeRedis, extra: &str) -> String {
        format!(
            "redis_key: applogs\nredis_address: {}\n{extra}",
            redis.address()
        )
    }

    async fn make_session(method: &str, uri: &str) -> Session {
        let mut header = RequestHeader::build(method, uri.as_bytes(), None).unwrap();
        header.insert_header(header::HOST, "localhost").unwrap();
        header.insert_header("X-Forwarded-For", "192.0.2.1").unwrap();
        create_test_session(header).await
    }

    fn pushed(redis: &FakeRedis) -> Vec<serde_json::Value> {
        redis
            .commands("LPUSH")
            .into_iter()
            .map(|command| {
                assert_eq!(command.len(), 3);
                assert_eq!(command[1], b"applogs");
                serde_json::from_slice(&command[2]).unwrap()
            })
            .collect()
    }

    #[test(tokio::test)]
    async fn push_entry() {
        let redis = FakeRedis::start();
        let mut app = make_app(&conf(&redis, "")).unwrap();
        assert_eq!(redis.commands("PING").len(), 1);

        let session = make_session("GET", "/path?q=1").await;
        let mut result = app.handle_request(session).await;
        assert!(result.err().is_none());
        assert_eq!(result.body_str(), "hi");
        assert_eq!(result.session().response_written().unwrap().status, 200);

        let entries = pushed(&redis);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry["request"]["method"], "GET");
        assert_eq!(entry["request"]["uri"], "/path?q=1");
        assert_eq!(entry["request"]["host"], "localhost");
        assert_eq!(entry["request"]["proto"], "HTTP/1.1");
        assert_eq!(entry["request"]["client_ip"], "192.0.2.1");
        assert_eq!(entry["request"]["headers"]["x-forwarded-for"][0], "192.0.2.1");
        assert!(entry["request"].get("tls").is_none());
        assert_eq!(entry["status"], 200);
        assert_eq!(entry["resp_headers"]["x-test"][0], "response");
        assert_eq!(entry["bytes_read"], 0);
        assert!(entry["duration"].as_f64().unwrap() >= 0.0);
        assert!(entry["ts"].as_str().unwrap().contains('T'));
        assert!(entry.get("request_body").is_none());

        let session = make_session("HEAD", "/").await;
        app.handle_request(session).await;
        let entries = pushed(&redis);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["request"]["method"], "GET");
        assert_eq!(entries[1]["request"]["method"], "HEAD");
    }

    #[test(tokio::test)]
    async fn request_body() {
        let redis = FakeRedis::start();
        let mut app = make_app(&conf(&redis, "redis_with_body: true")).unwrap();

        let header = RequestHeader::build("POST", b"/submit", None).unwrap();
        let session = create_test_session_with_body(header, "name=value").await;
        let result = app.handle_request(session).await;
        assert!(result.err().is_none());

        let entries = pushed(&redis);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["request"]["method"], "POST");
        assert_eq!(entries[0]["bytes_read"], 10);
        assert_eq!(entries[0]["request_body"], "name=value");
    }

    #[test(tokio::test)]
    async fn response_status() {
        let redis = FakeRedis::start();
        let mut app = make_app(&conf(&redis, "test_status: 404")).unwrap();

        let session = make_session("GET", "/missing").await;
        let mut result = app.handle_request(session).await;
        assert_eq!(result.session().response_written().unwrap().status, 404);

        let entries = pushed(&redis);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["request"]["uri"], "/missing");
        assert_eq!(entries[0]["status"], 404);
        assert_eq!(entries[0]["size"], 2);
    }

    #[test(tokio::test)]
    async fn compressed() {
        let redis = FakeRedis::start();
        let mut app = make_app(&conf(&redis, "redis_compress: true")).unwrap();

        let session = make_session("GET", "/").await;
        app.handle_request(session).await;

        let commands = redis.commands("LPUSH");
        assert_eq!(commands.len(), 1);
        let payload = decompress(&commands[0][2]).unwrap();
        let entry: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(entry["request"]["method"], "GET");
        assert_eq!(entry["status"], 200);
    }

    #[test(tokio::test)]
    async fn disabled() {
        let mut app = make_app("redis_address: 127.0.0.1:1").unwrap();

        let session = make_session("GET", "/").await;
        let result = app.handle_request(session).await;
        assert!(result.err().is_none());
        assert_eq!(result.body_str(), "hi");
    }

    #[test(tokio::test)]
    async fn unreachable() {
        let redis = FakeRedis::start();
        redis.refuse_connections();
        assert!(make_app(&conf(&redis, "redis_connect_timeout: 1")).is_err());
    }

    #[test(tokio::test)]
    async fn invalid_configuration() {
        let redis = FakeRedis::start();
        assert!(make_app(&conf(&redis, "redis_read_timeout: -1")).is_err());
        assert!(make_app("redis_key: applogs\nredis_address: localhost:redis").is_err());
        assert!(redis.commands("PING").is_empty());
    }

    #[test(tokio::test)]
    async fn store_gone() {
        let redis = FakeRedis::start();
        let mut app = make_app(&conf(&redis, "redis_max_retries: 1")).unwrap();
        redis.refuse_connections();

        let session = make_session("GET", "/").await;
        let result = app.handle_request(session).await;
        assert!(result.err().is_none());
        assert_eq!(result.body_str(), "hi");
        assert!(redis.commands("LPUSH").is_empty());
    }
}
