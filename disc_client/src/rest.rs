//! REST transport to the chat service.
//!
//! One shared HTTP client serves three kinds of traffic: rate-limited API
//! calls (message listing, attachment creation), the direct storage `PUT`
//! used by the large-chunk upload protocol, and CDN range reads. API calls
//! rotate through the configured tokens; attachment uploads also rotate
//! through the configured channels.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, RANGE};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::limiter::Limiter;
use crate::signed_url;
use crate::types::{Message, Node};

pub const DISCORD_API_URL: &str = "https://discord.com/api/v10";
pub const USER_AGENT: &str = "PostmanRuntime/7.35.0";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Cursor direction for message listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Before,
    After,
}

impl Direction {
    fn as_query(self) -> &'static str {
        match self {
            Direction::Before => "before",
            Direction::After => "after",
        }
    }
}

#[derive(Debug)]
struct Rotation {
    token: usize,
    channel: usize,
}

#[derive(Debug)]
pub struct Rest {
    client: Client,
    limiter: Limiter,
    base_url: String,
    tokens: Vec<String>,
    channels: Vec<String>,
    rotation: StdMutex<Rotation>,
    chunk_size: usize,
    nitro: bool,
}

impl Rest {
    /// `base_url` is [`DISCORD_API_URL`] in production; tests point it at a
    /// mock server.
    pub fn new(
        base_url: &str,
        tokens: Vec<String>,
        channels: Vec<String>,
        chunk_size: usize,
        nitro: bool,
    ) -> Result<Self> {
        if tokens.is_empty() || channels.is_empty() {
            return Err(ClientError::InvalidConfig(format!(
                "not enough tokens or channels: tokens {} channels {}",
                tokens.len(),
                channels.len()
            )));
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            limiter: Limiter::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            channels,
            rotation: StdMutex::new(Rotation { token: 0, channel: 0 }),
            chunk_size,
            nitro,
        })
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn nitro(&self) -> bool {
        self.nitro
    }

    fn next_token(&self) -> String {
        let mut rotation = self.rotation.lock().unwrap();
        let token = self.tokens[rotation.token].clone();
        rotation.token = (rotation.token + 1) % self.tokens.len();
        token
    }

    fn next_channel(&self) -> String {
        let mut rotation = self.rotation.lock().unwrap();
        let channel = self.channels[rotation.channel].clone();
        rotation.channel = (rotation.channel + 1) % self.channels.len();
        channel
    }

    /// Lists up to 100 messages of a channel, optionally anchored before or
    /// after a message id. Retried through rate limits and server errors.
    pub async fn messages(
        &self,
        channel_id: &str,
        cursor: Option<(Direction, i64)>,
    ) -> Result<Vec<Message>> {
        let token = self.next_token();
        let bucket = format!("{token}/{channel_id}/messages");
        let url = match cursor {
            Some((direction, message_id)) => format!(
                "{}/channels/{}/messages?limit=100&{}={}",
                self.base_url,
                channel_id,
                direction.as_query(),
                message_id
            ),
            None => format!("{}/channels/{}/messages?limit=100", self.base_url, channel_id),
        };

        let resp = self
            .send_api("list messages", &token, &bucket, || self.client.get(&url))
            .await?;
        let resp = expect_status(resp, StatusCode::OK, "list messages")?;
        resp.json()
            .await
            .map_err(|e| ClientError::Decode(format!("list messages: {e}")))
    }

    /// Uploads one chunk as a message attachment on the next channel in
    /// rotation and returns its node.
    pub async fn create_attachment(&self, payload: Body) -> Result<Node> {
        if self.nitro {
            return self.create_attachment_large(payload).await;
        }

        let token = self.next_token();
        let channel_id = self.next_channel();
        let bucket = format!("{token}/{channel_id}/messages");
        let url = format!("{}/channels/{}/messages", self.base_url, channel_id);

        let filename = Uuid::new_v4().to_string();
        let part = Part::stream(payload)
            .file_name(filename.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| ClientError::Decode(format!("create attachment: build part: {e}")))?;
        let form = Form::new().part(filename, part);

        // Not retried: a replay would create a duplicate message.
        let resp = self
            .send_api_once(&token, &bucket, self.client.post(&url).multipart(form))
            .await?;
        let resp = expect_status(resp, StatusCode::OK, "create attachment")?;
        node_from_message(resp, "create attachment").await
    }

    /// Three-step upload used for chunks above the direct-multipart body
    /// ceiling: reserve an upload slot, `PUT` the payload straight to
    /// storage, then commit a message referencing it.
    async fn create_attachment_large(&self, payload: Body) -> Result<Node> {
        let token = self.next_token();
        let channel_id = self.next_channel();
        let bucket = format!("{token}/{channel_id}/messages");
        let filename = Uuid::new_v4().to_string();

        let url = format!("{}/channels/{}/attachments", self.base_url, channel_id);
        let reserve = json!({"files": [{"filename": filename, "file_size": self.chunk_size}]});
        let resp = self
            .send_api("reserve upload slot", &token, &bucket, || {
                self.client.post(&url).json(&reserve)
            })
            .await?;
        let resp = expect_status(resp, StatusCode::OK, "reserve upload slot")?;
        let slots: UploadSlots = resp
            .json()
            .await
            .map_err(|e| ClientError::Decode(format!("reserve upload slot: {e}")))?;
        let slot = slots
            .attachments
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Decode("upload slot response has no attachments".to_string()))?;

        // The payload goes straight to the storage backend: no auth header,
        // no rate limiting, and no retry (a replayed PUT could pair a stale
        // upload with the commit below).
        let resp = self.client.put(&slot.upload_url).body(payload).send().await?;
        expect_status(resp, StatusCode::OK, "upload chunk payload")?;

        let url = format!("{}/channels/{}/messages", self.base_url, channel_id);
        let commit = json!({
            "attachments": [{
                "id": "0",
                "filename": filename,
                "uploaded_filename": slot.upload_filename,
            }]
        });
        let resp = self
            .send_api("commit attachment", &token, &bucket, || {
                self.client.post(&url).json(&commit)
            })
            .await?;
        let resp = expect_status(resp, StatusCode::OK, "commit attachment")?;
        node_from_message(resp, "commit attachment").await
    }

    /// Fetches `bytes={start}-{end}` of a node from the CDN. Re-signs the
    /// canonical URL, retries once on a server error.
    pub async fn read_attachment(&self, node: &Node, start: u64, end: u64) -> Result<Response> {
        let url = signed_url::encode(&node.url, node.expiry, node.issued, &node.signature)?;
        let mut retried = false;
        loop {
            let resp = self
                .client
                .get(&url)
                .header(RANGE, format!("bytes={start}-{end}"))
                .send()
                .await?;
            if resp.status().is_server_error() && !retried {
                debug!(status = %resp.status(), "retrying range read after server error");
                retried = true;
                continue;
            }
            return expect_status(resp, StatusCode::PARTIAL_CONTENT, "read attachment");
        }
    }

    /// Sends one API request under the rate limiter, looping while the
    /// response is a rate limit or server error. The token and bucket stay
    /// fixed across attempts.
    async fn send_api<F>(
        &self,
        context: &'static str,
        token: &str,
        bucket: &str,
        build: F,
    ) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        loop {
            let resp = self.send_api_once(token, bucket, build()).await?;
            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                debug!(context, %status, "retrying request");
                continue;
            }
            return Ok(resp);
        }
    }

    async fn send_api_once(
        &self,
        token: &str,
        bucket: &str,
        request: RequestBuilder,
    ) -> Result<Response> {
        let permit = self.limiter.acquire(bucket).await;
        match request.header(AUTHORIZATION, token).send().await {
            Ok(resp) => {
                self.limiter.release(permit, Some(resp.headers()));
                Ok(resp)
            }
            Err(err) => {
                self.limiter.release(permit, None);
                Err(err.into())
            }
        }
    }
}

#[derive(Deserialize)]
struct UploadSlots {
    attachments: Vec<UploadSlot>,
}

#[derive(Deserialize)]
struct UploadSlot {
    upload_url: String,
    upload_filename: String,
}

async fn node_from_message(resp: Response, context: &'static str) -> Result<Node> {
    let message: Message = resp
        .json()
        .await
        .map_err(|e| ClientError::Decode(format!("{context}: {e}")))?;
    let message_id = message.parsed_id()?;
    Node::from_attachment(message.attachment()?, message_id)
}

fn expect_status(resp: Response, expected: StatusCode, context: &'static str) -> Result<Response> {
    let got = resp.status();
    if got != expected {
        return Err(ClientError::UnexpectedStatus {
            context,
            expected,
            got,
        });
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn signed_url_for(server: &MockServer, channel: &str, name: &str) -> String {
        format!(
            "{}/attachments/{}/900/{}?ex=65a0b1c2&is=659f603d&hm=deadbeef",
            server.uri(),
            channel,
            name
        )
    }

    fn message_json(server: &MockServer, id: &str, channel: &str, size: u32) -> serde_json::Value {
        json!({
            "id": id,
            "attachments": [{"url": signed_url_for(server, channel, "f.bin"), "size": size}],
        })
    }

    fn rest(server: &MockServer, tokens: &[&str], channels: &[&str]) -> Rest {
        Rest::new(
            &server.uri(),
            tokens.iter().map(|t| t.to_string()).collect(),
            channels.iter().map(|c| c.to_string()).collect(),
            1024,
            false,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn tokens_rotate_round_robin() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/7/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(4)
            .mount(&server)
            .await;

        let rest = rest(&server, &["t0", "t1", "t2"], &["7"]);
        for _ in 0..4 {
            rest.messages("7", None).await.unwrap();
        }

        let seen: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.headers.get(AUTHORIZATION).unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(seen, vec!["t0", "t1", "t2", "t0"]);
    }

    #[tokio::test]
    async fn listing_passes_cursor_and_parses_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/7/messages"))
            .and(query_param("limit", "100"))
            .and(query_param("after", "41"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([message_json(&server, "42", "7", 10)])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let rest = rest(&server, &["t0"], &["7"]);
        let messages = rest.messages("7", Some((Direction::After, 41))).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].parsed_id().unwrap(), 42);
        assert_eq!(messages[0].attachments[0].size, 10);
    }

    #[tokio::test]
    async fn listing_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/7/messages"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channels/7/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let rest = rest(&server, &["t0"], &["7"]);
        let messages = rest.messages("7", None).await.unwrap();
        assert!(messages.is_empty());
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn upload_parses_node_from_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/7/messages"))
            .and(header_exists("content-type"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(message_json(&server, "555", "7", 5)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let rest = rest(&server, &["t0"], &["7"]);
        let node = rest.create_attachment(Body::from("hello")).await.unwrap();

        assert_eq!(node.message_id, 555);
        assert_eq!(node.size, 5);
        assert_eq!(node.url, format!("{}/attachments/7/900/f.bin", server.uri()));
        assert_eq!(node.expiry, 0x65a0b1c2);
        assert_eq!(node.issued, 0x659f603d);
        assert_eq!(node.signature, "deadbeef");

        let requests = server.received_requests().await.unwrap();
        let content_type = requests[0].headers.get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.starts_with("multipart/form-data"));
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("application/octet-stream"));
        assert!(body.contains("hello"));
    }

    #[tokio::test]
    async fn upload_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/7/messages"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let rest = rest(&server, &["t0"], &["7"]);
        let err = rest.create_attachment(Body::from("hello")).await.unwrap_err();
        match err {
            ClientError::UnexpectedStatus { got, .. } => {
                assert_eq!(got, StatusCode::INTERNAL_SERVER_ERROR)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn upload_rejects_message_without_attachments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/7/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "9", "attachments": []})))
            .mount(&server)
            .await;

        let rest = rest(&server, &["t0"], &["7"]);
        let err = rest.create_attachment(Body::from("hello")).await.unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[tokio::test]
    async fn large_upload_runs_all_three_steps() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/7/attachments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "attachments": [{
                    "upload_url": format!("{}/upload-bucket/abc", server.uri()),
                    "upload_filename": "tmp/abc",
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload-bucket/abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/7/messages"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(message_json(&server, "777", "7", 11)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let rest = Rest::new(&server.uri(), vec!["t0".into()], vec!["7".into()], 1024, true).unwrap();
        let node = rest.create_attachment(Body::from("hello world")).await.unwrap();
        assert_eq!(node.message_id, 777);
        assert_eq!(node.size, 11);

        let requests = server.received_requests().await.unwrap();
        let put = requests.iter().find(|r| r.method.as_str() == "PUT").unwrap();
        assert_eq!(put.body, b"hello world");
        assert!(put.headers.get(AUTHORIZATION).is_none());
        let reserve = requests.iter().find(|r| r.url.path().ends_with("/attachments")).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&reserve.body).unwrap();
        assert_eq!(body["files"][0]["file_size"], 1024);
    }

    #[tokio::test]
    async fn range_read_sends_signed_url_and_range_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attachments/7/900/f.bin"))
            .and(query_param("ex", "65a0b1c2"))
            .and(query_param("is", "659f603d"))
            .and(query_param("hm", "deadbeef"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(&b"cdef"[..]))
            .expect(1)
            .mount(&server)
            .await;

        let rest = rest(&server, &["t0"], &["7"]);
        let node = Node {
            message_id: 1,
            url: format!("{}/attachments/7/900/f.bin", server.uri()),
            size: 10,
            expiry: 0x65a0b1c2,
            issued: 0x659f603d,
            signature: "deadbeef".to_string(),
            start: 0,
            end: 9,
        };
        let resp = rest.read_attachment(&node, 2, 5).await.unwrap();
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"cdef");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests[0].headers.get(RANGE).unwrap(), "bytes=2-5");
        assert!(requests[0].headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn range_read_retries_once_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attachments/7/900/f.bin"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let rest = rest(&server, &["t0"], &["7"]);
        let node = Node {
            message_id: 1,
            url: format!("{}/attachments/7/900/f.bin", server.uri()),
            size: 10,
            expiry: 1,
            issued: 0,
            signature: "aa".to_string(),
            start: 0,
            end: 9,
        };
        let err = rest.read_attachment(&node, 0, 9).await.unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedStatus { .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejects_empty_token_or_channel_lists() {
        assert!(matches!(
            Rest::new(DISCORD_API_URL, vec![], vec!["7".into()], 1024, false).unwrap_err(),
            ClientError::InvalidConfig(_)
        ));
        assert!(matches!(
            Rest::new(DISCORD_API_URL, vec!["t".into()], vec![], 1024, false).unwrap_err(),
            ClientError::InvalidConfig(_)
        ));
    }
}
