use super::{parse_batch, CollectError, FleetReport, FleetSource};
use crate::config::{InterfacesConfig, SaltConfig};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// `cmd.run` over salt-api for every minion matched by the target.
pub struct SaltApi {
    cfg: SaltConfig,
    interfaces: InterfacesConfig,
    command: String,
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    client: &'static str,
    tgt: &'a str,
    fun: &'static str,
    arg: &'a str,
    username: &'a str,
    password: &'a str,
    eauth: &'a str,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(rename = "return")]
    batches: Vec<Value>,
}

impl SaltApi {
    pub fn new(cfg: SaltConfig, interfaces: InterfacesConfig, command: String) -> Self {
        Self {
            cfg,
            interfaces,
            command,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    // One client per cycle; dropping it closes the connections.
    fn session() -> Result<Client, CollectError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(Client::builder()
            .user_agent(concat!("fleetd/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?)
    }
}

#[async_trait]
impl FleetSource for SaltApi {
    async fn retrieve_data(&self) -> Result<FleetReport, CollectError> {
        let client = Self::session()?;
        let body = RunRequest {
            client: "local",
            tgt: &self.cfg.target,
            fun: "cmd.run",
            arg: &self.command,
            username: &self.cfg.username,
            password: &self.cfg.password,
            eauth: &self.cfg.eauth,
        };

        let response = client.post(&self.cfg.url).json(&body).send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CollectError::Auth(status));
        }
        if !status.is_success() {
            return Err(CollectError::Status(status));
        }

        let bytes = response.bytes().await?;
        let batch = first_batch(&bytes)?;
        Ok(parse_batch(&batch, &self.interfaces))
    }
}

/// Only the first batch is read. salt-api splits large fleets into several
/// batches; merging them is not supported, so extra batches are reported.
fn first_batch(body: &[u8]) -> Result<serde_json::Map<String, Value>, CollectError> {
    let parsed: RunResponse =
        serde_json::from_slice(body).map_err(|e| CollectError::Envelope(e.to_string()))?;
    let total = parsed.batches.len();
    let mut batches = parsed.batches.into_iter();
    let first = batches
        .next()
        .ok_or_else(|| CollectError::Envelope("пустой список 'return'".to_string()))?;
    if total > 1 {
        warn!(ignored = total - 1, "salt-api вернул несколько пакетов, используется только первый");
    }
    match first {
        Value::Object(map) => Ok(map),
        other => Err(CollectError::Envelope(format!(
            "первый пакет не является объектом: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::build_command;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    type Seen = Arc<Mutex<Option<Value>>>;

    fn interfaces() -> InterfacesConfig {
        InterfacesConfig {
            wired: ["eth0"].into_iter().map(String::from).collect(),
            wireless: ["wlan0"].into_iter().map(String::from).collect(),
        }
    }

    async fn spawn_salt(status: StatusCode, reply: &'static str) -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let app = Router::new().route(
            "/run",
            post(move |Json(req): Json<Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().await = Some(req);
                    (status, reply)
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/run"), seen)
    }

    fn api(url: String) -> SaltApi {
        let cfg = SaltConfig {
            url,
            username: "collector".to_string(),
            password: "secret".to_string(),
            ..SaltConfig::default()
        };
        SaltApi::new(cfg, interfaces(), build_command(&interfaces()))
    }

    #[tokio::test]
    async fn posts_run_request_and_parses_first_batch() {
        let reply = r#"{"return": [{"host1": "{\"uptime\": \"5 days\", \"eth0\": 100, \"wlan0\": 50}", "host2": "oops", "host3": null}]}"#;
        let (url, seen) = spawn_salt(StatusCode::OK, reply).await;
        let salt = api(url);

        let report = salt.retrieve_data().await.expect("сбор выполнен");
        assert_eq!(report.reported, 3);
        assert_eq!(report.dropped, 2);
        let host1 = &report.records["host1"];
        assert_eq!(host1.uptime, "5 days");
        assert_eq!((host1.wired, host1.wireless), (100, 50));
        assert!(!report.records.contains_key("host2"));

        let req = seen.lock().await.clone().expect("запрос получен");
        assert_eq!(req["client"], "local");
        assert_eq!(req["tgt"], "*");
        assert_eq!(req["fun"], "cmd.run");
        assert_eq!(req["arg"], salt.command());
        assert_eq!(req["username"], "collector");
        assert_eq!(req["password"], "secret");
        assert_eq!(req["eauth"], "pam");
    }

    #[tokio::test]
    async fn extra_batches_are_ignored() {
        let reply = r#"{"return": [{"a": "{\"uptime\": \"1\", \"eth0\": 1, \"wlan0\": 1}"}, {"b": "{\"uptime\": \"2\", \"eth0\": 2, \"wlan0\": 2}"}]}"#;
        let (url, _) = spawn_salt(StatusCode::OK, reply).await;
        let report = api(url).retrieve_data().await.unwrap();
        assert_eq!(report.records.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn non_success_status_fails_whole_call() {
        let (url, _) = spawn_salt(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
        let err = api(url).retrieve_data().await.unwrap_err();
        assert!(matches!(err, CollectError::Status(s) if s == StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn unauthorized_is_reported_as_auth_error() {
        let (url, _) = spawn_salt(StatusCode::UNAUTHORIZED, "").await;
        let err = api(url).retrieve_data().await.unwrap_err();
        assert!(matches!(err, CollectError::Auth(_)));
    }

    #[tokio::test]
    async fn bad_envelopes_fail_whole_call() {
        for reply in ["not json", r#"{"data": []}"#, r#"{"return": []}"#, r#"{"return": ["x"]}"#] {
            let (url, _) = spawn_salt(StatusCode::OK, reply).await;
            let err = api(url).retrieve_data().await.unwrap_err();
            assert!(matches!(err, CollectError::Envelope(_)), "reply {reply}");
        }
    }

    #[tokio::test]
    async fn connection_refused_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = api(format!("http://{addr}/run")).retrieve_data().await.unwrap_err();
        assert!(matches!(err, CollectError::Http(_)));
    }
}
