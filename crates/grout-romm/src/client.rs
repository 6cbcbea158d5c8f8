//! HTTP implementation of [`RommApi`]

use crate::classify::classify_error;
use crate::models::parse_datetime;
use crate::{
    Collection, CollectionKind, Device, DeviceRegistration, Firmware, Heartbeat, Platform,
    PlatformBinding, Result, Rom, RomHash, RomPage, RomQuery, RommApi, RommError, Save, SaveQuery,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grout_config::{Config, Host};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use std::path::Path;
use std::time::Duration;

/// Attempts for idempotent GETs that fail transiently
const MAX_ATTEMPTS: u32 = 3;

/// HTTP basic-auth credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }
}

/// RomM API client
pub struct RommClient {
    base_url: String,
    /// Same server under the other scheme, tried after a `405`
    alternate_base_url: Option<String>,
    scheme: String,
    auth: BasicAuth,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct RawRomPage {
    #[serde(default)]
    items: Vec<Box<RawValue>>,
    #[serde(default)]
    total: i64,
    #[serde(default)]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ConflictBody {
    save_id: i64,
    #[serde(alias = "server_updated_at")]
    updated_at: Option<String>,
    #[serde(alias = "message")]
    detail: Option<String>,
}

impl RommClient {
    /// Create a client for a host with the given per-call timeout
    pub fn new(host: &Host, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(host.insecure_skip_verify)
            .user_agent(format!("Grout/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RommError::Request(e.to_string()))?;

        let base_url = host.base_url();
        Ok(Self {
            alternate_base_url: alternate_url(&base_url),
            base_url,
            scheme: host.scheme().to_string(),
            auth: BasicAuth {
                username: host.username.clone(),
                password: host.password.clone(),
            },
            client,
        })
    }

    /// Create a client for the configured primary host
    pub fn from_config(config: &Config) -> Result<Self> {
        let host = config
            .primary_host()
            .ok_or_else(|| RommError::InvalidHostname("no host configured".into()))?;
        Self::new(host, config.api_timeout)
    }

    fn url(&self, path: &str) -> String {
        resolve_url(&self.base_url, path)
    }

    /// URL of the binary download for a set of ROMs
    pub fn rom_download_url(&self, rom_ids: &[i64]) -> String {
        let ids = rom_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}?rom_ids={}", self.url("/api/roms/download"), ids)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.auth.apply(self.client.request(method, self.url(path)))
    }

    /// Send a request and map failures onto the taxonomy
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_error(&self.scheme, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::CONFLICT {
            let body: ConflictBody = response.json().await.unwrap_or_default();
            return Err(RommError::Conflict {
                save_id: body.save_id,
                server_updated_at: body.updated_at.as_deref().and_then(parse_datetime),
                message: body.detail.unwrap_or_default(),
            });
        }

        Err(RommError::from_status(status.as_u16()))
    }

    /// GET with retry on transient failures
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response> {
        let mut last_error = RommError::Request("no attempt made".into());

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tracing::warn!(path, attempt = attempt + 1, "Retrying request");
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt - 1))).await;
            }

            match self.send(self.request(Method::GET, path).query(query)).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => last_error = e,
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let response = self.get(path, query).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_error(&self.scheme, &e))?;
        serde_json::from_slice(&bytes).map_err(|e| RommError::Decode(e.to_string()))
    }

    async fn get_raw_list(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<Box<RawValue>>> {
        self.get_json(path, query).await
    }

    #[cfg(test)]
    pub(crate) fn with_alternate_base_url(mut self, url: impl Into<String>) -> Self {
        self.alternate_base_url = Some(url.into());
        self
    }

    /// Turn a `405` into `WrongProtocol` when the other scheme answers
    async fn check_protocol(&self, method: Method, path: &str, err: RommError) -> RommError {
        if err != RommError::Http(405) {
            return err;
        }
        let alternate = self.check_alternate(method, path).await;
        protocol_mismatch(&self.scheme, alternate).unwrap_or(err)
    }

    /// Answer the alternate scheme gives for the same request, if reachable
    async fn check_alternate(&self, method: Method, path: &str) -> Option<u16> {
        let alternate = resolve_url(self.alternate_base_url.as_deref()?, path);
        tracing::debug!(url = %alternate, "Probing alternate scheme");
        let response = self
            .auth
            .apply(self.client.request(method, alternate))
            .send()
            .await
            .ok()?;
        Some(response.status().as_u16())
    }
}

#[async_trait]
impl RommApi for RommClient {
    async fn heartbeat(&self) -> Result<Heartbeat> {
        let response = match self.get("/api/heartbeat", &[]).await {
            Ok(response) => response,
            Err(e) => return Err(self.check_protocol(Method::GET, "/api/heartbeat", e).await),
        };

        let answered = response.url().scheme().to_string();
        if answered != self.scheme {
            return Err(RommError::WrongProtocol {
                requested: self.scheme.clone(),
                correct: answered,
            });
        }

        response
            .json()
            .await
            .map_err(|e| RommError::Decode(e.to_string()))
    }

    async fn login(&self) -> Result<()> {
        match self.send(self.request(Method::POST, "/api/login")).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.check_protocol(Method::POST, "/api/login", e).await),
        }
    }

    async fn platform_binding(&self) -> Result<PlatformBinding> {
        self.get_json("/api/config", &[]).await
    }

    async fn platforms(&self, updated_after: Option<DateTime<Utc>>) -> Result<Vec<Platform>> {
        let query: Vec<(&str, String)> = updated_after
            .map(|t| vec![("updated_after", t.to_rfc3339())])
            .unwrap_or_default();

        self.get_raw_list("/api/platforms", &query)
            .await?
            .iter()
            .map(|raw| Platform::from_raw(raw.get()).map_err(|e| RommError::Decode(e.to_string())))
            .collect()
    }

    async fn roms(&self, query: &RomQuery) -> Result<RomPage> {
        let page: RawRomPage = self.get_json("/api/roms", &query.to_pairs()).await?;
        let items = page
            .items
            .iter()
            .map(|raw| Rom::from_raw(raw.get()).map_err(|e| RommError::Decode(e.to_string())))
            .collect::<Result<Vec<_>>>()?;

        Ok(RomPage {
            items,
            total: page.total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    async fn rom_by_hash(&self, hash: &RomHash) -> Result<Option<Rom>> {
        let (key, value) = hash.to_pair();
        let response = match self
            .get("/api/roms/by-hash", &[(key, value.to_string())])
            .await
        {
            Ok(response) => response,
            Err(RommError::Http(404)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let raw = response
            .text()
            .await
            .map_err(|e| classify_error(&self.scheme, &e))?;
        let rom = Rom::from_raw(&raw).map_err(|e| RommError::Decode(e.to_string()))?;

        Ok((rom.id != 0).then_some(rom))
    }

    async fn rom(&self, id: i64) -> Result<Rom> {
        let raw = self
            .get(&format!("/api/roms/{}", id), &[])
            .await?
            .text()
            .await
            .map_err(|e| classify_error(&self.scheme, &e))?;
        Rom::from_raw(&raw).map_err(|e| RommError::Decode(e.to_string()))
    }

    async fn collections(
        &self,
        kind: CollectionKind,
        updated_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Collection>> {
        let mut query = Vec::new();
        if kind == CollectionKind::Virtual {
            query.push(("type", "all".to_string()));
        }
        if let Some(t) = updated_after {
            query.push(("updated_after", t.to_rfc3339()));
        }

        self.get_raw_list(kind.endpoint(), &query)
            .await?
            .iter()
            .map(|raw| {
                Collection::from_raw(kind, raw.get()).map_err(|e| RommError::Decode(e.to_string()))
            })
            .collect()
    }

    async fn firmware(&self, platform_id: i64) -> Result<Vec<Firmware>> {
        self.get_json("/api/firmware", &[("platform_id", platform_id.to_string())])
            .await
    }

    async fn saves(&self, query: &SaveQuery) -> Result<Vec<Save>> {
        self.get_json("/api/saves", &query.to_pairs()).await
    }

    async fn download_save(&self, save: &Save) -> Result<Vec<u8>> {
        let path = save
            .download_path
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| format!("/api/saves/{}/content", save.id));

        let bytes = self
            .get(&path, &[])
            .await?
            .bytes()
            .await
            .map_err(|e| classify_error(&self.scheme, &e))?;
        Ok(bytes.to_vec())
    }

    async fn upload_save(&self, rom_id: i64, emulator: &str, file: &Path) -> Result<Save> {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| RommError::Io(format!("not a file: {}", file.display())))?;
        let contents = tokio::fs::read(file).await?;

        let part = reqwest::multipart::Part::bytes(contents).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("saveFile", part);

        let request = self
            .request(Method::POST, "/api/saves")
            .query(&[("rom_id", rom_id.to_string()), ("emulator", emulator.to_string())])
            .multipart(form);

        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| RommError::Decode(e.to_string()))
    }

    async fn register_device(&self, device: &DeviceRegistration) -> Result<Device> {
        self.send(self.request(Method::POST, "/api/devices").json(device))
            .await?
            .json()
            .await
            .map_err(|e| RommError::Decode(e.to_string()))
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth(&self) -> Option<BasicAuth> {
        Some(self.auth.clone())
    }
}

/// Resolve a server-relative path (or pass an absolute URL through)
pub(crate) fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

fn alternate_url(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("http://") {
        Some(format!("https://{}", rest))
    } else {
        url.strip_prefix("https://")
            .map(|rest| format!("http://{}", rest))
    }
}

/// Decide whether a `405` at the requested scheme means the server speaks
/// the other one: it does when the alternate scheme answered with anything
/// but `405` or a server error.
pub(crate) fn protocol_mismatch(requested: &str, alternate_status: Option<u16>) -> Option<RommError> {
    let status = alternate_status?;
    if status == 405 || (500..600).contains(&status) {
        return None;
    }

    let correct = if requested == "https" { "http" } else { "https" };
    Some(RommError::WrongProtocol {
        requested: requested.to_string(),
        correct: correct.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve the same canned response to every connection
    async fn serve(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    let mut read = 0;
                    while let Ok(n) = socket.read(&mut buf[read..]).await {
                        if n == 0 {
                            break;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
                            break;
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{}", addr)
    }

    fn client_for(url: &str) -> RommClient {
        let host = Host {
            root_uri: url.to_string(),
            username: "user".into(),
            password: "pass".into(),
            ..Default::default()
        };
        RommClient::new(&host, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_protocol_mismatch_rules() {
        assert_eq!(
            protocol_mismatch("http", Some(401)),
            Some(RommError::WrongProtocol {
                requested: "http".into(),
                correct: "https".into()
            })
        );
        assert_eq!(protocol_mismatch("http", Some(405)), None);
        assert_eq!(protocol_mismatch("http", Some(502)), None);
        assert_eq!(protocol_mismatch("http", None), None);
        assert!(matches!(
            protocol_mismatch("https", Some(200)),
            Some(RommError::WrongProtocol { correct, .. }) if correct == "http"
        ));
    }

    #[test]
    fn test_resolve_url() {
        assert_eq!(
            resolve_url("http://romm:8080/", "/assets/cover.png"),
            "http://romm:8080/assets/cover.png"
        );
        assert_eq!(
            resolve_url("http://romm:8080", "https://cdn.example/cover.jpg"),
            "https://cdn.example/cover.jpg"
        );
        assert_eq!(alternate_url("http://romm/api/login").unwrap(), "https://romm/api/login");
    }

    #[tokio::test]
    async fn test_heartbeat() {
        let url = serve("200 OK", r#"{"SYSTEM":{"VERSION":"3.7.1"}}"#).await;
        let heartbeat = client_for(&url).heartbeat().await.unwrap();
        assert_eq!(heartbeat.version(), "3.7.1");
    }

    #[tokio::test]
    async fn test_login_detects_wrong_protocol() {
        let http = serve("405 Method Not Allowed", "").await;
        let https = serve("401 Unauthorized", r#"{"detail":"nope"}"#).await;

        let err = client_for(&http)
            .with_alternate_base_url(https)
            .login()
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RommError::WrongProtocol {
                requested: "http".into(),
                correct: "https".into()
            }
        );
    }

    #[tokio::test]
    async fn test_heartbeat_detects_wrong_protocol() {
        let http = serve("405 Method Not Allowed", "").await;
        let https = serve("200 OK", r#"{"SYSTEM":{"VERSION":"3.7.1"}}"#).await;

        let err = client_for(&http)
            .with_alternate_base_url(https)
            .heartbeat()
            .await
            .unwrap_err();

        assert!(
            matches!(&err, RommError::WrongProtocol { requested, correct } if requested == "http" && correct == "https"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_405_on_both_schemes_is_not_a_protocol_error() {
        let http = serve("405 Method Not Allowed", "").await;
        let other = serve("405 Method Not Allowed", "").await;

        let client = client_for(&http).with_alternate_base_url(other);
        assert_eq!(client.login().await, Err(RommError::Http(405)));
        assert_eq!(client.heartbeat().await.unwrap_err(), RommError::Http(405));
    }

    #[tokio::test]
    async fn test_unauthorized_login() {
        let url = serve("401 Unauthorized", r#"{"detail":"nope"}"#).await;
        assert_eq!(client_for(&url).login().await, Err(RommError::Unauthorized));
    }

    #[tokio::test]
    async fn test_roms_page_keeps_raw_items() {
        let url = serve(
            "200 OK",
            r#"{"items":[{"id":10,"platform_id":1,"name":"A","custom":1}],"total":1,"limit":200,"offset":0}"#,
        )
        .await;

        let page = client_for(&url)
            .roms(&RomQuery::for_platform(1).page(0, 200))
            .await
            .unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, 10);
        assert_eq!(page.items[0].raw, r#"{"id":10,"platform_id":1,"name":"A","custom":1}"#);
    }

    #[tokio::test]
    async fn test_rom_by_hash_miss() {
        let url = serve("200 OK", r#"{"id":0}"#).await;
        let found = client_for(&url)
            .rom_by_hash(&RomHash::Crc("DEADBEEF".into()))
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_save_conflict() {
        let url = serve(
            "409 Conflict",
            r#"{"detail":"newer save exists","save_id":7,"updated_at":"2024-06-01T10:00:00Z"}"#,
        )
        .await;

        let err = client_for(&url)
            .register_device(&DeviceRegistration {
                name: "handheld".into(),
                platform: "NEXTUI".into(),
                client: "grout".into(),
                client_version: "0.1.0".into(),
            })
            .await
            .unwrap_err();

        match err {
            RommError::Conflict {
                save_id,
                server_updated_at,
                ..
            } => {
                assert_eq!(save_id, 7);
                assert!(server_updated_at.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client_for(&format!("http://{}", addr)).login().await.unwrap_err();
        assert!(matches!(err, RommError::ConnectionRefused(_)), "{err:?}");
    }
}
