//! HTTP client for the management backend

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use peakroute_dialer::{join_host_port, tls, Dialer, Network, OpContext};
use rand::RngCore;
use rustls::ClientConfig;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cell::SharedCell;
use crate::error::ApiError;
use crate::types::{
    DiscoverData, Endpoint, Envelope, GeoEntry, GeoListData, ProxySession, RegisterData,
};
use crate::ManagementApi;

pub const API_DOMAIN: &str = "antpeak.com";

const DEVICE_ID_BYTES: usize = 20;
const READ_LIMIT: usize = 128 * 1024;

#[derive(Debug, Clone)]
pub struct ApiEndpoints {
    pub register_device: String,
    pub geo_list: String,
    pub discover: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            register_device: format!("https://{}/api/launch/", API_DOMAIN),
            geo_list: format!("https://{}/api/location/list/", API_DOMAIN),
            discover: format!("https://{}/api/server/", API_DOMAIN),
        }
    }
}

/// Device identity presented to the backend
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub app_version: String,
    pub platform: String,
    pub time_zone: String,
    pub device_name: String,
    pub user_agent: String,
    pub endpoints: ApiEndpoints,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            app_version: "2.6.0".to_string(),
            platform: "Chrome".to_string(),
            time_zone: "+0300".to_string(),
            device_name: "Opera 85".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                (KHTML, like Gecko) Chrome/88.0.4324.192 Safari/537.36 OPR/74.0.3911.232"
                .to_string(),
            endpoints: ApiEndpoints::default(),
        }
    }
}

impl ApiSettings {
    pub fn with_endpoints(mut self, endpoints: ApiEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }
}

/// One parsed RPC URL
#[derive(Debug, Clone)]
struct Target {
    secure: bool,
    host: String,
    dial_addr: String,
    authority: String,
    path: String,
}

impl Target {
    fn parse(raw: &str) -> Result<Self, ApiError> {
        let invalid = |reason: &str| ApiError::InvalidEndpoint {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        let secure = match url.scheme() {
            "https" => true,
            "http" => false,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        let authority = match url.port() {
            Some(port) => join_host_port(&host, port),
            None if host.contains(':') => format!("[{}]", host),
            None => host.clone(),
        };

        Ok(Self {
            secure,
            dial_addr: join_host_port(&host, port),
            host,
            authority,
            path: url[url::Position::BeforePath..].to_string(),
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Session {
    access_token: String,
    proxy: ProxySession,
}

/// Management API client.
///
/// Each RPC opens a fresh connection through the supplied dialer. TLS to the
/// API skips certificate verification and sends no SNI; the proxy endpoint
/// the API hands out is verified separately.
pub struct ApiClient {
    dialer: Arc<dyn Dialer>,
    settings: ApiSettings,
    device_id: String,
    tls: Arc<ClientConfig>,
    register_target: Target,
    geo_list_target: Target,
    discover_target: Target,
    session: SharedCell<Session>,
}

impl ApiClient {
    pub fn new(dialer: Arc<dyn Dialer>, settings: ApiSettings) -> Result<Self, ApiError> {
        let mut id = [0u8; DEVICE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut id);

        Ok(Self {
            register_target: Target::parse(&settings.endpoints.register_device)?,
            geo_list_target: Target::parse(&settings.endpoints.geo_list)?,
            discover_target: Target::parse(&settings.endpoints.discover)?,
            dialer,
            settings,
            device_id: hex::encode(id),
            tls: tls::insecure_client_config(),
            session: SharedCell::default(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.settings
    }

    async fn rpc_call<T: DeserializeOwned>(
        &self,
        ctx: &OpContext,
        target: &Target,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        ctx.run(self.rpc_call_inner(ctx, target, params)).await?
    }

    async fn rpc_call_inner<T: DeserializeOwned>(
        &self,
        ctx: &OpContext,
        target: &Target,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();

        let mut stream = self
            .dialer
            .dial(ctx, Network::Tcp, &target.dial_addr)
            .await?;
        if target.secure {
            stream = Box::new(tls::handshake(ctx, self.tls.clone(), &target.host, stream).await?);
        }

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "API connection closed with error");
            }
        });

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(target.path.as_str())
            .header(HOST, target.authority.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, self.settings.user_agent.as_str());

        let token = self.session.load().access_token.clone();
        if !token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = request.body(Full::new(Bytes::from(body)))?;

        debug!(path = %target.path, "Calling management API");
        let response = sender.send_request(request).await?;
        let status = response.status();

        let raw = Limited::new(response.into_body(), READ_LIMIT)
            .collect()
            .await
            .map_err(|e| ApiError::Body(e.to_string()))?
            .to_bytes();

        let envelope: Envelope = serde_json::from_slice(&raw)?;
        if !envelope.success {
            return Err(ApiError::Api(envelope.first_error()));
        }
        if status != StatusCode::OK {
            return Err(ApiError::HttpStatus(status.as_u16()));
        }

        let data = envelope.data.ok_or(ApiError::MissingData)?;
        Ok(serde_json::from_value(data)?)
    }
}

#[async_trait]
impl ManagementApi for ApiClient {
    async fn register_device(&self, ctx: &OpContext) -> Result<(), ApiError> {
        let params = [
            ("appVersion", self.settings.app_version.as_str()),
            ("platform", self.settings.platform.as_str()),
            ("timeZone", self.settings.time_zone.as_str()),
            ("deviceName", self.settings.device_name.as_str()),
            ("udid", self.device_id.as_str()),
        ];

        let data: RegisterData = self.rpc_call(ctx, &self.register_target, &params).await?;
        if data.access_token.is_empty() {
            warn!("Registration returned an empty access token");
        }

        self.session.update(|current| Session {
            access_token: data.access_token,
            proxy: current.proxy.clone(),
        });
        Ok(())
    }

    async fn geo_list(&self, ctx: &OpContext) -> Result<Vec<GeoEntry>, ApiError> {
        let data: GeoListData = self.rpc_call(ctx, &self.geo_list_target, &[]).await?;
        Ok(data.locations)
    }

    async fn discover(&self, ctx: &OpContext, region: &str) -> Result<Endpoint, ApiError> {
        let params = [("region", region), ("protocol", "https"), ("type", "0")];

        let data: DiscoverData = self
            .rpc_call(ctx, &self.discover_target, &params)
            .await
            .map_err(|e| match e {
                ApiError::Api(message) => ApiError::Api(format!("{} ({})", message, region)),
                other => other,
            })?;

        let (endpoint, credentials) = data.into_parts();
        if endpoint.is_empty() {
            warn!(region, "Discovery returned no addresses, keeping previous session");
            return Ok(endpoint);
        }

        self.session.update(|current| Session {
            access_token: current.access_token.clone(),
            proxy: ProxySession {
                endpoint: endpoint.clone(),
                credentials,
            },
        });

        Ok(endpoint)
    }

    fn proxy_session(&self) -> ProxySession {
        self.session.load().proxy.clone()
    }
}
