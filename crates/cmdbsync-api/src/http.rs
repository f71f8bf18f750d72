//! HTTP implementations of [`CmdbApi`] and [`TenantDirectory`].
//!
//! Every call is a JSON POST through the API gateway. Responses use the
//! `{result, code, message, data}` envelope. All clients built by one
//! [`HttpClientFactory`] share one rate limiter, so the configured QPS is
//! a process-wide budget rather than a per-tenant one.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cmdbsync_core::config::CmdbConfig;
use cmdbsync_core::{ResourceKind, TenantId};
use governor::{Quota, RateLimiter, clock::DefaultClock};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::client::{CmdbApi, TenantDirectory};
use crate::error::{ApiError, ApiResult};
use crate::registry::CmdbClientFactory;
use crate::types::{
    BizHostTopo, CloudArea, DynamicGroupRecord, HOST_FIELDS, InternalModuleSet, ObjectAttribute,
    Page, Paged, Record, ServiceInstanceDetail, Space, Tenant, TopoInstance, WatchResponse,
};

pub type DirectRateLimiter =
    RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

const AUTH_HEADER: &str = "X-Bkapi-Authorization";
const TENANT_HEADER: &str = "X-Bk-Tenant-Id";

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

/// Build the shared limiter for a QPS and burst pair.
pub fn rate_limiter(qps: f64, burst: u32) -> ApiResult<Arc<DirectRateLimiter>> {
    if !qps.is_finite() || qps <= 0.0 {
        return Err(ApiError::Config(format!("rate_limit_qps must be positive, got {qps}")));
    }
    let period = Duration::try_from_secs_f64(1.0 / qps)
        .map_err(|e| ApiError::Config(format!("rate_limit_qps {qps}: {e}")))?;
    let quota = Quota::with_period(period)
        .ok_or_else(|| ApiError::Config(format!("rate_limit_qps {qps} is too high")))?
        .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));
    Ok(Arc::new(RateLimiter::direct(quota)))
}

/// Shared plumbing: reqwest client, auth headers, limiter.
#[derive(Clone)]
struct Transport {
    client: Client,
    endpoint: String,
    auth: String,
    tenant: TenantId,
    limiter: Arc<DirectRateLimiter>,
    limit_timeout: Duration,
}

impl Transport {
    fn new(
        client: Client,
        endpoint: &str,
        config: &CmdbConfig,
        tenant: TenantId,
        limiter: Arc<DirectRateLimiter>,
    ) -> Self {
        let auth = json!({
            "bk_app_code": config.app_code,
            "bk_app_secret": config.app_secret,
            "bk_username": config.username,
        })
        .to_string();
        let mut endpoint = endpoint.to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        Self {
            client,
            endpoint,
            auth,
            tenant,
            limiter,
            limit_timeout: Duration::from_secs(config.rate_limit_timeout_secs),
        }
    }

    async fn throttle(&self, path: &str) -> ApiResult<()> {
        tokio::time::timeout(self.limit_timeout, self.limiter.until_ready())
            .await
            .map_err(|_| {
                ApiError::RateLimited(format!(
                    "{path}: no permit within {}s",
                    self.limit_timeout.as_secs()
                ))
            })
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> ApiResult<T> {
        self.throttle(path).await?;

        let url = format!("{}{path}", self.endpoint);
        let response = self
            .client
            .post(&url)
            .header(AUTH_HEADER, &self.auth)
            .header(TENANT_HEADER, self.tenant.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Http(format!("{path}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Http(format!("{path}: {e}")))?;
        let envelope: Envelope<T> = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::Decode(format!("{path}: {e}")))?;
        if !envelope.result {
            return Err(ApiError::Remote {
                code: envelope.code,
                message: envelope.message,
            });
        }
        debug!(path, tenant = %self.tenant, "cmdb call ok");
        envelope
            .data
            .ok_or_else(|| ApiError::Decode(format!("{path}: response has no data")))
    }
}

// ── CMDB ────────────────────────────────────────────────────────

pub struct HttpCmdbClient {
    transport: Transport,
}

impl fmt::Debug for HttpCmdbClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCmdbClient")
            .field("endpoint", &self.transport.endpoint)
            .field("tenant", &self.transport.tenant)
            .finish()
    }
}

impl HttpCmdbClient {
    pub fn new(config: &CmdbConfig, tenant: TenantId) -> ApiResult<Self> {
        let client = build_client(config)?;
        let limiter = rate_limiter(config.rate_limit_qps, config.rate_limit_burst)?;
        Ok(Self::with_parts(client, config, tenant, limiter))
    }

    fn with_parts(
        client: Client,
        config: &CmdbConfig,
        tenant: TenantId,
        limiter: Arc<DirectRateLimiter>,
    ) -> Self {
        Self {
            transport: Transport::new(client, &config.endpoint, config, tenant, limiter),
        }
    }
}

fn build_client(config: &CmdbConfig) -> ApiResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| ApiError::Config(format!("http client: {e}")))
}

fn page_body(page: Page) -> Value {
    json!({ "start": page.start, "limit": page.limit })
}

#[async_trait]
impl CmdbApi for HttpCmdbClient {
    async fn search_business(&self, page: Page) -> ApiResult<Paged<Record>> {
        self.transport
            .post("search_business/", json!({ "page": page_body(page) }))
            .await
    }

    async fn search_object_attribute(&self, obj_id: &str) -> ApiResult<Vec<ObjectAttribute>> {
        self.transport
            .post("search_object_attribute/", json!({ "bk_obj_id": obj_id }))
            .await
    }

    async fn list_biz_hosts_topo(&self, biz_id: i64, page: Page) -> ApiResult<Paged<BizHostTopo>> {
        self.transport
            .post(
                "list_biz_hosts_topo/",
                json!({ "bk_biz_id": biz_id, "page": page_body(page), "fields": HOST_FIELDS }),
            )
            .await
    }

    async fn search_cloud_area(&self, page: Page) -> ApiResult<Paged<CloudArea>> {
        self.transport
            .post("search_cloud_area/", json!({ "page": page_body(page) }))
            .await
    }

    async fn search_biz_inst_topo(&self, biz_id: i64) -> ApiResult<Vec<TopoInstance>> {
        self.transport
            .post("search_biz_inst_topo/", json!({ "bk_biz_id": biz_id }))
            .await
    }

    async fn get_biz_internal_module(&self, biz_id: i64) -> ApiResult<InternalModuleSet> {
        self.transport
            .post("get_biz_internal_module/", json!({ "bk_biz_id": biz_id }))
            .await
    }

    async fn search_module(&self, biz_id: i64, page: Page) -> ApiResult<Paged<Record>> {
        self.transport
            .post(
                "search_module/",
                json!({ "bk_biz_id": biz_id, "page": page_body(page), "condition": {} }),
            )
            .await
    }

    async fn search_set(&self, biz_id: i64, page: Page) -> ApiResult<Paged<Record>> {
        self.transport
            .post(
                "search_set/",
                json!({ "bk_biz_id": biz_id, "page": page_body(page), "condition": {} }),
            )
            .await
    }

    async fn list_service_instance_detail(
        &self,
        biz_id: i64,
        page: Page,
    ) -> ApiResult<Paged<ServiceInstanceDetail>> {
        self.transport
            .post(
                "list_service_instance_detail/",
                json!({ "bk_biz_id": biz_id, "page": page_body(page) }),
            )
            .await
    }

    async fn search_dynamic_group(
        &self,
        biz_id: i64,
        page: Page,
    ) -> ApiResult<Paged<DynamicGroupRecord>> {
        self.transport
            .post(
                "search_dynamic_group/",
                json!({ "bk_biz_id": biz_id, "page": page_body(page) }),
            )
            .await
    }

    async fn execute_dynamic_group(
        &self,
        biz_id: i64,
        group_id: &str,
        fields: &[&str],
        page: Page,
    ) -> ApiResult<Paged<Record>> {
        self.transport
            .post(
                "execute_dynamic_group/",
                json!({
                    "bk_biz_id": biz_id,
                    "id": group_id,
                    "fields": fields,
                    "page": page_body(page),
                }),
            )
            .await
    }

    async fn resource_watch(
        &self,
        kind: ResourceKind,
        cursor: Option<&str>,
        fields: &[&str],
    ) -> ApiResult<WatchResponse> {
        let mut body = json!({
            "bk_fields": fields,
            "bk_resource": kind.as_str(),
            "bk_supplier_account": "0",
        });
        if let (Some(cursor), Some(map)) = (cursor, body.as_object_mut()) {
            map.insert("bk_cursor".to_string(), Value::from(cursor));
        }
        self.transport.post("resource_watch/", body).await
    }
}

// ── Tenant directory ────────────────────────────────────────────

/// Tenant and space listing from the metadata service.
pub struct HttpDirectory {
    transport: Transport,
}

impl HttpDirectory {
    pub fn new(endpoint: &str, config: &CmdbConfig) -> ApiResult<Self> {
        let client = build_client(config)?;
        let limiter = rate_limiter(config.rate_limit_qps, config.rate_limit_burst)?;
        Ok(Self {
            transport: Transport::new(
                client,
                endpoint,
                config,
                TenantId::default_tenant(),
                limiter,
            ),
        })
    }
}

#[async_trait]
impl TenantDirectory for HttpDirectory {
    async fn list_tenants(&self) -> ApiResult<Vec<TenantId>> {
        let tenants: Vec<Tenant> = self.transport.post("list_tenant/", json!({})).await?;
        Ok(tenants.into_iter().map(|t| TenantId::new(t.id)).collect())
    }

    async fn list_spaces(&self) -> ApiResult<Vec<Space>> {
        self.transport
            .post("list_spaces/", json!({ "exclude_platform_space": true }))
            .await
    }
}

// ── Factory ─────────────────────────────────────────────────────

/// Builds one [`HttpCmdbClient`] per tenant over a shared connection pool
/// and rate limiter.
pub struct HttpClientFactory {
    config: CmdbConfig,
    client: Client,
    limiter: Arc<DirectRateLimiter>,
}

impl HttpClientFactory {
    pub fn new(config: CmdbConfig) -> ApiResult<Self> {
        let client = build_client(&config)?;
        let limiter = rate_limiter(config.rate_limit_qps, config.rate_limit_burst)?;
        Ok(Self {
            config,
            client,
            limiter,
        })
    }
}

impl CmdbClientFactory for HttpClientFactory {
    fn create(&self, tenant: &TenantId) -> ApiResult<Arc<dyn CmdbApi>> {
        Ok(Arc::new(HttpCmdbClient::with_parts(
            self.client.clone(),
            &self.config,
            tenant.clone(),
            self.limiter.clone(),
        )))
    }
}
