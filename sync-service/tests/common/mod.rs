#![allow(dead_code)]

use secrecy::Secret;
use serde_json::json;
use service_core::config::Config as CommonConfig;
use std::sync::Arc;
use std::time::Duration;
use sync_service::config::{
    AuthConfig, ImportConfig, PaymentApiConfig, StoreBackend, StoreConfig, SyncConfig,
    SyncServiceConfig, WorkerConfig,
};
use sync_service::services::payment_api::PaymentApiClient;
use sync_service::services::store::MemoryStore;
use sync_service::startup::{Application, ShutdownHandle};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const SOURCE: &str = "payment_gateway";
pub const RECORDS_PER_PAGE: usize = 3;

/// Serves `pages` pages of three records for every report window. Ids are
/// derived from the window start and page, so repeated fetches return the
/// same records.
struct ReportResponder {
    pages: u32,
}

impl Respond for ReportResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut page = 1_u32;
        let mut start = String::new();
        for (key, value) in request.url.query_pairs() {
            match key.as_ref() {
                "page" => page = value.parse().unwrap_or(1),
                "startDate" => start = value.to_string(),
                _ => {}
            }
        }

        if page > self.pages {
            return ResponseTemplate::new(200).set_body_json(json!({
                "data": [],
                "pagination": {"totalPages": self.pages, "totalItems": 0}
            }));
        }

        let data: Vec<_> = (0..RECORDS_PER_PAGE)
            .map(|i| {
                json!({
                    "id": format!("{}-{}-{}", start, page, i),
                    "amount": "19.99",
                    "currency": "USD",
                    "status": "SUCCESS",
                    "createdAt": start,
                    "customer": {"email": format!("buyer{}@example.com", i)}
                })
            })
            .collect();

        ResponseTemplate::new(200).set_body_json(json!({
            "data": data,
            "pagination": {
                "totalPages": self.pages,
                "totalItems": self.pages as usize * RECORDS_PER_PAGE
            }
        }))
    }
}

pub struct TestOptions {
    pub pages: u32,
    pub workers_enabled: bool,
    pub invocation_budget_secs: u64,
    pub api_keys: Vec<(String, Secret<String>)>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            pages: 2,
            workers_enabled: true,
            invocation_budget_secs: 30,
            api_keys: Vec::new(),
        }
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub store: Arc<MemoryStore>,
    pub payment_api: MockServer,
    pub client: reqwest::Client,
    shutdown: ShutdownHandle,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(TestOptions::default()).await
    }

    pub async fn spawn_with(options: TestOptions) -> Self {
        service_core::observability::init_test_tracing("sync_service=debug");

        let payment_api = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "test-token",
                "expires_in": 3600
            })))
            .mount(&payment_api)
            .await;
        Mock::given(method("GET"))
            .and(path("/reports/transactions"))
            .respond_with(ReportResponder {
                pages: options.pages,
            })
            .mount(&payment_api)
            .await;

        let config = SyncServiceConfig {
            common: CommonConfig {
                port: 0,
                ..Default::default()
            },
            service_name: "sync-service".to_string(),
            log_level: "debug".to_string(),
            store: StoreConfig {
                backend: StoreBackend::Memory,
                database: None,
            },
            payment_api: PaymentApiConfig {
                source: SOURCE.to_string(),
                base_url: payment_api.uri(),
                client_id: "test-client".to_string(),
                client_secret: Secret::new("test-secret".to_string()),
                page_size: RECORDS_PER_PAGE as u32,
                max_window_days: 31,
                end_date_safety_secs: 300,
                request_timeout_secs: 5,
                max_retries: 0,
                initial_backoff_ms: 1,
            },
            sync: SyncConfig {
                stale_threshold_minutes: 15,
                invocation_budget_secs: options.invocation_budget_secs,
                upsert_batch_size: 500,
                default_lookback_days: 30,
                pause_poll_secs: 1,
            },
            workers: WorkerConfig {
                enabled: options.workers_enabled,
                worker_count: 2,
                queue_size: 16,
            },
            import: ImportConfig {
                staging_batch_size: 500,
                merge_page_size: 100,
                merge_retry_max_elapsed_secs: 1,
            },
            auth: AuthConfig {
                api_keys: options.api_keys,
            },
        };

        let store = Arc::new(MemoryStore::new());
        let source = PaymentApiClient::new(config.payment_api.clone())
            .expect("Failed to create payment API client");
        let app = Application::build_with(config, store.clone(), Arc::new(source))
            .await
            .expect("Failed to build test application");

        let port = app.http_port();
        let address = format!("http://127.0.0.1:{}", port);
        let shutdown = app.shutdown_handle();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            store,
            payment_api,
            client,
            shutdown,
        }
    }

    pub async fn post_sync(&self, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/sync/{}", self.address, SOURCE))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get_run(&self, id: &str) -> serde_json::Value {
        self.client
            .get(format!("{}/sync/{}/runs/{}", self.address, SOURCE, id))
            .send()
            .await
            .expect("Failed to execute request")
            .json()
            .await
            .expect("Failed to parse JSON")
    }

    /// Poll a run until its status is `status`.
    pub async fn wait_for_run_status(&self, id: &str, status: &str) -> serde_json::Value {
        for _ in 0..100 {
            let run = self.get_run(id).await;
            if run["status"] == status {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("sync run {} never reached status {}", id, status);
    }

    pub async fn post_csv(&self, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/import/csv", self.address))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get_import(&self, id: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/import/{}", self.address, id))
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Poll an import until its status is `status`.
    pub async fn wait_for_import_status(&self, id: &str, status: &str) -> serde_json::Value {
        for _ in 0..100 {
            let import: serde_json::Value = self
                .get_import(id)
                .await
                .json()
                .await
                .expect("Failed to parse JSON");
            if import["status"] == status {
                return import;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("import {} never reached status {}", id, status);
    }

    pub async fn shutdown(&self) {
        self.shutdown.shutdown().await;
    }
}
