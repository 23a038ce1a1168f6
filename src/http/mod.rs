//! HTTP layer for the policy control plane.
//!
//! The axum router exposes the webhook receiver, the data update trigger,
//! scope administration, health and metrics. Handlers stay thin and delegate
//! to the webhook, data and scopes modules.

pub mod handler;
pub mod scopes;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, Response};
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::auth::admin::MasterTokenAuthenticator;
    use crate::config::{Config, SecretString};
    use crate::coordination::pubsub::test_support::RecordingPublisher;
    use crate::metrics::MetricsRegistry;
    use crate::scopes::repository::MemoryScopeRepository;
    use crate::AppState;

    pub const ADMIN_TOKEN: &str = "admin-token";
    pub const TRACKED: &str = "https://github.com/acme/policy.git";

    pub struct TestApp {
        pub router: Router,
        pub state: Arc<AppState>,
        pub publisher: Arc<RecordingPublisher>,
    }

    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.policy_source.repo_url = Some(TRACKED.to_string());
        config
    }

    pub fn test_app(config: Config) -> TestApp {
        let publisher = Arc::new(RecordingPublisher::default());
        let state = AppState::new(
            Arc::new(config),
            MetricsRegistry::new(),
            publisher.clone(),
            Arc::new(MemoryScopeRepository::new()),
            Arc::new(MasterTokenAuthenticator::new(Some(SecretString::new(
                ADMIN_TOKEN,
            )))),
        )
        .unwrap();
        let state = Arc::new(state);
        TestApp {
            router: super::handler::create_router(state.clone()),
            state,
            publisher,
        }
    }

    impl TestApp {
        pub async fn send(&self, req: Request<Body>) -> Response<Body> {
            self.router.clone().oneshot(req).await.unwrap()
        }
    }

    pub fn admin(builder: axum::http::request::Builder) -> axum::http::request::Builder {
        builder.header("authorization", format!("Bearer {ADMIN_TOKEN}"))
    }

    pub async fn body_json(resp: Response<Body>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }
}
