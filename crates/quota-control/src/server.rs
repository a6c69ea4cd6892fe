use std::path::{Path, PathBuf};
use std::sync::Arc;

use pingora::prelude::*;
use pingora::server::RunArgs;
use pingora::server::Server as PingoraServer;
use pingora::server::configuration::Opt;
use pingora::services::background::GenBackgroundService;

use crate::authority::{Authority, SqliteStore, Store};
use crate::cache::{Backend, MemoryBackend, QuotaCache, RedisBackend, SharedCache, UsageCounter};
use crate::client::{QuotaClient, UsageSyncService};
use crate::configuration::ServerConfig;
use crate::metric::Metrics;
use crate::middleware::{
    ClaimsVerifier, LocalRateCounter, Pipeline, RATE_WINDOW, RateLimitCounter, RateLimiter,
    SharedRateCounter,
};
use crate::proxy::QuotaProxy;

pub struct Server {
    server: PingoraServer,
}

fn explain(context: &str, e: impl std::fmt::Display) -> Box<Error> {
    Error::explain(ErrorType::InternalError, format!("{context}: {e}"))
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        base.join(path)
    }
}

impl Server {
    pub fn new(opt: Option<Opt>) -> Result<Self> {
        let server = PingoraServer::new(opt)?;
        Ok(Server { server })
    }

    /// Wire the authority, the quota client and the proxy into the server.
    ///
    /// Returns the authority so callers can provision projects and keys.
    pub fn bootstrap(
        &mut self,
        server_conf: ServerConfig,
        config_base_path: &Path,
        verifier: Option<Arc<dyn ClaimsVerifier>>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Authority>> {
        self.server.bootstrap();

        let quota_conf = server_conf.quota;
        quota_conf
            .validate()
            .map_err(|e| explain("invalid quota config", e))?;
        let key_config = server_conf
            .access_key
            .to_config()
            .map_err(|e| explain("invalid access key config", e))?;

        let backend: Arc<dyn Backend> = if quota_conf.redis.enabled {
            log::info!("Using shared cache at {}", quota_conf.redis.url());
            Arc::new(
                RedisBackend::new(&quota_conf.redis)
                    .map_err(|e| explain("failed to configure redis", e))?,
            )
        } else {
            log::info!("Redis disabled, using in-process cache");
            Arc::new(MemoryBackend::new())
        };

        let db_path = resolve(config_base_path, &server_conf.authority_db);
        let sqlite = SqliteStore::open(&db_path)
            .map_err(|e| explain("failed to open authority db", e))?;
        log::info!("Authority store at {:?}", db_path);

        let cache = Arc::new(QuotaCache::new(
            SharedCache::new(Arc::clone(&backend), quota_conf.redis.cache_ttl),
            quota_conf.lru_size,
            quota_conf.lru_expiration,
        ));
        let counter = Arc::new(UsageCounter::new(
            Arc::clone(&backend),
            quota_conf.redis.key_ttl,
        ));
        let authority = Arc::new(Authority::new(
            Store::sqlite(Arc::new(sqlite)),
            Arc::clone(&cache),
            Arc::clone(&counter),
            key_config,
        ));

        let client = Arc::new(QuotaClient::new(
            quota_conf.clone(),
            server_conf.service,
            cache,
            counter,
            authority.clone(),
        ));

        let mut pipeline = Pipeline::new(Arc::clone(&client)).with_errors(quota_conf.errors.clone());
        if let Some(verifier) = verifier {
            pipeline = pipeline.with_verifier(verifier);
        }
        if quota_conf.rate_limiter.enabled {
            let counter: Arc<dyn RateLimitCounter> = if quota_conf.redis.enabled {
                Arc::new(SharedRateCounter::new(Arc::clone(&backend), RATE_WINDOW))
            } else {
                Arc::new(LocalRateCounter::new(RATE_WINDOW))
            };
            pipeline = pipeline.with_rate_limiter(RateLimiter::new(
                counter,
                quota_conf.rate_limiter.clone(),
                server_conf.service,
            ));
        }

        // Background service flushing usage to the authority
        let sync = UsageSyncService::new(Arc::clone(&client), quota_conf.update_freq);
        let background = GenBackgroundService::new("usage sync".to_string(), Arc::new(sync));
        self.server.add_service(background);

        let mut proxy_service = http_proxy_service(
            &self.server.configuration,
            QuotaProxy::new(Arc::new(pipeline), server_conf.upstream, metrics),
        );
        proxy_service.add_tcp(&server_conf.listen);
        self.server.add_service(proxy_service);

        log::info!(
            "Enforcing {} quota on {}",
            server_conf.service,
            server_conf.listen
        );
        Ok(authority)
    }

    pub fn run_forever(self) {
        self.server.run_forever();
    }

    pub fn run(self, args: RunArgs) {
        self.server.run(args);
    }
}
