#![allow(dead_code)]
//! Rate limiting middleware layers, configured from `config::RateLimitConfig`.
//!
//! Protects against brute-force auth attempts and general API abuse while
//! staying lenient enough for Docker's aggressive parallel layer uploads.

use crate::config::RateLimitConfig;
use tower_governor::governor::GovernorConfigBuilder;

type Layer = tower_governor::GovernorLayer<
    tower_governor::key_extractor::PeerIpKeyExtractor,
    governor::middleware::StateInformationMiddleware,
    axum::body::Body,
>;

/// Strict limiter for `/keppel/v1/auth` and `/keppel/v1/auth/peering`.
pub fn auth_rate_limiter(cfg: &RateLimitConfig) -> Layer {
    build(cfg.auth_rps, cfg.auth_burst)
}

/// Limiter for blob chunk upload endpoints.
pub fn upload_rate_limiter(cfg: &RateLimitConfig) -> Layer {
    build(cfg.upload_rps, cfg.upload_burst)
}

/// Lenient limiter for everything else.
pub fn general_rate_limiter(cfg: &RateLimitConfig) -> Layer {
    build(cfg.general_rps, cfg.general_burst)
}

fn build(per_second: u32, burst: u32) -> Layer {
    let config = GovernorConfigBuilder::default()
        .per_second(per_second as u64)
        .burst_size(burst)
        .use_headers()
        .finish()
        .expect("static governor config is always valid");

    tower_governor::GovernorLayer::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiters_build_from_config() {
        let cfg = RateLimitConfig::default();
        let _auth = auth_rate_limiter(&cfg);
        let _upload = upload_rate_limiter(&cfg);
        let _general = general_rate_limiter(&cfg);
    }
}
