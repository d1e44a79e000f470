use anyhow::Result;

use crate::RelayConfig;

pub fn check_relay(cfg: &RelayConfig) -> Result<()> {
    let url = reqwest::Url::parse(&cfg.endpoint)
        .map_err(|e| anyhow::anyhow!("relay.endpoint is not a URL ({}): {}", cfg.endpoint, e))?;
    anyhow::ensure!(matches!(url.scheme(), "http" | "https"), "relay.endpoint must be http(s): {}", cfg.endpoint);
    anyhow::ensure!(cfg.interval_s.is_finite() && cfg.interval_s > 0.0, "relay.interval_s must be a finite number > 0");
    anyhow::ensure!(cfg.timeout_s.is_finite() && cfg.timeout_s > 0.0, "relay.timeout_s must be a finite number > 0");
    anyhow::ensure!(cfg.max_in_flight >= 1, "relay.max_in_flight must be >= 1");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(endpoint: &str) -> RelayConfig {
        RelayConfig {
            endpoint: endpoint.into(),
            interval_s: 2.0,
            timeout_s: 15.0,
            max_in_flight: 1,
            skip_tunnel_interstitial: true,
        }
    }

    #[test]
    fn endpoint_must_be_http() {
        check_relay(&cfg("http://127.0.0.1:8888/upload")).unwrap();
        assert!(check_relay(&cfg("tls://host:443")).is_err());
        assert!(check_relay(&cfg("not a url")).is_err());
        let mut c = cfg("https://example.org/upload");
        c.interval_s = 0.0;
        assert!(check_relay(&c).is_err());
    }

    #[test]
    fn non_finite_durations_are_rejected() {
        for bad in [f64::INFINITY, f64::NAN, -1.0] {
            let mut c = cfg("http://127.0.0.1:8888/upload");
            c.interval_s = bad;
            assert!(check_relay(&c).is_err(), "interval {bad}");
            let mut c = cfg("http://127.0.0.1:8888/upload");
            c.timeout_s = bad;
            assert!(check_relay(&c).is_err(), "timeout {bad}");
            assert!(crate::HttpTransport::new(&c).is_err(), "transport timeout {bad}");
        }
    }
}
