//! Room resolution: configured room, else the public IP, else `default`.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

const IPIFY_URL: &str = "https://api.ipify.org?format=json";
const DBIP_URL: &str = "https://api.db-ip.com/v2/free/self";
pub const FALLBACK_ROOM: &str = "default";

#[derive(Deserialize)]
struct Ipify {
    ip: String,
}

#[derive(Deserialize)]
struct DbIp {
    #[serde(rename = "ipAddress")]
    ip_address: String,
}

pub async fn resolve(configured: Option<&str>) -> String {
    if let Some(room) = configured.map(str::trim).filter(|r| !r.is_empty()) {
        return room.to_string();
    }
    match public_ip().await {
        Some(ip) => ip,
        None => {
            warn!("public IP lookup failed, using room {FALLBACK_ROOM:?}");
            FALLBACK_ROOM.to_string()
        }
    }
}

async fn public_ip() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .ok()?;
    match fetch::<Ipify>(&client, IPIFY_URL).await {
        Ok(r) => return non_empty(r.ip),
        Err(e) => debug!(error = %e, "ipify failed, trying db-ip"),
    }
    match fetch::<DbIp>(&client, DBIP_URL).await {
        Ok(r) => non_empty(r.ip_address),
        Err(e) => {
            debug!(error = %e, "db-ip failed");
            None
        }
    }
}

async fn fetch<T: for<'de> Deserialize<'de>>(
    client: &reqwest::Client,
    url: &str,
) -> reqwest::Result<T> {
    client.get(url).send().await?.error_for_status()?.json::<T>().await
}

fn non_empty(ip: String) -> Option<String> {
    let ip = ip.trim().to_string();
    (!ip.is_empty()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn configured_room_wins() {
        assert_eq!(resolve(Some("  office ")).await, "office");
    }

    #[test]
    fn lookup_responses_parse() {
        let r: Ipify = serde_json::from_str(r#"{"ip":"203.0.113.7"}"#).unwrap();
        assert_eq!(r.ip, "203.0.113.7");
        let r: DbIp =
            serde_json::from_str(r#"{"ipAddress":"203.0.113.8","countryCode":"NL"}"#).unwrap();
        assert_eq!(r.ip_address, "203.0.113.8");
        assert_eq!(non_empty("  ".into()), None);
    }
}
