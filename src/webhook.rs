//! Webhook notifications for blocked connections.
//!
//! Dispatch is fire-and-forget: a slow or failing webhook endpoint must never
//! block or fail the check pipeline.

use crate::config::{WebhookConfig, WebhookFormat};
use crate::lookup::{epoch_ms, ReputationResult};
use crate::pipeline::{CheckOutcome, Principal, Verdict};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Sends webhook notifications when a check comes back blocking.
pub struct WebhookNotifier {
    client: Client,
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Dispatch a notification asynchronously. Returns immediately; failures
    /// are logged and swallowed.
    pub fn notify(&self, config: &WebhookConfig, principal: &Principal, outcome: &CheckOutcome) {
        if !config.enabled {
            return;
        }

        if config.url.trim().is_empty() {
            warn!("webhook is enabled but no url is configured");
            return;
        }

        let payload = build_payload(config.format, principal, outcome);
        let client = self.client.clone();
        let url = config.url.clone();
        let token = if config.use_auth && !config.auth_token.trim().is_empty() {
            Some(config.auth_token.clone())
        } else {
            None
        };
        let timeout = Duration::from_secs(config.timeout_secs);
        let principal_name = principal.name.clone();

        tokio::spawn(async move {
            let mut request = client
                .post(&url)
                .timeout(timeout)
                .header("Content-Type", "application/json")
                .header("User-Agent", "proxyward-webhook/1.0")
                .json(&payload);

            if let Some(token) = token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        principal = %principal_name,
                        status = %response.status(),
                        "webhook notification sent"
                    );
                }
                Ok(response) => {
                    warn!(
                        principal = %principal_name,
                        status = %response.status(),
                        "webhook returned non-success status"
                    );
                }
                Err(e) => {
                    warn!(principal = %principal_name, error = %e, "failed to send webhook");
                }
            }
        });
    }
}

fn build_payload(format: WebhookFormat, principal: &Principal, outcome: &CheckOutcome) -> Value {
    match format {
        WebhookFormat::Discord => discord_payload(principal, outcome),
        WebhookFormat::Slack => slack_payload(principal, outcome),
        WebhookFormat::Generic => generic_payload(principal, outcome),
    }
}

fn discord_payload(principal: &Principal, outcome: &CheckOutcome) -> Value {
    let (title, color) = match outcome.verdict {
        Verdict::DeniedCountry => ("Country Blocked", 15_105_570),
        _ => ("VPN/Proxy Detection", 15_158_332),
    };

    let mut fields = vec![
        discord_field("Player", &principal.name),
        discord_field("UUID", &principal.id.to_string()),
        discord_field("IP Address", &principal.addr.to_string()),
    ];

    if let Some(r) = &outcome.reputation {
        fields.push(discord_field(
            "Country",
            &format!("{} ({})", r.country_name, r.country_code),
        ));
        fields.push(discord_field("City", &r.city));
        fields.push(discord_field("ISP", &r.isp));
        fields.push(discord_field("ASN", &r.asn));
        fields.push(discord_field(
            "Proxy Status",
            if r.is_proxy { "Detected" } else { "Not Detected" },
        ));
    }

    json!({
        "embeds": [{
            "title": title,
            "color": color,
            "description": "A connection was blocked by reputation screening.",
            "fields": fields,
            "footer": { "text": "Proxyward" }
        }]
    })
}

fn discord_field(name: &str, value: &str) -> Value {
    json!({
        "name": name,
        "value": if value.is_empty() { "N/A" } else { value },
        "inline": true
    })
}

fn slack_payload(principal: &Principal, outcome: &CheckOutcome) -> Value {
    let mut text = format!(
        "*Connection Blocked*\nPlayer: {}\nIP: {}\n",
        principal.name, principal.addr
    );

    if let Some(r) = &outcome.reputation {
        text.push_str(&format!(
            "Country: {} ({})\nCity: {}\nISP: {}\n",
            r.country_name, r.country_code, r.city, r.isp
        ));
    }

    json!({ "text": text })
}

fn generic_payload(principal: &Principal, outcome: &CheckOutcome) -> Value {
    let detection = outcome.reputation.as_ref().map(|r: &ReputationResult| {
        json!({
            "isProxy": r.is_proxy,
            "countryCode": r.country_code,
            "countryName": r.country_name,
            "city": r.city,
            "isp": r.isp,
            "asn": r.asn,
        })
    });

    json!({
        "event": "connection_blocked",
        "timestamp": epoch_ms(),
        "verdict": format!("{:?}", outcome.verdict),
        "player": {
            "uuid": principal.id.to_string(),
            "name": principal.name,
            "ip": principal.addr.to_string(),
        },
        "detection": detection,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    fn blocked_principal() -> Principal {
        Principal {
            id: Uuid::new_v4(),
            name: "intruder".to_string(),
            addr: Ipv4Addr::new(1, 2, 3, 4),
        }
    }

    fn proxy_outcome() -> CheckOutcome {
        CheckOutcome::of(
            Verdict::DeniedProxy,
            Some(ReputationResult {
                address: "1.2.3.4".to_string(),
                country_code: "US".to_string(),
                country_name: "United States".to_string(),
                city: "Dallas".to_string(),
                isp: "ExampleNet".to_string(),
                asn: "AS12345".to_string(),
                is_proxy: true,
                success: true,
                failure_reason: None,
                observed_at_ms: 0,
            }),
        )
    }

    #[test]
    fn test_discord_payload_shape() {
        let payload = discord_payload(&blocked_principal(), &proxy_outcome());
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "VPN/Proxy Detection");
        assert!(embed["fields"].as_array().unwrap().len() >= 3);
    }

    #[test]
    fn test_discord_payload_country_title() {
        let mut outcome = proxy_outcome();
        outcome.verdict = Verdict::DeniedCountry;
        let payload = discord_payload(&blocked_principal(), &outcome);
        assert_eq!(payload["embeds"][0]["title"], "Country Blocked");
    }

    #[test]
    fn test_slack_payload_contains_player_and_ip() {
        let payload = slack_payload(&blocked_principal(), &proxy_outcome());
        let text = payload["text"].as_str().unwrap();
        assert!(text.contains("intruder"));
        assert!(text.contains("1.2.3.4"));
    }

    #[test]
    fn test_generic_payload_shape() {
        let payload = generic_payload(&blocked_principal(), &proxy_outcome());
        assert_eq!(payload["event"], "connection_blocked");
        assert_eq!(payload["detection"]["countryCode"], "US");
    }

    #[test]
    fn test_generic_payload_without_reputation() {
        let outcome = CheckOutcome::of(Verdict::DeniedProxy, None);
        let payload = generic_payload(&blocked_principal(), &outcome);
        assert!(payload["detection"].is_null());
    }
}
