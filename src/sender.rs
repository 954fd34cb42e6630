// sender.rs - HTTP delivery channels

use crate::*;

pub const HTTP_SEND_ATTEMPTS: u32 = 3;

/// Outcome of one delivery channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Channel disabled or has no endpoint.
    Skipped,
    Sent,
    Failed,
    /// Sent, and the response carried configuration that changed settings.
    /// The session must restart.
    ConfigChanged,
}

/// The two structurally identical HTTP channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpChannel {
    Cloud,
    Http,
}

impl HttpChannel {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Cloud => "WATR",
            Self::Http => "HTTP",
        }
    }

    /// Endpoint URL, or None if the channel is off.
    pub fn endpoint(self, settings: &Settings) -> Option<&str> {
        match self {
            Self::Cloud if settings.cloud_enabled() => Some(&settings.waterius_host),
            Self::Http if settings.http_enabled() => Some(&settings.http_url),
            _ => None,
        }
    }
}

pub fn send_http(
    channel: HttpChannel,
    http: &mut dyn HttpClient,
    clock: &dyn Clock,
    rc: &mut Reconciler<'_>,
    doc: &TelemetryDocument,
) -> Delivery {
    let tag = channel.tag();
    let Some(url) = channel.endpoint(rc.settings).map(str::to_owned) else {
        info!("{tag}: SKIP");
        return Delivery::Skipped;
    };
    let key = rc.settings.waterius_key.clone();
    let email = rc.settings.waterius_email.clone();

    let start = clock.uptime_ms();
    info!("{tag}: Send new data");
    let payload = match doc.to_json() {
        Ok(p) => p,
        Err(e) => {
            error!("{tag}: Cannot serialize telemetry: {e}");
            return Delivery::Failed;
        }
    };

    let mut result = PostResult::default();
    for attempt in 1..=HTTP_SEND_ATTEMPTS {
        info!("{tag}: Attempt #{attempt} from {HTTP_SEND_ATTEMPTS}");
        result = post_json(http, &url, &key, &email, &payload, tag);
        if result.ok {
            break;
        }
    }

    let elapsed = clock.uptime_ms().wrapping_sub(start);
    if !result.ok {
        error!("{tag}: Failed send data. Time {elapsed} ms");
        return Delivery::Failed;
    }
    info!("{tag}: Data sent. Time {elapsed} ms");

    if rc.settings.config_restart_pending {
        info!("{tag}: Skipping config check (restart after config change)");
        return Delivery::Sent;
    }
    match result.body {
        Some(body) if rc.apply_from_response(&body) => {
            info!("{tag}: Config changed! Restarting to send updated data...");
            Delivery::ConfigChanged
        }
        _ => Delivery::Sent,
    }
}


// EOF
