use std::time::Duration;

/// Best-effort outbound POST to a client-supplied `callback_url` when a
/// payment reaches a terminal state. Failures are logged and never
/// surfaced to the caller or allowed to affect payment state.
pub struct CallbackNotifier {
    client: reqwest::Client,
}

/// Delay before each of the up-to-3 retries that follow the initial send.
const RETRY_BACKOFFS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(25),
];

impl CallbackNotifier {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn notify(&self, url: &str, body: serde_json::Value) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.client.post(url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    tracing::warn!(url, status = %resp.status(), attempt, "callback returned non-2xx");
                }
                Err(err) => {
                    tracing::warn!(url, error = %err, attempt, "callback request failed");
                }
            }
            let Some(delay) = RETRY_BACKOFFS.get((attempt - 1) as usize) else {
                break;
            };
            tokio::time::sleep(*delay).await;
        }
        tracing::error!(url, "callback notifier exhausted retries");
    }
}
