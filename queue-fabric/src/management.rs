use crate::{BrokerManagement, QueueInfo};

/// Client for a RabbitMQ-compatible management HTTP API.
#[derive(Clone, Debug)]
pub struct HttpManagementClient {
    client: reqwest::Client,
    base_url: String,
    vhost: String,
    user: String,
    pass: String,
}

impl HttpManagementClient {
    pub fn new(base_url: String, vhost: String, user: String, pass: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            vhost,
            user,
            pass,
        }
    }

    fn queue_url(&self, queue: &str) -> String {
        format!(
            "{}/api/queues/{}/{}",
            self.base_url,
            encode_segment(&self.vhost),
            encode_segment(queue)
        )
    }
}

fn encode_segment(segment: &str) -> String {
    segment
        .replace('%', "%25")
        .replace('/', "%2F")
        .replace(':', "%3A")
}

#[async_trait::async_trait]
impl BrokerManagement for HttpManagementClient {
    async fn queue_info(&self, queue: &str) -> anyhow::Result<QueueInfo> {
        let response = self
            .client
            .get(self.queue_url(queue))
            .basic_auth(&self.user, Some(&self.pass))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(QueueInfo {
                name: queue.to_string(),
                ..Default::default()
            });
        }
        let mut info: QueueInfo = response.error_for_status()?.json().await?;
        if info.name.is_empty() {
            info.name = queue.to_string();
        }
        Ok(info)
    }

    async fn purge(&self, queue: &str) -> anyhow::Result<()> {
        self.client
            .delete(format!("{}/contents", self.queue_url(queue)))
            .basic_auth(&self.user, Some(&self.pass))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete(&self, queue: &str) -> anyhow::Result<()> {
        self.client
            .delete(self.queue_url(queue))
            .basic_auth(&self.user, Some(&self.pass))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
