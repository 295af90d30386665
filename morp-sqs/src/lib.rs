//! C6: the cloud engine, wrapping AWS SQS. The original
//! `morp/interface/sqs.py` on disk is actually a vestigial NSQ client
//! (stale filename left over from a prior backend), so this engine is
//! grounded directly on spec §4.6, using the corpus's idiomatic AWS client
//! (`aws-sdk-sqs` + `aws-config`'s auto-refreshing credential provider
//! chain, which is exactly the "currently-valid credential on demand"
//! interface spec §9 asks for — no custom refresh logic is written).

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::Client;
use base64::Engine;
use morp_core::error::{ConfigError, InterfaceError};
use morp_core::interface::{compute_release_delay, Interface};
use morp_core::value::{Fields, FieldsExt};
use morp_core::{codec, config::ConnectionConfig, registry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Call once at process startup to make `sqs://`/`aws://` DSNs resolvable
/// from `morp_core::registry::configure`.
pub fn register() {
    registry::register_backend("sqs", build_interface);
}

fn build_interface(config: &ConnectionConfig) -> Result<Arc<dyn Interface>, ConfigError> {
    Ok(Arc::new(SqsInterface::new(config)))
}

pub struct SqsInterface {
    region: Option<String>,
    profile_name: Option<String>,
    uppercase_options: HashMap<String, String>,
    serializer: codec::Serializer,
    key: Option<codec::SealKey>,
    max_timeout: u64,
    backoff_multiplier: u64,
    backoff_amplifier: Option<u64>,
    client: RwLock<Option<Client>>,
    queue_urls: Mutex<HashMap<String, String>>,
}

impl SqsInterface {
    pub fn new(config: &ConnectionConfig) -> Self {
        SqsInterface {
            region: config.options.get("region").cloned(),
            profile_name: config.options.get("profile_name").cloned(),
            uppercase_options: config
                .uppercase_options()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            serializer: config.serializer,
            key: config.key,
            max_timeout: config.max_timeout,
            backoff_multiplier: config.backoff_multiplier,
            backoff_amplifier: config.backoff_amplifier,
            client: RwLock::new(None),
            queue_urls: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self) -> Result<Client, InterfaceError> {
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(client.clone());
        }
        Err(InterfaceError::NotConnected)
    }

    fn encode(&self, fields: &Fields) -> Result<String, InterfaceError> {
        let mut body = fields.clone();
        body.remove(morp_core::value::ID);
        body.remove(morp_core::value::COUNT);
        let bytes = codec::encode(&body, self.serializer, self.key.as_ref())?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    fn decode(&self, body: &str) -> Result<Fields, InterfaceError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|e| InterfaceError::from(morp_core::error::CodecError::Base64(e)))?;
        codec::decode(&bytes, self.serializer, self.key.as_ref()).map_err(InterfaceError::from)
    }

    async fn queue_url(&self, client: &Client, name: &str) -> Result<String, InterfaceError> {
        if let Some(url) = self.queue_urls.lock().await.get(name) {
            return Ok(url.clone());
        }

        let existing = client.get_queue_url().queue_name(name).send().await;
        let url = match existing {
            Ok(resp) => resp
                .queue_url()
                .ok_or_else(|| InterfaceError::Backend("queue exists with no url".into()))?
                .to_string(),
            Err(_) => self.create_queue(client, name).await?,
        };

        self.queue_urls
            .lock()
            .await
            .insert(name.to_string(), url.clone());
        Ok(url)
    }

    async fn create_queue(&self, client: &Client, name: &str) -> Result<String, InterfaceError> {
        let default_visibility = self.max_timeout.min(43200);

        let mut request = client
            .create_queue()
            .queue_name(name)
            .attributes(
                aws_sdk_sqs::types::QueueAttributeName::VisibilityTimeout,
                default_visibility.to_string(),
            );

        for (key, value) in &self.uppercase_options {
            request = request.attributes(
                aws_sdk_sqs::types::QueueAttributeName::from(key.as_str()),
                value.clone(),
            );
        }

        let resp = request.send().await.map_err(InterfaceError::backend)?;
        resp.queue_url()
            .ok_or_else(|| InterfaceError::Backend("create_queue returned no url".into()))
            .map(|s| s.to_string())
    }
}

#[async_trait]
impl Interface for SqsInterface {
    async fn connect(&self) -> Result<(), InterfaceError> {
        if self.client.read().await.is_some() {
            return Ok(());
        }

        let mut guard = self.client.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(profile) = &self.profile_name {
            loader = loader.profile_name(profile);
        }

        let sdk_config = loader.load().await;
        *guard = Some(Client::new(&sdk_config));
        Ok(())
    }

    async fn close(&self) -> Result<(), InterfaceError> {
        self.client.write().await.take();
        self.queue_urls.lock().await.clear();
        Ok(())
    }

    async fn send(
        &self,
        name: &str,
        fields: Fields,
        delay_seconds: u64,
    ) -> Result<Fields, InterfaceError> {
        let client = self.client().await?;
        let url = self.queue_url(&client, name).await?;
        let body = self.encode(&fields)?;

        let clamped_delay = delay_seconds.min(900);
        if clamped_delay != delay_seconds {
            tracing::warn!(
                requested = delay_seconds,
                clamped = clamped_delay,
                "delay_seconds clamped to SQS's 900-second maximum"
            );
        }

        let resp = client
            .send_message()
            .queue_url(&url)
            .message_body(body)
            .delay_seconds(clamped_delay as i32)
            .send()
            .await
            .map_err(InterfaceError::backend)?;

        let mut sent = fields;
        if let Some(id) = resp.message_id() {
            sent.set_id(id.to_string());
        }
        sent.set_count(1);
        Ok(sent)
    }

    async fn recv(&self, name: &str, timeout: Duration) -> Result<Option<Fields>, InterfaceError> {
        let client = self.client().await?;
        let url = self.queue_url(&client, name).await?;

        let wait_seconds = timeout.as_secs().min(20) as i32;

        let resp = client
            .receive_message()
            .queue_url(&url)
            .max_number_of_messages(1)
            .wait_time_seconds(wait_seconds)
            .message_system_attribute_names(
                aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount,
            )
            .send()
            .await
            .map_err(InterfaceError::backend)?;

        let Some(message) = resp.messages().first() else {
            return Ok(None);
        };

        let body = message
            .body()
            .ok_or_else(|| InterfaceError::Backend("message has no body".into()))?;
        let receipt_handle = message
            .receipt_handle()
            .ok_or_else(|| InterfaceError::Backend("message has no receipt handle".into()))?;

        // The body was stripped of `_id`/`_count` before it was sent (see
        // `encode`), so the delivery count has to come from SQS's own
        // receive-count attribute, not from anything in the decoded body.
        let count = message
            .attributes()
            .and_then(|attrs| {
                attrs.get(&aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount)
            })
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(1);

        let mut fields = self.decode(body)?;
        fields.set_id(receipt_handle.to_string());
        fields.set_count(count.max(1));
        Ok(Some(fields))
    }

    async fn ack(&self, name: &str, fields: &Fields) -> Result<(), InterfaceError> {
        let client = self.client().await?;
        let url = self.queue_url(&client, name).await?;
        let receipt_handle = fields.id().ok_or(InterfaceError::NotConnected)?;

        client
            .delete_message()
            .queue_url(&url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(InterfaceError::backend)?;
        Ok(())
    }

    async fn release(
        &self,
        name: &str,
        fields: &Fields,
        delay_seconds: Option<u64>,
    ) -> Result<(), InterfaceError> {
        let client = self.client().await?;
        let url = self.queue_url(&client, name).await?;
        let receipt_handle = fields.id().ok_or(InterfaceError::NotConnected)?;

        let delay = delay_seconds.unwrap_or_else(|| {
            compute_release_delay(
                fields.count(),
                self.max_timeout,
                self.backoff_multiplier,
                self.backoff_amplifier,
            )
        });

        client
            .change_message_visibility()
            .queue_url(&url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(delay.min(43200) as i32)
            .send()
            .await
            .map_err(InterfaceError::backend)?;
        Ok(())
    }

    async fn count(&self, name: &str) -> Result<u64, InterfaceError> {
        let client = self.client().await?;
        let url = self.queue_url(&client, name).await?;

        let resp = client
            .get_queue_attributes()
            .queue_url(&url)
            .attribute_names(aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(InterfaceError::backend)?;

        let count = resp
            .attributes()
            .and_then(|attrs| {
                attrs.get(&aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages)
            })
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(count)
    }

    async fn unsafe_clear(&self, name: &str) -> Result<(), InterfaceError> {
        let client = self.client().await?;
        let url = self.queue_url(&client, name).await?;

        client
            .purge_queue()
            .queue_url(&url)
            .send()
            .await
            .map_err(InterfaceError::backend)?;
        Ok(())
    }

    async fn unsafe_delete(&self, name: &str) -> Result<(), InterfaceError> {
        let client = self.client().await?;
        let url = match self.queue_urls.lock().await.remove(name) {
            Some(url) => url,
            None => match client.get_queue_url().queue_name(name).send().await {
                Ok(resp) => resp.queue_url().unwrap_or_default().to_string(),
                Err(_) => return Ok(()),
            },
        };

        if url.is_empty() {
            return Ok(());
        }

        client
            .delete_queue()
            .queue_url(&url)
            .send()
            .await
            .map_err(InterfaceError::backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            name: String::new(),
            backend: morp_core::config::Backend::Sqs,
            username: None,
            password: None,
            hosts: vec![("sqs.us-east-1.amazonaws.com".to_string(), None)],
            path: String::new(),
            options: {
                let mut m = Map::new();
                m.insert("region".to_string(), "us-east-1".to_string());
                m.insert("KmsMasterKeyId".to_string(), "alias/my-key".to_string());
                m
            },
            serializer: codec::Serializer::Json,
            key: None,
            max_timeout: 3600,
            backoff_multiplier: 5,
            backoff_amplifier: None,
            min_size: 1,
            max_size: 10,
        }
    }

    #[test]
    fn uppercase_options_are_captured_for_queue_creation() {
        let iface = SqsInterface::new(&test_config());
        assert_eq!(
            iface.uppercase_options.get("KmsMasterKeyId").map(String::as_str),
            Some("alias/my-key")
        );
    }

    #[tokio::test]
    async fn operations_before_connect_fail_with_not_connected() {
        let iface = SqsInterface::new(&test_config());
        let err = iface.count("orders").await.unwrap_err();
        assert!(matches!(err, InterfaceError::NotConnected));
    }
}
