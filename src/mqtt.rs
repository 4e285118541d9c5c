use crate::config::Config;
use crate::ingest::{IngestOutcome, SampleMerger};
use crate::pipeline::doubling_backoff;
use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed connections tolerated before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn delay(&self, failures: u32) -> Duration {
        doubling_backoff(self.initial_delay, self.max_delay, failures)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts
            .map(|max| failures > max)
            .unwrap_or(false)
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    mqttoptions.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        mqttoptions.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    mqttoptions
}

/// What the connection loop should do after one event has been handled.
#[derive(Debug, PartialEq)]
enum EventAction {
    Continue,
    Connected,
    Reconnect,
}

/// Subscribes on every ConnAck and hands each Publish to the merger. An error
/// means the write queue is gone and the listener must stop.
async fn handle_event(
    event: Event,
    client: &AsyncClient,
    topic_filter: &str,
    merger: &SampleMerger,
) -> Result<EventAction> {
    let stats = merger.stats();
    match event {
        Event::Incoming(Incoming::ConnAck(ack)) => {
            stats.set_mqtt_connected(true);
            tracing::debug!(code=?ack.code, session_present=ack.session_present, "connack");
            // Subscribing on every ConnAck renews the subscription after a reconnect.
            match client.try_subscribe(topic_filter, QoS::AtMostOnce) {
                Ok(()) => {
                    tracing::info!(topic=%topic_filter, "subscribed to sensor topics");
                    Ok(EventAction::Connected)
                }
                Err(err) => {
                    tracing::warn!(error=%err, "failed to subscribe to sensor topics");
                    stats.set_mqtt_connected(false);
                    Ok(EventAction::Reconnect)
                }
            }
        }
        Event::Incoming(Incoming::Publish(publish)) => {
            match merger.ingest(&publish.topic, publish.payload).await {
                Ok(IngestOutcome::Emitted(record)) => {
                    tracing::info!(
                        temperature = record.temperature,
                        heater = record.heater,
                        light = record.light,
                        "queued combined sample"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    return Err(err.context("write queue closed"));
                }
            }
            Ok(EventAction::Continue)
        }
        _ => Ok(EventAction::Continue),
    }
}

pub async fn run_listener(config: Config, merger: SampleMerger) -> Result<()> {
    let topic_filter = config.topic_filter();
    let policy = config.reconnect_policy();
    let stats = merger.stats();
    let mut failures: u32 = 0;

    loop {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 32);

        loop {
            let event = match eventloop.poll().await {
                Ok(event) => event,
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped");
                    break;
                }
            };
            match handle_event(event, &client, &topic_filter, &merger).await? {
                EventAction::Continue => {}
                EventAction::Connected => {
                    failures = 0;
                    tracing::info!(
                        host=%config.mqtt_host,
                        port=config.mqtt_port,
                        "connected to MQTT broker"
                    );
                }
                EventAction::Reconnect => break,
            }
        }

        failures = failures.saturating_add(1);
        if policy.exhausted(failures) {
            return Err(anyhow!(
                "giving up on MQTT broker {}:{} after {} failed attempts",
                config.mqtt_host,
                config.mqtt_port,
                failures
            ));
        }
        let delay = policy.delay(failures);
        tracing::info!(
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "reconnecting to MQTT broker"
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{BridgeStats, PipelineHandle, WriteCommand};
    use rumqttc::{ConnAck, ConnectReturnCode, EventLoop, Publish, Request};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const TOPIC_FILTER: &str = "aquarispark/#";

    fn merger() -> (SampleMerger, mpsc::Receiver<WriteCommand>) {
        let stats = Arc::new(BridgeStats::new());
        let (tx, rx) = mpsc::channel(8);
        let pipeline = PipelineHandle::new(tx, stats);
        let merger = SampleMerger::new("aquarispark", "Aquarispark", pipeline);
        (merger, rx)
    }

    fn client() -> (AsyncClient, EventLoop) {
        AsyncClient::new(MqttOptions::new("aquarium-bridge-test", "127.0.0.1", 1883), 8)
    }

    fn connack() -> Event {
        Event::Incoming(Incoming::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)))
    }

    fn publish(topic: &str, payload: &str) -> Event {
        Event::Incoming(Incoming::Publish(Publish::new(topic, QoS::AtMostOnce, payload)))
    }

    /// Subscribe requests the client queued, as `(filter, qos)` pairs.
    fn queued_subscriptions(eventloop: &mut EventLoop) -> Vec<(String, QoS)> {
        eventloop.clean();
        eventloop
            .pending
            .drain(..)
            .filter_map(|request| match request {
                Request::Subscribe(subscribe) => Some(subscribe.filters),
                _ => None,
            })
            .flatten()
            .map(|filter| (filter.path, filter.qos))
            .collect()
    }

    #[tokio::test]
    async fn every_connack_subscribes_to_namespace() {
        let (merger, _rx) = merger();
        let (client, mut eventloop) = client();

        for _ in 0..2 {
            let action = handle_event(connack(), &client, TOPIC_FILTER, &merger)
                .await
                .expect("connack");
            assert_eq!(action, EventAction::Connected);
        }

        assert!(merger.stats().mqtt_connected.load(Ordering::Relaxed));
        assert_eq!(
            queued_subscriptions(&mut eventloop),
            vec![
                (TOPIC_FILTER.to_string(), QoS::AtMostOnce),
                (TOPIC_FILTER.to_string(), QoS::AtMostOnce),
            ]
        );
    }

    #[tokio::test]
    async fn failed_subscribe_asks_for_reconnect() {
        let (merger, _rx) = merger();
        let (client, eventloop) = client();
        drop(eventloop);

        let action = handle_event(connack(), &client, TOPIC_FILTER, &merger)
            .await
            .expect("connack");
        assert_eq!(action, EventAction::Reconnect);
        assert!(!merger.stats().mqtt_connected.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn publishes_reach_the_merger() {
        let (merger, mut rx) = merger();
        let (client, _eventloop) = client();

        for (topic, payload) in [
            ("aquarispark/temp", "25.3"),
            ("aquarispark/pump", "1"),
            ("aquarispark/heater", "1"),
            ("aquarispark/light", "0"),
        ] {
            let action = handle_event(publish(topic, payload), &client, TOPIC_FILTER, &merger)
                .await
                .expect("publish");
            assert_eq!(action, EventAction::Continue);
        }

        match rx.try_recv() {
            Ok(WriteCommand::Record(record)) => {
                assert_eq!(record.temperature, 25.3);
                assert_eq!(record.heater, 1);
                assert_eq!(record.light, 0);
            }
            other => panic!("expected a queued record, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_write_queue_stops_the_listener() {
        let (merger, rx) = merger();
        drop(rx);
        let (client, _eventloop) = client();

        for topic in ["aquarispark/temp", "aquarispark/heater"] {
            handle_event(publish(topic, "1"), &client, TOPIC_FILTER, &merger)
                .await
                .expect("publish");
        }
        let light = publish("aquarispark/light", "0");
        let result = handle_event(light, &client, TOPIC_FILTER, &merger).await;
        assert!(result.is_err());
    }

    fn policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts,
        }
    }

    #[test]
    fn reconnect_delay_grows_until_capped() {
        let policy = policy(None);
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn unlimited_policy_never_gives_up() {
        assert!(!policy(None).exhausted(u32::MAX));
    }

    #[test]
    fn limited_policy_gives_up_after_max_attempts() {
        let policy = policy(Some(3));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }
}
