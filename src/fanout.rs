// =============================================================================
// Fan-out Hub — topic-based publish/subscribe for connected clients
// =============================================================================
//
// Each topic is a lazily created `tokio::sync::broadcast` channel. Publishing
// never blocks: a send either reaches every attached receiver or is dropped
// on the floor when nobody is subscribed. A receiver that falls behind sees
// `Lagged` and is disconnected by the WebSocket layer rather than allowed to
// slow the publisher; ordering per topic is therefore strict for every
// subscriber that keeps up.
//
// Topic names:
//   candles:{symbol}:{timeframe}   per-symbol-per-timeframe candle pushes
//   symbol_tick                    per-symbol base emissions
//   market_tick                    one message per base interval
//   user:{email}                   portfolio updates for one participant
//   leaderboard                    top-20 ranking
//   contest_started / contest_paused / contest_resumed / contest_ended
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

/// Depth of each topic's broadcast ring. A subscriber further behind than
/// this is lagging and gets dropped.
const TOPIC_CHANNEL_CAPACITY: usize = 512;

/// An envelope as delivered to subscribers: the topic plus its payload,
/// already serialized so every subscriber shares one allocation.
pub type TopicMessage = String;

pub struct FanoutHub {
    topics: RwLock<HashMap<String, broadcast::Sender<TopicMessage>>>,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Publish `payload` on `topic`. Subscribers receive
    /// `{"topic": ..., "data": payload}`. Returns how many subscribers the
    /// message reached.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
        let sender = {
            let topics = self.topics.read();
            topics.get(topic).cloned()
        };

        let sender = match sender {
            Some(s) => s,
            // Nobody has ever subscribed; nothing to deliver.
            None => return 0,
        };

        let envelope = serde_json::json!({ "topic": topic, "data": payload }).to_string();
        match sender.send(envelope) {
            Ok(n) => {
                trace!(topic, receivers = n, "published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Attach a receiver to `topic`, creating the channel on first use.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<TopicMessage> {
        let mut topics = self.topics.write();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map_or(0, |s| s.receiver_count())
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber_with_envelope() {
        let hub = FanoutHub::new();
        let mut rx = hub.subscribe("leaderboard");

        let reached = hub.publish("leaderboard", serde_json::json!({"top": []}));
        assert_eq!(reached, 1);

        let msg = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["topic"], "leaderboard");
        assert!(v["data"]["top"].is_array());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let hub = FanoutHub::new();
        assert_eq!(hub.publish("market_tick", serde_json::json!({})), 0);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let hub = FanoutHub::new();
        let mut candles = hub.subscribe("candles:RELIANCE:5s");
        let _ticks = hub.subscribe("symbol_tick");

        hub.publish("symbol_tick", serde_json::json!({"symbol": "TCS"}));
        hub.publish("candles:RELIANCE:5s", serde_json::json!({"is_new": true}));

        let msg = candles.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["topic"], "candles:RELIANCE:5s");
    }

    #[tokio::test]
    async fn per_topic_ordering_is_preserved() {
        let hub = FanoutHub::new();
        let mut rx = hub.subscribe("market_tick");

        for i in 0..10 {
            hub.publish("market_tick", serde_json::json!({"seq": i}));
        }
        for i in 0..10 {
            let msg = rx.recv().await.unwrap();
            let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
            assert_eq!(v["data"]["seq"], i);
        }
    }
}
