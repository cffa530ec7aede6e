//! Broker abstraction and in-memory implementation.

use crate::message::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use quiver_common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message delivered to a subscriber, tagged with its channel.
pub type Delivery = (String, Message);

/// Message broker: named channels with per-channel publish ordering.
#[async_trait]
pub trait MsgBroker: Send + Sync {
    /// Publish onto one channel. Publishes on the same channel are observed
    /// by every subscriber in publish order.
    async fn publish(&self, channel: &str, msg: Message) -> Result<()>;

    /// Publish the same message onto every listed channel.
    async fn broadcast(&self, channels: &[String], msg: &Message) -> Result<()> {
        for channel in channels {
            self.publish(channel, msg.clone()).await?;
        }
        Ok(())
    }

    /// Subscribe to a set of channels. With `from_earliest`, retained
    /// history is replayed before live messages.
    fn subscribe(&self, channels: &[String], from_earliest: bool)
        -> mpsc::UnboundedReceiver<Delivery>;
}

#[derive(Default)]
struct Topic {
    history: Vec<Message>,
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
}

/// In-memory broker retaining full history per topic.
#[derive(Default)]
pub struct MemoryMsgBroker {
    topics: Mutex<HashMap<String, Topic>>,
}

impl MemoryMsgBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of messages ever published on `channel`. Test hook.
    pub fn published_count(&self, channel: &str) -> usize {
        self.topics.lock().get(channel).map(|t| t.history.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MsgBroker for MemoryMsgBroker {
    async fn publish(&self, channel: &str, msg: Message) -> Result<()> {
        let mut topics = self.topics.lock();
        let topic = topics.entry(channel.to_string()).or_default();
        topic.history.push(msg.clone());
        topic
            .subscribers
            .retain(|tx| tx.send((channel.to_string(), msg.clone())).is_ok());
        Ok(())
    }

    fn subscribe(
        &self,
        channels: &[String],
        from_earliest: bool,
    ) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock();
        for channel in channels {
            let topic = topics.entry(channel.clone()).or_default();
            if from_earliest {
                for msg in &topic.history {
                    let _ = tx.send((channel.clone(), msg.clone()));
                }
            }
            topic.subscribers.push(tx.clone());
        }
        rx
    }
}
