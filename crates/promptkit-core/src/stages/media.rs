use std::sync::Arc;

use async_trait::async_trait;
use promptkit_contracts::{event_types, ContentPart, MediaContent, MediaSource, Message, StreamElement};
use tokio::sync::mpsc;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::event_bus::Event;
use crate::stage::Stage;
use crate::traits::MediaStorage;

/// Inline media at or above this size is moved to external storage rather
/// than carried in the message history; below it, inlining avoids a
/// round-trip for content small enough that it's cheaper to just keep.
pub const DEFAULT_EXTERNALIZE_THRESHOLD_BYTES: usize = 256 * 1024;

/// Rewrites `MediaSource::Inline` content over the threshold into
/// `MediaSource::Storage` references, so large blobs never get persisted
/// verbatim into conversation state. Runs on both inbound and outbound
/// messages: inbound media a user attaches, and media a provider returns.
pub struct MediaExternalizerStage {
    storage: Arc<dyn MediaStorage>,
    threshold_bytes: usize,
}

impl MediaExternalizerStage {
    pub fn new(storage: Arc<dyn MediaStorage>) -> Self {
        Self {
            storage,
            threshold_bytes: DEFAULT_EXTERNALIZE_THRESHOLD_BYTES,
        }
    }

    pub fn with_threshold(storage: Arc<dyn MediaStorage>, threshold_bytes: usize) -> Self {
        Self { storage, threshold_bytes }
    }

    async fn rewrite_content(&self, ctx: &ExecutionContext, content: MediaContent) -> Result<MediaContent> {
        let over_threshold = content.inline_len().map(|len| len >= self.threshold_bytes).unwrap_or(false);
        if !over_threshold {
            return Ok(content);
        }
        let MediaSource::Inline { data } = &content.source else {
            return Ok(content);
        };
        let size = data.len();
        let reference = self.storage.store(data, &content.mime_type, serde_json::json!({})).await?;
        ctx.events
            .publish(Event::new(
                event_types::MEDIA_EXTERNALIZED,
                ctx.run_id,
                ctx.conversation_id,
                serde_json::json!({ "size_bytes": size, "hash": reference.id }),
            ))
            .await;
        Ok(MediaContent {
            source: MediaSource::Storage(reference),
            ..content
        })
    }

    async fn externalize_part(&self, ctx: &ExecutionContext, part: ContentPart) -> Result<ContentPart> {
        Ok(match part {
            ContentPart::Image(content) => ContentPart::Image(self.rewrite_content(ctx, content).await?),
            ContentPart::Audio(content) => ContentPart::Audio(self.rewrite_content(ctx, content).await?),
            ContentPart::Video(content) => ContentPart::Video(self.rewrite_content(ctx, content).await?),
            text @ ContentPart::Text(_) => text,
        })
    }

    async fn externalize_message(&self, ctx: &ExecutionContext, mut message: Message) -> Result<Message> {
        if let Some(parts) = message.parts.take() {
            let mut rewritten = Vec::with_capacity(parts.len());
            for part in parts {
                rewritten.push(self.externalize_part(ctx, part).await?);
            }
            message.parts = Some(rewritten);
        }
        Ok(message)
    }
}

#[async_trait]
impl Stage for MediaExternalizerStage {
    fn name(&self) -> &str {
        "media_externalizer"
    }

    async fn process(
        &self,
        mut input: mpsc::Receiver<StreamElement>,
        output: mpsc::Sender<StreamElement>,
        ctx: Arc<ExecutionContext>,
    ) -> Result<()> {
        while let Some(element) = input.recv().await {
            if ctx.cancellation.is_cancelled() {
                break;
            }
            let element = match element {
                StreamElement::Message(message) => {
                    StreamElement::Message(self.externalize_message(&ctx, message).await?)
                }
                other => other,
            };
            if output.send(element).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::NoOpEventBus;
    use crate::memory::InMemoryMediaStorage;
    use uuid::Uuid;

    fn image_message(bytes: Vec<u8>) -> Message {
        Message {
            role: promptkit_contracts::Role::User,
            content: None,
            parts: Some(vec![ContentPart::Image(MediaContent {
                source: MediaSource::Inline { data: bytes },
                mime_type: "image/png".into(),
                format: None,
                width: None,
                height: None,
                duration_ms: None,
            })]),
            tool_calls: Vec::new(),
            tool_result: None,
        }
    }

    #[tokio::test]
    async fn externalizes_inline_media_over_threshold() {
        let storage = Arc::new(InMemoryMediaStorage::default());
        let stage = MediaExternalizerStage::with_threshold(storage.clone(), 4);
        let ctx = Arc::new(ExecutionContext::new(Uuid::now_v7(), None, false, Arc::new(NoOpEventBus)));

        let (tx, rx) = mpsc::channel(1);
        tx.send(StreamElement::Message(image_message(vec![1, 2, 3, 4, 5])))
            .await
            .unwrap();
        drop(tx);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        stage.process(rx, out_tx, ctx).await.unwrap();

        match out_rx.recv().await.unwrap() {
            StreamElement::Message(message) => match &message.parts.unwrap()[0] {
                ContentPart::Image(content) => {
                    assert!(matches!(content.source, MediaSource::Storage(_)));
                }
                other => panic!("unexpected part: {other:?}"),
            },
            other => panic!("unexpected element: {other:?}"),
        }
    }

    #[tokio::test]
    async fn leaves_small_inline_media_untouched() {
        let storage = Arc::new(InMemoryMediaStorage::default());
        let stage = MediaExternalizerStage::with_threshold(storage, 1024);
        let ctx = Arc::new(ExecutionContext::new(Uuid::now_v7(), None, false, Arc::new(NoOpEventBus)));

        let (tx, rx) = mpsc::channel(1);
        tx.send(StreamElement::Message(image_message(vec![1, 2, 3])))
            .await
            .unwrap();
        drop(tx);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        stage.process(rx, out_tx, ctx).await.unwrap();

        match out_rx.recv().await.unwrap() {
            StreamElement::Message(message) => match &message.parts.unwrap()[0] {
                ContentPart::Image(content) => {
                    assert!(matches!(content.source, MediaSource::Inline { .. }));
                }
                other => panic!("unexpected part: {other:?}"),
            },
            other => panic!("unexpected element: {other:?}"),
        }
    }
}
