use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{FragmentStream, GenerationClient, GenerationPrompt, ProviderError, TextFragment};

type FragmentReceiver = mpsc::UnboundedReceiver<Result<TextFragment, ProviderError>>;

/// In-process provider whose streams are fed by hand.
///
/// Each call to [`GenerationClient::generate`] takes the oldest queued feed.
/// Calling it with nothing queued yields one `Unavailable` error.
#[derive(Default)]
pub struct ChannelClient {
    feeds: Mutex<VecDeque<FragmentReceiver>>,
    prompts: Mutex<Vec<GenerationPrompt>>,
}

/// Sending half of one queued generation. Dropping it completes the stream.
pub struct FragmentFeed {
    tx: mpsc::UnboundedSender<Result<TextFragment, ProviderError>>,
}

impl FragmentFeed {
    /// Returns false once the consuming session is gone.
    pub fn fragment(&self, text: impl Into<TextFragment>) -> bool {
        self.tx.send(Ok(text.into())).is_ok()
    }

    pub fn fail(self, error: ProviderError) {
        let _ = self.tx.send(Err(error));
    }

    pub fn finish(self) {}
}

impl ChannelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a stream for the next generation and returns its feed.
    pub fn feed(&self) -> FragmentFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(rx);
        FragmentFeed { tx }
    }

    /// Queues a stream that yields `fragments` and then completes.
    pub fn scripted(&self, fragments: &[&str]) {
        let feed = self.feed();
        for fragment in fragments {
            feed.fragment(*fragment);
        }
        feed.finish();
    }

    /// Queues a stream that yields `fragments` and then fails with `message`.
    pub fn scripted_failure(&self, fragments: &[&str], message: &str) {
        let feed = self.feed();
        for fragment in fragments {
            feed.fragment(*fragment);
        }
        feed.fail(ProviderError::Provider(message.to_string()));
    }

    /// Prompts seen so far, oldest first.
    pub fn prompts(&self) -> Vec<GenerationPrompt> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl GenerationClient for ChannelClient {
    fn generate(&self, prompt: &GenerationPrompt) -> FragmentStream {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(prompt.clone());

        let next = self
            .feeds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();

        match next {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::once(async {
                Err(ProviderError::Unavailable("no stream queued".to_string()))
            })
            .boxed(),
        }
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> GenerationPrompt {
        GenerationPrompt {
            system_text: "Be helpful".into(),
            user_text: "Begin a new story.".into(),
            max_output_tokens: 50,
        }
    }

    #[tokio::test]
    async fn test_scripted_stream() {
        let client = ChannelClient::new();
        client.scripted(&["Once", " upon"]);

        let items: Vec<_> = client.generate(&prompt()).collect().await;
        let texts: Vec<_> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["Once", " upon"]);
        assert_eq!(client.prompts(), vec![prompt()]);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let client = ChannelClient::new();
        client.scripted_failure(&["Once"], "connection reset");

        let items: Vec<_> = client.generate(&prompt()).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(&items[1], Err(ProviderError::Provider(m)) if m == "connection reset"));
    }

    #[tokio::test]
    async fn test_nothing_queued() {
        let client = ChannelClient::new();
        let items: Vec<_> = client.generate(&prompt()).collect().await;
        assert!(matches!(items.as_slice(), [Err(ProviderError::Unavailable(_))]));
    }

    #[tokio::test]
    async fn test_feeds_are_taken_in_order() {
        let client = ChannelClient::new();
        client.scripted(&["first"]);
        client.scripted(&["second"]);

        let first: Vec<_> = client.generate(&prompt()).collect().await;
        let second: Vec<_> = client.generate(&prompt()).collect().await;
        assert_eq!(first[0].as_ref().unwrap(), "first");
        assert_eq!(second[0].as_ref().unwrap(), "second");
    }
}
