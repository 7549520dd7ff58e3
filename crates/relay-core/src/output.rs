//! Helpers for the boundary between the agent loop and the delivery layer.

use std::pin::Pin;

use futures::{Stream, StreamExt};

use crate::error::Error;
use crate::provider::ByteStream;
use crate::stream::{ResponseMap, Utf8Decoder};

/// Visible reply text, chunk by chunk.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, Error>> + Send>>;

struct CompletionState {
    inner: ByteStream,
    decoder: Utf8Decoder,
    text: String,
    on_complete: Option<Box<dyn FnOnce(String) + Send>>,
}

/// Pass `stream` through unchanged and call `on_complete` once, with the full
/// decoded text, when it ends naturally. Dropping the stream early skips it.
pub fn with_completion<F>(stream: ByteStream, on_complete: F) -> ByteStream
where
    F: FnOnce(String) + Send + 'static,
{
    let state = CompletionState {
        inner: stream,
        decoder: Utf8Decoder::new(),
        text: String::new(),
        on_complete: Some(Box::new(on_complete)),
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        match state.inner.next().await {
            Some(Ok(bytes)) => {
                let text = state.decoder.decode(&bytes);
                state.text.push_str(&text);
                Some((Ok(bytes), state))
            }
            Some(Err(e)) => Some((Err(e), state)),
            None => {
                let tail = state.decoder.finish();
                state.text.push_str(&tail);
                if let Some(callback) = state.on_complete.take() {
                    callback(std::mem::take(&mut state.text));
                }
                None
            }
        }
    });

    Box::pin(stream.fuse())
}

/// Map raw output chunks to visible text with a backend's response map.
pub fn map_reply(stream: ByteStream, mut response_map: Box<dyn ResponseMap>) -> TextStream {
    Box::pin(stream.map(move |chunk| chunk.map(|bytes| response_map.map(&bytes))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{byte_stream, collect_stream};
    use std::sync::{Arc, Mutex};

    struct Upper;

    impl ResponseMap for Upper {
        fn map(&mut self, chunk: &[u8]) -> String {
            String::from_utf8_lossy(chunk).to_uppercase()
        }
    }

    #[tokio::test]
    async fn test_on_complete_called_once_with_full_text() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let stream = with_completion(byte_stream(["hel", "lo"]), move |text| {
            sink.lock().unwrap().push(text);
        });

        assert_eq!(collect_stream(stream).await, "hello");
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_on_complete_skipped_when_dropped_early() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let mut stream = with_completion(byte_stream(["a", "b"]), move |_| {
            *flag.lock().unwrap() = true;
        });

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, b"a".to_vec());
        drop(stream);
        assert!(!*called.lock().unwrap());
    }

    #[tokio::test]
    async fn test_map_reply() {
        let mut mapped = map_reply(byte_stream(["ab", "c"]), Box::new(Upper));
        let mut out = String::new();
        while let Some(chunk) = mapped.next().await {
            out.push_str(&chunk.unwrap());
        }
        assert_eq!(out, "ABC");
    }
}
